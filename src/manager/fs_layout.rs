//! Directory layout and final file moves.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Result of moving a finished file out of the watch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Where the file landed. Differs from the source name when that name
    /// was already taken.
    Moved(PathBuf),
    /// The source was already gone (moved by an earlier attempt or removed).
    SourceMissing,
}

/// The directories a manager works in.
#[derive(Debug, Clone)]
pub struct FsLayout {
    pub watch_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub error_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl FsLayout {
    pub fn new(
        watch_dir: impl Into<PathBuf>,
        processed_dir: impl Into<PathBuf>,
        error_dir: impl Into<PathBuf>,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            watch_dir: watch_dir.into(),
            processed_dir: processed_dir.into(),
            error_dir: error_dir.into(),
            state_dir: state_dir.into(),
        }
    }

    /// Creates every directory, including the checkpoint mirror directory.
    pub fn create_dirs(&self) -> io::Result<()> {
        for dir in [
            &self.watch_dir,
            &self.processed_dir,
            &self.error_dir,
            &self.state_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::create_dir_all(self.checkpoint_dir())
    }

    /// Where JSON checkpoint mirrors are written.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.state_dir.join("checkpoints")
    }

    pub fn move_to_processed(&self, source: &Path) -> io::Result<MoveOutcome> {
        move_into(source, &self.processed_dir)
    }

    pub fn move_to_error(&self, source: &Path) -> io::Result<MoveOutcome> {
        move_into(source, &self.error_dir)
    }
}

/// Suffixes tried before giving up on a crowded destination.
const MAX_NAME_SUFFIX: u32 = 10_000;

/// Renames `source` into `dir`. An existing destination is never
/// overwritten: a taken name gets a numeric suffix (`a.csv` becomes
/// `a.1.csv`, then `a.2.csv`), so the watch directory is always emptied.
fn move_into(source: &Path, dir: &Path) -> io::Result<MoveOutcome> {
    let file_name = source.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no file name in {}", source.display()),
        )
    })?;

    if !source.exists() {
        debug!(path = %source.display(), "Source already moved");
        return Ok(MoveOutcome::SourceMissing);
    }

    let destination = free_destination(dir, Path::new(file_name))?;
    if destination.file_name() != Some(file_name) {
        warn!(
            path = %source.display(),
            destination = %destination.display(),
            "Destination name taken, moving under a suffixed name"
        );
    }

    match std::fs::rename(source, &destination) {
        Ok(()) => Ok(MoveOutcome::Moved(destination)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(MoveOutcome::SourceMissing),
        Err(e) => Err(e),
    }
}

fn free_destination(dir: &Path, file_name: &Path) -> io::Result<PathBuf> {
    let destination = dir.join(file_name);
    if !destination.exists() {
        return Ok(destination);
    }

    let stem = file_name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = file_name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    (1..=MAX_NAME_SUFFIX)
        .map(|n| dir.join(format!("{}.{}{}", stem, n, extension)))
        .find(|candidate| !candidate.exists())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("no free name for {} in {}", file_name.display(), dir.display()),
            )
        })
}
