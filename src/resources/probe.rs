//! Accelerator device probes.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::ResourceError;

const MIB: u64 = 1024 * 1024;

/// Free and total device memory, in bytes, summed across devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMemory {
    pub free: u64,
    pub total: u64,
    pub devices: usize,
}

/// Detects an accelerator and reads its memory.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    /// `Ok(None)` means no accelerator is present.
    async fn probe(&self) -> Result<Option<DeviceMemory>, ResourceError>;

    fn name(&self) -> &str;
}

/// Probe backed by `nvidia-smi`.
pub struct NvidiaSmiProbe {
    command: String,
}

impl NvidiaSmiProbe {
    pub fn new() -> Self {
        Self {
            command: "nvidia-smi".to_string(),
        }
    }

    /// Uses a custom executable path.
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceProbe for NvidiaSmiProbe {
    async fn probe(&self) -> Result<Option<DeviceMemory>, ResourceError> {
        let output = Command::new(&self.command)
            .arg("--query-gpu=memory.free,memory.total")
            .arg("--format=csv,noheader,nounits")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(command = %self.command, "No accelerator tooling found");
                return Ok(None);
            }
            Err(e) => return Err(ResourceError::ProbeFailed(e.to_string())),
        };

        if !output.status.success() {
            return Err(ResourceError::ProbeFailed(format!(
                "{} exited with {}",
                self.command, output.status
            )));
        }

        parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
    }

    fn name(&self) -> &str {
        "nvidia-smi"
    }
}

/// Parses `free, total` lines (MiB) and sums them.
pub fn parse_nvidia_smi(text: &str) -> Result<Option<DeviceMemory>, ResourceError> {
    let mut memory = DeviceMemory {
        free: 0,
        total: 0,
        devices: 0,
    };

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut fields = line.split(',').map(str::trim);
        let (Some(free), Some(total)) = (fields.next(), fields.next()) else {
            return Err(ResourceError::ProbeFailed(format!("unexpected line '{}'", line)));
        };
        let parse = |v: &str| {
            v.parse::<u64>()
                .map_err(|e| ResourceError::ProbeFailed(format!("bad value '{}': {}", v, e)))
        };
        memory.free += parse(free)? * MIB;
        memory.total += parse(total)? * MIB;
        memory.devices += 1;
    }

    if memory.devices == 0 {
        return Ok(None);
    }
    Ok(Some(memory))
}

/// Probe returning a fixed answer. Used when the accelerator is disabled and in tests.
pub struct StaticProbe {
    memory: Option<DeviceMemory>,
}

impl StaticProbe {
    /// No accelerator.
    pub fn none() -> Self {
        Self { memory: None }
    }

    /// One device with the given free/total bytes.
    pub fn with_memory(free: u64, total: u64) -> Self {
        Self {
            memory: Some(DeviceMemory {
                free,
                total,
                devices: 1,
            }),
        }
    }
}

#[async_trait]
impl DeviceProbe for StaticProbe {
    async fn probe(&self) -> Result<Option<DeviceMemory>, ResourceError> {
        Ok(self.memory)
    }

    fn name(&self) -> &str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_two_devices() {
        let memory = parse_nvidia_smi("1000, 2000\n 500 , 2000\n").unwrap().unwrap();
        assert_eq!(memory.devices, 2);
        assert_eq!(memory.free, 1500 * MIB);
        assert_eq!(memory.total, 4000 * MIB);
    }

    #[test]
    fn test_parse_empty_means_no_device() {
        assert!(parse_nvidia_smi("").unwrap().is_none());
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(parse_nvidia_smi("N/A, 2000").is_err());
        assert!(parse_nvidia_smi("1000").is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_is_no_device() {
        let probe = NvidiaSmiProbe::with_command("definitely-not-a-real-nvidia-smi");
        assert!(probe.probe().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_static_probe() {
        assert!(StaticProbe::none().probe().await.unwrap().is_none());
        let memory = StaticProbe::with_memory(10, 20).probe().await.unwrap().unwrap();
        assert_eq!(memory.free, 10);
    }
}
