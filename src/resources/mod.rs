//! Accelerator detection and per-worker memory budgeting.
//!
//! The arbiter probes once at startup and hands every handler the same
//! [`Accelerator`] capability. Without a device (or when the probe fails)
//! the capability reports CPU-only operation and every reservation fails
//! with [`ResourceError::Exhausted`], so handlers take their CPU path.
//!
//! The budget is advisory: `budget_per_worker = free / (workers * safety_factor)`.
//! Nothing stops foreign code from allocating more, and memory held by a
//! wedged handler is only returned when that handler finally returns.

pub mod probe;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::ResourceError;

pub use probe::{DeviceMemory, DeviceProbe, NvidiaSmiProbe, StaticProbe};

#[derive(Debug)]
struct AcceleratorInner {
    memory: Option<DeviceMemory>,
    budget_per_worker: u64,
    reserved: AtomicU64,
}

/// Accelerator capability handed to handlers.
#[derive(Debug, Clone)]
pub struct Accelerator {
    inner: Arc<AcceleratorInner>,
}

impl Accelerator {
    /// A CPU-only capability.
    pub fn cpu_only() -> Self {
        Self::from_parts(None, 0)
    }

    fn from_parts(memory: Option<DeviceMemory>, budget_per_worker: u64) -> Self {
        Self {
            inner: Arc::new(AcceleratorInner {
                memory,
                budget_per_worker,
                reserved: AtomicU64::new(0),
            }),
        }
    }

    /// Whether an accelerator was detected.
    pub fn available(&self) -> bool {
        self.inner.memory.is_some() && self.inner.budget_per_worker > 0
    }

    /// Advisory bytes each worker may hold at once. Zero when CPU-only.
    pub fn budget_per_worker(&self) -> u64 {
        self.inner.budget_per_worker
    }

    /// Device memory seen by the probe.
    pub fn device_memory(&self) -> Option<DeviceMemory> {
        self.inner.memory
    }

    /// Bytes currently held by live reservations.
    pub fn reserved_bytes(&self) -> u64 {
        self.inner.reserved.load(Ordering::SeqCst)
    }

    /// Reserves `bytes` of device memory for the caller.
    ///
    /// Fails when CPU-only, when `bytes` exceeds the per-worker budget, or
    /// when all reservations together would exceed the free memory seen at
    /// probe time.
    pub fn try_reserve(&self, bytes: u64) -> Result<Reservation, ResourceError> {
        let Some(memory) = self.inner.memory.filter(|_| self.available()) else {
            return Err(ResourceError::Exhausted {
                requested: bytes,
                available: 0,
            });
        };

        if bytes > self.inner.budget_per_worker {
            return Err(ResourceError::Exhausted {
                requested: bytes,
                available: self.inner.budget_per_worker,
            });
        }

        let reserved = &self.inner.reserved;
        let mut current = reserved.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_add(bytes);
            if next > memory.free {
                return Err(ResourceError::Exhausted {
                    requested: bytes,
                    available: memory.free.saturating_sub(current),
                });
            }
            match reserved.compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        Ok(Reservation {
            owner: self.clone(),
            bytes,
        })
    }
}

/// Reserved device memory, released on drop.
#[derive(Debug)]
pub struct Reservation {
    owner: Accelerator,
    bytes: u64,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.owner
            .inner
            .reserved
            .fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

/// Computes the accelerator budget at startup.
pub struct ResourceArbiter;

impl ResourceArbiter {
    /// Probes the device and builds the capability for `num_workers` workers.
    ///
    /// Probe errors are logged and degrade to CPU-only.
    pub async fn detect(
        probe: &dyn DeviceProbe,
        num_workers: usize,
        safety_factor: f64,
    ) -> Accelerator {
        let memory = match probe.probe().await {
            Ok(memory) => memory,
            Err(e) => {
                warn!(probe = probe.name(), error = %e, "Accelerator probe failed, using CPU only");
                None
            }
        };

        let Some(memory) = memory else {
            info!(probe = probe.name(), "No accelerator detected, using CPU only");
            return Accelerator::cpu_only();
        };

        let budget = Self::budget_per_worker(memory.free, num_workers, safety_factor);
        info!(
            probe = probe.name(),
            devices = memory.devices,
            free_bytes = memory.free,
            total_bytes = memory.total,
            budget_per_worker = budget,
            "Accelerator detected"
        );
        Accelerator::from_parts(Some(memory), budget)
    }

    /// `free / (num_workers * safety_factor)`, rounded down.
    pub fn budget_per_worker(free: u64, num_workers: usize, safety_factor: f64) -> u64 {
        let divisor = num_workers.max(1) as f64 * safety_factor.max(1.0);
        (free as f64 / divisor).floor() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_formula() {
        assert_eq!(ResourceArbiter::budget_per_worker(8000, 4, 2.0), 1000);
        assert_eq!(ResourceArbiter::budget_per_worker(8000, 0, 0.5), 8000);
    }

    #[tokio::test]
    async fn test_detect_without_device_is_cpu_only() {
        let acc = ResourceArbiter::detect(&StaticProbe::none(), 4, 2.0).await;
        assert!(!acc.available());
        assert_eq!(acc.budget_per_worker(), 0);
        assert!(matches!(
            acc.try_reserve(1),
            Err(ResourceError::Exhausted { available: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_reservation_within_budget_and_release() {
        let acc = ResourceArbiter::detect(&StaticProbe::with_memory(4000, 8000), 2, 2.0).await;
        assert!(acc.available());
        assert_eq!(acc.budget_per_worker(), 1000);

        let r1 = acc.try_reserve(1000).unwrap();
        assert_eq!(acc.reserved_bytes(), 1000);
        assert!(acc.try_reserve(1001).is_err());

        drop(r1);
        assert_eq!(acc.reserved_bytes(), 0);
    }

    #[tokio::test]
    async fn test_reservations_capped_by_free_memory() {
        // Budget 1000 each, but only 2500 free in total.
        let acc = ResourceArbiter::detect(&StaticProbe::with_memory(2500, 8000), 1, 2.5).await;
        let _a = acc.try_reserve(1000).unwrap();
        let _b = acc.try_reserve(1000).unwrap();
        let err = acc.try_reserve(1000).unwrap_err();
        assert!(matches!(err, ResourceError::Exhausted { available: 500, .. }));
        assert_eq!(acc.reserved_bytes(), 2000);
    }
}
