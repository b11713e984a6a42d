use std::sync::atomic::{AtomicU64, Ordering};

use systemstat::{Platform, System};

/// Source of the process memory figure that drives tiering.
pub trait MemoryProbe: Sync + Send {
    /// Used memory in bytes, `None` when it cannot be read.
    fn used(&self) -> Option<u64>;
}

/// Reads used system memory through `systemstat`.
pub struct SystemMemory {
    sys: System,
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self { sys: System::new() }
    }
}

impl MemoryProbe for SystemMemory {
    #[inline]
    fn used(&self) -> Option<u64> {
        match self.sys.memory() {
            Ok(mem) => Some(mem.total.as_u64().saturating_sub(mem.free.as_u64())),
            Err(e) => {
                log::warn!("read memory usage error, {e:?}");
                None
            }
        }
    }
}

/// A manually set figure.
#[derive(Default)]
pub struct FixedMemory(AtomicU64);

impl FixedMemory {
    #[inline]
    pub fn new(used: u64) -> Self {
        Self(AtomicU64::new(used))
    }

    #[inline]
    pub fn set(&self, used: u64) {
        self.0.store(used, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemory {
    #[inline]
    fn used(&self) -> Option<u64> {
        Some(self.0.load(Ordering::SeqCst))
    }
}

/// Fraction of resident entries that should sit in the soft tier.
#[inline]
pub(crate) fn soft_ratio(used: u64, low_water: u64, high_water: u64) -> f64 {
    if high_water <= low_water {
        return if used >= high_water { 1.0 } else { 0.0 };
    }
    let ratio = (used as f64 - low_water as f64) / (high_water as f64 - low_water as f64);
    ratio.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_is_clamped() {
        assert_eq!(soft_ratio(100, 200, 400), 0.0);
        assert_eq!(soft_ratio(300, 200, 400), 0.5);
        assert_eq!(soft_ratio(900, 200, 400), 1.0);
    }

    #[test]
    fn fixed_probe() {
        let probe = FixedMemory::new(5);
        probe.set(10);
        assert_eq!(probe.used(), Some(10));
    }
}
