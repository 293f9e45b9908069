//! Process-wide capability query.
//!
//! The capability set is detected on first use and cached for the lifetime
//! of the process; CPU features cannot change while it runs.

pub mod hw_info;

pub use hw_info::{CapabilitySet, IsaLevel};

use std::sync::OnceLock;

static CAPABILITIES: OnceLock<CapabilitySet> = OnceLock::new();

/// Get the host capability set (detected once, cached for process lifetime).
pub fn capabilities() -> &'static CapabilitySet {
    CAPABILITIES.get_or_init(|| {
        let caps = CapabilitySet::detect();
        log::debug!("detected CPU capabilities: {caps}");
        caps
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_capabilities_are_stable_across_threads() {
        let first = *capabilities();
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| *capabilities()))
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), first);
        }
        assert!(std::ptr::eq(capabilities(), capabilities()));
    }
}
