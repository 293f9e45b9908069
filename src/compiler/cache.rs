//! Routine cache: one generated routine per distinct plan.
//!
//! Keyed by [`ExecutionPlan::fingerprint`](crate::compiler::planner::ExecutionPlan::fingerprint).
//! Each entry is a `OnceLock` guarded by a build mutex: the first caller
//! generates, concurrent callers for the same key wait for that result,
//! later callers read it without locking the entry. A failed generation
//! leaves the entry empty so the error is reported to every caller that
//! tries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::compiler::executable::GeneratedRoutine;
use crate::types::JitResult;

#[derive(Default)]
struct Slot {
    routine: OnceLock<Arc<GeneratedRoutine>>,
    building: Mutex<()>,
}

/// Where a lookup was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Cached,
    Generated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub generated: u64,
}

#[derive(Default)]
pub struct KernelCache {
    slots: Mutex<HashMap<u64, Arc<Slot>>>,
    hits: AtomicU64,
    generated: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panic while holding the lock cannot leave a half-built entry
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: u64) -> Arc<Slot> {
        lock(&self.slots).entry(key).or_default().clone()
    }

    /// Cached routine for `key`, if one has been generated.
    pub fn get(&self, key: u64) -> Option<Arc<GeneratedRoutine>> {
        let slots = lock(&self.slots);
        slots.get(&key).and_then(|s| s.routine.get().cloned())
    }

    /// Return the routine for `key`, generating it with `build` on a miss.
    pub fn get_or_generate<F>(&self, key: u64, build: F) -> JitResult<(Arc<GeneratedRoutine>, CacheSource)>
    where
        F: FnOnce() -> JitResult<GeneratedRoutine>,
    {
        let slot = self.slot(key);
        if let Some(r) = slot.routine.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok((r.clone(), CacheSource::Cached));
        }
        let _building = lock(&slot.building);
        if let Some(r) = slot.routine.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok((r.clone(), CacheSource::Cached));
        }
        let routine = Arc::new(build()?);
        self.generated.fetch_add(1, Ordering::Relaxed);
        let stored = slot.routine.get_or_init(|| routine);
        Ok((stored.clone(), CacheSource::Generated))
    }

    pub fn len(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|s| s.routine.get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached routine. Routines still held elsewhere stay alive.
    pub fn clear(&self) {
        lock(&self.slots).clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            generated: self.generated.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::codegen::EmittedCode;
    use crate::types::JitError;
    use std::sync::atomic::AtomicUsize;

    fn ret_routine(key: u64) -> JitResult<GeneratedRoutine> {
        GeneratedRoutine::new(EmittedCode { code: vec![0xC3], entries: vec![0] }, key)
    }

    #[test]
    fn second_lookup_hits() {
        let cache = KernelCache::new();
        let (a, src_a) = cache.get_or_generate(7, || ret_routine(7)).unwrap();
        let (b, src_b) = cache.get_or_generate(7, || panic!("must not regenerate")).unwrap();
        assert_eq!(src_a, CacheSource::Generated);
        assert_eq!(src_b, CacheSource::Cached);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.stats(), CacheStats { entries: 1, hits: 1, generated: 1 });
    }

    #[test]
    fn failure_is_not_cached() {
        let cache = KernelCache::new();
        let err = cache.get_or_generate(1, || Err(JitError::Unsupported("nope".into())));
        assert!(err.is_err());
        assert!(cache.is_empty());
        assert!(cache.get_or_generate(1, || ret_routine(1)).is_ok());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_callers_generate_once() {
        let cache = Arc::new(KernelCache::new());
        let builds = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let builds = builds.clone();
                std::thread::spawn(move || {
                    cache
                        .get_or_generate(42, || {
                            builds.fetch_add(1, Ordering::SeqCst);
                            ret_routine(42)
                        })
                        .map(|(r, _)| r.fingerprint)
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap().unwrap(), 42);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_empties() {
        let cache = KernelCache::new();
        cache.get_or_generate(3, || ret_routine(3)).unwrap();
        assert!(cache.get(3).is_some());
        cache.clear();
        assert!(cache.get(3).is_none());
    }
}
