//! Lightweight counters for compile, cache and backend activity.
//!
//! With the `profiler` feature disabled every entry point compiles to a no-op and
//! [`snapshot`] returns an empty report.

#[cfg(feature = "profiler")]
use std::collections::BTreeMap;
#[cfg(feature = "profiler")]
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
#[cfg(feature = "profiler")]
use std::time::Instant;

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum ProfilerKey {
    Compile(&'static str),
    Cache(&'static str),
    Backend(&'static str),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub calls: u64,
    pub total: Duration,
}

/// Point-in-time copy of all counters, grouped by category.
#[derive(Debug, Default, Clone)]
pub struct ProfileSnapshot {
    pub compile: Vec<(&'static str, Stat)>,
    pub cache: Vec<(&'static str, Stat)>,
    pub backend: Vec<(&'static str, Stat)>,
}

impl ProfileSnapshot {
    pub fn cache_count(&self, name: &str) -> u64 {
        self.cache
            .iter()
            .find(|(key, _)| *key == name)
            .map_or(0, |(_, stat)| stat.calls)
    }

    pub fn compile_count(&self, name: &str) -> u64 {
        self.compile
            .iter()
            .find(|(key, _)| *key == name)
            .map_or(0, |(_, stat)| stat.calls)
    }
}

#[cfg(feature = "profiler")]
fn stats() -> &'static Mutex<BTreeMap<ProfilerKey, Stat>> {
    static STATS: OnceLock<Mutex<BTreeMap<ProfilerKey, Stat>>> = OnceLock::new();
    STATS.get_or_init(|| Mutex::new(BTreeMap::new()))
}

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
fn record(key: ProfilerKey, elapsed: Duration) {
    #[cfg(feature = "profiler")]
    {
        let mut stats = stats().lock().unwrap_or_else(|poison| poison.into_inner());
        let entry = stats.entry(key).or_default();
        entry.calls = entry.calls.saturating_add(1);
        entry.total = entry.total.saturating_add(elapsed);
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = key;
        let _ = elapsed;
    }
}

pub struct ScopeGuard {
    #[cfg(feature = "profiler")]
    key: ProfilerKey,
    #[cfg(feature = "profiler")]
    start: Instant,
}

#[cfg(feature = "profiler")]
impl Drop for ScopeGuard {
    fn drop(&mut self) {
        record(self.key, self.start.elapsed());
    }
}

#[inline(always)]
pub fn compile_scope(name: &'static str) -> ScopeGuard {
    #[cfg(feature = "profiler")]
    {
        ScopeGuard {
            key: ProfilerKey::Compile(name),
            start: Instant::now(),
        }
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = name;
        ScopeGuard {}
    }
}

#[inline(always)]
pub fn cache_event(name: &'static str) {
    record(ProfilerKey::Cache(name), Duration::ZERO);
}

#[inline(always)]
pub fn record_backend(name: &'static str, elapsed: Duration) {
    record(ProfilerKey::Backend(name), elapsed);
}

pub fn snapshot() -> ProfileSnapshot {
    #[cfg(feature = "profiler")]
    {
        let stats = stats().lock().unwrap_or_else(|poison| poison.into_inner());
        let mut out = ProfileSnapshot::default();
        for (key, stat) in stats.iter() {
            match *key {
                ProfilerKey::Compile(name) => out.compile.push((name, *stat)),
                ProfilerKey::Cache(name) => out.cache.push((name, *stat)),
                ProfilerKey::Backend(name) => out.backend.push((name, *stat)),
            }
        }
        out
    }
    #[cfg(not(feature = "profiler"))]
    {
        ProfileSnapshot::default()
    }
}

pub fn reset() {
    #[cfg(feature = "profiler")]
    {
        stats()
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clear();
    }
}

#[cfg(all(test, feature = "profiler"))]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_name() {
        cache_event("profiling_test_hit");
        cache_event("profiling_test_hit");
        {
            let _scope = compile_scope("profiling_test_compile");
        }
        let snap = snapshot();
        assert!(snap.cache_count("profiling_test_hit") >= 2);
        assert!(snap.compile_count("profiling_test_compile") >= 1);
    }
}
