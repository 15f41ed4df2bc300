//! Named cache-event counters.
//!
//! Compiled to no-ops unless the `profiler` feature is enabled, so hot paths can record events
//! unconditionally.

#[cfg(feature = "profiler")]
use std::collections::BTreeMap;
#[cfg(feature = "profiler")]
use std::sync::Mutex;

#[cfg(feature = "profiler")]
use once_cell::sync::Lazy;

#[cfg(feature = "profiler")]
static CACHE_EVENTS: Lazy<Mutex<BTreeMap<&'static str, u64>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

/// Records one occurrence of the named cache event.
pub fn cache_event(name: &'static str) {
    #[cfg(feature = "profiler")]
    {
        let mut events = CACHE_EVENTS
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *events.entry(name).or_insert(0) += 1;
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = name;
    }
}

/// Snapshot of every recorded event count.
#[cfg(feature = "profiler")]
pub fn cache_event_counts() -> Option<BTreeMap<&'static str, u64>> {
    let events = CACHE_EVENTS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    Some(events.clone())
}

#[cfg(not(feature = "profiler"))]
pub fn cache_event_counts() -> Option<std::collections::BTreeMap<&'static str, u64>> {
    None
}

/// Clears all recorded counts.
pub fn reset() {
    #[cfg(feature = "profiler")]
    {
        CACHE_EVENTS
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}
