use std::env;
use std::sync::OnceLock;

use log::warn;

use crate::cache::EvictionPolicy;

static MDARRAY_LAYOUT_RECOMPUTE: OnceLock<bool> = OnceLock::new();
static MDARRAY_PRIMITIVE_CACHE: OnceLock<EvictionPolicy> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// `MDARRAY_LAYOUT_RECOMPUTE`: rebuild the exported layout on every export.
pub(crate) fn layout_recompute_enabled() -> bool {
    *MDARRAY_LAYOUT_RECOMPUTE.get_or_init(|| match env::var("MDARRAY_LAYOUT_RECOMPUTE") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

/// `MDARRAY_PRIMITIVE_CACHE`: eviction policy string such as `unbounded` or `lru(capacity=64)`.
pub(crate) fn primitive_cache_policy() -> EvictionPolicy {
    *MDARRAY_PRIMITIVE_CACHE.get_or_init(|| match env::var("MDARRAY_PRIMITIVE_CACHE") {
        Ok(value) if !value.trim().is_empty() => match value.parse() {
            Ok(policy) => policy,
            Err(err) => {
                warn!("ignoring MDARRAY_PRIMITIVE_CACHE={value:?}: {err}");
                EvictionPolicy::default()
            }
        },
        _ => EvictionPolicy::default(),
    })
}
