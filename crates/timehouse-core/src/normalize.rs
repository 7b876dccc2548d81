//! Identifier Normalization
//!
//! User-supplied table and column names are folded to a restricted alphabet
//! before they become on-disk names. The mapping is idempotent and must stay
//! bit-identical across implementations: it is baked into segment files.
//!
//! Rules, applied in order:
//!
//! 1. `-` becomes `_`
//! 2. an initial `_` becomes `xt$`
//! 3. `.`, `/` and `$` become `$`
//! 4. lowercase
//!
//! So `xt/id` becomes `xt$id`, `First-Name` becomes `first_name`, and
//! `_hidden` becomes `xt$hidden`. Results are cached: the same handful of
//! names is normalized on every ingest and every query open.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::RwLock;

static CACHE: Lazy<RwLock<HashMap<String, String>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Fold an identifier to its normalized on-disk form.
pub fn normalize_name(name: &str) -> String {
    if let Some(hit) = CACHE.read().expect("normalization cache poisoned").get(name) {
        return hit.clone();
    }
    let normalized = normalize_uncached(name);
    CACHE
        .write()
        .expect("normalization cache poisoned")
        .insert(name.to_string(), normalized.clone());
    normalized
}

fn normalize_uncached(name: &str) -> String {
    let dashed = name.replace('-', "_");
    let prefixed = match dashed.strip_prefix('_') {
        Some(rest) => format!("xt${}", rest),
        None => dashed,
    };
    prefixed
        .chars()
        .map(|c| match c {
            '.' | '/' | '$' => '$',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_folding() {
        assert_eq!(normalize_name("xt/id"), "xt$id");
        assert_eq!(normalize_name("First-Name"), "first_name");
        assert_eq!(normalize_name("_hidden"), "xt$hidden");
        assert_eq!(normalize_name("a.b"), "a$b");
        assert_eq!(normalize_name("Orders"), "orders");
    }

    #[test]
    fn test_idempotent() {
        for name in ["xt/id", "First-Name", "_hidden", "a.b/c$d", "-x", "__y", "plain"] {
            let once = normalize_name(name);
            let twice = normalize_name(&once);
            assert_eq!(once, twice, "normalize must be idempotent for {:?}", name);
        }
    }

    #[test]
    fn test_dash_before_underscore_rule() {
        // '-' -> '_' runs first, so "-x" gains the xt$ prefix
        assert_eq!(normalize_name("-x"), "xt$x");
    }

    #[test]
    fn test_cache_returns_same_result() {
        let a = normalize_name("Cached-Name");
        let b = normalize_name("Cached-Name");
        assert_eq!(a, b);
    }
}
