//! Name conversions between schema (camelCase) and database (snake_case).
//!
//! Both directions are memoized for the process lifetime: the same handful of
//! field names is converted on every request.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use std::sync::LazyLock;

const CACHE_SIZE: usize = 4096;

static SNAKE_CACHE: LazyLock<Mutex<LruCache<String, String>>> = LazyLock::new(|| {
    Mutex::new(LruCache::new(
        NonZeroUsize::new(CACHE_SIZE).expect("cache size is non-zero"),
    ))
});

static CAMEL_CACHE: LazyLock<Mutex<LruCache<String, String>>> = LazyLock::new(|| {
    Mutex::new(LruCache::new(
        NonZeroUsize::new(CACHE_SIZE).expect("cache size is non-zero"),
    ))
});

/// Convert a camelCase (or kebab-case) schema name to snake_case.
#[must_use]
pub fn to_snake_case(name: &str) -> String {
    if let Some(hit) = SNAKE_CACHE.lock().get(name) {
        return hit.clone();
    }

    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower = false;
        } else if ch == '-' || ch == ' ' {
            out.push('_');
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        }
    }

    SNAKE_CACHE.lock().put(name.to_string(), out.clone());
    out
}

/// Convert a snake_case database name to camelCase.
#[must_use]
pub fn to_camel_case(name: &str) -> String {
    if let Some(hit) = CAMEL_CACHE.lock().get(name) {
        return hit.clone();
    }

    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.chars() {
        if ch == '_' || ch == '-' {
            upper_next = !out.is_empty();
        } else if upper_next {
            out.push(ch.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }

    CAMEL_CACHE.lock().put(name.to_string(), out.clone());
    out
}
