//! Cache key derivation.
//!
//! A key identifies a request by its path and its query parameters only.
//! Headers and body never take part, so two POSTs to the same URL with
//! different payloads share one entry.

use sha2::{Digest, Sha256};

/// Namespace prefix of every derived key.
pub const KEY_PREFIX: &str = "cache:";

/// Derives the cache key for `path` and its decoded query parameters.
///
/// Parameters are sorted by name, then value, before hashing, so the order
/// in which a client submitted them never changes the key. Repeated pairs
/// are kept: `?a=1&a=1` and `?a=1` are different requests.
///
/// Every component is written with a length prefix, so distinct inputs
/// cannot serialize to the same bytes.
///
/// # Examples
///
/// ```
/// use cacheproxy::cache::derive_key;
///
/// let a = derive_key("/search", &[("x".into(), "1".into()), ("y".into(), "2".into())]);
/// let b = derive_key("/search", &[("y".into(), "2".into()), ("x".into(), "1".into())]);
/// assert_eq!(a, b);
/// assert!(a.starts_with("cache:"));
/// ```
pub fn derive_key(path: &str, query: &[(String, String)]) -> String {
    let mut pairs: Vec<(&str, &str)> = query
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    pairs.sort_unstable();

    let mut hasher = Sha256::new();
    write_component(&mut hasher, path);
    hasher.update((pairs.len() as u64).to_be_bytes());
    for (name, value) in pairs {
        write_component(&mut hasher, name);
        write_component(&mut hasher, value);
    }

    format!("{KEY_PREFIX}{}", hex::encode(hasher.finalize()))
}

fn write_component(hasher: &mut Sha256, component: &str) {
    hasher.update((component.len() as u64).to_be_bytes());
    hasher.update(component.as_bytes());
}
