//! Cache Key Construction
//!
//! Deterministic keys assembled from logical segments: namespace, entity,
//! identifier, tenant/user scope, named parameters, version. Parameter maps
//! are sorted before rendering so caller insertion order never changes the
//! key; parameter blocks that are oversized or carry unsafe characters are
//! replaced by a fixed-length content hash of the raw block.
//!
//! The builder is total: unsupported characters are substituted, never
//! rejected.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Segment separator in rendered keys
pub const KEY_SEPARATOR: char = ':';

/// Serialized parameter blocks longer than this are hashed instead of inlined
const PARAM_INLINE_MAX: usize = 64;

/// Bytes of the SHA-256 digest kept for a hashed parameter block (hex doubles it)
const PARAM_HASH_BYTES: usize = 8;

/// Marker that distinguishes a hashed parameter block from an inline one.
/// Sanitized values can never contain it, so the two forms cannot collide.
const PARAM_HASH_MARKER: char = '#';

/// Builder for cache keys.
///
/// Segments are appended in caller order; two invocations with the same
/// logical segments in the same order always render the same key. Named
/// parameters are collected into a sorted map and rendered as a single
/// canonical block, and the version tag always renders last.
///
/// ```
/// use stratacache::KeyBuilder;
///
/// let key = KeyBuilder::new("app")
///     .entity("user")
///     .id(42)
///     .tenant("acme")
///     .param("limit", 10)
///     .param("sort", "asc")
///     .build();
/// assert_eq!(key, "app:user:42:tenant=acme:p=limit=10&sort=asc");
/// ```
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    segments: Vec<String>,
    params: BTreeMap<String, String>,
    version: Option<String>,
}

impl KeyBuilder {
    /// Start a key under the given namespace.
    pub fn new(namespace: impl AsRef<str>) -> Self {
        Self {
            segments: vec![sanitize(namespace.as_ref())],
            params: BTreeMap::new(),
            version: None,
        }
    }

    /// Append a free-form segment.
    pub fn segment(mut self, part: impl AsRef<str>) -> Self {
        self.segments.push(sanitize(part.as_ref()));
        self
    }

    /// Append the entity-type segment (e.g. `"user"`, `"report"`).
    pub fn entity(self, entity: impl AsRef<str>) -> Self {
        self.segment(entity)
    }

    /// Append the identifier segment.
    pub fn id(self, id: impl ToString) -> Self {
        self.segment(id.to_string())
    }

    /// Append a tenant scope segment.
    pub fn tenant(mut self, tenant: impl AsRef<str>) -> Self {
        self.segments
            .push(format!("tenant={}", sanitize(tenant.as_ref())));
        self
    }

    /// Append a user scope segment.
    pub fn user(mut self, user: impl AsRef<str>) -> Self {
        self.segments
            .push(format!("user={}", sanitize(user.as_ref())));
        self
    }

    /// Add one named parameter. Parameters render as a single sorted block,
    /// so the order of `param` calls does not affect the key.
    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    /// Add many named parameters at once.
    pub fn params<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        for (name, value) in entries {
            self.params.insert(name.into(), value.to_string());
        }
        self
    }

    /// Set the version tag; renders as the final segment.
    pub fn version(mut self, version: impl ToString) -> Self {
        self.version = Some(version.to_string());
        self
    }

    /// Render the key.
    pub fn build(self) -> String {
        let mut segments = self.segments;

        if !self.params.is_empty() {
            segments.push(render_params(&self.params));
        }
        if let Some(version) = self.version {
            segments.push(format!("v={}", sanitize(&version)));
        }

        let mut key = String::with_capacity(segments.iter().map(|s| s.len() + 1).sum());
        for (i, segment) in segments.iter().enumerate() {
            if i > 0 {
                key.push(KEY_SEPARATOR);
            }
            key.push_str(segment);
        }
        key
    }
}

/// Render the sorted parameter map as one segment.
///
/// The raw `k=v&k=v` block is inlined when it is short and already safe;
/// otherwise the segment carries a hash of the raw block, which preserves
/// distinctness for values that sanitization would have collapsed.
fn render_params(params: &BTreeMap<String, String>) -> String {
    let raw = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    if raw.len() > PARAM_INLINE_MAX || !is_inline_safe(&raw) {
        format!("p={}{}", PARAM_HASH_MARKER, content_hash(&raw))
    } else {
        format!("p={}", raw)
    }
}

/// Fixed-length content hash of a parameter block (hex-encoded SHA-256 prefix).
fn content_hash(block: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(block.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..PARAM_HASH_BYTES])
}

/// Characters permitted inside a rendered segment.
#[inline]
fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// An inline parameter block may additionally contain its own structure.
fn is_inline_safe(block: &str) -> bool {
    block.chars().all(|c| is_safe_char(c) || matches!(c, '=' | '&'))
}

/// Replace every character outside the safe subset.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if is_safe_char(c) { c } else { '_' })
        .collect()
}

// =============================================================================
// Pattern matching
// =============================================================================

/// Match a key against a glob pattern: `*` matches any run of characters,
/// `?` matches exactly one.
///
/// This is the pattern language of pattern invalidation. It mirrors what the
/// shared store matches server-side during cursor scans, so local sweeps and
/// shared scans agree on which keys a pattern covers.
pub fn pattern_matches(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();

    let (mut pi, mut ki) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ki < k.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == k[ki]) {
            pi += 1;
            ki += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ki;
            pi += 1;
        } else if let Some(s) = star {
            // Backtrack: let the last star absorb one more character
            pi = s + 1;
            mark += 1;
            ki = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

// =============================================================================
// Tests
// =============================================================================
