// =============================================================================
// Shared TTL key-value store
// =============================================================================
//
// In-process store behind the cache layer: plain values with per-key expiry,
// sorted sets keyed by integer score (epoch seconds), multi-key batched reads
// and writes, and wildcard deletes. Payloads over 1 KB are gzip-compressed
// behind a sentinel prefix; readers detect the prefix transparently.
//
// Per-key semantics are last-writer-wins; every operation takes the lock once
// so multi-key batches are atomic with respect to concurrent readers.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;

/// Payloads above this size are stored gzip-compressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Sentinel prefix marking a compressed payload. Starts with a control byte
/// so it can never collide with JSON or numeric text.
const GZIP_SENTINEL: &[u8] = b"\x01GZ:";

enum Value {
    Bytes(Vec<u8>),
    /// Sorted set of (score, member), ordered by score then member.
    SortedSet(BTreeSet<(i64, String)>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Thread-safe TTL store shared by the candle and indicator caches and the
/// anti-spam ring.
pub struct Store {
    entries: RwLock<HashMap<String, Entry>>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Payload codec
    // -------------------------------------------------------------------------

    /// Compress payloads above [`COMPRESSION_THRESHOLD`] and mark them with
    /// the sentinel prefix; smaller payloads pass through raw.
    pub fn encode_payload(payload: &[u8]) -> Vec<u8> {
        if payload.len() <= COMPRESSION_THRESHOLD {
            return payload.to_vec();
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        let body = match encoder.write_all(payload).and_then(|_| encoder.finish()) {
            Ok(body) => body,
            // Fall back to raw storage rather than lose the payload.
            Err(_) => return payload.to_vec(),
        };
        let mut out = Vec::with_capacity(GZIP_SENTINEL.len() + body.len());
        out.extend_from_slice(GZIP_SENTINEL);
        out.extend_from_slice(&body);
        out
    }

    /// Inverse of [`Store::encode_payload`]. A payload without the sentinel is
    /// returned as-is; a corrupted compressed payload decodes to `None`.
    pub fn decode_payload(stored: &[u8]) -> Option<Vec<u8>> {
        match stored.strip_prefix(GZIP_SENTINEL) {
            None => Some(stored.to_vec()),
            Some(body) => {
                let mut decoder = GzDecoder::new(body);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out).ok()?;
                Some(out)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Plain values
    // -------------------------------------------------------------------------

    pub fn set(&self, key: &str, payload: &[u8], ttl: Duration) {
        let entry = Entry {
            value: Value::Bytes(Self::encode_payload(payload)),
            expires_at: Some(Instant::now() + ttl),
        };
        self.entries.write().insert(key.to_string(), entry);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        match &entry.value {
            Value::Bytes(stored) => Self::decode_payload(stored),
            Value::SortedSet(_) => None,
        }
    }

    /// Convenience for string payloads.
    pub fn set_string(&self, key: &str, value: &str, ttl: Duration) {
        self.set(key, value.as_bytes(), ttl);
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|bytes| String::from_utf8(bytes).ok())
    }

    /// Batched multi-get: one lock acquisition for all keys.
    pub fn get_many(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        let now = Instant::now();
        let entries = self.entries.read();
        keys.iter()
            .map(|key| {
                let entry = entries.get(key)?;
                if entry.is_expired(now) {
                    return None;
                }
                match &entry.value {
                    Value::Bytes(stored) => Self::decode_payload(stored),
                    Value::SortedSet(_) => None,
                }
            })
            .collect()
    }

    /// Batched multi-set with per-key TTL: one lock acquisition, all keys
    /// visible together (or, if the caller bails beforehand, not at all).
    pub fn set_many(&self, items: &[(String, Vec<u8>, Duration)]) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        for (key, payload, ttl) in items {
            entries.insert(
                key.clone(),
                Entry {
                    value: Value::Bytes(Self::encode_payload(payload)),
                    expires_at: Some(now + *ttl),
                },
            );
        }
    }

    pub fn delete(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// Delete every key matching `pattern`, where `*` matches any run of
    /// characters. Returns the number of keys removed.
    pub fn delete_pattern(&self, pattern: &str) -> usize {
        let mut entries = self.entries.write();
        let doomed: Vec<String> = entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        for key in &doomed {
            entries.remove(key);
        }
        doomed.len()
    }

    // -------------------------------------------------------------------------
    // Sorted sets (anti-spam ring)
    // -------------------------------------------------------------------------

    /// Append `member` with `score` to the sorted set at `key`, refreshing the
    /// key TTL. Creates the set when absent.
    pub fn zadd(&self, key: &str, score: i64, member: &str, ttl: Duration) {
        let mut entries = self.entries.write();
        let now = Instant::now();
        let entry = entries
            .entry(key.to_string())
            .and_modify(|e| {
                // A previously expired or plain-value entry is replaced.
                if e.is_expired(now) || !matches!(e.value, Value::SortedSet(_)) {
                    e.value = Value::SortedSet(BTreeSet::new());
                }
            })
            .or_insert_with(|| Entry {
                value: Value::SortedSet(BTreeSet::new()),
                expires_at: None,
            });
        if let Value::SortedSet(set) = &mut entry.value {
            set.insert((score, member.to_string()));
        }
        entry.expires_at = Some(now + ttl);
    }

    /// Highest-score element of the sorted set at `key`.
    pub fn zlast(&self, key: &str) -> Option<(i64, String)> {
        let now = Instant::now();
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        match &entry.value {
            Value::SortedSet(set) => set.iter().next_back().cloned(),
            Value::Bytes(_) => None,
        }
    }

    /// Number of members with score in `[min, max]` (inclusive).
    pub fn zcount(&self, key: &str, min: i64, max: i64) -> usize {
        let now = Instant::now();
        let entries = self.entries.read();
        let Some(entry) = entries.get(key) else {
            return 0;
        };
        if entry.is_expired(now) {
            return 0;
        }
        match &entry.value {
            Value::SortedSet(set) => set.iter().filter(|(s, _)| (min..=max).contains(s)).count(),
            Value::Bytes(_) => 0,
        }
    }

    /// Remove members with score in `[min, max]`. Returns how many were
    /// removed.
    pub fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> usize {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(key) else {
            return 0;
        };
        let Value::SortedSet(set) = &mut entry.value else {
            return 0;
        };
        let before = set.len();
        set.retain(|(s, _)| !(min..=max).contains(s));
        before - set.len()
    }

    /// Drop expired entries. Called opportunistically from housekeeping.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal glob matcher supporting `*` only.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut pos = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !text.starts_with(part) {
                return false;
            }
            pos = part.len();
        } else if i == parts.len() - 1 && !pattern.ends_with('*') {
            return text.len() >= pos && text[pos..].ends_with(part);
        } else {
            match text[pos..].find(part) {
                Some(found) => pos += found + part.len(),
                None => return false,
            }
        }
    }
    true
}
