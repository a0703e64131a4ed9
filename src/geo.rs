use std::fs::File;
use std::num::NonZeroUsize;
use std::path::Path;

use anyhow::{bail, Context, Result};
use lru::LruCache;
use memmap2::Mmap;
use tracing::warn;

/// Number of payload fields per tuple: country, region, city, spare, isp.
pub const FIELD_COUNT: usize = 5;

/// Resolved location tuple. Missing trailing fields default to "unknown".
pub type GeoFields = [String; FIELD_COUNT];

const CACHE_CAPACITY: usize = 32768;

/// Maximum allowed index-block length (24-bit payload offsets).
const MAX_INDEX_LEN: usize = 16_777_216;

/// Byte length of the 256-entry prefix-flag table.
const FLAG_TABLE_LEN: usize = 256 * 4;

enum DbBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl DbBytes {
    fn as_slice(&self) -> &[u8] {
        match self {
            DbBytes::Mapped(m) => m,
            DbBytes::Owned(v) => v,
        }
    }
}

/// IPv4 interval database resolver.
///
/// The file is memory-mapped once at startup and never mutated. Layout:
/// a 4-byte big-endian index length, then the index block (256 little-endian
/// u32 prefix flags followed by 8-byte interval records), then the payload
/// area of tab-separated tuples. Lookups walk the interval records for the
/// first octet's range; results sit behind an LRU keyed by the IP string.
pub struct GeoDb {
    bytes: DbBytes,
    /// Index block length (the `offset_` of the on-disk format).
    index_len: usize,
    cache: LruCache<String, Option<GeoFields>>,
}

impl GeoDb {
    /// Memory-maps a database file. Missing or malformed files are fatal:
    /// the pipeline cannot run schemas with `ip` attributes without one.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("opening geo database {}", path.display()))?;
        let map = unsafe { Mmap::map(&file) }
            .with_context(|| format!("mapping geo database {}", path.display()))?;
        Self::build(DbBytes::Mapped(map))
            .with_context(|| format!("invalid geo database {}", path.display()))
    }

    /// Builds a resolver over in-memory database bytes.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        Self::build(DbBytes::Owned(data))
    }

    fn build(bytes: DbBytes) -> Result<Self> {
        let data = bytes.as_slice();
        if data.len() < 4 + FLAG_TABLE_LEN {
            bail!("database too short: {} bytes", data.len());
        }

        let index_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if index_len == 0 || index_len >= MAX_INDEX_LEN {
            bail!("bad index length {index_len}");
        }
        if data.len() < 4 + index_len {
            bail!(
                "index length {index_len} exceeds file size {}",
                data.len()
            );
        }

        let cap = NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero capacity");

        Ok(Self {
            bytes,
            index_len,
            cache: LruCache::new(cap),
        })
    }

    /// Resolves a dotted-quad to its location tuple.
    ///
    /// IPv6 inputs (anything containing ':') get a constant tuple. Invalid
    /// input and out-of-range index entries resolve to `None`; the caller
    /// omits the derived fields in that case.
    pub fn resolve(&mut self, ip: &str) -> Option<GeoFields> {
        if ip.contains(':') {
            return Some(ipv6_fields());
        }

        if let Some(cached) = self.cache.get(ip) {
            return cached.clone();
        }

        let resolved = self.lookup(ip);
        self.cache.put(ip.to_string(), resolved.clone());
        resolved
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    fn lookup(&self, ip: &str) -> Option<GeoFields> {
        let octets = parse_ipv4(ip).or_else(|| {
            warn!(ip, "invalid ip");
            None
        })?;

        let ip_long = u32::from_be_bytes(octets);
        let index = &self.bytes.as_slice()[4..4 + self.index_len];

        let flag_at = octets[0] as usize * 4;
        let start = u32::from_le_bytes([
            index[flag_at],
            index[flag_at + 1],
            index[flag_at + 2],
            index[flag_at + 3],
        ]) as usize;

        // Interval records are 8 bytes: big-endian upper bound, 24-bit
        // little-endian payload offset, 1-byte payload length.
        let mut payload_off = 0usize;
        let mut payload_len = 0usize;
        let mut pos = start * 8 + FLAG_TABLE_LEN;
        let end = self.index_len.saturating_sub(1028);
        while pos < end && pos + 8 <= index.len() {
            let bound = u32::from_be_bytes([
                index[pos],
                index[pos + 1],
                index[pos + 2],
                index[pos + 3],
            ]);
            if bound >= ip_long {
                payload_off = u32::from_le_bytes([
                    index[pos + 4],
                    index[pos + 5],
                    index[pos + 6],
                    0,
                ]) as usize;
                payload_len = index[pos + 7] as usize;
                break;
            }
            pos += 8;
        }

        let data = self.bytes.as_slice();
        let at = self.index_len + payload_off;
        if at < 1024 {
            return None;
        }
        let Some(raw) = data.get(at - 1024..at - 1024 + payload_len) else {
            warn!(ip, offset = payload_off, len = payload_len, "payload out of range");
            return None;
        };

        Some(split_fields(raw))
    }
}

fn ipv6_fields() -> GeoFields {
    [
        "ipv6".to_string(),
        "ipv6".to_string(),
        "ipv6".to_string(),
        "unknown".to_string(),
        "unknown".to_string(),
    ]
}

fn parse_ipv4(ip: &str) -> Option<[u8; 4]> {
    let mut octets = [0u8; 4];
    let mut parts = ip.split('.');
    for slot in &mut octets {
        *slot = parts.next()?.parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(octets)
}

/// Splits a payload tuple on tabs into at most [`FIELD_COUNT`] fields,
/// left-filling; the remainder defaults to "unknown".
fn split_fields(raw: &[u8]) -> GeoFields {
    let mut fields = std::array::from_fn(|_| "unknown".to_string());
    let text = String::from_utf8_lossy(raw);
    for (i, part) in text.split('\t').take(FIELD_COUNT).enumerate() {
        fields[i] = part.to_string();
    }
    fields
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a minimal database image: one interval record per entry,
    /// each entry `(upper_bound_ip, payload)`.
    pub(crate) fn build_db(entries: &[(u32, &str)]) -> Vec<u8> {
        let mut payload = Vec::new();
        let mut records = Vec::new();

        for (bound, tuple) in entries {
            let rel = payload.len();
            payload.extend_from_slice(tuple.as_bytes());

            records.extend_from_slice(&bound.to_be_bytes());
            // Payload offsets are biased so that `index_len + off - 1024`
            // lands at the payload area (4 + index_len + rel).
            let off = (1028 + rel) as u32;
            records.extend_from_slice(&off.to_le_bytes()[..3]);
            records.push(tuple.len() as u8);
        }

        // All prefixes scan from record 0.
        let mut index = vec![0u8; FLAG_TABLE_LEN];
        index.extend_from_slice(&records);
        // The scan excludes the trailing 1028 bytes of the index block.
        index.extend_from_slice(&vec![0u8; 1028]);

        let mut db = Vec::new();
        db.extend_from_slice(&(index.len() as u32).to_be_bytes());
        db.extend_from_slice(&index);
        db.extend_from_slice(&payload);
        db
    }

    fn ip(a: u8, b: u8, c: u8, d: u8) -> u32 {
        u32::from_be_bytes([a, b, c, d])
    }

    #[test]
    fn test_resolve_hit() {
        let db = build_db(&[
            (ip(1, 2, 3, 255), "CN\tZJ\tHZ\t-\tUN"),
            (ip(255, 255, 255, 255), "XX\tYY\tZZ\t-\tQQ"),
        ]);
        let mut geo = GeoDb::from_bytes(db).expect("build");

        let fields = geo.resolve("1.2.3.4").expect("resolved");
        assert_eq!(fields[0], "CN");
        assert_eq!(fields[1], "ZJ");
        assert_eq!(fields[2], "HZ");
        assert_eq!(fields[4], "UN");
    }

    #[test]
    fn test_resolve_falls_to_next_interval() {
        let db = build_db(&[
            (ip(1, 0, 0, 255), "A\tB\tC\t-\tD"),
            (ip(255, 255, 255, 255), "W\tX\tY\t-\tZ"),
        ]);
        let mut geo = GeoDb::from_bytes(db).expect("build");

        let fields = geo.resolve("9.9.9.9").expect("resolved");
        assert_eq!(fields[0], "W");
    }

    #[test]
    fn test_short_tuple_left_fills() {
        let db = build_db(&[(ip(255, 255, 255, 255), "CN\tZJ")]);
        let mut geo = GeoDb::from_bytes(db).expect("build");

        let fields = geo.resolve("8.8.8.8").expect("resolved");
        assert_eq!(fields[0], "CN");
        assert_eq!(fields[1], "ZJ");
        assert_eq!(fields[2], "unknown");
        assert_eq!(fields[4], "unknown");
    }

    #[test]
    fn test_invalid_ip_is_none() {
        let db = build_db(&[(ip(255, 255, 255, 255), "A\tB\tC\t-\tD")]);
        let mut geo = GeoDb::from_bytes(db).expect("build");

        assert!(geo.resolve("not-an-ip").is_none());
        assert!(geo.resolve("1.2.3").is_none());
        assert!(geo.resolve("1.2.3.4.5").is_none());
        assert!(geo.resolve("300.1.1.1").is_none());
    }

    #[test]
    fn test_ipv6_constant_tuple() {
        let db = build_db(&[(ip(255, 255, 255, 255), "A\tB\tC\t-\tD")]);
        let mut geo = GeoDb::from_bytes(db).expect("build");

        let fields = geo.resolve("2001:db8::1").expect("ipv6");
        assert_eq!(fields[0], "ipv6");
        assert_eq!(fields[2], "ipv6");
        assert_eq!(fields[4], "unknown");
    }

    #[test]
    fn test_results_are_cached() {
        let db = build_db(&[(ip(255, 255, 255, 255), "A\tB\tC\t-\tD")]);
        let mut geo = GeoDb::from_bytes(db).expect("build");

        assert_eq!(geo.cache_len(), 0);
        geo.resolve("1.1.1.1");
        assert_eq!(geo.cache_len(), 1);
        geo.resolve("1.1.1.1");
        assert_eq!(geo.cache_len(), 1);
        // Misses are cached too.
        geo.resolve("junk");
        assert_eq!(geo.cache_len(), 2);
    }

    #[test]
    fn test_truncated_file_rejected() {
        assert!(GeoDb::from_bytes(vec![0, 0, 0, 8, 1, 2]).is_err());
        assert!(GeoDb::from_bytes(Vec::new()).is_err());
    }
}
