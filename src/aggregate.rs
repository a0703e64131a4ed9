use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::warn;

use crate::record::{Record, Value};
use crate::schema::{Action, Aggregation, FieldKind, Schema};

/// Maximum live buckets; completed buckets evict least-recently-used first.
pub const BUCKET_CAPACITY: usize = 3600;

/// Lifecycle hooks of the bucket cache.
pub trait BucketHooks {
    /// A key was inserted for the first time.
    fn on_insert(&mut self, record: &mut Record);
    /// A key collision: merge `incoming` into `current`.
    fn on_aggregate(&mut self, current: &mut Record, incoming: Record);
    /// The LRU pushed out a completed bucket.
    fn on_evict(&mut self, record: Record);
    /// A bucket left over at `clear` time.
    fn on_clear(&mut self, record: Record);
}

/// LRU keyed by bucket hash, parameterized over [`BucketHooks`].
///
/// Insert of a new key evicts the tail first when full; merging into an
/// existing key promotes it to most-recently-used.
pub struct HookedLru<H: BucketHooks> {
    cache: LruCache<u64, Record>,
    hooks: H,
}

impl<H: BucketHooks> HookedLru<H> {
    pub fn new(capacity: usize, hooks: H) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("nonzero capacity");
        Self {
            cache: LruCache::new(cap),
            hooks,
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    pub fn insert(&mut self, key: u64, mut record: Record) {
        if let Some(current) = self.cache.get_mut(&key) {
            self.hooks.on_aggregate(current, record);
            return;
        }

        self.hooks.on_insert(&mut record);
        if let Some((_, evicted)) = self.cache.push(key, record) {
            self.hooks.on_evict(evicted);
        }
    }

    /// Drains every remaining bucket through `on_clear`, unordered.
    pub fn clear(&mut self) {
        while let Some((_, record)) = self.cache.pop_lru() {
            self.hooks.on_clear(record);
        }
    }
}

/// Merge-and-emit policy for log buckets: maintains `count` and `path`,
/// sums the aggregation keys on collision, and parks evicted buckets in
/// an outbox the worker drains into the tunnel.
pub struct BucketPolicy {
    keys: Vec<String>,
    path: String,
    outbox: Vec<Record>,
    /// Source records represented by emitted buckets.
    pub records_out: u64,
    /// Buckets emitted.
    pub buckets_out: u64,
}

impl BucketPolicy {
    fn new(keys: Vec<String>, path: String) -> Self {
        Self {
            keys,
            path,
            outbox: Vec::new(),
            records_out: 0,
            buckets_out: 0,
        }
    }

    fn emit(&mut self, record: Record) {
        self.records_out += record
            .get("count")
            .and_then(Value::as_int64)
            .unwrap_or(0) as u64;
        self.buckets_out += 1;
        self.outbox.push(record);
    }
}

impl BucketHooks for BucketPolicy {
    fn on_insert(&mut self, record: &mut Record) {
        if !record.contains("count") {
            record.set("count", Value::Int64(1));
        }
        if !record.contains("path") {
            record.set("path", Value::Str(self.path.clone()));
        }
    }

    fn on_aggregate(&mut self, current: &mut Record, incoming: Record) {
        if let Some(Value::Int64(count)) = current.get_mut("count") {
            *count += 1;
        }

        for key in &self.keys {
            let Some(rhs) = incoming.get(key) else {
                continue;
            };
            // Only same-kind numeric pairs merge; anything else is kept as-is.
            match (current.get_mut(key), rhs) {
                (Some(Value::Int64(l)), Value::Int64(r)) => *l += r,
                (Some(Value::Double(l)), Value::Double(r)) => *l += r,
                _ => {}
            }
        }
    }

    fn on_evict(&mut self, record: Record) {
        self.emit(record);
    }

    fn on_clear(&mut self, record: Record) {
        self.emit(record);
    }
}

/// Time-bucketed aggregator: prunes non-aggregated fields, quantizes the
/// time field, folds term values into the bucket key, and merges via the
/// hooked LRU.
pub struct Aggregator {
    lru: HookedLru<BucketPolicy>,
    time_field: String,
    interval: i64,
    terms: Vec<String>,
    /// STORE-originated field names outside keys/time/terms, removed
    /// before insertion.
    prune: HashSet<String>,
}

impl Aggregator {
    pub fn new(schema: &Schema, agg: &Aggregation, path: &str) -> Self {
        Self {
            lru: HookedLru::new(
                BUCKET_CAPACITY,
                BucketPolicy::new(agg.keys.clone(), path.to_string()),
            ),
            time_field: agg.time.clone(),
            interval: agg.interval,
            terms: agg.terms.clone(),
            prune: prune_set(schema, agg),
        }
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.is_empty()
    }

    /// Inserts or merges one record. Returns false when the record was
    /// dropped because a term field is missing or non-hashable.
    pub fn insert(&mut self, mut record: Record) -> bool {
        record.retain(|name| !self.prune.contains(name));

        let mut seed: u64 = 0;
        if self.interval > 0 {
            let Some(ts) = record.get(&self.time_field).and_then(Value::as_int64) else {
                warn!(field = %self.time_field, "record has no bucket timestamp");
                return false;
            };
            let bucket = ts - ts.rem_euclid(self.interval);
            record.set(self.time_field.clone(), Value::Int64(bucket));
            seed = bucket as u64;
        }

        for term in &self.terms {
            let Some(value) = record.get(term) else {
                warn!(term = %term, "record is missing a term field");
                return false;
            };
            hash_combine(&mut seed, value);
        }

        self.lru.insert(seed, record);
        true
    }

    /// Flushes all remaining buckets to the outbox. Called once per cycle
    /// after the input queue drains.
    pub fn clear(&mut self) {
        self.lru.clear();
    }

    /// Takes the buckets evicted since the last call.
    pub fn take_outbox(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.lru.hooks_mut().outbox)
    }

    pub fn records_out(&self) -> u64 {
        self.lru.hooks().records_out
    }

    pub fn buckets_out(&self) -> u64 {
        self.lru.hooks().buckets_out
    }
}

/// Boost-style hash_combine fold of one field value into the bucket seed.
fn hash_combine(seed: &mut u64, value: &Value) {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    match value {
        Value::Str(s) => s.hash(&mut hasher),
        Value::Int(n) => n.hash(&mut hasher),
        Value::Int64(n) => n.hash(&mut hasher),
        Value::Double(d) => d.to_bits().hash(&mut hasher),
    }
    let h = hasher.finish();
    *seed ^= h
        .wrapping_add(0x9e37_79b9)
        .wrapping_add(*seed << 6)
        .wrapping_add(*seed >> 2);
}

/// Names produced by STORE attributes that are outside the allow-set
/// `keys ∪ {time} ∪ terms`. `ip` attributes contribute their derived
/// sub-names, `request` attributes their three expansion fields.
fn prune_set(schema: &Schema, agg: &Aggregation) -> HashSet<String> {
    let mut allow: HashSet<&str> = agg.keys.iter().map(String::as_str).collect();
    allow.insert(agg.time.as_str());
    allow.extend(agg.terms.iter().map(String::as_str));

    let mut prune = HashSet::new();
    let mut mark = |name: String| {
        if !allow.contains(name.as_str()) {
            prune.insert(name);
        }
    };

    for attr in &schema.attributes {
        if attr.action != Action::Store {
            continue;
        }
        match attr.kind {
            FieldKind::Ip => {
                mark(attr.name.clone());
                for sub in ["country", "province", "city", "isp"] {
                    mark(format!("{}@{}", attr.name, sub));
                }
            }
            FieldKind::Request => {
                for field in ["method", "scheme", "domain"] {
                    mark(field.to_string());
                }
            }
            _ => mark(attr.name.clone()),
        }
    }

    prune
}
