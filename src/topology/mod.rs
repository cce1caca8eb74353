/// Cluster topology: an immutable snapshot of shards, databases,
/// collections and chunks, plus the routing lookups over it.
pub mod cache;
pub mod holder;

use crate::core::order::{compare_docs, type_rank};
use crate::core::shard::{Shard, ShardPool};
use crate::core::{ChunkVersion, Namespace};
use crate::error::{Error, Result};
use bson::{Bson, Document};
use log::debug;
use md5::{Digest, Md5};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

static CONFIG_CONNSTR: OnceLock<String> = OnceLock::new();

/// The config servers' connection string, advertised to backends during
/// the set-shard-version handshake. Installed once at startup.
pub fn config_connstr() -> &'static str {
    CONFIG_CONNSTR.get().map(|s| s.as_str()).unwrap_or("")
}

pub(crate) fn set_config_connstr(connstr: &str) {
    let _ = CONFIG_CONNSTR.set(connstr.to_string());
}

/// A shard along with the chunk version our snapshot holds for it.
#[derive(Clone)]
pub struct VersionedShard {
    pub shard: Arc<Shard>,
    pub version: ChunkVersion,
}

/// Contiguous half-open range of a collection's key space, owned by one
/// shard. An empty bound document means "unbounded on that side".
#[derive(Debug, Clone)]
pub struct Chunk {
    ns: String,
    version: ChunkVersion,
    min: Document,
    max: Document,
    shard_id: String,
}

impl Chunk {
    fn parse(obj: &Document) -> Result<Chunk> {
        let broken = |what: &str| Error::ShardConfigBroken(format!("chunk without {what}"));
        let mut min = obj.get_document("min").map_err(|_| broken("min"))?.clone();
        let mut max = obj.get_document("max").map_err(|_| broken("max"))?.clone();
        if unbounded(&min) {
            min = Document::new();
        }
        if unbounded(&max) {
            max = Document::new();
        }

        Ok(Chunk {
            ns: obj.get_str("ns").map_err(|_| broken("ns"))?.to_string(),
            version: ChunkVersion::new(
                obj.get_object_id("lastmodEpoch").map_err(|_| broken("epoch"))?,
                obj.get_timestamp("lastmod").map_err(|_| broken("lastmod"))?,
            ),
            min,
            max,
            shard_id: obj.get_str("shard").map_err(|_| broken("shard"))?.to_string(),
        })
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn version(&self) -> &ChunkVersion {
        &self.version
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    pub fn lower_bound(&self) -> &Document {
        &self.min
    }

    pub fn upper_bound(&self) -> &Document {
        &self.max
    }

    pub fn contains(&self, key: &Document) -> bool {
        (self.min.is_empty() || compare_docs(key, &self.min) != Ordering::Less)
            && (self.max.is_empty() || compare_docs(key, &self.max) == Ordering::Less)
    }
}

/// A bound is "unbounded" when it reaches a key-space edge.
fn unbounded(bound: &Document) -> bool {
    match bound.iter().next() {
        Some((name, value)) => {
            matches!(value, Bson::MinKey | Bson::MaxKey)
                || name == "$minkey"
                || name == "$maxkey"
        }
        None => true,
    }
}

#[derive(Debug, Clone)]
pub struct Collection {
    ns: String,
    sharding_key: Document,
    /// Index range of this collection's chunks in the sorted chunk vector.
    chunk_range: (usize, usize),
}

impl Collection {
    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn sharding_key(&self) -> &Document {
        &self.sharding_key
    }
}

#[derive(Debug, Clone)]
pub struct Database {
    name: String,
    partitioned: bool,
    primary_id: String,
}

impl Database {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitioned
    }

    pub fn primary_shard_id(&self) -> &str {
        &self.primary_id
    }
}

/// An immutable view of the cluster. Old snapshots remain valid for any
/// in-flight request that captured them.
pub struct Snapshot {
    raw: Document,
    config_shard: Arc<Shard>,
    shards: HashMap<String, Arc<Shard>>,
    chunks: Vec<Chunk>,
    collections: HashMap<String, Collection>,
    databases: HashMap<String, Database>,
    created_at: Instant,
}

impl Snapshot {
    /// Builds a snapshot from the raw config-server document, deriving the
    /// per-(namespace, shard) maximal chunk version and validating the
    /// chunk-cover invariant.
    pub fn build(config_shard: Arc<Shard>, raw: Document, pool: &ShardPool) -> Result<Snapshot> {
        let mut shards = HashMap::new();
        for elt in raw.get_array("shards").unwrap_or(&Vec::new()) {
            let Some(obj) = elt.as_document() else { continue };
            let id = obj
                .get_str("_id")
                .map_err(|_| Error::ShardConfigBroken("shard without _id".into()))?;
            let host = obj
                .get_str("host")
                .map_err(|_| Error::ShardConfigBroken("shard without host".into()))?;
            shards.insert(id.to_string(), pool.get(id, host)?);
        }

        let mut chunks = Vec::new();
        for elt in raw.get_array("chunks").unwrap_or(&Vec::new()) {
            if let Some(obj) = elt.as_document() {
                chunks.push(Chunk::parse(obj)?);
            }
        }
        chunks.sort_by(|a, b| {
            a.ns.cmp(&b.ns).then_with(|| bound_cmp(&a.min, &b.min))
        });

        // Derive the maximal version per (namespace, shard) and back-fill:
        // this is what the versioning handshake advertises.
        let mut versions: HashMap<(String, String), ChunkVersion> = HashMap::new();
        for ch in &chunks {
            let key = (ch.ns.clone(), ch.shard_id.clone());
            match versions.get_mut(&key) {
                None => {
                    versions.insert(key, ch.version.clone());
                }
                Some(current) => {
                    if current.epoch != ch.version.epoch {
                        return Err(Error::ShardConfigBroken(format!(
                            "chunk epochs differ for collection {} and shard {}",
                            ch.ns, ch.shard_id
                        )));
                    }
                    if stamp_less(current, &ch.version) {
                        *current = ch.version.clone();
                    }
                }
            }
        }
        for ch in &mut chunks {
            ch.version = versions[&(ch.ns.clone(), ch.shard_id.clone())].clone();
        }

        let mut collections = HashMap::new();
        for elt in raw.get_array("collections").unwrap_or(&Vec::new()) {
            let Some(obj) = elt.as_document() else { continue };
            if obj.get_bool("dropped").unwrap_or(false) {
                continue;
            }
            let ns = obj
                .get_str("_id")
                .map_err(|_| Error::ShardConfigBroken("collection without _id".into()))?
                .to_string();
            let sharding_key = obj.get_document("key").cloned().unwrap_or_default();

            let start = chunks.partition_point(|c| c.ns.as_str() < ns.as_str());
            let end = chunks.partition_point(|c| c.ns.as_str() <= ns.as_str());
            check_cover(&ns, &chunks[start..end])?;

            collections.insert(ns.clone(), Collection { ns, sharding_key, chunk_range: (start, end) });
        }

        let mut databases = HashMap::new();
        for elt in raw.get_array("databases").unwrap_or(&Vec::new()) {
            let Some(obj) = elt.as_document() else { continue };
            let name = obj
                .get_str("_id")
                .map_err(|_| Error::ShardConfigBroken("database without _id".into()))?
                .to_string();
            databases.insert(
                name.clone(),
                Database {
                    name,
                    partitioned: obj.get_bool("partitioned").unwrap_or(false),
                    primary_id: obj.get_str("primary").unwrap_or("").to_string(),
                },
            );
        }

        Ok(Snapshot {
            raw,
            config_shard,
            shards,
            chunks,
            collections,
            databases,
            created_at: Instant::now(),
        })
    }

    pub fn raw(&self) -> &Document {
        &self.raw
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn shard(&self, name: &str) -> Option<Arc<Shard>> {
        if name == "config" {
            Some(self.config_shard.clone())
        } else {
            self.shards.get(name).cloned()
        }
    }

    /// Every shard, the config pseudo-shard first.
    pub fn shards(&self) -> Vec<Arc<Shard>> {
        let mut ret = vec![self.config_shard.clone()];
        let mut rest: Vec<_> = self.shards.iter().collect();
        rest.sort_by(|a, b| a.0.cmp(b.0));
        ret.extend(rest.into_iter().map(|(_, s)| s.clone()));
        ret
    }

    pub fn database(&self, name: &str) -> Option<&Database> {
        self.databases.get(name)
    }

    pub fn databases(&self) -> Vec<&Database> {
        let mut ret: Vec<_> = self.databases.values().collect();
        ret.sort_by(|a, b| a.name.cmp(&b.name));
        ret
    }

    pub fn collection(&self, ns: &Namespace) -> Option<&Collection> {
        self.collections.get(ns.ns())
    }

    fn collection_chunks(&self, coll: &Collection) -> &[Chunk] {
        &self.chunks[coll.chunk_range.0..coll.chunk_range.1]
    }

    /// All shards holding any part of `ns`, with their advertised versions.
    pub fn shards_for(&self, ns: &Namespace) -> Vec<VersionedShard> {
        if ns.db() == "config" {
            return vec![VersionedShard {
                shard: self.config_shard.clone(),
                version: ChunkVersion::default(),
            }];
        }

        if let Some(coll) = self.collection(ns) {
            let mut seen: Vec<VersionedShard> = Vec::new();
            for ch in self.collection_chunks(coll) {
                if !seen.iter().any(|vs| vs.shard.id() == ch.shard_id) {
                    if let Some(shard) = self.shard(&ch.shard_id) {
                        seen.push(VersionedShard { shard, version: ch.version.clone() });
                    }
                }
            }
            return seen;
        }

        match self.database(ns.db()) {
            Some(db) => match self.shard(db.primary_shard_id()) {
                Some(shard) => vec![VersionedShard { shard, version: ChunkVersion::default() }],
                None => Vec::new(),
            },
            None => Vec::new(),
        }
    }

    /// Shards holding the part of `ns` matching `criteria`. Conservatively
    /// falls back to all shards when the selector does not pin the key.
    pub fn find(&self, ns: &Namespace, criteria: &Document) -> Vec<VersionedShard> {
        let Some(coll) = self.collection(ns) else {
            debug!("collection {ns} not sharded");
            return self.shards_for(ns);
        };

        let hashed_field = hashed_key_field(coll.sharding_key());

        // Split the selector along the sharding key: plain equalities go
        // into head/tail around at most one `$in` vector.
        let mut vector: Option<(String, Vec<Bson>)> = None;
        let mut head = Document::new();
        let mut tail = Document::new();
        for (field, _) in coll.sharding_key() {
            let Some(el) = criteria.get(field) else {
                return self.shards_for(ns);
            };
            let operator = el
                .as_document()
                .and_then(|d| d.iter().next())
                .filter(|(k, _)| k.starts_with('$'))
                .map(|(k, v)| (k.clone(), v.clone()));
            match operator {
                None => {
                    if vector.is_none() {
                        head.insert(field, el.clone());
                    } else {
                        tail.insert(field, el.clone());
                    }
                }
                Some((op, Bson::Array(values))) if op == "$in" && vector.is_none() => {
                    vector = Some((field.clone(), values));
                }
                Some(_) => return self.shards_for(ns),
            }
        }

        let do_find = |key: &Document| -> Option<VersionedShard> {
            let key = match &hashed_field {
                Some(f) => {
                    let mut hashed = Document::new();
                    hashed.insert(f.as_str(), hash_key(key.get(f)));
                    hashed
                }
                None => key.clone(),
            };
            let chunks = self.collection_chunks(coll);
            let idx = chunks.partition_point(|c| bound_cmp(&c.min, &key) != Ordering::Greater);
            if idx == 0 {
                return None;
            }
            let ch = &chunks[idx - 1];
            debug!("found chunk {:?}...{:?} for {key}", ch.min, ch.max);
            if !ch.contains(&key) {
                return None;
            }
            Some(VersionedShard {
                shard: self.shard(&ch.shard_id)?,
                version: ch.version.clone(),
            })
        };

        match vector {
            None => match do_find(&head) {
                Some(vs) => vec![vs],
                None => self.shards_for(ns),
            },
            Some((field, values)) => {
                let mut ret: Vec<VersionedShard> = Vec::new();
                for v in values {
                    // compose the key in sharding-key order
                    let mut key = Document::new();
                    for (k, val) in &head {
                        key.insert(k, val.clone());
                    }
                    key.insert(&field, v);
                    for (k, val) in &tail {
                        key.insert(k, val.clone());
                    }
                    match do_find(&key) {
                        Some(vs) => {
                            if !ret.iter().any(|x| Arc::ptr_eq(&x.shard, &vs.shard)) {
                                ret.push(vs);
                            }
                        }
                        None => return self.shards_for(ns),
                    }
                }
                ret
            }
        }
    }
}

/// Bound comparison where the empty document is minus infinity.
fn bound_cmp(bound: &Document, key: &Document) -> Ordering {
    if bound.is_empty() {
        return Ordering::Less;
    }
    compare_docs(bound, key)
}

fn stamp_less(a: &ChunkVersion, b: &ChunkVersion) -> bool {
    (a.stamp.time, a.stamp.increment) < (b.stamp.time, b.stamp.increment)
}

/// A `{field: "hashed"}` sharding key names its single hashed field.
fn hashed_key_field(key: &Document) -> Option<String> {
    if key.len() != 1 {
        return None;
    }
    key.iter()
        .next()
        .filter(|(_, v)| matches!(v, Bson::String(s) if s == "hashed"))
        .map(|(k, _)| k.clone())
}

/// Verifies that `chunks` (sorted by lower bound) partition the whole key
/// space of `ns` with no gaps and no overlaps.
fn check_cover(ns: &str, chunks: &[Chunk]) -> Result<()> {
    let Some(first) = chunks.first() else {
        return Ok(());
    };
    let last = chunks.last().unwrap();

    if !first.min.is_empty() || !last.max.is_empty() {
        return Err(Error::ShardConfigBroken(format!(
            "partition of collection {ns} does not cover the key space"
        )));
    }
    for pair in chunks.windows(2) {
        if pair[0].max.is_empty() || compare_docs(&pair[0].max, &pair[1].min) != Ordering::Equal {
            return Err(Error::ShardConfigBroken(format!(
                "gap in partition of collection {ns}"
            )));
        }
    }
    Ok(())
}

/// 64-bit hash of one sharding-key value: MD5 over a zero seed, the
/// value's canonical type code, and the value itself.
pub fn hash_key(value: Option<&Bson>) -> i64 {
    let mut ctx = Md5::new();
    ctx.update(0i32.to_le_bytes());
    ctx.update(type_rank(value).to_le_bytes());

    match value {
        Some(Bson::Int32(n)) => ctx.update((*n as i64).to_le_bytes()),
        Some(Bson::Int64(n)) => ctx.update(n.to_le_bytes()),
        Some(Bson::Double(d)) => {
            let i = if d.is_nan() {
                0
            } else if *d < i64::MIN as f64 {
                i64::MIN
            } else if *d > i64::MAX as f64 {
                i64::MAX
            } else {
                *d as i64
            };
            ctx.update(i.to_le_bytes());
        }
        Some(Bson::String(s)) => {
            ctx.update((s.len() as i32 + 1).to_le_bytes());
            ctx.update(s.as_bytes());
            ctx.update([0u8]);
        }
        Some(Bson::ObjectId(oid)) => ctx.update(oid.bytes()),
        Some(Bson::Boolean(b)) => ctx.update([*b as u8]),
        Some(Bson::DateTime(t)) => ctx.update(t.timestamp_millis().to_le_bytes()),
        Some(Bson::Timestamp(t)) => {
            ctx.update(t.increment.to_le_bytes());
            ctx.update(t.time.to_le_bytes());
        }
        _ => {}
    }

    let digest = ctx.finalize();
    i64::from_le_bytes(digest[0..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::oid::ObjectId;
    use bson::{doc, Timestamp};

    fn ts(time: u32, inc: u32) -> Timestamp {
        Timestamp { time, increment: inc }
    }

    fn chunk_doc(ns: &str, epoch: ObjectId, stamp: Timestamp, min: Document, max: Document, shard: &str) -> Document {
        doc! {
            "ns": ns, "lastmodEpoch": epoch, "lastmod": stamp,
            "min": min, "max": max, "shard": shard,
        }
    }

    /// Topology used throughout: db.c sharded on {k: 1}, chunks
    /// [-inf, 10) -> s1, [10, +inf) -> s2.
    fn raw_config(epoch: ObjectId) -> Document {
        doc! {
            "shards": [
                { "_id": "s1", "host": "s1a:27018" },
                { "_id": "s2", "host": "s2a:27018,s2b:27018" },
            ],
            "databases": [
                { "_id": "db", "partitioned": true, "primary": "s1" },
                { "_id": "plain", "partitioned": false, "primary": "s2" },
            ],
            "collections": [
                { "_id": "db.c", "key": { "k": 1 } },
            ],
            "chunks": [
                chunk_doc("db.c", epoch, ts(1, 2), doc! { "k": Bson::MinKey }, doc! { "k": 10 }, "s1"),
                chunk_doc("db.c", epoch, ts(1, 5), doc! { "k": 10 }, doc! { "k": Bson::MaxKey }, "s2"),
            ],
        }
    }

    fn build(raw: Document) -> Result<Snapshot> {
        let pool = ShardPool::new();
        let config_shard = Shard::make("config", "cfg1:27019,cfg2:27019").unwrap();
        Snapshot::build(config_shard, raw, &pool)
    }

    #[tokio::test]
    async fn test_point_routing() {
        let snap = build(raw_config(ObjectId::new())).unwrap();
        let ns = Namespace::parse("db.c").unwrap();

        let hit = snap.find(&ns, &doc! { "k": 5 });
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].shard.id(), "s1");

        let hit = snap.find(&ns, &doc! { "k": 10 });
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].shard.id(), "s2");

        // no key field in the selector: all shards holding the collection
        let all = snap.find(&ns, &doc! { "other": 1 });
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_in_fanout_deduplicates() {
        let snap = build(raw_config(ObjectId::new())).unwrap();
        let ns = Namespace::parse("db.c").unwrap();

        let hit = snap.find(&ns, &doc! { "k": { "$in": [5, 15] } });
        assert_eq!(hit.len(), 2);

        let hit = snap.find(&ns, &doc! { "k": { "$in": [5, 7, 9] } });
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].shard.id(), "s1");

        // any other operator is conservative
        let hit = snap.find(&ns, &doc! { "k": { "$gt": 5 } });
        assert_eq!(hit.len(), 2);
    }

    #[tokio::test]
    async fn test_unsharded_collection_routes_to_database_primary() {
        let snap = build(raw_config(ObjectId::new())).unwrap();
        let ns = Namespace::parse("plain.things").unwrap();
        let hit = snap.find(&ns, &doc! { "x": 1 });
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].shard.id(), "s2");
        assert!(hit[0].version.is_zero());
    }

    #[tokio::test]
    async fn test_config_db_routes_to_config_shard() {
        let snap = build(raw_config(ObjectId::new())).unwrap();
        let ns = Namespace::parse("config.chunks").unwrap();
        let hit = snap.find(&ns, &doc! {});
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].shard.id(), "config");
    }

    #[tokio::test]
    async fn test_version_backfill_is_per_shard_max() {
        let epoch = ObjectId::new();
        let mut raw = raw_config(epoch);
        // s1 owns two chunks with stamps (1,2) and (3,1): both must
        // advertise (3,1) after back-fill.
        raw.insert(
            "chunks",
            vec![
                chunk_doc("db.c", epoch, ts(1, 2), doc! { "k": Bson::MinKey }, doc! { "k": 5 }, "s1"),
                chunk_doc("db.c", epoch, ts(3, 1), doc! { "k": 5 }, doc! { "k": 10 }, "s1"),
                chunk_doc("db.c", epoch, ts(1, 5), doc! { "k": 10 }, doc! { "k": Bson::MaxKey }, "s2"),
            ],
        );
        let snap = build(raw).unwrap();
        let ns = Namespace::parse("db.c").unwrap();

        let hit = snap.find(&ns, &doc! { "k": 1 });
        assert_eq!(hit[0].version.stamp, ts(3, 1));
        let hit = snap.find(&ns, &doc! { "k": 7 });
        assert_eq!(hit[0].version.stamp, ts(3, 1));
        let hit = snap.find(&ns, &doc! { "k": 12 });
        assert_eq!(hit[0].version.stamp, ts(1, 5));
    }

    #[tokio::test]
    async fn test_differing_epochs_rejected() {
        let epoch = ObjectId::new();
        let mut raw = raw_config(epoch);
        raw.insert(
            "chunks",
            vec![
                chunk_doc("db.c", epoch, ts(1, 2), doc! { "k": Bson::MinKey }, doc! { "k": 10 }, "s1"),
                chunk_doc("db.c", ObjectId::new(), ts(1, 5), doc! { "k": 10 }, doc! { "k": Bson::MaxKey }, "s1"),
            ],
        );
        assert!(matches!(build(raw), Err(Error::ShardConfigBroken(_))));
    }

    #[tokio::test]
    async fn test_gap_in_cover_rejected() {
        let epoch = ObjectId::new();
        let mut raw = raw_config(epoch);
        raw.insert(
            "chunks",
            vec![
                chunk_doc("db.c", epoch, ts(1, 2), doc! { "k": Bson::MinKey }, doc! { "k": 10 }, "s1"),
                chunk_doc("db.c", epoch, ts(1, 5), doc! { "k": 11 }, doc! { "k": Bson::MaxKey }, "s2"),
            ],
        );
        assert!(matches!(build(raw), Err(Error::ShardConfigBroken(_))));

        let mut raw = raw_config(epoch);
        raw.insert(
            "chunks",
            vec![chunk_doc("db.c", epoch, ts(1, 2), doc! { "k": Bson::MinKey }, doc! { "k": 10 }, "s1")],
        );
        assert!(matches!(build(raw), Err(Error::ShardConfigBroken(_))));
    }

    #[tokio::test]
    async fn test_hashed_key_routing_is_stable() {
        let epoch = ObjectId::new();
        let mid = hash_key(Some(&Bson::Int64(0)));
        let raw = doc! {
            "shards": [
                { "_id": "s1", "host": "h1:27018" },
                { "_id": "s2", "host": "h2:27018" },
            ],
            "databases": [ { "_id": "db", "partitioned": true, "primary": "s1" } ],
            "collections": [ { "_id": "db.h", "key": { "k": "hashed" } } ],
            "chunks": [
                chunk_doc("db.h", epoch, ts(1, 1), doc! { "k": Bson::MinKey }, doc! { "k": mid }, "s1"),
                chunk_doc("db.h", epoch, ts(1, 2), doc! { "k": mid }, doc! { "k": Bson::MaxKey }, "s2"),
            ],
        };
        let snap = build(raw).unwrap();
        let ns = Namespace::parse("db.h").unwrap();

        // routing is deterministic per value
        let a = snap.find(&ns, &doc! { "k": 42 });
        let b = snap.find(&ns, &doc! { "k": 42 });
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].shard.id(), b[0].shard.id());

        // equal values hash equally regardless of integer width
        assert_eq!(hash_key(Some(&Bson::Int32(7))), hash_key(Some(&Bson::Int64(7))));
        assert_ne!(hash_key(Some(&Bson::Int64(7))), hash_key(Some(&Bson::Int64(8))));
    }

    #[test]
    fn test_chunk_contains_half_open() {
        let ch = Chunk {
            ns: "db.c".into(),
            version: ChunkVersion::default(),
            min: doc! { "k": 10 },
            max: doc! { "k": 20 },
            shard_id: "s1".into(),
        };
        assert!(ch.contains(&doc! { "k": 10 }));
        assert!(ch.contains(&doc! { "k": 19 }));
        assert!(!ch.contains(&doc! { "k": 20 }));
        assert!(!ch.contains(&doc! { "k": 9 }));
    }
}
