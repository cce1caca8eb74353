/// Core backend plumbing: connections, endpoints, backends, shards.
pub mod backend;
pub mod connection;
pub mod endpoint;
pub mod order;
pub mod shard;

use crate::error::{Error, Result};
use bson::oid::ObjectId;
use bson::{Document, Timestamp};
use std::fmt;

/// A fully qualified collection name, `db.collection`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
    db: String,
    coll: String,
    ns: String,
}

impl Namespace {
    pub fn new(db: &str, coll: &str) -> Namespace {
        Namespace { db: db.to_string(), coll: coll.to_string(), ns: format!("{db}.{coll}") }
    }

    pub fn parse(ns: &str) -> Result<Namespace> {
        let dot = ns
            .find('.')
            .ok_or_else(|| Error::bad_request(format!("bad namespace: {ns}")))?;
        Ok(Namespace {
            db: ns[..dot].to_string(),
            coll: ns[dot + 1..].to_string(),
            ns: ns.to_string(),
        })
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn collection(&self) -> &str {
        &self.coll
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn is_empty(&self) -> bool {
        self.ns.is_empty()
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ns)
    }
}

/// Version of a chunk: `(epoch, stamp)`. The epoch is regenerated when a
/// collection is dropped or resharded; stamps are only comparable within
/// one epoch, so equality requires both parts to match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkVersion {
    pub epoch: ObjectId,
    pub stamp: Timestamp,
}

impl Default for ChunkVersion {
    fn default() -> ChunkVersion {
        ChunkVersion { epoch: ObjectId::default(), stamp: Timestamp { time: 0, increment: 0 } }
    }
}

impl ChunkVersion {
    pub fn new(epoch: ObjectId, stamp: Timestamp) -> ChunkVersion {
        ChunkVersion { epoch, stamp }
    }

    /// A zero version carries no constraint and is never advertised.
    pub fn is_zero(&self) -> bool {
        self.stamp.time == 0 && self.stamp.increment == 0
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}.{}", self.epoch, self.stamp.time, self.stamp.increment)
    }
}

/// Backend software version as advertised in `buildinfo.versionArray`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct SoftwareVersion(Vec<u32>);

impl SoftwareVersion {
    pub fn new(parts: &[u32]) -> SoftwareVersion {
        SoftwareVersion(parts.to_vec())
    }

    pub fn from_build_info(build_info: &Document) -> SoftwareVersion {
        let mut v = Vec::new();
        if let Ok(arr) = build_info.get_array("versionArray") {
            for elt in arr {
                match elt {
                    bson::Bson::Int32(n) if *n >= 0 => v.push(*n as u32),
                    bson::Bson::Int64(n) if *n >= 0 => v.push(*n as u32),
                    _ => break,
                }
            }
        }
        SoftwareVersion(v)
    }

    pub fn is_unknown(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_namespace_parse() {
        let ns = Namespace::parse("db.system.users").unwrap();
        assert_eq!(ns.db(), "db");
        assert_eq!(ns.collection(), "system.users");
        assert!(Namespace::parse("nodot").is_err());
    }

    #[test]
    fn test_chunk_version_equality_needs_both_parts() {
        let e1 = ObjectId::new();
        let e2 = ObjectId::new();
        let s = Timestamp { time: 1, increment: 2 };
        assert_eq!(ChunkVersion::new(e1, s), ChunkVersion::new(e1, s));
        assert_ne!(ChunkVersion::new(e1, s), ChunkVersion::new(e2, s));
        assert_ne!(
            ChunkVersion::new(e1, s),
            ChunkVersion::new(e1, Timestamp { time: 1, increment: 3 })
        );
        assert!(ChunkVersion::default().is_zero());
    }

    #[test]
    fn test_software_version_ordering() {
        let v24 = SoftwareVersion::from_build_info(&doc! { "versionArray": [2, 4, 11, 0] });
        let v26 = SoftwareVersion::new(&[2, 6, 0]);
        let v30 = SoftwareVersion::new(&[3, 0]);
        assert!(v24 < v26);
        assert!(v26 < v30);
        assert!(v26 >= SoftwareVersion::new(&[2, 6, 0]));
        assert!(SoftwareVersion::default().is_unknown());
    }
}
