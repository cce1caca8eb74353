//! pasarela -- a sharding router for MongoDB-flavoured document databases.
//!
//! The router terminates the database wire protocol from clients, keeps a
//! cluster topology fetched from separate config servers, and dispatches
//! each read and write to one or more backend replica sets, reconciling
//! their replies into a single client-visible result. It owns no data of
//! its own; from a client's perspective it behaves like a single database
//! instance that happens to be larger than any one shard.
pub mod auth;
pub mod config;
pub mod core;
pub mod error;
pub mod http;
pub mod monitor;
pub mod ops;
pub mod session;
pub mod topology;
pub mod wire;

use bson::oid::ObjectId;
use std::sync::{Arc, OnceLock};

/// The process-wide singletons, passed explicitly into whatever needs
/// them: the topology holder, the credentials cache, the disk cache and
/// the shard pool.
pub struct Ctx {
    pub topology: Arc<topology::holder::TopologyHolder>,
    pub credentials: Arc<auth::CredentialsCache>,
    pub cache: Arc<topology::cache::DiskCache>,
    pub pool: Arc<core::shard::ShardPool>,
}

impl Ctx {
    /// Wires the singletons together: disk cache first, then the shard
    /// pool, the topology holder (which may boot off the cache) and the
    /// credentials cache.
    pub fn bootstrap(options: &config::Options) -> error::Result<Arc<Ctx>> {
        let cache = Arc::new(topology::cache::DiskCache::open(options.config_cache.clone()));
        let pool = Arc::new(core::shard::ShardPool::new());
        let topology =
            topology::holder::TopologyHolder::spawn(&options.config_servers, pool.clone(), cache.clone())?;
        let credentials = Arc::new(auth::CredentialsCache::new(cache.clone()));
        Ok(Arc::new(Ctx { topology, credentials, cache, pool }))
    }
}

static SERVER_ID: OnceLock<ObjectId> = OnceLock::new();

/// Stable identifier of this router process, advertised to pre-3.0
/// backends during the versioning handshake.
pub fn server_id() -> ObjectId {
    *SERVER_ID.get_or_init(ObjectId::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_id_is_stable() {
        assert_eq!(server_id(), server_id());
    }
}
