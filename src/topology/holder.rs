/// The topology holder: fetches the cluster map from the config servers,
/// rebuilds snapshots, and hot-swaps them atomically.
///
/// One background task polls at `conf_interval`. A fetch goes to the alive
/// config server with the lowest round-trip; if it stays silent past
/// `conf_retransmit` a second fetch is hedged to the next server, and
/// whichever completes successfully first wins, all bounded by
/// `conf_timeout`.
use crate::config::{finite, options};
use crate::core::backend::Backend;
use crate::core::connection::Connection;
use crate::core::shard::{Shard, ShardPool};
use crate::core::{ChunkVersion, Namespace};
use crate::error::{Error, Result};
use crate::monitor::Status;
use crate::topology::cache::DiskCache;
use crate::topology::{set_config_connstr, Snapshot};
use crate::wire::{self, QueryComposer};
use bson::{doc, Bson, Document};
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

const CACHE_KEY: &str = "shard_config";

pub struct TopologyHolder {
    connstr: String,
    servers: Vec<Arc<Backend>>,
    config_shard: Arc<Shard>,
    pool: Arc<ShardPool>,
    cache: Arc<DiskCache>,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
}

impl TopologyHolder {
    /// Creates the holder, boots from the disk cache when possible, and
    /// starts the polling task.
    pub fn spawn(
        connstr: &str,
        pool: Arc<ShardPool>,
        cache: Arc<DiskCache>,
    ) -> Result<Arc<TopologyHolder>> {
        if connstr.is_empty() {
            return Err(Error::bad_request(
                "connection string for config servers cannot be empty",
            ));
        }
        set_config_connstr(connstr);

        let servers = connstr
            .split(',')
            .map(|addr| Backend::spawn(Weak::new(), addr))
            .collect();
        let config_shard = pool.get("config", connstr)?;

        let holder = Arc::new(TopologyHolder {
            connstr: connstr.to_string(),
            servers,
            config_shard,
            pool,
            cache,
            snapshot: RwLock::new(None),
        });

        let cached = holder.cache.get(CACHE_KEY);
        if !cached.is_empty() {
            match Snapshot::build(holder.config_shard.clone(), cached, &holder.pool) {
                Ok(snap) => {
                    info!("using shard config cache");
                    *holder.snapshot.write() = Some(Arc::new(snap));
                }
                Err(e) => info!("cannot use shard config cache: {e}"),
            }
        }

        let this = holder.clone();
        tokio::spawn(async move {
            this.keep_updating().await;
        });

        Ok(holder)
    }

    pub fn connection_string(&self) -> &str {
        &self.connstr
    }

    pub fn shard(&self) -> Arc<Shard> {
        self.config_shard.clone()
    }

    pub fn exists(&self) -> bool {
        self.snapshot.read().is_some()
    }

    /// The current snapshot. In-flight requests keep whatever snapshot they
    /// captured; a swap never invalidates them.
    pub fn get(&self) -> Result<Arc<Snapshot>> {
        self.snapshot.read().clone().ok_or(Error::NoShardConfig)
    }

    /// Fetches the topology and installs it if it differs byte-for-byte
    /// from the current one.
    pub async fn update(&self) -> Result<()> {
        debug!("fetching shard config");
        let conf_bson = self.fetch_config().await?;

        let current = self.snapshot.read().clone();
        if current.map(|c| *c.raw() == conf_bson).unwrap_or(false) {
            debug!("shard config unchanged");
            return Ok(());
        }

        let snap = Snapshot::build(self.config_shard.clone(), conf_bson.clone(), &self.pool)?;
        *self.snapshot.write() = Some(Arc::new(snap));
        info!("shard config changed");
        self.cache.put(CACHE_KEY, conf_bson);
        Ok(())
    }

    async fn keep_updating(self: Arc<Self>) {
        loop {
            if let Err(e) = self.update().await {
                warn!("cannot update config: {e}");
            }
            tokio::time::sleep(options().conf_interval).await;
        }
    }

    /// Hedged fetch against the config servers.
    async fn fetch_config(&self) -> Result<Document> {
        let mut remaining = self.servers.clone();
        let mut pick = move |remaining: &mut Vec<Arc<Backend>>| -> Option<Arc<Backend>> {
            if remaining.is_empty() {
                return None;
            }
            let best = remaining
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.roundtrip_us())
                .map(|(i, _)| i)
                .unwrap();
            Some(remaining.swap_remove(best))
        };

        fn spawn_fetch(server: Arc<Backend>) -> JoinHandle<Result<Document>> {
            debug!("using config server {}", server.addr());
            tokio::spawn(async move { fetch_from(server).await })
        }

        let mut tasks: FuturesUnordered<JoinHandle<Result<Document>>> = FuturesUnordered::new();
        tasks.push(spawn_fetch(pick(&mut remaining).expect("at least one config server")));

        let deadline = finite(options().conf_timeout).map(|d| tokio::time::Instant::now() + d);
        let hedge_at = finite(options().conf_retransmit)
            .map(|d| tokio::time::Instant::now() + d);
        let mut hedged = hedge_at.is_none();
        let mut last_err = Error::backend_internal("cannot communicate with config servers");

        loop {
            let hedge_timer = async {
                match (hedged, hedge_at) {
                    (false, Some(at)) => tokio::time::sleep_until(at).await,
                    _ => futures::future::pending::<()>().await,
                }
            };
            let deadline_timer = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => futures::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = hedge_timer => {
                    hedged = true;
                    if let Some(server) = pick(&mut remaining) {
                        debug!("retransmitting config request to another server");
                        tasks.push(spawn_fetch(server));
                    }
                }
                _ = deadline_timer => {
                    return Err(Error::Timeout("fetching shard config".into()));
                }
                done = tasks.next() => match done {
                    Some(Ok(Ok(conf))) => return Ok(conf),
                    Some(Ok(Err(e))) => {
                        last_err = e;
                        if tasks.is_empty() {
                            match pick(&mut remaining) {
                                Some(server) => tasks.push(spawn_fetch(server)),
                                None => return Err(last_err),
                            }
                        }
                    }
                    Some(Err(join)) => {
                        last_err = Error::backend_internal(format!("config fetch panicked: {join}"));
                        if tasks.is_empty() {
                            match pick(&mut remaining) {
                                Some(server) => tasks.push(spawn_fetch(server)),
                                None => return Err(last_err),
                            }
                        }
                    }
                    None => return Err(last_err),
                }
            }
        }
    }

    /// Health of the router as a whole, for `/monitor` and the dashboard.
    pub fn monitor_check(&self) -> Status {
        let mut status = Status::ok();
        match self.get() {
            Ok(snapshot) => {
                for shard in snapshot.shards() {
                    status.merge(shard.monitor_status());
                }
                if let Some(limit) = finite(options().monitor_config_age) {
                    let age = snapshot.created_at().elapsed();
                    if age >= limit {
                        status.merge(Status::critical(format!(
                            "cannot update shard config for {} min",
                            age.as_secs() / 60
                        )));
                    }
                }
            }
            Err(_) => {
                status.merge(Status::critical("no config available".into()));
                status.merge(self.config_shard.monitor_status());
            }
        }
        status
    }
}

/// One full topology read over a single connection: ping, then the four
/// ordered tables via query + get-more loops.
async fn fetch_from(server: Arc<Backend>) -> Result<Document> {
    let endpoint = server
        .endpoint()
        .ok_or_else(|| Error::Connectivity(format!("{} not resolved yet", server.addr())))?;
    let mut conn = endpoint.get_any().await;

    let ping = QueryComposer::new(Namespace::new("local", "$cmd"), doc! { "ping": 1 })
        .batch_size(1)
        .data();
    conn.establish(&Namespace::default(), &ChunkVersion::default(), &ping)
        .await?;
    wire::read_reply(conn.stream(), 0).await?;

    let mut ret = Document::new();
    ret.insert("shards", read_table(&mut conn, Namespace::new("config", "shards"), None).await?);
    ret.insert(
        "databases",
        read_table(&mut conn, Namespace::new("config", "databases"), None).await?,
    );
    ret.insert(
        "collections",
        read_table(
            &mut conn,
            Namespace::new("config", "collections"),
            Some(doc! { "dropped": false }),
        )
        .await?,
    );
    ret.insert("chunks", read_table(&mut conn, Namespace::new("config", "chunks"), None).await?);
    debug!("fetching config complete");

    conn.release().await;
    Ok(ret)
}

async fn read_table(
    conn: &mut Connection,
    ns: Namespace,
    condition: Option<Document>,
) -> Result<Vec<Bson>> {
    debug!("fetching table {ns}");
    let query = doc! {
        "query": condition.unwrap_or_default(),
        "$orderby": { "_id": 1 },
    };
    let msg = QueryComposer::new(ns.clone(), query).data();
    let s = conn.stream();
    s.write_all(&msg).await?;
    s.flush().await?;

    let mut rows = Vec::new();
    let mut reply = wire::read_reply(conn.stream(), 0).await?;
    loop {
        rows.extend(reply.documents.drain(..).map(Bson::Document));
        if reply.cursor_id == 0 {
            break;
        }
        let more = wire::get_more_msg(0, &ns, 0, reply.cursor_id);
        let s = conn.stream();
        s.write_all(&more).await?;
        s.flush().await?;
        reply = wire::read_reply(conn.stream(), 0).await?;
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holder_for_tests() -> Arc<TopologyHolder> {
        let pool = Arc::new(ShardPool::new());
        let cache = Arc::new(DiskCache::open(None));
        TopologyHolder::spawn("cfga:27019,cfgb:27019", pool, cache).unwrap()
    }

    #[tokio::test]
    async fn test_no_snapshot_until_first_fetch() {
        let holder = holder_for_tests();
        assert!(!holder.exists());
        assert!(matches!(holder.get(), Err(Error::NoShardConfig)));
    }

    #[tokio::test]
    async fn test_monitor_reports_missing_config() {
        let holder = holder_for_tests();
        let status = holder.monitor_check();
        assert_eq!(status.level(), crate::monitor::Level::Critical);
        assert!(status.messages().iter().any(|m| m == "no config available"));
    }

    #[tokio::test]
    async fn test_empty_connstr_rejected() {
        let pool = Arc::new(ShardPool::new());
        let cache = Arc::new(DiskCache::open(None));
        assert!(TopologyHolder::spawn("", pool, cache).is_err());
    }
}
