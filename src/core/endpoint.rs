/// A single network address of a backend, with its own prober task.
///
/// The prober keeps `alive()` and `roundtrip()` fresh: one timed `ping`
/// command (net round-trip), then the owning shard's status queries plus
/// `buildinfo` and `serverStatus` on the same connection (gross
/// round-trip). Results feed upward into the backend aggregator.
use crate::config::options;
use crate::core::backend::Backend;
use crate::core::connection::Connection;
use crate::core::{ChunkVersion, Namespace};
use crate::error::Error;
use crate::wire::{self, QueryComposer};
use bson::{doc, Document};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const PING_REQ_ID: u32 = 0x474E_4950; // "PING"
const DEAD: u64 = u64::MAX;

#[derive(Default)]
struct Pools {
    /// Connections with no versioning state.
    any: Vec<Connection>,
    /// Connections carrying the latest advertised shard versions.
    primary: Vec<Connection>,
}

pub struct Endpoint {
    backend: Weak<Backend>,
    addr: SocketAddr,
    roundtrip_us: AtomicU64,
    prev_roundtrip_us: AtomicU64,
    pinged: AtomicBool,
    pools: Mutex<Pools>,
}

impl Endpoint {
    /// Creates the endpoint and starts its background prober.
    pub fn spawn(backend: Weak<Backend>, addr: SocketAddr) -> Arc<Endpoint> {
        let endpoint = Arc::new(Endpoint {
            backend,
            addr,
            roundtrip_us: AtomicU64::new(DEAD),
            prev_roundtrip_us: AtomicU64::new(DEAD),
            pinged: AtomicBool::new(false),
            pools: Mutex::new(Pools::default()),
        });

        let this = endpoint.clone();
        tokio::spawn(async move {
            this.keep_ping().await;
        });

        endpoint
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn backend(&self) -> Option<Arc<Backend>> {
        self.backend.upgrade()
    }

    pub fn roundtrip_us(&self) -> u64 {
        self.roundtrip_us.load(Ordering::Acquire)
    }

    pub fn roundtrip(&self) -> Option<Duration> {
        match self.roundtrip_us() {
            DEAD => None,
            us => Some(Duration::from_micros(us)),
        }
    }

    pub fn alive(&self) -> bool {
        self.roundtrip_us() != DEAD
    }

    pub fn was_alive(&self) -> bool {
        self.prev_roundtrip_us.load(Ordering::Acquire) != DEAD
    }

    /// Fetches a cached connection or creates a fresh (unconnected) one.
    pub async fn get_any(self: &Arc<Self>) -> Connection {
        self.get(false).await
    }

    /// Same, but the connection carries shard-versioning state.
    pub async fn get_primary(self: &Arc<Self>) -> Connection {
        self.get(true).await
    }

    async fn get(self: &Arc<Self>, primary: bool) -> Connection {
        let mut pools = self.pools.lock().await;
        let pool = if primary { &mut pools.primary } else { &mut pools.any };
        match pool.pop() {
            Some(conn) => {
                debug!("using pooled connection for {}", self.addr);
                conn
            }
            None => {
                debug!("creating new connection for {}", self.addr);
                Connection::new(self.clone(), primary)
            }
        }
    }

    /// Puts a connection back. Excess beyond `conn_pool_size` is dropped.
    pub async fn release(&self, conn: Connection) {
        if !conn.is_established() {
            return;
        }
        let cap = options().conn_pool_size;
        let mut pools = self.pools.lock().await;
        let pool = if conn.is_primary() { &mut pools.primary } else { &mut pools.any };
        if pool.len() < cap {
            pool.push(conn);
        } else {
            debug!("not stashing connection to {}: pool full", self.addr);
        }
    }

    /// Closes all cached connections.
    pub async fn flush(&self) {
        debug!("flushing all connections for {}", self.addr);
        let mut pools = self.pools.lock().await;
        pools.any.clear();
        pools.primary.clear();
    }

    /// Called upon a failure observed on a connection in use: the endpoint
    /// is forced dead immediately and an out-of-band ping is scheduled.
    pub async fn failed(self: &Arc<Self>) {
        debug!("initiating ping of {} due to backend failure", self.addr);
        self.prev_roundtrip_us
            .store(self.roundtrip_us(), Ordering::Release);
        self.roundtrip_us.store(DEAD, Ordering::Release);
        self.flush().await;

        let this = self.clone();
        tokio::spawn(async move {
            this.ping_now().await;
        });
    }

    /// Performs a synchronous ping; returns the fresh liveness.
    pub async fn ping_now(self: &Arc<Self>) -> bool {
        let mut queries = self
            .backend()
            .and_then(|b| b.shard())
            .map(|s| s.ping_queries())
            .unwrap_or_default();
        queries.push(crate::core::shard::PingQuery {
            key: "build_info",
            ns: Namespace::new("local", "$cmd"),
            criteria: doc! { "buildinfo": 1 },
        });
        queries.push(crate::core::shard::PingQuery {
            key: "server_status",
            ns: Namespace::new("admin", "$cmd"),
            criteria: doc! { "serverStatus": 1 },
        });

        debug!("pinging {}", self.addr);
        let attempt = async {
            let started = Instant::now();
            let mut conn = self.get_any().await;

            let ping = QueryComposer::new(Namespace::new("local", "$cmd"), doc! { "ping": 1 })
                .msg_id(PING_REQ_ID)
                .batch_size(1)
                .slave_ok()
                .data();
            conn.establish(&Namespace::default(), &ChunkVersion::default(), &ping)
                .await?;
            let reply = wire::read_reply(conn.stream(), PING_REQ_ID).await?;
            let ok = reply
                .documents
                .first()
                .and_then(|d| d.get_i32("ok").ok().or_else(|| d.get_f64("ok").ok().map(|f| f as i32)))
                .unwrap_or(0);
            if ok != 1 {
                return Err(Error::backend_internal("negative reply to ping command"));
            }
            let net = started.elapsed();

            let mut status = Document::new();
            let mut req_id = PING_REQ_ID;
            for q in &queries {
                req_id += 1;
                let msg = QueryComposer::new(q.ns.clone(), q.criteria.clone())
                    .msg_id(req_id)
                    .batch_size(1)
                    .slave_ok()
                    .data();
                let s = conn.stream();
                s.write_all(&msg).await?;
                s.flush().await?;
                let reply = wire::read_reply(s, req_id).await?;
                if let Some(doc) = reply.documents.into_iter().next() {
                    status.insert(q.key, doc);
                }
            }
            let gross = started.elapsed();

            conn.release().await;
            Ok::<_, Error>((net, gross, status))
        };

        match tokio::time::timeout(options().ping_timeout, attempt).await {
            Ok(Ok((net, gross, status))) => {
                self.set_alive(net, gross, status).await;
                true
            }
            Ok(Err(e)) => {
                self.set_dead(&e.to_string()).await;
                false
            }
            Err(_) => {
                self.set_dead("timeout").await;
                false
            }
        }
    }

    async fn keep_ping(self: Arc<Self>) {
        loop {
            if self.backend.upgrade().is_none() {
                return;
            }
            let interval = if self.ping_now().await {
                options().ping_interval
            } else {
                options().ping_fail_interval
            };
            tokio::time::sleep(interval).await;
        }
    }

    async fn set_alive(&self, net: Duration, gross: Duration, status: Document) {
        let line = format!(
            "{} alive (roundtrip = {} ms net, {} ms gross)",
            self.addr,
            net.as_millis(),
            gross.as_millis()
        );
        if self.alive() {
            debug!("{line}");
        } else {
            info!("{line}");
        }

        self.pinged.store(true, Ordering::Release);
        self.prev_roundtrip_us
            .store(self.roundtrip_us(), Ordering::Release);
        self.roundtrip_us
            .store(net.as_micros() as u64, Ordering::Release);
        if let Some(backend) = self.backend() {
            backend.endpoint_alive(self, status);
        }
    }

    async fn set_dead(&self, reason: &str) {
        if !self.pinged.load(Ordering::Acquire) || self.alive() {
            warn!("{} dead: {reason}", self.addr);
        } else {
            debug!("{} dead: {reason}", self.addr);
        }

        self.pinged.store(true, Ordering::Release);
        self.prev_roundtrip_us
            .store(self.roundtrip_us(), Ordering::Release);
        self.roundtrip_us.store(DEAD, Ordering::Release);
        if let Some(backend) = self.backend() {
            backend.endpoint_dead(self);
        }
        self.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_endpoint() -> Arc<Endpoint> {
        Arc::new(Endpoint {
            backend: Weak::new(),
            addr: "127.0.0.1:27017".parse().unwrap(),
            roundtrip_us: AtomicU64::new(DEAD),
            prev_roundtrip_us: AtomicU64::new(DEAD),
            pinged: AtomicBool::new(false),
            pools: Mutex::new(Pools::default()),
        })
    }

    #[tokio::test]
    async fn test_dead_until_pinged() {
        let e = test_endpoint();
        assert!(!e.alive());
        assert!(!e.was_alive());
        assert_eq!(e.roundtrip(), None);
    }

    #[tokio::test]
    async fn test_pool_is_lifo_and_capped() {
        let e = test_endpoint();

        // fresh (never-established) connections are not pooled
        let conn = e.get_any().await;
        e.release(conn).await;
        assert!(e.pools.lock().await.any.is_empty());

        // liveness transitions keep the previous value
        e.roundtrip_us.store(1500, Ordering::Release);
        assert!(e.alive());
        e.prev_roundtrip_us.store(1500, Ordering::Release);
        e.roundtrip_us.store(DEAD, Ordering::Release);
        assert!(!e.alive());
        assert!(e.was_alive());
    }
}
