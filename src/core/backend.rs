/// One logical backend node, potentially multi-homed.
///
/// Aggregates the endpoints resolved from one address string and keeps the
/// most recent status document published by whichever endpoint pinged
/// last. Alive means: status is non-empty and at least one endpoint
/// answers.
use crate::core::endpoint::Endpoint;
use crate::core::shard::Shard;
use crate::core::SoftwareVersion;
use bson::Document;
use futures::future::join_all;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::lookup_host;

pub struct Backend {
    shard: Weak<Shard>,
    addr: String,
    status: RwLock<Document>,
    permanent_errmsg: RwLock<String>,
    endpoints: RwLock<Vec<Arc<Endpoint>>>,
    nearest: Mutex<Option<Arc<Endpoint>>>,
    pinged: AtomicBool,
}

impl Backend {
    /// Creates the backend and kicks off address resolution; endpoints and
    /// their probers appear as soon as the name resolves.
    pub fn spawn(shard: Weak<Shard>, addr: &str) -> Arc<Backend> {
        let backend = Arc::new(Backend {
            shard,
            addr: addr.to_string(),
            status: RwLock::new(Document::new()),
            permanent_errmsg: RwLock::new(String::new()),
            endpoints: RwLock::new(Vec::new()),
            nearest: Mutex::new(None),
            pinged: AtomicBool::new(false),
        });

        let this = backend.clone();
        tokio::spawn(async move {
            this.resolve().await;
        });

        backend
    }

    async fn resolve(self: Arc<Self>) {
        loop {
            match lookup_host(&self.addr).await {
                Ok(addrs) => {
                    let weak = Arc::downgrade(&self);
                    let endpoints: Vec<_> =
                        addrs.map(|a| Endpoint::spawn(weak.clone(), a)).collect();
                    if endpoints.is_empty() {
                        warn!("{} resolves to no addresses", self.addr);
                    } else {
                        debug!("{} resolved to {} endpoint(s)", self.addr, endpoints.len());
                        *self.endpoints.write() = endpoints;
                        return;
                    }
                }
                Err(e) => warn!("cannot resolve {}: {e}", self.addr),
            }
            tokio::time::sleep(crate::config::options().ping_fail_interval).await;
        }
    }

    pub fn shard(&self) -> Option<Arc<Shard>> {
        self.shard.upgrade()
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn status(&self) -> Document {
        self.status.read().clone()
    }

    pub fn permanent_errmsg(&self) -> String {
        self.permanent_errmsg.read().clone()
    }

    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.read().clone()
    }

    /// The endpoint with the lowest round-trip; lazily cached, invalidated
    /// whenever any endpoint's liveness flips.
    pub fn endpoint(&self) -> Option<Arc<Endpoint>> {
        let mut nearest = self.nearest.lock();
        if nearest.is_none() {
            *nearest = self.calc_nearest();
        }
        nearest.clone()
    }

    fn calc_nearest(&self) -> Option<Arc<Endpoint>> {
        self.endpoints
            .read()
            .iter()
            .min_by_key(|e| e.roundtrip_us())
            .cloned()
    }

    pub fn alive(&self) -> bool {
        !self.status.read().is_empty() && self.endpoint().map(|e| e.alive()).unwrap_or(false)
    }

    pub fn roundtrip_us(&self) -> u64 {
        self.endpoint().map(|e| e.roundtrip_us()).unwrap_or(u64::MAX)
    }

    pub fn software_version(&self) -> SoftwareVersion {
        let status = self.status.read();
        match status.get_document("build_info") {
            Ok(info) => SoftwareVersion::from_build_info(info),
            Err(_) => SoftwareVersion::default(),
        }
    }

    pub fn supports_write_commands(&self) -> bool {
        self.software_version() >= SoftwareVersion::new(&[2, 6, 0])
    }

    /// Marks the backend failed: status is dropped and every endpoint is
    /// forced to re-probe.
    pub async fn failed(&self) {
        debug!("{} failed", self.addr);
        self.status.write().clear();
        for endpoint in self.endpoints() {
            endpoint.failed().await;
        }
    }

    /// Records an operator-visible permanent error.
    pub fn permanently_failed(&self, errmsg: &str) {
        *self.permanent_errmsg.write() = errmsg.to_string();
    }

    /// Pings every endpoint and waits for all of them.
    pub async fn ping_now(&self) {
        let endpoints = self.endpoints();
        join_all(endpoints.iter().map(|e| e.ping_now())).await;
    }

    fn find_arc(&self, pt: &Endpoint) -> Option<Arc<Endpoint>> {
        self.endpoints
            .read()
            .iter()
            .find(|e| std::ptr::eq(e.as_ref(), pt))
            .cloned()
    }

    /// Endpoint edge: a ping succeeded.
    pub(crate) fn endpoint_alive(&self, pt: &Endpoint, status: Document) {
        fn pid(status: &Document) -> i64 {
            status
                .get_document("server_status")
                .ok()
                .and_then(|s| match s.get("pid") {
                    Some(bson::Bson::Int32(n)) => Some(*n as i64),
                    Some(bson::Bson::Int64(n)) => Some(*n),
                    Some(bson::Bson::Double(d)) => Some(*d as i64),
                    _ => None,
                })
                .unwrap_or(0)
        }

        {
            let mut current = self.status.write();
            // the node restarted, forgive its past
            if pid(&current) != pid(&status) {
                self.permanent_errmsg.write().clear();
            }
            *current = status;
        }

        {
            let mut nearest = self.nearest.lock();
            let better = match nearest.as_ref() {
                Some(n) => pt.roundtrip_us() < n.roundtrip_us(),
                None => true,
            };
            if better {
                *nearest = self.find_arc(pt);
            }
        }

        if let Some(shard) = self.shard() {
            shard.backend_updated(self);
        }
        self.pinged.store(true, Ordering::Release);
    }

    /// Endpoint edge: a ping failed.
    pub(crate) fn endpoint_dead(&self, pt: &Endpoint) {
        if pt.was_alive() {
            if !self.endpoints.read().iter().any(|e| e.alive()) {
                self.status.write().clear();
            }
            *self.nearest.lock() = None;

            if let Some(shard) = self.shard() {
                shard.backend_updated(self);
            }
        }
        self.pinged.store(true, Ordering::Release);
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn bare_backend(addr: &str) -> Backend {
        Backend {
            shard: Weak::new(),
            addr: addr.to_string(),
            status: RwLock::new(Document::new()),
            permanent_errmsg: RwLock::new(String::new()),
            endpoints: RwLock::new(Vec::new()),
            nearest: Mutex::new(None),
            pinged: AtomicBool::new(false),
        }
    }

    #[test]
    fn test_not_alive_without_status_or_endpoints() {
        let b = bare_backend("db1:27017");
        assert!(!b.alive());
        assert_eq!(b.roundtrip_us(), u64::MAX);
        assert!(b.software_version().is_unknown());
    }

    #[test]
    fn test_software_version_from_status() {
        let b = bare_backend("db1:27017");
        *b.status.write() = doc! {
            "build_info": { "versionArray": [2, 6, 5, 0] },
        };
        assert!(b.supports_write_commands());
        *b.status.write() = doc! {
            "build_info": { "versionArray": [2, 4, 9, 0] },
        };
        assert!(!b.supports_write_commands());
    }

    #[test]
    fn test_pid_change_clears_permanent_error() {
        let b = bare_backend("db1:27017");
        b.permanently_failed("metadata manager failed to initialize");
        *b.status.write() = doc! { "server_status": { "pid": 100_i64 } };

        // same pid keeps the record
        b.endpoint_alive_status_only(doc! { "server_status": { "pid": 100_i64 } });
        assert!(!b.permanent_errmsg().is_empty());

        // restart forgives
        b.endpoint_alive_status_only(doc! { "server_status": { "pid": 200_i64 } });
        assert!(b.permanent_errmsg().is_empty());
    }

    impl Backend {
        /// Test hook: the status-swap half of `endpoint_alive`.
        fn endpoint_alive_status_only(&self, status: Document) {
            fn pid(status: &Document) -> i64 {
                status
                    .get_document("server_status")
                    .ok()
                    .and_then(|s| s.get_i64("pid").ok())
                    .unwrap_or(0)
            }
            let mut current = self.status.write();
            if pid(&current) != pid(&status) {
                self.permanent_errmsg.write().clear();
            }
            *current = status;
        }
    }
}
