/// Shards and backend selection.
///
/// A shard is a replication group owning a disjoint part of the data: a
/// single node, a replica set, or a multi-master sync group. The variant
/// decides which backend may serve which request, honouring read
/// preference, tags and replication lag. Shards are shared by identity:
/// the pool returns the same instance for the same connection string.
use crate::config::{finite, options};
use crate::core::backend::Backend;
use crate::core::connection::Connection;
use crate::core::{Namespace, SoftwareVersion};
use crate::error::{Error, Result};
use crate::monitor::Status;
use crate::wire::messages::query_flags;
use bson::{doc, Document};
use futures::future::join_all;
use log::debug;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// A status query run against every backend during each ping; the reply is
/// stored in the backend's status document under `key`.
#[derive(Debug, Clone)]
pub struct PingQuery {
    pub key: &'static str,
    pub ns: Namespace,
    pub criteria: Document,
}

pub struct Shard {
    id: String,
    connstr: String,
    backends: Vec<Arc<Backend>>,
    kind: Kind,
}

enum Kind {
    /// Anchors the synthetic `config` shard; never serves reads directly.
    Null,
    Single,
    Sync,
    ReplicaSet(ReplicaSetState),
}

#[derive(Debug, Clone, Default)]
struct BackendInfo {
    tags: Document,
    optime_ms: u64,
}

struct PingGate {
    active: AtomicBool,
    done: Notify,
}

struct ReplicaSetState {
    name: String,
    info: RwLock<HashMap<usize, BackendInfo>>,
    /// `None` = needs recomputation; `Some(None)` = known to have no primary.
    primary: Mutex<Option<Option<usize>>>,
    lost_primary_since: Mutex<Option<Instant>>,
    gate: Arc<PingGate>,
}

impl Shard {
    /// Parses `connstr` and constructs a shard of the matching variant:
    /// empty → Null, `host` → Single, `set/host,...` → ReplicaSet,
    /// `host,host` → Sync.
    pub fn make(id: &str, connstr: &str) -> Result<Arc<Shard>> {
        let (replset, members_str) = match connstr.find('/') {
            Some(slash) => (&connstr[..slash], &connstr[slash + 1..]),
            None => ("", connstr),
        };
        let members: Vec<&str> = if members_str.is_empty() {
            Vec::new()
        } else {
            members_str.split(',').collect()
        };

        let kind = if connstr.is_empty() {
            Kind::Null
        } else if replset.is_empty() && members.len() == 1 {
            Kind::Single
        } else if !replset.is_empty() {
            Kind::ReplicaSet(ReplicaSetState {
                name: replset.to_string(),
                info: RwLock::new(HashMap::new()),
                primary: Mutex::new(None),
                lost_primary_since: Mutex::new(Some(Instant::now())),
                gate: Arc::new(PingGate { active: AtomicBool::new(false), done: Notify::new() }),
            })
        } else if members.len() > 1 {
            Kind::Sync
        } else {
            return Err(Error::bad_request(format!("bad connection string: {connstr}")));
        };

        Ok(Arc::new_cyclic(|weak: &Weak<Shard>| Shard {
            id: id.to_string(),
            connstr: connstr.to_string(),
            backends: members
                .iter()
                .map(|addr| Backend::spawn(weak.clone(), addr))
                .collect(),
            kind,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection_string(&self) -> &str {
        &self.connstr
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Replica-set name, if this shard is one.
    pub fn replset_name(&self) -> Option<&str> {
        match &self.kind {
            Kind::ReplicaSet(rs) => Some(&rs.name),
            _ => None,
        }
    }

    /// Status queries the prober issues against members of this shard.
    pub fn ping_queries(&self) -> Vec<PingQuery> {
        match &self.kind {
            Kind::ReplicaSet(_) => vec![
                PingQuery {
                    key: "status",
                    ns: Namespace::new("admin", "$cmd"),
                    criteria: doc! { "replSetGetStatus": 1 },
                },
                PingQuery {
                    key: "conf",
                    ns: Namespace::new("local", "system.replset"),
                    criteria: Document::new(),
                },
            ],
            _ => Vec::new(),
        }
    }

    /// The highest software version among backends that reported one.
    pub fn software_version(&self) -> SoftwareVersion {
        let mut ret = SoftwareVersion::default();
        for b in &self.backends {
            let v = b.software_version();
            if !v.is_unknown() && (ret.is_unknown() || ret < v) {
                ret = v;
            }
        }
        ret
    }

    pub fn supports_write_commands(&self) -> bool {
        self.software_version() >= SoftwareVersion::new(&[2, 6, 0])
    }

    /// Returns a connection suitable for a read with the given query flags
    /// and read preference, avoiding `exclude` if possible. `None` when no
    /// alive backend qualifies.
    pub async fn read_op(
        &self,
        query_flags: u32,
        read_pref: &Document,
        exclude: Option<&Arc<Backend>>,
    ) -> Option<Connection> {
        match &self.kind {
            Kind::Null => None,
            Kind::Single => {
                let b = &self.backends[0];
                if b.alive() && !same_backend(Some(b), exclude) {
                    Some(b.endpoint()?.get_primary().await)
                } else {
                    None
                }
            }
            Kind::Sync => {
                let b = self.select_local(|_, b| b.alive() && !same_backend(Some(b), exclude))?;
                Some(b.endpoint()?.get_any().await)
            }
            Kind::ReplicaSet(rs) => self.replica_read_op(rs, query_flags, read_pref, exclude).await,
        }
    }

    /// Returns a connection suitable for writes.
    pub async fn primary(&self) -> Option<Connection> {
        match &self.kind {
            Kind::Single => {
                let b = &self.backends[0];
                if b.alive() {
                    Some(b.endpoint()?.get_primary().await)
                } else {
                    None
                }
            }
            Kind::ReplicaSet(rs) => {
                self.wait_for_pings(rs).await;
                let b = self.cached_primary(rs)?;
                Some(b.endpoint()?.get_primary().await)
            }
            _ => None,
        }
    }

    async fn replica_read_op(
        &self,
        rs: &ReplicaSetState,
        flags: u32,
        read_pref: &Document,
        exclude: Option<&Arc<Backend>>,
    ) -> Option<Connection> {
        self.wait_for_pings(rs).await;

        let mode = if !read_pref.is_empty() {
            read_pref.get_str("mode").unwrap_or("primary").to_string()
        } else if flags & query_flags::SLAVE_OK != 0 {
            "nearest".to_string()
        } else {
            "primary".to_string()
        };
        let tags: Vec<Document> = read_pref
            .get_array("tags")
            .map(|arr| arr.iter().filter_map(|t| t.as_document().cloned()).collect())
            .unwrap_or_default();

        if mode == "primary" || mode == "primaryPreferred" {
            let p = self.cached_primary(rs);
            match &p {
                Some(b) => debug!("current primary for shard {}: {}", self.id, b.addr()),
                None => debug!("shard {} has no primary", self.id),
            }

            let usable = p
                .as_ref()
                .map(|b| !same_backend(Some(b), exclude) && tags_match(&self.backend_tags(rs, b), &tags))
                .unwrap_or(false);

            // On `primary` the previous primary may have been re-elected:
            // after a failure we ping and trust the fresh answer, so the
            // exclusion is ignored.
            if mode == "primary" || usable {
                return match p {
                    Some(b) => Some(b.endpoint()?.get_primary().await),
                    None => None,
                };
            }
        }

        // `secondary', `secondaryPreferred' and `nearest' are not
        // distinguished beyond this point.
        let constrained = finite(options().max_repl_lag).is_some() || !tags.is_empty();
        let info = if constrained { rs.info.read().clone() } else { HashMap::new() };
        let optime_threshold = match finite(options().max_repl_lag) {
            Some(lag) => max_optime(&info).saturating_sub(lag.as_millis() as u64),
            None => 0,
        };

        let b = self.select_local(|idx, b| {
            if !is_healthy(b) || same_backend(Some(b), exclude) {
                return false;
            }
            if info.is_empty() {
                return true;
            }
            match info.get(&idx) {
                Some(i) => tags_match(&i.tags, &tags) && i.optime_ms >= optime_threshold,
                None => false,
            }
        });
        match b {
            Some(b) => {
                debug!("selecting {} for operation", b.addr());
                Some(b.endpoint()?.get_any().await)
            }
            None => {
                debug!("no backend suitable for operation on shard {}", self.id);
                None
            }
        }
    }

    /// Sorts candidates by round-trip and samples uniformly within the
    /// local-latency window; a degenerate window falls back to the full
    /// candidate set.
    fn select_local<F>(&self, pred: F) -> Option<Arc<Backend>>
    where
        F: Fn(usize, &Arc<Backend>) -> bool,
    {
        let mut candidates: Vec<(u64, usize)> = self
            .backends
            .iter()
            .enumerate()
            .filter(|(i, b)| pred(*i, b))
            .map(|(i, b)| (b.roundtrip_us(), i))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort();

        let threshold = candidates[0].0.saturating_add(options().local_threshold.as_micros() as u64);
        let mut window = candidates.iter().take_while(|(rt, _)| *rt < threshold).count();
        if window <= 1 {
            window = candidates.len();
        }

        let pick = rand::thread_rng().gen_range(0..window);
        Some(self.backends[candidates[pick].1].clone())
    }

    fn index_of(&self, b: &Backend) -> Option<usize> {
        self.backends.iter().position(|x| std::ptr::eq(x.as_ref(), b))
    }

    fn cached_primary(&self, rs: &ReplicaSetState) -> Option<Arc<Backend>> {
        let mut cache = rs.primary.lock();
        let value = match *cache {
            Some(v) => v,
            None => {
                let computed = self.backends.iter().position(|b| is_primary(b));
                if computed.is_some() {
                    *rs.lost_primary_since.lock() = None;
                }
                *cache = Some(computed);
                computed
            }
        };
        value.map(|i| self.backends[i].clone())
    }

    fn backend_tags(&self, rs: &ReplicaSetState, b: &Arc<Backend>) -> Document {
        self.index_of(b)
            .and_then(|i| rs.info.read().get(&i).map(|info| info.tags.clone()))
            .unwrap_or_default()
    }

    /// Called upon a failure while communicating with a backend.
    pub async fn failed(&self, b: &Arc<Backend>) {
        if let Kind::ReplicaSet(rs) = &self.kind {
            let was_primary = {
                let cache = rs.primary.lock();
                matches!(*cache, Some(Some(i)) if std::ptr::eq(self.backends[i].as_ref(), b.as_ref()))
            };
            if was_primary {
                self.lost_master();
            }
        }
        b.failed().await;
    }

    /// Called upon a `not master` error from a node that was supposed to be
    /// the primary. Clears the cached primary and kicks an emergency ping;
    /// pending selections block until it completes.
    pub fn lost_master(&self) {
        if let Kind::ReplicaSet(rs) = &self.kind {
            debug!("shard {} lost its primary node; will re-ping", self.id);
            *rs.primary.lock() = None;
            {
                let mut since = rs.lost_primary_since.lock();
                if since.is_none() {
                    *since = Some(Instant::now());
                }
            }
            self.ping_now(rs);
        }
    }

    fn ping_now(&self, rs: &ReplicaSetState) {
        if rs.gate.active.swap(true, Ordering::AcqRel) {
            return; // a ping round is already in flight
        }
        let gate = rs.gate.clone();
        let backends = self.backends.clone();
        tokio::spawn(async move {
            join_all(backends.iter().map(|b| b.ping_now())).await;
            gate.active.store(false, Ordering::Release);
            gate.done.notify_waiters();
        });
    }

    async fn wait_for_pings(&self, rs: &ReplicaSetState) {
        loop {
            let notified = rs.gate.done.notified();
            if !rs.gate.active.load(Ordering::Acquire) {
                return;
            }
            debug!("emergency ping still in progress; waiting");
            notified.await;
        }
    }

    /// Called after every backend ping, successful or not.
    pub fn backend_updated(&self, b: &Backend) {
        let Kind::ReplicaSet(rs) = &self.kind else { return };
        let Some(idx) = self.index_of(b) else { return };

        if is_primary_ref(b) {
            *rs.primary.lock() = Some(Some(idx));
            *rs.lost_primary_since.lock() = None;
        } else {
            let was_cached = matches!(*rs.primary.lock(), Some(Some(i)) if i == idx);
            if was_cached {
                self.lost_master();
            }
        }

        if b.alive() {
            let status = b.status();
            let member = find_in_array(&status, &["status", "members"], |m| {
                m.get("self").is_some()
            });
            let name = member
                .as_ref()
                .and_then(|m| m.get_str("name").ok())
                .unwrap_or("")
                .to_string();
            let optime_ms = member
                .as_ref()
                .and_then(|m| m.get_datetime("optimeDate").ok())
                .map(|t| t.timestamp_millis().max(0) as u64)
                .unwrap_or(u64::MAX);
            let tags = find_in_array(&status, &["conf", "members"], |m| {
                m.get_str("host").map(|h| h == name).unwrap_or(false)
            })
            .and_then(|m| m.get_document("tags").ok().cloned())
            .unwrap_or_default();

            rs.info.write().insert(idx, BackendInfo { tags, optime_ms });
        }
    }

    /// Short operator-readable description of one backend's health.
    pub fn backend_status(&self, b: &Arc<Backend>) -> String {
        match &self.kind {
            Kind::ReplicaSet(_) => {
                if !is_healthy(b) {
                    return "DEAD".to_string();
                }
                find_in_array(&b.status(), &["status", "members"], |m| m.get("self").is_some())
                    .and_then(|m| m.get_str("stateStr").ok().map(|s| s.to_string()))
                    .unwrap_or_else(|| "UNKNOWN".to_string())
            }
            _ => String::new(),
        }
    }

    /// Lag between a replica's data and the freshest data in the set.
    pub fn replication_lag(&self, b: &Arc<Backend>) -> Option<Duration> {
        let Kind::ReplicaSet(rs) = &self.kind else { return None };
        if !is_healthy(b) {
            return None;
        }
        let info = rs.info.read();
        let max = info.values().map(|i| i.optime_ms).max()?;
        let idx = self.index_of(b)?;
        let own = info.get(&idx)?.optime_ms;
        Some(Duration::from_millis(max.saturating_sub(own)))
    }

    /// Health of the shard as a whole, for the monitoring endpoint.
    pub fn monitor_status(&self) -> Status {
        match &self.kind {
            Kind::Null => Status::ok(),
            Kind::Sync => Status::ok(),
            Kind::Single => {
                let b = &self.backends[0];
                if b.alive() {
                    Status::ok()
                } else {
                    Status::critical(format!("{} is dead", b.addr()))
                }
            }
            Kind::ReplicaSet(rs) => self.replica_monitor_status(rs),
        }
    }

    fn replica_monitor_status(&self, rs: &ReplicaSetState) -> Status {
        let info = rs.info.read().clone();
        let optime_threshold = match finite(options().max_repl_lag) {
            Some(lag) => max_optime(&info).saturating_sub(lag.as_millis() as u64),
            None => 0,
        };

        let mut ret = Status::ok();
        let mut has_alive_member = false;
        let mut has_primary = false;

        for (idx, backend) in self.backends.iter().enumerate() {
            if !backend.alive() || !is_healthy(backend) {
                ret.merge(Status::warning(format!("{} is dead", backend.addr())));
            } else if !backend.permanent_errmsg().is_empty() {
                ret.merge(Status::critical(format!(
                    "{} is permanently half-alive: {}",
                    backend.addr(),
                    backend.permanent_errmsg()
                )));
            } else if info.get(&idx).map(|i| i.optime_ms < optime_threshold).unwrap_or(true) {
                ret.merge(Status::warning(format!(
                    "{}'s replication lag exceeds threshold",
                    backend.addr()
                )));
            } else {
                has_alive_member = true;
                if is_primary(backend) {
                    has_primary = true;
                }
            }
        }

        if !has_primary {
            let lost_for = rs.lost_primary_since.lock().map(|t| t.elapsed());
            let over_limit = match (finite(options().monitor_no_primary), lost_for) {
                (Some(limit), Some(lost)) => lost >= limit,
                _ => false,
            };
            if over_limit {
                ret.merge(Status::critical(format!(
                    "replica set {} has no primary member for {} min",
                    self.id,
                    lost_for.unwrap_or_default().as_secs() / 60
                )));
            } else {
                ret.merge(Status::warning(format!(
                    "replica set {} has no primary member",
                    self.id
                )));
            }
        }

        if !has_alive_member {
            ret.merge(Status::critical_silent());
        }

        ret
    }

}

fn same_backend(a: Option<&Arc<Backend>>, b: Option<&Arc<Backend>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

fn my_state(b: &Backend) -> i32 {
    b.status()
        .get_document("status")
        .ok()
        .and_then(|s| s.get_i32("myState").ok())
        .unwrap_or(0)
}

fn is_primary(b: &Arc<Backend>) -> bool {
    is_primary_ref(b.as_ref())
}

fn is_primary_ref(b: &Backend) -> bool {
    b.alive() && my_state(b) == 1
}

fn is_healthy(b: &Backend) -> bool {
    b.alive() && matches!(my_state(b), 1 | 2)
}

fn max_optime(info: &HashMap<usize, BackendInfo>) -> u64 {
    info.values().map(|i| i.optime_ms).max().unwrap_or(u64::MAX)
}

/// Looks up `path` inside `doc` and returns the first array element for
/// which `pred` holds.
fn find_in_array<F>(doc: &Document, path: &[&str], pred: F) -> Option<Document>
where
    F: Fn(&Document) -> bool,
{
    let mut cur = doc;
    for key in &path[..path.len() - 1] {
        cur = cur.get_document(key).ok()?;
    }
    let arr = cur.get_array(path[path.len() - 1]).ok()?;
    arr.iter()
        .filter_map(|e| e.as_document())
        .find(|m| pred(m))
        .cloned()
}

/// A tag array matches if any tag object in it is a subset of the
/// backend's tags (object-level: every key/value pair present and equal).
fn tags_match(backend_tags: &Document, criteria: &[Document]) -> bool {
    criteria.is_empty()
        || criteria.iter().any(|tag| {
            tag.iter().all(|(k, v)| backend_tags.get(k) == Some(v))
        })
}

/// Process-wide pool sharing shard instances by connection string.
pub struct ShardPool {
    shards: RwLock<HashMap<String, Arc<Shard>>>,
}

impl ShardPool {
    pub fn new() -> ShardPool {
        ShardPool { shards: RwLock::new(HashMap::new()) }
    }

    pub fn get(&self, id: &str, connstr: &str) -> Result<Arc<Shard>> {
        if let Some(shard) = self.shards.read().get(connstr) {
            return Ok(shard.clone());
        }
        let shard = Shard::make(id, connstr)?;
        let mut shards = self.shards.write();
        Ok(shards.entry(connstr.to_string()).or_insert(shard).clone())
    }

    pub fn find(&self, id: &str) -> Option<Arc<Shard>> {
        self.shards.read().values().find(|s| s.id() == id).cloned()
    }
}

impl Default for ShardPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_string_grammar() {
        let null = Shard::make("null", "").unwrap();
        assert!(matches!(null.kind, Kind::Null));
        assert!(null.backends().is_empty());

        let single = Shard::make("s1", "db1:27018").unwrap();
        assert!(matches!(single.kind, Kind::Single));
        assert_eq!(single.backends().len(), 1);

        let rs = Shard::make("rs0", "rs0/db1:27018,db2:27018,db3:27018").unwrap();
        assert!(matches!(rs.kind, Kind::ReplicaSet(_)));
        assert_eq!(rs.backends().len(), 3);
        assert_eq!(rs.replset_name(), Some("rs0"));
        assert_eq!(rs.ping_queries().len(), 2);

        let sync = Shard::make("cfg", "cfg1:27019,cfg2:27019").unwrap();
        assert!(matches!(sync.kind, Kind::Sync));
        assert!(sync.ping_queries().is_empty());
    }

    #[tokio::test]
    async fn test_null_shard_selects_nothing() {
        let null = Shard::make("null", "").unwrap();
        assert!(null.read_op(0, &Document::new(), None).await.is_none());
        assert!(null.primary().await.is_none());
    }

    #[tokio::test]
    async fn test_shard_pool_shares_by_connstr() {
        let pool = ShardPool::new();
        let a = pool.get("s1", "rs0/db1:27018,db2:27018").unwrap();
        let b = pool.get("s1", "rs0/db1:27018,db2:27018").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(pool.find("s1").is_some());
        assert!(pool.find("nope").is_none());
    }

    #[test]
    fn test_tags_match_subset_rule() {
        let backend = doc! { "dc": "ams", "disk": "ssd", "rack": "b2" };
        assert!(tags_match(&backend, &[]));
        assert!(tags_match(&backend, &[doc! { "dc": "ams" }]));
        assert!(tags_match(&backend, &[doc! { "dc": "ams", "disk": "ssd" }]));
        // any tag object may match, not all
        assert!(tags_match(&backend, &[doc! { "dc": "fra" }, doc! { "disk": "ssd" }]));
        assert!(!tags_match(&backend, &[doc! { "dc": "fra" }]));
        assert!(!tags_match(&backend, &[doc! { "dc": "ams", "disk": "hdd" }]));
    }

    #[tokio::test]
    async fn test_replica_set_monitor_status_without_members() {
        let rs = Shard::make("rs0", "rs0/db1:27018,db2:27018").unwrap();
        let status = rs.monitor_status();
        assert_eq!(status.level(), crate::monitor::Level::Critical);
        assert!(status.messages().iter().any(|m| m.contains("is dead")));
        assert!(status
            .messages()
            .iter()
            .any(|m| m.contains("no primary member")));
    }
}
