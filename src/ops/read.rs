/// The read pipeline: lazy record streams over one or many shards.
///
/// A query resolves to a `DataSource`: nothing (`NullSource`), one
/// synthesized record (`FixedSource`), one open backend cursor
/// (`BackendSource`), or a k-way ordered merge over several backend
/// cursors (`MergeSource`). Streams are pull-driven; `advance` may issue
/// `get-more` I/O, and `close` gently kills server cursors on the happy
/// path only.
use crate::config::{finite, options};
use crate::core::backend::Backend;
use crate::core::connection::Connection;
use crate::core::order::compare_by;
use crate::core::shard::Shard;
use crate::core::{ChunkVersion, Namespace};
use crate::error::{Error, Result};
use crate::ops::generate_source_id;
use crate::topology::VersionedShard;
use crate::wire::messages::{query_flags, Query};
use crate::wire::{self, reply_flags, QueryComposer, Reply};
use crate::auth::{Privilege, Privileges};
use crate::Ctx;
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::future::join_all;
use log::{debug, info};
use rand::Rng;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const KILL_CURSORS_BUDGET: Duration = Duration::from_millis(20);

/// An abstract producer of a lazy, finite sequence of records.
#[async_trait]
pub trait DataSource: Send {
    fn id(&self) -> u64;
    fn set_id(&mut self, id: u64);
    fn pos(&self) -> u64;
    fn at_end(&self) -> bool;
    /// The record under the cursor; only meaningful when `!at_end()`.
    fn current(&self) -> Document;
    /// Reply flags this source contributes.
    fn flags(&self) -> u32 {
        0
    }
    /// Moves to the next record, fetching a new batch when needed.
    async fn advance(&mut self) -> Result<()>;
    /// Releases resources gently (kill-cursors, pool returns). Idempotent:
    /// after the first call no further I/O happens.
    async fn close(&mut self) -> Result<()>;
    fn is_closed(&self) -> bool;
}

/// The empty stream.
pub struct NullSource {
    id: u64,
    closed: bool,
}

impl NullSource {
    pub fn new() -> NullSource {
        NullSource { id: generate_source_id(), closed: false }
    }
}

impl Default for NullSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataSource for NullSource {
    fn id(&self) -> u64 {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
    fn pos(&self) -> u64 {
        0
    }
    fn at_end(&self) -> bool {
        true
    }
    fn current(&self) -> Document {
        Document::new()
    }
    async fn advance(&mut self) -> Result<()> {
        Ok(())
    }
    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// A single synthesized record, used for command replies and errors.
pub struct FixedSource {
    id: u64,
    obj: Document,
    flags: u32,
    consumed: bool,
    closed: bool,
}

impl FixedSource {
    pub fn new(obj: Document) -> FixedSource {
        FixedSource { id: generate_source_id(), obj, flags: 0, consumed: false, closed: false }
    }

    /// An error reply to a plain query, carrying the query-failure flag.
    pub fn query_error(msg: &str) -> Box<dyn DataSource> {
        Box::new(FixedSource {
            id: generate_source_id(),
            obj: doc! { "$err": msg },
            flags: reply_flags::QUERY_FAILURE,
            consumed: false,
            closed: false,
        })
    }

    /// An error reply to a command.
    pub fn cmd_error(code: i32, msg: &str) -> Box<dyn DataSource> {
        Box::new(FixedSource::new(doc! { "ok": 0, "code": code, "errmsg": msg }))
    }
}

#[async_trait]
impl DataSource for FixedSource {
    fn id(&self) -> u64 {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
    fn pos(&self) -> u64 {
        self.consumed as u64
    }
    fn at_end(&self) -> bool {
        self.consumed
    }
    fn current(&self) -> Document {
        self.obj.clone()
    }
    fn flags(&self) -> u32 {
        self.flags
    }
    async fn advance(&mut self) -> Result<()> {
        self.consumed = true;
        Ok(())
    }
    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
    fn is_closed(&self) -> bool {
        self.closed
    }
}

type AttemptResult = Result<(Connection, Reply)>;

/// A handle on one open cursor at one shard.
pub struct BackendSource {
    id: u64,
    pos: u64,
    closed: bool,
    shard: Arc<Shard>,
    version: ChunkVersion,
    msg: Query,
    conn: Option<Connection>,
    cursor_id: u64,
    objects: Vec<Document>,
    current: usize,
}

impl BackendSource {
    /// Selects a backend, issues the query and reads the first batch.
    pub async fn new(shard: Arc<Shard>, version: ChunkVersion, msg: Query) -> Result<BackendSource> {
        let conn = shard
            .read_op(msg.flags, &msg.read_preference(), None)
            .await
            .ok_or_else(|| {
                Error::NoSuitableBackend(format!(
                    "no backend suitable for operation on shard {}",
                    shard.id()
                ))
            })?;

        let mut source = BackendSource {
            id: generate_source_id(),
            pos: 0,
            closed: false,
            shard,
            version,
            msg,
            conn: Some(conn),
            cursor_id: 0,
            objects: Vec::new(),
            current: 0,
        };
        debug!("requesting initial portion of data");
        source.talk(false).await?;
        Ok(source)
    }

    /// The namespace used for the versioning handshake: commands address
    /// the collection named by their first element.
    fn versioned_ns(&self) -> Namespace {
        if self.msg.ns.collection() == "$cmd" {
            if let Some((_, Bson::String(coll))) = self.msg.query.iter().next() {
                return Namespace::new(self.msg.ns.db(), coll);
            }
        }
        self.msg.ns.clone()
    }

    fn slave_ok(&self) -> bool {
        let pref = self.msg.read_preference();
        pref.get_str("mode").map(|m| m != "primary").unwrap_or(false)
            || (pref.is_empty() && self.msg.flags & query_flags::SLAVE_OK != 0)
    }

    /// Composes the query positioned at the current cursor position, so a
    /// retransmitted attempt resumes where the stream stands.
    fn make_query(&self, req_id: u32) -> Vec<u8> {
        let mut q = QueryComposer::new(self.msg.ns.clone(), self.msg.query.clone())
            .msg_id(req_id)
            .skip(self.pos as i32)
            .batch_size(if self.msg.n_to_return == 1 { 1 } else { 0 })
            .field_selector(self.msg.field_selector.clone());
        if self.slave_ok() {
            q = q.slave_ok();
        }
        q.data()
    }

    fn install(&mut self, conn: Connection, reply: Reply) {
        self.conn = Some(conn);
        self.objects = reply.documents;
        self.current = 0;
        self.cursor_id = reply.cursor_id;
    }

    fn spawn_attempt(
        conn: Connection,
        ns: Namespace,
        version: ChunkVersion,
        payload: Vec<u8>,
        req_id: u32,
    ) -> JoinHandle<AttemptResult> {
        tokio::spawn(async move {
            let mut conn = conn;
            debug!("starting communicating with endpoint {}", conn.endpoint().addr());
            conn.establish(&ns, &version, &payload).await?;
            let reply = wire::read_reply(conn.stream(), req_id).await?;
            debug!(
                "returned {} objects and cursor {}",
                reply.documents.len(),
                reply.cursor_id
            );
            Ok((conn, reply))
        })
    }

    /// Classifies a failed attempt: lost primaries and dead transports are
    /// signalled to the shard; client errors pass through untouched.
    async fn note_failure(&self, e: &Error, backend: Option<&Arc<Backend>>) {
        match e {
            Error::NotMaster => self.shard.lost_master(),
            e if e.is_client_error() => {}
            _ => {
                if let Some(b) = backend {
                    self.shard.failed(b).await;
                }
            }
        }
    }

    /// One round-trip with the shard, hedged: if the first attempt stays
    /// silent past the retransmit trigger, the same request is issued to
    /// another backend and the first completion decides.
    async fn talk(&mut self, get_more: bool) -> Result<()> {
        let read_pref = self.msg.read_preference();
        let ms_override = |key: &str, dflt: Duration| -> Duration {
            match read_pref.get(key) {
                Some(Bson::Int32(n)) => Duration::from_millis(*n as u64),
                Some(Bson::Int64(n)) => Duration::from_millis(*n as u64),
                _ => dflt,
            }
        };
        let retransmit = ms_override("retransmitMs", options().read_retransmit);
        let timeout = ms_override("timeoutMs", options().read_timeout);
        let deadline = finite(timeout).map(|d| Instant::now() + d);
        let started = Instant::now();

        let req_id: u32 = rand::thread_rng().gen();
        let Some(conn) = self.conn.take() else {
            return Err(Error::backend_internal("cursor lost its connection"));
        };
        let first_backend = conn.backend();
        let payload = if get_more {
            wire::get_more_msg(req_id, &self.msg.ns, 0, self.cursor_id)
        } else {
            self.make_query(req_id)
        };
        let mut t1 = Self::spawn_attempt(
            conn,
            self.versioned_ns(),
            self.version.clone(),
            payload,
            req_id,
        );

        // Phase one: wait for the retransmit trigger.
        let first_window = match (finite(retransmit), deadline) {
            (Some(r), Some(d)) => Some(r.min(d.saturating_duration_since(Instant::now()))),
            (Some(r), None) => Some(r),
            (None, Some(d)) => Some(d.saturating_duration_since(Instant::now())),
            (None, None) => None,
        };
        let first = match first_window {
            Some(w) => tokio::time::timeout(w, &mut t1).await.ok(),
            None => Some((&mut t1).await),
        };

        let t1_pending = first.is_none();
        let mut first_err: Option<Error> = None;
        if let Some(joined) = first {
            match flatten(joined) {
                Ok((conn, reply)) => {
                    self.install(conn, reply);
                    debug!("query took {} ms", started.elapsed().as_millis());
                    return Ok(());
                }
                Err(e) => {
                    self.note_failure(&e, first_backend.as_ref()).await;
                    if e.is_client_error() && !matches!(e, Error::NotMaster) {
                        return Err(e);
                    }
                    // not-master and transport failures fall through to the
                    // hedge, which will pick a different backend
                    first_err = Some(e);
                }
            }
        }

        // Phase two: hedge to another backend and let the first completion
        // decide. A retransmitted attempt always re-sends the positioned
        // query, never a get-more (the server cursor lives on the first
        // backend only).
        let mut t2: Option<JoinHandle<AttemptResult>> = None;
        let mut second_backend = None;
        if finite(retransmit).is_some() {
            if let Some(conn2) = self
                .shard
                .read_op(self.msg.flags, &read_pref, first_backend.as_ref())
                .await
            {
                debug!("retransmitting query to {}", conn2.endpoint().addr());
                second_backend = conn2.backend();
                let req_id2: u32 = rand::thread_rng().gen();
                let payload2 = self.make_query(req_id2);
                t2 = Some(Self::spawn_attempt(
                    conn2,
                    self.versioned_ns(),
                    self.version.clone(),
                    payload2,
                    req_id2,
                ));
            }
        }

        if !t1_pending && t2.is_none() {
            // first attempt failed and there is nowhere to retransmit
            return Err(first_err.unwrap_or_else(|| {
                Error::Timeout(format!("talking to shard {}", self.shard.connection_string()))
            }));
        }

        // First completion decides; the loser keeps running detached and
        // its result is discarded.
        let timed_out = || {
            Error::Timeout(format!("talking to shard {}", self.shard.connection_string()))
        };
        let decision: (AttemptResult, bool) = {
            let deadline_timer = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => futures::future::pending::<()>().await,
                }
            };
            tokio::pin!(deadline_timer);

            match &mut t2 {
                Some(h2) if t1_pending => {
                    tokio::select! {
                        joined = &mut t1 => (flatten(joined), true),
                        joined = h2 => (flatten(joined), false),
                        _ = &mut deadline_timer => return Err(timed_out()),
                    }
                }
                Some(h2) => {
                    tokio::select! {
                        joined = h2 => (flatten(joined), false),
                        _ = &mut deadline_timer => return Err(timed_out()),
                    }
                }
                None => {
                    tokio::select! {
                        joined = &mut t1 => (flatten(joined), true),
                        _ = &mut deadline_timer => return Err(timed_out()),
                    }
                }
            }
        };

        match decision {
            (Ok((conn, reply)), _) => {
                self.install(conn, reply);
                debug!("query took {} ms", started.elapsed().as_millis());
                Ok(())
            }
            (Err(e), from_first) => {
                let backend = if from_first { first_backend } else { second_backend };
                self.note_failure(&e, backend.as_ref()).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl DataSource for BackendSource {
    fn id(&self) -> u64 {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
    fn pos(&self) -> u64 {
        self.pos
    }
    fn at_end(&self) -> bool {
        self.cursor_id == 0 && self.current >= self.objects.len()
    }
    fn current(&self) -> Document {
        self.objects.get(self.current).cloned().unwrap_or_default()
    }

    async fn advance(&mut self) -> Result<()> {
        if self.at_end() {
            return Ok(());
        }
        self.pos += 1;
        self.current += 1;
        if self.current >= self.objects.len() && self.cursor_id != 0 {
            debug!("need to request more data");
            self.talk(true).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let Some(mut conn) = self.conn.take() else { return Ok(()) };
        if self.cursor_id != 0 {
            let kill = wire::kill_cursors_msg(self.cursor_id);
            let attempt = async {
                let s = conn.stream();
                s.write_all(&kill).await?;
                s.flush().await?;
                Ok::<_, Error>(())
            };
            match tokio::time::timeout(KILL_CURSORS_BUDGET, attempt).await {
                Ok(Ok(())) => {}
                // could not kill in budget: close the socket instead of
                // returning it to the pool
                _ => return Ok(()),
            }
        }
        conn.release().await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

fn flatten(joined: std::result::Result<AttemptResult, tokio::task::JoinError>) -> AttemptResult {
    match joined {
        Ok(r) => r,
        Err(e) => Err(Error::backend_internal(format!("query task panicked: {e}"))),
    }
}

/// A k-way merge over several backend cursors under the query's
/// `$orderby` document.
pub struct MergeSource {
    id: u64,
    pos: u64,
    closed: bool,
    order_by: Document,
    partial_ok: bool,
    sources: Vec<BackendSource>,
}

impl MergeSource {
    /// Opens one backend cursor per shard in parallel.
    pub async fn new(msg: Query, shards: Vec<VersionedShard>) -> Result<MergeSource> {
        let order_by = msg.order_by();
        let partial_ok = msg.flags & query_flags::PARTIAL != 0;

        let opened = join_all(shards.into_iter().map(|vs| {
            let msg = msg.clone();
            BackendSource::new(vs.shard, vs.version, msg)
        }))
        .await;

        let mut sources = Vec::new();
        for result in opened {
            match result {
                Ok(src) => {
                    if src.at_end() {
                        let mut src = src;
                        let _ = src.close().await;
                    } else {
                        sources.push(src);
                    }
                }
                Err(e) if partial_ok && !e.is_client_error() => {
                    debug!("partial query drops a shard: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(MergeSource {
            id: generate_source_id(),
            pos: 0,
            closed: false,
            order_by,
            partial_ok,
            sources,
        })
    }

    fn min_idx(&self) -> Option<usize> {
        self.sources
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.at_end())
            .min_by(|(_, a), (_, b)| compare_by(&a.current(), &b.current(), &self.order_by))
            .map(|(i, _)| i)
    }
}

#[async_trait]
impl DataSource for MergeSource {
    fn id(&self) -> u64 {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
    fn pos(&self) -> u64 {
        self.pos
    }
    fn at_end(&self) -> bool {
        self.min_idx().is_none()
    }
    fn current(&self) -> Document {
        self.min_idx()
            .map(|i| self.sources[i].current())
            .unwrap_or_default()
    }

    async fn advance(&mut self) -> Result<()> {
        let Some(i) = self.min_idx() else { return Ok(()) };
        self.pos += 1;

        match self.sources[i].advance().await {
            Ok(()) => {
                if self.sources[i].at_end() {
                    let mut done = self.sources.swap_remove(i);
                    done.close().await?;
                }
                Ok(())
            }
            Err(e) if self.partial_ok && !e.is_client_error() => {
                debug!("partial query drops a shard mid-stream: {e}");
                self.sources.swap_remove(i);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_err = None;
        for src in &mut self.sources {
            if let Err(e) = src.close().await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

const ALLOWED_QUERY_FLAGS: u32 = query_flags::SLAVE_OK
    | query_flags::EXHAUST
    | query_flags::NO_TIMEOUT
    | query_flags::PARTIAL;

/// Builds a data source for one client query, re-routing on stale config
/// and lost primaries up to three times.
pub async fn query(
    ctx: &Ctx,
    msg: &Query,
    privileges: &Privileges,
) -> Result<Box<dyn DataSource>> {
    if msg.flags & !ALLOWED_QUERY_FLAGS != 0 {
        return Err(Error::bad_request("specified flags are not supported"));
    }
    if msg.properties.get("$explain").is_some() {
        return Err(Error::bad_request("$explain is not supported"));
    }

    if msg.ns.collection() == "system.users" {
        privileges.require(msg.ns.db(), Privilege::UserAdmin)?;
    } else {
        privileges.require(msg.ns.db(), Privilege::Read)?;
    }

    let mut last = Error::NoShardConfig;
    for _ in 0..3 {
        let snapshot = ctx.topology.get()?;
        let shards = snapshot.find(&msg.ns, &msg.criteria);

        let attempt: Result<Box<dyn DataSource>> = match shards.len() {
            0 => {
                debug!("query has no shards to run on");
                Ok(Box::new(NullSource::new()))
            }
            1 => {
                debug!("query goes to a single shard");
                let vs = shards.into_iter().next().unwrap();
                BackendSource::new(vs.shard, vs.version, msg.clone())
                    .await
                    .map(|s| Box::new(s) as Box<dyn DataSource>)
            }
            n => {
                debug!("query goes to {n} shards");
                MergeSource::new(msg.clone(), shards)
                    .await
                    .map(|s| Box::new(s) as Box<dyn DataSource>)
            }
        };

        match attempt {
            Ok(source) => return Ok(source),
            Err(Error::ShardConfigStale(reason)) => {
                info!("{reason}; updating config");
                let _ = ctx.topology.update().await;
                last = Error::ShardConfigStale(reason);
            }
            Err(Error::NotMaster) => {
                info!("not master; re-executing query");
                last = Error::NotMaster;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last)
}

/// Runs a command-shaped query on one shard and returns its only record.
async fn run_command(vs: VersionedShard, msg: &Query) -> Result<Document> {
    let mut source = BackendSource::new(vs.shard, vs.version, msg.clone()).await?;
    if source.at_end() {
        return Err(Error::backend_internal("empty command reply"));
    }
    let ret = source.current();
    source.close().await?;
    Ok(ret)
}

/// Shared shape of `count` and `distinct`: run the command on every
/// targeted shard in parallel, then reduce the replies.
async fn aggregation<F>(ctx: &Ctx, msg: &Query, privileges: &Privileges, reduce: F) -> Result<Document>
where
    F: Fn(&[Document], &mut Document),
{
    privileges.require(msg.ns.db(), Privilege::Read)?;

    let coll = msg
        .query
        .iter()
        .next()
        .and_then(|(_, v)| v.as_str())
        .ok_or_else(|| Error::bad_request("collection name required"))?;
    let ns = Namespace::new(msg.ns.db(), coll);
    let criteria = msg.query.get_document("query").cloned().unwrap_or_default();

    let mut last = Error::NoShardConfig;
    for _ in 0..3 {
        let snapshot = ctx.topology.get()?;
        let shards = snapshot.find(&ns, &criteria);

        let attempt: Result<Document> = if shards.is_empty() {
            let mut b = Document::new();
            reduce(&[], &mut b);
            b.insert("ok", 1);
            Ok(b)
        } else if shards.len() == 1 {
            run_command(shards.into_iter().next().unwrap(), msg).await
        } else {
            let replies =
                join_all(shards.into_iter().map(|vs| run_command(vs, msg))).await;
            (|| {
                let mut rets = Vec::new();
                for r in replies {
                    let r = r?;
                    if r.get_i32("ok").unwrap_or(0) != 1
                        && r.get_f64("ok").unwrap_or(0.0) != 1.0
                    {
                        let msg = r.get_str("errmsg").unwrap_or("unknown error");
                        return Err(Error::QueryFailure(msg.to_string()));
                    }
                    rets.push(r);
                }
                let mut b = Document::new();
                reduce(&rets, &mut b);
                b.insert("ok", 1);
                Ok(b)
            })()
        };

        match attempt {
            Ok(doc) => return Ok(doc),
            Err(Error::ShardConfigStale(reason)) => {
                info!("{reason}; updating config");
                let _ = ctx.topology.update().await;
                last = Error::ShardConfigStale(reason);
            }
            Err(Error::NotMaster) => {
                info!("not master; re-executing command");
                last = Error::NotMaster;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last)
}

/// `count`: sums the per-shard `n`.
pub async fn count(ctx: &Ctx, msg: &Query, privileges: &Privileges) -> Result<Document> {
    aggregation(ctx, msg, privileges, |objs, b| {
        let n: i64 = objs
            .iter()
            .map(|o| match o.get("n") {
                Some(Bson::Int32(n)) => *n as i64,
                Some(Bson::Int64(n)) => *n,
                Some(Bson::Double(d)) => *d as i64,
                _ => 0,
            })
            .sum();
        b.insert("n", n);
    })
    .await
}

/// `distinct`: unions the per-shard `values` arrays by value equality.
pub async fn distinct(ctx: &Ctx, msg: &Query, privileges: &Privileges) -> Result<Document> {
    aggregation(ctx, msg, privileges, |objs, b| {
        let mut values: Vec<Bson> = objs
            .iter()
            .filter_map(|o| o.get_array("values").ok())
            .flatten()
            .cloned()
            .collect();
        values.sort_by(|a, b| crate::core::order::compare(Some(a), Some(b)));
        values.dedup_by(|a, b| {
            crate::core::order::compare(Some(a), Some(b)) == Ordering::Equal
        });
        b.insert("values", values);
    })
    .await
}

/// Fetches every database's `system.users` for the credentials cache.
pub async fn fetch_credentials(ctx: &Ctx) -> Result<Document> {
    debug!("fetching credentials cache");
    let snapshot = ctx.topology.get()?;
    let read_pref = crate::auth::CredentialsCache::fetch_read_preference();

    let mut ret = Document::new();
    for db in snapshot.databases() {
        debug!("fetching credentials for database {}", db.name());
        let q = Query::internal(
            Namespace::new(db.name(), "system.users"),
            doc! { "$query": {}, "$readPreference": read_pref.clone() },
        );
        let mut source = query(ctx, &q, &Privileges::root()).await?;
        let mut users = Vec::new();
        while !source.at_end() {
            users.push(Bson::Document(source.current()));
            source.advance().await?;
        }
        source.close().await?;
        ret.insert(db.name(), users);
    }
    debug!("done fetching credentials cache");
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_source_is_empty_and_closable_twice() {
        let mut s = NullSource::new();
        assert!(s.at_end());
        assert_eq!(s.pos(), 0);
        s.close().await.unwrap();
        assert!(s.is_closed());
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_fixed_source_yields_once() {
        let mut s = FixedSource::new(doc! { "ok": 1 });
        assert!(!s.at_end());
        assert_eq!(s.current(), doc! { "ok": 1 });
        s.advance().await.unwrap();
        assert!(s.at_end());
    }

    #[tokio::test]
    async fn test_error_sources_carry_flags() {
        let s = FixedSource::query_error("boom");
        assert_eq!(s.flags(), reply_flags::QUERY_FAILURE);
        assert_eq!(s.current().get_str("$err").unwrap(), "boom");

        let s = FixedSource::cmd_error(8, "bad");
        assert_eq!(s.flags(), 0);
        assert_eq!(s.current().get_i32("ok").unwrap(), 0);
        assert_eq!(s.current().get_i32("code").unwrap(), 8);
    }

    #[test]
    fn test_source_ids_are_unique() {
        let a = NullSource::new();
        let b = NullSource::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_allowed_query_flags() {
        assert_eq!(query_flags::TAILABLE & ALLOWED_QUERY_FLAGS, 0);
        assert_eq!(query_flags::AWAIT_DATA & ALLOWED_QUERY_FLAGS, 0);
        assert_ne!(query_flags::PARTIAL & ALLOWED_QUERY_FLAGS, 0);
    }
}
