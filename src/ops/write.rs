/// The write pipeline: classify sub-operations by sharding-key
/// containment, compose parallel/sequential operation trees, perform them
/// with retry, and fold the acknowledgements.
///
/// A write that fans out to N shards is N independent writes: failures are
/// reported through the merged acknowledgement but never rolled back.
use crate::config::{finite, options};
use crate::core::connection::Connection;
use crate::core::Namespace;
use crate::error::{Error, Result};
use crate::topology::{Snapshot, VersionedShard};
use crate::wire::messages::{Delete, DeleteSub, Insert, Update, UpdateSub};
use crate::wire::{self, MsgBuilder, Opcode, QueryComposer};
use crate::auth::{Privilege, Privileges};
use crate::Ctx;
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::future::join_all;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

const ACK_REQ_ID: u32 = 0x0A4B_4341; // "ACK\n"
const PRIMARY_RETRY_PAUSE: Duration = Duration::from_millis(500);
const NOT_MASTER_CODE: i32 = 10058;

/// An abstract unit of work returning a single acknowledgement document.
#[async_trait]
pub trait WriteOperation: Send {
    /// Executes the write. Must be called before `acknowledge`.
    async fn perform(&mut self) -> Result<()>;

    /// Whether `getLastError` may re-acknowledge this operation later.
    fn is_acknowledgable(&self) -> bool;

    /// Acknowledgement under `concern`; the cached result is reused when
    /// the concern is equivalent to the one last used.
    async fn acknowledge(&mut self, concern: &Document) -> Result<Document>;

    /// The most recent acknowledgement.
    fn last_status(&self) -> Document;

    /// Releases held connections. Never cancelled mid-acknowledgement.
    async fn finish(&mut self);

    /// Variant tag for logging.
    fn kind(&self) -> &'static str;
}

/// Compares two write concerns:
/// - the `getLastError` key does not mean anything,
/// - a missing `w` equals `w: 1`,
/// - `wtimeout` is never equivalent to anything,
/// - all other keys must match.
pub fn are_concerns_equivalent(w1: &Document, w2: &Document) -> bool {
    let mut seen: HashMap<String, Bson> = HashMap::new();
    let mut c1: Option<Bson> = None;
    let mut c2: Option<Bson> = None;

    for (k, v) in w1 {
        match k.to_lowercase().as_str() {
            "getlasterror" => {}
            "w" => c1 = Some(v.clone()),
            "wtimeout" => return false,
            name => {
                seen.insert(name.to_string(), v.clone());
            }
        }
    }
    for (k, v) in w2 {
        match k.to_lowercase().as_str() {
            "getlasterror" => {}
            "w" => c2 = Some(v.clone()),
            "wtimeout" => return false,
            name => match seen.remove(name) {
                Some(prev) if prev == *v => {}
                _ => return false,
            },
        }
    }
    if !seen.is_empty() {
        return false;
    }

    match (&c1, &c2) {
        (Some(Bson::String(a)), Some(Bson::String(b))) => a == b,
        (Some(Bson::String(_)), _) | (_, Some(Bson::String(_))) => false,
        _ => w_number(&c1) == w_number(&c2),
    }
}

fn w_number(w: &Option<Bson>) -> i64 {
    match w {
        Some(Bson::Int32(n)) => *n as i64,
        Some(Bson::Int64(n)) => *n,
        Some(Bson::Double(d)) => *d as i64,
        _ => 1,
    }
}

/// The default reducer over child acknowledgements: sums `n`, keeps the
/// first non-null error with its code, ORs the flags, takes the max of
/// the wait times.
pub fn default_ack_merger(rets: &[Document]) -> Document {
    if rets.is_empty() {
        return Document::new();
    }
    if rets.len() == 1 {
        return rets[0].clone();
    }

    let mut err: Option<Bson> = None;
    let mut code: Option<Bson> = None;
    let mut n: i64 = 0;
    let mut has_updated_existing = false;
    let mut updated_existing = false;
    let mut upserted: Option<Bson> = None;
    let mut wtimeout = false;
    let mut waited: i32 = 0;
    let mut wtime: i32 = 0;

    for ret in rets {
        for (k, v) in ret {
            match k.as_str() {
                "err" => {
                    if err.is_none() || matches!(err, Some(Bson::Null)) {
                        err = Some(v.clone());
                    }
                }
                "code" => {
                    if code.is_none() {
                        code = Some(v.clone());
                    }
                }
                "n" => n += w_number(&Some(v.clone())),
                "updatedExisting" => {
                    has_updated_existing = true;
                    updated_existing = updated_existing || v.as_bool().unwrap_or(false);
                }
                "upserted" => {
                    if upserted.is_none() {
                        upserted = Some(v.clone());
                    }
                }
                "wtimeout" => wtimeout = wtimeout || v.as_bool().unwrap_or(false),
                "waited" => waited = waited.max(v.as_i32().unwrap_or(0)),
                "wtime" => wtime = wtime.max(v.as_i32().unwrap_or(0)),
                _ => {}
            }
        }
    }

    let failed = matches!(&err, Some(e) if !matches!(e, Bson::Null));
    let mut b = Document::new();
    b.insert("ok", if failed { 0 } else { 1 });
    if let Some(err) = err {
        b.insert("err", err);
    }
    if let Some(code) = code {
        b.insert("code", code);
    }
    if n > i32::MAX as i64 {
        b.insert("n", n);
    } else {
        b.insert("n", n as i32);
    }
    if has_updated_existing {
        b.insert("updatedExisting", updated_existing);
    }
    if let Some(upserted) = upserted {
        b.insert("upserted", upserted);
    }
    if wtimeout {
        b.insert("wtimeout", true);
    }
    if waited != 0 {
        b.insert("waited", waited);
    }
    if wtime != 0 {
        b.insert("wtime", wtime);
    }
    b
}

fn validate_ack(ack: Document) -> Result<Document> {
    if !ack.contains_key("ok") || !ack.contains_key("n") {
        return Err(Error::backend_internal("bad write operation status"));
    }
    Ok(ack)
}

/// Acknowledgement cache shared by every operation variant.
#[derive(Default)]
struct AckCache {
    last_concern: Document,
    last_status: Document,
}

impl AckCache {
    /// The cached status, unless the concern forces re-acknowledgement.
    fn lookup(&self, concern: &Document) -> Option<Document> {
        if concern.contains_key("wtimeout")
            || self.last_status.is_empty()
            || !are_concerns_equivalent(concern, &self.last_concern)
        {
            None
        } else {
            Some(self.last_status.clone())
        }
    }

    fn store(&mut self, concern: &Document, status: Document) -> Document {
        self.last_concern = concern.clone();
        self.last_status = status.clone();
        status
    }
}

enum WritePayload {
    /// Legacy per-opcode message; acknowledged by a `getLastError` command.
    Legacy(Vec<u8>),
    /// Command-style batch carrying its write concern inline.
    Command(Document),
    /// `findAndModify`, a single-shard atomic command.
    FindModify(Document),
}

/// One sub-operation bound to one shard.
pub struct BackendWrite {
    vs: VersionedShard,
    ns: Namespace,
    payload: WritePayload,
    conn: Option<Connection>,
    ack: AckCache,
}

impl BackendWrite {
    fn legacy(vs: VersionedShard, ns: Namespace, msg: Vec<u8>) -> BackendWrite {
        BackendWrite { vs, ns, payload: WritePayload::Legacy(msg), conn: None, ack: AckCache::default() }
    }

    fn command(vs: VersionedShard, ns: Namespace, cmd: Document) -> BackendWrite {
        BackendWrite { vs, ns, payload: WritePayload::Command(cmd), conn: None, ack: AckCache::default() }
    }

    pub fn find_modify(vs: VersionedShard, ns: Namespace, cmd: Document) -> BackendWrite {
        BackendWrite { vs, ns, payload: WritePayload::FindModify(cmd), conn: None, ack: AckCache::default() }
    }

    /// One attempt over one connection; returns the connection for reuse
    /// along with the resulting status document.
    async fn do_perform(&mut self, mut conn: Connection) -> Result<(Connection, Document)> {
        let cmd_ns = Namespace::new(self.ns.db(), "$cmd");
        match &self.payload {
            WritePayload::Legacy(msg) => {
                debug!("issuing legacy write to {}", conn.endpoint().addr());
                conn.establish(&self.ns, &self.vs.version, msg).await?;
                let concern = doc! { "getLastError": 1 };
                let ack_msg = QueryComposer::new(cmd_ns, concern.clone())
                    .msg_id(ACK_REQ_ID)
                    .batch_size(1)
                    .data();
                let s = conn.stream();
                s.write_all(&ack_msg).await?;
                s.flush().await?;
                let reply = wire::read_reply(conn.stream(), ACK_REQ_ID).await?;
                let ack = validate_ack(first_doc(reply.documents)?)?;
                Ok((conn, self.ack.store(&concern, ack)))
            }
            WritePayload::Command(cmd) => {
                debug!("issuing write command to {}", conn.endpoint().addr());
                let payload = QueryComposer::new(cmd_ns, cmd.clone()).data();
                conn.establish(&self.ns, &self.vs.version, &payload).await?;
                let reply = wire::read_reply(conn.stream(), 0).await?;
                let concern = cmd
                    .get_document("writeConcern")
                    .cloned()
                    .unwrap_or_else(|_| doc! { "w": 1 });
                let ack = validate_ack(first_doc(reply.documents)?)?;
                Ok((conn, self.ack.store(&concern, ack)))
            }
            WritePayload::FindModify(cmd) => {
                debug!("issuing findAndModify to {}", conn.endpoint().addr());
                let payload = QueryComposer::new(cmd_ns, cmd.clone()).data();
                conn.establish(&self.ns, &self.vs.version, &payload).await?;
                let reply = wire::read_reply(conn.stream(), 0).await?;
                let ack = first_doc(reply.documents)?;
                Ok((conn, self.ack.store(&Document::new(), ack)))
            }
        }
    }
}

fn first_doc(docs: Vec<Document>) -> Result<Document> {
    docs.into_iter()
        .next()
        .ok_or_else(|| Error::backend_internal("empty reply to write"))
}

fn ack_err_is_not_master(ack: &Document) -> bool {
    match ack.get("err") {
        None | Some(Bson::Null) => false,
        Some(_) => ack.get_i32("code").unwrap_or(0) == NOT_MASTER_CODE,
    }
}

#[async_trait]
impl WriteOperation for BackendWrite {
    /// The write-attempt state machine: acquire the shard's primary, send,
    /// await the acknowledgement; `not master` re-elects and retries,
    /// timeouts cancel and retry against a refreshed primary, transport
    /// failures mark the backend dead. All bounded by `write_timeout`.
    async fn perform(&mut self) -> Result<()> {
        let deadline = finite(options().write_timeout).map(|d| Instant::now() + d);
        let expired =
            |deadline: &Option<Instant>| deadline.map(|d| Instant::now() >= d).unwrap_or(false);

        let mut attempt = 0usize;
        while !expired(&deadline) {
            let Some(conn) = self.vs.shard.primary().await else {
                tokio::time::sleep(PRIMARY_RETRY_PAUSE).await;
                attempt += 1;
                continue;
            };
            let backend = conn.backend();

            let window = match (finite(options().write_retransmit), deadline) {
                (Some(r), Some(d)) => Some(r.min(d.saturating_duration_since(Instant::now()))),
                (Some(r), None) => Some(r),
                (None, Some(d)) => Some(d.saturating_duration_since(Instant::now())),
                (None, None) => None,
            };

            let outcome = match window {
                Some(w) => tokio::time::timeout(w, self.do_perform(conn)).await,
                None => Ok(self.do_perform(conn).await),
            };

            match outcome {
                Ok(Ok((conn, status))) => {
                    if !ack_err_is_not_master(&status) {
                        self.conn = Some(conn);
                        return Ok(());
                    }
                    self.vs.shard.lost_master();
                    if attempt != 0 {
                        tokio::time::sleep(PRIMARY_RETRY_PAUSE).await;
                    }
                }
                Ok(Err(Error::NotMaster)) => {
                    self.vs.shard.lost_master();
                    if attempt != 0 {
                        tokio::time::sleep(PRIMARY_RETRY_PAUSE).await;
                    }
                }
                Ok(Err(e)) if e.is_client_error() => return Err(e),
                Ok(Err(e)) => {
                    debug!("write attempt failed: {e}");
                    if let Some(b) = &backend {
                        self.vs.shard.failed(b).await;
                    }
                }
                // the in-flight attempt is dropped: a cancelled connection
                // is closed, never pooled
                Err(_elapsed) => {
                    warn!("timeout while writing to shard {}", self.vs.shard.id());
                    if let Some(b) = &backend {
                        self.vs.shard.failed(b).await;
                    }
                }
            }
            attempt += 1;
        }

        Err(Error::NoSuitableBackend(format!(
            "cannot communicate with primary for shard {}",
            self.vs.shard.connection_string()
        )))
    }

    fn is_acknowledgable(&self) -> bool {
        matches!(self.payload, WritePayload::Legacy(_))
    }

    async fn acknowledge(&mut self, concern: &Document) -> Result<Document> {
        if let Some(cached) = self.ack.lookup(concern) {
            return Ok(cached);
        }
        match &self.payload {
            WritePayload::Legacy(_) => {}
            WritePayload::Command(_) => {
                return Err(Error::bad_request("cannot issue getLastError after a write command"))
            }
            WritePayload::FindModify(_) => {
                return Err(Error::bad_request("cannot issue getLastError after findAndModify"))
            }
        }

        let Some(conn) = self.conn.as_mut() else {
            return Ok(self.ack.last_status.clone());
        };
        let msg = QueryComposer::new(Namespace::new(self.ns.db(), "$cmd"), concern.clone())
            .msg_id(ACK_REQ_ID)
            .batch_size(1)
            .data();
        let s = conn.stream();
        s.write_all(&msg).await?;
        s.flush().await?;
        let reply = wire::read_reply(conn.stream(), ACK_REQ_ID).await?;
        let ack = validate_ack(first_doc(reply.documents)?)?;
        Ok(self.ack.store(concern, ack))
    }

    fn last_status(&self) -> Document {
        self.ack.last_status.clone()
    }

    async fn finish(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.release().await;
        }
    }

    fn kind(&self) -> &'static str {
        "backend"
    }
}

/// A no-op with a pre-canned acknowledgement.
pub struct NullWrite {
    ack: Document,
}

impl NullWrite {
    pub fn new(ack: Document) -> NullWrite {
        NullWrite { ack }
    }
}

#[async_trait]
impl WriteOperation for NullWrite {
    async fn perform(&mut self) -> Result<()> {
        Ok(())
    }
    fn is_acknowledgable(&self) -> bool {
        true
    }
    async fn acknowledge(&mut self, _concern: &Document) -> Result<Document> {
        Ok(self.ack.clone())
    }
    fn last_status(&self) -> Document {
        self.ack.clone()
    }
    async fn finish(&mut self) {}
    fn kind(&self) -> &'static str {
        "null"
    }
}

/// Carries an error as its acknowledgement.
pub struct FailedWrite {
    err: Document,
}

impl FailedWrite {
    pub fn new(errmsg: &str) -> FailedWrite {
        FailedWrite { err: doc! { "errmsg": errmsg, "err": errmsg, "ok": 0 } }
    }
}

#[async_trait]
impl WriteOperation for FailedWrite {
    async fn perform(&mut self) -> Result<()> {
        Ok(())
    }
    fn is_acknowledgable(&self) -> bool {
        true
    }
    async fn acknowledge(&mut self, _concern: &Document) -> Result<Document> {
        Ok(self.err.clone())
    }
    fn last_status(&self) -> Document {
        self.err.clone()
    }
    async fn finish(&mut self) {}
    fn kind(&self) -> &'static str {
        "failed"
    }
}

type AckMerger = Box<dyn Fn(&[Document]) -> Document + Send + Sync>;
type StopPredicate = Box<dyn Fn(&Document) -> bool + Send + Sync>;

fn effective_concern(concern: Document) -> Document {
    if concern.is_empty() {
        doc! { "getLastError": 1 }
    } else {
        concern
    }
}

/// Concurrent fan-out with a merged acknowledgement.
pub struct ParallelWrite {
    ops: Vec<Box<dyn WriteOperation>>,
    commenced: usize,
    write_concern: Document,
    merge: AckMerger,
    ack: AckCache,
}

impl ParallelWrite {
    pub fn new(write_concern: Document) -> ParallelWrite {
        ParallelWrite {
            ops: Vec::new(),
            commenced: 0,
            write_concern: effective_concern(write_concern),
            merge: Box::new(default_ack_merger),
            ack: AckCache::default(),
        }
    }

    pub fn add(&mut self, op: Box<dyn WriteOperation>) {
        self.ops.push(op);
    }
}

#[async_trait]
impl WriteOperation for ParallelWrite {
    async fn perform(&mut self) -> Result<()> {
        self.commenced = self.ops.len();
        let results = join_all(self.ops.iter_mut().map(|op| op.perform())).await;
        for r in results {
            r?;
        }
        let acks: Vec<Document> = self.ops.iter().map(|op| op.last_status()).collect();
        let merged = (self.merge)(&acks);
        let concern = self.write_concern.clone();
        self.ack.store(&concern, merged);
        Ok(())
    }

    fn is_acknowledgable(&self) -> bool {
        self.ops.iter().all(|op| op.is_acknowledgable())
    }

    async fn acknowledge(&mut self, concern: &Document) -> Result<Document> {
        if let Some(cached) = self.ack.lookup(concern) {
            return Ok(cached);
        }
        let mut acks = Vec::with_capacity(self.commenced);
        for op in &mut self.ops[..self.commenced] {
            acks.push(op.acknowledge(concern).await?);
        }
        let merged = (self.merge)(&acks);
        Ok(self.ack.store(concern, merged))
    }

    fn last_status(&self) -> Document {
        self.ack.last_status.clone()
    }

    async fn finish(&mut self) {
        for op in &mut self.ops[..self.commenced] {
            op.finish().await;
        }
    }

    fn kind(&self) -> &'static str {
        "parallel"
    }
}

/// Ordered fan-out with an optional short-circuit predicate; always stops
/// at the first erroring child.
pub struct SequentialWrite {
    ops: Vec<Box<dyn WriteOperation>>,
    commenced: usize,
    write_concern: Document,
    merge: AckMerger,
    stop: Option<StopPredicate>,
    ack: AckCache,
}

impl SequentialWrite {
    pub fn new(write_concern: Document) -> SequentialWrite {
        SequentialWrite {
            ops: Vec::new(),
            commenced: 0,
            write_concern: effective_concern(write_concern),
            merge: Box::new(default_ack_merger),
            stop: None,
            ack: AckCache::default(),
        }
    }

    pub fn add(&mut self, op: Box<dyn WriteOperation>) {
        self.ops.push(op);
    }

    pub fn stop_at_first(&mut self, stop: StopPredicate) {
        self.stop = Some(stop);
    }

    pub fn merge_acks_with(&mut self, merge: AckMerger) {
        self.merge = merge;
    }
}

#[async_trait]
impl WriteOperation for SequentialWrite {
    async fn perform(&mut self) -> Result<()> {
        let mut acks = Vec::new();
        for op in &mut self.ops {
            self.commenced += 1;
            op.perform().await?;
            let ack = op.last_status();
            let failed = matches!(ack.get("err"), Some(e) if !matches!(e, Bson::Null));
            let stop_here = self.stop.as_ref().map(|s| s(&ack)).unwrap_or(false);
            acks.push(ack);
            if failed || stop_here {
                break;
            }
        }
        let merged = (self.merge)(&acks);
        let concern = self.write_concern.clone();
        self.ack.store(&concern, merged);
        Ok(())
    }

    fn is_acknowledgable(&self) -> bool {
        self.ops.iter().all(|op| op.is_acknowledgable())
    }

    async fn acknowledge(&mut self, concern: &Document) -> Result<Document> {
        if let Some(cached) = self.ack.lookup(concern) {
            return Ok(cached);
        }
        let mut acks = Vec::with_capacity(self.commenced);
        for op in &mut self.ops[..self.commenced] {
            acks.push(op.acknowledge(concern).await?);
        }
        let merged = (self.merge)(&acks);
        Ok(self.ack.store(concern, merged))
    }

    fn last_status(&self) -> Document {
        self.ack.last_status.clone()
    }

    async fn finish(&mut self) {
        for op in &mut self.ops[..self.commenced] {
            op.finish().await;
        }
    }

    fn kind(&self) -> &'static str {
        "sequential"
    }
}

/// Per-message-type planning rules.
trait SubopSpec: Clone + Send + Sync + 'static {
    fn selector(&self) -> &Document;

    /// Safe to apply concurrently to every containing shard?
    fn is_parallelizable(&self) -> Result<bool>;

    /// Called when the selector matches no shard at all.
    fn on_null(&self) -> Result<()>;

    /// 0 = unlimited; 1 = single-document; >1 rejected.
    fn limit(&self) -> u32;

    /// Whether the sub-operation may visit shards one at a time when the
    /// selector does not pin a single shard.
    fn allows_global() -> bool {
        true
    }

    fn cmd_name() -> &'static str;
    fn subops_key() -> &'static str;
    fn pack_command(&self) -> Document;

    /// Legacy wire messages for a batch destined to one shard.
    fn pack_legacy(ns: &Namespace, subops: &[Self]) -> Vec<Vec<u8>>;
}

impl SubopSpec for Document {
    // inserts: the document is its own selector
    fn selector(&self) -> &Document {
        self
    }

    fn is_parallelizable(&self) -> Result<bool> {
        Ok(false)
    }

    fn on_null(&self) -> Result<()> {
        Err(Error::bad_request("insert operation requires sharding key"))
    }

    fn limit(&self) -> u32 {
        1
    }

    fn allows_global() -> bool {
        false
    }

    fn cmd_name() -> &'static str {
        "insert"
    }

    fn subops_key() -> &'static str {
        "documents"
    }

    fn pack_command(&self) -> Document {
        self.clone()
    }

    fn pack_legacy(ns: &Namespace, subops: &[Document]) -> Vec<Vec<u8>> {
        let mut b = MsgBuilder::new();
        b.push_u32(0)
            .push_u32(0)
            .push_opcode(Opcode::Insert)
            .push_u32(0)
            .push_cstring(ns.ns());
        for doc in subops {
            b.push_document(doc);
        }
        vec![b.finish()]
    }
}

impl SubopSpec for UpdateSub {
    fn selector(&self) -> &Document {
        &self.selector
    }

    fn is_parallelizable(&self) -> Result<bool> {
        if self.upsert {
            return Err(Error::bad_request("upsert requires sharding key"));
        }
        Ok(self.multi)
    }

    fn on_null(&self) -> Result<()> {
        if self.upsert {
            return Err(Error::bad_request("upsert requires sharding key"));
        }
        Ok(())
    }

    fn limit(&self) -> u32 {
        if self.multi {
            0
        } else {
            1
        }
    }

    fn cmd_name() -> &'static str {
        "update"
    }

    fn subops_key() -> &'static str {
        "updates"
    }

    fn pack_command(&self) -> Document {
        doc! {
            "q": self.selector.clone(),
            "u": self.update.clone(),
            "upsert": self.upsert,
            "multi": self.multi,
        }
    }

    fn pack_legacy(ns: &Namespace, subops: &[UpdateSub]) -> Vec<Vec<u8>> {
        subops
            .iter()
            .map(|u| {
                let flags = (u.upsert as u32) | ((u.multi as u32) << 1);
                let mut b = MsgBuilder::new();
                b.push_u32(0)
                    .push_u32(0)
                    .push_opcode(Opcode::Update)
                    .push_u32(0)
                    .push_cstring(ns.ns())
                    .push_u32(flags)
                    .push_document(&u.selector)
                    .push_document(&u.update);
                b.finish()
            })
            .collect()
    }
}

impl SubopSpec for DeleteSub {
    fn selector(&self) -> &Document {
        &self.selector
    }

    fn is_parallelizable(&self) -> Result<bool> {
        Ok(self.limit == 0)
    }

    fn on_null(&self) -> Result<()> {
        Ok(())
    }

    fn limit(&self) -> u32 {
        self.limit
    }

    fn cmd_name() -> &'static str {
        "delete"
    }

    fn subops_key() -> &'static str {
        "deletes"
    }

    fn pack_command(&self) -> Document {
        doc! { "q": self.selector.clone(), "limit": self.limit as i32 }
    }

    fn pack_legacy(ns: &Namespace, subops: &[DeleteSub]) -> Vec<Vec<u8>> {
        subops
            .iter()
            .map(|d| {
                let mut b = MsgBuilder::new();
                b.push_u32(0)
                    .push_u32(0)
                    .push_opcode(Opcode::Delete)
                    .push_u32(0)
                    .push_cstring(ns.ns())
                    .push_u32(if d.limit == 1 { 1 } else { 0 })
                    .push_document(&d.selector);
                b.finish()
            })
            .collect()
    }
}

fn build_command<T: SubopSpec>(ns: &Namespace, subops: &[T], concern: &Document) -> Document {
    let packed: Vec<Bson> = subops.iter().map(|s| Bson::Document(s.pack_command())).collect();
    let mut cmd = Document::new();
    cmd.insert(T::cmd_name(), ns.collection());
    cmd.insert(T::subops_key(), packed);
    cmd.insert("ordered", false);
    cmd.insert("writeConcern", concern.clone());
    cmd
}

/// A batch of sub-operations all destined to one shard.
fn make_local<T: SubopSpec>(
    vs: VersionedShard,
    ns: &Namespace,
    subops: Vec<T>,
    concern: &Document,
) -> Box<dyn WriteOperation> {
    if vs.shard.supports_write_commands() && !concern.is_empty() {
        let cmd = build_command(ns, &subops, concern);
        return Box::new(BackendWrite::command(vs, ns.clone(), cmd));
    }

    let mut msgs = T::pack_legacy(ns, &subops);
    if msgs.len() == 1 {
        return Box::new(BackendWrite::legacy(vs, ns.clone(), msgs.pop().unwrap()));
    }
    let mut ws = ParallelWrite::new(concern.clone());
    for msg in msgs {
        ws.add(Box::new(BackendWrite::legacy(vs.clone(), ns.clone(), msg)));
    }
    Box::new(ws)
}

/// One sub-operation visiting several shards one at a time, stopping as
/// soon as a shard reports it matched.
fn make_global<T: SubopSpec>(
    shards: Vec<VersionedShard>,
    ns: &Namespace,
    subop: T,
    concern: &Document,
) -> Result<Box<dyn WriteOperation>> {
    if !T::allows_global() {
        return Err(Error::bad_request("insert operation requires sharding key"));
    }
    if subop.limit() > 1 {
        return Err(Error::NotImplemented("limit greater than one is not implemented".into()));
    }

    let make_single = |vs: VersionedShard| -> Box<dyn WriteOperation> {
        make_local(vs, ns, vec![subop.clone()], concern)
    };

    if shards.len() == 1 {
        return Ok(make_single(shards.into_iter().next().unwrap()));
    }

    let mut ws = SequentialWrite::new(concern.clone());
    if subop.limit() != 0 {
        ws.stop_at_first(Box::new(|ack: &Document| {
            w_number(&ack.get("n").cloned()) != 0
        }));
    }
    for vs in shards {
        ws.add(make_single(vs));
    }
    Ok(Box::new(ws))
}

/// Classifies a run of sub-operations and composes the operation tree:
/// point sub-operations group per shard, broadcasts fan out in parallel,
/// the rest go sequential-global.
fn plan_subops<T: SubopSpec>(
    snapshot: &Snapshot,
    ns: &Namespace,
    subops: &[T],
    concern: &Document,
) -> Result<Box<dyn WriteOperation>> {
    struct Part<T> {
        vs: VersionedShard,
        subops: Vec<T>,
    }
    let mut parts: Vec<Part<T>> = Vec::new();
    let mut sequential: Vec<(T, Vec<VersionedShard>)> = Vec::new();

    for sub in subops {
        let shards = snapshot.find(ns, sub.selector());
        let mut add_to_shard = |vs: &VersionedShard| {
            match parts.iter_mut().find(|p| Arc::ptr_eq(&p.vs.shard, &vs.shard)) {
                Some(part) => part.subops.push(sub.clone()),
                None => parts.push(Part { vs: vs.clone(), subops: vec![sub.clone()] }),
            }
        };

        if shards.is_empty() {
            sub.on_null()?;
        } else if shards.len() == 1 {
            add_to_shard(&shards[0]);
        } else if sub.is_parallelizable()? {
            for vs in &shards {
                add_to_shard(vs);
            }
        } else {
            sequential.push((sub.clone(), shards));
        }
    }

    match (parts.len(), sequential.len()) {
        (0, 0) => Ok(Box::new(NullWrite::new(doc! { "ok": 1, "n": 0 }))),
        (1, 0) => {
            let part = parts.pop().unwrap();
            Ok(make_local(part.vs, ns, part.subops, concern))
        }
        (0, 1) => {
            let (sub, shards) = sequential.pop().unwrap();
            make_global(shards, ns, sub, concern)
        }
        _ => {
            let mut ws = ParallelWrite::new(concern.clone());
            for part in parts {
                ws.add(make_local(part.vs, ns, part.subops, concern));
            }
            for (sub, shards) in sequential {
                ws.add(make_global(shards, ns, sub, concern)?);
            }
            Ok(Box::new(ws))
        }
    }
}

/// An ordered message with several sub-operations becomes a sequential
/// chain that short-circuits at the first error.
fn plan_message<T: SubopSpec>(
    snapshot: &Snapshot,
    ns: &Namespace,
    subops: &[T],
    ordered: bool,
    concern: &Document,
) -> Result<Box<dyn WriteOperation>> {
    if subops.is_empty() {
        return Err(Error::bad_request("no operations given"));
    }

    if ordered && subops.len() > 1 {
        let mut ws = SequentialWrite::new(concern.clone());
        for sub in subops {
            match plan_subops(snapshot, ns, std::slice::from_ref(sub), concern) {
                Ok(op) => ws.add(op),
                // a rejected sub-operation fails in order: preceding ones
                // still run, following ones are never attempted
                Err(Error::BadRequest(msg)) | Err(Error::NotImplemented(msg)) => {
                    ws.add(Box::new(FailedWrite::new(&msg)))
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Box::new(ws))
    } else {
        plan_subops(snapshot, ns, subops, concern)
    }
}

fn check_privileges(ns: &Namespace, privileges: &Privileges) -> Result<()> {
    if ns.collection() == "system.users" {
        privileges.require(ns.db(), Privilege::UserAdmin)?;
    }
    if ns.db() == "config" {
        privileges.require(ns.db(), Privilege::ClusterAdmin)?;
    }
    if ns.collection().starts_with("system.") {
        privileges.require(ns.db(), Privilege::DbAdmin)?;
    }
    privileges.require(ns.db(), Privilege::Write)
}

/// The shared entry path: privilege checks, planning against the current
/// snapshot, execution, and the stale-config retry loop.
async fn perform_write<F>(ctx: &Ctx, ns: &Namespace, privileges: &Privileges, plan: F) -> Result<Box<dyn WriteOperation>>
where
    F: Fn(&Snapshot) -> Result<Box<dyn WriteOperation>>,
{
    if options().read_only {
        return Err(Error::bad_request("writes through this server is forbidden"));
    }
    check_privileges(ns, privileges)?;

    let mut last = Error::NoShardConfig;
    for attempt in 0..3 {
        debug!("making up the write operation");
        let snapshot = ctx.topology.get()?;

        let known = snapshot.collection(ns).is_some()
            || snapshot
                .database(ns.db())
                .map(|db| !db.is_partitioned())
                .unwrap_or(false);
        if !known {
            if attempt == 0 {
                info!("collection {ns} does not exist; updating shard config");
                let _ = ctx.topology.update().await;
                last = Error::ShardConfigStale(format!("collection {ns} does not exist"));
                continue;
            }
            return Err(Error::NotImplemented(format!("collection {ns} does not exist")));
        }

        let mut op = match plan(&snapshot) {
            Ok(op) => op,
            Err(Error::ShardConfigStale(reason)) => {
                info!("{reason}; updating shard config");
                let _ = ctx.topology.update().await;
                last = Error::ShardConfigStale(reason);
                continue;
            }
            Err(e) => return Err(e),
        };

        debug!("performing the write operation ({})", op.kind());
        match op.perform().await {
            Ok(()) => {
                debug!("write operation done");
                return Ok(op);
            }
            Err(Error::ShardConfigStale(reason)) => {
                info!("{reason}; updating shard config");
                let _ = ctx.topology.update().await;
                last = Error::ShardConfigStale(reason);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last)
}

pub async fn insert(ctx: &Ctx, msg: &Insert, privileges: &Privileges) -> Result<Box<dyn WriteOperation>> {
    perform_write(ctx, &msg.ns, privileges, |snapshot| {
        plan_message(snapshot, &msg.ns, &msg.subops, msg.ordered, &msg.write_concern)
    })
    .await
}

pub async fn update(ctx: &Ctx, msg: &Update, privileges: &Privileges) -> Result<Box<dyn WriteOperation>> {
    perform_write(ctx, &msg.ns, privileges, |snapshot| {
        plan_message(snapshot, &msg.ns, &msg.subops, msg.ordered, &msg.write_concern)
    })
    .await
}

pub async fn remove(ctx: &Ctx, msg: &Delete, privileges: &Privileges) -> Result<Box<dyn WriteOperation>> {
    perform_write(ctx, &msg.ns, privileges, |snapshot| {
        plan_message(snapshot, &msg.ns, &msg.subops, msg.ordered, &msg.write_concern)
    })
    .await
}

pub async fn find_and_modify(
    ctx: &Ctx,
    db: &str,
    cmd: &Document,
    privileges: &Privileges,
) -> Result<Box<dyn WriteOperation>> {
    let coll = cmd
        .iter()
        .next()
        .and_then(|(_, v)| v.as_str())
        .ok_or_else(|| Error::bad_request("findAndModify: collection name required"))?;
    let ns = Namespace::new(db, coll);

    perform_write(ctx, &ns, privileges, |snapshot| {
        let query = cmd.get_document("query").cloned().unwrap_or_default();
        let upsert = cmd.get_bool("upsert").unwrap_or(false);
        let shards = snapshot.find(&ns, &query);

        if shards.is_empty() && !upsert {
            return Ok(Box::new(NullWrite::new(doc! { "value": Bson::Null, "ok": 1 }))
                as Box<dyn WriteOperation>);
        }
        if shards.len() == 1 {
            let vs = shards.into_iter().next().unwrap();
            return Ok(Box::new(BackendWrite::find_modify(vs, ns.clone(), cmd.clone())));
        }
        if upsert {
            return Err(Error::bad_request("findAndModify() with upsert flag requires sharding key"));
        }

        // Visit the shards one at a time until one of them found the
        // document; the last attempted ack is the client-visible one.
        let mut ws = SequentialWrite::new(Document::new());
        ws.stop_at_first(Box::new(|ack: &Document| {
            !matches!(ack.get("value"), None | Some(Bson::Null))
        }));
        ws.merge_acks_with(Box::new(|acks: &[Document]| match acks.last() {
            Some(last) => last.clone(),
            None => doc! { "value": Bson::Null, "ok": 1 },
        }));
        for vs in shards {
            ws.add(Box::new(BackendWrite::find_modify(vs, ns.clone(), cmd.clone())));
        }
        Ok(Box::new(ws))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shard::ShardPool;
    use bson::oid::ObjectId;
    use bson::Timestamp;

    #[test]
    fn test_concern_equivalence_basics() {
        // w: 1 equals missing w
        assert!(are_concerns_equivalent(&doc! {}, &doc! { "w": 1 }));
        assert!(are_concerns_equivalent(&doc! { "w": 1 }, &doc! {}));
        assert!(!are_concerns_equivalent(&doc! { "w": 2 }, &doc! {}));
        // getLastError is ignored, case-insensitively
        assert!(are_concerns_equivalent(&doc! { "getLastError": 1 }, &doc! { "GETLASTERROR": 1 }));
        // other keys must match
        assert!(are_concerns_equivalent(&doc! { "j": true }, &doc! { "j": true }));
        assert!(!are_concerns_equivalent(&doc! { "j": true }, &doc! { "j": false }));
        assert!(!are_concerns_equivalent(&doc! { "j": true }, &doc! {}));
        // string and numeric w never mix
        assert!(are_concerns_equivalent(&doc! { "w": "majority" }, &doc! { "w": "majority" }));
        assert!(!are_concerns_equivalent(&doc! { "w": "majority" }, &doc! { "w": 1 }));
    }

    #[test]
    fn test_wtimeout_is_never_equivalent() {
        let wt = doc! { "w": 1, "wtimeout": 100 };
        assert!(!are_concerns_equivalent(&wt, &wt));
        assert!(!are_concerns_equivalent(&wt, &doc! { "w": 1 }));
        assert!(!are_concerns_equivalent(&doc! { "w": 1 }, &wt));
    }

    #[test]
    fn test_concern_equivalence_is_symmetric_and_transitive() {
        let a = doc! { "w": 1, "j": true };
        let b = doc! { "j": true };
        let c = doc! { "J": true }; // keys compare case-insensitively
        assert!(are_concerns_equivalent(&a, &b) && are_concerns_equivalent(&b, &a));
        assert!(are_concerns_equivalent(&b, &c));
        assert!(are_concerns_equivalent(&a, &c));
    }

    #[test]
    fn test_ack_merger_reduction() {
        let acks = vec![
            doc! { "ok": 1, "n": 2, "err": Bson::Null, "wtime": 5 },
            doc! { "ok": 0, "n": 1, "err": "boom", "code": 11000, "wtimeout": true },
            doc! { "ok": 0, "n": 3, "err": "later", "code": 12000, "wtime": 9 },
        ];
        let merged = default_ack_merger(&acks);
        assert_eq!(merged.get_i32("ok").unwrap(), 0);
        assert_eq!(merged.get_i32("n").unwrap(), 6);
        assert_eq!(merged.get_str("err").unwrap(), "boom");
        assert_eq!(merged.get_i32("code").unwrap(), 11000);
        assert_eq!(merged.get_bool("wtimeout").unwrap(), true);
        assert_eq!(merged.get_i32("wtime").unwrap(), 9);
    }

    #[test]
    fn test_ack_merger_single_passthrough() {
        let ack = doc! { "ok": 1, "n": 1, "custom": "kept" };
        assert_eq!(default_ack_merger(&[ack.clone()]), ack);
        assert!(default_ack_merger(&[]).is_empty());
    }

    #[test]
    fn test_ack_cache_reuse_rules() {
        let mut cache = AckCache::default();
        let concern = doc! { "w": 1 };
        cache.store(&concern, doc! { "ok": 1, "n": 1 });

        assert!(cache.lookup(&doc! {}).is_some());
        assert!(cache.lookup(&doc! { "getLastError": 1, "w": 1 }).is_some());
        assert!(cache.lookup(&doc! { "w": 2 }).is_none());
        assert!(cache.lookup(&doc! { "w": 1, "wtimeout": 50 }).is_none());
    }

    #[tokio::test]
    async fn test_null_and_failed_writes() {
        let mut op = NullWrite::new(doc! { "ok": 1, "n": 0 });
        op.perform().await.unwrap();
        assert!(op.is_acknowledgable());
        assert_eq!(op.acknowledge(&doc! {}).await.unwrap().get_i32("n").unwrap(), 0);

        let mut op = FailedWrite::new("insert operation requires sharding key");
        op.perform().await.unwrap();
        let ack = op.acknowledge(&doc! {}).await.unwrap();
        assert_eq!(ack.get_i32("ok").unwrap(), 0);
        assert_eq!(ack.get_str("err").unwrap(), "insert operation requires sharding key");
    }

    fn ts(time: u32, inc: u32) -> Timestamp {
        Timestamp { time, increment: inc }
    }

    fn test_snapshot() -> (Snapshot, ShardPool) {
        let epoch = ObjectId::new();
        let raw = doc! {
            "shards": [
                { "_id": "s1", "host": "h1:27018" },
                { "_id": "s2", "host": "h2:27018" },
            ],
            "databases": [ { "_id": "db", "partitioned": true, "primary": "s1" } ],
            "collections": [ { "_id": "db.c", "key": { "k": 1 } } ],
            "chunks": [
                {
                    "ns": "db.c", "lastmodEpoch": epoch, "lastmod": ts(1, 1),
                    "min": { "k": Bson::MinKey }, "max": { "k": 10 }, "shard": "s1",
                },
                {
                    "ns": "db.c", "lastmodEpoch": epoch, "lastmod": ts(1, 2),
                    "min": { "k": 10 }, "max": { "k": Bson::MaxKey }, "shard": "s2",
                },
            ],
        };
        let pool = ShardPool::new();
        let config_shard = crate::core::shard::Shard::make("config", "cfg:27019,cfg2:27019").unwrap();
        let snap = Snapshot::build(config_shard, raw, &pool).unwrap();
        (snap, pool)
    }

    #[tokio::test]
    async fn test_point_inserts_group_per_shard() {
        let (snap, _pool) = test_snapshot();
        let ns = Namespace::parse("db.c").unwrap();

        // both documents land on s1: one local batch
        let docs = vec![doc! { "k": 1 }, doc! { "k": 2 }];
        let op = plan_message(&snap, &ns, &docs, false, &doc! { "w": 1 }).unwrap();
        assert_eq!(op.kind(), "backend");

        // split across shards: parallel of two batches
        let docs = vec![doc! { "k": 1 }, doc! { "k": 11 }];
        let op = plan_message(&snap, &ns, &docs, false, &doc! { "w": 1 }).unwrap();
        assert_eq!(op.kind(), "parallel");

        // ordered with two subops: sequential wrapper
        let op = plan_message(&snap, &ns, &docs, true, &doc! { "w": 1 }).unwrap();
        assert_eq!(op.kind(), "sequential");
    }

    #[tokio::test]
    async fn test_ordered_batch_with_bad_middle_plans_as_failed_child() {
        let (snap, _pool) = test_snapshot();
        let ns = Namespace::parse("db.c").unwrap();
        // middle document misses the sharding key: planning still succeeds,
        // the bad sub-operation becomes an in-order failure
        let docs = vec![doc! { "k": 1 }, doc! { "other": 1 }, doc! { "k": 2 }];
        let op = plan_message(&snap, &ns, &docs, true, &doc! { "w": 1 }).unwrap();
        assert_eq!(op.kind(), "sequential");
    }

    #[tokio::test]
    async fn test_insert_without_key_is_rejected() {
        let (snap, _pool) = test_snapshot();
        let ns = Namespace::parse("db.c").unwrap();
        let docs = vec![doc! { "other": 1 }];
        assert!(matches!(
            plan_message(&snap, &ns, &docs, false, &doc! { "w": 1 }),
            Err(Error::BadRequest(_))
        ));

        // empty batches are bad requests too
        let docs: Vec<Document> = Vec::new();
        assert!(matches!(
            plan_message(&snap, &ns, &docs, false, &doc! { "w": 1 }),
            Err(Error::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_upsert_without_key_is_rejected() {
        let (snap, _pool) = test_snapshot();
        let ns = Namespace::parse("db.c").unwrap();
        let subs = vec![UpdateSub {
            selector: doc! { "other": 1 },
            update: doc! { "$set": { "x": 1 } },
            upsert: true,
            multi: false,
        }];
        assert!(matches!(
            plan_message(&snap, &ns, &subs, false, &doc! { "w": 1 }),
            Err(Error::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_multi_update_broadcasts_in_parallel() {
        let (snap, _pool) = test_snapshot();
        let ns = Namespace::parse("db.c").unwrap();
        let subs = vec![UpdateSub {
            selector: doc! { "other": 1 },
            update: doc! { "$set": { "x": 1 } },
            upsert: false,
            multi: true,
        }];
        let op = plan_message(&snap, &ns, &subs, false, &doc! { "w": 1 }).unwrap();
        assert_eq!(op.kind(), "parallel"); // one batch per containing shard
    }

    #[tokio::test]
    async fn test_single_delete_goes_sequential_global() {
        let (snap, _pool) = test_snapshot();
        let ns = Namespace::parse("db.c").unwrap();
        let subs = vec![DeleteSub { selector: doc! { "other": 1 }, limit: 1 }];
        let op = plan_message(&snap, &ns, &subs, false, &doc! { "w": 1 }).unwrap();
        assert_eq!(op.kind(), "sequential");
    }

    #[tokio::test]
    async fn test_unlimited_delete_broadcasts() {
        let (snap, _pool) = test_snapshot();
        let ns = Namespace::parse("db.c").unwrap();
        let subs = vec![DeleteSub { selector: doc! { "other": 1 }, limit: 0 }];
        let op = plan_message(&snap, &ns, &subs, false, &doc! { "w": 1 }).unwrap();
        // one batch per shard under a parallel node
        assert_eq!(op.kind(), "parallel");
    }

    #[tokio::test]
    async fn test_sequential_stops_at_first_error() {
        let mut ws = SequentialWrite::new(doc! { "w": 1 });
        ws.add(Box::new(NullWrite::new(doc! { "ok": 1, "n": 1, "err": Bson::Null })));
        ws.add(Box::new(FailedWrite::new("insert requires sharding key")));
        ws.add(Box::new(NullWrite::new(doc! { "ok": 1, "n": 1, "err": Bson::Null })));

        ws.perform().await.unwrap();
        let ack = ws.last_status();
        assert_eq!(ack.get_i32("n").unwrap(), 1); // third child never ran
        assert_eq!(ack.get_str("err").unwrap(), "insert requires sharding key");
        assert_eq!(ack.get_i32("ok").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_parallel_merges_all_children() {
        let mut ws = ParallelWrite::new(doc! { "w": 1 });
        ws.add(Box::new(NullWrite::new(doc! { "ok": 1, "n": 2, "err": Bson::Null })));
        ws.add(Box::new(NullWrite::new(doc! { "ok": 1, "n": 3, "err": Bson::Null })));

        ws.perform().await.unwrap();
        let ack = ws.last_status();
        assert_eq!(ack.get_i32("n").unwrap(), 5);
        assert_eq!(ack.get_i32("ok").unwrap(), 1);
        assert!(ws.is_acknowledgable());
    }
}
