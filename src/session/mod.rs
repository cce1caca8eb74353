/// One connected client: the per-session message loop.
///
/// Reads one wire message at a time, dispatches by opcode, owns the
/// session's cursors and the last acknowledgeable write (kept around to
/// answer a following `getLastError`), and enforces authentication.
use crate::auth::{self, Privilege, Privileges};
use crate::config::options;
use crate::error::{Error, Result};
use crate::http;
use crate::ops::read::{self, DataSource, FixedSource};
use crate::ops::write::{self, FailedWrite, WriteOperation};
use crate::wire::messages::{Delete, GetMore, Insert, KillCursors, Query, Update};
use crate::wire::{self, Message, Opcode};
use crate::Ctx;
use bson::{doc, Bson, Document};
use bytes::BufMut;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type CursorTable = HashMap<u64, Box<dyn DataSource>>;

/// Resolves cursor ids to open data sources. Local by default; one shared
/// process-wide table under `--global-cursors`.
pub enum CursorStore {
    Local(CursorTable),
    Global(Arc<Mutex<CursorTable>>),
}

impl CursorStore {
    pub fn local() -> CursorStore {
        CursorStore::Local(CursorTable::new())
    }

    pub fn global(shared: Arc<Mutex<CursorTable>>) -> CursorStore {
        CursorStore::Global(shared)
    }

    pub fn insert(&mut self, ds: Box<dyn DataSource>) {
        match self {
            CursorStore::Local(map) => {
                map.insert(ds.id(), ds);
            }
            CursorStore::Global(shared) => {
                shared.lock().insert(ds.id(), ds);
            }
        }
    }

    /// Removes and returns the source; the caller owns it while feeding
    /// and reinserts it if it survives.
    pub fn take(&mut self, id: u64) -> Option<Box<dyn DataSource>> {
        match self {
            CursorStore::Local(map) => map.remove(&id),
            CursorStore::Global(shared) => shared.lock().remove(&id),
        }
    }
}

pub struct Session<S> {
    stream: S,
    peer: String,
    ctx: Arc<Ctx>,
    cursors: CursorStore,
    last_write_op: Option<Box<dyn WriteOperation>>,
    nonce: String,
    privileges: Privileges,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: String, ctx: Arc<Ctx>, cursors: CursorStore) -> Session<S> {
        Session {
            stream,
            peer,
            ctx,
            cursors,
            last_write_op: None,
            nonce: String::new(),
            privileges: Privileges::new(),
        }
    }

    /// The session loop; returns when the client disconnects or turns out
    /// to speak HTTP.
    pub async fn run(mut self) {
        loop {
            match self.read_msg().await {
                Ok(Some(msg)) => {
                    if let Err(e) = self.dispatch(msg).await {
                        debug!("session with {} ends: {e}", self.peer);
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("cannot read message from {}: {e}", self.peer);
                    break;
                }
            }
        }
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        if let Some(mut op) = self.last_write_op.take() {
            op.finish().await;
        }
    }

    /// Reads one framed message. `None` means the peer is done — or spoke
    /// HTTP, which is served and then closed.
    async fn read_msg(&mut self) -> Result<Option<Message>> {
        let len = match self.stream.read_u32_le().await {
            Ok(len) => len,
            Err(_) => return Ok(None),
        };

        if len == wire::HTTP_GET_MARKER {
            http::serve(&mut self.stream, &self.ctx).await?;
            return Ok(None);
        }
        if len as usize > wire::MAX_MESSAGE_SIZE {
            warn!("message length too big from {}", self.peer);
            return Ok(None);
        }
        if (len as usize) < 16 {
            return Ok(None);
        }

        let mut buf = vec![0u8; len as usize - 4];
        self.stream.read_exact(&mut buf).await?;
        Ok(Some(Message::new(buf)?))
    }

    async fn dispatch(&mut self, mut msg: Message) -> Result<()> {
        let started = Instant::now();
        let req_id = msg.request_id();

        match msg.opcode() {
            Some(Opcode::Update) => {
                let upd = Update::parse(&mut msg)?;
                let ctx = self.ctx.clone();
                let privileges = self.privileges.clone();
                let op = protect_write(&ctx, |c| Box::pin(write::update(c, &upd, &privileges))).await;
                info!(
                    "{} (#{req_id}) update {} => {}, {} ms",
                    self.peer,
                    upd.ns,
                    op.last_status(),
                    started.elapsed().as_millis()
                );
                self.set_write_op(op).await;
            }
            Some(Opcode::Insert) => {
                let ins = Insert::parse(&mut msg)?;
                let ctx = self.ctx.clone();
                let privileges = self.privileges.clone();
                let op = protect_write(&ctx, |c| Box::pin(write::insert(c, &ins, &privileges))).await;
                info!(
                    "{} (#{req_id}) insert into {} ({} docs) => {}, {} ms",
                    self.peer,
                    ins.ns,
                    ins.subops.len(),
                    op.last_status(),
                    started.elapsed().as_millis()
                );
                self.set_write_op(op).await;
            }
            Some(Opcode::Delete) => {
                let del = Delete::parse(&mut msg)?;
                let ctx = self.ctx.clone();
                let privileges = self.privileges.clone();
                let op = protect_write(&ctx, |c| Box::pin(write::remove(c, &del, &privileges))).await;
                info!(
                    "{} (#{req_id}) delete from {} => {}, {} ms",
                    self.peer,
                    del.ns,
                    op.last_status(),
                    started.elapsed().as_millis()
                );
                self.set_write_op(op).await;
            }
            Some(Opcode::Query) => {
                let q = Query::parse(&mut msg)?;
                self.handle_query(req_id, q, started).await?;
            }
            Some(Opcode::GetMore) => {
                let more = GetMore::parse(&mut msg)?;
                let source = self.cursors.take(more.cursor_id);
                let fed = self.feed(req_id, source, more.n_to_return).await?;
                match fed {
                    Some(ds) => {
                        info!(
                            "{} (#{req_id}) get_more on cursor {} => pos {}, {} ms",
                            self.peer,
                            more.cursor_id,
                            ds.pos(),
                            started.elapsed().as_millis()
                        );
                        if !ds.is_closed() {
                            self.cursors.insert(ds);
                        }
                    }
                    None => {
                        info!(
                            "{} (#{req_id}) get_more on cursor {} => cursor not found, {} ms",
                            self.peer,
                            more.cursor_id,
                            started.elapsed().as_millis()
                        );
                    }
                }
            }
            Some(Opcode::KillCursors) => {
                let kill = KillCursors::parse(&mut msg)?;
                info!("{} (#{req_id}) kill_cursors {:?}", self.peer, kill.cursor_ids);
                for id in kill.cursor_ids {
                    if let Some(mut ds) = self.cursors.take(id) {
                        let _ = ds.close().await;
                    }
                }
            }
            Some(Opcode::Reply) => return Err(Error::bad_request("unexpected reply opcode")),
            None => return Err(Error::bad_request("unknown opcode")),
        }
        Ok(())
    }

    async fn handle_query(&mut self, req_id: i32, q: Query, started: Instant) -> Result<()> {
        let is_cmd = q.is_command();

        let built: Result<Box<dyn DataSource>> = async {
            let mut ds: Box<dyn DataSource> = if is_cmd {
                if q.query.is_empty() {
                    return Err(Error::bad_request("query object empty"));
                }
                Box::new(FixedSource::new(self.command(&q).await?))
            } else {
                read::query(&self.ctx, &q, &self.privileges).await?
            };
            for _ in 0..q.n_to_skip.max(0) {
                ds.advance().await?;
            }
            Ok(ds)
        }
        .await;

        let (datasource, errmsg) = match built {
            Ok(ds) => (ds, None),
            Err(e) => {
                let msg = e.to_string();
                let ds = if is_cmd {
                    FixedSource::cmd_error(e.code(), &msg)
                } else {
                    FixedSource::query_error(&msg)
                };
                (ds, Some(msg))
            }
        };

        let fed = self.feed(req_id, Some(datasource), q.n_to_return).await?;

        match &errmsg {
            None => info!(
                "{} (#{req_id}) {} {} => pos {}, {} ms",
                self.peer,
                if is_cmd { "command on" } else { "query" },
                q.ns,
                fed.as_ref().map(|d| d.pos()).unwrap_or(0),
                started.elapsed().as_millis()
            ),
            Some(err) => warn!(
                "{} (#{req_id}) {} {} => {err}, {} ms",
                self.peer,
                if is_cmd { "command on" } else { "query" },
                q.ns,
                started.elapsed().as_millis()
            ),
        }

        if let Some(ds) = fed {
            if !ds.is_closed() {
                self.cursors.insert(ds);
            }
        }
        Ok(())
    }

    async fn set_write_op(&mut self, op: Box<dyn WriteOperation>) {
        if let Some(mut old) = self.last_write_op.take() {
            old.finish().await;
        }
        if op.is_acknowledgable() {
            self.last_write_op = Some(op);
        } else {
            let mut op = op;
            op.finish().await;
        }
    }

    /// Sends a batch of `datasource` back to the client, bounded by the
    /// requested count and the 16 MiB reply limit. Returns the data source
    /// that should live on (possibly an error stand-in), or `None` for a
    /// cursor-not-found reply.
    async fn feed(
        &mut self,
        req_id: i32,
        mut datasource: Option<Box<dyn DataSource>>,
        count: i32,
    ) -> Result<Option<Box<dyn DataSource>>> {
        let mut flags = match &datasource {
            Some(ds) => ds.flags(),
            None => wire::reply_flags::CURSOR_NOT_FOUND,
        };
        let starting_from = datasource.as_ref().map(|ds| ds.pos()).unwrap_or(0) as u32;

        let auto_close = count == 1 || count < 0;
        let mut remaining = match count.unsigned_abs() as usize {
            0 => usize::MAX,
            n => n,
        };

        let mut body: Vec<u8> = Vec::new();
        let mut returned: u32 = 0;
        let mut pending_error: Option<Box<dyn DataSource>> = None;

        while let Some(ds) = datasource.as_mut() {
            if ds.at_end() || remaining == 0 {
                break;
            }
            let obj = ds.current();
            let mut raw = Vec::new();
            obj.to_writer(&mut raw).expect("document encoding cannot fail");
            if 36 + body.len() + raw.len() >= wire::MAX_MESSAGE_SIZE {
                break;
            }

            match ds.advance().await {
                Ok(()) => {
                    body.extend_from_slice(&raw);
                    returned += 1;
                    if remaining != usize::MAX {
                        remaining -= 1;
                    }
                }
                Err(e) => {
                    debug!("{e} while fetching data on cursor {}", ds.id());
                    let mut err = FixedSource::query_error(&e.to_string());
                    err.set_id(ds.id());
                    pending_error = Some(err);
                    break;
                }
            }
        }

        // Nothing sent yet: the error document is the whole reply, under
        // the query-failure flag. Otherwise the batch stops here and the
        // error is stashed for the following get-more.
        if let Some(mut err) = pending_error.take() {
            if returned == 0 {
                flags |= err.flags();
                let obj = err.current();
                let mut raw = Vec::new();
                obj.to_writer(&mut raw).expect("document encoding cannot fail");
                body.extend_from_slice(&raw);
                returned = 1;
                let _ = err.advance().await;
            }
            datasource = Some(err);
        }

        let cursor_id = match datasource.as_mut() {
            Some(ds) if !auto_close && !ds.at_end() => ds.id(),
            Some(ds) => {
                if let Err(e) = ds.close().await {
                    debug!("closing cursor {}: {e}", ds.id());
                }
                0
            }
            None => 0,
        };

        let mut reply = bytes::BytesMut::with_capacity(36 + body.len());
        reply.put_u32_le((36 + body.len()) as u32);
        reply.put_u32_le(0); // server-assigned request id
        reply.put_i32_le(req_id);
        reply.put_i32_le(Opcode::Reply as i32);
        reply.put_u32_le(flags);
        reply.put_u64_le(cursor_id);
        reply.put_u32_le(starting_from);
        reply.put_u32_le(returned);
        reply.put_slice(&body);

        self.stream.write_all(&reply).await?;
        self.stream.flush().await?;

        debug!("returning {returned} items in the batch");
        Ok(datasource)
    }

    /// The intercepted command table.
    async fn command(&mut self, q: &Query) -> Result<Document> {
        let db = q.ns.db().to_string();
        let Some((name, _)) = q.query.iter().next() else {
            return Err(Error::bad_request("query object empty"));
        };
        let cmd = name.to_lowercase();
        let obj = &q.query;

        match cmd.as_str() {
            "ping" => {
                self.ctx.topology.get()?; // a router without topology is not ok
                Ok(doc! { "ok": 1 })
            }

            "getlasterror" => match self.last_write_op.as_mut() {
                Some(op) => op.acknowledge(obj).await,
                None => Ok(doc! { "err": Bson::Null, "ok": 1, "n": 0 }),
            },

            "getlog" => Ok(doc! { "ok": 1, "log": [] }),

            "replsetgetstatus" => Ok(doc! {
                "ok": 0,
                "errmsg": "replSetGetStatus is not supported through the router",
                "info": "pasarela",
            }),

            "ismaster" => Ok(doc! {
                "ok": 1,
                "ismaster": true,
                "maxBsonObjectSize": wire::MAX_MESSAGE_SIZE as i32,
                "maxMessageSizeBytes": wire::MAX_MESSAGE_SIZE as i32,
                "localTime": bson::DateTime::now(),
                "maxWireVersion": 2,
                "minWireVersion": 0,
            }),

            "getnonce" => {
                self.nonce = auth::mknonce();
                Ok(doc! { "ok": 1, "nonce": self.nonce.clone() })
            }

            "authenticate" => {
                if self.nonce.is_empty() || self.nonce != obj.get_str("nonce").unwrap_or("") {
                    return Ok(failure(18, "nonce mismatch"));
                }
                self.nonce.clear();

                let user_doc = self.lookup_user(&db, obj.get_str("user").unwrap_or("")).await;
                if !self.privileges.auth(&db, obj, user_doc) {
                    return Ok(failure(18, "invalid username/password"));
                }
                Ok(doc! { "ok": 1 })
            }

            "listdatabases" => {
                let snapshot = self.ctx.topology.get()?;
                let databases: Vec<Bson> = snapshot
                    .databases()
                    .iter()
                    .map(|d| {
                        Bson::Document(doc! {
                            "name": d.name(),
                            "sizeOnDisk": 1,
                            "empty": false,
                        })
                    })
                    .collect();
                Ok(doc! { "ok": 1, "databases": databases })
            }

            "insert" => {
                let ins = Insert::from_command(&db, obj)?;
                let ctx = self.ctx.clone();
                let privileges = self.privileges.clone();
                let mut op =
                    protect_write(&ctx, |c| Box::pin(write::insert(c, &ins, &privileges))).await;
                op.finish().await;
                Ok(op.last_status())
            }

            "update" => {
                let upd = Update::from_command(&db, obj)?;
                let ctx = self.ctx.clone();
                let privileges = self.privileges.clone();
                let mut op =
                    protect_write(&ctx, |c| Box::pin(write::update(c, &upd, &privileges))).await;
                op.finish().await;
                Ok(op.last_status())
            }

            "delete" => {
                let del = Delete::from_command(&db, obj)?;
                let ctx = self.ctx.clone();
                let privileges = self.privileges.clone();
                let mut op =
                    protect_write(&ctx, |c| Box::pin(write::remove(c, &del, &privileges))).await;
                op.finish().await;
                Ok(op.last_status())
            }

            "count" => read::count(&self.ctx, q, &self.privileges).await,

            "distinct" => read::distinct(&self.ctx, q, &self.privileges).await,

            "findandmodify" => {
                let ctx = self.ctx.clone();
                let privileges = self.privileges.clone();
                let mut op = protect_write(&ctx, |c| {
                    Box::pin(write::find_and_modify(c, &db, obj, &privileges))
                })
                .await;
                op.finish().await;
                Ok(op.last_status())
            }

            "setloglevel" => {
                self.privileges.require("admin", Privilege::DbAdmin)?;
                let level = q
                    .query
                    .iter()
                    .next()
                    .and_then(|(_, v)| v.as_i32())
                    .unwrap_or(0);
                log::set_max_level(match level {
                    i32::MIN..=0 => log::LevelFilter::Info,
                    1 => log::LevelFilter::Debug,
                    _ => log::LevelFilter::Trace,
                });
                Ok(doc! { "ok": 1 })
            }

            _ => Ok(doc! { "ok": 0, "err": "unknown command", "bad cmd": obj.clone() }),
        }
    }

    /// Looks up a user document, fetching the credentials cache on first
    /// use.
    async fn lookup_user(&mut self, db: &str, user: &str) -> Document {
        if !options().auth {
            return Document::new();
        }
        if !self.ctx.credentials.is_loaded() {
            match read::fetch_credentials(&self.ctx).await {
                Ok(fetched) => self.ctx.credentials.install(fetched),
                Err(e) => {
                    warn!("cannot fetch auth info: {e}");
                    return Document::new();
                }
            }
        }
        self.ctx.credentials.find(db, user)
    }
}

fn failure(code: i32, msg: &str) -> Document {
    doc! { "ok": 0, "errmsg": msg, "code": code }
}

/// Converts write-pipeline failures into failed operations, refreshing the
/// topology and retrying on stale config.
async fn protect_write<'a, F>(ctx: &'a Ctx, mut f: F) -> Box<dyn WriteOperation>
where
    F: FnMut(&'a Ctx) -> BoxFuture<'a, Result<Box<dyn WriteOperation>>>,
{
    let mut ret: Box<dyn WriteOperation> = Box::new(FailedWrite::new("shard config is stale"));
    for _ in 0..8 {
        match f(ctx).await {
            Ok(op) => return op,
            Err(Error::ShardConfigStale(reason)) => {
                ret = Box::new(FailedWrite::new(&reason));
                let _ = ctx.topology.update().await;
            }
            Err(e) => return Box::new(FailedWrite::new(&e.to_string())),
        }
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shard::ShardPool;
    use crate::ops::read::NullSource;
    use crate::topology::cache::DiskCache;
    use crate::topology::holder::TopologyHolder;

    fn test_ctx() -> Arc<Ctx> {
        let pool = Arc::new(ShardPool::new());
        let cache = Arc::new(DiskCache::open(None));
        let topology =
            TopologyHolder::spawn("cfg1:27019,cfg2:27019", pool.clone(), cache.clone()).unwrap();
        Arc::new(Ctx {
            topology,
            credentials: Arc::new(auth::CredentialsCache::new(cache.clone())),
            cache,
            pool,
        })
    }

    #[tokio::test]
    async fn test_cursor_store_local_round_trip() {
        let mut store = CursorStore::local();
        let ds: Box<dyn DataSource> = Box::new(NullSource::new());
        let id = ds.id();
        store.insert(ds);
        assert!(store.take(id).is_some());
        assert!(store.take(id).is_none());
    }

    #[tokio::test]
    async fn test_cursor_store_global_is_shared() {
        let shared = Arc::new(Mutex::new(CursorTable::new()));
        let mut a = CursorStore::global(shared.clone());
        let mut b = CursorStore::global(shared);
        let ds: Box<dyn DataSource> = Box::new(NullSource::new());
        let id = ds.id();
        a.insert(ds);
        assert!(b.take(id).is_some());
    }

    #[tokio::test]
    async fn test_ismaster_reply_shape() {
        let ctx = test_ctx();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut session = Session::new(server, "test".into(), ctx, CursorStore::local());
        drop(client);

        let q = Query::internal(
            crate::core::Namespace::new("admin", "$cmd"),
            doc! { "isMaster": 1 },
        );
        let reply = session.command(&q).await.unwrap();
        assert_eq!(reply.get_i32("ok").unwrap(), 1);
        assert_eq!(reply.get_bool("ismaster").unwrap(), true);
        assert_eq!(reply.get_i32("maxWireVersion").unwrap(), 2);
        assert!(reply.get_datetime("localTime").is_ok());
    }

    #[tokio::test]
    async fn test_get_last_error_without_write() {
        let ctx = test_ctx();
        let (_client, server) = tokio::io::duplex(64 * 1024);
        let mut session = Session::new(server, "test".into(), ctx, CursorStore::local());

        let q = Query::internal(
            crate::core::Namespace::new("db", "$cmd"),
            doc! { "getLastError": 1 },
        );
        let reply = session.command(&q).await.unwrap();
        assert_eq!(reply.get_i32("ok").unwrap(), 1);
        assert_eq!(reply.get_i32("n").unwrap(), 0);
        assert!(matches!(reply.get("err"), Some(Bson::Null)));
    }

    #[tokio::test]
    async fn test_ping_requires_topology() {
        let ctx = test_ctx();
        let (_client, server) = tokio::io::duplex(64 * 1024);
        let mut session = Session::new(server, "test".into(), ctx, CursorStore::local());

        let q = Query::internal(crate::core::Namespace::new("db", "$cmd"), doc! { "ping": 1 });
        assert!(matches!(session.command(&q).await, Err(Error::NoShardConfig)));
    }

    #[tokio::test]
    async fn test_unknown_command_reply() {
        let ctx = test_ctx();
        let (_client, server) = tokio::io::duplex(64 * 1024);
        let mut session = Session::new(server, "test".into(), ctx, CursorStore::local());

        let q = Query::internal(
            crate::core::Namespace::new("db", "$cmd"),
            doc! { "frobnicate": 1 },
        );
        let reply = session.command(&q).await.unwrap();
        assert_eq!(reply.get_i32("ok").unwrap(), 0);
        assert_eq!(reply.get_str("err").unwrap(), "unknown command");
    }

    #[tokio::test]
    async fn test_getnonce_then_mismatched_authenticate() {
        let ctx = test_ctx();
        let (_client, server) = tokio::io::duplex(64 * 1024);
        let mut session = Session::new(server, "test".into(), ctx, CursorStore::local());

        let q = Query::internal(crate::core::Namespace::new("db", "$cmd"), doc! { "getnonce": 1 });
        let reply = session.command(&q).await.unwrap();
        let nonce = reply.get_str("nonce").unwrap().to_string();
        assert_eq!(nonce.len(), 16);

        let q = Query::internal(
            crate::core::Namespace::new("db", "$cmd"),
            doc! { "authenticate": 1, "user": "u", "nonce": "wrong", "key": "x" },
        );
        let reply = session.command(&q).await.unwrap();
        assert_eq!(reply.get_i32("ok").unwrap(), 0);
        assert_eq!(reply.get_i32("code").unwrap(), 18);
    }

    #[tokio::test]
    async fn test_feed_reports_missing_cursor() {
        let ctx = test_ctx();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let mut session = Session::new(server, "test".into(), ctx, CursorStore::local());

        let fed = session.feed(7, None, 0).await.unwrap();
        assert!(fed.is_none());

        let reply = wire::read_reply(&mut client, 7).await;
        // CURSOR_NOT_FOUND surfaces as the error our own reader raises
        assert!(matches!(reply, Err(Error::CursorNotFound(_))));
    }

    #[tokio::test]
    async fn test_feed_streams_fixed_source_and_closes() {
        let ctx = test_ctx();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let mut session = Session::new(server, "test".into(), ctx, CursorStore::local());

        let ds: Box<dyn DataSource> = Box::new(FixedSource::new(doc! { "ok": 1, "x": 42 }));
        let fed = session.feed(9, Some(ds), 0).await.unwrap().unwrap();
        assert!(fed.is_closed());

        let reply = wire::read_reply(&mut client, 9).await.unwrap();
        assert_eq!(reply.cursor_id, 0);
        assert_eq!(reply.documents.len(), 1);
        assert_eq!(reply.documents[0].get_i32("x").unwrap(), 42);
    }
}
