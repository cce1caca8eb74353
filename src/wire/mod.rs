/// MongoDB wire protocol framing.
///
/// Legacy message-framed protocol: every message starts with
/// `{length, request_id, response_to, opcode}` (all little-endian int32,
/// length includes itself), followed by an opcode-specific payload.
/// Document encoding is delegated to the `bson` crate.
pub mod messages;

use crate::core::Namespace;
use crate::error::{Error, Result};
use bson::Document;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Hard cap on any message, in either direction.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// The 4-byte prefix "GET " read as a little-endian u32. A client message
/// whose length field equals this is an HTTP request in disguise.
pub const HTTP_GET_MARKER: u32 = 0x2054_4547;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Opcode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
}

impl Opcode {
    pub fn from_i32(v: i32) -> Option<Opcode> {
        match v {
            1 => Some(Opcode::Reply),
            2001 => Some(Opcode::Update),
            2002 => Some(Opcode::Insert),
            2004 => Some(Opcode::Query),
            2005 => Some(Opcode::GetMore),
            2006 => Some(Opcode::Delete),
            2007 => Some(Opcode::KillCursors),
            _ => None,
        }
    }
}

/// Flags carried in an OP_REPLY header.
pub mod reply_flags {
    pub const CURSOR_NOT_FOUND: u32 = 0x01;
    pub const QUERY_FAILURE: u32 = 0x02;
    pub const SHARD_CONFIG_STALE: u32 = 0x04;
    pub const AWAIT_CAPABLE: u32 = 0x08;
}

/// An incoming client message, header plus unparsed payload.
///
/// `fetch_*` methods consume the payload left to right, the way the
/// per-opcode shapes are defined.
#[derive(Debug, Default)]
pub struct Message {
    data: Vec<u8>,
    pos: usize,
}

const HEADER_LEN: usize = 12; // request_id + response_to + opcode

impl Message {
    /// Wraps a message body (everything after the length field).
    pub fn new(data: Vec<u8>) -> Result<Message> {
        if data.len() < HEADER_LEN {
            return Err(Error::bad_request("message too short"));
        }
        Ok(Message { data, pos: HEADER_LEN })
    }

    pub fn request_id(&self) -> i32 {
        i32::from_le_bytes(self.data[0..4].try_into().unwrap())
    }

    pub fn response_to(&self) -> i32 {
        i32::from_le_bytes(self.data[4..8].try_into().unwrap())
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_i32(i32::from_le_bytes(self.data[8..12].try_into().unwrap()))
    }

    pub fn at_end(&self) -> bool {
        self.pos == self.data.len()
    }

    fn need(&self, len: usize) -> Result<()> {
        if self.pos + len > self.data.len() {
            Err(Error::bad_request("message truncated"))
        } else {
            Ok(())
        }
    }

    pub fn fetch_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let v = u32::from_le_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    pub fn fetch_i32(&mut self) -> Result<i32> {
        Ok(self.fetch_u32()? as i32)
    }

    pub fn fetch_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        let v = u64::from_le_bytes(self.data[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    /// NUL-terminated string.
    pub fn fetch_cstring(&mut self) -> Result<String> {
        let rest = &self.data[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::bad_request("unterminated string in message"))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|_| Error::bad_request("invalid utf-8 in message"))?
            .to_string();
        self.pos += nul + 1;
        Ok(s)
    }

    pub fn fetch_namespace(&mut self) -> Result<Namespace> {
        Namespace::parse(&self.fetch_cstring()?)
    }

    pub fn fetch_document(&mut self) -> Result<Document> {
        self.need(4)?;
        let len =
            u32::from_le_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap()) as usize;
        self.need(len)?;
        let doc = Document::from_reader(&mut &self.data[self.pos..self.pos + len])
            .map_err(|e| Error::bad_request(format!("bad document in message: {e}")))?;
        self.pos += len;
        Ok(doc)
    }
}

/// Outgoing message builder. Starts with a length placeholder that
/// `finish()` back-fills.
pub struct MsgBuilder {
    buf: BytesMut,
}

impl MsgBuilder {
    pub fn new() -> MsgBuilder {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u32_le(0);
        MsgBuilder { buf }
    }

    pub fn push_i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32_le(v);
        self
    }

    pub fn push_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn push_u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    pub fn push_opcode(&mut self, op: Opcode) -> &mut Self {
        self.buf.put_i32_le(op as i32);
        self
    }

    pub fn push_cstring(&mut self, s: &str) -> &mut Self {
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
        self
    }

    pub fn push_document(&mut self, doc: &Document) -> &mut Self {
        let mut raw = Vec::new();
        doc.to_writer(&mut raw).expect("document encoding cannot fail");
        self.buf.put_slice(&raw);
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_le_bytes());
        self.buf.to_vec()
    }
}

impl Default for MsgBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds OP_QUERY messages for backends.
pub struct QueryComposer {
    msg_id: u32,
    flags: u32,
    ns: Namespace,
    skip: i32,
    batch_size: i32,
    query: Document,
    field_selector: Option<Document>,
}

impl QueryComposer {
    pub fn new(ns: Namespace, query: Document) -> QueryComposer {
        QueryComposer {
            msg_id: 0,
            flags: 0,
            ns,
            skip: 0,
            batch_size: 0,
            query,
            field_selector: None,
        }
    }

    pub fn msg_id(mut self, id: u32) -> Self {
        self.msg_id = id;
        self
    }

    pub fn skip(mut self, n: i32) -> Self {
        self.skip = n;
        self
    }

    pub fn batch_size(mut self, n: i32) -> Self {
        self.batch_size = n;
        self
    }

    pub fn field_selector(mut self, sel: Option<Document>) -> Self {
        self.field_selector = sel;
        self
    }

    pub fn slave_ok(mut self) -> Self {
        self.flags |= messages::query_flags::SLAVE_OK;
        self
    }

    pub fn data(&self) -> Vec<u8> {
        // Commands expect a batch size of 1 unless told otherwise.
        let batch = if self.batch_size == 0 && self.ns.collection() == "$cmd" {
            1
        } else {
            self.batch_size
        };

        let mut b = MsgBuilder::new();
        b.push_u32(self.msg_id)
            .push_u32(0)
            .push_opcode(Opcode::Query)
            .push_u32(self.flags)
            .push_cstring(self.ns.ns())
            .push_i32(self.skip)
            .push_i32(batch)
            .push_document(&self.query);
        if let Some(sel) = &self.field_selector {
            b.push_document(sel);
        }
        b.finish()
    }
}

/// One parsed OP_REPLY from a backend.
#[derive(Debug)]
pub struct Reply {
    pub cursor_id: u64,
    pub starting_from: u32,
    pub documents: Vec<Document>,
}

/// Reads one OP_REPLY off `stream`, verifying it answers `msg_id`.
///
/// Header flags and in-band error documents are translated into the error
/// taxonomy here, so callers only ever see well-formed result batches.
pub async fn read_reply<S>(stream: &mut S, msg_id: u32) -> Result<Reply>
where
    S: AsyncRead + Unpin,
{
    let msglen = stream.read_u32_le().await? as usize;
    if msglen < 4 + HEADER_LEN + 20 {
        return Err(Error::backend_internal("response too short"));
    }
    if msglen > MAX_MESSAGE_SIZE {
        return Err(Error::backend_internal("response too long"));
    }

    let _request_id = stream.read_u32_le().await?;
    let response_to = stream.read_u32_le().await?;
    let opcode = stream.read_i32_le().await?;
    if response_to != msg_id {
        return Err(Error::backend_internal("msg_id mismatch in reply"));
    }
    if Opcode::from_i32(opcode) != Some(Opcode::Reply) {
        return Err(Error::backend_internal("unexpected opcode in reply"));
    }

    let flags = stream.read_u32_le().await?;
    let cursor_id = stream.read_u64_le().await?;
    let starting_from = stream.read_u32_le().await?;
    let number_returned = stream.read_u32_le().await?;

    if flags & reply_flags::CURSOR_NOT_FOUND != 0 {
        return Err(Error::CursorNotFound("reported by backend".into()));
    }
    if flags & reply_flags::SHARD_CONFIG_STALE != 0 {
        return Err(Error::ShardConfigStale("reported by backend".into()));
    }

    let mut documents = Vec::with_capacity(number_returned as usize);
    for _ in 0..number_returned {
        let len = stream.read_u32_le().await? as usize;
        if len < 5 || len > MAX_MESSAGE_SIZE {
            return Err(Error::backend_internal("bad document length in reply"));
        }
        let mut raw = vec![0u8; len];
        raw[0..4].copy_from_slice(&(len as u32).to_le_bytes());
        stream.read_exact(&mut raw[4..]).await?;
        let doc = Document::from_reader(&mut raw.as_slice())
            .map_err(|e| Error::backend_internal(format!("bad document in reply: {e}")))?;

        if flags & reply_flags::QUERY_FAILURE != 0 {
            if doc.get_i32("code").unwrap_or(0) == 13435 {
                return Err(Error::NotMaster);
            }
            let msg = doc.get_str("$err").unwrap_or("unknown query failure");
            return Err(Error::QueryFailure(msg.to_string()));
        }
        documents.push(doc);
    }

    Ok(Reply { cursor_id, starting_from, documents })
}

/// Builds an OP_GET_MORE message.
pub fn get_more_msg(msg_id: u32, ns: &Namespace, batch: i32, cursor_id: u64) -> Vec<u8> {
    let mut b = MsgBuilder::new();
    b.push_u32(msg_id)
        .push_u32(0)
        .push_opcode(Opcode::GetMore)
        .push_u32(0)
        .push_cstring(ns.ns())
        .push_i32(batch)
        .push_u64(cursor_id);
    b.finish()
}

/// Builds an OP_KILL_CURSORS message for a single cursor.
pub fn kill_cursors_msg(cursor_id: u64) -> Vec<u8> {
    let mut b = MsgBuilder::new();
    b.push_u32(0)
        .push_u32(0)
        .push_opcode(Opcode::KillCursors)
        .push_u32(0)
        .push_u32(1)
        .push_u64(cursor_id);
    b.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn strip_len(msg: Vec<u8>) -> Message {
        let len = u32::from_le_bytes(msg[0..4].try_into().unwrap()) as usize;
        assert_eq!(len, msg.len());
        Message::new(msg[4..].to_vec()).unwrap()
    }

    #[test]
    fn test_query_composer_shape() {
        let ns = Namespace::parse("db.coll").unwrap();
        let data = QueryComposer::new(ns, doc! { "k": 5 })
            .msg_id(7)
            .skip(3)
            .batch_size(10)
            .slave_ok()
            .data();

        let mut msg = strip_len(data);
        assert_eq!(msg.request_id(), 7);
        assert_eq!(msg.opcode(), Some(Opcode::Query));
        assert_eq!(msg.fetch_u32().unwrap(), messages::query_flags::SLAVE_OK);
        assert_eq!(msg.fetch_cstring().unwrap(), "db.coll");
        assert_eq!(msg.fetch_i32().unwrap(), 3);
        assert_eq!(msg.fetch_i32().unwrap(), 10);
        assert_eq!(msg.fetch_document().unwrap(), doc! { "k": 5 });
        assert!(msg.at_end());
    }

    #[test]
    fn test_command_batch_size_defaults_to_one() {
        let ns = Namespace::parse("admin.$cmd").unwrap();
        let data = QueryComposer::new(ns, doc! { "ping": 1 }).data();
        let mut msg = strip_len(data);
        msg.fetch_u32().unwrap();
        msg.fetch_cstring().unwrap();
        msg.fetch_i32().unwrap();
        assert_eq!(msg.fetch_i32().unwrap(), 1);
    }

    #[test]
    fn test_get_more_and_kill_cursors_shapes() {
        let ns = Namespace::parse("db.coll").unwrap();
        let mut msg = strip_len(get_more_msg(9, &ns, 0, 0xDEAD));
        assert_eq!(msg.opcode(), Some(Opcode::GetMore));
        assert_eq!(msg.fetch_u32().unwrap(), 0);
        assert_eq!(msg.fetch_cstring().unwrap(), "db.coll");
        assert_eq!(msg.fetch_i32().unwrap(), 0);
        assert_eq!(msg.fetch_u64().unwrap(), 0xDEAD);

        let mut msg = strip_len(kill_cursors_msg(0xBEEF));
        assert_eq!(msg.opcode(), Some(Opcode::KillCursors));
        assert_eq!(msg.fetch_u32().unwrap(), 0);
        assert_eq!(msg.fetch_u32().unwrap(), 1);
        assert_eq!(msg.fetch_u64().unwrap(), 0xBEEF);
    }

    #[test]
    fn test_message_truncation_detected() {
        let mut b = MsgBuilder::new();
        b.push_u32(1).push_u32(0).push_opcode(Opcode::Query).push_u32(0);
        let raw = b.finish();
        let mut msg = Message::new(raw[4..].to_vec()).unwrap();
        assert_eq!(msg.fetch_u32().unwrap(), 0);
        assert!(msg.fetch_document().is_err());
    }

    fn encode_reply(flags: u32, cursor_id: u64, docs: &[Document]) -> Vec<u8> {
        let mut b = MsgBuilder::new();
        b.push_u32(1)
            .push_u32(42)
            .push_opcode(Opcode::Reply)
            .push_u32(flags)
            .push_u64(cursor_id)
            .push_u32(0)
            .push_u32(docs.len() as u32);
        for d in docs {
            b.push_document(d);
        }
        b.finish()
    }

    #[tokio::test]
    async fn test_read_reply_happy_path() {
        let raw = encode_reply(0, 99, &[doc! { "a": 1 }, doc! { "a": 2 }]);
        let reply = read_reply(&mut raw.as_slice(), 42).await.unwrap();
        assert_eq!(reply.cursor_id, 99);
        assert_eq!(reply.documents.len(), 2);
        assert_eq!(reply.documents[1], doc! { "a": 2 });
    }

    #[tokio::test]
    async fn test_read_reply_flag_mapping() {
        let raw = encode_reply(reply_flags::SHARD_CONFIG_STALE, 0, &[]);
        match read_reply(&mut raw.as_slice(), 42).await {
            Err(Error::ShardConfigStale(_)) => {}
            other => panic!("expected stale config, got {other:?}"),
        }

        let raw = encode_reply(reply_flags::QUERY_FAILURE, 0, &[doc! { "$err": "boom" }]);
        match read_reply(&mut raw.as_slice(), 42).await {
            Err(Error::QueryFailure(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected query failure, got {other:?}"),
        }

        let raw = encode_reply(
            reply_flags::QUERY_FAILURE,
            0,
            &[doc! { "$err": "not master", "code": 13435 }],
        );
        assert!(matches!(read_reply(&mut raw.as_slice(), 42).await, Err(Error::NotMaster)));
    }

    #[tokio::test]
    async fn test_read_reply_msg_id_mismatch() {
        let raw = encode_reply(0, 0, &[]);
        assert!(matches!(
            read_reply(&mut raw.as_slice(), 7).await,
            Err(Error::BackendInternal(_))
        ));
    }
}
