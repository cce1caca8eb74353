/// Client-facing message shapes, one struct per opcode.
///
/// Inserts, updates and deletes exist in two flavours: the legacy
/// per-opcode wire form and the command-style batch (`{insert: "coll",
/// documents: [...]}`); both parse into the same structs so the write
/// pipeline sees a single shape.
use super::Message;
use crate::core::Namespace;
use crate::error::{Error, Result};
use bson::{doc, Bson, Document};

pub mod query_flags {
    pub const TAILABLE: u32 = 0x02;
    pub const SLAVE_OK: u32 = 0x04;
    pub const NO_TIMEOUT: u32 = 0x10;
    pub const AWAIT_DATA: u32 = 0x20;
    pub const EXHAUST: u32 = 0x40;
    pub const PARTIAL: u32 = 0x80;
}

mod update_flags {
    pub const UPSERT: u32 = 1;
    pub const MULTI: u32 = 2;
}

mod insert_flags {
    pub const CONTINUE_ON_ERROR: u32 = 1;
}

mod delete_flags {
    pub const SINGLE: u32 = 1;
}

#[derive(Debug, Clone)]
pub struct Query {
    pub flags: u32,
    pub ns: Namespace,
    pub n_to_skip: i32,
    pub n_to_return: i32,
    pub query: Document,
    pub field_selector: Option<Document>,

    /// The selector proper, unwrapped from `{query: ...}` / `{$query: ...}`.
    pub criteria: Document,
    /// The wrapping properties (`$orderby`, `$readPreference`, ...), if any.
    pub properties: Document,
}

impl Query {
    pub fn parse(msg: &mut Message) -> Result<Query> {
        let flags = msg.fetch_u32()?;
        let ns = msg.fetch_namespace()?;
        let n_to_skip = msg.fetch_i32()?;
        let n_to_return = msg.fetch_i32()?;
        let query = msg.fetch_document()?;
        let field_selector = if msg.at_end() { None } else { Some(msg.fetch_document()?) };

        let (criteria, properties) = Self::split(query.clone());
        Ok(Query { flags, ns, n_to_skip, n_to_return, query, field_selector, criteria, properties })
    }

    /// Internal query, used by the topology holder and credentials cache.
    pub fn internal(ns: Namespace, query: Document) -> Query {
        let (criteria, properties) = Self::split(query.clone());
        Query {
            flags: 0,
            ns,
            n_to_skip: 0,
            n_to_return: 0,
            query,
            field_selector: None,
            criteria,
            properties,
        }
    }

    fn split(q: Document) -> (Document, Document) {
        let wrapped = q
            .iter()
            .next()
            .map(|(k, _)| k == "query" || k == "$query")
            .unwrap_or(false);
        if wrapped {
            let criteria = q
                .iter()
                .next()
                .and_then(|(_, v)| v.as_document().cloned())
                .unwrap_or_default();
            (criteria, q)
        } else {
            (q, Document::new())
        }
    }

    pub fn read_preference(&self) -> Document {
        self.properties
            .get_document("$readPreference")
            .cloned()
            .unwrap_or_default()
    }

    pub fn order_by(&self) -> Document {
        self.properties
            .get_document("$orderby")
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_command(&self) -> bool {
        self.ns.collection() == "$cmd"
    }
}

#[derive(Debug, Clone)]
pub struct UpdateSub {
    pub selector: Document,
    pub update: Document,
    pub upsert: bool,
    pub multi: bool,
}

#[derive(Debug, Clone)]
pub struct Update {
    pub ns: Namespace,
    pub subops: Vec<UpdateSub>,
    pub ordered: bool,
    pub write_concern: Document,
}

#[derive(Debug, Clone)]
pub struct Insert {
    pub ns: Namespace,
    pub subops: Vec<Document>,
    pub ordered: bool,
    pub write_concern: Document,
}

#[derive(Debug, Clone)]
pub struct DeleteSub {
    pub selector: Document,
    pub limit: u32,
}

#[derive(Debug, Clone)]
pub struct Delete {
    pub ns: Namespace,
    pub subops: Vec<DeleteSub>,
    pub ordered: bool,
    pub write_concern: Document,
}

/// `w: 1` is implied when the concern carries no `w` at all.
fn patch_write_concern(concern: Document) -> Document {
    if concern.contains_key("w") {
        return concern;
    }
    let mut out = doc! { "w": 1 };
    for (k, v) in concern {
        out.insert(k, v);
    }
    out
}

fn command_batch(
    db: &str,
    cmd: &Document,
    title: &str,
    subops_key: &str,
) -> Result<(Namespace, Vec<Document>, bool, Document)> {
    let coll = cmd
        .get_str(title)
        .map_err(|_| Error::bad_request(format!("{title}: collection name required")))?;
    let ns = Namespace::new(db, coll);

    let mut subops = Vec::new();
    match cmd.get_array(subops_key) {
        Ok(arr) => {
            for elt in arr {
                match elt {
                    Bson::Document(d) => subops.push(d.clone()),
                    _ => return Err(Error::bad_request(format!("bad element in {subops_key}"))),
                }
            }
        }
        Err(_) => return Err(Error::bad_request(format!("{subops_key} array required"))),
    }

    let ordered = cmd.get_bool("ordered").unwrap_or(true);
    let concern = patch_write_concern(
        cmd.get_document("writeConcern").cloned().unwrap_or_else(|_| doc! { "w": 1 }),
    );
    Ok((ns, subops, ordered, concern))
}

impl Update {
    pub fn parse(msg: &mut Message) -> Result<Update> {
        let _zero = msg.fetch_i32()?;
        let ns = msg.fetch_namespace()?;
        let flags = msg.fetch_u32()?;
        let selector = msg.fetch_document()?;
        let update = msg.fetch_document()?;
        Ok(Update {
            ns,
            subops: vec![UpdateSub {
                selector,
                update,
                upsert: flags & update_flags::UPSERT != 0,
                multi: flags & update_flags::MULTI != 0,
            }],
            ordered: false,
            write_concern: Document::new(),
        })
    }

    pub fn from_command(db: &str, cmd: &Document) -> Result<Update> {
        let (ns, raw, ordered, write_concern) = command_batch(db, cmd, "update", "updates")?;
        let mut subops = Vec::with_capacity(raw.len());
        for obj in raw {
            subops.push(UpdateSub {
                selector: obj.get_document("q").cloned().unwrap_or_default(),
                update: obj.get_document("u").cloned().unwrap_or_default(),
                upsert: obj.get_bool("upsert").unwrap_or(false),
                multi: obj.get_bool("multi").unwrap_or(false),
            });
        }
        Ok(Update { ns, subops, ordered, write_concern })
    }
}

impl Insert {
    pub fn parse(msg: &mut Message) -> Result<Insert> {
        let flags = msg.fetch_u32()?;
        let ns = msg.fetch_namespace()?;
        let mut subops = Vec::new();
        while !msg.at_end() {
            subops.push(msg.fetch_document()?);
        }
        Ok(Insert {
            ns,
            subops,
            ordered: flags & insert_flags::CONTINUE_ON_ERROR == 0,
            write_concern: Document::new(),
        })
    }

    pub fn from_command(db: &str, cmd: &Document) -> Result<Insert> {
        let (ns, subops, ordered, write_concern) = command_batch(db, cmd, "insert", "documents")?;
        Ok(Insert { ns, subops, ordered, write_concern })
    }
}

impl Delete {
    pub fn parse(msg: &mut Message) -> Result<Delete> {
        let _zero = msg.fetch_i32()?;
        let ns = msg.fetch_namespace()?;
        let flags = msg.fetch_u32()?;
        let selector = msg.fetch_document()?;
        Ok(Delete {
            ns,
            subops: vec![DeleteSub {
                selector,
                limit: if flags & delete_flags::SINGLE != 0 { 1 } else { 0 },
            }],
            ordered: false,
            write_concern: Document::new(),
        })
    }

    pub fn from_command(db: &str, cmd: &Document) -> Result<Delete> {
        let (ns, raw, ordered, write_concern) = command_batch(db, cmd, "delete", "deletes")?;
        let mut subops = Vec::with_capacity(raw.len());
        for obj in raw {
            subops.push(DeleteSub {
                selector: obj.get_document("q").cloned().unwrap_or_default(),
                limit: obj.get_i32("limit").unwrap_or(0).max(0) as u32,
            });
        }
        Ok(Delete { ns, subops, ordered, write_concern })
    }
}

#[derive(Debug)]
pub struct GetMore {
    pub ns: Namespace,
    pub n_to_return: i32,
    pub cursor_id: u64,
}

impl GetMore {
    pub fn parse(msg: &mut Message) -> Result<GetMore> {
        let _zero = msg.fetch_i32()?;
        let ns = msg.fetch_namespace()?;
        let n_to_return = msg.fetch_i32()?;
        let cursor_id = msg.fetch_u64()?;
        Ok(GetMore { ns, n_to_return, cursor_id })
    }
}

#[derive(Debug)]
pub struct KillCursors {
    pub cursor_ids: Vec<u64>,
}

impl KillCursors {
    pub fn parse(msg: &mut Message) -> Result<KillCursors> {
        let _zero = msg.fetch_i32()?;
        let count = msg.fetch_u32()?;
        let mut cursor_ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            cursor_ids.push(msg.fetch_u64()?);
        }
        Ok(KillCursors { cursor_ids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{MsgBuilder, Opcode};

    fn body(b: MsgBuilder) -> Message {
        let raw = b.finish();
        Message::new(raw[4..].to_vec()).unwrap()
    }

    #[test]
    fn test_query_parse_and_split() {
        let mut b = MsgBuilder::new();
        b.push_u32(1)
            .push_u32(0)
            .push_opcode(Opcode::Query)
            .push_u32(query_flags::SLAVE_OK)
            .push_cstring("db.coll")
            .push_i32(2)
            .push_i32(5)
            .push_document(&doc! {
                "$query": { "k": 1 },
                "$orderby": { "k": -1 },
                "$readPreference": { "mode": "nearest" },
            });
        let mut msg = body(b);
        let q = Query::parse(&mut msg).unwrap();
        assert_eq!(q.ns.ns(), "db.coll");
        assert_eq!(q.n_to_skip, 2);
        assert_eq!(q.n_to_return, 5);
        assert_eq!(q.criteria, doc! { "k": 1 });
        assert_eq!(q.order_by(), doc! { "k": -1 });
        assert_eq!(q.read_preference().get_str("mode").unwrap(), "nearest");
        assert!(!q.is_command());
    }

    #[test]
    fn test_bare_query_has_no_properties() {
        let q = Query::internal(Namespace::new("db", "coll"), doc! { "k": 7 });
        assert_eq!(q.criteria, doc! { "k": 7 });
        assert!(q.properties.is_empty());
        assert!(q.order_by().is_empty());
    }

    #[test]
    fn test_wire_update_flags() {
        let mut b = MsgBuilder::new();
        b.push_u32(1)
            .push_u32(0)
            .push_opcode(Opcode::Update)
            .push_i32(0)
            .push_cstring("db.coll")
            .push_u32(update_flags::UPSERT | update_flags::MULTI)
            .push_document(&doc! { "k": 1 })
            .push_document(&doc! { "$set": { "x": 2 } });
        let upd = Update::parse(&mut body(b)).unwrap();
        assert_eq!(upd.subops.len(), 1);
        assert!(upd.subops[0].upsert);
        assert!(upd.subops[0].multi);
        assert!(upd.write_concern.is_empty());
    }

    #[test]
    fn test_wire_insert_multiple_documents() {
        let mut b = MsgBuilder::new();
        b.push_u32(1)
            .push_u32(0)
            .push_opcode(Opcode::Insert)
            .push_u32(0)
            .push_cstring("db.coll")
            .push_document(&doc! { "a": 1 })
            .push_document(&doc! { "a": 2 });
        let ins = Insert::parse(&mut body(b)).unwrap();
        assert_eq!(ins.subops.len(), 2);
        assert!(ins.ordered);
    }

    #[test]
    fn test_command_insert_batch() {
        let cmd = doc! {
            "insert": "coll",
            "documents": [ { "a": 1 }, { "a": 2 }, { "a": 3 } ],
            "ordered": false,
            "writeConcern": { "j": true },
        };
        let ins = Insert::from_command("db", &cmd).unwrap();
        assert_eq!(ins.ns.ns(), "db.coll");
        assert_eq!(ins.subops.len(), 3);
        assert!(!ins.ordered);
        // missing `w` is patched to w: 1
        assert_eq!(ins.write_concern.get_i32("w").unwrap(), 1);
        assert_eq!(ins.write_concern.get_bool("j").unwrap(), true);
    }

    #[test]
    fn test_command_delete_batch() {
        let cmd = doc! {
            "delete": "coll",
            "deletes": [ { "q": { "k": 5 }, "limit": 1 } ],
        };
        let del = Delete::from_command("db", &cmd).unwrap();
        assert_eq!(del.subops[0].limit, 1);
        assert!(del.ordered);
    }

    #[test]
    fn test_kill_cursors_parse() {
        let mut b = MsgBuilder::new();
        b.push_u32(1)
            .push_u32(0)
            .push_opcode(Opcode::KillCursors)
            .push_i32(0)
            .push_u32(2)
            .push_u64(10)
            .push_u64(20);
        let kill = KillCursors::parse(&mut body(b)).unwrap();
        assert_eq!(kill.cursor_ids, vec![10, 20]);
    }
}
