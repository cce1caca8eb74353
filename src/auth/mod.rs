/// Authentication and authorization.
///
/// Client auth is the nonce/challenge MONGODB-CR scheme; the same
/// primitives authenticate the router against backends using the keyfile
/// secret. Authorization is capability-based: a bitmask per database plus
/// a global bitmask, accumulated as the client authenticates.
use crate::config::{finite, options};
use crate::error::{Error, Result};
use bson::{doc, Bson, Document};
use log::{debug, error, warn};
use md5::{Digest, Md5};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

static SHARED_SECRET: OnceLock<String> = OnceLock::new();

/// The keyfile-derived digest shared with the backends; empty when
/// inter-node auth is disabled.
pub fn shared_secret() -> String {
    SHARED_SECRET.get().cloned().unwrap_or_default()
}

/// Loads the shared secret from a keyfile (base64 alphabet, whitespace
/// ignored).
pub fn load_secret(path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)?;
    let mut key = String::new();
    for c in raw.chars() {
        if c.is_whitespace() {
            continue;
        }
        if c.is_ascii_alphanumeric() || c == '=' || c == '+' || c == '/' {
            key.push(c);
        } else {
            return Err(Error::bad_request(format!("bad key file: {}", path.display())));
        }
    }
    if key.is_empty() {
        return Err(Error::bad_request(format!("bad key file: {}", path.display())));
    }
    let _ = SHARED_SECRET.set(make_digest("__system", &key));
    Ok(())
}

fn md5_hex(input: &[u8]) -> String {
    let digest = Md5::digest(input);
    let mut out = String::with_capacity(32);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// `MD5(user + ":mongo:" + password)`, the stored credential form.
pub fn make_digest(user: &str, passwd: &str) -> String {
    md5_hex(format!("{user}:mongo:{passwd}").as_bytes())
}

/// `MD5(nonce + user + digest)`, the challenge response.
pub fn make_auth_key(nonce: &str, user: &str, digest: &str) -> String {
    md5_hex(format!("{nonce}{user}{digest}").as_bytes())
}

/// Random 64-bit nonce as hex.
pub fn mknonce() -> String {
    let val: u64 = rand::thread_rng().gen();
    format!("{val:016x}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Execute queries and basic commands.
    Read = 1,
    /// Execute inserts, updates and deletes.
    Write = 2,
    /// Execute most of the commands.
    DbAdmin = 3,
    /// Access `<db>.system.users` in any way.
    UserAdmin = 4,
    /// Access replica set and sharding config.
    ClusterAdmin = 5,
}

fn mask(p: Privilege) -> u32 {
    1 << (p as u32)
}

/// Accumulated capabilities of one session.
#[derive(Debug, Clone, Default)]
pub struct Privileges {
    global_mask: u32,
    masks: HashMap<String, u32>,
}

impl Privileges {
    pub fn new() -> Privileges {
        Privileges::default()
    }

    /// All-capability set used by internal operations.
    pub fn root() -> Privileges {
        Privileges { global_mask: u32::MAX, masks: HashMap::new() }
    }

    pub fn authorized(&self, db: &str, p: Privilege) -> bool {
        let bit = mask(p);
        if self.global_mask & bit != 0 {
            return true;
        }
        self.masks.get(db).map(|m| m & bit != 0).unwrap_or(false)
    }

    /// No-op unless `--auth` is on.
    pub fn require(&self, db: &str, p: Privilege) -> Result<()> {
        if options().auth && !self.authorized(db, p) {
            return Err(Error::Unauthorized);
        }
        Ok(())
    }

    /// Verifies a challenge response against the cached credentials and,
    /// on success, folds the user's roles into this privilege set.
    pub fn auth(&mut self, db: &str, obj: &Document, user_doc: Document) -> bool {
        if !options().auth {
            return true;
        }

        let username = obj.get_str("user").unwrap_or("");
        let mut key = String::new();
        if !user_doc.is_empty() {
            key = user_doc
                .get_document("credentials")
                .ok()
                .and_then(|c| c.get_str("MONGODB-CR").ok())
                .unwrap_or("")
                .to_string();
            if key.is_empty() {
                key = user_doc.get_str("pwd").unwrap_or("").to_string();
            }
        }

        let response = obj.get_str("key").unwrap_or("");
        let nonce = obj.get_str("nonce").unwrap_or("");
        if key.is_empty() || response != make_auth_key(nonce, username, &key) {
            return false;
        }

        if let Ok(roles) = user_doc.get_array("roles") {
            if let Err(e) = self.apply_roles(db, roles) {
                error!("{e}");
                return false;
            }
        } else {
            // legacy user document: read, plus write unless readOnly
            let m = self.masks.entry(db.to_string()).or_insert(0);
            *m |= mask(Privilege::Read);
            let read_only = match user_doc.get("readOnly") {
                Some(Bson::Boolean(b)) => *b,
                Some(Bson::Int32(n)) => *n != 0,
                _ => false,
            };
            if !read_only {
                *m |= mask(Privilege::Write);
            }
        }

        if let Ok(other) = user_doc.get_document("otherDBRoles") {
            for (other_db, roles) in other {
                if let Bson::Array(roles) = roles {
                    if let Err(e) = self.apply_roles(other_db, roles) {
                        error!("{e}");
                        return false;
                    }
                }
            }
        }

        true
    }

    fn apply_roles(&mut self, db: &str, roles: &[Bson]) -> Result<()> {
        let mut newmask = 0u32;
        let mut newglobal = 0u32;
        let is_admin = db == "admin";

        for elt in roles {
            // other-database grants come in via otherDBRoles, so the role
            // always lands on `db` here
            let role = match elt {
                Bson::String(role) => role.clone(),
                Bson::Document(d) => d.get_str("role").unwrap_or("").to_string(),
                other => {
                    warn!("cannot parse role definition: {other}");
                    continue;
                }
            };

            match role.as_str() {
                "read" => newmask |= mask(Privilege::Read),
                "readWrite" => newmask |= mask(Privilege::Read) | mask(Privilege::Write),
                "dbAdmin" => newmask |= mask(Privilege::DbAdmin),
                "userAdmin" => newmask |= mask(Privilege::UserAdmin),
                "dbOwner" => {
                    newmask |= mask(Privilege::Read)
                        | mask(Privilege::Write)
                        | mask(Privilege::DbAdmin)
                        | mask(Privilege::UserAdmin)
                }
                "clusterAdmin" if is_admin => newglobal |= mask(Privilege::ClusterAdmin),
                "readAnyDatabase" if is_admin => newglobal |= mask(Privilege::Read),
                "readWriteAnyDatabase" if is_admin => {
                    newglobal |= mask(Privilege::Read) | mask(Privilege::Write)
                }
                "userAdminAnyDatabase" if is_admin => newglobal |= mask(Privilege::UserAdmin),
                "dbAdminAnyDatabase" if is_admin => newglobal |= mask(Privilege::DbAdmin),
                other => {
                    return Err(Error::ShardConfigBroken(format!(
                        "unknown privilege `{other}' for database `{db}'"
                    )))
                }
            }
        }

        *self.masks.entry(db.to_string()).or_insert(0) |= newmask;
        self.global_mask |= newglobal;
        Ok(())
    }
}

type CredentialsMap = HashMap<(String, String), Document>;

/// Copy-on-update cache of user documents, fetched from every database's
/// `system.users` collection and persisted in the disk cache.
pub struct CredentialsCache {
    cache: RwLock<Option<Arc<CredentialsMap>>>,
    disk: Arc<crate::topology::cache::DiskCache>,
}

impl CredentialsCache {
    pub fn new(disk: Arc<crate::topology::cache::DiskCache>) -> CredentialsCache {
        let cached = disk.get("auth");
        let cache = if cached.is_empty() { None } else { Some(Arc::new(Self::parse(&cached))) };
        CredentialsCache { cache: RwLock::new(cache), disk }
    }

    pub fn is_loaded(&self) -> bool {
        self.cache.read().is_some()
    }

    pub fn find(&self, db: &str, user: &str) -> Document {
        let map = self.cache.read().clone();
        map.and_then(|m| m.get(&(db.to_string(), user.to_string())).cloned())
            .unwrap_or_default()
    }

    /// Installs a freshly fetched credentials document.
    pub fn install(&self, obj: Document) {
        let parsed = Arc::new(Self::parse(&obj));
        *self.cache.write() = Some(parsed);
        self.disk.put("auth", obj);
    }

    fn parse(obj: &Document) -> CredentialsMap {
        let mut ret = CredentialsMap::new();
        for (dbname, users) in obj {
            let Bson::Array(users) = users else { continue };
            for user in users {
                let Some(user) = user.as_document() else { continue };
                let Ok(name) = user.get_str("user") else { continue };
                // admin-database entries may carry a target db and win
                // over per-database duplicates
                let target = if dbname == "admin" {
                    user.get_str("db").unwrap_or(dbname).to_string()
                } else {
                    dbname.to_string()
                };
                let key = (target, name.to_string());
                if ret.contains_key(&key) && dbname != "admin" {
                    continue;
                }
                ret.insert(key, user.clone());
            }
        }
        debug!("credentials cache holds {} user(s)", ret.len());
        ret
    }

    /// Read preference for credential fetches: a primary is preferred but
    /// not required, under the config-server deadlines.
    pub fn fetch_read_preference() -> Document {
        let mut pref = doc! { "mode": "primaryPreferred" };
        if let Some(t) = finite(options().conf_timeout) {
            pref.insert("timeoutMs", t.as_millis() as i64);
        }
        if let Some(t) = finite(options().conf_retransmit) {
            pref.insert("retransmitMs", t.as_millis() as i64);
        }
        pref
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_and_auth_key() {
        // MD5("alice:mongo:secret")
        let digest = make_digest("alice", "secret");
        assert_eq!(digest.len(), 32);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        // deterministic
        assert_eq!(digest, make_digest("alice", "secret"));
        assert_ne!(digest, make_digest("alice", "other"));

        let key = make_auth_key("abc", "alice", &digest);
        assert_eq!(key, make_auth_key("abc", "alice", &digest));
        assert_ne!(key, make_auth_key("abd", "alice", &digest));
    }

    #[test]
    fn test_nonce_shape() {
        let n1 = mknonce();
        let n2 = mknonce();
        assert_eq!(n1.len(), 16);
        assert_ne!(n1, n2);
    }

    #[test]
    fn test_role_table() {
        let mut p = Privileges::new();
        p.apply_roles("db1", &[Bson::String("readWrite".into())]).unwrap();
        assert!(p.authorized("db1", Privilege::Read));
        assert!(p.authorized("db1", Privilege::Write));
        assert!(!p.authorized("db1", Privilege::DbAdmin));
        assert!(!p.authorized("db2", Privilege::Read));

        p.apply_roles("db1", &[Bson::String("dbOwner".into())]).unwrap();
        assert!(p.authorized("db1", Privilege::DbAdmin));
        assert!(p.authorized("db1", Privilege::UserAdmin));
        assert!(!p.authorized("db1", Privilege::ClusterAdmin));
    }

    #[test]
    fn test_admin_global_roles() {
        let mut p = Privileges::new();
        p.apply_roles("admin", &[Bson::String("readAnyDatabase".into())]).unwrap();
        assert!(p.authorized("anything", Privilege::Read));
        assert!(!p.authorized("anything", Privilege::Write));

        // non-admin database cannot grant global roles
        let mut p = Privileges::new();
        assert!(p.apply_roles("db1", &[Bson::String("clusterAdmin".into())]).is_err());
    }

    #[test]
    fn test_root_has_everything() {
        let p = Privileges::root();
        assert!(p.authorized("any", Privilege::ClusterAdmin));
        assert!(p.require("any", Privilege::Write).is_ok());
    }

    #[test]
    fn test_credentials_parse_admin_precedence() {
        let obj = doc! {
            "db1": [ { "user": "u", "pwd": "x" } ],
            "admin": [ { "user": "u", "db": "db1", "pwd": "y" } ],
        };
        let map = CredentialsCache::parse(&obj);
        // iteration order puts db1 first or last either way: admin wins
        assert_eq!(
            map[&("db1".to_string(), "u".to_string())].get_str("pwd").unwrap(),
            "y"
        );
    }
}
