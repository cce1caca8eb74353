/// A pooled connection to one backend endpoint.
///
/// The first send over a connection is fused with authentication and the
/// shard-version handshake: `establish` always has a payload to write, so a
/// half-dead socket is detected on the spot and the whole sequence is
/// replayed on a fresh one. Failures are therefore indistinguishable from a
/// dead peer and safe to retry on another endpoint.
use crate::auth;
use crate::core::backend::Backend;
use crate::core::endpoint::Endpoint;
use crate::core::{ChunkVersion, Namespace};
use crate::error::{Error, Result};
use crate::topology;
use crate::wire::{self, QueryComposer};
use bson::{doc, Document};
use log::{debug, error};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

const SET_VERSION_REQ_ID: u32 = 0x5654_4553; // "SETV"
const AUTH_REQ_ID: u32 = 0x0A48_5441; // "ATH\n"

pub struct Connection {
    endpoint: Arc<Endpoint>,
    is_primary: bool,
    authenticated: bool,
    stream: Option<BufStream<TcpStream>>,
    versions: HashMap<String, ChunkVersion>,
}

impl Connection {
    pub fn new(endpoint: Arc<Endpoint>, is_primary: bool) -> Connection {
        Connection {
            endpoint,
            is_primary,
            authenticated: false,
            stream: None,
            versions: HashMap::new(),
        }
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn backend(&self) -> Option<Arc<Backend>> {
        self.endpoint.backend()
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn stream(&mut self) -> &mut BufStream<TcpStream> {
        self.stream.as_mut().expect("connection not established")
    }

    /// Initiates the connection if necessary, associates it with version `v`
    /// of collection `ns`, and sends `payload`.
    pub async fn establish(
        &mut self,
        ns: &Namespace,
        v: &ChunkVersion,
        payload: &[u8],
    ) -> Result<()> {
        if self.stream.is_some() {
            match self.send_over_current(ns, v, payload).await {
                Ok(()) => return Ok(()),
                Err(Error::Io(e)) => {
                    debug!("cached connection to {} unusable: {e}", self.endpoint.addr());
                    self.endpoint.flush().await;
                }
                Err(other) => return Err(other),
            }
        }

        self.versions.clear();
        self.authenticated = false;
        let sock = TcpStream::connect(self.endpoint.addr()).await?;
        sock.set_nodelay(true)?;
        self.stream = Some(BufStream::new(sock));
        self.send_over_current(ns, v, payload).await
    }

    async fn send_over_current(
        &mut self,
        ns: &Namespace,
        v: &ChunkVersion,
        payload: &[u8],
    ) -> Result<()> {
        self.authenticate().await?;
        if self.is_primary && !ns.is_empty() && !v.is_zero() {
            self.try_set_version(ns, v).await?;
        }
        let s = self.stream();
        s.write_all(payload).await?;
        s.flush().await?;
        Ok(())
    }

    /// One-time per connection inter-node authentication (nonce + MD5 key).
    async fn authenticate(&mut self) -> Result<()> {
        let secret = auth::shared_secret();
        if self.authenticated || secret.is_empty() {
            return Ok(());
        }

        debug!("authenticating in {}", self.endpoint.addr());
        let addr = self.endpoint.addr().to_string();
        let local_cmd = Namespace::new("local", "$cmd");

        let msg = QueryComposer::new(local_cmd.clone(), doc! { "getnonce": 1 })
            .msg_id(AUTH_REQ_ID)
            .batch_size(1)
            .data();
        let s = self.stream();
        s.write_all(&msg).await?;
        s.flush().await?;
        let reply = wire::read_reply(s, AUTH_REQ_ID).await?;
        let ret = reply
            .documents
            .first()
            .ok_or_else(|| Error::backend_internal(format!("{addr}: empty getnonce reply")))?;
        if !cmd_ok(ret) {
            return Err(Error::backend_internal(format!("{addr}: getnonce refused")));
        }
        let nonce = ret
            .get_str("nonce")
            .map_err(|_| Error::backend_internal(format!("{addr}: no nonce in reply")))?;

        let msg = QueryComposer::new(
            local_cmd,
            doc! {
                "authenticate": 1,
                "user": "__system",
                "nonce": nonce,
                "key": auth::make_auth_key(nonce, "__system", &secret),
            },
        )
        .msg_id(AUTH_REQ_ID + 1)
        .batch_size(1)
        .data();
        let s = self.stream();
        s.write_all(&msg).await?;
        s.flush().await?;
        let reply = wire::read_reply(s, AUTH_REQ_ID + 1).await?;
        let ret = reply
            .documents
            .first()
            .ok_or_else(|| Error::backend_internal(format!("{addr}: empty authenticate reply")))?;
        if !cmd_ok(ret) {
            let msg = ret.get_str("errmsg").unwrap_or("unknown error");
            return Err(Error::backend_internal(format!("{addr}: authentication failed: {msg}")));
        }

        self.authenticated = true;
        Ok(())
    }

    /// Advertises the current chunk version for `ns` to the backend.
    async fn try_set_version(&mut self, ns: &Namespace, v: &ChunkVersion) -> Result<()> {
        if self.versions.get(ns.ns()) == Some(v) {
            return Ok(());
        }

        let backend = self
            .backend()
            .ok_or_else(|| Error::backend_internal("backend gone during handshake"))?;
        let shard = backend.shard();
        debug!("updating shard version for {ns} on {} to {v}", self.endpoint.addr());

        for attempt in 0..2 {
            let mut cmd = doc! {
                "setShardVersion": ns.ns(),
                "configdb": topology::config_connstr(),
                "version": v.stamp,
                "versionEpoch": v.epoch,
            };
            if backend.software_version() < crate::core::SoftwareVersion::new(&[3, 0]) {
                cmd.insert("serverID", crate::server_id());
            }
            if let Some(shard) = &shard {
                cmd.insert("shard", shard.id());
                cmd.insert("shardHost", shard.connection_string());
            }
            cmd.insert("authoritative", true);

            let msg = QueryComposer::new(Namespace::new("admin", "$cmd"), cmd)
                .msg_id(SET_VERSION_REQ_ID)
                .batch_size(1)
                .data();
            let s = self.stream();
            s.write_all(&msg).await?;
            s.flush().await?;

            let reply = wire::read_reply(s, SET_VERSION_REQ_ID).await?;
            let ret = reply
                .documents
                .first()
                .ok_or_else(|| Error::backend_internal("empty setShardVersion reply"))?;
            if cmd_ok(ret) {
                self.versions.insert(ns.ns().to_string(), v.clone());
                return Ok(());
            }

            let errmsg = ret.get_str("errmsg").unwrap_or("").to_string();
            if errmsg == "not master" {
                return Err(Error::NotMaster);
            } else if errmsg.contains("all servers down") {
                debug!("{} went crazy during handshake, retrying", backend.addr());
                if attempt == 0 {
                    continue;
                }
                return Err(Error::ShardConfigStale(errmsg));
            } else if errmsg.contains("metadata manager failed to initialize") {
                error!("{} permanently incapable of operating as master", backend.addr());
                backend.permanently_failed(&errmsg);
                self.step_down(Duration::from_secs(3600)).await;
                return Err(Error::PermanentFailure {
                    addr: backend.addr().to_string(),
                    message: errmsg,
                });
            } else if errmsg.contains("None of the hosts for replica set") {
                return Err(Error::Connectivity(errmsg));
            } else {
                return Err(Error::ShardConfigStale(errmsg));
            }
        }
        unreachable!("set-shard-version retry loop exits via return")
    }

    /// Asks the node to step down from primaryship. Best-effort.
    async fn step_down(&mut self, duration: Duration) {
        let cmd = doc! {
            "replSetStepDown": duration.as_secs() as i64,
            "force": true,
        };
        let msg = QueryComposer::new(Namespace::new("admin", "$cmd"), cmd)
            .batch_size(1)
            .data();
        let s = self.stream();
        if s.write_all(&msg).await.is_ok() && s.flush().await.is_ok() {
            let _ = wire::read_reply(s, 0).await;
        }
    }

    /// True once a socket has been opened for this connection.
    pub fn is_established(&self) -> bool {
        self.stream.is_some()
    }

    /// Puts the connection back into its endpoint's pool for reuse. Called
    /// only on the happy path; a connection dropped instead is simply closed.
    pub async fn release(self) {
        let endpoint = self.endpoint.clone();
        endpoint.release(self).await;
    }
}

fn cmd_ok(doc: &Document) -> bool {
    match doc.get("ok") {
        Some(bson::Bson::Int32(n)) => *n == 1,
        Some(bson::Bson::Int64(n)) => *n == 1,
        Some(bson::Bson::Double(d)) => *d == 1.0,
        Some(bson::Bson::Boolean(b)) => *b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_ok_accepts_numeric_variants() {
        assert!(cmd_ok(&doc! { "ok": 1 }));
        assert!(cmd_ok(&doc! { "ok": 1.0 }));
        assert!(cmd_ok(&doc! { "ok": 1_i64 }));
        assert!(!cmd_ok(&doc! { "ok": 0 }));
        assert!(!cmd_ok(&doc! { "errmsg": "nope" }));
    }
}
