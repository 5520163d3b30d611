//! The access-user store.

use std::collections::HashMap;
use std::path::Path;

use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::flags::FlagSet;
use super::hostmask::matches_mask;
use crate::error::{AgentError, AgentResult};
use crate::keystore::Keystore;

/// One access entry, keyed by handle (case-insensitive, unique).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessUser {
    pub handle: String,
    /// Argon2 PHC string, when a password is set.
    #[serde(default)]
    pub password_hash: Option<String>,
    /// Ordered patterns; the first match wins.
    #[serde(default)]
    pub hostmasks: Vec<String>,
    #[serde(default)]
    pub global_flags: FlagSet,
    #[serde(default)]
    pub channel_flags: HashMap<String, FlagSet>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub info: Option<String>,
    pub last_modified: DateTime<Utc>,
}

impl AccessUser {
    fn new(handle: &str) -> AccessUser {
        let now = Utc::now();
        AccessUser {
            handle: handle.to_string(),
            password_hash: None,
            hostmasks: Vec::new(),
            global_flags: FlagSet::new(),
            channel_flags: HashMap::new(),
            created_at: now,
            last_seen: None,
            info: None,
            last_modified: now,
        }
    }

    /// True when the user holds `flag` for `channel`, directly or via a
    /// cascading global flag. `n` and `m` satisfy every check.
    pub fn has_flag(&self, channel: Option<&str>, flag: char) -> bool {
        if self.global_flags.contains('n') || self.global_flags.contains('m') {
            return true;
        }
        if self.global_flags.contains(flag) {
            return true;
        }
        match channel {
            Some(chan) => self
                .channel_flags
                .get(&chan.to_ascii_lowercase())
                .is_some_and(|f| f.contains(flag)),
            None => false,
        }
    }
}

/// On-disk document shape: `{ "users": [...], "lastModified": ... }`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserDocument {
    users: Vec<AccessUser>,
    last_modified: DateTime<Utc>,
}

struct Inner {
    /// Insertion-ordered; lookup order is database order.
    users: Vec<AccessUser>,
    last_modified: DateTime<Utc>,
    dirty: bool,
}

/// The shared user database. Internally single-writer: all mutation goes
/// through `&self` methods that take the write guard; readers get clones.
pub struct UserDb {
    inner: RwLock<Inner>,
    /// Mutations fan out here so the mesh can replicate them.
    updates: broadcast::Sender<AccessUser>,
}

impl UserDb {
    pub fn new() -> UserDb {
        let (updates, _) = broadcast::channel(64);
        UserDb {
            inner: RwLock::new(Inner {
                users: Vec::new(),
                last_modified: Utc::now(),
                dirty: false,
            }),
            updates,
        }
    }

    /// Load from a JSON document, transparently unsealing blob-cipher
    /// output. A missing file yields an empty database.
    pub fn load(path: &Path, keystore: Option<&Keystore>) -> AgentResult<UserDb> {
        let db = UserDb::new();
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no user database yet, starting empty");
                return Ok(db);
            }
            Err(e) => return Err(AgentError::Config(format!("read {}: {}", path.display(), e))),
        };
        let raw = if crate::keystore::is_sealed(&raw) {
            let ks = keystore.ok_or_else(|| {
                AgentError::Config("user database is sealed and keystore is locked".into())
            })?;
            ks.decrypt(&raw)?
        } else {
            raw
        };
        let doc: UserDocument = serde_json::from_slice(&raw)
            .map_err(|e| AgentError::Config(format!("parse {}: {}", path.display(), e)))?;
        {
            let mut inner = db.inner.write();
            inner.users = doc.users;
            inner.last_modified = doc.last_modified;
        }
        Ok(db)
    }

    /// Persist to disk, sealing when a keystore is supplied. Clears the
    /// dirty flag.
    pub fn save(&self, path: &Path, keystore: Option<&Keystore>) -> AgentResult<()> {
        let doc = {
            let inner = self.inner.read();
            UserDocument {
                users: inner.users.clone(),
                last_modified: inner.last_modified,
            }
        };
        let mut raw = serde_json::to_vec_pretty(&doc)
            .map_err(|e| AgentError::Config(format!("serialize user db: {}", e)))?;
        if let Some(ks) = keystore {
            raw = ks.encrypt(&raw)?;
        }
        std::fs::write(path, raw)
            .map_err(|e| AgentError::Config(format!("write {}: {}", path.display(), e)))?;
        self.inner.write().dirty = false;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.read().dirty
    }

    /// Subscribe to user mutations (for mesh replication).
    pub fn subscribe(&self) -> broadcast::Receiver<AccessUser> {
        self.updates.subscribe()
    }

    fn notify(&self, user: &AccessUser) {
        // No receivers is fine; the mesh may be disabled.
        let _ = self.updates.send(user.clone());
    }

    /// Run `f` against the named user, stamping `last_modified` and
    /// broadcasting the result.
    fn mutate<R>(
        &self,
        handle: &str,
        f: impl FnOnce(&mut AccessUser) -> AgentResult<R>,
    ) -> AgentResult<R> {
        let updated = {
            let mut inner = self.inner.write();
            let user = inner
                .users
                .iter_mut()
                .find(|u| u.handle.eq_ignore_ascii_case(handle))
                .ok_or_else(|| AgentError::Config(format!("no such user: {}", handle)))?;
            let result = f(user)?;
            user.last_modified = Utc::now();
            let snapshot = user.clone();
            inner.last_modified = snapshot.last_modified;
            inner.dirty = true;
            (snapshot, result)
        };
        self.notify(&updated.0);
        Ok(updated.1)
    }

    pub fn add_user(&self, handle: &str) -> AgentResult<()> {
        let user = {
            let mut inner = self.inner.write();
            if inner
                .users
                .iter()
                .any(|u| u.handle.eq_ignore_ascii_case(handle))
            {
                return Err(AgentError::InvalidState(format!(
                    "user {} already exists",
                    handle
                )));
            }
            let user = AccessUser::new(handle);
            inner.users.push(user.clone());
            inner.last_modified = user.last_modified;
            inner.dirty = true;
            user
        };
        self.notify(&user);
        Ok(())
    }

    pub fn remove_user(&self, handle: &str) -> AgentResult<()> {
        let mut inner = self.inner.write();
        let before = inner.users.len();
        inner
            .users
            .retain(|u| !u.handle.eq_ignore_ascii_case(handle));
        if inner.users.len() == before {
            return Err(AgentError::Config(format!("no such user: {}", handle)));
        }
        inner.last_modified = Utc::now();
        inner.dirty = true;
        Ok(())
    }

    pub fn add_hostmask(&self, handle: &str, pattern: &str) -> AgentResult<()> {
        self.mutate(handle, |user| {
            if !user.hostmasks.iter().any(|m| m.eq_ignore_ascii_case(pattern)) {
                user.hostmasks.push(pattern.to_string());
            }
            Ok(())
        })
    }

    pub fn remove_hostmask(&self, handle: &str, pattern: &str) -> AgentResult<()> {
        self.mutate(handle, |user| {
            user.hostmasks.retain(|m| !m.eq_ignore_ascii_case(pattern));
            Ok(())
        })
    }

    /// Apply a `+a-b` flag delta, globally or per channel.
    pub fn apply_flags(&self, handle: &str, channel: Option<&str>, delta: &str) -> AgentResult<()> {
        self.mutate(handle, |user| {
            match channel {
                None => user.global_flags.apply_delta(delta),
                Some(chan) => {
                    let entry = user
                        .channel_flags
                        .entry(chan.to_ascii_lowercase())
                        .or_default();
                    entry.apply_delta(delta);
                    if entry.is_empty() {
                        user.channel_flags.remove(&chan.to_ascii_lowercase());
                    }
                }
            }
            Ok(())
        })
    }

    pub fn set_info(&self, handle: &str, info: Option<String>) -> AgentResult<()> {
        self.mutate(handle, |user| {
            user.info = info;
            Ok(())
        })
    }

    pub fn set_password(&self, handle: &str, password: &str) -> AgentResult<()> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AgentError::Config(format!("hash password: {}", e)))?
            .to_string();
        self.mutate(handle, |user| {
            user.password_hash = Some(hash);
            Ok(())
        })
    }

    pub fn verify_password(&self, handle: &str, password: &str) -> bool {
        let hash = {
            let inner = self.inner.read();
            inner
                .users
                .iter()
                .find(|u| u.handle.eq_ignore_ascii_case(handle))
                .and_then(|u| u.password_hash.clone())
        };
        let Some(hash) = hash else { return false };
        let Ok(parsed) = PasswordHash::new(&hash) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }

    /// Record activity for the user matching `hostmask`.
    pub fn touch_seen(&self, hostmask: &str) {
        let handle = match self.find_by_hostmask(hostmask) {
            Some(user) => user.handle,
            None => return,
        };
        // last_seen updates are not replicated; they would thrash the mesh.
        let mut inner = self.inner.write();
        if let Some(user) = inner
            .users
            .iter_mut()
            .find(|u| u.handle.eq_ignore_ascii_case(&handle))
        {
            user.last_seen = Some(Utc::now());
            inner.dirty = true;
        }
    }

    /// First user (database order) with a matching hostmask pattern.
    pub fn find_by_hostmask(&self, hostmask: &str) -> Option<AccessUser> {
        let inner = self.inner.read();
        inner
            .users
            .iter()
            .find(|user| user.hostmasks.iter().any(|p| matches_mask(p, hostmask)))
            .cloned()
    }

    pub fn find_by_handle(&self, handle: &str) -> Option<AccessUser> {
        let inner = self.inner.read();
        inner
            .users
            .iter()
            .find(|u| u.handle.eq_ignore_ascii_case(handle))
            .cloned()
    }

    /// Permission query by observed hostmask.
    pub fn check_permission(&self, hostmask: &str, channel: Option<&str>, flag: char) -> bool {
        self.find_by_hostmask(hostmask)
            .is_some_and(|user| user.has_flag(channel, flag))
    }

    pub fn snapshot(&self) -> Vec<AccessUser> {
        self.inner.read().users.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().users.is_empty()
    }

    /// Merge replicated users, last-writer-wins by `last_modified` with
    /// the peer name breaking exact ties. Returns how many entries
    /// changed. Incoming entries never delete local users.
    pub fn apply_sync(&self, peer: &str, incoming: Vec<AccessUser>, local_name: &str) -> usize {
        let mut applied = 0;
        let mut inner = self.inner.write();
        for remote in incoming {
            match inner
                .users
                .iter_mut()
                .find(|u| u.handle.eq_ignore_ascii_case(&remote.handle))
            {
                Some(local) => {
                    let take_remote = match remote.last_modified.cmp(&local.last_modified) {
                        std::cmp::Ordering::Greater => true,
                        std::cmp::Ordering::Less => false,
                        std::cmp::Ordering::Equal => peer > local_name,
                    };
                    if take_remote && *local != remote {
                        *local = remote;
                        applied += 1;
                    }
                }
                None => {
                    inner.users.push(remote);
                    applied += 1;
                }
            }
        }
        if applied > 0 {
            inner.last_modified = Utc::now();
            inner.dirty = true;
            debug!(peer = %peer, applied, "merged user sync");
        }
        applied
    }
}

impl Default for UserDb {
    fn default() -> UserDb {
        UserDb::new()
    }
}

impl PartialEq for AccessUser {
    fn eq(&self, other: &AccessUser) -> bool {
        self.handle == other.handle
            && self.password_hash == other.password_hash
            && self.hostmasks == other.hostmasks
            && self.global_flags == other.global_flags
            && self.channel_flags == other.channel_flags
            && self.last_modified == other.last_modified
    }
}

impl Drop for UserDb {
    fn drop(&mut self) {
        if self.inner.read().dirty {
            warn!("user database dropped with unsaved changes");
        }
    }
}
