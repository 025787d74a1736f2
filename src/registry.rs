//! Process-wide registry of shared devices.
//!
//! Shares are keyed by bus id and persisted through a [`ShareStore`]
//! under a stable GUID. Attach state is transient: it lives only in this
//! process and is rebuilt empty on restart.

use std::{
    collections::HashMap,
    fmt::Display,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use uuid::Uuid;

/// A share as seen by callers: persisted identity plus transient attach
/// state.
#[derive(Clone, Debug)]
pub struct ShareRecord {
    pub bus_id: String,
    pub guid: Uuid,
    pub friendly_name: String,
    pub attached_to: Option<SocketAddr>,
}

/// A share as persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedShare {
    pub guid: Uuid,
    pub bus_id: String,
    pub friendly_name: String,
}

/// Durable storage for share records.
pub trait ShareStore: Send + Sync + 'static {
    fn load(&self) -> io::Result<Vec<PersistedShare>>;
    fn insert(&self, share: &PersistedShare) -> io::Result<()>;
    fn remove(&self, guid: &Uuid) -> io::Result<()>;
}

/// Volatile store used by tests and as a fallback when no durable store
/// is available.
#[derive(Default)]
pub struct MemoryStore {
    shares: Mutex<Vec<PersistedShare>>,
}

impl ShareStore for MemoryStore {
    fn load(&self) -> io::Result<Vec<PersistedShare>> {
        Ok(self.shares.lock().unwrap().clone())
    }

    fn insert(&self, share: &PersistedShare) -> io::Result<()> {
        let mut shares = self.shares.lock().unwrap();
        shares.retain(|s| s.guid != share.guid);
        shares.push(share.clone());
        Ok(())
    }

    fn remove(&self, guid: &Uuid) -> io::Result<()> {
        self.shares.lock().unwrap().retain(|s| s.guid != *guid);
        Ok(())
    }
}

/// Error from [`ShareRegistry::mark_attached`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttachError {
    /// The bus id is not shared.
    NotShared,

    /// Another attachment already holds the bus id.
    AlreadyAttached,
}

impl Display for AttachError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachError::NotShared => write!(f, "device is not shared"),
            AttachError::AlreadyAttached => write!(f, "device is already attached to a client"),
        }
    }
}

impl std::error::Error for AttachError {}

/// Registry of shared devices. Safe for concurrent readers; writes are
/// serialized by the interior mutex, which is what makes
/// `mark_attached` atomic.
pub struct ShareRegistry {
    records: Mutex<HashMap<String, ShareRecord>>,
    store: Arc<dyn ShareStore>,
}

impl ShareRegistry {
    /// Open the registry backed by `store`, loading persisted shares with
    /// no attachment state.
    pub fn open(store: Arc<dyn ShareStore>) -> io::Result<ShareRegistry> {
        let mut records = HashMap::new();
        for share in store.load()? {
            records.insert(
                share.bus_id.clone(),
                ShareRecord {
                    bus_id: share.bus_id,
                    guid: share.guid,
                    friendly_name: share.friendly_name,
                    attached_to: None,
                },
            );
        }
        Ok(ShareRegistry {
            records: Mutex::new(records),
            store,
        })
    }

    /// Registry with no durable backing.
    pub fn in_memory() -> ShareRegistry {
        ShareRegistry::open(Arc::new(MemoryStore::default())).unwrap()
    }

    pub fn is_shared(&self, bus_id: &str) -> bool {
        self.records.lock().unwrap().contains_key(bus_id)
    }

    /// Mark a bus id shared. Idempotent: sharing an already-shared bus id
    /// returns the existing GUID.
    pub fn share(&self, bus_id: &str, friendly_name: &str) -> io::Result<Uuid> {
        let mut records = self.records.lock().unwrap();
        if let Some(existing) = records.get(bus_id) {
            return Ok(existing.guid);
        }
        let share = PersistedShare {
            guid: Uuid::new_v4(),
            bus_id: bus_id.to_owned(),
            friendly_name: friendly_name.to_owned(),
        };
        self.store.insert(&share)?;
        records.insert(
            bus_id.to_owned(),
            ShareRecord {
                bus_id: share.bus_id,
                guid: share.guid,
                friendly_name: share.friendly_name,
                attached_to: None,
            },
        );
        Ok(share.guid)
    }

    /// Remove a share by bus id. Returns whether anything was removed.
    pub fn unshare(&self, bus_id: &str) -> io::Result<bool> {
        let mut records = self.records.lock().unwrap();
        match records.remove(bus_id) {
            Some(rec) => {
                self.store.remove(&rec.guid)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove a share by GUID. Returns whether anything was removed.
    pub fn unshare_guid(&self, guid: &Uuid) -> io::Result<bool> {
        let mut records = self.records.lock().unwrap();
        let Some(bus_id) = records
            .values()
            .find(|r| r.guid == *guid)
            .map(|r| r.bus_id.clone())
        else {
            return Ok(false);
        };
        records.remove(&bus_id);
        self.store.remove(guid)?;
        Ok(true)
    }

    /// Remove every share.
    pub fn unshare_all(&self) -> io::Result<()> {
        let mut records = self.records.lock().unwrap();
        for rec in records.values() {
            self.store.remove(&rec.guid)?;
        }
        records.clear();
        Ok(())
    }

    /// Record that `bus_id` is now attached to `client`. Fails if the bus
    /// id is not shared or another attachment already holds it; at most
    /// one attachment per bus id ever succeeds concurrently.
    pub fn mark_attached(&self, bus_id: &str, client: SocketAddr) -> Result<(), AttachError> {
        let mut records = self.records.lock().unwrap();
        let rec = records.get_mut(bus_id).ok_or(AttachError::NotShared)?;
        if rec.attached_to.is_some() {
            return Err(AttachError::AlreadyAttached);
        }
        rec.attached_to = Some(client);
        Ok(())
    }

    /// Clear the attachment state of `bus_id`, if any.
    pub fn mark_detached(&self, bus_id: &str) {
        if let Some(rec) = self.records.lock().unwrap().get_mut(bus_id) {
            rec.attached_to = None;
        }
    }

    /// All shares, ordered by bus id.
    pub fn all_shared(&self) -> Vec<ShareRecord> {
        let mut all: Vec<ShareRecord> = self.records.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.bus_id.cmp(&b.bus_id));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(port: u16) -> SocketAddr {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn share_and_query() {
        let reg = ShareRegistry::in_memory();
        assert!(!reg.is_shared("1-2"));
        let guid = reg.share("1-2", "Widget").unwrap();
        assert!(reg.is_shared("1-2"));
        // Idempotent.
        assert_eq!(reg.share("1-2", "Widget").unwrap(), guid);
        assert!(reg.unshare("1-2").unwrap());
        assert!(!reg.unshare("1-2").unwrap());
    }

    #[test]
    fn unshare_by_guid() {
        let reg = ShareRegistry::in_memory();
        let guid = reg.share("1-2", "Widget").unwrap();
        assert!(reg.unshare_guid(&guid).unwrap());
        assert!(!reg.is_shared("1-2"));
        assert!(!reg.unshare_guid(&guid).unwrap());
    }

    #[test]
    fn attach_is_exclusive() {
        let reg = ShareRegistry::in_memory();
        reg.share("1-2", "Widget").unwrap();
        reg.mark_attached("1-2", client(1)).unwrap();
        assert_eq!(
            reg.mark_attached("1-2", client(2)),
            Err(AttachError::AlreadyAttached)
        );
        reg.mark_detached("1-2");
        reg.mark_attached("1-2", client(2)).unwrap();
    }

    #[test]
    fn attach_requires_share() {
        let reg = ShareRegistry::in_memory();
        assert_eq!(
            reg.mark_attached("9-9", client(1)),
            Err(AttachError::NotShared)
        );
    }

    #[test]
    fn all_shared_is_ordered() {
        let reg = ShareRegistry::in_memory();
        reg.share("2-1", "b").unwrap();
        reg.share("1-10", "a").unwrap();
        reg.share("1-2", "c").unwrap();
        let ids: Vec<String> = reg.all_shared().into_iter().map(|r| r.bus_id).collect();
        assert_eq!(ids, vec!["1-10", "1-2", "2-1"]);
    }

    #[test]
    fn shares_persist_across_reopen_without_attach_state() {
        let store: Arc<dyn ShareStore> = Arc::new(MemoryStore::default());
        let reg = ShareRegistry::open(store.clone()).unwrap();
        let guid = reg.share("1-2", "Widget").unwrap();
        reg.mark_attached("1-2", client(1)).unwrap();
        drop(reg);

        let reg = ShareRegistry::open(store).unwrap();
        let all = reg.all_shared();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].guid, guid);
        assert_eq!(all[0].attached_to, None);
    }
}
