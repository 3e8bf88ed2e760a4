//! Local handles handed to the application and the server ids behind them.
//!
//! Sessions and objects draw from one counter that starts at 1 and never
//! goes back, so a handle is never reused within a loaded module even
//! after its session closes or the link is re-established.

use std::collections::HashMap;

use cryptoki_sys::{
    CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE, CK_SLOT_ID, CKR_KEY_HANDLE_INVALID,
    CKR_OBJECT_HANDLE_INVALID, CKR_SESSION_HANDLE_INVALID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEntry {
    pub remote: u64,
    pub slot: CK_SLOT_ID,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ObjectEntry {
    remote: u64,
    session: CK_SESSION_HANDLE,
}

#[derive(Debug)]
pub struct HandleTable {
    next: CK_SESSION_HANDLE,
    epoch: u64,
    sessions: HashMap<CK_SESSION_HANDLE, SessionEntry>,
    objects: HashMap<CK_OBJECT_HANDLE, ObjectEntry>,
    seen: HashMap<(CK_SESSION_HANDLE, u64), CK_OBJECT_HANDLE>,
}

impl HandleTable {
    pub fn new(epoch: u64) -> Self {
        Self {
            next: 0,
            epoch,
            sessions: HashMap::new(),
            objects: HashMap::new(),
            seen: HashMap::new(),
        }
    }

    fn allocate(&mut self) -> CK_SESSION_HANDLE {
        self.next += 1;
        self.next
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Drops every handle issued on an earlier link. The server released
    /// their sessions when that link went away.
    pub fn sync_epoch(&mut self, epoch: u64) -> bool {
        if epoch == self.epoch {
            return false;
        }
        self.epoch = epoch;
        self.clear();
        true
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
        self.objects.clear();
        self.seen.clear();
    }

    pub fn add_session(&mut self, remote: u64, slot: CK_SLOT_ID) -> CK_SESSION_HANDLE {
        let local = self.allocate();
        self.sessions.insert(local, SessionEntry { remote, slot });
        local
    }

    pub fn session(&self, local: CK_SESSION_HANDLE) -> Result<SessionEntry, CK_RV> {
        self.sessions
            .get(&local)
            .copied()
            .ok_or(CKR_SESSION_HANDLE_INVALID)
    }

    pub fn remote_session(&self, local: CK_SESSION_HANDLE) -> Result<u64, CK_RV> {
        self.session(local).map(|entry| entry.remote)
    }

    /// Removes a session and every object handle issued under it.
    pub fn remove_session(&mut self, local: CK_SESSION_HANDLE) -> Option<SessionEntry> {
        let entry = self.sessions.remove(&local)?;
        self.objects.retain(|_, object| object.session != local);
        self.seen.retain(|(session, _), _| *session != local);
        Some(entry)
    }

    pub fn remove_slot(&mut self, slot: CK_SLOT_ID) -> usize {
        let doomed: Vec<CK_SESSION_HANDLE> = self
            .sessions
            .iter()
            .filter(|(_, entry)| entry.slot == slot)
            .map(|(local, _)| *local)
            .collect();
        for local in &doomed {
            self.remove_session(*local);
        }
        doomed.len()
    }

    /// Issues (or reuses) the local handle of a server object seen through
    /// `session`.
    pub fn add_object(&mut self, session: CK_SESSION_HANDLE, remote: u64) -> CK_OBJECT_HANDLE {
        if let Some(local) = self.seen.get(&(session, remote)) {
            return *local;
        }
        let local = self.allocate();
        self.objects.insert(local, ObjectEntry { remote, session });
        self.seen.insert((session, remote), local);
        local
    }

    pub fn remote_object(&self, local: CK_OBJECT_HANDLE) -> Result<u64, CK_RV> {
        self.objects
            .get(&local)
            .map(|object| object.remote)
            .ok_or(CKR_OBJECT_HANDLE_INVALID)
    }

    pub fn remote_key(&self, local: CK_OBJECT_HANDLE) -> Result<u64, CK_RV> {
        self.remote_object(local)
            .map_err(|_| CKR_KEY_HANDLE_INVALID)
    }

    /// Forgets every local handle naming the destroyed server object.
    pub fn remove_object(&mut self, local: CK_OBJECT_HANDLE) {
        if let Some(entry) = self.objects.get(&local).copied() {
            self.objects.retain(|_, object| object.remote != entry.remote);
            self.seen.retain(|(_, remote), _| *remote != entry.remote);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_unique_and_never_reused() {
        let mut table = HandleTable::new(0);
        let s1 = table.add_session(100, 0);
        let s2 = table.add_session(100, 0);
        let o1 = table.add_object(s1, 7);
        assert_eq!(s1, 1);
        assert!(s1 != s2 && s2 != o1 && s1 != o1);

        table.remove_session(s1);
        let s3 = table.add_session(101, 0);
        assert!(s3 > o1);
    }

    #[test]
    fn closing_a_session_invalidates_its_objects() {
        let mut table = HandleTable::new(0);
        let s1 = table.add_session(10, 0);
        let s2 = table.add_session(11, 0);
        let o1 = table.add_object(s1, 500);
        let o2 = table.add_object(s2, 501);
        assert_eq!(table.add_object(s1, 500), o1);

        table.remove_session(s1);
        assert_eq!(table.remote_object(o1), Err(CKR_OBJECT_HANDLE_INVALID));
        assert_eq!(table.remote_key(o1), Err(CKR_KEY_HANDLE_INVALID));
        assert_eq!(table.remote_session(s1), Err(CKR_SESSION_HANDLE_INVALID));
        assert_eq!(table.remote_object(o2), Ok(501));
    }

    #[test]
    fn slot_and_epoch_resets_drop_dominated_handles() {
        let mut table = HandleTable::new(0);
        let a = table.add_session(1, 0);
        let b = table.add_session(2, 1);
        table.add_object(a, 9);
        table.add_object(b, 9);

        assert_eq!(table.remove_slot(0), 1);
        assert_eq!(table.session_count(), 1);
        assert_eq!(table.object_count(), 1);

        assert!(!table.sync_epoch(0));
        assert!(table.sync_epoch(1));
        assert_eq!(table.session_count(), 0);
        assert_eq!(table.object_count(), 0);
        assert!(table.add_session(3, 0) > b);
    }

    #[test]
    fn destroying_an_object_forgets_every_alias() {
        let mut table = HandleTable::new(0);
        let a = table.add_session(1, 0);
        let b = table.add_session(2, 0);
        let via_a = table.add_object(a, 42);
        let via_b = table.add_object(b, 42);
        table.remove_object(via_a);
        assert!(table.remote_object(via_b).is_err());
    }
}
