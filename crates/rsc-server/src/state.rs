//! Per-connection session and object bookkeeping.
//!
//! Clients only ever see ids allocated here. Every id resolves through the
//! state of the connection that received it, so a handle leaked to another
//! connection never reaches the provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use cryptoki_sys::{
    CK_RV, CKR_KEY_HANDLE_INVALID, CKR_OBJECT_HANDLE_INVALID, CKR_SESSION_HANDLE_INVALID,
    CKS_RO_PUBLIC_SESSION, CKS_RO_USER_FUNCTIONS, CKS_RW_PUBLIC_SESSION, CKS_RW_SO_FUNCTIONS,
    CKS_RW_USER_FUNCTIONS, CKU_SO,
};
use parking_lot::Mutex;

pub type ConnectionId = u64;

/// State shared by every connection of one server.
#[derive(Debug, Default)]
pub struct SharedState {
    next_id: AtomicU64,
    next_connection: AtomicU64,
    login_owners: Mutex<HashMap<u64, ConnectionId>>,
}

/// Outcome of trying to take the login of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The slot was free and now belongs to the caller.
    Fresh,
    /// The caller already held it.
    Held,
    /// Another connection holds it.
    Taken,
}

impl SharedState {
    /// Ids handed to clients; sessions and objects share one space and ids
    /// are never reused.
    fn allocate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn claim_login(&self, slot: u64, connection: ConnectionId) -> Claim {
        let mut owners = self.login_owners.lock();
        match owners.get(&slot) {
            Some(owner) if *owner == connection => Claim::Held,
            Some(_) => Claim::Taken,
            None => {
                owners.insert(slot, connection);
                Claim::Fresh
            }
        }
    }

    pub fn release_login(&self, slot: u64, connection: ConnectionId) {
        let mut owners = self.login_owners.lock();
        if owners.get(&slot) == Some(&connection) {
            owners.remove(&slot);
        }
    }

    pub fn login_owner(&self, slot: u64) -> Option<ConnectionId> {
        self.login_owners.lock().get(&slot).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub real: u64,
    pub slot: u64,
    pub rw: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    LoggedIn(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectEntry {
    pub real: u64,
    pub session: u64,
}

/// Everything one connection has opened, discovered or logged into.
#[derive(Debug)]
pub struct ConnectionState {
    id: ConnectionId,
    sessions: HashMap<u64, Session>,
    objects: HashMap<u64, ObjectEntry>,
    known: HashMap<(u64, u64), u64>,
    logins: HashMap<u64, u64>,
}

impl ConnectionState {
    pub fn new(shared: &SharedState) -> Self {
        Self {
            id: shared.connection_id(),
            sessions: HashMap::new(),
            objects: HashMap::new(),
            known: HashMap::new(),
            logins: HashMap::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn session(&self, id: u64) -> Result<Session, CK_RV> {
        self.sessions
            .get(&id)
            .copied()
            .ok_or(CKR_SESSION_HANDLE_INVALID)
    }

    pub fn session_state(&self, id: u64) -> Result<SessionState, CK_RV> {
        let session = self.session(id)?;
        Ok(match self.logins.get(&session.slot) {
            Some(user) => SessionState::LoggedIn(*user),
            None => SessionState::Open,
        })
    }

    /// The `CKS_*` value a local token would report for this session.
    pub fn reported_state(&self, id: u64) -> Result<u64, CK_RV> {
        let rw = self.session(id)?.rw;
        let state = match self.session_state(id)? {
            SessionState::LoggedIn(user) if user == CKU_SO as u64 => CKS_RW_SO_FUNCTIONS,
            SessionState::LoggedIn(_) if rw => CKS_RW_USER_FUNCTIONS,
            SessionState::LoggedIn(_) => CKS_RO_USER_FUNCTIONS,
            SessionState::Open if rw => CKS_RW_PUBLIC_SESSION,
            SessionState::Open => CKS_RO_PUBLIC_SESSION,
        };
        Ok(state as u64)
    }

    pub fn add_session(&mut self, shared: &SharedState, session: Session) -> u64 {
        let id = shared.allocate();
        self.sessions.insert(id, session);
        id
    }

    /// Forgets a session together with every object recorded under it.
    pub fn remove_session(&mut self, id: u64) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        self.objects.retain(|_, object| object.session != id);
        self.known.retain(|(owner, _), _| *owner != id);
        Some(session)
    }

    pub fn sessions_on(&self, slot: u64) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.slot == slot)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_last_on_slot(&self, id: u64) -> bool {
        match self.sessions.get(&id) {
            Some(session) => !self
                .sessions
                .iter()
                .any(|(other, s)| *other != id && s.slot == session.slot),
            None => false,
        }
    }

    pub fn object(&self, id: u64) -> Result<ObjectEntry, CK_RV> {
        self.objects
            .get(&id)
            .copied()
            .ok_or(CKR_OBJECT_HANDLE_INVALID)
    }

    pub fn key(&self, id: u64) -> Result<ObjectEntry, CK_RV> {
        self.objects.get(&id).copied().ok_or(CKR_KEY_HANDLE_INVALID)
    }

    /// Records a provider object seen through `session`. The same provider
    /// object seen twice through one session keeps its id.
    pub fn intern_object(&mut self, shared: &SharedState, session: u64, real: u64) -> u64 {
        if let Some(id) = self.known.get(&(session, real)) {
            return *id;
        }
        let id = shared.allocate();
        self.objects.insert(id, ObjectEntry { real, session });
        self.known.insert((session, real), id);
        id
    }

    /// Forgets every id of this connection naming the destroyed object.
    pub fn remove_object(&mut self, real: u64) {
        self.objects.retain(|_, object| object.real != real);
        self.known.retain(|(_, r), _| *r != real);
    }

    pub fn logged_in(&self, slot: u64) -> Option<u64> {
        self.logins.get(&slot).copied()
    }

    pub fn set_logged_in(&mut self, slot: u64, user_type: u64) {
        self.logins.insert(slot, user_type);
    }

    pub fn set_logged_out(&mut self, slot: u64) {
        self.logins.remove(&slot);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Takes everything that still needs releasing against the provider:
    /// each logged-in slot with a session to log out through, then every
    /// session.
    pub fn drain(&mut self) -> Teardown {
        let logouts = self
            .logins
            .drain()
            .map(|(slot, _)| {
                let through = self
                    .sessions
                    .values()
                    .find(|session| session.slot == slot)
                    .map(|session| session.real);
                (slot, through)
            })
            .collect();
        let sessions = self.sessions.drain().map(|(_, session)| session).collect();
        self.objects.clear();
        self.known.clear();
        Teardown { logouts, sessions }
    }
}

#[derive(Debug, Default)]
pub struct Teardown {
    pub logouts: Vec<(u64, Option<u64>)>,
    pub sessions: Vec<Session>,
}
