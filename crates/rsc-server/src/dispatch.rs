//! Replays decoded requests against the provider.
//!
//! Every handle is resolved through the calling connection's state before
//! the provider sees it, and state only changes after the provider has
//! accepted the operation. Provider result codes go back untouched.

use std::sync::Arc;

use cryptoki_sys::{
    CK_RV, CKF_RW_SESSION, CKR_BUFFER_TOO_SMALL, CKR_DATA_LEN_RANGE, CKR_OK, CKR_SESSION_CLOSED,
    CKR_USER_ANOTHER_ALREADY_LOGGED_IN, CKR_USER_NOT_LOGGED_IN, CKU_CONTEXT_SPECIFIC,
};
use parking_lot::Mutex;
use rsc_core::{OutputBuffer, Reply, Request};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::provider::ProviderGate;
use crate::state::{Claim, ConnectionState, Session, SharedState};

/// Random output has to fit in one response frame.
const MAX_RANDOM_LEN: u64 = 1024 * 1024;

/// Result code and payload sent back for one request.
pub type Outcome = (CK_RV, Reply);

type Handled = Result<Outcome, CK_RV>;

fn ok(reply: Reply) -> Handled {
    Ok((CKR_OK, reply))
}

/// A capacity that was too small still carries the required length.
fn output(out: OutputBuffer, capacity: Option<u64>) -> Handled {
    let rv = if capacity.is_some() && out.data.is_none() {
        CKR_BUFFER_TOO_SMALL
    } else {
        CKR_OK
    };
    Ok((rv, Reply::Output(out)))
}

#[derive(Clone)]
pub struct Dispatcher {
    gate: Arc<ProviderGate>,
    shared: Arc<SharedState>,
}

impl Dispatcher {
    pub fn new(gate: Arc<ProviderGate>, shared: Arc<SharedState>) -> Self {
        Self { gate, shared }
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn new_connection(&self) -> Mutex<ConnectionState> {
        Mutex::new(ConnectionState::new(&self.shared))
    }

    pub async fn dispatch(&self, conn: &Mutex<ConnectionState>, request: Request) -> Outcome {
        let opcode = request.opcode();
        let (rv, reply) = match self.handle(conn, request).await {
            Ok(outcome) => outcome,
            Err(rv) => (rv, Reply::Empty),
        };
        debug!(connection = conn.lock().id(), ?opcode, rv, "dispatched");
        (rv, reply)
    }

    fn session(&self, conn: &Mutex<ConnectionState>, id: u64) -> Result<Session, CK_RV> {
        conn.lock().session(id)
    }

    /// Session of a call that needs this connection to be logged in.
    fn user_session(&self, conn: &Mutex<ConnectionState>, id: u64) -> Result<Session, CK_RV> {
        let conn = conn.lock();
        let session = conn.session(id)?;
        if conn.logged_in(session.slot).is_none() {
            return Err(CKR_USER_NOT_LOGGED_IN);
        }
        Ok(session)
    }

    async fn handle(&self, conn: &Mutex<ConnectionState>, request: Request) -> Handled {
        let gate = &self.gate;
        match request {
            Request::GetInfo => ok(Reply::Info(gate.run(|p| p.info()).await?)),
            Request::GetSlotList { token_present } => {
                let slots = gate.run(move |p| p.slot_list(token_present)).await?;
                ok(Reply::Slots { slots })
            }
            Request::GetSlotInfo { slot } => {
                ok(Reply::SlotInfo(gate.run(move |p| p.slot_info(slot)).await?))
            }
            Request::GetTokenInfo { slot } => {
                ok(Reply::TokenInfo(gate.run(move |p| p.token_info(slot)).await?))
            }
            Request::GetMechanismList { slot } => {
                let mechanisms = gate.run(move |p| p.mechanism_list(slot)).await?;
                ok(Reply::Mechanisms { mechanisms })
            }
            Request::GetMechanismInfo { slot, mechanism } => {
                let info = gate
                    .run(move |p| p.mechanism_info(slot, mechanism))
                    .await?;
                ok(Reply::MechanismInfo(info))
            }

            Request::OpenSession { slot, flags } => {
                let real = gate.run(move |p| p.open_session(slot, flags)).await?;
                let session = Session {
                    real,
                    slot,
                    rw: flags & CKF_RW_SESSION as u64 != 0,
                };
                let id = conn.lock().add_session(&self.shared, session);
                ok(Reply::Session { session: id })
            }
            Request::CloseSession { session } => {
                self.close_session(conn, session).await?;
                ok(Reply::Empty)
            }
            Request::CloseAllSessions { slot } => {
                gate.run(move |p| p.slot_info(slot)).await?;
                let ids = conn.lock().sessions_on(slot);
                let mut first_error = None;
                for id in ids {
                    if let Err(rv) = self.close_session(conn, id).await {
                        first_error.get_or_insert(rv);
                    }
                }
                match first_error {
                    Some(rv) => Err(rv),
                    None => ok(Reply::Empty),
                }
            }
            Request::GetSessionInfo { session } => {
                let real = self.session(conn, session)?.real;
                let mut info = gate.run(move |p| p.session_info(real)).await?;
                info.state = conn.lock().reported_state(session)?;
                ok(Reply::SessionInfo(info))
            }
            Request::Login {
                session,
                user_type,
                pin,
            } => {
                self.login(conn, session, user_type, Zeroizing::new(pin))
                    .await?;
                ok(Reply::Empty)
            }
            Request::Logout { session } => {
                self.logout(conn, session).await?;
                ok(Reply::Empty)
            }

            Request::CreateObject { session, template } => {
                let real_session = self.session(conn, session)?.real;
                let real = gate
                    .run(move |p| p.create_object(real_session, &template))
                    .await?;
                let mut state = conn.lock();
                if state.session(session).is_err() {
                    return Err(CKR_SESSION_CLOSED);
                }
                let object = state.intern_object(&self.shared, session, real);
                ok(Reply::Object { object })
            }
            Request::DestroyObject { session, object } => {
                let (real_session, real_object) = {
                    let state = conn.lock();
                    (state.session(session)?.real, state.object(object)?.real)
                };
                gate.run(move |p| p.destroy_object(real_session, real_object))
                    .await?;
                conn.lock().remove_object(real_object);
                ok(Reply::Empty)
            }
            Request::GetAttributeValue {
                session,
                object,
                template,
            } => {
                let (real_session, real_object) = {
                    let state = conn.lock();
                    (state.session(session)?.real, state.object(object)?.real)
                };
                let report = gate
                    .run(move |p| Ok(p.get_attribute_value(real_session, real_object, &template)))
                    .await?;
                Ok((report.rv as CK_RV, Reply::Attributes { values: report.values }))
            }
            Request::FindObjectsInit { session, template } => {
                let real = self.session(conn, session)?.real;
                gate.run(move |p| p.find_objects_init(real, &template))
                    .await?;
                ok(Reply::Empty)
            }
            Request::FindObjects { session, max } => {
                let real = self.session(conn, session)?.real;
                // A provider asked for nothing may still advance its cursor.
                if max == 0 {
                    return ok(Reply::Objects { objects: vec![] });
                }
                let found = gate.run(move |p| p.find_objects(real, max)).await?;
                let mut state = conn.lock();
                if state.session(session).is_err() {
                    return Err(CKR_SESSION_CLOSED);
                }
                let objects = found
                    .into_iter()
                    .map(|handle| state.intern_object(&self.shared, session, handle))
                    .collect();
                ok(Reply::Objects { objects })
            }
            Request::FindObjectsFinal { session } => {
                let real = self.session(conn, session)?.real;
                gate.run(move |p| p.find_objects_final(real)).await?;
                ok(Reply::Empty)
            }

            Request::EncryptInit {
                session,
                mechanism,
                key,
            } => {
                let (real, key) = {
                    let state = conn.lock();
                    (state.session(session)?.real, state.key(key)?.real)
                };
                gate.run(move |p| p.encrypt_init(real, &mechanism, key))
                    .await?;
                ok(Reply::Empty)
            }
            Request::Encrypt {
                session,
                data,
                capacity,
            } => {
                let real = self.session(conn, session)?.real;
                let out = gate.run(move |p| p.encrypt(real, &data, capacity)).await?;
                output(out, capacity)
            }
            Request::DecryptInit {
                session,
                mechanism,
                key,
            } => {
                let real = self.user_session(conn, session)?.real;
                let key = conn.lock().key(key)?.real;
                gate.run(move |p| p.decrypt_init(real, &mechanism, key))
                    .await?;
                ok(Reply::Empty)
            }
            Request::Decrypt {
                session,
                data,
                capacity,
            } => {
                let real = self.session(conn, session)?.real;
                let out = gate.run(move |p| p.decrypt(real, &data, capacity)).await?;
                output(out, capacity)
            }
            Request::SignInit {
                session,
                mechanism,
                key,
            } => {
                let real = self.user_session(conn, session)?.real;
                let key = conn.lock().key(key)?.real;
                gate.run(move |p| p.sign_init(real, &mechanism, key)).await?;
                ok(Reply::Empty)
            }
            Request::Sign {
                session,
                data,
                capacity,
            } => {
                let real = self.session(conn, session)?.real;
                let out = gate.run(move |p| p.sign(real, &data, capacity)).await?;
                output(out, capacity)
            }
            Request::SignUpdate { session, data } => {
                let real = self.session(conn, session)?.real;
                gate.run(move |p| p.sign_update(real, &data)).await?;
                ok(Reply::Empty)
            }
            Request::SignFinal { session, capacity } => {
                let real = self.session(conn, session)?.real;
                let out = gate.run(move |p| p.sign_final(real, capacity)).await?;
                output(out, capacity)
            }
            Request::VerifyInit {
                session,
                mechanism,
                key,
            } => {
                let (real, key) = {
                    let state = conn.lock();
                    (state.session(session)?.real, state.key(key)?.real)
                };
                gate.run(move |p| p.verify_init(real, &mechanism, key))
                    .await?;
                ok(Reply::Empty)
            }
            Request::Verify {
                session,
                data,
                signature,
            } => {
                let real = self.session(conn, session)?.real;
                gate.run(move |p| p.verify(real, &data, &signature)).await?;
                ok(Reply::Empty)
            }
            Request::GenerateRandom { session, len } => {
                let real = self.session(conn, session)?.real;
                if len > MAX_RANDOM_LEN {
                    return Err(CKR_DATA_LEN_RANGE);
                }
                let data = gate.run(move |p| p.generate_random(real, len)).await?;
                ok(Reply::Random { data })
            }
        }
    }

    async fn login(
        &self,
        conn: &Mutex<ConnectionState>,
        id: u64,
        user_type: u64,
        pin: Zeroizing<Vec<u8>>,
    ) -> Result<(), CK_RV> {
        let (session, connection, logged_in) = {
            let state = conn.lock();
            let session = state.session(id)?;
            (session, state.id(), state.logged_in(session.slot))
        };

        // Re-authentication for a single operation leaves the login alone.
        if user_type == CKU_CONTEXT_SPECIFIC as u64 {
            if logged_in.is_none() {
                return Err(CKR_USER_NOT_LOGGED_IN);
            }
            return self
                .gate
                .run(move |p| p.login(session.real, user_type, &pin))
                .await;
        }

        let claim = self.shared.claim_login(session.slot, connection);
        if claim == Claim::Taken {
            return Err(CKR_USER_ANOTHER_ALREADY_LOGGED_IN);
        }
        match self
            .gate
            .run(move |p| p.login(session.real, user_type, &pin))
            .await
        {
            Ok(()) => {
                conn.lock().set_logged_in(session.slot, user_type);
                info!(connection, slot = session.slot, "logged in");
                Ok(())
            }
            Err(rv) => {
                if claim == Claim::Fresh {
                    self.shared.release_login(session.slot, connection);
                }
                Err(rv)
            }
        }
    }

    async fn logout(&self, conn: &Mutex<ConnectionState>, id: u64) -> Result<(), CK_RV> {
        let (session, connection) = {
            let state = conn.lock();
            let session = state.session(id)?;
            if state.logged_in(session.slot).is_none() {
                return Err(CKR_USER_NOT_LOGGED_IN);
            }
            (session, state.id())
        };
        self.gate.run(move |p| p.logout(session.real)).await?;
        conn.lock().set_logged_out(session.slot);
        self.shared.release_login(session.slot, connection);
        info!(connection, slot = session.slot, "logged out");
        Ok(())
    }

    /// Closes one session. When it is the connection's last session on a
    /// logged-in slot the provider is logged out first, so the login never
    /// outlives the connection that made it.
    async fn close_session(&self, conn: &Mutex<ConnectionState>, id: u64) -> Result<(), CK_RV> {
        let (session, connection, release_login) = {
            let state = conn.lock();
            let session = state.session(id)?;
            let release = state.logged_in(session.slot).is_some() && state.is_last_on_slot(id);
            (session, state.id(), release)
        };

        if release_login {
            if let Err(rv) = self.gate.run(move |p| p.logout(session.real)).await {
                debug!(connection, rv, "logout before close failed");
            }
            conn.lock().set_logged_out(session.slot);
            self.shared.release_login(session.slot, connection);
        }

        self.gate
            .run(move |p| p.close_session(session.real))
            .await?;
        conn.lock().remove_session(id);
        Ok(())
    }

    /// Releases everything a finished connection still holds.
    pub async fn teardown(&self, conn: &Mutex<ConnectionState>) {
        let (connection, teardown) = {
            let mut state = conn.lock();
            (state.id(), state.drain())
        };
        for (slot, through) in teardown.logouts {
            if let Some(real) = through
                && let Err(rv) = self.gate.run(move |p| p.logout(real)).await
            {
                warn!(connection, slot, rv, "logout during teardown failed");
            }
            self.shared.release_login(slot, connection);
        }
        let count = teardown.sessions.len();
        for session in teardown.sessions {
            if let Err(rv) = self
                .gate
                .run(move |p| p.close_session(session.real))
                .await
            {
                warn!(connection, rv, "closing session during teardown failed");
            }
        }
        if count > 0 {
            info!(connection, sessions = count, "released connection state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MemoryToken, MemoryTokenConfig};
    use cryptoki_sys::{
        CKA_CLASS, CKA_LABEL, CKA_SIGN, CKA_VALUE, CKA_VERIFY, CKF_SERIAL_SESSION,
        CKM_SHA256_HMAC, CKO_SECRET_KEY, CKR_KEY_HANDLE_INVALID, CKR_OBJECT_HANDLE_INVALID,
        CKR_SESSION_HANDLE_INVALID, CKS_RW_PUBLIC_SESSION, CKS_RW_USER_FUNCTIONS, CKU_USER,
    };
    use rsc_core::{Attribute, Mechanism};

    struct Fixture {
        token: Arc<MemoryToken>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let token = Arc::new(MemoryToken::new(MemoryTokenConfig::default()));
        let gate = Arc::new(ProviderGate::new(token.clone()));
        Fixture {
            token,
            dispatcher: Dispatcher::new(gate, Arc::new(SharedState::default())),
        }
    }

    async fn call(d: &Dispatcher, conn: &Mutex<ConnectionState>, request: Request) -> Outcome {
        d.dispatch(conn, request).await
    }

    async fn open(d: &Dispatcher, conn: &Mutex<ConnectionState>) -> u64 {
        match call(
            d,
            conn,
            Request::OpenSession {
                slot: 0,
                flags: (CKF_SERIAL_SESSION | CKF_RW_SESSION) as u64,
            },
        )
        .await
        {
            (CKR_OK, Reply::Session { session }) => session,
            other => panic!("open session: {other:?}"),
        }
    }

    async fn login(d: &Dispatcher, conn: &Mutex<ConnectionState>, session: u64) -> CK_RV {
        call(
            d,
            conn,
            Request::Login {
                session,
                user_type: CKU_USER as u64,
                pin: b"1234".to_vec(),
            },
        )
        .await
        .0
    }

    async fn create_key(d: &Dispatcher, conn: &Mutex<ConnectionState>, session: u64) -> u64 {
        let template = vec![
            Attribute::ulong(CKA_CLASS as u64, CKO_SECRET_KEY as u64),
            Attribute::new(CKA_LABEL as u64, b"hmac".to_vec()),
            Attribute::new(CKA_VALUE as u64, vec![9u8; 32]),
            Attribute::bool(CKA_SIGN as u64, true),
            Attribute::bool(CKA_VERIFY as u64, true),
        ];
        match call(d, conn, Request::CreateObject { session, template }).await {
            (CKR_OK, Reply::Object { object }) => object,
            other => panic!("create object: {other:?}"),
        }
    }

    fn hmac() -> Mechanism {
        Mechanism::new(CKM_SHA256_HMAC as u64)
    }

    #[tokio::test]
    async fn foreign_handles_are_rejected() {
        let f = fixture();
        let a = f.dispatcher.new_connection();
        let b = f.dispatcher.new_connection();
        let session = open(&f.dispatcher, &a).await;
        assert_eq!(login(&f.dispatcher, &a, session).await, CKR_OK);
        let key = create_key(&f.dispatcher, &a, session).await;

        let (rv, _) = call(&f.dispatcher, &b, Request::GetSessionInfo { session }).await;
        assert_eq!(rv, CKR_SESSION_HANDLE_INVALID);

        let other = open(&f.dispatcher, &b).await;
        let (rv, _) = call(
            &f.dispatcher,
            &b,
            Request::DestroyObject {
                session: other,
                object: key,
            },
        )
        .await;
        assert_eq!(rv, CKR_OBJECT_HANDLE_INVALID);

        let (rv, _) = call(
            &f.dispatcher,
            &b,
            Request::VerifyInit {
                session: other,
                mechanism: hmac(),
                key,
            },
        )
        .await;
        assert_eq!(rv, CKR_KEY_HANDLE_INVALID);
    }

    #[tokio::test]
    async fn sign_requires_this_connections_login() {
        let f = fixture();
        let a = f.dispatcher.new_connection();
        let b = f.dispatcher.new_connection();
        let sa = open(&f.dispatcher, &a).await;
        assert_eq!(login(&f.dispatcher, &a, sa).await, CKR_OK);
        let key = create_key(&f.dispatcher, &a, sa).await;

        let sb = open(&f.dispatcher, &b).await;
        assert_eq!(
            login(&f.dispatcher, &b, sb).await,
            CKR_USER_ANOTHER_ALREADY_LOGGED_IN
        );
        let (rv, _) = call(
            &f.dispatcher,
            &b,
            Request::SignInit {
                session: sb,
                mechanism: hmac(),
                key,
            },
        )
        .await;
        assert_eq!(rv, CKR_USER_NOT_LOGGED_IN);

        let (rv, _) = call(
            &f.dispatcher,
            &a,
            Request::SignInit {
                session: sa,
                mechanism: hmac(),
                key,
            },
        )
        .await;
        assert_eq!(rv, CKR_OK);
        let (rv, reply) = call(
            &f.dispatcher,
            &a,
            Request::Sign {
                session: sa,
                data: b"payload".to_vec(),
                capacity: Some(4),
            },
        )
        .await;
        assert_eq!(rv, CKR_BUFFER_TOO_SMALL);
        assert_eq!(reply, Reply::Output(OutputBuffer::length(32)));

        let (rv, reply) = call(
            &f.dispatcher,
            &a,
            Request::Sign {
                session: sa,
                data: b"payload".to_vec(),
                capacity: Some(32),
            },
        )
        .await;
        assert_eq!(rv, CKR_OK);
        assert!(matches!(reply, Reply::Output(OutputBuffer { data: Some(ref d), .. }) if d.len() == 32));
    }

    #[tokio::test]
    async fn session_info_reflects_the_callers_login() {
        let f = fixture();
        let conn = f.dispatcher.new_connection();
        let session = open(&f.dispatcher, &conn).await;

        let state = |reply: Reply| match reply {
            Reply::SessionInfo(info) => info.state,
            other => panic!("session info: {other:?}"),
        };
        let (_, reply) = call(&f.dispatcher, &conn, Request::GetSessionInfo { session }).await;
        assert_eq!(state(reply), CKS_RW_PUBLIC_SESSION as u64);

        assert_eq!(login(&f.dispatcher, &conn, session).await, CKR_OK);
        let (_, reply) = call(&f.dispatcher, &conn, Request::GetSessionInfo { session }).await;
        assert_eq!(state(reply), CKS_RW_USER_FUNCTIONS as u64);

        let (rv, _) = call(&f.dispatcher, &conn, Request::Logout { session }).await;
        assert_eq!(rv, CKR_OK);
        let (rv, _) = call(&f.dispatcher, &conn, Request::Logout { session }).await;
        assert_eq!(rv, CKR_USER_NOT_LOGGED_IN);
        assert_eq!(f.dispatcher.shared().login_owner(0), None);
    }

    #[tokio::test]
    async fn failed_login_leaves_the_slot_free() {
        let f = fixture();
        let conn = f.dispatcher.new_connection();
        let session = open(&f.dispatcher, &conn).await;
        let (rv, _) = call(
            &f.dispatcher,
            &conn,
            Request::Login {
                session,
                user_type: CKU_USER as u64,
                pin: b"wrong".to_vec(),
            },
        )
        .await;
        assert_ne!(rv, CKR_OK);
        assert_eq!(f.dispatcher.shared().login_owner(0), None);
        assert_eq!(conn.lock().logged_in(0), None);
    }

    #[tokio::test]
    async fn closing_the_last_session_releases_the_login() {
        let f = fixture();
        let a = f.dispatcher.new_connection();
        let b = f.dispatcher.new_connection();
        let sa = open(&f.dispatcher, &a).await;
        let sb = open(&f.dispatcher, &b).await;
        assert_eq!(login(&f.dispatcher, &a, sa).await, CKR_OK);

        let (rv, _) = call(&f.dispatcher, &a, Request::CloseSession { session: sa }).await;
        assert_eq!(rv, CKR_OK);
        assert_eq!(f.token.logged_in(), None);
        assert_eq!(login(&f.dispatcher, &b, sb).await, CKR_OK);
    }

    #[tokio::test]
    async fn close_all_sessions_spares_other_connections() {
        let f = fixture();
        let a = f.dispatcher.new_connection();
        let b = f.dispatcher.new_connection();
        open(&f.dispatcher, &a).await;
        open(&f.dispatcher, &a).await;
        let sb = open(&f.dispatcher, &b).await;

        let (rv, _) = call(&f.dispatcher, &a, Request::CloseAllSessions { slot: 0 }).await;
        assert_eq!(rv, CKR_OK);
        assert_eq!(a.lock().session_count(), 0);
        assert_eq!(f.token.open_sessions(), 1);
        let (rv, _) = call(&f.dispatcher, &b, Request::GetSessionInfo { session: sb }).await;
        assert_eq!(rv, CKR_OK);
    }

    #[tokio::test]
    async fn teardown_closes_every_provider_session() {
        let f = fixture();
        let conn = f.dispatcher.new_connection();
        let session = open(&f.dispatcher, &conn).await;
        open(&f.dispatcher, &conn).await;
        assert_eq!(login(&f.dispatcher, &conn, session).await, CKR_OK);
        assert_eq!(f.token.open_sessions(), 2);

        f.dispatcher.teardown(&conn).await;
        assert_eq!(f.token.open_sessions(), 0);
        assert_eq!(f.token.logged_in(), None);
        assert_eq!(f.dispatcher.shared().login_owner(0), None);
    }

    #[tokio::test]
    async fn found_objects_keep_their_ids_within_a_session() {
        let f = fixture();
        let conn = f.dispatcher.new_connection();
        let session = open(&f.dispatcher, &conn).await;
        assert_eq!(login(&f.dispatcher, &conn, session).await, CKR_OK);
        let key = create_key(&f.dispatcher, &conn, session).await;

        let (rv, _) = call(
            &f.dispatcher,
            &conn,
            Request::FindObjectsInit {
                session,
                template: vec![Attribute::new(CKA_LABEL as u64, b"hmac".to_vec())],
            },
        )
        .await;
        assert_eq!(rv, CKR_OK);
        let (rv, reply) = call(&f.dispatcher, &conn, Request::FindObjects { session, max: 8 }).await;
        assert_eq!(rv, CKR_OK);
        assert_eq!(reply, Reply::Objects { objects: vec![key] });
        let (rv, _) = call(&f.dispatcher, &conn, Request::FindObjectsFinal { session }).await;
        assert_eq!(rv, CKR_OK);
    }

    #[tokio::test]
    async fn empty_find_batch_leaves_the_search_untouched() {
        let f = fixture();
        let conn = f.dispatcher.new_connection();
        let session = open(&f.dispatcher, &conn).await;
        assert_eq!(login(&f.dispatcher, &conn, session).await, CKR_OK);
        let key = create_key(&f.dispatcher, &conn, session).await;

        let (rv, _) = call(
            &f.dispatcher,
            &conn,
            Request::FindObjectsInit {
                session,
                template: vec![Attribute::new(CKA_LABEL as u64, b"hmac".to_vec())],
            },
        )
        .await;
        assert_eq!(rv, CKR_OK);

        let before = f.token.invocations();
        let (rv, reply) = call(&f.dispatcher, &conn, Request::FindObjects { session, max: 0 }).await;
        assert_eq!(rv, CKR_OK);
        assert_eq!(reply, Reply::Objects { objects: vec![] });
        assert_eq!(f.token.invocations(), before);

        let (rv, reply) = call(&f.dispatcher, &conn, Request::FindObjects { session, max: 8 }).await;
        assert_eq!(rv, CKR_OK);
        assert_eq!(reply, Reply::Objects { objects: vec![key] });

        let (rv, _) = call(
            &f.dispatcher,
            &conn,
            Request::FindObjects {
                session: session + 1000,
                max: 0,
            },
        )
        .await;
        assert_eq!(rv, CKR_SESSION_HANDLE_INVALID);
    }
}
