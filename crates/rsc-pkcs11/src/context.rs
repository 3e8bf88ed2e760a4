//! The live module state between `C_Initialize` and `C_Finalize`: a private
//! runtime, the remote link and the handle table.

use cryptoki_sys::{
    CK_FLAGS, CK_MECHANISM_TYPE, CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE, CK_SLOT_ID,
    CK_USER_TYPE, CKR_BUFFER_TOO_SMALL, CKR_OK, CKR_SESSION_CLOSED, CKR_SESSION_HANDLE_INVALID,
};
use parking_lot::{Mutex, MutexGuard};
use rsc_core::{
    Attribute, AttributeRequest, AttributeValue, ClientConfig, LibraryInfo, Mechanism,
    MechanismInfo, OutputBuffer, RemoteClient, Reply, Request, Response, RscError, SessionInfo,
    SlotInfo, TokenInfo,
};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info};

use crate::FrontendError;
use crate::handles::HandleTable;

const WORKER_THREADS: usize = 2;

fn unexpected(op: &str) -> FrontendError {
    FrontendError::Remote(RscError::framing(format!("unexpected reply to {op}")))
}

fn succeeded(response: Response) -> Result<Reply, FrontendError> {
    if response.rv != CKR_OK as u64 {
        return Err(FrontendError::Token(response.rv as CK_RV));
    }
    Ok(response.reply)
}

/// Accepts `CKR_BUFFER_TOO_SMALL` as a length report.
fn output(op: &str, response: Response) -> Result<OutputBuffer, FrontendError> {
    let rv = response.rv as CK_RV;
    match response.reply {
        Reply::Output(out) if rv == CKR_OK || rv == CKR_BUFFER_TOO_SMALL => Ok(out),
        _ if rv != CKR_OK => Err(FrontendError::Token(rv)),
        _ => Err(unexpected(op)),
    }
}

fn empty(response: Response) -> Result<(), FrontendError> {
    succeeded(response).map(|_| ())
}

/// Drives `future` to completion on `runtime`. A caller already inside a
/// runtime cannot block its own thread on another one, so the wait moves to
/// a helper thread.
fn block_on<F>(runtime: &Runtime, future: F) -> Result<F::Output, FrontendError>
where
    F: Future + Send,
    F::Output: Send,
{
    if Handle::try_current().is_err() {
        return Ok(runtime.block_on(future));
    }
    std::thread::scope(|scope| {
        std::thread::Builder::new()
            .name("rsc-pkcs11-call".into())
            .spawn_scoped(scope, || runtime.block_on(future))
            .map_err(|err| FrontendError::Internal(format!("failed to spawn caller: {err}")))?
            .join()
            .map_err(|_| FrontendError::Internal("remote call panicked".into()))
    })
}

pub struct ShimContext {
    runtime: Option<Runtime>,
    client: RemoteClient,
    handles: Mutex<HandleTable>,
}

impl std::fmt::Debug for ShimContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShimContext")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl Drop for ShimContext {
    /// Worker threads are released without waiting, which is also legal
    /// when the last reference goes away on an async thread.
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl ShimContext {
    /// Starts the runtime and authenticates the first link. Calls made
    /// through the context block the calling thread.
    pub fn connect(config: ClientConfig) -> Result<Self, FrontendError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(WORKER_THREADS)
            .thread_name("rsc-pkcs11")
            .enable_all()
            .build()
            .map_err(|err| FrontendError::Internal(format!("failed to start runtime: {err}")))?;
        let addr = config.addr.clone();
        let client = match block_on(&runtime, RemoteClient::connect(config)) {
            Ok(Ok(client)) => client,
            Ok(Err(err)) => {
                runtime.shutdown_background();
                return Err(err.into());
            }
            Err(err) => {
                runtime.shutdown_background();
                return Err(err);
            }
        };
        info!(%addr, "connected to remote token");
        let handles = Mutex::new(HandleTable::new(client.epoch()));
        Ok(Self {
            runtime: Some(runtime),
            client,
            handles,
        })
    }

    pub fn close(&self) {
        if let Some(runtime) = &self.runtime
            && let Err(err) = block_on(runtime, self.client.close())
        {
            debug!(error = %err, "closing the link failed");
        }
        self.handles.lock().clear();
    }

    fn runtime(&self) -> Result<&Runtime, FrontendError> {
        self.runtime
            .as_ref()
            .ok_or_else(|| FrontendError::Internal("runtime already shut down".into()))
    }

    /// The handle table, emptied first if the link was re-established
    /// since it was last consulted.
    fn handles(&self) -> MutexGuard<'_, HandleTable> {
        let mut table = self.handles.lock();
        if table.sync_epoch(self.client.epoch()) {
            debug!(epoch = table.epoch(), "link replaced, local handles dropped");
        }
        table
    }

    fn send(&self, request: Request) -> Result<Response, FrontendError> {
        Ok(block_on(self.runtime()?, self.client.call(request))??)
    }

    /// Translates `session` (and whatever else `build` needs) under one
    /// table lock, then forwards. A session cannot survive a link change,
    /// so a reconnect during the call reports the handle as invalid.
    fn on_session(
        &self,
        session: CK_SESSION_HANDLE,
        build: impl FnOnce(&HandleTable, u64) -> Result<Request, CK_RV>,
    ) -> Result<Response, FrontendError> {
        let (epoch, request) = {
            let table = self.handles();
            let remote = table.remote_session(session).map_err(FrontendError::Token)?;
            (table.epoch(), build(&*table, remote).map_err(FrontendError::Token)?)
        };
        let response = self.send(request)?;
        if self.client.epoch() != epoch {
            return Err(FrontendError::Token(CKR_SESSION_HANDLE_INVALID));
        }
        Ok(response)
    }

    fn session_call(
        &self,
        session: CK_SESSION_HANDLE,
        build: impl FnOnce(u64) -> Request,
    ) -> Result<Response, FrontendError> {
        self.on_session(session, |_, remote| Ok(build(remote)))
    }

    pub fn info(&self) -> Result<LibraryInfo, FrontendError> {
        match succeeded(self.send(Request::GetInfo)?)? {
            Reply::Info(info) => Ok(info),
            _ => Err(unexpected("GetInfo")),
        }
    }

    pub fn slot_list(&self, token_present: bool) -> Result<Vec<CK_SLOT_ID>, FrontendError> {
        match succeeded(self.send(Request::GetSlotList { token_present })?)? {
            Reply::Slots { slots } => Ok(slots.into_iter().map(|s| s as CK_SLOT_ID).collect()),
            _ => Err(unexpected("GetSlotList")),
        }
    }

    pub fn slot_info(&self, slot: CK_SLOT_ID) -> Result<SlotInfo, FrontendError> {
        let slot = slot as u64;
        match succeeded(self.send(Request::GetSlotInfo { slot })?)? {
            Reply::SlotInfo(info) => Ok(info),
            _ => Err(unexpected("GetSlotInfo")),
        }
    }

    pub fn token_info(&self, slot: CK_SLOT_ID) -> Result<TokenInfo, FrontendError> {
        let slot = slot as u64;
        match succeeded(self.send(Request::GetTokenInfo { slot })?)? {
            Reply::TokenInfo(info) => Ok(info),
            _ => Err(unexpected("GetTokenInfo")),
        }
    }

    pub fn mechanism_list(&self, slot: CK_SLOT_ID) -> Result<Vec<CK_MECHANISM_TYPE>, FrontendError> {
        let slot = slot as u64;
        match succeeded(self.send(Request::GetMechanismList { slot })?)? {
            Reply::Mechanisms { mechanisms } => Ok(mechanisms
                .into_iter()
                .map(|m| m as CK_MECHANISM_TYPE)
                .collect()),
            _ => Err(unexpected("GetMechanismList")),
        }
    }

    pub fn mechanism_info(
        &self,
        slot: CK_SLOT_ID,
        mechanism: CK_MECHANISM_TYPE,
    ) -> Result<MechanismInfo, FrontendError> {
        let request = Request::GetMechanismInfo {
            slot: slot as u64,
            mechanism: mechanism as u64,
        };
        match succeeded(self.send(request)?)? {
            Reply::MechanismInfo(info) => Ok(info),
            _ => Err(unexpected("GetMechanismInfo")),
        }
    }

    pub fn open_session(
        &self,
        slot: CK_SLOT_ID,
        flags: CK_FLAGS,
    ) -> Result<CK_SESSION_HANDLE, FrontendError> {
        let request = Request::OpenSession {
            slot: slot as u64,
            flags: flags as u64,
        };
        match succeeded(self.send(request)?)? {
            Reply::Session { session } => Ok(self.handles().add_session(session, slot)),
            _ => Err(unexpected("OpenSession")),
        }
    }

    pub fn close_session(&self, session: CK_SESSION_HANDLE) -> Result<(), FrontendError> {
        let response = self.session_call(session, |session| Request::CloseSession { session })?;
        let rv = response.rv as CK_RV;
        if rv == CKR_OK || rv == CKR_SESSION_HANDLE_INVALID || rv == CKR_SESSION_CLOSED {
            self.handles().remove_session(session);
        }
        empty(response)
    }

    pub fn close_all_sessions(&self, slot: CK_SLOT_ID) -> Result<(), FrontendError> {
        empty(self.send(Request::CloseAllSessions { slot: slot as u64 })?)?;
        let closed = self.handles().remove_slot(slot);
        debug!(slot, closed, "closed all sessions");
        Ok(())
    }

    pub fn session_info(&self, session: CK_SESSION_HANDLE) -> Result<SessionInfo, FrontendError> {
        let response = self.session_call(session, |session| Request::GetSessionInfo { session })?;
        match succeeded(response)? {
            Reply::SessionInfo(info) => Ok(info),
            _ => Err(unexpected("GetSessionInfo")),
        }
    }

    pub fn login(
        &self,
        session: CK_SESSION_HANDLE,
        user_type: CK_USER_TYPE,
        pin: &[u8],
    ) -> Result<(), FrontendError> {
        empty(self.session_call(session, |session| Request::Login {
            session,
            user_type: user_type as u64,
            pin: pin.to_vec(),
        })?)
    }

    pub fn logout(&self, session: CK_SESSION_HANDLE) -> Result<(), FrontendError> {
        empty(self.session_call(session, |session| Request::Logout { session })?)
    }

    pub fn create_object(
        &self,
        session: CK_SESSION_HANDLE,
        template: Vec<Attribute>,
    ) -> Result<CK_OBJECT_HANDLE, FrontendError> {
        let response =
            self.session_call(session, |session| Request::CreateObject { session, template })?;
        match succeeded(response)? {
            Reply::Object { object } => Ok(self.handles().add_object(session, object)),
            _ => Err(unexpected("CreateObject")),
        }
    }

    pub fn destroy_object(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> Result<(), FrontendError> {
        let response = self.on_session(session, |table, session| {
            Ok(Request::DestroyObject {
                session,
                object: table.remote_object(object)?,
            })
        })?;
        empty(response)?;
        self.handles().remove_object(object);
        Ok(())
    }

    /// Returns the token's result code with the per-attribute outcomes, since
    /// partial failures still carry values.
    pub fn attribute_values(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        template: Vec<AttributeRequest>,
    ) -> Result<(CK_RV, Vec<AttributeValue>), FrontendError> {
        let response = self.on_session(session, |table, session| {
            Ok(Request::GetAttributeValue {
                session,
                object: table.remote_object(object)?,
                template,
            })
        })?;
        let rv = response.rv as CK_RV;
        match response.reply {
            Reply::Attributes { values } => Ok((rv, values)),
            _ if rv != CKR_OK => Err(FrontendError::Token(rv)),
            _ => Err(unexpected("GetAttributeValue")),
        }
    }

    pub fn find_objects_init(
        &self,
        session: CK_SESSION_HANDLE,
        template: Vec<Attribute>,
    ) -> Result<(), FrontendError> {
        empty(self.session_call(session, |session| Request::FindObjectsInit {
            session,
            template,
        })?)
    }

    pub fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        max: usize,
    ) -> Result<Vec<CK_OBJECT_HANDLE>, FrontendError> {
        let response = self.session_call(session, |session| Request::FindObjects {
            session,
            max: max as u64,
        })?;
        match succeeded(response)? {
            Reply::Objects { objects } => {
                let mut table = self.handles();
                Ok(objects
                    .into_iter()
                    .take(max)
                    .map(|object| table.add_object(session, object))
                    .collect())
            }
            _ => Err(unexpected("FindObjects")),
        }
    }

    pub fn find_objects_final(&self, session: CK_SESSION_HANDLE) -> Result<(), FrontendError> {
        empty(self.session_call(session, |session| Request::FindObjectsFinal { session })?)
    }

    pub fn encrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), FrontendError> {
        empty(self.on_session(session, |table, session| {
            Ok(Request::EncryptInit {
                session,
                mechanism,
                key: table.remote_key(key)?,
            })
        })?)
    }

    pub fn encrypt(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        capacity: Option<u64>,
    ) -> Result<OutputBuffer, FrontendError> {
        let response = self.session_call(session, |session| Request::Encrypt {
            session,
            data: data.to_vec(),
            capacity,
        })?;
        output("Encrypt", response)
    }

    pub fn decrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), FrontendError> {
        empty(self.on_session(session, |table, session| {
            Ok(Request::DecryptInit {
                session,
                mechanism,
                key: table.remote_key(key)?,
            })
        })?)
    }

    pub fn decrypt(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        capacity: Option<u64>,
    ) -> Result<OutputBuffer, FrontendError> {
        let response = self.session_call(session, |session| Request::Decrypt {
            session,
            data: data.to_vec(),
            capacity,
        })?;
        output("Decrypt", response)
    }

    pub fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), FrontendError> {
        empty(self.on_session(session, |table, session| {
            Ok(Request::SignInit {
                session,
                mechanism,
                key: table.remote_key(key)?,
            })
        })?)
    }

    pub fn sign(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        capacity: Option<u64>,
    ) -> Result<OutputBuffer, FrontendError> {
        let response = self.session_call(session, |session| Request::Sign {
            session,
            data: data.to_vec(),
            capacity,
        })?;
        output("Sign", response)
    }

    pub fn sign_update(&self, session: CK_SESSION_HANDLE, part: &[u8]) -> Result<(), FrontendError> {
        empty(self.session_call(session, |session| Request::SignUpdate {
            session,
            data: part.to_vec(),
        })?)
    }

    pub fn sign_final(
        &self,
        session: CK_SESSION_HANDLE,
        capacity: Option<u64>,
    ) -> Result<OutputBuffer, FrontendError> {
        let response =
            self.session_call(session, |session| Request::SignFinal { session, capacity })?;
        output("SignFinal", response)
    }

    pub fn verify_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), FrontendError> {
        empty(self.on_session(session, |table, session| {
            Ok(Request::VerifyInit {
                session,
                mechanism,
                key: table.remote_key(key)?,
            })
        })?)
    }

    pub fn verify(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), FrontendError> {
        empty(self.session_call(session, |session| Request::Verify {
            session,
            data: data.to_vec(),
            signature: signature.to_vec(),
        })?)
    }

    pub fn generate_random(
        &self,
        session: CK_SESSION_HANDLE,
        len: usize,
    ) -> Result<Vec<u8>, FrontendError> {
        let response = self.session_call(session, |session| Request::GenerateRandom {
            session,
            len: len as u64,
        })?;
        match succeeded(response)? {
            Reply::Random { data } if data.len() == len => Ok(data),
            _ => Err(unexpected("GenerateRandom")),
        }
    }

    /// Resolves a session handle without contacting the remote.
    pub fn check_session(&self, session: CK_SESSION_HANDLE) -> Result<(), FrontendError> {
        self.handles()
            .remote_session(session)
            .map(|_| ())
            .map_err(FrontendError::Token)
    }

    pub fn open_sessions(&self) -> usize {
        self.handles().session_count()
    }
}
