//! The capability the server needs from "a token provider".
//!
//! Everything above this trait speaks in owned, wire-form values (see
//! `rsc_core::types`); implementations translate to whatever their backend
//! needs. Errors are the provider's own result codes, passed through to the
//! client untouched.

use std::sync::Arc;

use cryptoki_sys::{CK_RV, CKR_GENERAL_ERROR};
use parking_lot::Mutex;
use rsc_core::{
    Attribute, AttributeReport, AttributeRequest, LibraryInfo, Mechanism, MechanismInfo,
    OutputBuffer, SessionInfo, SlotInfo, TokenInfo,
};
use tracing::error;

pub mod library;
pub mod memory;

pub use library::LibraryProvider;
pub use memory::{MemoryToken, MemoryTokenConfig};

pub type ProviderResult<T> = Result<T, CK_RV>;

pub trait TokenProvider: Send + Sync {
    /// Whether the provider tolerates concurrent calls. Providers that do
    /// not are driven through a single lock.
    fn thread_safe(&self) -> bool {
        false
    }

    fn info(&self) -> ProviderResult<LibraryInfo>;
    fn slot_list(&self, token_present: bool) -> ProviderResult<Vec<u64>>;
    fn slot_info(&self, slot: u64) -> ProviderResult<SlotInfo>;
    fn token_info(&self, slot: u64) -> ProviderResult<TokenInfo>;
    fn mechanism_list(&self, slot: u64) -> ProviderResult<Vec<u64>>;
    fn mechanism_info(&self, slot: u64, mechanism: u64) -> ProviderResult<MechanismInfo>;

    fn open_session(&self, slot: u64, flags: u64) -> ProviderResult<u64>;
    fn close_session(&self, session: u64) -> ProviderResult<()>;
    fn session_info(&self, session: u64) -> ProviderResult<SessionInfo>;
    fn login(&self, session: u64, user_type: u64, pin: &[u8]) -> ProviderResult<()>;
    fn logout(&self, session: u64) -> ProviderResult<()>;

    fn create_object(&self, session: u64, template: &[Attribute]) -> ProviderResult<u64>;
    fn destroy_object(&self, session: u64, object: u64) -> ProviderResult<()>;
    /// Partial success is part of this call's contract, so the result code
    /// travels inside the report.
    fn get_attribute_value(
        &self,
        session: u64,
        object: u64,
        template: &[AttributeRequest],
    ) -> AttributeReport;
    fn find_objects_init(&self, session: u64, template: &[Attribute]) -> ProviderResult<()>;
    fn find_objects(&self, session: u64, max: u64) -> ProviderResult<Vec<u64>>;
    fn find_objects_final(&self, session: u64) -> ProviderResult<()>;

    fn encrypt_init(&self, session: u64, mechanism: &Mechanism, key: u64) -> ProviderResult<()>;
    fn encrypt(
        &self,
        session: u64,
        data: &[u8],
        capacity: Option<u64>,
    ) -> ProviderResult<OutputBuffer>;
    fn decrypt_init(&self, session: u64, mechanism: &Mechanism, key: u64) -> ProviderResult<()>;
    fn decrypt(
        &self,
        session: u64,
        data: &[u8],
        capacity: Option<u64>,
    ) -> ProviderResult<OutputBuffer>;

    fn sign_init(&self, session: u64, mechanism: &Mechanism, key: u64) -> ProviderResult<()>;
    fn sign(&self, session: u64, data: &[u8], capacity: Option<u64>)
    -> ProviderResult<OutputBuffer>;
    fn sign_update(&self, session: u64, data: &[u8]) -> ProviderResult<()>;
    fn sign_final(&self, session: u64, capacity: Option<u64>) -> ProviderResult<OutputBuffer>;
    fn verify_init(&self, session: u64, mechanism: &Mechanism, key: u64) -> ProviderResult<()>;
    fn verify(&self, session: u64, data: &[u8], signature: &[u8]) -> ProviderResult<()>;

    fn generate_random(&self, session: u64, len: u64) -> ProviderResult<Vec<u8>>;
}

/// The single provider instance shared by every connection, with the
/// provider-access lock applied when the provider needs it.
pub struct ProviderGate {
    provider: Arc<dyn TokenProvider>,
    lock: Option<Mutex<()>>,
}

impl ProviderGate {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        let lock = (!provider.thread_safe()).then(|| Mutex::new(()));
        Self { provider, lock }
    }

    pub fn serialized(&self) -> bool {
        self.lock.is_some()
    }

    pub fn with<T>(&self, f: impl FnOnce(&dyn TokenProvider) -> T) -> T {
        let _guard = self.lock.as_ref().map(|lock| lock.lock());
        f(self.provider.as_ref())
    }

    /// Runs a provider call on the blocking pool so slow tokens never stall
    /// connection I/O.
    pub async fn run<T, F>(self: &Arc<Self>, f: F) -> ProviderResult<T>
    where
        F: FnOnce(&dyn TokenProvider) -> ProviderResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let gate = Arc::clone(self);
        match tokio::task::spawn_blocking(move || gate.with(f)).await {
            Ok(result) => result,
            Err(err) => {
                error!("provider call failed: {err}");
                Err(CKR_GENERAL_ERROR)
            }
        }
    }
}
