//! In-process software token.
//!
//! A single slot holding data and generic secret-key objects, with user and
//! security-officer PINs and HMAC-SHA256 signing. It backs `--provider
//! memory` and the integration tests, which also use its call counter and
//! session gauge to observe what reached the provider.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cryptoki_sys::{
    CK_RV, CK_USER_TYPE, CKA_CLASS, CKA_PRIVATE, CKA_SENSITIVE, CKA_SIGN, CKA_TOKEN, CKA_VALUE,
    CKA_VERIFY, CKF_LOGIN_REQUIRED, CKF_RNG, CKF_RW_SESSION, CKF_SERIAL_SESSION,
    CKF_SIGN, CKF_TOKEN_INITIALIZED, CKF_TOKEN_PRESENT, CKF_USER_PIN_INITIALIZED, CKF_VERIFY,
    CKM_SHA256_HMAC, CKO_SECRET_KEY, CKR_ATTRIBUTE_SENSITIVE, CKR_ATTRIBUTE_TYPE_INVALID,
    CKR_BUFFER_TOO_SMALL, CKR_KEY_FUNCTION_NOT_PERMITTED, CKR_KEY_HANDLE_INVALID,
    CKR_KEY_TYPE_INCONSISTENT, CKR_MECHANISM_INVALID, CKR_OBJECT_HANDLE_INVALID, CKR_OK,
    CKR_OPERATION_ACTIVE, CKR_OPERATION_NOT_INITIALIZED, CKR_PIN_INCORRECT,
    CKR_SESSION_HANDLE_INVALID, CKR_SESSION_PARALLEL_NOT_SUPPORTED, CKR_SESSION_READ_ONLY,
    CKR_SESSION_READ_ONLY_EXISTS, CKR_SESSION_READ_WRITE_SO_EXISTS, CKR_SIGNATURE_INVALID,
    CKR_SIGNATURE_LEN_RANGE, CKR_SLOT_ID_INVALID, CKR_TEMPLATE_INCOMPLETE,
    CKR_USER_ALREADY_LOGGED_IN, CKR_USER_ANOTHER_ALREADY_LOGGED_IN, CKR_USER_NOT_LOGGED_IN,
    CKR_USER_TYPE_INVALID, CKS_RO_PUBLIC_SESSION, CKS_RO_USER_FUNCTIONS, CKS_RW_PUBLIC_SESSION,
    CKS_RW_SO_FUNCTIONS, CKS_RW_USER_FUNCTIONS, CKU_SO, CKU_USER,
};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::RngCore;
use rand::rngs::OsRng;
use rsc_core::{
    Attribute, AttributeReport, AttributeRequest, AttributeValue, InfoText, LibraryInfo,
    Mechanism, MechanismInfo, OutputBuffer, SessionInfo, SlotInfo, TokenInfo, Version,
};
use sha2::Sha256;

use super::{ProviderResult, TokenProvider};

const HMAC_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct MemoryTokenConfig {
    pub slot_id: u64,
    pub manufacturer: String,
    pub description: String,
    pub label: String,
    pub user_pin: Vec<u8>,
    pub so_pin: Vec<u8>,
    /// Artificial latency added to every single-part sign.
    pub sign_delay: Duration,
    pub thread_safe: bool,
}

impl Default for MemoryTokenConfig {
    fn default() -> Self {
        Self {
            slot_id: 0,
            manufacturer: "SoftHSM".to_string(),
            description: "Implementation of PKCS11".to_string(),
            label: "remotesc".to_string(),
            user_pin: b"1234".to_vec(),
            so_pin: b"12345678".to_vec(),
            sign_delay: Duration::ZERO,
            thread_safe: false,
        }
    }
}

#[derive(Debug)]
enum Operation {
    Sign {
        key: Vec<u8>,
        buffer: Vec<u8>,
    },
    Verify {
        key: Vec<u8>,
    },
}

#[derive(Debug)]
struct Session {
    rw: bool,
    search: Option<VecDeque<u64>>,
    operation: Option<Operation>,
}

#[derive(Debug)]
struct Object {
    attributes: Vec<Attribute>,
    /// Session objects die with their session; token objects have no owner.
    owner: Option<u64>,
}

impl Object {
    fn get(&self, kind: u64) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|attr| attr.kind == kind)
            .map(|attr| attr.value.as_slice())
    }

    fn flag(&self, kind: u64) -> bool {
        self.get(kind).is_some_and(|value| value.first() == Some(&1))
    }

    fn matches(&self, template: &[Attribute]) -> bool {
        template
            .iter()
            .all(|want| self.get(want.kind) == Some(want.value.as_slice()))
    }
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<u64, Session>,
    objects: HashMap<u64, Object>,
    login: Option<CK_USER_TYPE>,
    next_handle: u64,
}

impl Inner {
    fn allocate(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn session(&mut self, handle: u64) -> ProviderResult<&mut Session> {
        self.sessions
            .get_mut(&handle)
            .ok_or(CKR_SESSION_HANDLE_INVALID)
    }

    fn visible(&self, object: &Object) -> bool {
        !object.flag(CKA_PRIVATE as u64) || self.login == Some(CKU_USER)
    }

    fn object(&self, handle: u64) -> Option<&Object> {
        self.objects.get(&handle).filter(|obj| self.visible(obj))
    }

    fn signing_key(&self, mechanism: &Mechanism, key: u64, usage: u64) -> ProviderResult<Vec<u8>> {
        if mechanism.kind != CKM_SHA256_HMAC as u64 {
            return Err(CKR_MECHANISM_INVALID);
        }
        let object = self.object(key).ok_or(CKR_KEY_HANDLE_INVALID)?;
        if object.get(CKA_CLASS as u64) != Some(&(CKO_SECRET_KEY as u64).to_le_bytes()[..]) {
            return Err(CKR_KEY_TYPE_INCONSISTENT);
        }
        if !object.flag(usage) {
            return Err(CKR_KEY_FUNCTION_NOT_PERMITTED);
        }
        object
            .get(CKA_VALUE as u64)
            .map(<[u8]>::to_vec)
            .ok_or(CKR_KEY_HANDLE_INVALID)
    }
}

pub struct MemoryToken {
    config: MemoryTokenConfig,
    inner: Mutex<Inner>,
    invocations: AtomicU64,
}

impl MemoryToken {
    pub fn new(config: MemoryTokenConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
            invocations: AtomicU64::new(0),
        }
    }

    /// Number of provider calls made so far.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn logged_in(&self) -> Option<u64> {
        self.inner.lock().login.map(|user| user as u64)
    }

    fn enter(&self) -> parking_lot::MutexGuard<'_, Inner> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.inner.lock()
    }

    fn check_slot(&self, slot: u64) -> ProviderResult<()> {
        if slot == self.config.slot_id {
            Ok(())
        } else {
            Err(CKR_SLOT_ID_INVALID)
        }
    }
}

fn hmac(key: &[u8], data: &[u8]) -> ProviderResult<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|_| CKR_KEY_HANDLE_INVALID)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// A completed output ends the operation; a length query or short buffer
/// leaves it active so the caller can retry.
fn finishes(output: &OutputBuffer) -> bool {
    output.data.is_some()
}

impl TokenProvider for MemoryToken {
    fn thread_safe(&self) -> bool {
        self.config.thread_safe
    }

    fn info(&self) -> ProviderResult<LibraryInfo> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(LibraryInfo {
            cryptoki_version: Version::new(2, 40),
            manufacturer: self.config.manufacturer.as_str().into(),
            flags: 0,
            description: self.config.description.as_str().into(),
            library_version: Version::new(2, 6),
        })
    }

    fn slot_list(&self, _token_present: bool) -> ProviderResult<Vec<u64>> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(vec![self.config.slot_id])
    }

    fn slot_info(&self, slot: u64) -> ProviderResult<SlotInfo> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.check_slot(slot)?;
        Ok(SlotInfo {
            description: format!("{} slot {}", self.config.description, slot).into(),
            manufacturer: self.config.manufacturer.as_str().into(),
            flags: CKF_TOKEN_PRESENT as u64,
            hardware_version: Version::new(2, 6),
            firmware_version: Version::new(2, 6),
        })
    }

    fn token_info(&self, slot: u64) -> ProviderResult<TokenInfo> {
        let inner = self.enter();
        self.check_slot(slot)?;
        let rw = inner.sessions.values().filter(|s| s.rw).count() as u64;
        Ok(TokenInfo {
            label: self.config.label.as_str().into(),
            manufacturer: self.config.manufacturer.as_str().into(),
            model: "MemoryToken".into(),
            serial_number: format!("{:016x}", slot + 1).into(),
            flags: (CKF_RNG | CKF_LOGIN_REQUIRED | CKF_USER_PIN_INITIALIZED | CKF_TOKEN_INITIALIZED)
                as u64,
            max_session_count: Some(0),
            session_count: Some(inner.sessions.len() as u64),
            max_rw_session_count: Some(0),
            rw_session_count: Some(rw),
            max_pin_len: 255,
            min_pin_len: 4,
            total_public_memory: None,
            free_public_memory: None,
            total_private_memory: None,
            free_private_memory: None,
            hardware_version: Version::new(2, 6),
            firmware_version: Version::new(2, 6),
            utc_time: InfoText::default(),
        })
    }

    fn mechanism_list(&self, slot: u64) -> ProviderResult<Vec<u64>> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.check_slot(slot)?;
        Ok(vec![CKM_SHA256_HMAC as u64])
    }

    fn mechanism_info(&self, slot: u64, mechanism: u64) -> ProviderResult<MechanismInfo> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.check_slot(slot)?;
        if mechanism != CKM_SHA256_HMAC as u64 {
            return Err(CKR_MECHANISM_INVALID);
        }
        Ok(MechanismInfo {
            min_key_size: 32,
            max_key_size: 512,
            flags: (CKF_SIGN | CKF_VERIFY) as u64,
        })
    }

    fn open_session(&self, slot: u64, flags: u64) -> ProviderResult<u64> {
        let mut inner = self.enter();
        self.check_slot(slot)?;
        if flags & CKF_SERIAL_SESSION as u64 == 0 {
            return Err(CKR_SESSION_PARALLEL_NOT_SUPPORTED);
        }
        let rw = flags & CKF_RW_SESSION as u64 != 0;
        if !rw && inner.login == Some(CKU_SO) {
            return Err(CKR_SESSION_READ_WRITE_SO_EXISTS);
        }
        let handle = inner.allocate();
        inner.sessions.insert(
            handle,
            Session {
                rw,
                search: None,
                operation: None,
            },
        );
        Ok(handle)
    }

    fn close_session(&self, session: u64) -> ProviderResult<()> {
        let mut inner = self.enter();
        inner
            .sessions
            .remove(&session)
            .ok_or(CKR_SESSION_HANDLE_INVALID)?;
        inner.objects.retain(|_, obj| obj.owner != Some(session));
        if inner.sessions.is_empty() {
            inner.login = None;
        }
        Ok(())
    }

    fn session_info(&self, session: u64) -> ProviderResult<SessionInfo> {
        let mut inner = self.enter();
        let login = inner.login;
        let rw = inner.session(session)?.rw;
        let state = match (login, rw) {
            (Some(CKU_SO), _) => CKS_RW_SO_FUNCTIONS,
            (Some(_), true) => CKS_RW_USER_FUNCTIONS,
            (Some(_), false) => CKS_RO_USER_FUNCTIONS,
            (None, true) => CKS_RW_PUBLIC_SESSION,
            (None, false) => CKS_RO_PUBLIC_SESSION,
        };
        let mut flags = CKF_SERIAL_SESSION as u64;
        if rw {
            flags |= CKF_RW_SESSION as u64;
        }
        Ok(SessionInfo {
            slot_id: self.config.slot_id,
            state: state as u64,
            flags,
            device_error: 0,
        })
    }

    fn login(&self, session: u64, user_type: u64, pin: &[u8]) -> ProviderResult<()> {
        let mut inner = self.enter();
        inner.session(session)?;
        let user = user_type as CK_USER_TYPE;
        if user != CKU_USER && user != CKU_SO {
            return Err(CKR_USER_TYPE_INVALID);
        }
        match inner.login {
            Some(current) if current == user => return Err(CKR_USER_ALREADY_LOGGED_IN),
            Some(_) => return Err(CKR_USER_ANOTHER_ALREADY_LOGGED_IN),
            None => {}
        }
        if user == CKU_SO && inner.sessions.values().any(|s| !s.rw) {
            return Err(CKR_SESSION_READ_ONLY_EXISTS);
        }
        let expected = if user == CKU_SO {
            &self.config.so_pin
        } else {
            &self.config.user_pin
        };
        if pin != expected.as_slice() {
            return Err(CKR_PIN_INCORRECT);
        }
        inner.login = Some(user);
        Ok(())
    }

    fn logout(&self, session: u64) -> ProviderResult<()> {
        let mut inner = self.enter();
        inner.session(session)?;
        if inner.login.take().is_none() {
            return Err(CKR_USER_NOT_LOGGED_IN);
        }
        Ok(())
    }

    fn create_object(&self, session: u64, template: &[Attribute]) -> ProviderResult<u64> {
        let mut inner = self.enter();
        let rw = inner.session(session)?.rw;
        let object = Object {
            attributes: template.to_vec(),
            owner: Some(session),
        };
        if object.get(CKA_CLASS as u64).is_none() {
            return Err(CKR_TEMPLATE_INCOMPLETE);
        }
        let token_object = object.flag(CKA_TOKEN as u64);
        if token_object && !rw {
            return Err(CKR_SESSION_READ_ONLY);
        }
        if object.flag(CKA_PRIVATE as u64) && inner.login != Some(CKU_USER) {
            return Err(CKR_USER_NOT_LOGGED_IN);
        }
        let handle = inner.allocate();
        inner.objects.insert(
            handle,
            Object {
                owner: (!token_object).then_some(session),
                ..object
            },
        );
        Ok(handle)
    }

    fn destroy_object(&self, session: u64, object: u64) -> ProviderResult<()> {
        let mut inner = self.enter();
        inner.session(session)?;
        if inner.object(object).is_none() {
            return Err(CKR_OBJECT_HANDLE_INVALID);
        }
        inner.objects.remove(&object);
        Ok(())
    }

    fn get_attribute_value(
        &self,
        session: u64,
        object: u64,
        template: &[AttributeRequest],
    ) -> AttributeReport {
        let mut inner = self.enter();
        let unavailable = |rv: CK_RV| AttributeReport {
            rv: rv as u64,
            values: template
                .iter()
                .map(|req| AttributeValue::unavailable(req.kind))
                .collect(),
        };
        if inner.session(session).is_err() {
            return unavailable(CKR_SESSION_HANDLE_INVALID);
        }
        let Some(obj) = inner.object(object) else {
            return unavailable(CKR_OBJECT_HANDLE_INVALID);
        };

        let sensitive = obj.flag(CKA_SENSITIVE as u64);
        let mut rv = CKR_OK;
        let mut values = Vec::with_capacity(template.len());
        for req in template {
            let outcome = match obj.get(req.kind) {
                _ if sensitive && req.kind == CKA_VALUE as u64 => Err(CKR_ATTRIBUTE_SENSITIVE),
                None => Err(CKR_ATTRIBUTE_TYPE_INVALID),
                Some(value) => match req.capacity {
                    None => Ok(AttributeValue {
                        kind: req.kind,
                        len: Some(value.len() as u64),
                        value: None,
                    }),
                    Some(cap) if cap < value.len() as u64 => Err(CKR_BUFFER_TOO_SMALL),
                    Some(_) => Ok(AttributeValue {
                        kind: req.kind,
                        len: Some(value.len() as u64),
                        value: Some(value.to_vec()),
                    }),
                },
            };
            match outcome {
                Ok(value) => values.push(value),
                Err(code) => {
                    if rv == CKR_OK {
                        rv = code;
                    }
                    values.push(AttributeValue::unavailable(req.kind));
                }
            }
        }
        AttributeReport {
            rv: rv as u64,
            values,
        }
    }

    fn find_objects_init(&self, session: u64, template: &[Attribute]) -> ProviderResult<()> {
        let mut inner = self.enter();
        if inner.session(session)?.search.is_some() {
            return Err(CKR_OPERATION_ACTIVE);
        }
        let mut found: Vec<u64> = inner
            .objects
            .iter()
            .filter(|(_, obj)| inner.visible(obj) && obj.matches(template))
            .map(|(handle, _)| *handle)
            .collect();
        found.sort_unstable();
        inner.session(session)?.search = Some(found.into());
        Ok(())
    }

    fn find_objects(&self, session: u64, max: u64) -> ProviderResult<Vec<u64>> {
        let mut inner = self.enter();
        let search = inner
            .session(session)?
            .search
            .as_mut()
            .ok_or(CKR_OPERATION_NOT_INITIALIZED)?;
        let take = (max as usize).min(search.len());
        Ok(search.drain(..take).collect())
    }

    fn find_objects_final(&self, session: u64) -> ProviderResult<()> {
        let mut inner = self.enter();
        inner
            .session(session)?
            .search
            .take()
            .map(|_| ())
            .ok_or(CKR_OPERATION_NOT_INITIALIZED)
    }

    fn encrypt_init(&self, session: u64, _mechanism: &Mechanism, key: u64) -> ProviderResult<()> {
        let mut inner = self.enter();
        inner.session(session)?;
        inner.object(key).ok_or(CKR_KEY_HANDLE_INVALID)?;
        Err(CKR_MECHANISM_INVALID)
    }

    fn encrypt(
        &self,
        session: u64,
        _data: &[u8],
        _capacity: Option<u64>,
    ) -> ProviderResult<OutputBuffer> {
        let mut inner = self.enter();
        inner.session(session)?;
        Err(CKR_OPERATION_NOT_INITIALIZED)
    }

    fn decrypt_init(&self, session: u64, _mechanism: &Mechanism, key: u64) -> ProviderResult<()> {
        let mut inner = self.enter();
        inner.session(session)?;
        inner.object(key).ok_or(CKR_KEY_HANDLE_INVALID)?;
        Err(CKR_MECHANISM_INVALID)
    }

    fn decrypt(
        &self,
        session: u64,
        _data: &[u8],
        _capacity: Option<u64>,
    ) -> ProviderResult<OutputBuffer> {
        let mut inner = self.enter();
        inner.session(session)?;
        Err(CKR_OPERATION_NOT_INITIALIZED)
    }

    fn sign_init(&self, session: u64, mechanism: &Mechanism, key: u64) -> ProviderResult<()> {
        let mut inner = self.enter();
        if inner.session(session)?.operation.is_some() {
            return Err(CKR_OPERATION_ACTIVE);
        }
        let key = inner.signing_key(mechanism, key, CKA_SIGN as u64)?;
        inner.session(session)?.operation = Some(Operation::Sign {
            key,
            buffer: Vec::new(),
        });
        Ok(())
    }

    fn sign(
        &self,
        session: u64,
        data: &[u8],
        capacity: Option<u64>,
    ) -> ProviderResult<OutputBuffer> {
        if !self.config.sign_delay.is_zero() {
            std::thread::sleep(self.config.sign_delay);
        }
        let mut inner = self.enter();
        let state = inner.session(session)?;
        let Some(Operation::Sign { key, .. }) = &state.operation else {
            return Err(CKR_OPERATION_NOT_INITIALIZED);
        };
        let output = OutputBuffer::fit(hmac(key, data)?, capacity);
        if finishes(&output) {
            state.operation = None;
        }
        Ok(output)
    }

    fn sign_update(&self, session: u64, data: &[u8]) -> ProviderResult<()> {
        let mut inner = self.enter();
        match &mut inner.session(session)?.operation {
            Some(Operation::Sign { buffer, .. }) => {
                buffer.extend_from_slice(data);
                Ok(())
            }
            _ => Err(CKR_OPERATION_NOT_INITIALIZED),
        }
    }

    fn sign_final(&self, session: u64, capacity: Option<u64>) -> ProviderResult<OutputBuffer> {
        let mut inner = self.enter();
        let state = inner.session(session)?;
        let Some(Operation::Sign { key, buffer }) = &state.operation else {
            return Err(CKR_OPERATION_NOT_INITIALIZED);
        };
        let output = OutputBuffer::fit(hmac(key, buffer)?, capacity);
        if finishes(&output) {
            state.operation = None;
        }
        Ok(output)
    }

    fn verify_init(&self, session: u64, mechanism: &Mechanism, key: u64) -> ProviderResult<()> {
        let mut inner = self.enter();
        if inner.session(session)?.operation.is_some() {
            return Err(CKR_OPERATION_ACTIVE);
        }
        let key = inner.signing_key(mechanism, key, CKA_VERIFY as u64)?;
        inner.session(session)?.operation = Some(Operation::Verify { key });
        Ok(())
    }

    fn verify(&self, session: u64, data: &[u8], signature: &[u8]) -> ProviderResult<()> {
        let mut inner = self.enter();
        let state = inner.session(session)?;
        let key = match &state.operation {
            Some(Operation::Verify { key }) => key.clone(),
            _ => return Err(CKR_OPERATION_NOT_INITIALIZED),
        };
        state.operation = None;
        if signature.len() != HMAC_LEN {
            return Err(CKR_SIGNATURE_LEN_RANGE);
        }
        let mut mac = Hmac::<Sha256>::new_from_slice(&key).map_err(|_| CKR_KEY_HANDLE_INVALID)?;
        mac.update(data);
        mac.verify_slice(signature)
            .map_err(|_| CKR_SIGNATURE_INVALID)
    }

    fn generate_random(&self, session: u64, len: u64) -> ProviderResult<Vec<u8>> {
        let mut inner = self.enter();
        inner.session(session)?;
        let mut out = vec![0u8; len as usize];
        OsRng.fill_bytes(&mut out);
        Ok(out)
    }
}
