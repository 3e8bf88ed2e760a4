//! A PKCS#11 library loaded at runtime.

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::ptr;

use cryptoki_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_TYPE, CK_BBOOL, CK_C_INITIALIZE_ARGS, CK_FLAGS, CK_FUNCTION_LIST,
    CK_FUNCTION_LIST_PTR_PTR, CK_INFO, CK_MECHANISM, CK_MECHANISM_INFO, CK_MECHANISM_TYPE,
    CK_OBJECT_HANDLE, CK_RV, CK_SESSION_INFO, CK_SLOT_ID, CK_SLOT_INFO, CK_TOKEN_INFO, CK_ULONG,
    CK_UNAVAILABLE_INFORMATION, CK_USER_TYPE, CK_VERSION, CKF_OS_LOCKING_OK,
    CKR_BUFFER_TOO_SMALL, CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_FUNCTION_NOT_SUPPORTED, CKR_OK,
};
use libloading::{Library, Symbol};
use rsc_core::codec::DEFAULT_MAX_FRAME_LEN;
use rsc_core::types::{WIRE_ULONG_LEN, is_ulong_attribute, wire_len, wire_value};
use rsc_core::{
    Attribute, AttributeReport, AttributeRequest, AttributeValue, InfoText, LibraryInfo,
    Mechanism, MechanismInfo, OutputBuffer, SessionInfo, SlotInfo, TokenInfo, Version,
};
use thiserror::Error;
use tracing::{info, warn};

use super::{ProviderResult, TokenProvider};

/// Largest buffer allocated on behalf of a client-supplied capacity. Nothing
/// larger could travel back in a single frame anyway.
const MAX_BUFFER: u64 = DEFAULT_MAX_FRAME_LEN as u64;

/// Most handles pulled from the module in one `C_FindObjects`.
const MAX_FIND_BATCH: u64 = 4096;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to load {path}: {source}")]
    Load {
        path: PathBuf,
        source: libloading::Error,
    },
    #[error("C_GetFunctionList unavailable: {0}")]
    Symbol(libloading::Error),
    #[error("{call} returned 0x{rv:x}")]
    Call { call: &'static str, rv: CK_RV },
}

struct FunctionList(*const CK_FUNCTION_LIST);

// The function table is immutable once returned and the library is
// initialised with CKF_OS_LOCKING_OK, so the pointer may cross threads.
unsafe impl Send for FunctionList {}
unsafe impl Sync for FunctionList {}

pub struct LibraryProvider {
    functions: FunctionList,
    path: PathBuf,
    thread_safe: bool,
    // Dropped last so the function table outlives every call into it.
    _library: Library,
}

impl std::fmt::Debug for LibraryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryProvider")
            .field("path", &self.path)
            .field("thread_safe", &self.thread_safe)
            .finish()
    }
}

fn check(rv: CK_RV) -> ProviderResult<()> {
    if rv == CKR_OK { Ok(()) } else { Err(rv) }
}

fn function<F>(entry: Option<F>) -> ProviderResult<F> {
    entry.ok_or(CKR_FUNCTION_NOT_SUPPORTED)
}

fn version(raw: CK_VERSION) -> Version {
    Version::new(raw.major, raw.minor)
}

fn available(value: CK_ULONG) -> Option<u64> {
    (value != CK_UNAVAILABLE_INFORMATION).then_some(value as u64)
}

/// Host-laid-out attribute values kept alive alongside the raw template
/// that points into them.
struct Template {
    _values: Vec<Vec<u8>>,
    raw: Vec<CK_ATTRIBUTE>,
}

impl Template {
    fn new(attributes: &[Attribute]) -> Self {
        let mut values: Vec<Vec<u8>> = attributes.iter().map(Attribute::host_value).collect();
        let raw = attributes
            .iter()
            .zip(values.iter_mut())
            .map(|(attr, value)| CK_ATTRIBUTE {
                type_: attr.kind as CK_ATTRIBUTE_TYPE,
                pValue: value.as_mut_ptr() as *mut c_void,
                ulValueLen: value.len() as CK_ULONG,
            })
            .collect();
        Self {
            _values: values,
            raw,
        }
    }

    fn ptr(&mut self) -> *mut CK_ATTRIBUTE {
        if self.raw.is_empty() {
            ptr::null_mut()
        } else {
            self.raw.as_mut_ptr()
        }
    }

    fn len(&self) -> CK_ULONG {
        self.raw.len() as CK_ULONG
    }
}

fn raw_mechanism(mechanism: &Mechanism, parameter: &mut Vec<u8>) -> CK_MECHANISM {
    CK_MECHANISM {
        mechanism: mechanism.kind as CK_MECHANISM_TYPE,
        pParameter: if parameter.is_empty() {
            ptr::null_mut()
        } else {
            parameter.as_mut_ptr() as *mut c_void
        },
        ulParameterLen: parameter.len() as CK_ULONG,
    }
}

/// Drives a call following the two-step output convention.
fn output_call(
    capacity: Option<u64>,
    mut call: impl FnMut(*mut u8, &mut CK_ULONG) -> CK_RV,
) -> ProviderResult<OutputBuffer> {
    let Some(capacity) = capacity else {
        let mut len: CK_ULONG = 0;
        check(call(ptr::null_mut(), &mut len))?;
        return Ok(OutputBuffer::length(len as usize));
    };
    let mut buffer = vec![0u8; capacity.min(MAX_BUFFER) as usize];
    let mut len = buffer.len() as CK_ULONG;
    let rv = call(buffer.as_mut_ptr(), &mut len);
    if rv == CKR_BUFFER_TOO_SMALL {
        return Ok(OutputBuffer::length(len as usize));
    }
    check(rv)?;
    buffer.truncate(len as usize);
    Ok(OutputBuffer::filled(buffer))
}

/// Drives a call that fills a list, retrying while the list keeps growing.
fn list_call<T: Copy + Default>(
    mut call: impl FnMut(*mut T, &mut CK_ULONG) -> CK_RV,
) -> ProviderResult<Vec<T>> {
    loop {
        let mut count: CK_ULONG = 0;
        check(call(ptr::null_mut(), &mut count))?;
        let mut items = vec![T::default(); count as usize];
        if items.is_empty() {
            return Ok(items);
        }
        match call(items.as_mut_ptr(), &mut count) {
            CKR_BUFFER_TOO_SMALL => continue,
            rv => check(rv)?,
        }
        items.truncate(count as usize);
        return Ok(items);
    }
}

impl LibraryProvider {
    /// Loads the library and initialises it for OS locking.
    pub fn load(path: &Path, thread_safe: bool) -> Result<Self, ProviderError> {
        // SAFETY: loading a PKCS#11 module runs its initialisers; the operator
        // chose this library explicitly.
        let library = unsafe { Library::new(path) }.map_err(|source| ProviderError::Load {
            path: path.to_path_buf(),
            source,
        })?;

        let mut list: *mut CK_FUNCTION_LIST = ptr::null_mut();
        {
            // SAFETY: the symbol has the signature fixed by the token standard.
            let get_function_list: Symbol<unsafe extern "C" fn(CK_FUNCTION_LIST_PTR_PTR) -> CK_RV> =
                unsafe { library.get(b"C_GetFunctionList\0") }.map_err(ProviderError::Symbol)?;
            let rv = unsafe { get_function_list(&mut list) };
            if rv != CKR_OK || list.is_null() {
                return Err(ProviderError::Call {
                    call: "C_GetFunctionList",
                    rv,
                });
            }
        }

        let mut args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: CKF_OS_LOCKING_OK as CK_FLAGS,
            pReserved: ptr::null_mut(),
        };
        // SAFETY: `list` was checked non-null and points into the loaded library.
        let initialize = unsafe { (*list).C_Initialize }.ok_or(ProviderError::Call {
            call: "C_Initialize",
            rv: CKR_FUNCTION_NOT_SUPPORTED,
        })?;
        let rv = unsafe { initialize(&mut args as *mut CK_C_INITIALIZE_ARGS as *mut c_void) };
        if rv != CKR_OK && rv != CKR_CRYPTOKI_ALREADY_INITIALIZED {
            return Err(ProviderError::Call {
                call: "C_Initialize",
                rv,
            });
        }
        info!(path = %path.display(), "loaded token provider");

        Ok(Self {
            functions: FunctionList(list),
            path: path.to_path_buf(),
            thread_safe,
            _library: library,
        })
    }

    fn list(&self) -> &CK_FUNCTION_LIST {
        // SAFETY: non-null by construction and valid while `_library` is loaded.
        unsafe { &*self.functions.0 }
    }
}

impl Drop for LibraryProvider {
    fn drop(&mut self) {
        if let Some(finalize) = self.list().C_Finalize {
            let rv = unsafe { finalize(ptr::null_mut()) };
            if rv != CKR_OK {
                warn!(rv, "provider C_Finalize failed");
            }
        }
    }
}

impl TokenProvider for LibraryProvider {
    fn thread_safe(&self) -> bool {
        self.thread_safe
    }

    fn info(&self) -> ProviderResult<LibraryInfo> {
        let get_info = function(self.list().C_GetInfo)?;
        let mut info: CK_INFO = unsafe { std::mem::zeroed() };
        check(unsafe { get_info(&mut info) })?;
        Ok(LibraryInfo {
            cryptoki_version: version(info.cryptokiVersion),
            manufacturer: InfoText::from_field(&info.manufacturerID),
            flags: info.flags as u64,
            description: InfoText::from_field(&info.libraryDescription),
            library_version: version(info.libraryVersion),
        })
    }

    fn slot_list(&self, token_present: bool) -> ProviderResult<Vec<u64>> {
        let get_slot_list = function(self.list().C_GetSlotList)?;
        let present = CK_BBOOL::from(token_present);
        let slots = list_call::<CK_SLOT_ID>(|out, count| unsafe {
            get_slot_list(present, out, count)
        })?;
        Ok(slots.into_iter().map(|slot| slot as u64).collect())
    }

    fn slot_info(&self, slot: u64) -> ProviderResult<SlotInfo> {
        let get_slot_info = function(self.list().C_GetSlotInfo)?;
        let mut info: CK_SLOT_INFO = unsafe { std::mem::zeroed() };
        check(unsafe { get_slot_info(slot as CK_SLOT_ID, &mut info) })?;
        Ok(SlotInfo {
            description: InfoText::from_field(&info.slotDescription),
            manufacturer: InfoText::from_field(&info.manufacturerID),
            flags: info.flags as u64,
            hardware_version: version(info.hardwareVersion),
            firmware_version: version(info.firmwareVersion),
        })
    }

    fn token_info(&self, slot: u64) -> ProviderResult<TokenInfo> {
        let get_token_info = function(self.list().C_GetTokenInfo)?;
        let mut info: CK_TOKEN_INFO = unsafe { std::mem::zeroed() };
        check(unsafe { get_token_info(slot as CK_SLOT_ID, &mut info) })?;
        Ok(TokenInfo {
            label: InfoText::from_field(&info.label),
            manufacturer: InfoText::from_field(&info.manufacturerID),
            model: InfoText::from_field(&info.model),
            serial_number: InfoText::from_field(&info.serialNumber),
            flags: info.flags as u64,
            max_session_count: available(info.ulMaxSessionCount),
            session_count: available(info.ulSessionCount),
            max_rw_session_count: available(info.ulMaxRwSessionCount),
            rw_session_count: available(info.ulRwSessionCount),
            max_pin_len: info.ulMaxPinLen as u64,
            min_pin_len: info.ulMinPinLen as u64,
            total_public_memory: available(info.ulTotalPublicMemory),
            free_public_memory: available(info.ulFreePublicMemory),
            total_private_memory: available(info.ulTotalPrivateMemory),
            free_private_memory: available(info.ulFreePrivateMemory),
            hardware_version: version(info.hardwareVersion),
            firmware_version: version(info.firmwareVersion),
            utc_time: InfoText::from_field(&info.utcTime),
        })
    }

    fn mechanism_list(&self, slot: u64) -> ProviderResult<Vec<u64>> {
        let get_mechanism_list = function(self.list().C_GetMechanismList)?;
        let mechanisms = list_call::<CK_MECHANISM_TYPE>(|out, count| unsafe {
            get_mechanism_list(slot as CK_SLOT_ID, out, count)
        })?;
        Ok(mechanisms.into_iter().map(|m| m as u64).collect())
    }

    fn mechanism_info(&self, slot: u64, mechanism: u64) -> ProviderResult<MechanismInfo> {
        let get_mechanism_info = function(self.list().C_GetMechanismInfo)?;
        let mut info: CK_MECHANISM_INFO = unsafe { std::mem::zeroed() };
        check(unsafe {
            get_mechanism_info(
                slot as CK_SLOT_ID,
                mechanism as CK_MECHANISM_TYPE,
                &mut info,
            )
        })?;
        Ok(MechanismInfo {
            min_key_size: info.ulMinKeySize as u64,
            max_key_size: info.ulMaxKeySize as u64,
            flags: info.flags as u64,
        })
    }

    fn open_session(&self, slot: u64, flags: u64) -> ProviderResult<u64> {
        let open_session = function(self.list().C_OpenSession)?;
        let mut handle = 0;
        check(unsafe {
            open_session(
                slot as CK_SLOT_ID,
                flags as CK_FLAGS,
                ptr::null_mut(),
                None,
                &mut handle,
            )
        })?;
        Ok(handle as u64)
    }

    fn close_session(&self, session: u64) -> ProviderResult<()> {
        let close_session = function(self.list().C_CloseSession)?;
        check(unsafe { close_session(session as CK_ULONG) })
    }

    fn session_info(&self, session: u64) -> ProviderResult<SessionInfo> {
        let get_session_info = function(self.list().C_GetSessionInfo)?;
        let mut info: CK_SESSION_INFO = unsafe { std::mem::zeroed() };
        check(unsafe { get_session_info(session as CK_ULONG, &mut info) })?;
        Ok(SessionInfo {
            slot_id: info.slotID as u64,
            state: info.state as u64,
            flags: info.flags as u64,
            device_error: info.ulDeviceError as u64,
        })
    }

    fn login(&self, session: u64, user_type: u64, pin: &[u8]) -> ProviderResult<()> {
        let login = function(self.list().C_Login)?;
        let mut pin = pin.to_vec();
        let rv = unsafe {
            login(
                session as CK_ULONG,
                user_type as CK_USER_TYPE,
                pin.as_mut_ptr(),
                pin.len() as CK_ULONG,
            )
        };
        pin.fill(0);
        check(rv)
    }

    fn logout(&self, session: u64) -> ProviderResult<()> {
        let logout = function(self.list().C_Logout)?;
        check(unsafe { logout(session as CK_ULONG) })
    }

    fn create_object(&self, session: u64, template: &[Attribute]) -> ProviderResult<u64> {
        let create_object = function(self.list().C_CreateObject)?;
        let mut raw = Template::new(template);
        let mut handle: CK_OBJECT_HANDLE = 0;
        check(unsafe { create_object(session as CK_ULONG, raw.ptr(), raw.len(), &mut handle) })?;
        Ok(handle as u64)
    }

    fn destroy_object(&self, session: u64, object: u64) -> ProviderResult<()> {
        let destroy_object = function(self.list().C_DestroyObject)?;
        check(unsafe { destroy_object(session as CK_ULONG, object as CK_OBJECT_HANDLE) })
    }

    fn get_attribute_value(
        &self,
        session: u64,
        object: u64,
        template: &[AttributeRequest],
    ) -> AttributeReport {
        let Ok(get_attribute_value) = function(self.list().C_GetAttributeValue) else {
            return AttributeReport {
                rv: CKR_FUNCTION_NOT_SUPPORTED as u64,
                values: template
                    .iter()
                    .map(|req| AttributeValue::unavailable(req.kind))
                    .collect(),
            };
        };

        let mut buffers: Vec<Option<Vec<u8>>> = template
            .iter()
            .map(|req| {
                req.capacity.map(|cap| {
                    let host_cap = if is_ulong_attribute(req.kind) && cap >= WIRE_ULONG_LEN as u64
                    {
                        std::mem::size_of::<CK_ULONG>() as u64
                    } else {
                        cap.min(MAX_BUFFER)
                    };
                    vec![0u8; host_cap as usize]
                })
            })
            .collect();
        let mut raw: Vec<CK_ATTRIBUTE> = template
            .iter()
            .zip(buffers.iter_mut())
            .map(|(req, buffer)| match buffer {
                Some(buffer) => CK_ATTRIBUTE {
                    type_: req.kind as CK_ATTRIBUTE_TYPE,
                    pValue: buffer.as_mut_ptr() as *mut c_void,
                    ulValueLen: buffer.len() as CK_ULONG,
                },
                None => CK_ATTRIBUTE {
                    type_: req.kind as CK_ATTRIBUTE_TYPE,
                    pValue: ptr::null_mut(),
                    ulValueLen: 0,
                },
            })
            .collect();

        let rv = unsafe {
            get_attribute_value(
                session as CK_ULONG,
                object as CK_OBJECT_HANDLE,
                raw.as_mut_ptr(),
                raw.len() as CK_ULONG,
            )
        };

        let values = template
            .iter()
            .zip(raw.iter())
            .zip(buffers.iter())
            .map(|((req, slot), buffer)| {
                if slot.ulValueLen == CK_UNAVAILABLE_INFORMATION {
                    return AttributeValue::unavailable(req.kind);
                }
                let len = slot.ulValueLen as usize;
                let value = buffer
                    .as_ref()
                    .filter(|buffer| len <= buffer.len())
                    .map(|buffer| wire_value(req.kind, &buffer[..len]));
                AttributeValue {
                    kind: req.kind,
                    len: Some(wire_len(req.kind, len as u64)),
                    value,
                }
            })
            .collect();
        AttributeReport {
            rv: rv as u64,
            values,
        }
    }

    fn find_objects_init(&self, session: u64, template: &[Attribute]) -> ProviderResult<()> {
        let find_objects_init = function(self.list().C_FindObjectsInit)?;
        let mut raw = Template::new(template);
        check(unsafe { find_objects_init(session as CK_ULONG, raw.ptr(), raw.len()) })
    }

    fn find_objects(&self, session: u64, max: u64) -> ProviderResult<Vec<u64>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let find_objects = function(self.list().C_FindObjects)?;
        let mut handles: Vec<CK_OBJECT_HANDLE> = vec![0; max.min(MAX_FIND_BATCH) as usize];
        let mut count: CK_ULONG = 0;
        check(unsafe {
            find_objects(
                session as CK_ULONG,
                handles.as_mut_ptr(),
                handles.len() as CK_ULONG,
                &mut count,
            )
        })?;
        handles.truncate(count as usize);
        Ok(handles.into_iter().map(|h| h as u64).collect())
    }

    fn find_objects_final(&self, session: u64) -> ProviderResult<()> {
        let find_objects_final = function(self.list().C_FindObjectsFinal)?;
        check(unsafe { find_objects_final(session as CK_ULONG) })
    }

    fn encrypt_init(&self, session: u64, mechanism: &Mechanism, key: u64) -> ProviderResult<()> {
        let encrypt_init = function(self.list().C_EncryptInit)?;
        let mut parameter = mechanism.parameter.clone();
        let mut raw = raw_mechanism(mechanism, &mut parameter);
        check(unsafe { encrypt_init(session as CK_ULONG, &mut raw, key as CK_OBJECT_HANDLE) })
    }

    fn encrypt(
        &self,
        session: u64,
        data: &[u8],
        capacity: Option<u64>,
    ) -> ProviderResult<OutputBuffer> {
        let encrypt = function(self.list().C_Encrypt)?;
        let mut data = data.to_vec();
        output_call(capacity, |out, len| unsafe {
            encrypt(
                session as CK_ULONG,
                data.as_mut_ptr(),
                data.len() as CK_ULONG,
                out,
                len,
            )
        })
    }

    fn decrypt_init(&self, session: u64, mechanism: &Mechanism, key: u64) -> ProviderResult<()> {
        let decrypt_init = function(self.list().C_DecryptInit)?;
        let mut parameter = mechanism.parameter.clone();
        let mut raw = raw_mechanism(mechanism, &mut parameter);
        check(unsafe { decrypt_init(session as CK_ULONG, &mut raw, key as CK_OBJECT_HANDLE) })
    }

    fn decrypt(
        &self,
        session: u64,
        data: &[u8],
        capacity: Option<u64>,
    ) -> ProviderResult<OutputBuffer> {
        let decrypt = function(self.list().C_Decrypt)?;
        let mut data = data.to_vec();
        output_call(capacity, |out, len| unsafe {
            decrypt(
                session as CK_ULONG,
                data.as_mut_ptr(),
                data.len() as CK_ULONG,
                out,
                len,
            )
        })
    }

    fn sign_init(&self, session: u64, mechanism: &Mechanism, key: u64) -> ProviderResult<()> {
        let sign_init = function(self.list().C_SignInit)?;
        let mut parameter = mechanism.parameter.clone();
        let mut raw = raw_mechanism(mechanism, &mut parameter);
        check(unsafe { sign_init(session as CK_ULONG, &mut raw, key as CK_OBJECT_HANDLE) })
    }

    fn sign(
        &self,
        session: u64,
        data: &[u8],
        capacity: Option<u64>,
    ) -> ProviderResult<OutputBuffer> {
        let sign = function(self.list().C_Sign)?;
        let mut data = data.to_vec();
        output_call(capacity, |out, len| unsafe {
            sign(
                session as CK_ULONG,
                data.as_mut_ptr(),
                data.len() as CK_ULONG,
                out,
                len,
            )
        })
    }

    fn sign_update(&self, session: u64, data: &[u8]) -> ProviderResult<()> {
        let sign_update = function(self.list().C_SignUpdate)?;
        let mut data = data.to_vec();
        check(unsafe {
            sign_update(
                session as CK_ULONG,
                data.as_mut_ptr(),
                data.len() as CK_ULONG,
            )
        })
    }

    fn sign_final(&self, session: u64, capacity: Option<u64>) -> ProviderResult<OutputBuffer> {
        let sign_final = function(self.list().C_SignFinal)?;
        output_call(capacity, |out, len| unsafe {
            sign_final(session as CK_ULONG, out, len)
        })
    }

    fn verify_init(&self, session: u64, mechanism: &Mechanism, key: u64) -> ProviderResult<()> {
        let verify_init = function(self.list().C_VerifyInit)?;
        let mut parameter = mechanism.parameter.clone();
        let mut raw = raw_mechanism(mechanism, &mut parameter);
        check(unsafe { verify_init(session as CK_ULONG, &mut raw, key as CK_OBJECT_HANDLE) })
    }

    fn verify(&self, session: u64, data: &[u8], signature: &[u8]) -> ProviderResult<()> {
        let verify = function(self.list().C_Verify)?;
        let mut data = data.to_vec();
        let mut signature = signature.to_vec();
        check(unsafe {
            verify(
                session as CK_ULONG,
                data.as_mut_ptr(),
                data.len() as CK_ULONG,
                signature.as_mut_ptr(),
                signature.len() as CK_ULONG,
            )
        })
    }

    fn generate_random(&self, session: u64, len: u64) -> ProviderResult<Vec<u8>> {
        let generate_random = function(self.list().C_GenerateRandom)?;
        let mut out = vec![0u8; len.min(MAX_BUFFER) as usize];
        check(unsafe {
            generate_random(session as CK_ULONG, out.as_mut_ptr(), out.len() as CK_ULONG)
        })?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_is_a_load_error() {
        let err = LibraryProvider::load(Path::new("/nonexistent/libtoken.so"), false)
            .expect_err("missing library");
        assert!(matches!(err, ProviderError::Load { .. }));
    }

    #[test]
    fn output_call_reports_required_length_on_short_buffer() {
        let out = output_call(Some(4), |ptr, len| {
            if ptr.is_null() || *len < 16 {
                *len = 16;
                return if ptr.is_null() { CKR_OK } else { CKR_BUFFER_TOO_SMALL };
            }
            *len = 16;
            CKR_OK
        })
        .expect("call");
        assert_eq!(out, OutputBuffer::length(16));
    }

    #[test]
    fn list_call_retries_when_the_list_grows() {
        let mut calls = 0;
        let slots = list_call::<CK_SLOT_ID>(|out, count| {
            calls += 1;
            if out.is_null() {
                *count = 1;
                return CKR_OK;
            }
            if calls < 4 {
                *count = 2;
                return CKR_BUFFER_TOO_SMALL;
            }
            unsafe { *out = 5 };
            *count = 1;
            CKR_OK
        })
        .expect("slots");
        assert_eq!(slots, vec![5]);
    }
}
