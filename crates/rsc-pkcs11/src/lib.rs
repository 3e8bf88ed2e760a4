//! PKCS#11 module that forwards every call to a remote rsc-server.
//!
//! The exported `C_*` functions validate the caller's pointers, translate
//! local handles and block on the remote link. Token results pass through
//! untouched; link failures surface as `CKR_DEVICE_ERROR` and refused
//! credentials or bad configuration as `CKR_GENERAL_ERROR`.
//!
//! Logging is off unless `REMOTESC_LOG` holds a filter directive such as
//! `debug` or `rsc_core=trace`; output goes to stderr.

#![allow(non_snake_case)]

mod abi;
mod context;
mod handles;

use std::sync::{Arc, Once};

use cryptoki_sys::{
    CK_ATTRIBUTE_PTR, CK_BBOOL, CK_BYTE_PTR, CK_C_INITIALIZE_ARGS, CK_FALSE, CK_FLAGS,
    CK_FUNCTION_LIST, CK_FUNCTION_LIST_PTR_PTR, CK_INFO_PTR, CK_MECHANISM_INFO_PTR,
    CK_MECHANISM_PTR, CK_MECHANISM_TYPE, CK_MECHANISM_TYPE_PTR, CK_NOTIFY, CK_OBJECT_HANDLE,
    CK_OBJECT_HANDLE_PTR, CK_RV, CK_SESSION_HANDLE, CK_SESSION_HANDLE_PTR, CK_SESSION_INFO_PTR,
    CK_SLOT_ID, CK_SLOT_ID_PTR, CK_SLOT_INFO_PTR, CK_TOKEN_INFO_PTR, CK_ULONG, CK_ULONG_PTR,
    CK_USER_TYPE, CK_UTF8CHAR_PTR, CK_VERSION, CK_VOID_PTR, CKF_OS_LOCKING_OK,
    CKR_ARGUMENTS_BAD, CKR_CANT_LOCK, CKR_CRYPTOKI_ALREADY_INITIALIZED,
    CKR_CRYPTOKI_NOT_INITIALIZED, CKR_FUNCTION_NOT_PARALLEL, CKR_FUNCTION_NOT_SUPPORTED,
    CKR_GENERAL_ERROR, CKR_OK,
};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rsc_core::{ClientConfig, OutputBuffer, RscError};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

pub use context::ShimContext;
pub use handles::HandleTable;

pub const ENV_LOG: &str = "REMOTESC_LOG";

#[derive(Default)]
struct GlobalState {
    context: Option<Arc<ShimContext>>,
}

static STATE: Lazy<RwLock<GlobalState>> = Lazy::new(|| RwLock::new(GlobalState::default()));

/// Errors raised by the module prior to translation into `CK_RV` codes.
#[derive(Debug, Error)]
pub enum FrontendError {
    #[error("cryptoki already initialized")]
    AlreadyInitialized,
    #[error("cryptoki not initialized")]
    NotInitialized,
    #[error("token returned {0:#x}")]
    Token(CK_RV),
    #[error(transparent)]
    Remote(#[from] RscError),
    #[error("internal error: {0}")]
    Internal(String),
}

fn translate_error(err: FrontendError) -> CK_RV {
    match err {
        FrontendError::AlreadyInitialized => CKR_CRYPTOKI_ALREADY_INITIALIZED,
        FrontendError::NotInitialized => CKR_CRYPTOKI_NOT_INITIALIZED,
        FrontendError::Token(rv) => rv,
        FrontendError::Remote(err) => err.ckr(),
        FrontendError::Internal(_) => CKR_GENERAL_ERROR,
    }
}

fn fail(call: &'static str, err: FrontendError) -> CK_RV {
    match &err {
        FrontendError::Remote(remote) => warn!(call, error = %remote, "remote call failed"),
        FrontendError::Internal(msg) => error!(call, "internal error: {msg}"),
        _ => {}
    }
    translate_error(err)
}

fn status(call: &'static str, result: Result<(), FrontendError>) -> CK_RV {
    match result {
        Ok(()) => CKR_OK,
        Err(err) => fail(call, err),
    }
}

fn init_logging() {
    static LOGGING: Once = Once::new();
    LOGGING.call_once(|| {
        if let Ok(directives) = std::env::var(ENV_LOG) {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new(directives))
                .with_writer(std::io::stderr)
                .with_target(false)
                .try_init();
        }
    });
}

fn context() -> Result<Arc<ShimContext>, FrontendError> {
    STATE
        .read()
        .context
        .clone()
        .ok_or(FrontendError::NotInitialized)
}

/// Checks `C_Initialize` arguments. Application-supplied mutex callbacks
/// are only acceptable alongside permission to use OS locking, which is
/// all the module does.
unsafe fn check_init_args(args: CK_VOID_PTR) -> CK_RV {
    if args.is_null() {
        return CKR_OK;
    }
    let args = unsafe { &*(args as *const CK_C_INITIALIZE_ARGS) };
    if !args.pReserved.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let callbacks = [
        args.CreateMutex.is_some(),
        args.DestroyMutex.is_some(),
        args.LockMutex.is_some(),
        args.UnlockMutex.is_some(),
    ];
    let supplied = callbacks.iter().filter(|set| **set).count();
    if supplied != 0 && supplied != callbacks.len() {
        return CKR_ARGUMENTS_BAD;
    }
    if supplied != 0 && args.flags & CKF_OS_LOCKING_OK == 0 {
        return CKR_CANT_LOCK;
    }
    CKR_OK
}

/// Loads the client configuration from the environment and connects.
pub fn initialize() -> Result<(), FrontendError> {
    init_logging();
    if STATE.read().context.is_some() {
        return Err(FrontendError::AlreadyInitialized);
    }
    initialize_with(ClientConfig::load()?)
}

/// Connects with an explicit configuration. The global state is only
/// locked to install the connected context, so concurrent callers are not
/// held up by connection retries.
pub fn initialize_with(config: ClientConfig) -> Result<(), FrontendError> {
    if STATE.read().context.is_some() {
        return Err(FrontendError::AlreadyInitialized);
    }
    let context = Arc::new(ShimContext::connect(config)?);
    let lost = {
        let mut guard = STATE.write();
        if guard.context.is_some() {
            Some(context)
        } else {
            guard.context = Some(context);
            None
        }
    };
    if let Some(context) = lost {
        context.close();
        return Err(FrontendError::AlreadyInitialized);
    }
    info!("PKCS#11 module initialized");
    Ok(())
}

/// Closes the link; calls still in flight on other threads fail with
/// `CKR_DEVICE_ERROR`.
pub fn finalize() -> Result<(), FrontendError> {
    let context = STATE
        .write()
        .context
        .take()
        .ok_or(FrontendError::NotInitialized)?;
    context.close();
    info!("PKCS#11 module finalized");
    Ok(())
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Initialize(pInitArgs: CK_VOID_PTR) -> CK_RV {
    let rv = unsafe { check_init_args(pInitArgs) };
    if rv != CKR_OK {
        return rv;
    }
    status("C_Initialize", initialize())
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Finalize(pReserved: CK_VOID_PTR) -> CK_RV {
    if !pReserved.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    status("C_Finalize", finalize())
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetInfo(pInfo: CK_INFO_PTR) -> CK_RV {
    if pInfo.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match context().and_then(|ctx| ctx.info()) {
        Ok(info) => unsafe { abi::write(pInfo, abi::library_info(&info)) },
        Err(err) => fail("C_GetInfo", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetFunctionList(ppFunctionList: CK_FUNCTION_LIST_PTR_PTR) -> CK_RV {
    unsafe {
        abi::write(
            ppFunctionList,
            &FUNCTION_LIST as *const CK_FUNCTION_LIST as *mut CK_FUNCTION_LIST,
        )
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetSlotList(
    tokenPresent: CK_BBOOL,
    pSlotList: CK_SLOT_ID_PTR,
    pulCount: CK_ULONG_PTR,
) -> CK_RV {
    if pulCount.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match context().and_then(|ctx| ctx.slot_list(tokenPresent != CK_FALSE)) {
        Ok(slots) => unsafe { abi::write_list(&slots, pSlotList, pulCount) },
        Err(err) => fail("C_GetSlotList", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetSlotInfo(slotID: CK_SLOT_ID, pInfo: CK_SLOT_INFO_PTR) -> CK_RV {
    if pInfo.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match context().and_then(|ctx| ctx.slot_info(slotID)) {
        Ok(info) => unsafe { abi::write(pInfo, abi::slot_info(&info)) },
        Err(err) => fail("C_GetSlotInfo", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetTokenInfo(slotID: CK_SLOT_ID, pInfo: CK_TOKEN_INFO_PTR) -> CK_RV {
    if pInfo.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match context().and_then(|ctx| ctx.token_info(slotID)) {
        Ok(info) => unsafe { abi::write(pInfo, abi::token_info(&info)) },
        Err(err) => fail("C_GetTokenInfo", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetMechanismList(
    slotID: CK_SLOT_ID,
    pMechanismList: CK_MECHANISM_TYPE_PTR,
    pulCount: CK_ULONG_PTR,
) -> CK_RV {
    if pulCount.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match context().and_then(|ctx| ctx.mechanism_list(slotID)) {
        Ok(mechanisms) => unsafe { abi::write_list(&mechanisms, pMechanismList, pulCount) },
        Err(err) => fail("C_GetMechanismList", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetMechanismInfo(
    slotID: CK_SLOT_ID,
    type_: CK_MECHANISM_TYPE,
    pInfo: CK_MECHANISM_INFO_PTR,
) -> CK_RV {
    if pInfo.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match context().and_then(|ctx| ctx.mechanism_info(slotID, type_)) {
        Ok(info) => unsafe { abi::write(pInfo, abi::mechanism_info(&info)) },
        Err(err) => fail("C_GetMechanismInfo", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_InitToken(
    _slotID: CK_SLOT_ID,
    _pPin: CK_UTF8CHAR_PTR,
    _ulPinLen: CK_ULONG,
    _pLabel: CK_UTF8CHAR_PTR,
) -> CK_RV {
    CKR_FUNCTION_NOT_SUPPORTED
}

#[unsafe(no_mangle)]
pub extern "C" fn C_InitPIN(
    _hSession: CK_SESSION_HANDLE,
    _pPin: CK_UTF8CHAR_PTR,
    _ulPinLen: CK_ULONG,
) -> CK_RV {
    CKR_FUNCTION_NOT_SUPPORTED
}

#[unsafe(no_mangle)]
pub extern "C" fn C_SetPIN(
    _hSession: CK_SESSION_HANDLE,
    _pOldPin: CK_UTF8CHAR_PTR,
    _ulOldLen: CK_ULONG,
    _pNewPin: CK_UTF8CHAR_PTR,
    _ulNewLen: CK_ULONG,
) -> CK_RV {
    CKR_FUNCTION_NOT_SUPPORTED
}

#[unsafe(no_mangle)]
pub extern "C" fn C_OpenSession(
    slotID: CK_SLOT_ID,
    flags: CK_FLAGS,
    _pApplication: CK_VOID_PTR,
    _Notify: CK_NOTIFY,
    phSession: CK_SESSION_HANDLE_PTR,
) -> CK_RV {
    if phSession.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match context().and_then(|ctx| ctx.open_session(slotID, flags)) {
        Ok(session) => unsafe { abi::write(phSession, session) },
        Err(err) => fail("C_OpenSession", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_CloseSession(hSession: CK_SESSION_HANDLE) -> CK_RV {
    status(
        "C_CloseSession",
        context().and_then(|ctx| ctx.close_session(hSession)),
    )
}

#[unsafe(no_mangle)]
pub extern "C" fn C_CloseAllSessions(slotID: CK_SLOT_ID) -> CK_RV {
    status(
        "C_CloseAllSessions",
        context().and_then(|ctx| ctx.close_all_sessions(slotID)),
    )
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetSessionInfo(hSession: CK_SESSION_HANDLE, pInfo: CK_SESSION_INFO_PTR) -> CK_RV {
    if pInfo.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match context().and_then(|ctx| ctx.session_info(hSession)) {
        Ok(info) => unsafe { abi::write(pInfo, abi::session_info(&info)) },
        Err(err) => fail("C_GetSessionInfo", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Login(
    hSession: CK_SESSION_HANDLE,
    userType: CK_USER_TYPE,
    pPin: CK_UTF8CHAR_PTR,
    ulPinLen: CK_ULONG,
) -> CK_RV {
    let pin = match unsafe { abi::bytes(pPin, ulPinLen) } {
        Ok(pin) => pin,
        Err(rv) => return rv,
    };
    status(
        "C_Login",
        context().and_then(|ctx| ctx.login(hSession, userType, pin)),
    )
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Logout(hSession: CK_SESSION_HANDLE) -> CK_RV {
    status("C_Logout", context().and_then(|ctx| ctx.logout(hSession)))
}

#[unsafe(no_mangle)]
pub extern "C" fn C_CreateObject(
    hSession: CK_SESSION_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
    phObject: CK_OBJECT_HANDLE_PTR,
) -> CK_RV {
    if phObject.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let template = match unsafe { abi::template(pTemplate, ulCount) } {
        Ok(template) => template,
        Err(rv) => return rv,
    };
    match context().and_then(|ctx| ctx.create_object(hSession, template)) {
        Ok(object) => unsafe { abi::write(phObject, object) },
        Err(err) => fail("C_CreateObject", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_DestroyObject(hSession: CK_SESSION_HANDLE, hObject: CK_OBJECT_HANDLE) -> CK_RV {
    status(
        "C_DestroyObject",
        context().and_then(|ctx| ctx.destroy_object(hSession, hObject)),
    )
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetAttributeValue(
    hSession: CK_SESSION_HANDLE,
    hObject: CK_OBJECT_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
) -> CK_RV {
    let requests = match unsafe { abi::attribute_requests(pTemplate, ulCount) } {
        Ok(requests) => requests,
        Err(rv) => return rv,
    };
    match context().and_then(|ctx| ctx.attribute_values(hSession, hObject, requests)) {
        Ok((rv, values)) => match unsafe { abi::fill_attributes(pTemplate, ulCount, &values) } {
            Ok(()) => rv,
            Err(bad) => bad,
        },
        Err(err) => fail("C_GetAttributeValue", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_FindObjectsInit(
    hSession: CK_SESSION_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
) -> CK_RV {
    let template = match unsafe { abi::template(pTemplate, ulCount) } {
        Ok(template) => template,
        Err(rv) => return rv,
    };
    status(
        "C_FindObjectsInit",
        context().and_then(|ctx| ctx.find_objects_init(hSession, template)),
    )
}

#[unsafe(no_mangle)]
pub extern "C" fn C_FindObjects(
    hSession: CK_SESSION_HANDLE,
    phObject: CK_OBJECT_HANDLE_PTR,
    ulMaxObjectCount: CK_ULONG,
    pulObjectCount: CK_ULONG_PTR,
) -> CK_RV {
    if pulObjectCount.is_null() || (phObject.is_null() && ulMaxObjectCount != 0) {
        return CKR_ARGUMENTS_BAD;
    }
    match context().and_then(|ctx| ctx.find_objects(hSession, ulMaxObjectCount as usize)) {
        Ok(objects) => {
            unsafe {
                if !objects.is_empty() {
                    std::ptr::copy_nonoverlapping(objects.as_ptr(), phObject, objects.len());
                }
                *pulObjectCount = objects.len() as CK_ULONG;
            }
            CKR_OK
        }
        Err(err) => fail("C_FindObjects", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_FindObjectsFinal(hSession: CK_SESSION_HANDLE) -> CK_RV {
    status(
        "C_FindObjectsFinal",
        context().and_then(|ctx| ctx.find_objects_final(hSession)),
    )
}

/// Runs a single-part operation that follows the two-call output
/// convention.
unsafe fn output_call(
    call: &'static str,
    input: CK_BYTE_PTR,
    input_len: CK_ULONG,
    out: CK_BYTE_PTR,
    out_len: CK_ULONG_PTR,
    run: impl FnOnce(&ShimContext, &[u8], Option<u64>) -> Result<OutputBuffer, FrontendError>,
) -> CK_RV {
    let input = match unsafe { abi::bytes(input, input_len) } {
        Ok(input) => input,
        Err(rv) => return rv,
    };
    let capacity = match unsafe { abi::capacity(out, out_len) } {
        Ok(capacity) => capacity,
        Err(rv) => return rv,
    };
    match context().and_then(|ctx| run(ctx.as_ref(), input, capacity)) {
        Ok(output) => unsafe { abi::write_output(&output, out, out_len) },
        Err(err) => fail(call, err),
    }
}

unsafe fn init_call(
    call: &'static str,
    mechanism: CK_MECHANISM_PTR,
    run: impl FnOnce(&ShimContext, rsc_core::Mechanism) -> Result<(), FrontendError>,
) -> CK_RV {
    let mechanism = match unsafe { abi::mechanism(mechanism) } {
        Ok(mechanism) => mechanism,
        Err(rv) => return rv,
    };
    status(call, context().and_then(|ctx| run(ctx.as_ref(), mechanism)))
}

#[unsafe(no_mangle)]
pub extern "C" fn C_EncryptInit(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    unsafe {
        init_call("C_EncryptInit", pMechanism, |ctx, mechanism| {
            ctx.encrypt_init(hSession, mechanism, hKey)
        })
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Encrypt(
    hSession: CK_SESSION_HANDLE,
    pData: CK_BYTE_PTR,
    ulDataLen: CK_ULONG,
    pEncryptedData: CK_BYTE_PTR,
    pulEncryptedDataLen: CK_ULONG_PTR,
) -> CK_RV {
    unsafe {
        output_call(
            "C_Encrypt",
            pData,
            ulDataLen,
            pEncryptedData,
            pulEncryptedDataLen,
            |ctx, data, capacity| ctx.encrypt(hSession, data, capacity),
        )
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_DecryptInit(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    unsafe {
        init_call("C_DecryptInit", pMechanism, |ctx, mechanism| {
            ctx.decrypt_init(hSession, mechanism, hKey)
        })
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Decrypt(
    hSession: CK_SESSION_HANDLE,
    pEncryptedData: CK_BYTE_PTR,
    ulEncryptedDataLen: CK_ULONG,
    pData: CK_BYTE_PTR,
    pulDataLen: CK_ULONG_PTR,
) -> CK_RV {
    unsafe {
        output_call(
            "C_Decrypt",
            pEncryptedData,
            ulEncryptedDataLen,
            pData,
            pulDataLen,
            |ctx, data, capacity| ctx.decrypt(hSession, data, capacity),
        )
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_SignInit(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    unsafe {
        init_call("C_SignInit", pMechanism, |ctx, mechanism| {
            ctx.sign_init(hSession, mechanism, hKey)
        })
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Sign(
    hSession: CK_SESSION_HANDLE,
    pData: CK_BYTE_PTR,
    ulDataLen: CK_ULONG,
    pSignature: CK_BYTE_PTR,
    pulSignatureLen: CK_ULONG_PTR,
) -> CK_RV {
    unsafe {
        output_call(
            "C_Sign",
            pData,
            ulDataLen,
            pSignature,
            pulSignatureLen,
            |ctx, data, capacity| ctx.sign(hSession, data, capacity),
        )
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_SignUpdate(
    hSession: CK_SESSION_HANDLE,
    pPart: CK_BYTE_PTR,
    ulPartLen: CK_ULONG,
) -> CK_RV {
    let part = match unsafe { abi::bytes(pPart, ulPartLen) } {
        Ok(part) => part,
        Err(rv) => return rv,
    };
    status(
        "C_SignUpdate",
        context().and_then(|ctx| ctx.sign_update(hSession, part)),
    )
}

#[unsafe(no_mangle)]
pub extern "C" fn C_SignFinal(
    hSession: CK_SESSION_HANDLE,
    pSignature: CK_BYTE_PTR,
    pulSignatureLen: CK_ULONG_PTR,
) -> CK_RV {
    unsafe {
        output_call(
            "C_SignFinal",
            std::ptr::null_mut(),
            0,
            pSignature,
            pulSignatureLen,
            |ctx, _, capacity| ctx.sign_final(hSession, capacity),
        )
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_VerifyInit(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    unsafe {
        init_call("C_VerifyInit", pMechanism, |ctx, mechanism| {
            ctx.verify_init(hSession, mechanism, hKey)
        })
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Verify(
    hSession: CK_SESSION_HANDLE,
    pData: CK_BYTE_PTR,
    ulDataLen: CK_ULONG,
    pSignature: CK_BYTE_PTR,
    ulSignatureLen: CK_ULONG,
) -> CK_RV {
    let data = match unsafe { abi::bytes(pData, ulDataLen) } {
        Ok(data) => data,
        Err(rv) => return rv,
    };
    let signature = match unsafe { abi::bytes(pSignature, ulSignatureLen) } {
        Ok(signature) => signature,
        Err(rv) => return rv,
    };
    status(
        "C_Verify",
        context().and_then(|ctx| ctx.verify(hSession, data, signature)),
    )
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GenerateRandom(
    hSession: CK_SESSION_HANDLE,
    RandomData: CK_BYTE_PTR,
    ulRandomLen: CK_ULONG,
) -> CK_RV {
    if RandomData.is_null() && ulRandomLen != 0 {
        return CKR_ARGUMENTS_BAD;
    }
    if ulRandomLen == 0 {
        return status(
            "C_GenerateRandom",
            context().and_then(|ctx| ctx.check_session(hSession)),
        );
    }
    match context().and_then(|ctx| ctx.generate_random(hSession, ulRandomLen as usize)) {
        Ok(data) => {
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), RandomData, data.len()) };
            CKR_OK
        }
        Err(err) => fail("C_GenerateRandom", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetFunctionStatus(_hSession: CK_SESSION_HANDLE) -> CK_RV {
    CKR_FUNCTION_NOT_PARALLEL
}

#[unsafe(no_mangle)]
pub extern "C" fn C_CancelFunction(_hSession: CK_SESSION_HANDLE) -> CK_RV {
    CKR_FUNCTION_NOT_PARALLEL
}

#[unsafe(no_mangle)]
pub extern "C" fn C_WaitForSlotEvent(
    _flags: CK_FLAGS,
    _pSlot: CK_SLOT_ID_PTR,
    _pReserved: CK_VOID_PTR,
) -> CK_RV {
    CKR_FUNCTION_NOT_SUPPORTED
}

/// Entries left `None` are functions the module does not offer.
static FUNCTION_LIST: CK_FUNCTION_LIST = CK_FUNCTION_LIST {
    version: CK_VERSION {
        major: 2,
        minor: 40,
    },
    C_Initialize: Some(C_Initialize),
    C_Finalize: Some(C_Finalize),
    C_GetInfo: Some(C_GetInfo),
    C_GetFunctionList: Some(C_GetFunctionList),
    C_GetSlotList: Some(C_GetSlotList),
    C_GetSlotInfo: Some(C_GetSlotInfo),
    C_GetTokenInfo: Some(C_GetTokenInfo),
    C_GetMechanismList: Some(C_GetMechanismList),
    C_GetMechanismInfo: Some(C_GetMechanismInfo),
    C_InitToken: Some(C_InitToken),
    C_InitPIN: Some(C_InitPIN),
    C_SetPIN: Some(C_SetPIN),
    C_OpenSession: Some(C_OpenSession),
    C_CloseSession: Some(C_CloseSession),
    C_CloseAllSessions: Some(C_CloseAllSessions),
    C_GetSessionInfo: Some(C_GetSessionInfo),
    C_Login: Some(C_Login),
    C_Logout: Some(C_Logout),
    C_CreateObject: Some(C_CreateObject),
    C_DestroyObject: Some(C_DestroyObject),
    C_GetAttributeValue: Some(C_GetAttributeValue),
    C_FindObjectsInit: Some(C_FindObjectsInit),
    C_FindObjects: Some(C_FindObjects),
    C_FindObjectsFinal: Some(C_FindObjectsFinal),
    C_EncryptInit: Some(C_EncryptInit),
    C_Encrypt: Some(C_Encrypt),
    C_DecryptInit: Some(C_DecryptInit),
    C_Decrypt: Some(C_Decrypt),
    C_SignInit: Some(C_SignInit),
    C_Sign: Some(C_Sign),
    C_SignUpdate: Some(C_SignUpdate),
    C_SignFinal: Some(C_SignFinal),
    C_VerifyInit: Some(C_VerifyInit),
    C_Verify: Some(C_Verify),
    C_GenerateRandom: Some(C_GenerateRandom),
    C_GetFunctionStatus: Some(C_GetFunctionStatus),
    C_CancelFunction: Some(C_CancelFunction),
    C_WaitForSlotEvent: Some(C_WaitForSlotEvent),
    ..unsafe { std::mem::zeroed() }
};

#[cfg(test)]
mod tests {
    use super::*;
    use cryptoki_sys::CK_INFO;

    #[test]
    fn finalize_without_initialize_is_rejected() {
        assert_eq!(C_Finalize(std::ptr::null_mut()), CKR_CRYPTOKI_NOT_INITIALIZED);
        let mut info: CK_INFO = unsafe { std::mem::zeroed() };
        assert_eq!(C_GetInfo(&mut info), CKR_CRYPTOKI_NOT_INITIALIZED);
        assert_eq!(C_CloseSession(1), CKR_CRYPTOKI_NOT_INITIALIZED);
    }

    #[test]
    fn reserved_initialize_pointer_is_rejected() {
        let mut args: CK_C_INITIALIZE_ARGS = unsafe { std::mem::zeroed() };
        let mut reserved = 0u8;
        args.pReserved = (&mut reserved as *mut u8).cast();
        assert_eq!(
            C_Initialize((&mut args as *mut CK_C_INITIALIZE_ARGS).cast()),
            CKR_ARGUMENTS_BAD
        );
    }

    extern "C" fn create_mutex(_mutex: *mut CK_VOID_PTR) -> CK_RV {
        CKR_OK
    }

    extern "C" fn mutex_op(_mutex: CK_VOID_PTR) -> CK_RV {
        CKR_OK
    }

    #[test]
    fn application_locking_without_os_locking_is_refused() {
        let mut args: CK_C_INITIALIZE_ARGS = unsafe { std::mem::zeroed() };
        args.CreateMutex = Some(create_mutex);
        args.DestroyMutex = Some(mutex_op);
        args.LockMutex = Some(mutex_op);
        args.UnlockMutex = Some(mutex_op);
        let ptr = (&mut args as *mut CK_C_INITIALIZE_ARGS).cast();
        assert_eq!(unsafe { check_init_args(ptr) }, CKR_CANT_LOCK);

        args.flags = CKF_OS_LOCKING_OK;
        let ptr = (&mut args as *mut CK_C_INITIALIZE_ARGS).cast();
        assert_eq!(unsafe { check_init_args(ptr) }, CKR_OK);

        args.LockMutex = None;
        let ptr = (&mut args as *mut CK_C_INITIALIZE_ARGS).cast();
        assert_eq!(unsafe { check_init_args(ptr) }, CKR_ARGUMENTS_BAD);
    }

    #[test]
    fn function_list_exposes_the_forwarded_calls() {
        let mut list: *mut CK_FUNCTION_LIST = std::ptr::null_mut();
        assert_eq!(C_GetFunctionList(&mut list), CKR_OK);
        let list = unsafe { &*list };
        assert_eq!(list.version.major, 2);
        assert!(list.C_Sign.is_some());
        assert!(list.C_GenerateRandom.is_some());
        assert!(list.C_DigestInit.is_none());
        assert_eq!(C_GetFunctionList(std::ptr::null_mut()), CKR_ARGUMENTS_BAD);
    }

    #[test]
    fn unsupported_calls_report_their_status() {
        assert_eq!(C_GetFunctionStatus(1), CKR_FUNCTION_NOT_PARALLEL);
        assert_eq!(C_CancelFunction(1), CKR_FUNCTION_NOT_PARALLEL);
        assert_eq!(
            C_InitToken(0, std::ptr::null_mut(), 0, std::ptr::null_mut()),
            CKR_FUNCTION_NOT_SUPPORTED
        );
        assert_eq!(
            C_WaitForSlotEvent(0, std::ptr::null_mut(), std::ptr::null_mut()),
            CKR_FUNCTION_NOT_SUPPORTED
        );
    }

    #[test]
    fn token_codes_pass_through_and_link_failures_become_device_errors() {
        use cryptoki_sys::{CKR_DEVICE_ERROR, CKR_PIN_INCORRECT};
        assert_eq!(
            translate_error(FrontendError::Token(CKR_PIN_INCORRECT)),
            CKR_PIN_INCORRECT
        );
        assert_eq!(
            translate_error(FrontendError::Remote(RscError::ConnectionLost)),
            CKR_DEVICE_ERROR
        );
        assert_eq!(
            translate_error(FrontendError::Remote(RscError::auth("rejected"))),
            CKR_GENERAL_ERROR
        );
    }
}
