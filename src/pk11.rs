//! The PKCS#11 entry points and the module instance behind them.
//!
//! Every exported function polices its raw pointers, funnels the real work
//! through a safe inner function, then translates the outcome with
//! [`TokenError::rv`]. Failures are logged here, before detail is collapsed
//! into a return code.

#![allow(non_snake_case)]

use std::sync::{Arc, PoisonError, RwLock};

use cryptoki_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_PTR, CK_BBOOL, CK_BYTE_PTR, CK_FLAGS, CK_FUNCTION_LIST,
    CK_FUNCTION_LIST_PTR_PTR, CK_INFO_PTR, CK_MECHANISM_PTR, CK_NOTIFY, CK_OBJECT_HANDLE,
    CK_OBJECT_HANDLE_PTR, CK_RV, CK_SESSION_HANDLE, CK_SESSION_HANDLE_PTR, CK_SESSION_INFO_PTR,
    CK_SLOT_ID, CK_SLOT_ID_PTR, CK_SLOT_INFO_PTR, CK_TOKEN_INFO_PTR, CK_ULONG, CK_ULONG_PTR,
    CK_UNAVAILABLE_INFORMATION, CK_VOID_PTR, CKR_ARGUMENTS_BAD, CKR_OK,
};
use tracing::{error, info};
use zeroize::Zeroizing;

use crate::config::{Config, KeySource};
use crate::error::TokenError;
use crate::object;
use crate::pubkey::RsaPublicKey;
use crate::session::SessionRegistry;
use crate::token;
use crate::tpm::TpmKey;

/// Everything owned by an initialized module.
#[derive(Debug)]
struct Module {
    config: Arc<Config>,
    sessions: SessionRegistry,
}

static MODULE: RwLock<Option<Module>> = RwLock::new(None);

/// Run `f` against the installed module instance.
fn with_module<T>(f: impl FnOnce(&Module) -> Result<T, TokenError>) -> Result<T, TokenError> {
    let guard = MODULE.read().unwrap_or_else(PoisonError::into_inner);
    match guard.as_ref() {
        Some(module) => f(module),
        None => Err(TokenError::NotInitialized),
    }
}

/// Log the failure and translate it for the C boundary.
fn fail(operation: &str, err: TokenError) -> CK_RV {
    error!(operation, error = %err, "entry point failed");
    err.rv()
}

fn initialize() -> Result<(), TokenError> {
    let mut guard = MODULE.write().unwrap_or_else(PoisonError::into_inner);
    if guard.is_some() {
        return Err(TokenError::AlreadyInitialized);
    }
    let config = Config::load_default()?;
    info!(?config, "token module initialized");
    *guard = Some(Module {
        config: Arc::new(config),
        sessions: SessionRegistry::new(),
    });
    Ok(())
}

fn finalize() -> Result<(), TokenError> {
    let mut guard = MODULE.write().unwrap_or_else(PoisonError::into_inner);
    match guard.take() {
        Some(_) => {
            info!("token module finalized");
            Ok(())
        }
        None => Err(TokenError::NotInitialized),
    }
}

fn valid_slot(slot: CK_SLOT_ID) -> Result<(), TokenError> {
    if slot == token::SLOT_ID {
        Ok(())
    } else {
        Err(TokenError::SlotInvalid(slot))
    }
}

/// The session's configuration snapshot, with the record lock released
/// before any device traffic happens.
fn session_config(module: &Module, session: CK_SESSION_HANDLE) -> Result<Arc<Config>, TokenError> {
    let record = module.sessions.get(session)?;
    let config = record
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .config
        .clone();
    Ok(config)
}

fn find_objects_init(module: &Module, session: CK_SESSION_HANDLE) -> Result<(), TokenError> {
    let record = module.sessions.get(session)?;
    record
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .cursor = Some(0);
    Ok(())
}

/// Yield the single key object exactly once per enumeration.
fn find_objects(
    module: &Module,
    session: CK_SESSION_HANDLE,
    max: CK_ULONG,
) -> Result<Option<CK_OBJECT_HANDLE>, TokenError> {
    let record = module.sessions.get(session)?;
    let mut record = record.lock().unwrap_or_else(PoisonError::into_inner);
    match record.cursor {
        Some(0) if max > 0 => {
            record.cursor = Some(1);
            Ok(Some(token::KEY_OBJECT))
        }
        _ => Ok(None),
    }
}

fn find_objects_final(module: &Module, session: CK_SESSION_HANDLE) -> Result<(), TokenError> {
    let record = module.sessions.get(session)?;
    record
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .cursor = None;
    Ok(())
}

/// Answer a whole attribute template; any failed slot decides the status.
fn get_attributes(
    module: &Module,
    session: CK_SESSION_HANDLE,
    template: &mut [CK_ATTRIBUTE],
) -> Result<CK_RV, TokenError> {
    let config = session_config(module, session)?;
    let key = RsaPublicKey::read(&config)?;
    let decrypt_capable = matches!(config.key_source(), KeySource::Device(_));
    let mut rv = CKR_OK;
    for attr in template.iter_mut() {
        if let Err(err) = unsafe { object::resolve_attribute(attr, &key, decrypt_capable) } {
            rv = err.rv();
        }
    }
    Ok(rv)
}

fn sign(module: &Module, session: CK_SESSION_HANDLE, data: &[u8]) -> Result<Vec<u8>, TokenError> {
    let config = session_config(module, session)?;
    TpmKey::connect(&config)?.sign(data)
}

fn decrypt(
    module: &Module,
    session: CK_SESSION_HANDLE,
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, TokenError> {
    let config = session_config(module, session)?;
    TpmKey::connect(&config)?.decrypt(ciphertext)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Initialize(_pInitArgs: CK_VOID_PTR) -> CK_RV {
    match initialize() {
        Ok(()) => CKR_OK,
        Err(err) => fail("C_Initialize", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Finalize(_pReserved: CK_VOID_PTR) -> CK_RV {
    match finalize() {
        Ok(()) => CKR_OK,
        Err(err) => fail("C_Finalize", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetInfo(pInfo: CK_INFO_PTR) -> CK_RV {
    if pInfo.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match with_module(|_| Ok(token::library_info())) {
        Ok(info) => {
            unsafe { *pInfo = info };
            CKR_OK
        }
        Err(err) => fail("C_GetInfo", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetFunctionList(ppFunctionList: CK_FUNCTION_LIST_PTR_PTR) -> CK_RV {
    if ppFunctionList.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    // The table is never written through; the pointer type is the ABI's.
    unsafe { *ppFunctionList = (&raw const FUNCTION_LIST).cast_mut() };
    CKR_OK
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetSlotList(
    _tokenPresent: CK_BBOOL,
    pSlotList: CK_SLOT_ID_PTR,
    pulCount: CK_ULONG_PTR,
) -> CK_RV {
    if pulCount.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let result = with_module(|_| {
        let count = unsafe { &mut *pulCount };
        if pSlotList.is_null() {
            *count = 1;
            return Ok(());
        }
        if *count < 1 {
            *count = 1;
            return Err(TokenError::BufferTooSmall);
        }
        unsafe { *pSlotList = token::SLOT_ID };
        *count = 1;
        Ok(())
    });
    match result {
        Ok(()) => CKR_OK,
        Err(err) => fail("C_GetSlotList", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetSlotInfo(slotID: CK_SLOT_ID, pInfo: CK_SLOT_INFO_PTR) -> CK_RV {
    if pInfo.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match with_module(|_| valid_slot(slotID).map(|()| token::slot_info())) {
        Ok(info) => {
            unsafe { *pInfo = info };
            CKR_OK
        }
        Err(err) => fail("C_GetSlotInfo", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetTokenInfo(slotID: CK_SLOT_ID, pInfo: CK_TOKEN_INFO_PTR) -> CK_RV {
    if pInfo.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match with_module(|_| valid_slot(slotID).map(|()| token::token_info())) {
        Ok(info) => {
            unsafe { *pInfo = info };
            CKR_OK
        }
        Err(err) => fail("C_GetTokenInfo", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_OpenSession(
    slotID: CK_SLOT_ID,
    _flags: CK_FLAGS,
    _pApplication: CK_VOID_PTR,
    _Notify: CK_NOTIFY,
    phSession: CK_SESSION_HANDLE_PTR,
) -> CK_RV {
    if phSession.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let result = with_module(|module| {
        valid_slot(slotID)?;
        Ok(module.sessions.open(module.config.clone()))
    });
    match result {
        Ok(handle) => {
            unsafe { *phSession = handle };
            CKR_OK
        }
        Err(err) => fail("C_OpenSession", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_CloseSession(hSession: CK_SESSION_HANDLE) -> CK_RV {
    match with_module(|module| {
        module.sessions.close(hSession);
        Ok(())
    }) {
        Ok(()) => CKR_OK,
        Err(err) => fail("C_CloseSession", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetSessionInfo(hSession: CK_SESSION_HANDLE, pInfo: CK_SESSION_INFO_PTR) -> CK_RV {
    if pInfo.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match with_module(|module| module.sessions.get(hSession).map(|_| token::session_info())) {
        Ok(info) => {
            unsafe { *pInfo = info };
            CKR_OK
        }
        Err(err) => fail("C_GetSessionInfo", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetObjectSize(
    hSession: CK_SESSION_HANDLE,
    _hObject: CK_OBJECT_HANDLE,
    pulSize: CK_ULONG_PTR,
) -> CK_RV {
    if pulSize.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match with_module(|module| module.sessions.get(hSession).map(|_| ())) {
        Ok(()) => {
            // Size means nothing for a key that never leaves the device.
            unsafe { *pulSize = CK_UNAVAILABLE_INFORMATION };
            CKR_OK
        }
        Err(err) => fail("C_GetObjectSize", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_FindObjectsInit(
    hSession: CK_SESSION_HANDLE,
    _pTemplate: CK_ATTRIBUTE_PTR,
    _ulCount: CK_ULONG,
) -> CK_RV {
    match with_module(|module| find_objects_init(module, hSession)) {
        Ok(()) => CKR_OK,
        Err(err) => fail("C_FindObjectsInit", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_FindObjects(
    hSession: CK_SESSION_HANDLE,
    phObject: CK_OBJECT_HANDLE_PTR,
    ulMaxObjectCount: CK_ULONG,
    pulObjectCount: CK_ULONG_PTR,
) -> CK_RV {
    if phObject.is_null() || pulObjectCount.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match with_module(|module| find_objects(module, hSession, ulMaxObjectCount)) {
        Ok(Some(handle)) => {
            unsafe {
                *phObject = handle;
                *pulObjectCount = 1;
            }
            CKR_OK
        }
        Ok(None) => {
            unsafe { *pulObjectCount = 0 };
            CKR_OK
        }
        Err(err) => fail("C_FindObjects", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_FindObjectsFinal(hSession: CK_SESSION_HANDLE) -> CK_RV {
    match with_module(|module| find_objects_final(module, hSession)) {
        Ok(()) => CKR_OK,
        Err(err) => fail("C_FindObjectsFinal", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetAttributeValue(
    hSession: CK_SESSION_HANDLE,
    _hObject: CK_OBJECT_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
) -> CK_RV {
    if pTemplate.is_null() && ulCount > 0 {
        return CKR_ARGUMENTS_BAD;
    }
    let template: &mut [CK_ATTRIBUTE] = if ulCount == 0 {
        &mut []
    } else {
        unsafe { std::slice::from_raw_parts_mut(pTemplate, ulCount as usize) }
    };
    match with_module(|module| get_attributes(module, hSession, template)) {
        Ok(rv) => rv,
        Err(err) => fail("C_GetAttributeValue", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_SignInit(
    hSession: CK_SESSION_HANDLE,
    _pMechanism: CK_MECHANISM_PTR,
    _hKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    match with_module(|module| module.sessions.get(hSession).map(|_| ())) {
        Ok(()) => CKR_OK,
        Err(err) => fail("C_SignInit", err),
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
    if pData.is_null() || pulSignatureLen.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let data = unsafe { std::slice::from_raw_parts(pData, ulDataLen as usize) };
    let result = with_module(|module| {
        let signature = sign(module, hSession, data)?;
        unsafe { object::write_back(pSignature, &mut *pulSignatureLen, &signature) }
    });
    match result {
        Ok(()) => CKR_OK,
        Err(err) => fail("C_Sign", err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_DecryptInit(
    hSession: CK_SESSION_HANDLE,
    _pMechanism: CK_MECHANISM_PTR,
    _hKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    match with_module(|module| module.sessions.get(hSession).map(|_| ())) {
        Ok(()) => CKR_OK,
        Err(err) => fail("C_DecryptInit", err),
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
    if pEncryptedData.is_null() || pulDataLen.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let ciphertext =
        unsafe { std::slice::from_raw_parts(pEncryptedData, ulEncryptedDataLen as usize) };
    let result = with_module(|module| {
        let plaintext = decrypt(module, hSession, ciphertext)?;
        unsafe { object::write_back(pData, &mut *pulDataLen, &plaintext) }
    });
    match result {
        Ok(()) => CKR_OK,
        Err(err) => fail("C_Decrypt", err),
    }
}

/// The static Cryptoki 2.40 dispatch table. Unimplemented entries stay
/// `None` so callers can feature-probe; the list itself is reached through
/// [`C_GetFunctionList`], which is exported but deliberately not listed.
static FUNCTION_LIST: CK_FUNCTION_LIST = CK_FUNCTION_LIST {
    version: token::CRYPTOKI_VERSION,
    C_Initialize: Some(C_Initialize),
    C_Finalize: Some(C_Finalize),
    C_GetInfo: Some(C_GetInfo),
    C_GetFunctionList: None,
    C_GetSlotList: Some(C_GetSlotList),
    C_GetSlotInfo: Some(C_GetSlotInfo),
    C_GetTokenInfo: Some(C_GetTokenInfo),
    C_GetMechanismList: None,
    C_GetMechanismInfo: None,
    C_InitToken: None,
    C_InitPIN: None,
    C_SetPIN: None,
    C_OpenSession: Some(C_OpenSession),
    C_CloseSession: Some(C_CloseSession),
    C_CloseAllSessions: None,
    C_GetSessionInfo: Some(C_GetSessionInfo),
    C_GetOperationState: None,
    C_SetOperationState: None,
    C_Login: None,
    C_Logout: None,
    C_CreateObject: None,
    C_CopyObject: None,
    C_DestroyObject: None,
    C_GetObjectSize: Some(C_GetObjectSize),
    C_GetAttributeValue: Some(C_GetAttributeValue),
    C_SetAttributeValue: None,
    C_FindObjectsInit: Some(C_FindObjectsInit),
    C_FindObjects: Some(C_FindObjects),
    C_FindObjectsFinal: Some(C_FindObjectsFinal),
    C_EncryptInit: None,
    C_Encrypt: None,
    C_EncryptUpdate: None,
    C_EncryptFinal: None,
    C_DecryptInit: Some(C_DecryptInit),
    C_Decrypt: Some(C_Decrypt),
    C_DecryptUpdate: None,
    C_DecryptFinal: None,
    C_DigestInit: None,
    C_Digest: None,
    C_DigestUpdate: None,
    C_DigestKey: None,
    C_DigestFinal: None,
    C_SignInit: Some(C_SignInit),
    C_Sign: Some(C_Sign),
    C_SignUpdate: None,
    C_SignFinal: None,
    C_SignRecoverInit: None,
    C_SignRecover: None,
    C_VerifyInit: None,
    C_Verify: None,
    C_VerifyUpdate: None,
    C_VerifyFinal: None,
    C_VerifyRecoverInit: None,
    C_VerifyRecover: None,
    C_DigestEncryptUpdate: None,
    C_DecryptDigestUpdate: None,
    C_SignEncryptUpdate: None,
    C_DecryptVerifyUpdate: None,
    C_GenerateKey: None,
    C_GenerateKeyPair: None,
    C_WrapKey: None,
    C_UnwrapKey: None,
    C_DeriveKey: None,
    C_SeedRandom: None,
    C_GenerateRandom: None,
    C_GetFunctionStatus: None,
    C_CancelFunction: None,
    C_WaitForSlotEvent: None,
};
