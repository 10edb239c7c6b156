use crate::types::enums::{CallErrorCode, HandleKind};
use std::ffi::NulError;
use std::str::Utf8Error;
use std::sync::{MutexGuard, PoisonError};
use thiserror::Error;

pub type ExtResult<T> = Result<T, ExtensionError>;

/// Every error kind the runtime core recognizes.
///
/// The core never recovers from any of these locally; they are surfaced to
/// the immediate caller and policy lives in the generated stubs or client
/// code. The tracker violations (`DuplicatePin`, `UseAfterFree`,
/// `DanglingAlias`) and `MissingWrapper` are programming errors in the
/// marshalling layer, not runtime conditions the client can retry.
#[derive(Error, Debug)]
pub enum ExtensionError {
    #[error("ABI mismatch: required symbol '{symbol}' missing from the host interface")]
    AbiMismatch { symbol: &'static str },

    #[error("duplicate pin: {kind:?} bits are already tracked (during {op})")]
    DuplicatePin { kind: HandleKind, op: &'static str },

    #[error("use after free: {kind:?} pin is destroyed (during {op})")]
    UseAfterFree { kind: HandleKind, op: &'static str },

    #[error("dangling alias: {kind:?} alias outlived its owning container (during {op})")]
    DanglingAlias { kind: HandleKind, op: &'static str },

    #[error("missing wrapper: instance {instance_id} was expected to be wrapped already")]
    MissingWrapper { instance_id: u64 },

    #[error("engine reported {code:?} while calling '{method}'")]
    EngineError { method: String, code: CallErrorCode },

    #[error("class '{name}' is already registered")]
    ClassAlreadyRegistered { name: String },

    #[error("class '{name}' is not registered")]
    ClassNotRegistered { name: String },

    #[error("method '{method}' not found on class '{class}'")]
    MethodNotFound { class: String, method: String },

    #[error("extension class '{name}' has no factory")]
    MissingFactory { name: String },

    #[error("variant holds {found:?}, expected {expected:?}")]
    VariantKindMismatch {
        expected: crate::types::enums::VariantKind,
        found: crate::types::enums::VariantKind,
    },

    #[error("null pointer encountered")]
    NullPointer,

    #[error("string conversion error: {0}")]
    StringConversion(#[from] NulError),

    #[error("utf-8 conversion error: {0}")]
    Utf8Conversion(#[from] Utf8Error),

    #[error("mutex poisoned")]
    MutexPoisoned,
}

impl ExtensionError {
    /// Wraps a non-`Ok` engine call-error code, naming the failed method.
    pub fn from_call_error(method: &str, code: CallErrorCode) -> Self {
        ExtensionError::EngineError {
            method: method.to_string(),
            code,
        }
    }
}

impl<T> From<PoisonError<MutexGuard<'_, T>>> for ExtensionError {
    fn from(_: PoisonError<MutexGuard<'_, T>>) -> Self {
        ExtensionError::MutexPoisoned
    }
}
