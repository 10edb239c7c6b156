//! Wrappers for engine builtin values whose storage the engine owns.
//!
//! These are deliberately thin: one pin per wrapper, engine calls for
//! every operation, no ergonomic collection facade. Their job is the
//! lifetime story — created pinned, released at a well-defined point,
//! children invalidated with their container.

use crate::core::error::{ExtResult, ExtensionError};
use crate::core::init::Runtime;
use crate::core::tracker::{Lease, RawBits};
use crate::types::enums::HandleKind;
use crate::types::variant::{RawVariant, Variant};
use std::ffi::CString;

fn retire_on_drop(lease: Lease) {
    match Runtime::global() {
        Some(rt) => rt.table.retire(lease),
        None => log::warn!("builtin dropped after runtime teardown; pin leaked"),
    }
}

macro_rules! builtin_common {
    ($name:ident) => {
        impl $name {
            pub fn lease(&self) -> Lease {
                self.lease
            }

            pub fn bits(&self, rt: &Runtime) -> ExtResult<RawBits> {
                rt.table.get(self.lease)
            }

            /// Deterministic release point for the engine-side value.
            pub fn release(self, rt: &Runtime) -> ExtResult<()> {
                let lease = self.lease;
                std::mem::forget(self);
                rt.table.release(lease)
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                retire_on_drop(self.lease);
            }
        }
    };
}

/// An engine string handle.
pub struct EngineString {
    lease: Lease,
}

builtin_common!(EngineString);

impl EngineString {
    pub fn new(rt: &Runtime, value: &str) -> ExtResult<Self> {
        let mut bits: RawBits = [0; 3];
        unsafe {
            (rt.interface.string_new_utf8)(bits.as_mut_ptr(), value.as_ptr(), value.len());
        }
        let lease = rt.table.pin(HandleKind::String, bits)?;
        Ok(EngineString { lease })
    }

    /// Adopts string bits the engine handed us ownership of.
    pub fn adopt_owned(rt: &Runtime, bits: RawBits) -> ExtResult<Self> {
        let lease = rt.table.pin(HandleKind::String, bits)?;
        Ok(EngineString { lease })
    }

    pub fn to_rust(&self, rt: &Runtime) -> ExtResult<String> {
        let bits = self.bits(rt)?;
        let len = unsafe { (rt.interface.string_utf8_len)(bits.as_ptr()) };
        let mut buffer = vec![0u8; len];
        let written =
            unsafe { (rt.interface.string_copy_utf8)(bits.as_ptr(), buffer.as_mut_ptr(), len) };
        buffer.truncate(written);
        Ok(String::from_utf8(buffer).map_err(|e| e.utf8_error())?)
    }

    /// Boxes this string into a variant aliasing the same storage.
    pub fn to_variant(&self, rt: &Runtime) -> ExtResult<Variant> {
        Variant::from_builtin(rt, HandleKind::String, self.lease)
    }
}

/// An interned engine name.
pub struct StringName {
    lease: Lease,
}

builtin_common!(StringName);

impl StringName {
    pub fn new(rt: &Runtime, name: &str) -> ExtResult<Self> {
        let name_c = CString::new(name)?;
        let mut bits: RawBits = [0; 3];
        unsafe {
            (rt.interface.string_name_new)(bits.as_mut_ptr(), name_c.as_ptr());
        }
        let lease = rt.table.pin(HandleKind::StringName, bits)?;
        Ok(StringName { lease })
    }
}

/// An engine array handle. Elements are variants whose storage the array
/// owns; element accessors return child pins invalidated with the array.
pub struct EngineArray {
    lease: Lease,
}

builtin_common!(EngineArray);

impl EngineArray {
    pub fn new(rt: &Runtime) -> ExtResult<Self> {
        let mut bits: RawBits = [0; 3];
        unsafe { (rt.interface.array_new)(bits.as_mut_ptr()) };
        let lease = rt.table.pin(HandleKind::Array, bits)?;
        Ok(EngineArray { lease })
    }

    /// Adopts array bits the engine handed us ownership of (e.g. a ptrcall
    /// return slot under the transferred-to-client convention).
    pub fn adopt_owned(rt: &Runtime, bits: RawBits) -> ExtResult<Self> {
        let lease = rt.table.pin(HandleKind::Array, bits)?;
        Ok(EngineArray { lease })
    }

    pub fn len(&self, rt: &Runtime) -> ExtResult<usize> {
        let bits = self.bits(rt)?;
        let size = unsafe { (rt.interface.array_size)(bits.as_ptr()) };
        Ok(size.max(0) as usize)
    }

    pub fn is_empty(&self, rt: &Runtime) -> ExtResult<bool> {
        Ok(self.len(rt)? == 0)
    }

    /// Appends a copy of the variant's current value.
    pub fn push(&self, rt: &Runtime, value: &Variant) -> ExtResult<()> {
        let mut bits = self.bits(rt)?;
        let raw = value.raw(rt)?;
        unsafe { (rt.interface.array_push)(bits.as_mut_ptr(), &raw) };
        Ok(())
    }

    /// Borrows the element at `index` as a child pin: the returned variant
    /// aliases storage the array owns and dies with it.
    pub fn element(&self, rt: &Runtime, index: usize) -> ExtResult<Variant> {
        let bits = self.bits(rt)?;
        let slot = unsafe { (rt.interface.array_at)(bits.as_ptr(), index as i64) };
        if slot.is_null() {
            return Err(ExtensionError::NullPointer);
        }
        let raw = unsafe { *slot };
        Variant::from_element(rt, self.lease, raw)
    }

    /// Removes the last element and takes ownership of it.
    pub fn pop(&self, rt: &Runtime) -> ExtResult<Variant> {
        let mut bits = self.bits(rt)?;
        let mut raw = RawVariant::nil();
        unsafe { (rt.interface.array_pop)(bits.as_mut_ptr(), &mut raw) };
        Variant::adopt_owned(rt, raw)
    }

    pub fn to_variant(&self, rt: &Runtime) -> ExtResult<Variant> {
        Variant::from_builtin(rt, HandleKind::Array, self.lease)
    }
}

/// An engine dictionary handle. Only the lifecycle surface lives here.
pub struct EngineDictionary {
    lease: Lease,
}

builtin_common!(EngineDictionary);

impl EngineDictionary {
    pub fn new(rt: &Runtime) -> ExtResult<Self> {
        let mut bits: RawBits = [0; 3];
        unsafe { (rt.interface.dictionary_new)(bits.as_mut_ptr()) };
        let lease = rt.table.pin(HandleKind::Dictionary, bits)?;
        Ok(EngineDictionary { lease })
    }

    pub fn to_variant(&self, rt: &Runtime) -> ExtResult<Variant> {
        Variant::from_builtin(rt, HandleKind::Dictionary, self.lease)
    }
}
