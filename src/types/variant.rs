//! Variant bridge: boxing and unboxing of the engine's dynamic any-type.
//!
//! A packed variant is three machine words; word 0 carries the type tag
//! and the rest hold the payload inline (primitives) or an engine-owned
//! pointer to it (aggregates). Boxing and unboxing aggregates never copies
//! the payload: the two sides share storage through a child-pin relation
//! in the tracker.

use crate::core::error::{ExtResult, ExtensionError};
use crate::core::init::Runtime;
use crate::core::registry::{InstanceId, Obj, Ownership};
use crate::core::tracker::Lease;
use crate::types::enums::{HandleKind, VariantKind};
use ordered_float::OrderedFloat;
use std::hash::{Hash, Hasher};

/// Wire form of a variant: three words, word 0 is the type tag.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RawVariant {
    pub words: [u64; 3],
}

impl RawVariant {
    pub fn nil() -> Self {
        RawVariant { words: [0; 3] }
    }

    pub fn from_parts(kind: VariantKind, payload: [u64; 2]) -> Self {
        RawVariant {
            words: [u32::from(kind) as u64, payload[0], payload[1]],
        }
    }

    /// Unknown tags from a newer engine degrade to nil rather than being
    /// misread as some other payload shape.
    pub fn kind(&self) -> VariantKind {
        VariantKind::try_from(self.words[0] as u32).unwrap_or(VariantKind::Nil)
    }

    pub fn payload(&self) -> [u64; 2] {
        [self.words[1], self.words[2]]
    }
}

impl Hash for RawVariant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.words[0].hash(state);
        match self.kind() {
            // Floats hash by ordered value so equal payloads agree.
            VariantKind::Float => OrderedFloat(f64::from_bits(self.words[1])).hash(state),
            _ => {
                self.words[1].hash(state);
                self.words[2].hash(state);
            }
        }
    }
}

/// True for tags whose variant needs no pin: the payload is inline, or it
/// is an object reference resolved by identity through the registry.
fn unpinned(kind: VariantKind) -> bool {
    kind.is_inline() || kind == VariantKind::Object
}

#[derive(Clone, Copy)]
enum Repr {
    Inline(RawVariant),
    Pinned(Lease),
}

/// A boxed dynamic value. Aggregate variants own (or alias) engine-side
/// storage through a tracker pin; primitive variants carry their payload
/// inline and never touch the engine.
pub struct Variant {
    repr: Repr,
}

impl Variant {
    fn pinned(lease: Lease) -> Self {
        Variant {
            repr: Repr::Pinned(lease),
        }
    }

    fn inline(raw: RawVariant) -> Self {
        Variant {
            repr: Repr::Inline(raw),
        }
    }

    pub fn nil() -> Self {
        Variant::inline(RawVariant::nil())
    }

    pub fn from_bool(value: bool) -> Self {
        Variant::inline(RawVariant::from_parts(VariantKind::Bool, [value as u64, 0]))
    }

    pub fn from_int(value: i64) -> Self {
        Variant::inline(RawVariant::from_parts(VariantKind::Int, [value as u64, 0]))
    }

    pub fn from_float(value: f64) -> Self {
        Variant::inline(RawVariant::from_parts(
            VariantKind::Float,
            [value.to_bits(), 0],
        ))
    }

    /// Boxes an object reference by identity. A `None` yields a null
    /// object variant, which is a distinct thing from nil.
    pub fn from_object(object: Option<&Obj>) -> Self {
        let payload = match object {
            Some(obj) => [
                obj.instance_id().to_raw(),
                obj.raw().as_mut_ptr() as usize as u64,
            ],
            None => [0, 0],
        };
        Variant::inline(RawVariant::from_parts(VariantKind::Object, payload))
    }

    /// Adopts a variant the engine handed us ownership of (e.g. a ptrcall
    /// return slot). Aggregates are pinned; primitives stay inline.
    pub fn adopt_owned(rt: &Runtime, raw: RawVariant) -> ExtResult<Self> {
        if unpinned(raw.kind()) {
            return Ok(Variant::inline(raw));
        }
        let lease = rt.table.pin(HandleKind::Variant, raw.words)?;
        Ok(Variant::pinned(lease))
    }

    /// Copies a borrowed variant (e.g. a trampoline argument slot) into an
    /// owned one via the engine's copy constructor.
    pub fn from_raw_copy(rt: &Runtime, raw: &RawVariant) -> ExtResult<Self> {
        if unpinned(raw.kind()) {
            return Ok(Variant::inline(*raw));
        }
        let mut copy = RawVariant::nil();
        unsafe { (rt.interface.variant_new_copy)(&mut copy, raw) };
        let lease = rt.table.pin(HandleKind::Variant, copy.words)?;
        Ok(Variant::pinned(lease))
    }

    /// Boxes a builtin value (string, array, ...) without copying its
    /// payload: the variant aliases the builtin's storage and is pinned as
    /// its child, so releasing the builtin invalidates this variant.
    pub fn from_builtin(rt: &Runtime, kind: HandleKind, builtin: Lease) -> ExtResult<Self> {
        let bits = rt.table.get(builtin)?;
        let mut raw = RawVariant::nil();
        unsafe {
            (rt.interface.variant_from_builtin)(
                u32::from(kind.variant_kind()),
                &mut raw,
                bits.as_ptr(),
            );
        }
        let lease = rt.table.pin_alias(builtin, HandleKind::Variant, raw.words)?;
        Ok(Variant::pinned(lease))
    }

    /// Borrows a container element: aggregate payloads are pinned as
    /// children of the container and die with it, primitives are copied
    /// out.
    pub(crate) fn from_element(rt: &Runtime, container: Lease, raw: RawVariant) -> ExtResult<Self> {
        if unpinned(raw.kind()) {
            return Ok(Variant::inline(raw));
        }
        let lease = rt.table.pin_alias(container, HandleKind::Variant, raw.words)?;
        Ok(Variant::pinned(lease))
    }

    /// The raw words, checked against the tracker for pinned variants.
    pub fn raw(&self, rt: &Runtime) -> ExtResult<RawVariant> {
        match &self.repr {
            Repr::Inline(raw) => Ok(*raw),
            Repr::Pinned(lease) => Ok(RawVariant {
                words: rt.table.get(*lease)?,
            }),
        }
    }

    pub fn kind(&self, rt: &Runtime) -> ExtResult<VariantKind> {
        Ok(self.raw(rt)?.kind())
    }

    pub fn lease(&self) -> Option<Lease> {
        match &self.repr {
            Repr::Inline(_) => None,
            Repr::Pinned(lease) => Some(*lease),
        }
    }

    fn expect_kind(&self, rt: &Runtime, expected: VariantKind) -> ExtResult<RawVariant> {
        let raw = self.raw(rt)?;
        if raw.kind() != expected {
            return Err(ExtensionError::VariantKindMismatch {
                expected,
                found: raw.kind(),
            });
        }
        Ok(raw)
    }

    pub fn is_nil(&self, rt: &Runtime) -> ExtResult<bool> {
        Ok(self.kind(rt)? == VariantKind::Nil)
    }

    pub fn to_bool(&self, rt: &Runtime) -> ExtResult<bool> {
        Ok(self.expect_kind(rt, VariantKind::Bool)?.words[1] != 0)
    }

    pub fn to_int(&self, rt: &Runtime) -> ExtResult<i64> {
        Ok(self.expect_kind(rt, VariantKind::Int)?.words[1] as i64)
    }

    pub fn to_float(&self, rt: &Runtime) -> ExtResult<f64> {
        Ok(f64::from_bits(self.expect_kind(rt, VariantKind::Float)?.words[1]))
    }

    /// Unboxes an object reference through the registry. Refcounted
    /// classes must already be wrapped (assert-identity); anything else is
    /// adopted as an engine loan. A null reference is a null wrapper, not
    /// an error.
    pub fn to_object(&self, rt: &Runtime, refcounted: bool) -> ExtResult<Option<Obj>> {
        let raw = self.expect_kind(rt, VariantKind::Object)?;
        let Some(id) = InstanceId::from_raw(raw.words[1]) else {
            return Ok(None);
        };
        let ptr = crate::types::engine_ptr::EnginePtr::from_mut(
            raw.words[2] as usize as *mut std::ffi::c_void,
        );
        let policy = if refcounted {
            Ownership::AssertExisting
        } else {
            Ownership::RetainedByEngine
        };
        let resolved = rt.objects.adopt(ptr, refcounted, policy)?;
        debug_assert!(
            resolved
                .as_ref()
                .is_none_or(|obj| obj.instance_id() == id)
        );
        Ok(resolved)
    }

    /// Unboxes a builtin payload without copying: the returned lease
    /// aliases this variant's storage as a child pin.
    pub fn to_builtin(&self, rt: &Runtime, kind: HandleKind) -> ExtResult<Lease> {
        let raw = self.expect_kind(rt, kind.variant_kind())?;
        let lease = match &self.repr {
            Repr::Pinned(lease) => *lease,
            Repr::Inline(_) => return Err(ExtensionError::NullPointer),
        };
        let mut payload = [0u64; 3];
        unsafe {
            (rt.interface.variant_to_builtin)(
                u32::from(kind.variant_kind()),
                &raw,
                payload.as_mut_ptr(),
            );
        }
        // If the storage is already tracked (we unboxed the value we
        // boxed), share the live pin instead of rebinding its bits.
        if let Some(existing) = rt.table.lookup(kind, payload) {
            return Ok(existing);
        }
        rt.table.pin_alias(lease, kind, payload)
    }

    /// Deep-copies into an independently owned variant through the
    /// engine's copy constructor.
    pub fn duplicated(&self, rt: &Runtime) -> ExtResult<Variant> {
        let raw = self.raw(rt)?;
        Variant::from_raw_copy(rt, &raw)
    }

    /// Consumes the variant, handing its storage to the engine: the pin is
    /// ended (no destructor) and the raw words are returned for the call.
    pub fn into_engine(self, rt: &Runtime) -> ExtResult<RawVariant> {
        let raw = match &self.repr {
            Repr::Inline(raw) => *raw,
            Repr::Pinned(lease) => RawVariant {
                words: rt.table.end(*lease)?,
            },
        };
        std::mem::forget(self);
        Ok(raw)
    }

    /// Deterministic release point; the usual alternative to waiting for
    /// drop.
    pub fn release(self, rt: &Runtime) -> ExtResult<()> {
        let result = match &self.repr {
            Repr::Inline(_) => Ok(()),
            Repr::Pinned(lease) => rt.table.release(*lease),
        };
        std::mem::forget(self);
        result
    }
}

impl Drop for Variant {
    fn drop(&mut self) {
        if let Repr::Pinned(lease) = self.repr {
            match Runtime::global() {
                Some(rt) => rt.table.retire(lease),
                None => log::warn!("variant dropped after runtime teardown; pin leaked"),
            }
        }
    }
}

impl std::fmt::Debug for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.repr {
            Repr::Inline(raw) => f.debug_tuple("Variant").field(&raw.kind()).finish(),
            Repr::Pinned(lease) => f.debug_tuple("Variant").field(lease).finish(),
        }
    }
}
