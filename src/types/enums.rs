use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Type tags of the engine's dynamic variant type.
///
/// This is a closed set defined by the host engine; the numeric values are
/// part of the wire format (word 0 of a packed variant) and must not be
/// reordered. [`VariantKind::try_from`] rejects tags the engine may add in
/// later versions instead of misclassifying them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum VariantKind {
    Nil = 0,
    Bool,
    Int,
    Float,
    String,
    Vector2,
    Vector2i,
    Rect2,
    Rect2i,
    Vector3,
    Vector3i,
    Transform2D,
    Vector4,
    Vector4i,
    Plane,
    Quaternion,
    Aabb,
    Basis,
    Transform3D,
    Projection,
    Color,
    StringName,
    NodePath,
    Rid,
    Object,
    Callable,
    Signal,
    Dictionary,
    Array,
    PackedByteArray,
    PackedInt32Array,
    PackedInt64Array,
    PackedFloat32Array,
    PackedFloat64Array,
    PackedStringArray,
    PackedVector2Array,
    PackedVector3Array,
    PackedColorArray,
    PackedVector4Array,
}

impl VariantKind {
    /// True for tags whose payload lives inline in the variant words and
    /// needs no engine-side destructor.
    pub fn is_inline(self) -> bool {
        matches!(
            self,
            VariantKind::Nil
                | VariantKind::Bool
                | VariantKind::Int
                | VariantKind::Float
                | VariantKind::Vector2
                | VariantKind::Vector2i
                | VariantKind::Vector3i
                | VariantKind::Vector4i
                | VariantKind::Rect2i
                | VariantKind::Rid
        )
    }
}

/// Kinds of engine-allocated values tracked by the handle table.
///
/// Every kind maps to one engine-side destructor resolved at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum HandleKind {
    Variant = 0,
    String,
    StringName,
    NodePath,
    Array,
    Dictionary,
    Callable,
    Signal,
    PackedByteArray,
    PackedInt64Array,
    PackedFloat64Array,
    PackedStringArray,
}

impl HandleKind {
    pub const COUNT: usize = 12;

    pub fn variant_kind(self) -> VariantKind {
        match self {
            HandleKind::Variant => VariantKind::Nil,
            HandleKind::String => VariantKind::String,
            HandleKind::StringName => VariantKind::StringName,
            HandleKind::NodePath => VariantKind::NodePath,
            HandleKind::Array => VariantKind::Array,
            HandleKind::Dictionary => VariantKind::Dictionary,
            HandleKind::Callable => VariantKind::Callable,
            HandleKind::Signal => VariantKind::Signal,
            HandleKind::PackedByteArray => VariantKind::PackedByteArray,
            HandleKind::PackedInt64Array => VariantKind::PackedInt64Array,
            HandleKind::PackedFloat64Array => VariantKind::PackedFloat64Array,
            HandleKind::PackedStringArray => VariantKind::PackedStringArray,
        }
    }
}

/// Error codes of the engine's dynamic (variant-typed) call path.
///
/// Reported by the engine through the call-error out parameter; anything
/// other than `Ok` is surfaced to the caller verbatim, enriched with the
/// name of the failed method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum CallErrorCode {
    Ok = 0,
    InvalidMethod,
    InvalidArgument,
    TooManyArguments,
    TooFewArguments,
    InstanceIsNull,
    MethodNotConst,
}

/// Call-error out parameter of the variant-typed call path, mirroring the
/// engine's C layout.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CallError {
    pub code: i32,
    pub argument: i32,
    pub expected: i32,
}

impl CallError {
    pub fn ok() -> Self {
        CallError {
            code: CallErrorCode::Ok.into(),
            argument: -1,
            expected: -1,
        }
    }

    pub fn code(&self) -> CallErrorCode {
        CallErrorCode::try_from(self.code).unwrap_or(CallErrorCode::InvalidMethod)
    }
}

bitflags! {
    /// Usage mask attached to registered extension-class properties.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PropertyUsage: u32 {
        const STORAGE  = 1 << 1;
        const EDITOR   = 1 << 2;
        const INTERNAL = 1 << 3;
        const DEFAULT  = Self::STORAGE.bits() | Self::EDITOR.bits();
    }
}
