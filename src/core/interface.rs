//! ABI surface of the host engine.
//!
//! Single source of truth for every function pointer the engine exposes
//! through its get-proc-address entry. Resolved once at load; a missing
//! symbol is an ABI mismatch and the runtime refuses to proceed.

use crate::core::error::{ExtResult, ExtensionError};
use crate::types::engine_ptr::EnginePtr;
use crate::types::enums::{CallError, CallErrorCode, HandleKind};
use crate::types::variant::RawVariant;
use std::ffi::{CString, c_char, c_void};
use std::ptr::NonNull;

/// The engine's symbol-lookup entry, handed to the library at load time.
pub type GetProcAddressFn = unsafe extern "C" fn(name: *const c_char) -> *mut c_void;

pub type ObjectConstructFn = unsafe extern "C" fn(class: *const c_char) -> *mut c_void;
pub type ObjectDestroyFn = unsafe extern "C" fn(obj: *mut c_void);
pub type ObjectInstanceIdFn = unsafe extern "C" fn(obj: *mut c_void) -> u64;
pub type ObjectSetInstanceFn =
    unsafe extern "C" fn(obj: *mut c_void, class: *const c_char, instance: *mut c_void);
/// Returns the new reference count.
pub type ObjectReferenceFn = unsafe extern "C" fn(obj: *mut c_void) -> u32;
/// Returns the new reference count; the caller destroys at zero.
pub type ObjectUnreferenceFn = unsafe extern "C" fn(obj: *mut c_void) -> u32;

pub type MethodBindLookupFn =
    unsafe extern "C" fn(class: *const c_char, method: *const c_char, hash: i64) -> *mut c_void;
pub type MethodBindPtrcallFn = unsafe extern "C" fn(
    bind: *mut c_void,
    obj: *mut c_void,
    args: *const *const c_void,
    ret: *mut c_void,
);
pub type VariantCallFn = unsafe extern "C" fn(
    obj: *mut c_void,
    method: *const c_char,
    args: *const *const RawVariant,
    argc: i64,
    ret: *mut RawVariant,
    err: *mut CallError,
);

/// Destructor shape shared by every tracked builtin; the pointer refers to
/// the pin's raw words.
pub type BuiltinDestroyFn = unsafe extern "C" fn(bits: *mut u64);

pub type StringNewFn = unsafe extern "C" fn(ret: *mut u64, utf8: *const u8, len: usize);
pub type StringLenFn = unsafe extern "C" fn(bits: *const u64) -> usize;
pub type StringCopyFn = unsafe extern "C" fn(bits: *const u64, buf: *mut u8, cap: usize) -> usize;
pub type StringNameNewFn = unsafe extern "C" fn(ret: *mut u64, utf8: *const c_char);

pub type BuiltinNewFn = unsafe extern "C" fn(ret: *mut u64);
pub type ArraySizeFn = unsafe extern "C" fn(bits: *const u64) -> i64;
/// Borrowed pointer into the array's element storage; invalidated with it.
pub type ArrayAtFn = unsafe extern "C" fn(bits: *const u64, index: i64) -> *mut RawVariant;
pub type ArrayPushFn = unsafe extern "C" fn(bits: *mut u64, value: *const RawVariant);
pub type ArrayPopFn = unsafe extern "C" fn(bits: *mut u64, ret: *mut RawVariant);

pub type VariantNewCopyFn = unsafe extern "C" fn(ret: *mut RawVariant, src: *const RawVariant);
/// Builds a variant aliasing the builtin payload (no deep copy).
pub type VariantFromBuiltinFn =
    unsafe extern "C" fn(kind: u32, ret: *mut RawVariant, payload: *const u64);
/// Extracts a builtin view aliasing the variant's payload (no deep copy).
pub type VariantToBuiltinFn =
    unsafe extern "C" fn(kind: u32, v: *const RawVariant, payload: *mut u64);

pub type ClassRegisterFn = unsafe extern "C" fn(
    library: *mut c_void,
    name: *const c_char,
    parent: *const c_char,
    info: *const ClassCreationInfo,
);
pub type ClassUnregisterFn = unsafe extern "C" fn(library: *mut c_void, name: *const c_char);
pub type PrintErrorFn = unsafe extern "C" fn(
    msg: *const c_char,
    func: *const c_char,
    file: *const c_char,
    line: i32,
);

/// Callbacks handed to the engine when an extension class is registered.
///
/// `create_instance` constructs the engine-side object (and binds the
/// client instance state to it); `free_instance` reclaims the client state
/// when the engine destroys the object; `call_virtual` is the single
/// dispatch entry for every virtual method, keyed by interned method tag.
#[repr(C)]
pub struct ClassCreationInfo {
    pub class_userdata: *mut c_void,
    pub create_instance: unsafe extern "C" fn(class_userdata: *mut c_void) -> *mut c_void,
    pub free_instance: unsafe extern "C" fn(class_userdata: *mut c_void, instance: *mut c_void),
    pub call_virtual: unsafe extern "C" fn(
        instance: *mut c_void,
        method_tag: u64,
        args: *const *const c_void,
        ret: *mut c_void,
    ),
}

/// An opaque method-bind token, previously looked up by class, method and
/// signature hash. Carries no arity or type information; the stub that
/// holds it is responsible for matching the engine signature exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodBind(NonNull<c_void>);

impl MethodBind {
    pub fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr()
    }
}

macro_rules! resolve {
    ($get:expr, $name:literal) => {{
        let ptr = unsafe { ($get)(concat!($name, "\0").as_ptr() as *const c_char) };
        if ptr.is_null() {
            return Err(ExtensionError::AbiMismatch { symbol: $name });
        }
        unsafe { std::mem::transmute(ptr) }
    }};
}

/// The bundle of engine function pointers. Read-only after [`load`].
///
/// [`load`]: ExtensionInterface::load
#[derive(Debug)]
pub struct ExtensionInterface {
    pub object_construct: ObjectConstructFn,
    pub object_destroy: ObjectDestroyFn,
    pub object_get_instance_id: ObjectInstanceIdFn,
    pub object_set_instance: ObjectSetInstanceFn,
    pub object_reference: ObjectReferenceFn,
    pub object_unreference: ObjectUnreferenceFn,

    pub classdb_get_method_bind: MethodBindLookupFn,
    pub method_bind_ptrcall: MethodBindPtrcallFn,
    pub object_call: VariantCallFn,

    pub variant_new_copy: VariantNewCopyFn,
    pub variant_destroy: BuiltinDestroyFn,
    pub variant_from_builtin: VariantFromBuiltinFn,
    pub variant_to_builtin: VariantToBuiltinFn,

    pub string_new_utf8: StringNewFn,
    pub string_utf8_len: StringLenFn,
    pub string_copy_utf8: StringCopyFn,
    pub string_destroy: BuiltinDestroyFn,
    pub string_name_new: StringNameNewFn,
    pub string_name_destroy: BuiltinDestroyFn,
    pub node_path_destroy: BuiltinDestroyFn,
    pub callable_destroy: BuiltinDestroyFn,
    pub signal_destroy: BuiltinDestroyFn,

    pub array_new: BuiltinNewFn,
    pub array_size: ArraySizeFn,
    pub array_at: ArrayAtFn,
    pub array_push: ArrayPushFn,
    pub array_pop: ArrayPopFn,
    pub array_destroy: BuiltinDestroyFn,
    pub dictionary_new: BuiltinNewFn,
    pub dictionary_destroy: BuiltinDestroyFn,
    pub packed_byte_array_destroy: BuiltinDestroyFn,
    pub packed_int64_array_destroy: BuiltinDestroyFn,
    pub packed_float64_array_destroy: BuiltinDestroyFn,
    pub packed_string_array_destroy: BuiltinDestroyFn,

    pub classdb_register_extension_class: ClassRegisterFn,
    pub classdb_unregister_extension_class: ClassUnregisterFn,
    pub print_error: PrintErrorFn,
}

impl ExtensionInterface {
    /// Resolves every required symbol through `get_proc`. Fails with
    /// [`ExtensionError::AbiMismatch`] on the first missing symbol, in
    /// which case nothing may be called.
    pub fn load(get_proc: GetProcAddressFn) -> ExtResult<Self> {
        Ok(ExtensionInterface {
            object_construct: resolve!(get_proc, "object_construct"),
            object_destroy: resolve!(get_proc, "object_destroy"),
            object_get_instance_id: resolve!(get_proc, "object_get_instance_id"),
            object_set_instance: resolve!(get_proc, "object_set_instance"),
            object_reference: resolve!(get_proc, "object_reference"),
            object_unreference: resolve!(get_proc, "object_unreference"),

            classdb_get_method_bind: resolve!(get_proc, "classdb_get_method_bind"),
            method_bind_ptrcall: resolve!(get_proc, "method_bind_ptrcall"),
            object_call: resolve!(get_proc, "object_call"),

            variant_new_copy: resolve!(get_proc, "variant_new_copy"),
            variant_destroy: resolve!(get_proc, "variant_destroy"),
            variant_from_builtin: resolve!(get_proc, "variant_from_builtin"),
            variant_to_builtin: resolve!(get_proc, "variant_to_builtin"),

            string_new_utf8: resolve!(get_proc, "string_new_utf8"),
            string_utf8_len: resolve!(get_proc, "string_utf8_len"),
            string_copy_utf8: resolve!(get_proc, "string_copy_utf8"),
            string_destroy: resolve!(get_proc, "string_destroy"),
            string_name_new: resolve!(get_proc, "string_name_new"),
            string_name_destroy: resolve!(get_proc, "string_name_destroy"),
            node_path_destroy: resolve!(get_proc, "node_path_destroy"),
            callable_destroy: resolve!(get_proc, "callable_destroy"),
            signal_destroy: resolve!(get_proc, "signal_destroy"),

            array_new: resolve!(get_proc, "array_new"),
            array_size: resolve!(get_proc, "array_size"),
            array_at: resolve!(get_proc, "array_at"),
            array_push: resolve!(get_proc, "array_push"),
            array_pop: resolve!(get_proc, "array_pop"),
            array_destroy: resolve!(get_proc, "array_destroy"),
            dictionary_new: resolve!(get_proc, "dictionary_new"),
            dictionary_destroy: resolve!(get_proc, "dictionary_destroy"),
            packed_byte_array_destroy: resolve!(get_proc, "packed_byte_array_destroy"),
            packed_int64_array_destroy: resolve!(get_proc, "packed_int64_array_destroy"),
            packed_float64_array_destroy: resolve!(get_proc, "packed_float64_array_destroy"),
            packed_string_array_destroy: resolve!(get_proc, "packed_string_array_destroy"),

            classdb_register_extension_class: resolve!(get_proc, "classdb_register_extension_class"),
            classdb_unregister_extension_class: resolve!(
                get_proc,
                "classdb_unregister_extension_class"
            ),
            print_error: resolve!(get_proc, "print_error"),
        })
    }

    /// Looks up a method bind by class, method and signature hash.
    pub fn method_bind(&self, class: &str, method: &str, hash: i64) -> ExtResult<MethodBind> {
        let class_c = CString::new(class)?;
        let method_c = CString::new(method)?;
        let ptr =
            unsafe { (self.classdb_get_method_bind)(class_c.as_ptr(), method_c.as_ptr(), hash) };
        NonNull::new(ptr)
            .map(MethodBind)
            .ok_or_else(|| ExtensionError::MethodNotFound {
                class: class.to_string(),
                method: method.to_string(),
            })
    }

    /// Method-bind pointer call. No runtime arity or type checking: the
    /// caller must have laid out `args` and `ret` to match the engine
    /// method's signature exactly.
    ///
    /// # Safety
    /// `args` must point to one pointer per declared argument, each of the
    /// exact ABI type the bound method expects, and `ret` must be valid
    /// for the method's return type (or the frame's zero slot for void).
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub unsafe fn ptrcall(
        &self,
        bind: MethodBind,
        obj: EnginePtr,
        args: *const *const c_void,
        ret: *mut c_void,
    ) {
        unsafe { (self.method_bind_ptrcall)(bind.as_ptr(), obj.as_mut_ptr(), args, ret) }
    }

    /// Variant-typed dynamic call; the engine performs dispatch and error
    /// reporting. Engine-reported failures come back as
    /// [`ExtensionError::EngineError`] enriched with the method name.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn variant_call(
        &self,
        obj: EnginePtr,
        method: &str,
        args: &[*const RawVariant],
        ret: &mut RawVariant,
    ) -> ExtResult<()> {
        let method_c = CString::new(method)?;
        let mut err = CallError::ok();
        unsafe {
            (self.object_call)(
                obj.as_mut_ptr(),
                method_c.as_ptr(),
                args.as_ptr(),
                args.len() as i64,
                ret as *mut RawVariant,
                &mut err,
            );
        }
        match err.code() {
            CallErrorCode::Ok => Ok(()),
            code => Err(ExtensionError::from_call_error(method, code)),
        }
    }

    /// Reports an error through the engine's error-print surface. Used by
    /// trampolines for client implementation failures; conversion errors
    /// here are swallowed since this is already the error path.
    pub fn report_error(&self, message: &str, function: &str) {
        let msg = CString::new(message).unwrap_or_default();
        let func = CString::new(function).unwrap_or_default();
        let file = CString::new(env!("CARGO_PKG_NAME")).unwrap_or_default();
        unsafe { (self.print_error)(msg.as_ptr(), func.as_ptr(), file.as_ptr(), 0) }
    }

    /// Snapshot of the object lifecycle entry points for the registry.
    pub fn object_ops(&self) -> ObjectOps {
        ObjectOps {
            destroy: self.object_destroy,
            instance_id: self.object_get_instance_id,
            reference: self.object_reference,
            unreference: self.object_unreference,
        }
    }

    /// Snapshot of the per-kind builtin destructors, taken once at load so
    /// the tracker can destroy pins without reaching back here.
    pub fn destroy_table(&self) -> DestroyTable {
        DestroyTable {
            fns: [
                self.variant_destroy,
                self.string_destroy,
                self.string_name_destroy,
                self.node_path_destroy,
                self.array_destroy,
                self.dictionary_destroy,
                self.callable_destroy,
                self.signal_destroy,
                self.packed_byte_array_destroy,
                self.packed_int64_array_destroy,
                self.packed_float64_array_destroy,
                self.packed_string_array_destroy,
            ],
        }
    }
}

/// Object lifecycle entry points consumed by the object registry.
#[derive(Clone, Copy)]
pub struct ObjectOps {
    pub destroy: ObjectDestroyFn,
    pub instance_id: ObjectInstanceIdFn,
    pub reference: ObjectReferenceFn,
    pub unreference: ObjectUnreferenceFn,
}

/// Per-kind engine destructors, indexed by [`HandleKind`].
#[derive(Clone, Copy)]
pub struct DestroyTable {
    fns: [BuiltinDestroyFn; HandleKind::COUNT],
}

impl DestroyTable {
    /// Builds a table from explicit destructors, in [`HandleKind`] order.
    /// [`ExtensionInterface::destroy_table`] is the production source;
    /// this exists for harnesses that stub the engine out.
    pub fn from_fns(fns: [BuiltinDestroyFn; HandleKind::COUNT]) -> Self {
        DestroyTable { fns }
    }

    /// # Safety
    /// `bits` must hold a live value of `kind` that the engine allocated
    /// and that has not been destroyed yet.
    pub unsafe fn destroy(&self, kind: HandleKind, bits: *mut u64) {
        let idx = u8::from(kind) as usize;
        unsafe { (self.fns[idx])(bits) }
    }
}
