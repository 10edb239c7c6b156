//! In-process mock host engine.
//!
//! Implements the full ABI symbol table in Rust so the runtime can be
//! exercised end-to-end without a real engine. Objects are fake pointers
//! whose numeric value is the instance id; builtin storage is refcounted
//! the way the engine's copy-on-write containers are. Every ABI-level
//! destructor invocation is recorded so tests can assert exact destroy
//! counts.

#![allow(dead_code)]

use gdextension_runtime::prelude::*;
use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char, c_void};
use std::sync::{LazyLock, Mutex, MutexGuard, OnceLock};

const FIRST_INSTANCE_ID: u64 = 0x10;
const FIRST_HANDLE: u64 = 0x1_0000;

pub struct HostObject {
    pub class: String,
    pub refcount: Option<u32>,
    pub parent: Option<u64>,
    pub instance: Option<usize>,
}

struct HostClass {
    refcounted: bool,
}

pub struct RegisteredExtension {
    pub parent: String,
    pub userdata: usize,
    pub create: unsafe extern "C" fn(*mut c_void) -> *mut c_void,
    pub free: unsafe extern "C" fn(*mut c_void, *mut c_void),
    pub call_virtual: unsafe extern "C" fn(*mut c_void, u64, *const *const c_void, *mut c_void),
}

#[derive(Default)]
pub struct Host {
    next_instance_id: u64,
    next_handle: u64,
    pub objects: HashMap<u64, HostObject>,
    strings: HashMap<u64, (String, u32)>,
    string_names: HashMap<u64, String>,
    arrays: HashMap<u64, (Vec<RawVariant>, u32)>,
    dictionaries: HashMap<u64, u32>,
    classes: HashMap<String, HostClass>,
    pub extensions: HashMap<String, RegisteredExtension>,
    /// ABI destructor invocations as (kind, handle) pairs.
    pub destroy_calls: Vec<(&'static str, u64)>,
    pub destroyed_objects: Vec<u64>,
    pub stored_items: Vec<u64>,
    pub errors: Vec<String>,
}

const METHOD_BINDS: &[(&str, &str)] = &[
    ("DirAccess", "open"),
    ("DirAccess", "get_files"),
    ("Node", "get_parent"),
    ("ItemList", "store"),
];

impl Host {
    fn new() -> Self {
        let mut host = Host {
            next_instance_id: FIRST_INSTANCE_ID,
            next_handle: FIRST_HANDLE,
            ..Host::default()
        };
        for (name, refcounted) in [
            ("Object", false),
            ("Node", false),
            ("RefCounted", true),
            ("DirAccess", true),
            ("ItemList", false),
        ] {
            host.classes.insert(name.to_string(), HostClass { refcounted });
        }
        host
    }

    fn create_object(&mut self, class: &str) -> Option<u64> {
        let refcounted = self.classes.get(class)?.refcounted;
        let id = self.next_instance_id;
        self.next_instance_id += 1;
        self.objects.insert(
            id,
            HostObject {
                class: class.to_string(),
                refcount: refcounted.then_some(1),
                parent: None,
                instance: None,
            },
        );
        Some(id)
    }

    fn new_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn new_string(&mut self, value: String) -> u64 {
        let handle = self.new_handle();
        self.strings.insert(handle, (value, 1));
        handle
    }

    fn new_array(&mut self, elements: Vec<RawVariant>) -> u64 {
        let handle = self.new_handle();
        self.arrays.insert(handle, (elements, 1));
        handle
    }

    fn release_string(&mut self, handle: u64) {
        if let Some(entry) = self.strings.get_mut(&handle) {
            entry.1 -= 1;
            if entry.1 == 0 {
                self.strings.remove(&handle);
            }
        }
    }

    fn release_array(&mut self, handle: u64) {
        let emptied = match self.arrays.get_mut(&handle) {
            Some(entry) => {
                entry.1 -= 1;
                entry.1 == 0
            }
            None => false,
        };
        if emptied {
            let (elements, _) = self.arrays.remove(&handle).expect("array storage");
            for element in elements {
                self.release_payload(element);
            }
        }
    }

    fn release_payload(&mut self, raw: RawVariant) {
        match raw.kind() {
            VariantKind::String => self.release_string(raw.words[1]),
            VariantKind::Array => self.release_array(raw.words[1]),
            VariantKind::StringName => {
                self.string_names.remove(&raw.words[1]);
            }
            VariantKind::Dictionary => {
                if let Some(rc) = self.dictionaries.get_mut(&raw.words[1]) {
                    *rc -= 1;
                    if *rc == 0 {
                        self.dictionaries.remove(&raw.words[1]);
                    }
                }
            }
            _ => {}
        }
    }

    fn bump_payload(&mut self, raw: RawVariant) {
        match raw.kind() {
            VariantKind::String => {
                if let Some(entry) = self.strings.get_mut(&raw.words[1]) {
                    entry.1 += 1;
                }
            }
            VariantKind::Array => {
                if let Some(entry) = self.arrays.get_mut(&raw.words[1]) {
                    entry.1 += 1;
                }
            }
            _ => {}
        }
    }

    fn deep_copy(&mut self, raw: RawVariant) -> RawVariant {
        match raw.kind() {
            VariantKind::String => {
                let content = self
                    .strings
                    .get(&raw.words[1])
                    .map(|(s, _)| s.clone())
                    .unwrap_or_default();
                let handle = self.new_string(content);
                RawVariant::from_parts(VariantKind::String, [handle, 0])
            }
            VariantKind::Array => {
                let elements = self
                    .arrays
                    .get(&raw.words[1])
                    .map(|(e, _)| e.clone())
                    .unwrap_or_default();
                for element in &elements {
                    self.bump_payload(*element);
                }
                let handle = self.new_array(elements);
                RawVariant::from_parts(VariantKind::Array, [handle, 0])
            }
            _ => raw,
        }
    }

    pub fn string_content(&self, handle: u64) -> Option<&str> {
        self.strings.get(&handle).map(|(s, _)| s.as_str())
    }
}

static HOST: LazyLock<Mutex<Host>> = LazyLock::new(|| Mutex::new(Host::new()));

pub fn host() -> MutexGuard<'static, Host> {
    HOST.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn cstr(ptr: *const c_char) -> String {
    unsafe { CStr::from_ptr(ptr).to_string_lossy().into_owned() }
}

// ---------------------------------------------------------------------------
// Object surface
// ---------------------------------------------------------------------------

unsafe extern "C" fn host_object_construct(class: *const c_char) -> *mut c_void {
    let class = cstr(class);
    match host().create_object(&class) {
        Some(id) => id as usize as *mut c_void,
        None => std::ptr::null_mut(),
    }
}

unsafe extern "C" fn host_object_destroy(obj: *mut c_void) {
    let id = obj as u64;
    let mut host = host();
    let Some(object) = host.objects.remove(&id) else {
        return;
    };
    host.destroyed_objects.push(id);
    if let Some(instance) = object.instance {
        if let Some(extension) = host.extensions.get(&object.class) {
            let (free, userdata) = (extension.free, extension.userdata);
            drop(host);
            unsafe { free(userdata as *mut c_void, instance as *mut c_void) };
        }
    }
}

unsafe extern "C" fn host_object_get_instance_id(obj: *mut c_void) -> u64 {
    let id = obj as u64;
    if host().objects.contains_key(&id) { id } else { 0 }
}

unsafe extern "C" fn host_object_set_instance(
    obj: *mut c_void,
    class: *const c_char,
    instance: *mut c_void,
) {
    let class = cstr(class);
    if let Some(object) = host().objects.get_mut(&(obj as u64)) {
        object.class = class;
        object.instance = Some(instance as usize);
    }
}

unsafe extern "C" fn host_object_reference(obj: *mut c_void) -> u32 {
    let mut host = host();
    let Some(object) = host.objects.get_mut(&(obj as u64)) else {
        return 0;
    };
    let count = object.refcount.get_or_insert(0);
    *count += 1;
    *count
}

unsafe extern "C" fn host_object_unreference(obj: *mut c_void) -> u32 {
    let mut host = host();
    let Some(object) = host.objects.get_mut(&(obj as u64)) else {
        return 0;
    };
    let count = object.refcount.get_or_insert(1);
    *count -= 1;
    *count
}

// ---------------------------------------------------------------------------
// Method binds and calls
// ---------------------------------------------------------------------------

unsafe extern "C" fn host_classdb_get_method_bind(
    class: *const c_char,
    method: *const c_char,
    _hash: i64,
) -> *mut c_void {
    let class = cstr(class);
    let method = cstr(method);
    METHOD_BINDS
        .iter()
        .position(|(c, m)| *c == class && *m == method)
        .map(|index| (index + 1) as *mut c_void)
        .unwrap_or(std::ptr::null_mut())
}

unsafe extern "C" fn host_method_bind_ptrcall(
    bind: *mut c_void,
    obj: *mut c_void,
    args: *const *const c_void,
    ret: *mut c_void,
) {
    let token = bind as usize;
    let (class, method) = METHOD_BINDS[token - 1];
    let mut host = host();
    match (class, method) {
        ("DirAccess", "open") => {
            // One string argument; a fresh pre-retained instance per call.
            let _path_handle = unsafe { *(*args).cast::<u64>() };
            let id = host.create_object("DirAccess").expect("DirAccess class");
            unsafe { ret.cast::<*mut c_void>().write(id as usize as *mut c_void) };
        }
        ("DirAccess", "get_files") => {
            let elements: Vec<RawVariant> = ["a", "b", "c"]
                .iter()
                .map(|name| {
                    let handle = host.new_string(name.to_string());
                    RawVariant::from_parts(VariantKind::String, [handle, 0])
                })
                .collect();
            let handle = host.new_array(elements);
            unsafe { ret.cast::<u64>().write(handle) };
        }
        ("Node", "get_parent") => {
            let parent = host
                .objects
                .get(&(obj as u64))
                .and_then(|object| object.parent)
                .map(|id| id as usize as *mut c_void)
                .unwrap_or(std::ptr::null_mut());
            unsafe { ret.cast::<*mut c_void>().write(parent) };
        }
        ("ItemList", "store") => {
            // The engine keeps the reference the caller transferred.
            let item = unsafe { *(*args).cast::<*mut c_void>() };
            host.stored_items.push(item as u64);
        }
        _ => unreachable!("unknown method bind token"),
    }
}

unsafe extern "C" fn host_object_call(
    obj: *mut c_void,
    method: *const c_char,
    args: *const *const RawVariant,
    argc: i64,
    ret: *mut RawVariant,
    err: *mut CallError,
) {
    let method = cstr(method);
    let mut host = host();
    if !host.objects.contains_key(&(obj as u64)) {
        unsafe { (*err).code = CallErrorCode::InstanceIsNull.into() };
        return;
    }
    match method.as_str() {
        "echo" => {
            if argc < 1 {
                unsafe { (*err).code = CallErrorCode::TooFewArguments.into() };
                return;
            }
            let raw = unsafe { **args };
            let copy = host.deep_copy(raw);
            unsafe { ret.write(copy) };
        }
        _ => unsafe {
            (*err).code = CallErrorCode::InvalidMethod.into();
        },
    }
}

// ---------------------------------------------------------------------------
// Builtin lifecycle
// ---------------------------------------------------------------------------

unsafe extern "C" fn host_variant_new_copy(ret: *mut RawVariant, src: *const RawVariant) {
    let raw = unsafe { *src };
    let copy = host().deep_copy(raw);
    unsafe { ret.write(copy) };
}

unsafe extern "C" fn host_variant_destroy(bits: *mut u64) {
    let raw = RawVariant {
        words: unsafe { [*bits, *bits.add(1), *bits.add(2)] },
    };
    let mut host = host();
    host.destroy_calls.push(("variant", raw.words[1]));
    host.release_payload(raw);
}

unsafe extern "C" fn host_variant_from_builtin(kind: u32, ret: *mut RawVariant, payload: *const u64) {
    // A view over the builtin's storage, not a new reference.
    unsafe {
        ret.write(RawVariant {
            words: [kind as u64, *payload, 0],
        });
    }
}

unsafe extern "C" fn host_variant_to_builtin(kind: u32, v: *const RawVariant, payload: *mut u64) {
    let raw = unsafe { *v };
    debug_assert_eq!(raw.words[0], kind as u64);
    unsafe { payload.write(raw.words[1]) };
}

unsafe extern "C" fn host_string_new_utf8(ret: *mut u64, utf8: *const u8, len: usize) {
    let bytes = unsafe { std::slice::from_raw_parts(utf8, len) };
    let value = String::from_utf8_lossy(bytes).into_owned();
    let handle = host().new_string(value);
    unsafe { ret.write(handle) };
}

unsafe extern "C" fn host_string_utf8_len(bits: *const u64) -> usize {
    host()
        .strings
        .get(unsafe { &*bits })
        .map(|(s, _)| s.len())
        .unwrap_or(0)
}

unsafe extern "C" fn host_string_copy_utf8(bits: *const u64, buf: *mut u8, cap: usize) -> usize {
    let host = host();
    let Some((content, _)) = host.strings.get(unsafe { &*bits }) else {
        return 0;
    };
    let count = content.len().min(cap);
    unsafe { std::ptr::copy_nonoverlapping(content.as_ptr(), buf, count) };
    count
}

unsafe extern "C" fn host_string_destroy(bits: *mut u64) {
    let handle = unsafe { *bits };
    let mut host = host();
    host.destroy_calls.push(("string", handle));
    host.release_string(handle);
}

unsafe extern "C" fn host_string_name_new(ret: *mut u64, utf8: *const c_char) {
    let name = cstr(utf8);
    let mut host = host();
    let handle = host.new_handle();
    host.string_names.insert(handle, name);
    unsafe { ret.write(handle) };
}

unsafe extern "C" fn host_string_name_destroy(bits: *mut u64) {
    let handle = unsafe { *bits };
    let mut host = host();
    host.destroy_calls.push(("string_name", handle));
    host.string_names.remove(&handle);
}

unsafe extern "C" fn host_node_path_destroy(bits: *mut u64) {
    let handle = unsafe { *bits };
    host().destroy_calls.push(("node_path", handle));
}

unsafe extern "C" fn host_callable_destroy(bits: *mut u64) {
    let handle = unsafe { *bits };
    host().destroy_calls.push(("callable", handle));
}

unsafe extern "C" fn host_signal_destroy(bits: *mut u64) {
    let handle = unsafe { *bits };
    host().destroy_calls.push(("signal", handle));
}

unsafe extern "C" fn host_array_new(ret: *mut u64) {
    let handle = host().new_array(Vec::new());
    unsafe { ret.write(handle) };
}

unsafe extern "C" fn host_array_size(bits: *const u64) -> i64 {
    host()
        .arrays
        .get(unsafe { &*bits })
        .map(|(elements, _)| elements.len() as i64)
        .unwrap_or(-1)
}

unsafe extern "C" fn host_array_at(bits: *const u64, index: i64) -> *mut RawVariant {
    let mut host = host();
    let Some((elements, _)) = host.arrays.get_mut(unsafe { &*bits }) else {
        return std::ptr::null_mut();
    };
    if index < 0 || index as usize >= elements.len() {
        return std::ptr::null_mut();
    }
    // The caller copies the slot before the storage can move again.
    &mut elements[index as usize] as *mut RawVariant
}

unsafe extern "C" fn host_array_push(bits: *mut u64, value: *const RawVariant) {
    let raw = unsafe { *value };
    let mut host = host();
    host.bump_payload(raw);
    if let Some((elements, _)) = host.arrays.get_mut(unsafe { &*bits }) {
        elements.push(raw);
    }
}

unsafe extern "C" fn host_array_pop(bits: *mut u64, ret: *mut RawVariant) {
    let mut host = host();
    let popped = host
        .arrays
        .get_mut(unsafe { &*bits })
        .and_then(|(elements, _)| elements.pop())
        .unwrap_or(RawVariant::nil());
    // Ownership of the payload reference moves to the caller.
    unsafe { ret.write(popped) };
}

unsafe extern "C" fn host_array_destroy(bits: *mut u64) {
    let handle = unsafe { *bits };
    let mut host = host();
    host.destroy_calls.push(("array", handle));
    host.release_array(handle);
}

unsafe extern "C" fn host_dictionary_new(ret: *mut u64) {
    let mut host = host();
    let handle = host.new_handle();
    host.dictionaries.insert(handle, 1);
    unsafe { ret.write(handle) };
}

unsafe extern "C" fn host_dictionary_destroy(bits: *mut u64) {
    let handle = unsafe { *bits };
    let mut host = host();
    host.destroy_calls.push(("dictionary", handle));
    if let Some(rc) = host.dictionaries.get_mut(&handle) {
        *rc -= 1;
        if *rc == 0 {
            host.dictionaries.remove(&handle);
        }
    }
}

unsafe extern "C" fn host_packed_destroy(bits: *mut u64) {
    let handle = unsafe { *bits };
    host().destroy_calls.push(("packed", handle));
}

// ---------------------------------------------------------------------------
// Extension classes and errors
// ---------------------------------------------------------------------------

unsafe extern "C" fn host_classdb_register_extension_class(
    _library: *mut c_void,
    name: *const c_char,
    parent: *const c_char,
    info: *const ClassCreationInfo,
) {
    let name = cstr(name);
    let parent = cstr(parent);
    let info = unsafe { &*info };
    let mut host = host();
    let refcounted = host
        .classes
        .get(&parent)
        .map(|class| class.refcounted)
        .unwrap_or(false);
    host.classes
        .insert(name.clone(), HostClass { refcounted });
    host.extensions.insert(
        name,
        RegisteredExtension {
            parent,
            userdata: info.class_userdata as usize,
            create: info.create_instance,
            free: info.free_instance,
            call_virtual: info.call_virtual,
        },
    );
}

unsafe extern "C" fn host_classdb_unregister_extension_class(
    _library: *mut c_void,
    name: *const c_char,
) {
    let name = cstr(name);
    let mut host = host();
    host.extensions.remove(&name);
    host.classes.remove(&name);
}

unsafe extern "C" fn host_print_error(
    msg: *const c_char,
    _func: *const c_char,
    _file: *const c_char,
    _line: i32,
) {
    host().errors.push(cstr(msg));
}

// ---------------------------------------------------------------------------
// Symbol table
// ---------------------------------------------------------------------------

macro_rules! sym {
    ($name:literal, $requested:expr, $f:expr) => {
        if $requested == $name {
            return $f as usize as *mut c_void;
        }
    };
}

pub unsafe extern "C" fn host_get_proc(name: *const c_char) -> *mut c_void {
    let requested = cstr(name);
    let requested = requested.as_str();
    sym!("object_construct", requested, host_object_construct);
    sym!("object_destroy", requested, host_object_destroy);
    sym!("object_get_instance_id", requested, host_object_get_instance_id);
    sym!("object_set_instance", requested, host_object_set_instance);
    sym!("object_reference", requested, host_object_reference);
    sym!("object_unreference", requested, host_object_unreference);
    sym!("classdb_get_method_bind", requested, host_classdb_get_method_bind);
    sym!("method_bind_ptrcall", requested, host_method_bind_ptrcall);
    sym!("object_call", requested, host_object_call);
    sym!("variant_new_copy", requested, host_variant_new_copy);
    sym!("variant_destroy", requested, host_variant_destroy);
    sym!("variant_from_builtin", requested, host_variant_from_builtin);
    sym!("variant_to_builtin", requested, host_variant_to_builtin);
    sym!("string_new_utf8", requested, host_string_new_utf8);
    sym!("string_utf8_len", requested, host_string_utf8_len);
    sym!("string_copy_utf8", requested, host_string_copy_utf8);
    sym!("string_destroy", requested, host_string_destroy);
    sym!("string_name_new", requested, host_string_name_new);
    sym!("string_name_destroy", requested, host_string_name_destroy);
    sym!("node_path_destroy", requested, host_node_path_destroy);
    sym!("callable_destroy", requested, host_callable_destroy);
    sym!("signal_destroy", requested, host_signal_destroy);
    sym!("array_new", requested, host_array_new);
    sym!("array_size", requested, host_array_size);
    sym!("array_at", requested, host_array_at);
    sym!("array_push", requested, host_array_push);
    sym!("array_pop", requested, host_array_pop);
    sym!("array_destroy", requested, host_array_destroy);
    sym!("dictionary_new", requested, host_dictionary_new);
    sym!("dictionary_destroy", requested, host_dictionary_destroy);
    sym!("packed_byte_array_destroy", requested, host_packed_destroy);
    sym!("packed_int64_array_destroy", requested, host_packed_destroy);
    sym!("packed_float64_array_destroy", requested, host_packed_destroy);
    sym!("packed_string_array_destroy", requested, host_packed_destroy);
    sym!(
        "classdb_register_extension_class",
        requested,
        host_classdb_register_extension_class
    );
    sym!(
        "classdb_unregister_extension_class",
        requested,
        host_classdb_unregister_extension_class
    );
    sym!("print_error", requested, host_print_error);
    std::ptr::null_mut()
}

/// A host missing one required symbol, for the ABI-mismatch path.
pub unsafe extern "C" fn truncated_get_proc(name: *const c_char) -> *mut c_void {
    if cstr(name) == "array_pop" {
        return std::ptr::null_mut();
    }
    unsafe { host_get_proc(name) }
}

// ---------------------------------------------------------------------------
// Test-side helpers
// ---------------------------------------------------------------------------

static TEST_LOCK: Mutex<()> = Mutex::new(());
static INIT: OnceLock<()> = OnceLock::new();

/// Loads the runtime against the mock host once per process, driving the
/// C entry and the level callbacks the way the engine would.
pub fn runtime() -> &'static Runtime {
    INIT.get_or_init(|| {
        let mut callbacks = InitCallbacks {
            userdata: std::ptr::null_mut(),
            initialize: None,
            deinitialize: None,
            minimum_level: 0,
        };
        let loaded = unsafe {
            extension_runtime_entry(host_get_proc, 1usize as *mut c_void, &mut callbacks)
        };
        assert_eq!(loaded, 1, "mock host must satisfy the ABI surface");
        let initialize = callbacks.initialize.expect("initialize callback");
        for level in [InitLevel::Core, InitLevel::Servers, InitLevel::Scene] {
            unsafe { initialize(callbacks.userdata, level.into()) };
        }

        let rt = Runtime::global().expect("runtime installed");
        for (name, parent, refcounted) in [
            ("Object", "", false),
            ("Node", "Object", false),
            ("RefCounted", "Object", true),
            ("DirAccess", "RefCounted", true),
            ("ItemList", "Object", false),
        ] {
            rt.classes
                .register_engine_class(name, parent, refcounted)
                .expect("seed engine class");
        }
    });
    Runtime::global().expect("runtime installed")
}

/// Serializes a test against the shared runtime and binds the release
/// thread to the current test thread.
pub fn locked() -> (MutexGuard<'static, ()>, &'static Runtime) {
    let guard = TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let rt = runtime();
    rt.table.bind_release_thread();
    (guard, rt)
}

/// Asks the host to instantiate an extension class, exactly as the engine
/// would: through the registered creation callback.
pub fn create_extension_instance(class: &str) -> (EnginePtr, *mut c_void) {
    let (create, userdata) = {
        let host = host();
        let extension = host.extensions.get(class).expect("registered class");
        (extension.create, extension.userdata)
    };
    let object = unsafe { create(userdata as *mut c_void) };
    assert!(!object.is_null(), "instance creation failed");
    let instance = host()
        .objects
        .get(&(object as u64))
        .and_then(|o| o.instance)
        .expect("instance binding");
    (EnginePtr::from_mut(object), instance as *mut c_void)
}

/// Invokes a virtual method through the registered dispatch entry.
pub fn invoke_virtual(
    class: &str,
    instance: *mut c_void,
    method: &str,
    args: &[*const c_void],
    ret: *mut c_void,
) {
    let dispatch = {
        let host = host();
        host.extensions.get(class).expect("registered class").call_virtual
    };
    unsafe { dispatch(instance, method_tag(method), args.as_ptr(), ret) };
}

pub fn set_parent(child: EnginePtr, parent: EnginePtr) {
    if let Some(object) = host().objects.get_mut(&(child.as_mut_ptr() as u64)) {
        object.parent = Some(parent.as_mut_ptr() as u64);
    }
}

pub fn refcount_of(obj: &Obj) -> u32 {
    host()
        .objects
        .get(&obj.instance_id().to_raw())
        .and_then(|object| object.refcount)
        .unwrap_or(0)
}

pub fn object_alive(id: u64) -> bool {
    host().objects.contains_key(&id)
}

pub fn destroy_calls(kind: &'static str, handle: u64) -> usize {
    host()
        .destroy_calls
        .iter()
        .filter(|(k, h)| *k == kind && *h == handle)
        .count()
}

/// Constructs an engine object directly, as a stub for an engine
/// constructor call, and adopts it under the transferred-to-client policy.
pub fn construct_object(rt: &Runtime, class: &str) -> Obj {
    let class_c = CString::new(class).unwrap();
    let ptr = unsafe { (rt.interface.object_construct)(class_c.as_ptr()) };
    let refcounted = rt.classes.is_refcounted(class).unwrap_or(false);
    rt.objects
        .adopt(
            EnginePtr::from_mut(ptr),
            refcounted,
            Ownership::TransferredToClient,
        )
        .expect("adopt constructed object")
        .expect("non-null object")
}
