//! Extension class runtime.
//!
//! Registers client-defined classes with the engine and dispatches engine
//! callbacks into them. Virtual methods are stored per class in a table
//! indexed by the method name interned to a 64-bit tag at registration
//! time; the engine invokes a single dispatch entry with that tag.

use crate::core::error::{ExtResult, ExtensionError};
use crate::core::init::{InitLevel, Runtime};
use crate::core::interface::ClassCreationInfo;
use crate::types::engine_ptr::EnginePtr;
use crate::types::enums::{PropertyUsage, VariantKind};
use crate::types::variant::{RawVariant, Variant};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::cell::RefCell;
use std::ffi::{CString, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};
use xxhash_rust::xxh64::xxh64;

/// Interned form of an engine-internal method name.
pub type MethodTag = u64;

/// Interns a virtual method name. Registration and dispatch agree on this
/// function, so the engine-side caller can precompute tags.
pub fn method_tag(name: &str) -> MethodTag {
    xxh64(name.as_bytes(), 0)
}

type Factory = Box<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>;
type VirtualImpl = Box<dyn Fn(&mut (dyn Any + Send), &mut VirtualCall) + Send + Sync>;

struct VirtualEntry {
    name: String,
    func: VirtualImpl,
}

/// Property metadata registered alongside a class; mechanical (name, type
/// tag, usage, default) with no behavior of its own.
#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub name: String,
    pub kind: VariantKind,
    pub usage: PropertyUsage,
    pub default: RawVariant,
}

pub(crate) struct ClassBinding {
    pub(crate) name: String,
    pub(crate) parent: String,
    pub(crate) init_level: InitLevel,
    factory: Factory,
    virtuals: FxHashMap<MethodTag, VirtualEntry>,
    pub(crate) properties: Vec<PropertyDef>,
}

/// Per-class metadata: name, parent, refcount discipline and, for
/// extension classes, the virtual table binding.
pub struct ClassDescriptor {
    pub name: String,
    pub parent: String,
    pub refcounted: bool,
    pub(crate) binding: Option<Arc<ClassBinding>>,
}

/// The class table. Engine classes are seeded during initialization;
/// extension classes are added through [`ClassBuilder`] and pushed to the
/// engine when their init level runs. Read-only afterwards.
pub struct ClassRegistry {
    classes: RwLock<FxHashMap<String, ClassDescriptor>>,
    pending: RwLock<Vec<String>>,
    registered: RwLock<Vec<String>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        ClassRegistry {
            classes: RwLock::new(FxHashMap::default()),
            pending: RwLock::new(Vec::new()),
            registered: RwLock::new(Vec::new()),
        }
    }

    /// Seeds a descriptor for an engine-defined class. Generated code
    /// calls this once per known class at startup.
    pub fn register_engine_class(
        &self,
        name: &str,
        parent: &str,
        refcounted: bool,
    ) -> ExtResult<()> {
        let mut classes = self.classes.write().map_err(|_| ExtensionError::MutexPoisoned)?;
        if classes.contains_key(name) {
            return Err(ExtensionError::ClassAlreadyRegistered {
                name: name.to_string(),
            });
        }
        classes.insert(
            name.to_string(),
            ClassDescriptor {
                name: name.to_string(),
                parent: parent.to_string(),
                refcounted,
                binding: None,
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes
            .read()
            .map(|classes| classes.contains_key(name))
            .unwrap_or(false)
    }

    pub fn is_refcounted(&self, name: &str) -> Option<bool> {
        self.classes
            .read()
            .ok()?
            .get(name)
            .map(|descriptor| descriptor.refcounted)
    }

    pub fn parent_of(&self, name: &str) -> Option<String> {
        self.classes
            .read()
            .ok()?
            .get(name)
            .map(|descriptor| descriptor.parent.clone())
    }

    pub(crate) fn register_extension(&self, binding: ClassBinding) -> ExtResult<()> {
        let refcounted = self.is_refcounted(&binding.parent).ok_or_else(|| {
            ExtensionError::ClassNotRegistered {
                name: binding.parent.clone(),
            }
        })?;
        let mut classes = self.classes.write().map_err(|_| ExtensionError::MutexPoisoned)?;
        if classes.contains_key(&binding.name) {
            return Err(ExtensionError::ClassAlreadyRegistered {
                name: binding.name.clone(),
            });
        }
        let name = binding.name.clone();
        let parent = binding.parent.clone();
        classes.insert(
            name.clone(),
            ClassDescriptor {
                name: name.clone(),
                parent,
                refcounted,
                binding: Some(Arc::new(binding)),
            },
        );
        drop(classes);
        if let Ok(mut pending) = self.pending.write() {
            pending.push(name);
        }
        Ok(())
    }

    /// Pushes every pending extension class whose init level is `level`
    /// to the engine.
    pub(crate) fn flush_pending(&self, rt: &Runtime, level: InitLevel) {
        let due: Vec<String> = {
            let Ok(mut pending) = self.pending.write() else {
                return;
            };
            let mut due = Vec::new();
            pending.retain(|name| {
                let matches = self
                    .binding_of(name)
                    .map(|binding| binding.init_level == level)
                    .unwrap_or(false);
                if matches {
                    due.push(name.clone());
                }
                !matches
            });
            due
        };
        for name in due {
            if let Some(binding) = self.binding_of(&name) {
                self.register_with_engine(rt, &binding);
                if let Ok(mut registered) = self.registered.write() {
                    registered.push(name);
                }
            }
        }
    }

    /// Unregisters this level's extension classes from the engine, in
    /// reverse registration order.
    pub(crate) fn unregister_level(&self, rt: &Runtime, level: InitLevel) {
        let Ok(mut registered) = self.registered.write() else {
            return;
        };
        let mut keep = Vec::new();
        for name in registered.drain(..).rev() {
            let Some(binding) = self.binding_of(&name) else {
                continue;
            };
            if binding.init_level != level {
                keep.push(name);
                continue;
            }
            let Ok(name_c) = CString::new(binding.name.clone()) else {
                continue;
            };
            unsafe {
                (rt.interface.classdb_unregister_extension_class)(
                    rt.library().as_mut_ptr(),
                    name_c.as_ptr(),
                );
                // Reclaims the strong count handed out as class userdata.
                Arc::decrement_strong_count(Arc::as_ptr(&binding));
            }
        }
        keep.reverse();
        *registered = keep;
    }

    /// Registered property metadata of an extension class.
    pub fn properties_of(&self, name: &str) -> Vec<PropertyDef> {
        self.binding_of(name)
            .map(|binding| binding.properties.clone())
            .unwrap_or_default()
    }

    fn binding_of(&self, name: &str) -> Option<Arc<ClassBinding>> {
        self.classes
            .read()
            .ok()?
            .get(name)
            .and_then(|descriptor| descriptor.binding.clone())
    }

    fn register_with_engine(&self, rt: &Runtime, binding: &Arc<ClassBinding>) {
        let (Ok(name_c), Ok(parent_c)) = (
            CString::new(binding.name.clone()),
            CString::new(binding.parent.clone()),
        ) else {
            return;
        };
        let info = ClassCreationInfo {
            class_userdata: Arc::into_raw(Arc::clone(binding)) as *mut c_void,
            create_instance,
            free_instance,
            call_virtual,
        };
        unsafe {
            (rt.interface.classdb_register_extension_class)(
                rt.library().as_mut_ptr(),
                name_c.as_ptr(),
                parent_c.as_ptr(),
                &info,
            );
        }
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Client-side state the engine holds for one extension instance,
/// allocated by `create_instance` and reclaimed by `free_instance`.
struct InstanceState {
    binding: Arc<ClassBinding>,
    object: EnginePtr,
    state: RefCell<Box<dyn Any + Send>>,
}

unsafe fn binding_from_userdata(userdata: *mut c_void) -> Arc<ClassBinding> {
    let ptr = userdata as *const ClassBinding;
    unsafe {
        Arc::increment_strong_count(ptr);
        Arc::from_raw(ptr)
    }
}

unsafe extern "C" fn create_instance(class_userdata: *mut c_void) -> *mut c_void {
    let Some(rt) = Runtime::global() else {
        return std::ptr::null_mut();
    };
    let binding = unsafe { binding_from_userdata(class_userdata) };
    let (Ok(name_c), Ok(parent_c)) = (
        CString::new(binding.name.clone()),
        CString::new(binding.parent.clone()),
    ) else {
        return std::ptr::null_mut();
    };
    let object = unsafe { (rt.interface.object_construct)(parent_c.as_ptr()) };
    if object.is_null() {
        return std::ptr::null_mut();
    }
    let state = match catch_unwind(AssertUnwindSafe(|| (binding.factory)())) {
        Ok(state) => state,
        Err(_) => {
            rt.interface
                .report_error("extension class factory panicked", &binding.name);
            unsafe { (rt.interface.object_destroy)(object) };
            return std::ptr::null_mut();
        }
    };
    let instance = Box::into_raw(Box::new(InstanceState {
        binding,
        object: EnginePtr::from_mut(object),
        state: RefCell::new(state),
    }));
    unsafe {
        (rt.interface.object_set_instance)(object, name_c.as_ptr(), instance as *mut c_void);
    }
    object
}

unsafe extern "C" fn free_instance(_class_userdata: *mut c_void, instance: *mut c_void) {
    if instance.is_null() {
        return;
    }
    drop(unsafe { Box::from_raw(instance as *mut InstanceState) });
}

unsafe extern "C" fn call_virtual(
    instance: *mut c_void,
    method_tag: u64,
    args: *const *const c_void,
    ret: *mut c_void,
) {
    if instance.is_null() {
        return;
    }
    let state = unsafe { &*(instance as *const InstanceState) };
    // No trampoline for this tag: the zeroed return slot is the engine's
    // default behavior.
    let Some(entry) = state.binding.virtuals.get(&method_tag) else {
        return;
    };
    let mut call = VirtualCall {
        args,
        ret,
        this: state.object,
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let mut client_state = state.state.borrow_mut();
        (entry.func)(client_state.as_mut(), &mut call);
    }));
    if outcome.is_err() {
        if let Some(rt) = Runtime::global() {
            rt.interface.report_error(
                &format!(
                    "unhandled client error in virtual '{}' of '{}'",
                    entry.name, state.binding.name
                ),
                &entry.name,
            );
        }
    }
}

/// View over the engine-provided argument slots and return slot of one
/// virtual invocation. Accessors read the exact ABI types the method
/// signature declares; the engine guarantees slot validity for the
/// method's arity.
pub struct VirtualCall {
    args: *const *const c_void,
    ret: *mut c_void,
    this: EnginePtr,
}

impl VirtualCall {
    /// The engine object this instance extends; the receiver for engine
    /// calls made from inside the implementation.
    pub fn this_object(&self) -> EnginePtr {
        self.this
    }

    fn arg_slot(&self, index: usize) -> *const c_void {
        unsafe { *self.args.add(index) }
    }

    pub fn arg_bool(&self, index: usize) -> bool {
        unsafe { *self.arg_slot(index).cast::<u8>() != 0 }
    }

    pub fn arg_i64(&self, index: usize) -> i64 {
        unsafe { *self.arg_slot(index).cast::<i64>() }
    }

    pub fn arg_f64(&self, index: usize) -> f64 {
        unsafe { *self.arg_slot(index).cast::<f64>() }
    }

    pub fn arg_object(&self, index: usize) -> EnginePtr {
        EnginePtr::from_mut(unsafe { *self.arg_slot(index).cast::<*mut c_void>() })
    }

    /// Copies the borrowed variant in slot `index`; pin it through
    /// [`Variant::from_raw_copy`] if it must outlive the call.
    pub fn arg_variant(&self, index: usize) -> RawVariant {
        unsafe { *self.arg_slot(index).cast::<RawVariant>() }
    }

    pub fn set_return_bool(&mut self, value: bool) {
        self.write_return(value as u8)
    }

    pub fn set_return_i64(&mut self, value: i64) {
        self.write_return(value)
    }

    pub fn set_return_f64(&mut self, value: f64) {
        self.write_return(value)
    }

    pub fn set_return_object(&mut self, ptr: EnginePtr) {
        self.write_return(ptr.as_mut_ptr())
    }

    /// Writes a variant result, transferring its ownership to the engine:
    /// the pin is ended without a destructor because the engine now owns
    /// the payload.
    pub fn set_return_variant(&mut self, rt: &Runtime, value: Variant) -> ExtResult<()> {
        let raw = value.into_engine(rt)?;
        self.write_return(raw);
        Ok(())
    }

    fn write_return<T>(&mut self, value: T) {
        assert!(!self.ret.is_null(), "virtual call has no return slot");
        unsafe { self.ret.cast::<T>().write(value) }
    }
}

/// Fluent registration of an extension class, in the style of the rest of
/// the builder surface: name and parent up front, then behaviors, then
/// `register()`.
pub struct ClassBuilder<'r> {
    runtime: &'r Runtime,
    name: String,
    parent: String,
    init_level: InitLevel,
    factory: Option<Factory>,
    virtuals: FxHashMap<MethodTag, VirtualEntry>,
    properties: Vec<PropertyDef>,
}

impl<'r> ClassBuilder<'r> {
    pub(crate) fn new(runtime: &'r Runtime, name: &str, parent: &str) -> Self {
        ClassBuilder {
            runtime,
            name: name.to_string(),
            parent: parent.to_string(),
            init_level: InitLevel::Scene,
            factory: None,
            virtuals: FxHashMap::default(),
            properties: Vec::new(),
        }
    }

    /// Produces a fresh client-side instance value when the engine
    /// instantiates the class.
    pub fn factory<S, F>(mut self, factory: F) -> Self
    where
        S: Any + Send,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.factory = Some(Box::new(move || Box::new(factory())));
        self
    }

    /// Registers a virtual method implementation keyed by the engine
    /// method name.
    pub fn virtual_method<F>(mut self, name: &str, func: F) -> Self
    where
        F: Fn(&mut (dyn Any + Send), &mut VirtualCall) + Send + Sync + 'static,
    {
        self.virtuals.insert(
            method_tag(name),
            VirtualEntry {
                name: name.to_string(),
                func: Box::new(func),
            },
        );
        self
    }

    pub fn property(self, name: &str, kind: VariantKind, usage: PropertyUsage) -> Self {
        self.property_with_default(name, kind, usage, RawVariant::nil())
    }

    pub fn property_with_default(
        mut self,
        name: &str,
        kind: VariantKind,
        usage: PropertyUsage,
        default: RawVariant,
    ) -> Self {
        self.properties.push(PropertyDef {
            name: name.to_string(),
            kind,
            usage,
            default,
        });
        self
    }

    /// Classes register with the engine at the scene phase unless marked
    /// otherwise.
    pub fn init_level(mut self, level: InitLevel) -> Self {
        self.init_level = level;
        self
    }

    pub fn register(self) -> ExtResult<()> {
        let factory = self.factory.ok_or_else(|| ExtensionError::MissingFactory {
            name: self.name.clone(),
        })?;
        let level = self.init_level;
        self.runtime.classes.register_extension(ClassBinding {
            name: self.name,
            parent: self.parent,
            init_level: level,
            factory,
            virtuals: self.virtuals,
            properties: self.properties,
        })?;
        // If the engine already ran this level, push the class now rather
        // than waiting for an initialize that will not come again.
        if self
            .runtime
            .current_level()
            .is_some_and(|current| current >= level)
        {
            self.runtime.classes.flush_pending(self.runtime, level);
        }
        Ok(())
    }
}
