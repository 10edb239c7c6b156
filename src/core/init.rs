//! Library entry point, initialization levels and the runtime context.
//!
//! The engine loads the library and calls the exported entry with its
//! get-proc-address function, an opaque library token and an out-struct to
//! fill with level callbacks. Initialization phases run in fixed order
//! (core, servers, scene, editor); extension classes reach the engine at
//! the scene phase unless marked otherwise.

use crate::core::class_db::{ClassBuilder, ClassRegistry};
use crate::core::error::ExtResult;
use crate::core::interface::{ExtensionInterface, GetProcAddressFn};
use crate::core::registry::ObjectRegistry;
use crate::core::tracker::HandleTable;
use crate::types::engine_ptr::EnginePtr;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::ffi::c_void;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u32)]
pub enum InitLevel {
    Core = 0,
    Servers,
    Scene,
    Editor,
}

/// Callbacks written into the engine's out parameter at load.
#[repr(C)]
pub struct InitCallbacks {
    pub userdata: *mut c_void,
    pub initialize: Option<unsafe extern "C" fn(userdata: *mut c_void, level: u32)>,
    pub deinitialize: Option<unsafe extern "C" fn(userdata: *mut c_void, level: u32)>,
    pub minimum_level: u32,
}

/// The top-level context: ABI surface, tracker, object registry and class
/// table. One designated process-wide instance covers the common case;
/// everything on it is also usable as an explicit value.
pub struct Runtime {
    pub interface: ExtensionInterface,
    pub table: Arc<HandleTable>,
    pub objects: Arc<ObjectRegistry>,
    pub classes: ClassRegistry,
    library: EnginePtr,
    level: AtomicI32,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

impl Runtime {
    /// Resolves the ABI surface and installs the process-wide runtime.
    /// Fails without side effects on an ABI mismatch. Loading twice keeps
    /// the first runtime and logs.
    pub fn load(get_proc: GetProcAddressFn, library: *mut c_void) -> ExtResult<&'static Runtime> {
        let interface = ExtensionInterface::load(get_proc)?;
        let table = Arc::new(HandleTable::new());
        table.set_destroy_table(interface.destroy_table());
        let objects = Arc::new(ObjectRegistry::new(Arc::clone(&table), interface.object_ops()));
        let runtime = Runtime {
            interface,
            table,
            objects,
            classes: ClassRegistry::new(),
            library: EnginePtr::from_mut(library),
            level: AtomicI32::new(-1),
        };
        if RUNTIME.set(runtime).is_err() {
            log::warn!("runtime already loaded; keeping the existing instance");
        }
        Ok(RUNTIME.get().expect("runtime installed"))
    }

    pub fn global() -> Option<&'static Runtime> {
        RUNTIME.get()
    }

    pub fn library(&self) -> EnginePtr {
        self.library
    }

    pub fn current_level(&self) -> Option<InitLevel> {
        let raw = self.level.load(Ordering::Acquire);
        if raw < 0 {
            return None;
        }
        InitLevel::try_from(raw as u32).ok()
    }

    /// Runs one initialization phase: records the level and pushes the
    /// extension classes registered for it to the engine.
    pub fn initialize(&self, level: InitLevel) {
        self.level.store(u32::from(level) as i32, Ordering::Release);
        self.classes.flush_pending(self, level);
    }

    /// Runs one deinitialization phase, unregistering this level's
    /// extension classes.
    pub fn deinitialize(&self, level: InitLevel) {
        self.classes.unregister_level(self, level);
        self.level
            .store(u32::from(level) as i32 - 1, Ordering::Release);
    }

    /// Starts declaring an extension class with the given engine parent.
    pub fn extension_class<'r>(&'r self, name: &str, parent: &str) -> ClassBuilder<'r> {
        ClassBuilder::new(self, name, parent)
    }

    /// Periodic maintenance: sweeps pin and wrapper releases deferred from
    /// threads the engine does not accept calls from. Returns the number
    /// of entries swept.
    pub fn cycle(&self) -> usize {
        self.table.cycle() + self.objects.cycle()
    }
}

unsafe extern "C" fn entry_initialize(_userdata: *mut c_void, level: u32) {
    if let (Some(rt), Ok(level)) = (Runtime::global(), InitLevel::try_from(level)) {
        rt.initialize(level);
    }
}

unsafe extern "C" fn entry_deinitialize(_userdata: *mut c_void, level: u32) {
    if let (Some(rt), Ok(level)) = (Runtime::global(), InitLevel::try_from(level)) {
        rt.deinitialize(level);
    }
}

/// Exported entry the engine invokes at load. Returns 1 on success; on an
/// ABI mismatch nothing is loaded and 0 tells the engine to abort.
///
/// # Safety
/// `get_proc` must be the engine's symbol-lookup entry and `callbacks`
/// must point to a writable callback struct.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn extension_runtime_entry(
    get_proc: GetProcAddressFn,
    library: *mut c_void,
    callbacks: *mut InitCallbacks,
) -> u8 {
    match Runtime::load(get_proc, library) {
        Ok(_) => {
            unsafe {
                *callbacks = InitCallbacks {
                    userdata: std::ptr::null_mut(),
                    initialize: Some(entry_initialize),
                    deinitialize: Some(entry_deinitialize),
                    minimum_level: InitLevel::Core.into(),
                };
            }
            1
        }
        Err(err) => {
            log::error!("extension load aborted: {err}");
            0
        }
    }
}
