//! Object registry and ownership transfer.
//!
//! Maps engine object identity to the client wrapper currently
//! representing it and applies one of the four ownership-transfer policies
//! at every point an engine function returns or receives an object
//! pointer. The identity map lives inside the handle table's mutex so the
//! two components share one lock.

use crate::core::error::{ExtResult, ExtensionError};
use crate::core::interface::ObjectOps;
use crate::core::tracker::HandleTable;
use crate::types::engine_ptr::EnginePtr;
use std::cell::Cell;
use std::num::NonZeroU64;
use std::sync::{Arc, Mutex};

/// Engine-assigned 64-bit instance identifier. The zero wire value means
/// "no object" and never constructs an `InstanceId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(NonZeroU64);

impl InstanceId {
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(InstanceId)
    }

    pub fn to_raw(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The four ownership-transfer policies applied at object-pointer
/// boundaries.
///
/// The first three govern returned pointers; `TransferredToEngine` is the
/// argument-side policy and is applied through [`Obj::transfer_to_engine`]
/// rather than [`ObjectRegistry::adopt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Engine created or retained the object for us; we must eventually
    /// release it. No extra increment for refcounted types.
    TransferredToClient,
    /// Engine loans us a pointer bound to some scope; the wrapper is
    /// non-owning and must not outlive that scope.
    RetainedByEngine,
    /// The object must already have a wrapper; a miss is a
    /// `MissingWrapper` error.
    AssertExisting,
    /// We pass an object we own and the engine takes ownership.
    TransferredToEngine,
}

pub(crate) struct ObjectEntry {
    pub(crate) ptr: EnginePtr,
    pub(crate) refcounted: bool,
    pub(crate) wrappers: u32,
}

struct DeferredDrop {
    id: InstanceId,
    ptr: EnginePtr,
    owning: bool,
}

/// Identity map plus the refcount discipline around it.
pub struct ObjectRegistry {
    table: Arc<HandleTable>,
    ops: ObjectOps,
    deferred: Mutex<Vec<DeferredDrop>>,
}

impl ObjectRegistry {
    pub fn new(table: Arc<HandleTable>, ops: ObjectOps) -> Self {
        ObjectRegistry {
            table,
            ops,
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Turns an engine-returned object pointer into a wrapper under the
    /// given policy. A nil pointer (or a zero instance id) maps to `None`
    /// under every policy and creates nothing.
    pub fn adopt(
        self: &Arc<Self>,
        ptr: EnginePtr,
        refcounted: bool,
        policy: Ownership,
    ) -> ExtResult<Option<Obj>> {
        if ptr.is_null() {
            return Ok(None);
        }
        let raw_id = unsafe { (self.ops.instance_id)(ptr.as_mut_ptr()) };
        let Some(id) = InstanceId::from_raw(raw_id) else {
            return Ok(None);
        };

        let mut state = self.table.guard()?;
        let owning = match policy {
            // The engine handed us a reference (transferred) or a loan
            // (retained); either way the identity de-duplicates onto the
            // existing entry when one is mapped.
            Ownership::TransferredToClient | Ownership::RetainedByEngine => {
                state
                    .objects
                    .entry(id)
                    .and_modify(|entry| entry.wrappers += 1)
                    .or_insert_with(|| ObjectEntry {
                        ptr,
                        refcounted,
                        wrappers: 1,
                    });
                policy == Ownership::TransferredToClient
            }
            Ownership::AssertExisting => match state.objects.get_mut(&id) {
                Some(entry) => {
                    entry.wrappers += 1;
                    false
                }
                None => {
                    return Err(ExtensionError::MissingWrapper {
                        instance_id: raw_id,
                    });
                }
            },
            Ownership::TransferredToEngine => {
                // Argument-side policy; no returned pointer carries it.
                debug_assert!(false, "TransferredToEngine is not a return policy");
                return Err(ExtensionError::NullPointer);
            }
        };
        drop(state);

        Ok(Some(Obj {
            id,
            ptr,
            owning: Cell::new(owning),
            registry: Arc::clone(self),
        }))
    }

    /// Looks up the current wrapper for an identity, minting a non-owning
    /// wrapper when present.
    pub fn get(self: &Arc<Self>, id: InstanceId) -> Option<Obj> {
        let mut state = self.table.guard().ok()?;
        let entry = state.objects.get_mut(&id)?;
        entry.wrappers += 1;
        let ptr = entry.ptr;
        drop(state);
        Some(Obj {
            id,
            ptr,
            owning: Cell::new(false),
            registry: Arc::clone(self),
        })
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.table
            .guard()
            .map(|state| state.objects.contains_key(&id))
            .unwrap_or(false)
    }

    /// Number of live wrappers for an identity. Zero once the last wrapper
    /// died and the entry was dropped.
    pub fn wrapper_count(&self, id: InstanceId) -> u32 {
        self.table
            .guard()
            .ok()
            .and_then(|state| state.objects.get(&id).map(|entry| entry.wrappers))
            .unwrap_or(0)
    }

    fn clone_wrapper(&self, id: InstanceId, ptr: EnginePtr, owning: bool) {
        if let Ok(mut state) = self.table.guard() {
            let refcounted = match state.objects.get_mut(&id) {
                Some(entry) => {
                    entry.wrappers += 1;
                    entry.refcounted
                }
                None => return,
            };
            if owning && refcounted {
                unsafe { (self.ops.reference)(ptr.as_mut_ptr()) };
            }
        }
    }

    fn drop_wrapper(&self, id: InstanceId, ptr: EnginePtr, owning: bool) {
        if !self.table.on_release_thread() {
            if let Ok(mut queue) = self.deferred.lock() {
                queue.push(DeferredDrop { id, ptr, owning });
                log::debug!("deferred wrapper release of instance {id}");
                return;
            }
        }
        self.drop_wrapper_inline(id, ptr, owning);
    }

    fn drop_wrapper_inline(&self, id: InstanceId, ptr: EnginePtr, owning: bool) {
        let mut destroy = false;
        if let Ok(mut state) = self.table.guard() {
            let Some(entry) = state.objects.get_mut(&id) else {
                return;
            };
            entry.wrappers -= 1;
            if owning && entry.refcounted {
                let remaining = unsafe { (self.ops.unreference)(ptr.as_mut_ptr()) };
                destroy = remaining == 0;
            }
            if entry.wrappers == 0 {
                state.objects.remove(&id);
            }
        }
        if destroy {
            unsafe { (self.ops.destroy)(ptr.as_mut_ptr()) };
        }
    }

    /// Sweeps wrapper drops that happened off the release thread.
    pub fn cycle(&self) -> usize {
        let drained: Vec<DeferredDrop> = match self.deferred.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => return 0,
        };
        let count = drained.len();
        for pending in drained {
            self.drop_wrapper_inline(pending.id, pending.ptr, pending.owning);
        }
        count
    }
}

/// Client wrapper for one engine object. Cheap to copy; a clone shares the
/// engine object and, for owning refcounted wrappers, takes one engine
/// reference of its own. Equality is identity equality.
pub struct Obj {
    id: InstanceId,
    ptr: EnginePtr,
    owning: Cell<bool>,
    registry: Arc<ObjectRegistry>,
}

impl Obj {
    pub fn instance_id(&self) -> InstanceId {
        self.id
    }

    pub fn raw(&self) -> EnginePtr {
        self.ptr
    }

    pub fn is_owning(&self) -> bool {
        self.owning.get()
    }

    /// Applies the argument-side `TransferredToEngine` policy: the engine
    /// takes the reference this wrapper owned, our decrement is
    /// suppressed, and a later drop of the wrapper is a no-op.
    pub fn transfer_to_engine(&self) {
        self.owning.set(false);
    }

    /// Explicitly destroys a manually-managed object. Refcounted objects
    /// are released by wrapper death instead.
    pub fn free(self) -> ExtResult<()> {
        {
            let mut state = self.registry.table.guard()?;
            if state
                .objects
                .get(&self.id)
                .is_some_and(|entry| entry.refcounted)
            {
                return Ok(());
            }
            state.objects.remove(&self.id);
        }
        unsafe { (self.registry.ops.destroy)(self.ptr.as_mut_ptr()) };
        // The entry is gone, so the wrapper's own drop is a no-op.
        Ok(())
    }
}

impl Clone for Obj {
    fn clone(&self) -> Self {
        self.registry
            .clone_wrapper(self.id, self.ptr, self.owning.get());
        Obj {
            id: self.id,
            ptr: self.ptr,
            owning: Cell::new(self.owning.get()),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl Drop for Obj {
    fn drop(&mut self) {
        self.registry
            .drop_wrapper(self.id, self.ptr, self.owning.get());
    }
}

impl PartialEq for Obj {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Obj {}

impl std::fmt::Debug for Obj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Obj")
            .field("id", &self.id)
            .field("owning", &self.owning.get())
            .finish()
    }
}
