//! Pointer lifetime tracker.
//!
//! Owns every handle the client holds to engine-allocated memory and
//! guarantees, in priority order: no double-free, no use-after-free, no
//! leak in the common case, and tolerable behavior when wrapper drops run
//! on threads the engine does not accept calls from.
//!
//! Pins live in slab storage whose addresses never move, so `get` runs
//! without the table lock: it validates the lease's generation with
//! acquire loads, reads the bits, and re-validates. Insert and destroy
//! serialize through a single mutex.

use crate::core::error::{ExtResult, ExtensionError};
use crate::core::interface::DestroyTable;
use crate::core::registry::{InstanceId, ObjectEntry};
use crate::types::enums::HandleKind;
use rustc_hash::FxHashMap;
use std::cell::{RefCell, UnsafeCell};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

/// Raw handle bits as the engine sees them: one to three machine words
/// depending on the type; unused words are zero.
pub type RawBits = [u64; 3];

const SLAB_SIZE: usize = 256;
const MAX_SLABS: usize = 1024;

/// Client-side handle to a pin. Small, `Copy`, and safe to hold after the
/// pin dies: the generation counter detects stale access without a table
/// lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lease {
    index: u32,
    generation: u32,
    kind: HandleKind,
}

impl Lease {
    pub fn kind(&self) -> HandleKind {
        self.kind
    }
}

/// How the tracker reacts to lifetime violations. `Fatal` surfaces every
/// violation as an error the caller must not swallow; `Tolerate` degrades
/// to logging where a degraded answer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tolerance {
    Fatal,
    Tolerate,
}

struct Slot {
    /// Bumped when the slot is recycled, never on destroy, so a destroyed
    /// pin stays diagnosable until its slot is reused.
    generation: AtomicU32,
    live: AtomicBool,
    // The fields below change only under the table mutex and only between
    // generation bumps; lock-free readers re-check the generation after
    // reading them.
    kind: UnsafeCell<HandleKind>,
    alias: UnsafeCell<bool>,
    bits: UnsafeCell<RawBits>,
    children: UnsafeCell<Vec<Lease>>,
}

// Payload fields are guarded by the generation/live protocol above.
unsafe impl Sync for Slot {}

impl Slot {
    fn new() -> Self {
        Slot {
            generation: AtomicU32::new(0),
            live: AtomicBool::new(false),
            kind: UnsafeCell::new(HandleKind::Variant),
            alias: UnsafeCell::new(false),
            bits: UnsafeCell::new([0; 3]),
            children: UnsafeCell::new(Vec::new()),
        }
    }
}

pub(crate) struct TableState {
    /// Live pins by identity; enforces the one-live-pin-per-bits rule.
    index: FxHashMap<(HandleKind, RawBits), u32>,
    free: Vec<u32>,
    next_index: u32,
    destroy: Option<DestroyTable>,
    /// Object identity map; the registry shares this lock (see
    /// `core::registry`).
    pub(crate) objects: FxHashMap<InstanceId, ObjectEntry>,
}

/// The process-wide pin table.
pub struct HandleTable {
    state: Mutex<TableState>,
    slabs: Box<[AtomicPtr<Slot>]>,
    slab_count: AtomicUsize,
    live: AtomicUsize,
    tolerant: AtomicBool,
    release_thread: Mutex<Option<ThreadId>>,
    deferred: Mutex<Vec<Lease>>,
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            state: Mutex::new(TableState {
                index: FxHashMap::default(),
                free: Vec::new(),
                next_index: 0,
                destroy: None,
                objects: FxHashMap::default(),
            }),
            slabs: (0..MAX_SLABS)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
            slab_count: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            tolerant: AtomicBool::new(false),
            release_thread: Mutex::new(None),
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Installs the engine destructors used when owned pins are released.
    /// Until this is set (and in unit tests) releases skip the engine call.
    pub fn set_destroy_table(&self, table: DestroyTable) {
        if let Ok(mut state) = self.state.lock() {
            state.destroy = Some(table);
        }
    }

    pub fn set_tolerance(&self, tolerance: Tolerance) {
        self.tolerant
            .store(tolerance == Tolerance::Tolerate, Ordering::Relaxed);
    }

    fn is_tolerant(&self) -> bool {
        self.tolerant.load(Ordering::Relaxed)
    }

    /// Declares the calling thread as the only one allowed to emit engine
    /// destroy calls. Wrapper drops on other threads defer to [`cycle`].
    ///
    /// [`cycle`]: HandleTable::cycle
    pub fn bind_release_thread(&self) {
        if let Ok(mut slot) = self.release_thread.lock() {
            *slot = Some(thread::current().id());
        }
    }

    pub fn live_pins(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// True when the calling thread may emit engine destroy calls.
    pub(crate) fn on_release_thread(&self) -> bool {
        match self.release_thread.lock() {
            Ok(bound) => match *bound {
                Some(id) => id == thread::current().id(),
                None => true,
            },
            Err(_) => true,
        }
    }

    pub(crate) fn guard(&self) -> ExtResult<std::sync::MutexGuard<'_, TableState>> {
        Ok(self.state.lock()?)
    }

    fn slot(&self, index: u32) -> Option<&Slot> {
        let slab = index as usize / SLAB_SIZE;
        if slab >= self.slab_count.load(Ordering::Acquire) {
            return None;
        }
        let base = self.slabs[slab].load(Ordering::Acquire);
        debug_assert!(!base.is_null());
        Some(unsafe { &*base.add(index as usize % SLAB_SIZE) })
    }

    fn violation<T>(&self, err: ExtensionError) -> ExtResult<T> {
        if self.is_tolerant() {
            log::warn!("tolerated tracker violation: {err}");
        } else {
            log::error!("tracker violation: {err}");
        }
        Err(err)
    }

    fn alloc_index(&self, state: &mut TableState) -> u32 {
        if let Some(index) = state.free.pop() {
            return index;
        }
        let index = state.next_index;
        state.next_index += 1;
        let slab = index as usize / SLAB_SIZE;
        assert!(slab < MAX_SLABS, "handle table exhausted its slab budget");
        if slab == self.slab_count.load(Ordering::Acquire) {
            let storage: Box<[Slot]> = (0..SLAB_SIZE).map(|_| Slot::new()).collect();
            let base = Box::leak(storage).as_mut_ptr();
            self.slabs[slab].store(base, Ordering::Release);
            self.slab_count.store(slab + 1, Ordering::Release);
        }
        index
    }

    fn install(&self, state: &mut TableState, kind: HandleKind, bits: RawBits, alias: bool) -> Lease {
        let index = self.alloc_index(state);
        let slot = self.slot(index).expect("freshly allocated slot");
        let generation = slot.generation.fetch_add(1, Ordering::AcqRel) + 1;
        unsafe {
            *slot.kind.get() = kind;
            *slot.alias.get() = alias;
            *slot.bits.get() = bits;
            (*slot.children.get()).clear();
        }
        slot.live.store(true, Ordering::Release);
        state.index.insert((kind, bits), index);
        self.live.fetch_add(1, Ordering::Relaxed);
        Lease {
            index,
            generation,
            kind,
        }
    }

    /// Inserts a new owned pin for engine bits. At most one live pin may
    /// exist per `(kind, bits)`; rebinding without a destroy is a bug.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn pin(&self, kind: HandleKind, bits: RawBits) -> ExtResult<Lease> {
        let mut state = self.state.lock()?;
        if let Some(&existing) = state.index.get(&(kind, bits)) {
            if self.is_tolerant() {
                let slot = self.slot(existing).expect("indexed slot");
                let generation = slot.generation.load(Ordering::Acquire);
                log::warn!("tolerated duplicate pin of {kind:?}; reusing the live pin");
                return Ok(Lease {
                    index: existing,
                    generation,
                    kind,
                });
            }
            return self.violation(ExtensionError::DuplicatePin { kind, op: "pin" });
        }
        Ok(self.install(&mut state, kind, bits, false))
    }

    /// Inserts a child pin aliasing storage owned by `parent`. Releasing
    /// the parent invalidates the child without an engine destroy.
    pub fn pin_alias(&self, parent: Lease, kind: HandleKind, bits: RawBits) -> ExtResult<Lease> {
        let mut state = self.state.lock()?;
        let parent_slot = match self.slot(parent.index) {
            Some(slot) => slot,
            None => {
                return self.violation(ExtensionError::DanglingAlias {
                    kind,
                    op: "pin_alias",
                });
            }
        };
        if parent_slot.generation.load(Ordering::Acquire) != parent.generation
            || !parent_slot.live.load(Ordering::Acquire)
        {
            return self.violation(ExtensionError::DanglingAlias {
                kind,
                op: "pin_alias",
            });
        }
        if state.index.contains_key(&(kind, bits)) {
            return self.violation(ExtensionError::DuplicatePin {
                kind,
                op: "pin_alias",
            });
        }
        let lease = self.install(&mut state, kind, bits, true);
        unsafe {
            (*parent_slot.children.get()).push(lease);
        }
        Ok(lease)
    }

    /// Finds the live pin for `(kind, bits)` if one exists. Unboxing uses
    /// this to de-duplicate onto the pin already covering shared storage
    /// instead of rebinding the same bits.
    pub fn lookup(&self, kind: HandleKind, bits: RawBits) -> Option<Lease> {
        let state = self.state.lock().ok()?;
        let index = *state.index.get(&(kind, bits))?;
        let slot = self.slot(index)?;
        Some(Lease {
            index,
            generation: slot.generation.load(Ordering::Acquire),
            kind,
        })
    }

    /// Returns the raw bits behind a live pin. Lock-free.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn get(&self, lease: Lease) -> ExtResult<RawBits> {
        let Some(slot) = self.slot(lease.index) else {
            return self.violation(ExtensionError::UseAfterFree {
                kind: lease.kind,
                op: "get",
            });
        };
        if slot.generation.load(Ordering::Acquire) != lease.generation
            || !slot.live.load(Ordering::Acquire)
        {
            return self.violation(ExtensionError::UseAfterFree {
                kind: lease.kind,
                op: "get",
            });
        }
        let bits = unsafe { *slot.bits.get() };
        // The slot may have been destroyed or recycled mid-read.
        if slot.generation.load(Ordering::Acquire) != lease.generation
            || !slot.live.load(Ordering::Acquire)
        {
            return self.violation(ExtensionError::UseAfterFree {
                kind: lease.kind,
                op: "get",
            });
        }
        Ok(bits)
    }

    pub fn is_live(&self, lease: Lease) -> bool {
        match self.slot(lease.index) {
            Some(slot) => {
                slot.generation.load(Ordering::Acquire) == lease.generation
                    && slot.live.load(Ordering::Acquire)
            }
            None => false,
        }
    }

    /// Marks a pin destroyed under the lock, collecting the engine destroy
    /// it owes (if any) and cascading over children, which are invalidated
    /// without engine destroys: their storage belongs to this pin.
    fn retire_slot(
        &self,
        state: &mut TableState,
        lease: Lease,
        destroys: &mut Vec<(HandleKind, RawBits)>,
    ) {
        let Some(slot) = self.slot(lease.index) else {
            return;
        };
        if slot.generation.load(Ordering::Acquire) != lease.generation
            || !slot.live.load(Ordering::Acquire)
        {
            return;
        }
        let (kind, bits, alias, children) = unsafe {
            (
                *slot.kind.get(),
                *slot.bits.get(),
                *slot.alias.get(),
                std::mem::take(&mut *slot.children.get()),
            )
        };
        slot.live.store(false, Ordering::Release);
        state.index.remove(&(kind, bits));
        state.free.push(lease.index);
        self.live.fetch_sub(1, Ordering::Relaxed);
        for child in children {
            self.retire_slot(state, child, destroys);
        }
        if !alias {
            destroys.push((kind, bits));
        }
    }

    /// Destroys the pin, emits the engine destroy for its type, and clears
    /// any child pins that depended on its storage. Already-destroyed pins
    /// are a warning in debug builds and silent otherwise.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn release(&self, lease: Lease) -> ExtResult<()> {
        let mut destroys = Vec::new();
        let destroy_table;
        {
            let mut state = self.state.lock()?;
            destroy_table = state.destroy;
            let already_dead = match self.slot(lease.index) {
                Some(slot) => {
                    slot.generation.load(Ordering::Acquire) != lease.generation
                        || !slot.live.load(Ordering::Acquire)
                }
                None => true,
            };
            if already_dead {
                if cfg!(debug_assertions) {
                    log::warn!("double release of a {:?} pin ignored", lease.kind);
                }
                return Ok(());
            }
            self.retire_slot(&mut state, lease, &mut destroys);
        }
        // Engine destructors run outside the lock: they may re-enter the
        // runtime (e.g. a variant destroy touching a bound object).
        if let Some(table) = destroy_table {
            for (kind, mut bits) in destroys {
                unsafe { table.destroy(kind, bits.as_mut_ptr()) };
            }
        }
        Ok(())
    }

    /// Atomic consume: returns the bits and marks the pin destroyed
    /// without an engine destroy, for handing ownership to the engine.
    /// Children are invalidated with it.
    pub fn end(&self, lease: Lease) -> ExtResult<RawBits> {
        let mut state = self.state.lock()?;
        let Some(slot) = self.slot(lease.index) else {
            return self.violation(ExtensionError::UseAfterFree {
                kind: lease.kind,
                op: "end",
            });
        };
        if slot.generation.load(Ordering::Acquire) != lease.generation
            || !slot.live.load(Ordering::Acquire)
        {
            return self.violation(ExtensionError::UseAfterFree {
                kind: lease.kind,
                op: "end",
            });
        }
        let bits = unsafe { *slot.bits.get() };
        let mut scratch = Vec::new();
        self.retire_slot(&mut state, lease, &mut scratch);
        // The engine now owns the value; owed destroys are dropped.
        Ok(bits)
    }

    /// Drop-path release. Runs inline on the designated release thread (or
    /// when none is bound); otherwise the lease is queued for [`cycle`].
    ///
    /// [`cycle`]: HandleTable::cycle
    pub fn retire(&self, lease: Lease) {
        if !self.on_release_thread() {
            if let Ok(mut queue) = self.deferred.lock() {
                queue.push(lease);
                log::debug!("deferred release of a {:?} pin", lease.kind);
                return;
            }
        }
        if let Err(err) = self.release(lease) {
            log::error!("drop-path release failed: {err}");
        }
    }

    /// Periodic maintenance: sweeps pins whose owning wrappers were
    /// reclaimed on threads that may not call the engine. Returns the
    /// number of pins swept.
    pub fn cycle(&self) -> usize {
        let drained: Vec<Lease> = match self.deferred.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => return 0,
        };
        let count = drained.len();
        for lease in drained {
            if let Err(err) = self.release(lease) {
                log::error!("cycle sweep failed to release a pin: {err}");
            }
        }
        if count > 0 {
            log::debug!("cycle swept {count} deferred pins");
        }
        count
    }

    /// Opens a scoped acquisition: pins adopted into the scope are
    /// released when it drops unless explicitly kept.
    pub fn scope(&self) -> PinScope<'_> {
        PinScope {
            table: self,
            pins: RefCell::new(Vec::new()),
        }
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped acquisition for temporaries created while marshalling one call.
/// On exit (normal or error) every adopted pin that was not kept is
/// released.
pub struct PinScope<'t> {
    table: &'t HandleTable,
    pins: RefCell<Vec<Lease>>,
}

impl PinScope<'_> {
    pub fn adopt(&self, lease: Lease) -> Lease {
        self.pins.borrow_mut().push(lease);
        lease
    }

    /// Removes the lease from the scope so it survives scope exit, e.g.
    /// because its ownership moved to the engine or to a returned wrapper.
    pub fn keep(&self, lease: Lease) {
        self.pins.borrow_mut().retain(|held| *held != lease);
    }
}

impl Drop for PinScope<'_> {
    fn drop(&mut self) {
        for lease in self.pins.borrow_mut().drain(..) {
            self.table.retire(lease);
        }
    }
}
