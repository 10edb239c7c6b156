//! Per-call argument layout for the method-bind pointer-call ABI.
//!
//! A frame lays out argument slots and a return slot in a thread-local
//! arena and exposes them in the engine's pointer-to-pointer-array form.
//! Frames never escape the call that built them; reentrant calls nest, and
//! the arena is reset when the outermost frame drops.

use crate::types::engine_ptr::EnginePtr;
use crate::types::variant::RawVariant;
use bumpalo::Bump;
use std::alloc::Layout;
use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::marker::PhantomData;

/// Upper bound on arguments per engine method, set generously above any
/// real signature. Exceeding it is a stub bug.
pub const MAX_CALL_ARGS: usize = 16;

/// Upper bound on slot bytes a single frame may consume.
const FRAME_BYTES: usize = 1024;

const ARENA_CAPACITY: usize = 16 * 1024;

thread_local! {
    static FRAME_ARENA: RefCell<Bump> = RefCell::new(Bump::with_capacity(ARENA_CAPACITY));
    static FRAME_DEPTH: Cell<usize> = const { Cell::new(0) };
}

fn arena_alloc(layout: Layout) -> *mut u8 {
    FRAME_ARENA.with(|arena| arena.borrow().alloc_layout(layout).as_ptr())
}

/// Scratch region for one outgoing pointer call.
///
/// Slot alignment follows the engine ABI: bool is one byte, integers and
/// floats are eight, handles are passed as their opaque words.
pub struct CallFrame {
    ptrs: [*const c_void; MAX_CALL_ARGS],
    len: usize,
    bytes: usize,
    ret: *mut u8,
    _not_send: PhantomData<*mut ()>,
}

impl CallFrame {
    pub fn new() -> Self {
        FRAME_DEPTH.with(|depth| depth.set(depth.get() + 1));
        CallFrame {
            ptrs: [std::ptr::null(); MAX_CALL_ARGS],
            len: 0,
            bytes: 0,
            ret: std::ptr::null_mut(),
            _not_send: PhantomData,
        }
    }

    pub fn arg_count(&self) -> usize {
        self.len
    }

    fn push_slot(&mut self, layout: Layout) -> *mut u8 {
        assert!(
            self.len < MAX_CALL_ARGS,
            "call frame overflow: more than {} arguments",
            MAX_CALL_ARGS
        );
        self.bytes += layout.size();
        assert!(
            self.bytes <= FRAME_BYTES,
            "call frame exhausted its slot budget"
        );
        let slot = arena_alloc(layout);
        self.ptrs[self.len] = slot as *const c_void;
        self.len += 1;
        slot
    }

    pub fn push_bool(&mut self, value: bool) {
        let slot = self.push_slot(Layout::new::<u8>());
        unsafe { slot.write(value as u8) }
    }

    pub fn push_i64(&mut self, value: i64) {
        let slot = self.push_slot(Layout::new::<i64>());
        unsafe { slot.cast::<i64>().write(value) }
    }

    pub fn push_u64(&mut self, value: u64) {
        let slot = self.push_slot(Layout::new::<u64>());
        unsafe { slot.cast::<u64>().write(value) }
    }

    pub fn push_f64(&mut self, value: f64) {
        let slot = self.push_slot(Layout::new::<f64>());
        unsafe { slot.cast::<f64>().write(value) }
    }

    /// Object arguments are passed as the raw object pointer.
    pub fn push_object(&mut self, ptr: EnginePtr) {
        let slot = self.push_slot(Layout::new::<*mut c_void>());
        unsafe { slot.cast::<*mut c_void>().write(ptr.as_mut_ptr()) }
    }

    /// Opaque handle bits (strings, arrays, packed arrays) passed inline.
    pub fn push_words(&mut self, words: &[u64]) {
        let layout = Layout::array::<u64>(words.len()).expect("slot layout");
        let slot = self.push_slot(layout);
        unsafe {
            std::ptr::copy_nonoverlapping(words.as_ptr(), slot.cast::<u64>(), words.len());
        }
    }

    pub fn push_variant(&mut self, value: &RawVariant) {
        let slot = self.push_slot(Layout::new::<RawVariant>());
        unsafe { slot.cast::<RawVariant>().write(*value) }
    }

    /// The engine's expected argument form: a packed array of pointers to
    /// the slots pushed so far. Valid only while the frame is alive.
    pub fn args_ptr(&self) -> *const *const c_void {
        self.ptrs.as_ptr()
    }

    /// Allocates a zeroed return slot of the given shape and returns its
    /// address for the call. The slot is read back with [`read_ret`]
    /// after the call returns.
    ///
    /// [`read_ret`]: CallFrame::read_ret
    pub fn ret_slot(&mut self, size: usize, align: usize) -> *mut c_void {
        let layout = Layout::from_size_align(size, align).expect("return slot layout");
        let slot = arena_alloc(layout);
        unsafe { std::ptr::write_bytes(slot, 0, size) }
        self.ret = slot;
        slot as *mut c_void
    }

    /// Convenience for [`ret_slot`] sized for `T`.
    ///
    /// [`ret_slot`]: CallFrame::ret_slot
    pub fn ret_slot_for<T>(&mut self) -> *mut c_void {
        self.ret_slot(size_of::<T>(), align_of::<T>())
    }

    pub fn read_ret<T: Copy>(&self) -> T {
        assert!(!self.ret.is_null(), "no return slot was allocated");
        assert_eq!(
            self.ret as usize % align_of::<T>(),
            0,
            "return slot alignment does not fit the read type"
        );
        unsafe { self.ret.cast::<T>().read() }
    }
}

impl Default for CallFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CallFrame {
    fn drop(&mut self) {
        FRAME_DEPTH.with(|depth| {
            let d = depth.get() - 1;
            depth.set(d);
            if d == 0 {
                FRAME_ARENA.with(|arena| arena.borrow_mut().reset());
            }
        });
    }
}
