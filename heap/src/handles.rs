use core::cell::{Cell, UnsafeCell};
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use object::{ByteObject, RawObject, Tagged, Value};

use crate::ObjectMemory;

pub const HANDLE_SET_CAPACITY: usize = 16;

struct OverflowChunk {
    next: *mut OverflowChunk,
    len: usize,
    slots: [Value; HANDLE_SET_CAPACITY],
}

/// Stack-resident set of GC roots.
///
/// Each `HandleSet` links itself onto the memory's registry list the
/// first time a value is pinned, so the collector can rewrite every
/// active handle slot in place. Sets are released in LIFO scope order
/// when dropped; registration and release are both O(1) at the list
/// head.
///
/// A set must not be moved once a value has been pinned into it — the
/// registry holds its address.
pub struct HandleSet {
    memory: *mut ObjectMemory,
    pub(crate) next: Cell<*mut HandleSet>,
    linked: Cell<bool>,
    len: Cell<usize>,
    slots: UnsafeCell<[Value; HANDLE_SET_CAPACITY]>,
    overflow_head: Cell<*mut OverflowChunk>,
}

/// A copyable, scope-bounded rooted handle.
///
/// The handle points at a mutable root slot that the collector updates
/// in place; every access goes through the slot, so the referent is
/// re-read at its current location.
pub struct Handle<'scope, T> {
    slot: *mut Value,
    _scope: PhantomData<&'scope HandleSet>,
    _type: PhantomData<*const T>,
}

impl<'scope, T> Clone for Handle<'scope, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'scope, T> Copy for Handle<'scope, T> {}

impl HandleSet {
    #[inline(always)]
    pub fn new(memory: &mut ObjectMemory) -> Self {
        Self {
            memory: memory as *mut ObjectMemory,
            next: Cell::new(core::ptr::null_mut()),
            linked: Cell::new(false),
            len: Cell::new(0),
            slots: UnsafeCell::new([Value::NULL; HANDLE_SET_CAPACITY]),
            overflow_head: Cell::new(core::ptr::null_mut()),
        }
    }

    #[inline(always)]
    fn ensure_linked(&self) {
        if self.linked.get() {
            return;
        }
        let memory = unsafe { &mut *self.memory };
        self.next.set(memory.handles_head);
        memory.handles_head = self as *const HandleSet as *mut HandleSet;
        self.linked.set(true);
    }

    #[inline(always)]
    pub fn pin<'scope, T>(&'scope self, tagged: Tagged<T>) -> Handle<'scope, T> {
        self.pin_value(tagged.value())
    }

    #[inline(always)]
    pub fn pin_value<'scope, T>(&'scope self, value: Value) -> Handle<'scope, T> {
        self.ensure_linked();
        let slot = if self.len.get() < HANDLE_SET_CAPACITY {
            let idx = self.len.get();
            self.len.set(idx + 1);
            unsafe { (self.slots.get() as *mut Value).add(idx) }
        } else {
            self.push_overflow_slot()
        };
        unsafe { *slot = value };
        Handle {
            slot,
            _scope: PhantomData,
            _type: PhantomData,
        }
    }

    fn push_overflow_slot(&self) -> *mut Value {
        let mut chunk_ptr = self.overflow_head.get();
        if chunk_ptr.is_null() {
            chunk_ptr = Box::into_raw(Box::new(OverflowChunk {
                next: core::ptr::null_mut(),
                len: 0,
                slots: [Value::NULL; HANDLE_SET_CAPACITY],
            }));
            self.overflow_head.set(chunk_ptr);
        }
        loop {
            let chunk = unsafe { &mut *chunk_ptr };
            if chunk.len < HANDLE_SET_CAPACITY {
                let idx = chunk.len;
                chunk.len = idx + 1;
                return unsafe { chunk.slots.as_mut_ptr().add(idx) };
            }
            if chunk.next.is_null() {
                chunk.next = Box::into_raw(Box::new(OverflowChunk {
                    next: core::ptr::null_mut(),
                    len: 0,
                    slots: [Value::NULL; HANDLE_SET_CAPACITY],
                }));
            }
            chunk_ptr = chunk.next;
        }
    }

    /// Visit every active slot, including overflow chunks.
    pub fn visit_roots(&self, visitor: &mut dyn FnMut(&mut Value)) {
        let base = self.slots.get() as *mut Value;
        for i in 0..self.len.get() {
            visitor(unsafe { &mut *base.add(i) });
        }
        let mut chunk_ptr = self.overflow_head.get();
        while !chunk_ptr.is_null() {
            let chunk = unsafe { &mut *chunk_ptr };
            for slot in &mut chunk.slots[..chunk.len] {
                visitor(slot);
            }
            chunk_ptr = chunk.next;
        }
    }

    fn drop_overflow_chain(&self) {
        let mut chunk_ptr = self.overflow_head.get();
        self.overflow_head.set(core::ptr::null_mut());
        while !chunk_ptr.is_null() {
            let next = unsafe { (*chunk_ptr).next };
            unsafe { drop(Box::from_raw(chunk_ptr)) };
            chunk_ptr = next;
        }
    }
}

impl Drop for HandleSet {
    fn drop(&mut self) {
        self.drop_overflow_chain();

        if !self.linked.get() {
            return;
        }
        let memory = unsafe { &mut *self.memory };
        let self_ptr = self as *mut HandleSet;
        debug_assert_eq!(
            memory.handles_head, self_ptr,
            "HandleSet drop must follow LIFO scope order"
        );
        if memory.handles_head == self_ptr {
            memory.handles_head = self.next.get();
        }
    }
}

impl<'scope, T> Handle<'scope, T> {
    #[inline(always)]
    pub fn value(&self) -> Value {
        unsafe { *self.slot }
    }

    #[inline(always)]
    pub fn set(&self, value: Value) {
        unsafe { *self.slot = value };
    }
}

impl<'scope, T> Deref for Handle<'scope, T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        unsafe { (*self.slot).as_ref() }
    }
}

impl<'scope, T> DerefMut for Handle<'scope, T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { (*self.slot).as_mut() }
    }
}

// Indexed access goes through the slot on every call, so the element
// address is derived from the object's current location even after a
// collection moved it.

impl<'scope> Handle<'scope, RawObject> {
    #[inline(always)]
    pub fn field_at(&self, index: usize) -> Value {
        unsafe { (*self.slot).as_ref::<RawObject>() }.field_at(index)
    }

    #[inline(always)]
    pub fn set_field(&self, index: usize, value: Value) {
        unsafe { (*self.slot).as_mut::<RawObject>() }.set_field(index, value);
    }

    #[inline(always)]
    pub fn field_slot(&self, index: usize) -> *mut Value {
        unsafe { (*self.slot).as_mut::<RawObject>() }.field_slot(index)
    }

    #[inline(always)]
    pub fn slot_count(&self) -> usize {
        unsafe { (*self.slot).as_ref::<RawObject>() }.slot_count()
    }
}

impl<'scope> Handle<'scope, ByteObject> {
    #[inline(always)]
    pub fn byte_at(&self, index: usize) -> u8 {
        unsafe { (*self.slot).as_ref::<ByteObject>() }.byte_at(index)
    }

    #[inline(always)]
    pub fn set_byte(&self, index: usize, byte: u8) {
        unsafe { (*self.slot).as_mut::<ByteObject>() }.set_byte(index, byte);
    }

    #[inline(always)]
    pub fn byte_len(&self) -> usize {
        unsafe { (*self.slot).as_ref::<ByteObject>() }.len()
    }
}
