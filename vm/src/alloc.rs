//! Typed allocation helpers.
//!
//! Every helper pins its reference inputs in a [`HandleSet`] before
//! asking the memory for space, then writes the object from the pinned
//! slots — the allocation may run a collection that moves every input.

use std::ptr;

use heap::HandleSet;
use object::{
    allocation_size, ByteObject, Context, Header, Method, RawObject, Value,
    CONTEXT_SLOTS, HEADER_BYTES, METHOD_SLOTS,
};

use crate::{Runtime, RuntimeError};

/// Allocate a slot object with `slot_count` fields, all nil.
/// May collect. This is the `newOrdinaryObject` runtime callback.
pub fn new_ordinary_object(
    rt: &mut Runtime,
    class: Value,
    slot_count: usize,
) -> Result<Value, RuntimeError> {
    rt.counters.objects_allocated += 1;
    let hs = HandleSet::new(&mut rt.memory);
    let class_h = hs.pin_value::<RawObject>(class);

    let payload = slot_count * core::mem::size_of::<Value>();
    let ptr = {
        let (memory, mut roots) = rt.memory_and_roots();
        memory.allocate_raw(allocation_size(payload), &mut roots)?
    };
    let nil = rt.globals.nil;
    unsafe {
        (ptr.as_ptr() as *mut Header).write(Header::new(payload, false, class_h.value()));
        let fields = ptr.as_ptr().add(HEADER_BYTES) as *mut Value;
        for i in 0..slot_count {
            fields.add(i).write(nil);
        }
    }
    Ok(Value::from_ptr(ptr.as_ptr()))
}

/// Allocate a byte object of `byte_count` zeroed bytes.
/// May collect. This is the `newBinaryObject` runtime callback.
pub fn new_binary_object(
    rt: &mut Runtime,
    class: Value,
    byte_count: usize,
) -> Result<Value, RuntimeError> {
    rt.counters.objects_allocated += 1;
    let hs = HandleSet::new(&mut rt.memory);
    let class_h = hs.pin_value::<RawObject>(class);

    let ptr = {
        let (memory, mut roots) = rt.memory_and_roots();
        memory.allocate_raw(allocation_size(byte_count), &mut roots)?
    };
    unsafe {
        (ptr.as_ptr() as *mut Header).write(Header::new(byte_count, true, class_h.value()));
        ptr::write_bytes(ptr.as_ptr().add(HEADER_BYTES), 0, byte_count);
    }
    Ok(Value::from_ptr(ptr.as_ptr()))
}

/// Allocate an array holding `values`, pinning each element across the
/// allocation.
pub fn new_array_of(rt: &mut Runtime, values: &[Value]) -> Result<Value, RuntimeError> {
    rt.counters.objects_allocated += 1;
    let hs = HandleSet::new(&mut rt.memory);
    let pinned: Vec<_> = values
        .iter()
        .map(|&v| hs.pin_value::<RawObject>(v))
        .collect();

    let payload = values.len() * core::mem::size_of::<Value>();
    let ptr = {
        let (memory, mut roots) = rt.memory_and_roots();
        memory.allocate_raw(allocation_size(payload), &mut roots)?
    };
    let class = rt.globals.array_class;
    unsafe {
        (ptr.as_ptr() as *mut Header).write(Header::new(payload, false, class));
        let fields = ptr.as_ptr().add(HEADER_BYTES) as *mut Value;
        for (i, handle) in pinned.iter().enumerate() {
            fields.add(i).write(handle.value());
        }
    }
    Ok(Value::from_ptr(ptr.as_ptr()))
}

/// Allocate a byte object initialized from `bytes`.
pub fn new_byte_object_from(
    rt: &mut Runtime,
    class: Value,
    bytes: &[u8],
) -> Result<Value, RuntimeError> {
    let value = new_binary_object(rt, class, bytes.len())?;
    unsafe {
        let object = &mut *value.as_ptr::<ByteObject>();
        ptr::copy_nonoverlapping(bytes.as_ptr(), object.bytes_ptr(), bytes.len());
    }
    Ok(value)
}

/// Allocate a method object with its literal array and bytecode.
pub fn new_method(
    rt: &mut Runtime,
    name: Value,
    class: Value,
    literals: &[Value],
    byte_codes: &[u8],
    temporary_size: i32,
    stack_size: i32,
) -> Result<Value, RuntimeError> {
    let hs = HandleSet::new(&mut rt.memory);
    let name_h = hs.pin_value::<ByteObject>(name);
    let class_h = hs.pin_value::<RawObject>(class);

    let literal_array = new_array_of(rt, literals)?;
    let literals_h = hs.pin_value::<RawObject>(literal_array);
    let string_class = rt.globals.string_class;
    let codes = new_byte_object_from(rt, string_class, byte_codes)?;
    let codes_h = hs.pin_value::<ByteObject>(codes);

    let method = new_ordinary_object(rt, class_h.value(), METHOD_SLOTS)?;
    unsafe {
        let m = &mut *method.as_ptr::<Method>();
        m.name = name_h.value();
        m.class = class_h.value();
        m.literals = literals_h.value();
        m.byte_codes = codes_h.value();
        m.temporary_size = Value::from_int(temporary_size);
        m.stack_size = Value::from_int(stack_size);
    }
    Ok(method)
}

/// Allocate a fresh activation record: the context itself, a nil-filled
/// temporaries array sized by the method, and an operand stack sized by
/// the method's stack bound.
pub fn new_context(
    rt: &mut Runtime,
    method: Value,
    arguments: Value,
    previous: Value,
) -> Result<Value, RuntimeError> {
    let hs = HandleSet::new(&mut rt.memory);
    let method_h = hs.pin_value::<Method>(method);
    let arguments_h = hs.pin_value::<RawObject>(arguments);
    let previous_h = hs.pin_value::<Context>(previous);

    let (temporary_size, stack_size) = unsafe {
        let m: &Method = method_h.value().as_ref();
        (m.temporary_size.to_int() as usize, m.stack_size.to_int() as usize)
    };
    let array_class = rt.globals.array_class;
    let temporaries = new_ordinary_object(rt, array_class, temporary_size)?;
    let temporaries_h = hs.pin_value::<RawObject>(temporaries);
    let stack = new_ordinary_object(rt, array_class, stack_size)?;
    let stack_h = hs.pin_value::<RawObject>(stack);

    let context_class = rt.globals.context_class;
    let context = new_ordinary_object(rt, context_class, CONTEXT_SLOTS)?;
    unsafe {
        let c = &mut *context.as_ptr::<Context>();
        c.method = method_h.value();
        c.arguments = arguments_h.value();
        c.temporaries = temporaries_h.value();
        c.stack = stack_h.value();
        c.instruction_ptr = Value::from_int(0);
        c.stack_top = Value::from_int(0);
        c.previous = previous_h.value();
    }
    Ok(context)
}

/// Allocate a byte object directly in the static heap. Static objects
/// never move; used for interned symbols and image materialization.
pub fn static_byte_object(
    memory: &mut heap::ObjectMemory,
    class: Value,
    bytes: &[u8],
) -> Value {
    let ptr = memory.static_allocate(allocation_size(bytes.len()));
    unsafe {
        (ptr.as_ptr() as *mut Header).write(Header::new(bytes.len(), true, class));
        ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr().add(HEADER_BYTES), bytes.len());
    }
    Value::from_ptr(ptr.as_ptr())
}

/// Allocate a nil-less slot object in the static heap; the caller fills
/// every field before the object becomes reachable.
pub fn static_slot_object(
    memory: &mut heap::ObjectMemory,
    class: Value,
    slot_count: usize,
) -> Value {
    let payload = slot_count * core::mem::size_of::<Value>();
    let ptr = memory.static_allocate(allocation_size(payload));
    unsafe {
        (ptr.as_ptr() as *mut Header).write(Header::new(payload, false, class));
        let fields = ptr.as_ptr().add(HEADER_BYTES) as *mut Value;
        for i in 0..slot_count {
            fields.add(i).write(Value::NULL);
        }
    }
    Value::from_ptr(ptr.as_ptr())
}
