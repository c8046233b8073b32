//! The primitive operations reachable through `DoPrimitive`, including
//! the `bulkReplace` runtime callback.

use object::{class_of, Block, ByteObject, RawObject, Value};

use crate::{alloc, blocks, Control, ExecResult, Runtime, RuntimeError};

/// Primitive numbers. The block-invoke and bulk-replace numbers match
/// the image's expectations; the rest cover the object model and
/// small-integer arithmetic.
pub mod numbers {
    pub const IDENTITY: u8 = 1;
    pub const CLASS: u8 = 2;
    pub const SIZE: u8 = 4;
    pub const NEW_OBJECT: u8 = 7;
    pub const BLOCK_VALUE: u8 = 8;
    pub const ADD: u8 = 10;
    pub const DIV: u8 = 11;
    pub const MOD: u8 = 12;
    pub const LESS: u8 = 13;
    pub const EQUAL: u8 = 14;
    pub const MUL: u8 = 15;
    pub const SUB: u8 = 16;
    pub const LESS_EQUAL: u8 = 17;
    pub const NEW_BYTE_OBJECT: u8 = 20;
    pub const BYTE_AT: u8 = 21;
    pub const BYTE_AT_PUT: u8 = 22;
    pub const ARRAY_AT: u8 = 24;
    pub const ARRAY_AT_PUT: u8 = 25;
    pub const BULK_REPLACE: u8 = 38;
}

fn bool_object(rt: &Runtime, value: bool) -> Value {
    if value {
        rt.globals.true_obj
    } else {
        rt.globals.false_obj
    }
}

fn int_arg(args: &[Value], index: usize, primitive: u8) -> Result<i32, RuntimeError> {
    let value = *args
        .get(index)
        .ok_or(RuntimeError::PrimitiveFailed { primitive })?;
    if !value.is_int() {
        return Err(RuntimeError::PrimitiveFailed { primitive });
    }
    Ok(unsafe { value.to_int() })
}

fn ref_arg(args: &[Value], index: usize, primitive: u8) -> Result<Value, RuntimeError> {
    let value = *args
        .get(index)
        .ok_or(RuntimeError::PrimitiveFailed { primitive })?;
    if !value.is_ref() {
        return Err(RuntimeError::PrimitiveFailed { primitive });
    }
    Ok(value)
}

fn arg(args: &[Value], index: usize, primitive: u8) -> Result<Value, RuntimeError> {
    args.get(index)
        .copied()
        .ok_or(RuntimeError::PrimitiveFailed { primitive })
}

/// Execute primitive `primitive` on `args` (in push order). Block
/// invocation may carry a non-local return out of the primitive.
pub fn execute(
    rt: &mut Runtime,
    primitive: u8,
    args: &[Value],
    calling_context: Value,
) -> ExecResult {
    use numbers::*;

    let value = match primitive {
        IDENTITY => {
            let (a, b) = (arg(args, 0, primitive)?, arg(args, 1, primitive)?);
            bool_object(rt, a == b)
        }
        CLASS => class_of(arg(args, 0, primitive)?, &rt.globals),
        SIZE => {
            let value = ref_arg(args, 0, primitive)?;
            let object: &RawObject = unsafe { value.as_ref() };
            let size = if object.header.size.is_binary() {
                object.header.size.payload_bytes()
            } else {
                object.slot_count()
            };
            Value::from_int(size as i32)
        }
        NEW_OBJECT => {
            let class = ref_arg(args, 0, primitive)?;
            let count = int_arg(args, 1, primitive)?;
            alloc::new_ordinary_object(rt, class, count as usize)?
        }
        NEW_BYTE_OBJECT => {
            let class = ref_arg(args, 0, primitive)?;
            let count = int_arg(args, 1, primitive)?;
            alloc::new_binary_object(rt, class, count as usize)?
        }

        BLOCK_VALUE => {
            let block = ref_arg(args, 0, primitive)?;
            if class_of(block, &rt.globals) != rt.globals.block_class {
                return Err(RuntimeError::PrimitiveFailed { primitive });
            }
            inject_block_arguments(rt, block, &args[1..]);
            return blocks::invoke_block(rt, block, calling_context);
        }

        ADD | SUB | MUL | DIV | MOD | LESS | EQUAL | LESS_EQUAL => {
            let a = int_arg(args, 0, primitive)?;
            let b = int_arg(args, 1, primitive)?;
            small_int_primitive(rt, primitive, a, b)?
        }

        BYTE_AT => {
            let object = ref_arg(args, 0, primitive)?;
            let index = int_arg(args, 1, primitive)? as usize;
            let bytes: &ByteObject = unsafe { object.as_ref() };
            if index >= bytes.len() {
                return Err(RuntimeError::PrimitiveFailed { primitive });
            }
            Value::from_int(bytes.byte_at(index) as i32)
        }
        BYTE_AT_PUT => {
            let object = ref_arg(args, 0, primitive)?;
            let index = int_arg(args, 1, primitive)? as usize;
            let byte = int_arg(args, 2, primitive)?;
            let bytes = unsafe { &mut *object.as_ptr::<ByteObject>() };
            if index >= bytes.len() || !(0..=255).contains(&byte) {
                return Err(RuntimeError::PrimitiveFailed { primitive });
            }
            bytes.set_byte(index, byte as u8);
            object
        }
        ARRAY_AT => {
            let array = ref_arg(args, 0, primitive)?;
            let index = int_arg(args, 1, primitive)? as usize;
            let fields: &RawObject = unsafe { array.as_ref() };
            if index >= fields.slot_count() {
                return Err(RuntimeError::PrimitiveFailed { primitive });
            }
            fields.field_at(index)
        }
        ARRAY_AT_PUT => {
            let array = ref_arg(args, 0, primitive)?;
            let index = int_arg(args, 1, primitive)? as usize;
            let value = arg(args, 2, primitive)?;
            let fields = unsafe { &mut *array.as_ptr::<RawObject>() };
            if index >= fields.slot_count() {
                return Err(RuntimeError::PrimitiveFailed { primitive });
            }
            let slot = fields.field_slot(index);
            unsafe { *slot = value };
            rt.memory.check_root(value, slot);
            array
        }

        BULK_REPLACE => {
            let ok = bulk_replace(
                rt,
                arg(args, 0, primitive)?,
                arg(args, 1, primitive)?,
                arg(args, 2, primitive)?,
                arg(args, 3, primitive)?,
                arg(args, 4, primitive)?,
            );
            bool_object(rt, ok)
        }

        _ => return Err(RuntimeError::UnknownPrimitive { primitive }),
    };
    Ok(Control::Normal(value))
}

fn small_int_primitive(
    rt: &Runtime,
    primitive: u8,
    a: i32,
    b: i32,
) -> Result<Value, RuntimeError> {
    use numbers::*;
    Ok(match primitive {
        ADD => Value::from_int(a.checked_add(b).ok_or(RuntimeError::IntegerOverflow)?),
        SUB => Value::from_int(a.checked_sub(b).ok_or(RuntimeError::IntegerOverflow)?),
        MUL => Value::from_int(a.checked_mul(b).ok_or(RuntimeError::IntegerOverflow)?),
        DIV => {
            if b == 0 {
                return Err(RuntimeError::PrimitiveFailed { primitive });
            }
            Value::from_int(a.wrapping_div(b))
        }
        MOD => {
            if b == 0 {
                return Err(RuntimeError::PrimitiveFailed { primitive });
            }
            Value::from_int(a.wrapping_rem(b))
        }
        LESS => bool_object(rt, a < b),
        EQUAL => bool_object(rt, a == b),
        LESS_EQUAL => bool_object(rt, a <= b),
        other => return Err(RuntimeError::UnknownPrimitive { primitive: other }),
    })
}

/// Copy block-call arguments into the block's temporaries at its
/// argument-injection location. No allocation happens here, so the raw
/// values stay valid.
fn inject_block_arguments(rt: &mut Runtime, block: Value, args: &[Value]) {
    let (location, temporaries) = unsafe {
        let b: &Block = block.as_ref();
        (b.argument_location.to_int() as usize, b.temporaries)
    };
    let temps = unsafe { &mut *temporaries.as_ptr::<RawObject>() };
    for (i, &value) in args.iter().enumerate() {
        let index = location + i;
        if index >= temps.slot_count() {
            break;
        }
        let slot = temps.field_slot(index);
        unsafe { *slot = value };
        rt.memory.check_root(value, slot);
    }
}

/// The `bulkReplace` runtime callback: copy
/// `src[src_start .. src_start + (dst_stop - dst_start)]` over
/// `dst[dst_start .. dst_stop)` when both objects have the same payload
/// kind and every index is in bounds; otherwise return `false` without
/// mutating anything.
pub fn bulk_replace(
    rt: &mut Runtime,
    dst: Value,
    dst_start: Value,
    dst_stop: Value,
    src: Value,
    src_start: Value,
) -> bool {
    if !dst.is_ref() || !src.is_ref() {
        return false;
    }
    if !dst_start.is_int() || !dst_stop.is_int() || !src_start.is_int() {
        return false;
    }
    let (dst_start, dst_stop, src_start) = unsafe {
        (
            dst_start.to_int(),
            dst_stop.to_int(),
            src_start.to_int(),
        )
    };
    if dst_start < 0 || src_start < 0 || dst_stop < dst_start {
        return false;
    }
    let (dst_start, dst_stop, src_start) =
        (dst_start as usize, dst_stop as usize, src_start as usize);
    let count = dst_stop - dst_start;

    let dst_header = unsafe { &dst.as_ref::<RawObject>().header };
    let src_header = unsafe { &src.as_ref::<RawObject>().header };
    if dst_header.size.is_binary() != src_header.size.is_binary() {
        return false;
    }

    if dst_header.size.is_binary() {
        let dst_obj = unsafe { &mut *dst.as_ptr::<ByteObject>() };
        let src_obj = unsafe { &*src.as_ptr::<ByteObject>() };
        if dst_stop > dst_obj.len() || src_start + count > src_obj.len() {
            return false;
        }
        unsafe {
            // The ranges may overlap when dst and src are the same object.
            core::ptr::copy(
                src_obj.bytes_ptr().add(src_start),
                dst_obj.bytes_ptr().add(dst_start),
                count,
            );
        }
    } else {
        let dst_obj = unsafe { &mut *dst.as_ptr::<RawObject>() };
        let src_obj = unsafe { &*src.as_ptr::<RawObject>() };
        if dst_stop > dst_obj.slot_count() || src_start + count > src_obj.slot_count() {
            return false;
        }
        for i in 0..count {
            let value = src_obj.field_at(src_start + i);
            let slot = dst_obj.field_slot(dst_start + i);
            unsafe { *slot = value };
            rt.memory.check_root(value, slot);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::special;
    use heap::{HandleSet, MemoryConfig};

    #[test]
    fn bulk_replace_copies_matching_slot_objects() {
        let mut rt = special::bootstrap(MemoryConfig::default());
        let hs = HandleSet::new(&mut rt.memory);

        let src = alloc::new_array_of(
            &mut rt,
            &[Value::from_int(1), Value::from_int(2), Value::from_int(3)],
        )
        .expect("src");
        let src_h = hs.pin_value::<RawObject>(src);
        let dst = alloc::new_array_of(
            &mut rt,
            &[Value::from_int(0), Value::from_int(0), Value::from_int(0)],
        )
        .expect("dst");
        let dst_h = hs.pin_value::<RawObject>(dst);

        assert!(bulk_replace(
            &mut rt,
            dst_h.value(),
            Value::from_int(1),
            Value::from_int(3),
            src_h.value(),
            Value::from_int(0),
        ));
        assert_eq!(unsafe { dst_h.field_at(0).to_int() }, 0);
        assert_eq!(unsafe { dst_h.field_at(1).to_int() }, 1);
        assert_eq!(unsafe { dst_h.field_at(2).to_int() }, 2);
    }

    #[test]
    fn bulk_replace_rejects_mismatched_kinds_and_bounds() {
        let mut rt = special::bootstrap(MemoryConfig::default());
        let hs = HandleSet::new(&mut rt.memory);

        let array = alloc::new_array_of(&mut rt, &[Value::from_int(1)]).expect("array");
        let array_h = hs.pin_value::<RawObject>(array);
        let string_class = rt.globals.string_class;
        let bytes = alloc::new_byte_object_from(&mut rt, string_class, b"ab")
            .expect("bytes");
        let bytes_h = hs.pin_value::<ByteObject>(bytes);

        // Slot/byte mismatch.
        assert!(!bulk_replace(
            &mut rt,
            array_h.value(),
            Value::from_int(0),
            Value::from_int(1),
            bytes_h.value(),
            Value::from_int(0),
        ));
        // Out-of-bounds destination range.
        assert!(!bulk_replace(
            &mut rt,
            array_h.value(),
            Value::from_int(0),
            Value::from_int(5),
            array_h.value(),
            Value::from_int(0),
        ));
        // Unchanged on failure.
        assert_eq!(unsafe { array_h.field_at(0).to_int() }, 1);
    }

    #[test]
    fn byte_objects_replace_within_themselves() {
        let mut rt = special::bootstrap(MemoryConfig::default());
        let hs = HandleSet::new(&mut rt.memory);

        let string_class = rt.globals.string_class;
        let bytes = alloc::new_byte_object_from(&mut rt, string_class, b"abcdef")
            .expect("bytes");
        let bytes_h = hs.pin_value::<ByteObject>(bytes);

        assert!(bulk_replace(
            &mut rt,
            bytes_h.value(),
            Value::from_int(0),
            Value::from_int(4),
            bytes_h.value(),
            Value::from_int(2),
        ));
        let copied: Vec<u8> = (0..6).map(|i| bytes_h.byte_at(i)).collect();
        assert_eq!(&copied, b"cdefef");
    }
}
