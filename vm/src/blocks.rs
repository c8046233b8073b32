//! Block creation, invocation, and non-local return.

use heap::HandleSet;
use object::{class_of, Block, Context, RawObject, Value, BLOCK_SLOTS};

use crate::alloc;
use crate::{Control, ExecResult, Runtime, RuntimeError};

/// The `createBlock` runtime callback.
///
/// The block inherits method, arguments, and temporaries from the
/// calling context and records the byte offset of its body. Nested
/// blocks inherit the outer block's creating context, so a non-local
/// return always targets the home method activation.
pub fn create_block(
    rt: &mut Runtime,
    calling_context: Value,
    arg_location: u32,
    byte_offset: usize,
) -> Result<Value, RuntimeError> {
    let hs = HandleSet::new(&mut rt.memory);
    let caller_h = hs.pin_value::<Context>(calling_context);

    // The block runs on its own operand stack sized by the home method.
    let stack_size = unsafe {
        let caller: &Context = caller_h.value().as_ref();
        let method: &object::Method = caller.method.as_ref();
        method.stack_size.to_int() as usize
    };
    let array_class = rt.globals.array_class;
    let stack = alloc::new_ordinary_object(rt, array_class, stack_size)?;
    let stack_h = hs.pin_value::<RawObject>(stack);

    let block_class = rt.globals.block_class;
    let block = alloc::new_ordinary_object(rt, block_class, BLOCK_SLOTS)?;
    let creating = {
        let caller = caller_h.value();
        if class_of(caller, &rt.globals) == rt.globals.block_class {
            unsafe { caller.as_ref::<Block>() }.creating_context
        } else {
            caller
        }
    };
    unsafe {
        let caller: &Context = caller_h.value().as_ref();
        let b = &mut *block.as_ptr::<Block>();
        b.method = caller.method;
        b.arguments = caller.arguments;
        b.temporaries = caller.temporaries;
        b.stack = stack_h.value();
        b.instruction_ptr = Value::from_int(byte_offset as i32);
        b.stack_top = Value::from_int(0);
        b.previous = rt.globals.nil;
        b.argument_location = Value::from_int(arg_location as i32);
        b.block_ip = Value::from_int(byte_offset as i32);
        b.creating_context = creating;
    }
    Ok(block)
}

/// The `invokeBlock` runtime callback.
///
/// Re-targets the block's `previous` context at the caller's return
/// target, resolves the compiled entry for `(method, block offset)`
/// through the block cache, and jumps in at the block's body offset.
pub fn invoke_block(rt: &mut Runtime, block: Value, calling_context: Value) -> ExecResult {
    rt.counters.blocks_invoked += 1;
    let hs = HandleSet::new(&mut rt.memory);
    let block_h = hs.pin_value::<Block>(block);
    let caller_h = hs.pin_value::<Context>(calling_context);

    let (method, block_ip) = unsafe {
        let b: &Block = block_h.value().as_ref();
        (b.method, b.block_ip.to_int() as usize)
    };

    let native = match rt.block_cache.probe(method, block_ip) {
        Some(native) => native,
        None => {
            // Block entries are emitted when the wrapping method gets
            // compiled; an absent entry means the method itself has not
            // been compiled yet.
            let native = match rt.compiler.block_entry(&rt.globals, method, block_ip) {
                Some(native) => native,
                None => {
                    rt.compiler.compile(&rt.globals, method)?;
                    rt.compiler
                        .block_entry(&rt.globals, method, block_ip)
                        .ok_or(RuntimeError::UnknownBlockEntry { offset: block_ip })?
                }
            };
            rt.block_cache.update(method, block_ip, native.clone());
            native
        }
    };

    unsafe {
        let caller: &Context = caller_h.value().as_ref();
        let previous = caller.previous;
        let b = &mut *block_h.value().as_ptr::<Block>();
        b.previous = previous;
        b.instruction_ptr = b.block_ip;
        b.stack_top = Value::from_int(0);
    }

    native(rt, block_h.value())
}

/// The `emitBlockReturn` runtime callback: raise the typed non-local
/// return signal with its `(value, target)` payload.
pub fn emit_block_return(value: Value, target: Value) -> ExecResult {
    Ok(Control::NonLocal { value, target })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{alloc, special};
    use bytecode::BytecodeBuilder;
    use heap::MemoryConfig;

    #[test]
    fn invoking_retargets_previous_at_the_callers_return_target() {
        let mut rt = special::bootstrap(MemoryConfig::default());

        let mut b = BytecodeBuilder::new();
        let end = b.push_block(0);
        let body = b.current_offset();
        b.push_constant(5);
        b.stack_return();
        b.bind(end);
        b.stack_return();

        let probe = rt.intern("probe");
        let nil = rt.globals.nil;
        let nil_class = class_of(nil, &rt.globals);
        let method = alloc::new_method(&mut rt, probe, nil_class, &[], b.as_bytes(), 0, 4)
            .expect("method");

        let args = alloc::new_array_of(&mut rt, &[nil]).expect("args");
        let outer = alloc::new_context(&mut rt, method, args, nil).expect("outer");
        let caller = alloc::new_context(&mut rt, method, args, outer).expect("caller");

        let block = create_block(&mut rt, caller, 0, body).expect("block");
        assert_eq!(unsafe { block.as_ref::<Block>() }.previous, nil);

        let result = invoke_block(&mut rt, block, caller).expect("invoke");
        assert_eq!(result, Control::Normal(Value::from_int(5)));

        // A return from the block goes to the caller's return target,
        // not to the block's creator: the chain skips the caller.
        let previous = unsafe { block.as_ref::<Block>() }.previous;
        assert_eq!(previous, outer);
        assert_ne!(previous, caller);
    }
}
