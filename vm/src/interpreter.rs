//! The bytecode interpreter. Executes one activation (method context or
//! block) against its heap-resident operand stack; sends recurse through
//! [`dispatch::send_message`].
//!
//! Every heap access goes through the pinned context handle, because any
//! send, block creation, or argument-array allocation may move the
//! entire object graph.

use bytecode::{decode_at, Instruction};
use heap::{Handle, HandleSet};
use object::{
    class_of, Block, ByteObject, Class, Context, Globals, Method, RawObject, Value,
};

use crate::{blocks, dispatch, primitives, Control, ExecResult, Runtime, RuntimeError};

/// Run the activation `context` from its current instruction pointer.
/// This is the entry the default compiler hands out for both methods
/// and blocks.
pub fn execute(rt: &mut Runtime, context: Value) -> ExecResult {
    let hs = HandleSet::new(&mut rt.memory);
    let ctx = hs.pin_value::<Context>(context);

    loop {
        let (instruction, next_ip) = {
            let c: &Context = unsafe { ctx.value().as_ref() };
            let method: &Method = unsafe { c.method.as_ref() };
            let code: &ByteObject = unsafe { method.byte_codes.as_ref() };
            let ip = unsafe { c.instruction_ptr.to_int() } as usize;
            decode_at(code.bytes(), ip)?
        };
        set_ip(&ctx, next_ip);

        match instruction {
            Instruction::PushInstance { index } => {
                let receiver = receiver(&ctx);
                let value = unsafe { receiver.as_ref::<RawObject>() }.field_at(index as usize);
                push(&ctx, value)?;
            }
            Instruction::PushArgument { index } => {
                let value = argument(&ctx, index as usize);
                push(&ctx, value)?;
            }
            Instruction::PushTemporary { index } => {
                let value = temporaries(&ctx).field_at(index as usize);
                push(&ctx, value)?;
            }
            Instruction::PushLiteral { index } => {
                let value = literal(&ctx, index as usize);
                push(&ctx, value)?;
            }
            Instruction::PushConstant { constant } => {
                let value = match constant {
                    0..=9 => Value::from_int(constant as i32),
                    10 => rt.globals.nil,
                    11 => rt.globals.true_obj,
                    12 => rt.globals.false_obj,
                    other => return Err(RuntimeError::InvalidConstant { constant: other }),
                };
                push(&ctx, value)?;
            }

            Instruction::AssignInstance { index } => {
                let value = top(&ctx)?;
                let receiver = receiver(&ctx);
                let slot = unsafe { &mut *receiver.as_ptr::<RawObject>() }
                    .field_slot(index as usize);
                unsafe { *slot = value };
                rt.memory.check_root(value, slot);
            }
            Instruction::AssignTemporary { index } => {
                let value = top(&ctx)?;
                let temps = temporaries(&ctx);
                let slot = unsafe { &mut *temps.value().as_ptr::<RawObject>() }
                    .field_slot(index as usize);
                unsafe { *slot = value };
                rt.memory.check_root(value, slot);
            }

            Instruction::MarkArguments { count } => {
                let mut values = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    values.push(pop(&ctx)?);
                }
                values.reverse();
                let array = crate::alloc::new_array_of(rt, &values)?;
                push(&ctx, array)?;
            }

            Instruction::SendMessage { literal: index } => {
                let selector = literal(&ctx, index as usize);
                let arguments = pop(&ctx)?;
                match dispatch::send_message(rt, ctx.value(), selector, arguments, None)? {
                    Control::Normal(value) => push(&ctx, value)?,
                    propagated @ Control::NonLocal { .. } => return Ok(propagated),
                }
            }
            Instruction::SendToSuper { literal: index } => {
                let selector = literal(&ctx, index as usize);
                let arguments = pop(&ctx)?;
                let superclass = {
                    let c: &Context = unsafe { ctx.value().as_ref() };
                    let method: &Method = unsafe { c.method.as_ref() };
                    unsafe { method.class.as_ref::<Class>() }.parent
                };
                match dispatch::send_message(
                    rt,
                    ctx.value(),
                    selector,
                    arguments,
                    Some(superclass),
                )? {
                    Control::Normal(value) => push(&ctx, value)?,
                    propagated @ Control::NonLocal { .. } => return Ok(propagated),
                }
            }
            Instruction::SendUnary { kind } => {
                let value = pop(&ctx)?;
                let is_nil = value == rt.globals.nil;
                let result = match kind {
                    0 => is_nil,
                    1 => !is_nil,
                    other => return Err(RuntimeError::InvalidConstant { constant: other }),
                };
                push(&ctx, bool_object(rt, result))?;
            }
            Instruction::SendBinary { selector } => {
                if selector as usize >= rt.globals.binary_selectors.len() {
                    return Err(RuntimeError::InvalidConstant { constant: selector });
                }
                let rhs = pop(&ctx)?;
                let lhs = pop(&ctx)?;
                if let Some(value) = small_int_binary(rt, selector, lhs, rhs)? {
                    push(&ctx, value)?;
                } else {
                    let arguments = crate::alloc::new_array_of(rt, &[lhs, rhs])?;
                    let symbol = rt.globals.binary_selectors[selector as usize];
                    match dispatch::send_message(rt, ctx.value(), symbol, arguments, None)? {
                        Control::Normal(value) => push(&ctx, value)?,
                        propagated @ Control::NonLocal { .. } => return Ok(propagated),
                    }
                }
            }

            Instruction::PushBlock { arg_location, end } => {
                let block =
                    blocks::create_block(rt, ctx.value(), arg_location as u32, next_ip)?;
                push(&ctx, block)?;
                set_ip(&ctx, end as usize);
            }

            Instruction::DoPrimitive { argc, primitive } => {
                let mut values = Vec::with_capacity(argc as usize);
                for _ in 0..argc {
                    values.push(pop(&ctx)?);
                }
                values.reverse();
                match primitives::execute(rt, primitive, &values, ctx.value())? {
                    Control::Normal(value) => push(&ctx, value)?,
                    propagated @ Control::NonLocal { .. } => return Ok(propagated),
                }
            }

            Instruction::SelfReturn => return Ok(Control::Normal(receiver(&ctx))),
            Instruction::StackReturn => return Ok(Control::Normal(pop(&ctx)?)),
            Instruction::BlockReturn => {
                let value = pop(&ctx)?;
                if class_of(ctx.value(), &rt.globals) != rt.globals.block_class {
                    return Err(RuntimeError::BlockReturnOutsideBlock);
                }
                let target = unsafe { ctx.value().as_ref::<Block>() }.creating_context;
                // The chain from a block continues at the caller's
                // return target; a creating context that is no longer on
                // it has already returned, so the abort has nowhere to
                // land.
                if !chain_contains(&rt.globals, ctx.value(), target) {
                    return Err(RuntimeError::NonLocalReturnExpired);
                }
                return blocks::emit_block_return(value, target);
            }

            Instruction::Duplicate => {
                let value = top(&ctx)?;
                push(&ctx, value)?;
            }
            Instruction::PopTop => {
                pop(&ctx)?;
            }

            Instruction::Branch { target } => set_ip(&ctx, target as usize),
            Instruction::BranchIfTrue { target } => {
                let value = pop(&ctx)?;
                if value == rt.globals.true_obj {
                    set_ip(&ctx, target as usize);
                }
            }
            Instruction::BranchIfFalse { target } => {
                let value = pop(&ctx)?;
                if value == rt.globals.false_obj {
                    set_ip(&ctx, target as usize);
                }
            }

            Instruction::Breakpoint => {
                tracing::trace!("breakpoint");
            }
        }
    }
}

/// Small-integer fast path for `<`, `<=`, `+`. Returns `None` when the
/// operands are not both tagged integers (or the sum overflows), in
/// which case the full send runs.
fn small_int_binary(
    rt: &Runtime,
    selector: u8,
    lhs: Value,
    rhs: Value,
) -> Result<Option<Value>, RuntimeError> {
    if !lhs.is_int() || !rhs.is_int() {
        return Ok(None);
    }
    let (a, b) = unsafe { (lhs.to_int(), rhs.to_int()) };
    Ok(match selector {
        0 => Some(bool_object(rt, a < b)),
        1 => Some(bool_object(rt, a <= b)),
        2 => a.checked_add(b).map(Value::from_int),
        other => return Err(RuntimeError::InvalidConstant { constant: other }),
    })
}

fn bool_object(rt: &Runtime, value: bool) -> Value {
    if value {
        rt.globals.true_obj
    } else {
        rt.globals.false_obj
    }
}

/// Whether `target` is still on the activation chain starting at
/// `from`, following `previous` links down to nil.
fn chain_contains(globals: &Globals, from: Value, target: Value) -> bool {
    let mut current = from;
    while current.is_ref() && current != globals.nil {
        if current == target {
            return true;
        }
        current = unsafe { current.as_ref::<Context>() }.previous;
    }
    false
}

// ── context accessors (all via the pinned handle) ──────────────────

fn set_ip(ctx: &Handle<'_, Context>, ip: usize) {
    unsafe {
        (*ctx.value().as_ptr::<Context>()).instruction_ptr = Value::from_int(ip as i32);
    }
}

fn receiver(ctx: &Handle<'_, Context>) -> Value {
    argument(ctx, 0)
}

fn argument(ctx: &Handle<'_, Context>, index: usize) -> Value {
    let c: &Context = unsafe { ctx.value().as_ref() };
    unsafe { c.arguments.as_ref::<RawObject>() }.field_at(index)
}

fn temporaries<'a>(ctx: &'a Handle<'_, Context>) -> TempView<'a> {
    TempView { ctx }
}

/// Thin view re-reading the temporaries array through the context
/// handle on every access.
struct TempView<'a> {
    ctx: &'a Handle<'a, Context>,
}

impl TempView<'_> {
    fn value(&self) -> Value {
        let c: &Context = unsafe { self.ctx.value().as_ref() };
        c.temporaries
    }

    fn field_at(&self, index: usize) -> Value {
        unsafe { self.value().as_ref::<RawObject>() }.field_at(index)
    }
}

fn literal(ctx: &Handle<'_, Context>, index: usize) -> Value {
    let c: &Context = unsafe { ctx.value().as_ref() };
    let method: &Method = unsafe { c.method.as_ref() };
    unsafe { method.literals.as_ref::<RawObject>() }.field_at(index)
}

fn push(ctx: &Handle<'_, Context>, value: Value) -> Result<(), RuntimeError> {
    unsafe {
        let c = &mut *ctx.value().as_ptr::<Context>();
        let stack = &mut *c.stack.as_ptr::<RawObject>();
        let top = c.stack_top.to_int() as usize;
        if top >= stack.slot_count() {
            return Err(RuntimeError::StackOverflow);
        }
        stack.set_field(top, value);
        c.stack_top = Value::from_int((top + 1) as i32);
    }
    Ok(())
}

fn pop(ctx: &Handle<'_, Context>) -> Result<Value, RuntimeError> {
    unsafe {
        let c = &mut *ctx.value().as_ptr::<Context>();
        let top = c.stack_top.to_int() as usize;
        if top == 0 {
            return Err(RuntimeError::StackUnderflow);
        }
        let stack: &RawObject = c.stack.as_ref();
        c.stack_top = Value::from_int((top - 1) as i32);
        Ok(stack.field_at(top - 1))
    }
}

fn top(ctx: &Handle<'_, Context>) -> Result<Value, RuntimeError> {
    unsafe {
        let c: &Context = ctx.value().as_ref();
        let top = c.stack_top.to_int() as usize;
        if top == 0 {
            return Err(RuntimeError::StackUnderflow);
        }
        let stack: &RawObject = c.stack.as_ref();
        Ok(stack.field_at(top - 1))
    }
}
