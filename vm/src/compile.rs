//! The compiler interface consumed by dispatch, and the default
//! interpreter-backed implementation.
//!
//! The contract: `compile` yields a callable entry per method and emits
//! a separate entry per block in that method, discoverable by
//! `(method, block byte offset)`. A method is compiled at most once —
//! the compiler memoizes by qualified name, which survives both cache
//! eviction and object relocation.

use std::collections::HashMap;
use std::rc::Rc;

use bytecode::{build_graph, Instruction, InstructionStream};
use object::{ByteObject, Class, Globals, Method, Value};

use crate::{interpreter, ExecResult, Runtime, RuntimeError};

/// A callable native entry: activate with a context, get the result.
pub type NativeEntry = Rc<dyn Fn(&mut Runtime, Value) -> ExecResult>;

pub trait MethodCompiler {
    /// Translate `method` into a callable entry, emitting per-block
    /// entries as a side effect. Compiling the same method twice
    /// returns the memoized entry.
    fn compile(&mut self, globals: &Globals, method: Value) -> Result<NativeEntry, RuntimeError>;

    /// The entry for the block of `method` whose body starts at
    /// `block_ip`, if that method has been compiled.
    fn block_entry(
        &mut self,
        globals: &Globals,
        method: Value,
        block_ip: usize,
    ) -> Option<NativeEntry>;

    fn methods_compiled(&self) -> u64;
}

/// The default back end: entries run the bytecode interpreter on the
/// activated context. Method bytecode is validated up front by building
/// its control-flow graph, the same artifact a native back end lowers.
pub struct InterpreterCompiler {
    methods: HashMap<String, NativeEntry>,
    blocks: HashMap<(String, usize), NativeEntry>,
    compiled: u64,
}

impl InterpreterCompiler {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
            blocks: HashMap::new(),
            compiled: 0,
        }
    }

    /// Qualified `Class>>selector` name. Relocation-stable, so the memo
    /// honors the compile-once contract across collections.
    fn method_key(method: Value) -> String {
        let m: &Method = unsafe { method.as_ref() };
        let class_name = if m.class.is_ref() {
            let class: &Class = unsafe { m.class.as_ref() };
            symbol_to_string(class.name)
        } else {
            String::from("?")
        };
        format!("{}>>{}", class_name, symbol_to_string(m.name))
    }
}

fn symbol_to_string(symbol: Value) -> String {
    if !symbol.is_ref() {
        return String::from("?");
    }
    let bytes: &ByteObject = unsafe { symbol.as_ref() };
    if !bytes.header.size.is_binary() {
        return String::from("?");
    }
    String::from_utf8_lossy(bytes.bytes()).into_owned()
}

impl Default for InterpreterCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodCompiler for InterpreterCompiler {
    fn compile(&mut self, _globals: &Globals, method: Value) -> Result<NativeEntry, RuntimeError> {
        let key = Self::method_key(method);
        if let Some(entry) = self.methods.get(&key) {
            return Ok(entry.clone());
        }

        let bytes: Vec<u8> = {
            let m: &Method = unsafe { method.as_ref() };
            let code: &ByteObject = unsafe { m.byte_codes.as_ref() };
            code.bytes().to_vec()
        };

        // Reject malformed bytecode before the first activation; the
        // graph is what a native back end would lower.
        build_graph(&bytes)?;

        // One entry per PushBlock site: the instruction after the
        // operand bytes is the body start.
        let mut stream = InstructionStream::new(&bytes).peekable();
        while let Some(decoded) = stream.next() {
            let (_, instruction) = decoded?;
            if let Instruction::PushBlock { .. } = instruction {
                if let Some(Ok((body, _))) = stream.peek() {
                    let entry: NativeEntry = Rc::new(interpreter::execute);
                    self.blocks.insert((key.clone(), *body), entry);
                }
            }
        }

        let entry: NativeEntry = Rc::new(interpreter::execute);
        self.methods.insert(key, entry.clone());
        self.compiled += 1;
        tracing::debug!(compiled = self.compiled, "method compiled");
        Ok(entry)
    }

    fn block_entry(
        &mut self,
        _globals: &Globals,
        method: Value,
        block_ip: usize,
    ) -> Option<NativeEntry> {
        self.blocks.get(&(Self::method_key(method), block_ip)).cloned()
    }

    fn methods_compiled(&self) -> u64 {
        self.compiled
    }
}
