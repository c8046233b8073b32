//! The VM runtime: globals, message dispatch with inline caches, block
//! semantics with non-local return, the bytecode interpreter, the image
//! loader, and the compiler interface consumed by dispatch.
//!
//! The runtime callback surface exported to compiled code maps onto
//! plain functions: [`alloc::new_ordinary_object`],
//! [`alloc::new_binary_object`], [`dispatch::send_message`],
//! [`blocks::create_block`], [`blocks::invoke_block`],
//! [`blocks::emit_block_return`], [`ObjectMemory::check_root`] and
//! [`primitives::bulk_replace`].

pub mod alloc;
pub mod blocks;
pub mod compile;
pub mod dispatch;
pub mod image;
pub mod interpreter;
pub mod primitives;
pub mod process;
pub mod special;

use std::collections::HashMap;

use bytecode::{AnalyzeError, DecodeError};
use heap::{AllocError, MemoryStats, ObjectMemory, RootProvider};
use object::{Globals, Value};

use compile::{InterpreterCompiler, MethodCompiler};
use dispatch::{BlockCache, CacheStats, MethodCache};

/// Errors surfaced by the runtime. Allocation failures and a missing
/// `doesNotUnderstand:` are unrecoverable; the process driver reports
/// them and terminates.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    Allocation(AllocError),
    NoDoesNotUnderstand { selector: String },
    Decode(DecodeError),
    Analyze(AnalyzeError),
    UnknownPrimitive { primitive: u8 },
    PrimitiveFailed { primitive: u8 },
    UnknownBlockEntry { offset: usize },
    InvalidConstant { constant: u8 },
    BlockReturnOutsideBlock,
    NonLocalReturnExpired,
    IntegerOverflow,
    StackOverflow,
    StackUnderflow,
    MissingInitialMethod,
}

impl From<AllocError> for RuntimeError {
    fn from(e: AllocError) -> Self {
        Self::Allocation(e)
    }
}

impl From<DecodeError> for RuntimeError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<AnalyzeError> for RuntimeError {
    fn from(e: AnalyzeError) -> Self {
        Self::Analyze(e)
    }
}

impl core::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Allocation(e) => write!(f, "{e}"),
            Self::NoDoesNotUnderstand { selector } => {
                write!(f, "#{selector} not understood and doesNotUnderstand: is missing")
            }
            Self::Decode(e) => write!(f, "{e}"),
            Self::Analyze(e) => write!(f, "{e}"),
            Self::UnknownPrimitive { primitive } => {
                write!(f, "unknown primitive {primitive}")
            }
            Self::PrimitiveFailed { primitive } => {
                write!(f, "primitive {primitive} failed")
            }
            Self::UnknownBlockEntry { offset } => {
                write!(f, "no block entry at byte offset {offset}")
            }
            Self::InvalidConstant { constant } => {
                write!(f, "invalid push constant {constant}")
            }
            Self::BlockReturnOutsideBlock => {
                write!(f, "block return outside a block activation")
            }
            Self::NonLocalReturnExpired => {
                write!(f, "non-local return target has already returned")
            }
            Self::IntegerOverflow => write!(f, "small integer overflow"),
            Self::StackOverflow => write!(f, "context stack overflow"),
            Self::StackUnderflow => write!(f, "context stack underflow"),
            Self::MissingInitialMethod => write!(f, "image has no initial method"),
        }
    }
}

/// Outcome of one native entry or send.
///
/// Non-local return travels as an explicit control signal, not as
/// unwinding: every activation site inspects the result and either
/// converts it to a normal return (when the target is the context it
/// activated) or propagates it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Control {
    Normal(Value),
    NonLocal { value: Value, target: Value },
}

pub type ExecResult = Result<Control, RuntimeError>;

/// Runtime-level activity counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeCounters {
    pub messages_dispatched: u64,
    pub objects_allocated: u64,
    pub blocks_invoked: u64,
}

/// Read-only statistics snapshot across memory, dispatch, and compile.
#[derive(Debug, Clone)]
pub struct RuntimeStats {
    pub memory: MemoryStats,
    pub method_cache: CacheStats,
    pub block_cache: CacheStats,
    pub counters: RuntimeCounters,
    pub methods_compiled: u64,
}

/// The VM runtime: the object memory, the globals record, both inline
/// caches, and the compiler. Threaded explicitly through all APIs — a
/// host embeds one runtime per VM.
pub struct Runtime {
    pub memory: Box<ObjectMemory>,
    pub globals: Globals,
    pub method_cache: MethodCache,
    pub block_cache: BlockCache,
    pub compiler: Box<dyn MethodCompiler>,
    /// Interned symbols: Rust string → static-heap symbol.
    pub intern_table: HashMap<String, Value>,
    pub counters: RuntimeCounters,
}

/// Split borrow of everything the collector must treat as roots besides
/// the registered sets: globals, cache entries, interned symbols.
pub(crate) struct RuntimeRoots<'a> {
    globals: &'a mut Globals,
    method_cache: &'a mut MethodCache,
    block_cache: &'a mut BlockCache,
    intern_table: &'a mut HashMap<String, Value>,
}

impl RootProvider for RuntimeRoots<'_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.globals.visit(visitor);
        self.method_cache.visit_roots(visitor);
        self.block_cache.visit_roots(visitor);
        for symbol in self.intern_table.values_mut() {
            visitor(symbol);
        }
    }
}

impl Runtime {
    pub fn new(memory: Box<ObjectMemory>, globals: Globals) -> Self {
        Self {
            memory,
            globals,
            method_cache: MethodCache::new(),
            block_cache: BlockCache::new(),
            compiler: Box::new(InterpreterCompiler::new()),
            intern_table: HashMap::new(),
            counters: RuntimeCounters::default(),
        }
    }

    pub(crate) fn memory_and_roots(&mut self) -> (&mut ObjectMemory, RuntimeRoots<'_>) {
        (
            &mut *self.memory,
            RuntimeRoots {
                globals: &mut self.globals,
                method_cache: &mut self.method_cache,
                block_cache: &mut self.block_cache,
                intern_table: &mut self.intern_table,
            },
        )
    }

    /// Force a collection with the runtime's full root set.
    pub fn collect_garbage(&mut self) {
        let (memory, mut roots) = self.memory_and_roots();
        memory.collect(&mut roots);
    }

    /// Intern `name` as a symbol, allocated once in the static heap.
    pub fn intern(&mut self, name: &str) -> Value {
        if let Some(&symbol) = self.intern_table.get(name) {
            return symbol;
        }
        let symbol =
            alloc::static_byte_object(&mut self.memory, self.globals.string_class, name.as_bytes());
        self.intern_table.insert(name.to_string(), symbol);
        symbol
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            memory: self.memory.snapshot(),
            method_cache: self.method_cache.stats(),
            block_cache: self.block_cache.stats(),
            counters: self.counters,
            methods_compiled: self.compiler.methods_compiled(),
        }
    }

    /// Human-readable text of a symbol or string object.
    pub fn symbol_text(&self, symbol: Value) -> String {
        if !symbol.is_ref() {
            return format!("{symbol:?}");
        }
        let bytes = unsafe { symbol.as_ref::<object::ByteObject>() };
        if !bytes.header.size.is_binary() {
            return format!("{symbol:?}");
        }
        String::from_utf8_lossy(bytes.bytes()).into_owned()
    }
}
