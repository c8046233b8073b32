//! The object memory: a moving two-space collector with an optional
//! generational extension, a static (tenured-forever) heap, root
//! registries, and the handle protocol shared by the interpreter and
//! compiled code.

mod handles;
mod memory;

pub use handles::{Handle, HandleSet, HANDLE_SET_CAPACITY};
pub use memory::{
    AllocError, CollectorKind, HeapEvent, MemoryConfig, MemoryStats, NoRoots,
    ObjectMemory, RootProvider,
};
