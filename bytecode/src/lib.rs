//! Bytecode surface of the VM: the instruction encoding shared with the
//! interpreter, a checked decoder, a builder for assembling methods, and
//! the control-flow analyzer that reconstructs per-method graphs with
//! phi nodes at joins.

mod analyzer;
mod builder;
mod decoder;
mod graph;
mod instruction;
mod op;

pub use analyzer::{build_graph, build_graph_from, AnalyzeError};
pub use builder::{BytecodeBuilder, Label};
pub use decoder::{decode_at, DecodeError, InstructionStream};
pub use graph::{
    BasicBlock, BlockId, ControlGraph, Incoming, Node, NodeId, NodeKind,
    NodeVisitor, Traversal,
};
pub use instruction::Instruction;
pub use op::{Op, Special};
