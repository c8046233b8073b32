use std::collections::{BTreeMap, BTreeSet};

use crate::decoder::{decode_at, DecodeError};
use crate::graph::{BlockId, ControlGraph, Incoming, NodeId};
use crate::Instruction;

/// Control-flow reconstruction failure. All variants are fatal for the
/// method being analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzeError {
    Decode(DecodeError),
    StackUnderflow { offset: usize },
    UnbalancedJoin { offset: usize },
}

impl From<DecodeError> for AnalyzeError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl core::fmt::Display for AnalyzeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "{e}"),
            Self::StackUnderflow { offset } => {
                write!(f, "simulated stack underflow at byte {offset}")
            }
            Self::UnbalancedJoin { offset } => {
                write!(f, "unbalanced stack at join, block at byte {offset}")
            }
        }
    }
}

/// Build the control-flow graph of a method's bytecode.
pub fn build_graph(bytecode: &[u8]) -> Result<ControlGraph, AnalyzeError> {
    build_graph_from(bytecode, 0)
}

/// Build the control-flow graph starting at `entry` — used for block
/// bodies, which are separate compilation units inside the enclosing
/// method's bytecode.
pub fn build_graph_from(
    bytecode: &[u8],
    entry: usize,
) -> Result<ControlGraph, AnalyzeError> {
    let instructions = decode_linear(bytecode, entry)?;
    let raw_blocks = partition_blocks(&instructions, entry);
    Builder::new(&raw_blocks, entry).build()
}

fn decode_linear(
    bytecode: &[u8],
    entry: usize,
) -> Result<Vec<(usize, Instruction)>, AnalyzeError> {
    let mut instructions = Vec::new();
    let mut pos = entry;
    while pos < bytecode.len() {
        let (instruction, next) = decode_at(bytecode, pos)?;
        instructions.push((pos, instruction));
        pos = next;
    }
    Ok(instructions)
}

/// A straight-line run of instructions before graph construction.
struct RawBlock {
    start: usize,
    instructions: Vec<(usize, Instruction)>,
    /// Offsets of successor blocks.
    successors: Vec<usize>,
}

fn successor_offsets(last: (usize, Instruction), fall: Option<usize>) -> Vec<usize> {
    let (_, instruction) = last;
    match instruction {
        Instruction::Branch { target } => vec![target as usize],
        Instruction::BranchIfTrue { target } | Instruction::BranchIfFalse { target } => {
            let mut succ = vec![target as usize];
            if let Some(fall) = fall {
                if !succ.contains(&fall) {
                    succ.push(fall);
                }
            }
            succ
        }
        // The mutator pushes the block object and continues past the
        // body; the body itself is entered only through invocation.
        Instruction::PushBlock { end, .. } => vec![end as usize],
        Instruction::SelfReturn | Instruction::StackReturn | Instruction::BlockReturn => {
            Vec::new()
        }
        _ => fall.into_iter().collect(),
    }
}

fn partition_blocks(instructions: &[(usize, Instruction)], entry: usize) -> Vec<RawBlock> {
    let mut leaders: BTreeSet<usize> = BTreeSet::new();
    leaders.insert(entry);
    let mut iter = instructions.iter().peekable();
    while let Some(&(_, instruction)) = iter.next() {
        let next_offset = iter.peek().map(|&&(off, _)| off);
        match instruction {
            Instruction::Branch { target }
            | Instruction::BranchIfTrue { target }
            | Instruction::BranchIfFalse { target } => {
                leaders.insert(target as usize);
                if let Some(off) = next_offset {
                    leaders.insert(off);
                }
            }
            Instruction::PushBlock { end, .. } => {
                leaders.insert(end as usize);
                if let Some(off) = next_offset {
                    leaders.insert(off);
                }
            }
            Instruction::SelfReturn
            | Instruction::StackReturn
            | Instruction::BlockReturn => {
                if let Some(off) = next_offset {
                    leaders.insert(off);
                }
            }
            _ => {}
        }
    }

    let mut blocks: Vec<RawBlock> = Vec::new();
    for &(offset, instruction) in instructions {
        let starts_block = leaders.contains(&offset);
        if starts_block || blocks.is_empty() {
            blocks.push(RawBlock {
                start: offset,
                instructions: Vec::new(),
                successors: Vec::new(),
            });
        }
        let block = blocks.last_mut().expect("block just ensured");
        block.instructions.push((offset, instruction));
    }

    // Resolve successor offsets now that boundaries are known.
    let ends: Vec<usize> = blocks
        .iter()
        .skip(1)
        .map(|b| b.start)
        .chain(core::iter::once(usize::MAX))
        .collect();
    for (i, block) in blocks.iter_mut().enumerate() {
        let last = *block
            .instructions
            .last()
            .expect("raw blocks are never empty");
        let fall = if ends[i] == usize::MAX { None } else { Some(ends[i]) };
        block.successors = successor_offsets(last, fall);
    }
    blocks
}

struct Builder<'a> {
    raw: &'a [RawBlock],
    entry: usize,
    graph: ControlGraph,
    /// Raw-block index → graph block (reachable blocks only).
    ids: BTreeMap<usize, BlockId>,
    /// Simulated exit stacks per graph block.
    exits: Vec<Option<Vec<NodeId>>>,
    entry_depths: Vec<usize>,
}

impl<'a> Builder<'a> {
    fn new(raw: &'a [RawBlock], entry: usize) -> Self {
        Self {
            raw,
            entry,
            graph: ControlGraph::default(),
            ids: BTreeMap::new(),
            exits: Vec::new(),
            entry_depths: Vec::new(),
        }
    }

    fn raw_index_at(&self, offset: usize) -> Option<usize> {
        self.raw.iter().position(|b| b.start == offset)
    }

    fn build(mut self) -> Result<ControlGraph, AnalyzeError> {
        if self.raw.is_empty() {
            return Ok(self.graph);
        }

        // Reachability from the entry block; unreachable runs (block
        // bodies skipped over by PushBlock) get no nodes.
        let entry_idx = self
            .raw_index_at(self.entry)
            .unwrap_or(0);
        let mut reachable = vec![false; self.raw.len()];
        let mut work = vec![entry_idx];
        while let Some(i) = work.pop() {
            if reachable[i] {
                continue;
            }
            reachable[i] = true;
            for &succ in &self.raw[i].successors {
                if let Some(j) = self.raw_index_at(succ) {
                    if !reachable[j] {
                        work.push(j);
                    }
                }
            }
        }

        // Materialize reachable blocks in offset order and link edges.
        for (i, raw) in self.raw.iter().enumerate() {
            if reachable[i] {
                let id = self.graph.add_block(raw.start);
                self.ids.insert(i, id);
                self.exits.push(None);
                self.entry_depths.push(0);
            }
        }
        for (&i, &id) in self.ids.iter() {
            for &succ in &self.raw[i].successors {
                if let Some(j) = self.raw_index_at(succ) {
                    if let Some(&succ_id) = self.ids.get(&j) {
                        self.graph.link_blocks(id, succ_id);
                    }
                }
            }
        }

        // Simulate in offset order; forward control flow means every
        // non-loop predecessor is processed before its successors.
        let order: Vec<(usize, BlockId)> =
            self.ids.iter().map(|(&i, &id)| (i, id)).collect();
        for &(raw_idx, block_id) in &order {
            self.simulate_block(raw_idx, block_id)?;
        }

        // Control edges from each predecessor's last instruction to the
        // block's first instruction.
        for &(_, block_id) in &order {
            let first = match self.graph.block(block_id).nodes.first() {
                Some(&first) => first,
                None => continue,
            };
            let preds: Vec<BlockId> =
                self.graph.block(block_id).predecessors.to_vec();
            for pred in preds {
                if let Some(&last) = self.graph.block(pred).nodes.last() {
                    self.graph.add_edge(last, first);
                }
            }
        }

        // Back edges must agree with the depth the join was built with.
        for &(raw_idx, block_id) in &order {
            for &succ in &self.raw[raw_idx].successors {
                if let Some(j) = self.raw_index_at(succ) {
                    if let Some(&succ_id) = self.ids.get(&j) {
                        if succ_id.0 <= block_id.0 {
                            let exit_depth = self.exits[block_id.0 as usize]
                                .as_ref()
                                .map_or(0, |s| s.len());
                            if exit_depth != self.entry_depths[succ_id.0 as usize] {
                                return Err(AnalyzeError::UnbalancedJoin {
                                    offset: self.raw[j].start,
                                });
                            }
                        }
                    }
                }
            }
        }

        Ok(self.graph)
    }

    fn entry_stack(&mut self, block_id: BlockId) -> Result<Vec<NodeId>, AnalyzeError> {
        let block_start = self.graph.block(block_id).start;
        let preds: Vec<BlockId> = self.graph.block(block_id).predecessors.to_vec();
        let processed: Vec<(BlockId, Vec<NodeId>)> = preds
            .iter()
            .filter_map(|&p| {
                self.exits[p.0 as usize].as_ref().map(|s| (p, s.clone()))
            })
            .collect();

        if processed.is_empty() {
            return Ok(Vec::new());
        }
        let depth = processed[0].1.len();
        if processed.iter().any(|(_, s)| s.len() != depth) {
            return Err(AnalyzeError::UnbalancedJoin { offset: block_start });
        }
        if processed.len() == 1 && preds.len() == 1 {
            return Ok(processed.into_iter().next().map(|(_, s)| s).unwrap_or_default());
        }

        // Multi-producer join: every live slot becomes a phi. An
        // incoming value that is itself a phi is materialized as a
        // per-path phi with the same incoming list, so a phi-of-phis
        // keeps one distinct inner phi per predecessor path.
        let mut stack = Vec::with_capacity(depth);
        for slot in 0..depth {
            let phi = self.graph.add_phi_node(block_id, block_start);
            for (pred, exit) in &processed {
                let mut producer = exit[slot];
                if self.graph.node(producer).is_phi() {
                    let copy = self.graph.add_phi_node(block_id, block_start);
                    let inherited: Vec<Incoming> =
                        self.graph.node(producer).incoming().to_vec();
                    for incoming in inherited {
                        self.graph.add_incoming(copy, incoming);
                    }
                    producer = copy;
                }
                self.graph.add_incoming(phi, Incoming { block: *pred, node: producer });
            }
            stack.push(phi);
        }
        Ok(stack)
    }

    fn simulate_block(
        &mut self,
        raw_idx: usize,
        block_id: BlockId,
    ) -> Result<(), AnalyzeError> {
        let mut stack = self.entry_stack(block_id)?;
        self.entry_depths[block_id.0 as usize] = stack.len();

        let instructions = self.raw[raw_idx].instructions.clone();
        let mut prev: Option<NodeId> = None;
        for (offset, instruction) in instructions {
            let node = self.graph.add_instruction_node(block_id, offset, instruction);
            if let Some(prev) = prev {
                self.graph.add_edge(prev, node);
            }
            prev = Some(node);
            self.apply_stack_effect(node, offset, instruction, &mut stack)?;
        }

        self.exits[block_id.0 as usize] = Some(stack);
        Ok(())
    }

    fn apply_stack_effect(
        &mut self,
        node: NodeId,
        offset: usize,
        instruction: Instruction,
        stack: &mut Vec<NodeId>,
    ) -> Result<(), AnalyzeError> {
        let mut pop = |stack: &mut Vec<NodeId>| {
            stack.pop().ok_or(AnalyzeError::StackUnderflow { offset })
        };

        match instruction {
            Instruction::PushInstance { .. }
            | Instruction::PushArgument { .. }
            | Instruction::PushTemporary { .. }
            | Instruction::PushLiteral { .. }
            | Instruction::PushConstant { .. }
            | Instruction::PushBlock { .. } => stack.push(node),

            Instruction::AssignInstance { .. } | Instruction::AssignTemporary { .. } => {
                // Assignments peek: the value stays on the stack.
                let &top = stack
                    .last()
                    .ok_or(AnalyzeError::StackUnderflow { offset })?;
                self.graph.add_argument(node, top);
            }

            Instruction::MarkArguments { count } => {
                let mut args = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    args.push(pop(stack)?);
                }
                args.reverse();
                for arg in args {
                    self.graph.add_argument(node, arg);
                }
                stack.push(node);
            }

            Instruction::SendMessage { .. }
            | Instruction::SendToSuper { .. }
            | Instruction::SendUnary { .. } => {
                let arg = pop(stack)?;
                self.graph.add_argument(node, arg);
                stack.push(node);
            }

            Instruction::SendBinary { .. } => {
                let rhs = pop(stack)?;
                let lhs = pop(stack)?;
                self.graph.add_argument(node, lhs);
                self.graph.add_argument(node, rhs);
                stack.push(node);
            }

            Instruction::DoPrimitive { argc, .. } => {
                let mut args = Vec::with_capacity(argc as usize);
                for _ in 0..argc {
                    args.push(pop(stack)?);
                }
                args.reverse();
                for arg in args {
                    self.graph.add_argument(node, arg);
                }
                stack.push(node);
            }

            Instruction::Duplicate => {
                let &top = stack
                    .last()
                    .ok_or(AnalyzeError::StackUnderflow { offset })?;
                self.graph.add_argument(node, top);
                stack.push(top);
            }

            Instruction::PopTop => {
                pop(stack)?;
            }

            Instruction::StackReturn | Instruction::BlockReturn => {
                let value = pop(stack)?;
                self.graph.add_argument(node, value);
            }

            Instruction::BranchIfTrue { .. } | Instruction::BranchIfFalse { .. } => {
                let condition = pop(stack)?;
                self.graph.add_argument(node, condition);
            }

            Instruction::Branch { .. }
            | Instruction::SelfReturn
            | Instruction::Breakpoint => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeVisitor, Traversal};
    use crate::BytecodeBuilder;

    /// Two balanced if/else chains feeding one binary send.
    const ABAB: [u8; 19] = [
        33, 248, 8, 0, 81, 246, 9, 0, 83, 34, 248, 17, 0, 85, 246, 18, 0, 87, 178,
    ];

    fn is_push_constant(graph: &ControlGraph, id: NodeId) -> bool {
        matches!(
            graph.node(id).instruction(),
            Some(Instruction::PushConstant { .. })
        )
    }

    struct SendBinaryScan {
        found: Option<NodeId>,
    }

    impl NodeVisitor for SendBinaryScan {
        fn visit_node(&mut self, graph: &ControlGraph, node: NodeId) -> Traversal {
            if matches!(
                graph.node(node).instruction(),
                Some(Instruction::SendBinary { .. })
            ) {
                self.found = Some(node);
                return Traversal::Stop;
            }
            Traversal::Continue
        }
    }

    #[test]
    fn abab_send_binary_sees_phi_of_phis() {
        let graph = build_graph(&ABAB).expect("ABAB builds");

        let mut scan = SendBinaryScan { found: None };
        assert!(!graph.traverse_post_order(&mut scan), "scan should stop early");
        let send = scan.found.expect("sendBinary node");

        let node = graph.node(send);
        // Two control edges from the branch arms plus two data edges.
        assert_eq!(node.in_edges().len(), 4);
        assert_eq!(node.arguments().len(), 2);
        assert_ne!(node.argument(0), node.argument(1));

        // First argument: a phi whose incoming set is two distinct
        // phis, each merging two pushed constants.
        let first = graph.node(node.argument(0));
        assert!(first.is_phi());
        assert_eq!(first.incoming().len(), 2);
        let inner_a = first.incoming()[0].node;
        let inner_b = first.incoming()[1].node;
        assert_ne!(inner_a, inner_b);
        for inner in [inner_a, inner_b] {
            let inner_node = graph.node(inner);
            assert!(inner_node.is_phi());
            assert_eq!(inner_node.incoming().len(), 2);
            for incoming in inner_node.incoming() {
                assert!(is_push_constant(&graph, incoming.node));
            }
        }

        // Second argument: a phi over the two second-arm constants.
        let second = graph.node(node.argument(1));
        assert!(second.is_phi());
        assert_eq!(second.incoming().len(), 2);
        for incoming in second.incoming() {
            assert!(is_push_constant(&graph, incoming.node));
        }
    }

    #[test]
    fn single_join_inserts_one_phi() {
        let mut b = BytecodeBuilder::new();
        b.push_argument(1);
        let else_label = b.branch_if_false();
        b.push_constant(1);
        let end_label = b.branch();
        b.bind(else_label);
        b.push_constant(3);
        b.bind(end_label);
        b.stack_return();

        let graph = build_graph(b.as_bytes()).expect("builds");
        let phis: Vec<NodeId> = graph
            .node_ids()
            .filter(|&id| graph.node(id).is_phi())
            .collect();
        assert_eq!(phis.len(), 1);
        let phi = graph.node(phis[0]);
        assert_eq!(phi.incoming().len(), 2);
        for incoming in phi.incoming() {
            assert!(is_push_constant(&graph, incoming.node));
        }

        // The return consumes the phi.
        let ret = graph
            .node_ids()
            .find(|&id| {
                matches!(graph.node(id).instruction(), Some(Instruction::StackReturn))
            })
            .expect("return node");
        assert_eq!(graph.node(ret).arguments(), &[phis[0]]);
    }

    #[test]
    fn stack_underflow_is_fatal() {
        let mut b = BytecodeBuilder::new();
        b.pop_top();
        let err = build_graph(b.as_bytes()).unwrap_err();
        assert_eq!(err, AnalyzeError::StackUnderflow { offset: 0 });
    }

    #[test]
    fn unknown_opcode_is_fatal() {
        let err = build_graph(&[0xE5]).unwrap_err();
        assert!(matches!(err, AnalyzeError::Decode(_)));
    }

    #[test]
    fn unbalanced_join_is_fatal() {
        let mut b = BytecodeBuilder::new();
        b.push_argument(1);
        let else_label = b.branch_if_false();
        b.push_constant(1);
        b.push_constant(2);
        let end_label = b.branch();
        b.bind(else_label);
        b.push_constant(3);
        b.bind(end_label);
        b.stack_return();

        let err = build_graph(b.as_bytes()).unwrap_err();
        assert!(matches!(err, AnalyzeError::UnbalancedJoin { .. }));
    }

    #[test]
    fn block_bodies_are_analyzed_from_their_entry() {
        let mut b = BytecodeBuilder::new();
        let end = b.push_block(1);
        let body = b.current_offset();
        b.push_constant(5);
        b.block_return();
        b.bind(end);
        b.stack_return();
        let bytes = b.into_bytes();

        // The method graph skips the body entirely.
        let method_graph = build_graph(&bytes).expect("method builds");
        assert!(method_graph.node_ids().all(|id| {
            !matches!(
                method_graph.node(id).instruction(),
                Some(Instruction::BlockReturn)
            )
        }));

        // Pointing the analyzer at the body yields its own graph.
        let body_graph = build_graph_from(&bytes, body).expect("body builds");
        let kinds: Vec<Instruction> = body_graph
            .node_ids()
            .filter_map(|id| body_graph.node(id).instruction())
            .collect();
        assert_eq!(
            kinds,
            vec![
                Instruction::PushConstant { constant: 5 },
                Instruction::BlockReturn,
            ]
        );
    }
}
