use crate::op::{Op, Special};

/// A forward branch whose 16-bit target has not been resolved yet.
/// Created by the branch emitters; resolve with [`BytecodeBuilder::bind`].
#[derive(Debug)]
pub struct Label {
    /// Position of the target bytes in the buffer.
    patch_pos: usize,
}

/// Builds a bytecode byte sequence.
///
/// Operands above 15 are emitted through the `Extended` prefix
/// automatically. Branch targets are absolute byte offsets, patched in
/// little-endian when the label is bound.
pub struct BytecodeBuilder {
    buf: Vec<u8>,
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Current byte offset in the stream.
    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit(&mut self, op: Op, operand: u8) {
        if operand <= 0x0F {
            self.buf.push(((op as u8) << 4) | operand);
        } else {
            self.buf.push(op as u8);
            self.buf.push(operand);
        }
    }

    fn emit_special(&mut self, special: Special) {
        self.buf
            .push(((Op::DoSpecial as u8) << 4) | special as u8);
    }

    fn emit_target_placeholder(&mut self) -> Label {
        let patch_pos = self.buf.len();
        self.buf.extend_from_slice(&[0, 0]);
        Label { patch_pos }
    }

    /// Point `label` at the current offset.
    pub fn bind(&mut self, label: Label) {
        let target = self.buf.len() as u16;
        self.buf[label.patch_pos..label.patch_pos + 2]
            .copy_from_slice(&target.to_le_bytes());
    }

    // ── instructions ───────────────────────────────────────────────

    pub fn push_instance(&mut self, index: u8) {
        self.emit(Op::PushInstance, index);
    }

    pub fn push_argument(&mut self, index: u8) {
        self.emit(Op::PushArgument, index);
    }

    pub fn push_temporary(&mut self, index: u8) {
        self.emit(Op::PushTemporary, index);
    }

    pub fn push_literal(&mut self, index: u8) {
        self.emit(Op::PushLiteral, index);
    }

    pub fn push_constant(&mut self, constant: u8) {
        self.emit(Op::PushConstant, constant);
    }

    pub fn assign_instance(&mut self, index: u8) {
        self.emit(Op::AssignInstance, index);
    }

    pub fn assign_temporary(&mut self, index: u8) {
        self.emit(Op::AssignTemporary, index);
    }

    pub fn mark_arguments(&mut self, count: u8) {
        self.emit(Op::MarkArguments, count);
    }

    pub fn send_message(&mut self, literal: u8) {
        self.emit(Op::SendMessage, literal);
    }

    pub fn send_unary(&mut self, kind: u8) {
        self.emit(Op::SendUnary, kind);
    }

    pub fn send_binary(&mut self, selector: u8) {
        self.emit(Op::SendBinary, selector);
    }

    /// Emit `PushBlock`; the returned label must be bound to the byte
    /// right after the block body. The body begins at
    /// [`current_offset`](Self::current_offset) after this call.
    pub fn push_block(&mut self, arg_location: u8) -> Label {
        self.emit(Op::PushBlock, arg_location);
        self.emit_target_placeholder()
    }

    pub fn do_primitive(&mut self, argc: u8, primitive: u8) {
        self.emit(Op::DoPrimitive, argc);
        self.buf.push(primitive);
    }

    pub fn self_return(&mut self) {
        self.emit_special(Special::SelfReturn);
    }

    pub fn stack_return(&mut self) {
        self.emit_special(Special::StackReturn);
    }

    pub fn block_return(&mut self) {
        self.emit_special(Special::BlockReturn);
    }

    pub fn duplicate(&mut self) {
        self.emit_special(Special::Duplicate);
    }

    pub fn pop_top(&mut self) {
        self.emit_special(Special::PopTop);
    }

    pub fn branch(&mut self) -> Label {
        self.emit_special(Special::Branch);
        self.emit_target_placeholder()
    }

    pub fn branch_if_true(&mut self) -> Label {
        self.emit_special(Special::BranchIfTrue);
        self.emit_target_placeholder()
    }

    pub fn branch_if_false(&mut self) -> Label {
        self.emit_special(Special::BranchIfFalse);
        self.emit_target_placeholder()
    }

    pub fn send_to_super(&mut self, literal: u8) {
        self.emit_special(Special::SendToSuper);
        self.buf.push(literal);
    }

    pub fn breakpoint(&mut self) {
        self.emit_special(Special::Breakpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::InstructionStream;
    use crate::Instruction;

    fn decode_all(bytes: &[u8]) -> Vec<(usize, Instruction)> {
        InstructionStream::new(bytes)
            .collect::<Result<Vec<_>, _>>()
            .expect("builder output must decode")
    }

    #[test]
    fn round_trip() {
        let mut b = BytecodeBuilder::new();
        b.push_argument(1);
        b.push_temporary(200);
        b.mark_arguments(2);
        b.send_message(3);
        b.do_primitive(2, 10);
        b.stack_return();

        let decoded = decode_all(b.as_bytes());
        let instrs: Vec<_> = decoded.into_iter().map(|(_, i)| i).collect();
        assert_eq!(
            instrs,
            vec![
                Instruction::PushArgument { index: 1 },
                Instruction::PushTemporary { index: 200 },
                Instruction::MarkArguments { count: 2 },
                Instruction::SendMessage { literal: 3 },
                Instruction::DoPrimitive { argc: 2, primitive: 10 },
                Instruction::StackReturn,
            ]
        );
    }

    #[test]
    fn labels_patch_branch_targets() {
        // if (arg1) push 1 else push 3; stack return — the ABAB half.
        let mut b = BytecodeBuilder::new();
        b.push_argument(1);
        let else_label = b.branch_if_false();
        b.push_constant(1);
        let end_label = b.branch();
        b.bind(else_label);
        b.push_constant(3);
        b.bind(end_label);
        b.stack_return();

        assert_eq!(
            b.as_bytes(),
            &[33, 248, 8, 0, 81, 246, 9, 0, 83, 242]
        );
    }

    #[test]
    fn push_block_label_skips_the_body() {
        let mut b = BytecodeBuilder::new();
        let end = b.push_block(1);
        let body = b.current_offset();
        b.push_constant(5);
        b.block_return();
        b.bind(end);
        b.stack_return();

        let decoded = decode_all(b.as_bytes());
        let (offset, instr) = decoded[0];
        assert_eq!(offset, 0);
        match instr {
            Instruction::PushBlock { arg_location, end } => {
                assert_eq!(arg_location, 1);
                assert_eq!(end as usize, body + 2);
            }
            other => panic!("expected PushBlock, got {other}"),
        }
    }
}
