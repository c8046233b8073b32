/// Bytecode opcodes.
///
/// An instruction byte packs the opcode in the high nibble and a 4-bit
/// operand in the low nibble. [`Extended`](Op::Extended) escapes to an
/// 8-bit operand: the low nibble carries the real opcode and the next
/// byte the operand. [`DoSpecial`](Op::DoSpecial) instructions put a
/// [`Special`] code in the low nibble; branch targets follow as 16-bit
/// little-endian absolute byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    /// Prefix: low nibble is the opcode, the next byte the operand.
    Extended = 0,
    PushInstance = 1,
    PushArgument = 2,
    PushTemporary = 3,
    PushLiteral = 4,
    /// Operand 0–9 pushes that integer; 10 nil, 11 true, 12 false.
    PushConstant = 5,
    AssignInstance = 6,
    AssignTemporary = 7,
    /// Pop the operand count into a fresh argument array.
    MarkArguments = 8,
    /// Operand: literal index of the selector symbol.
    SendMessage = 9,
    /// Operand: 0 isNil, 1 notNil.
    SendUnary = 10,
    /// Operand: 0 `<`, 1 `<=`, 2 `+`.
    SendBinary = 11,
    /// Operand: argument-injection location; a 16-bit target past the
    /// block body follows, and the body begins right after it.
    PushBlock = 12,
    /// Operand: argument count; the primitive number is the next byte.
    DoPrimitive = 13,
    DoSpecial = 15,
}

impl Op {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Extended),
            1 => Some(Self::PushInstance),
            2 => Some(Self::PushArgument),
            3 => Some(Self::PushTemporary),
            4 => Some(Self::PushLiteral),
            5 => Some(Self::PushConstant),
            6 => Some(Self::AssignInstance),
            7 => Some(Self::AssignTemporary),
            8 => Some(Self::MarkArguments),
            9 => Some(Self::SendMessage),
            10 => Some(Self::SendUnary),
            11 => Some(Self::SendBinary),
            12 => Some(Self::PushBlock),
            13 => Some(Self::DoPrimitive),
            15 => Some(Self::DoSpecial),
            _ => None,
        }
    }
}

/// `DoSpecial` sub-codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Special {
    /// Return the receiver from the current method.
    SelfReturn = 1,
    /// Return the stack top from the current method.
    StackReturn = 2,
    /// Non-local return: unwind to the block's creating context.
    BlockReturn = 3,
    Duplicate = 4,
    PopTop = 5,
    /// Unconditional branch; 16-bit absolute target follows.
    Branch = 6,
    BranchIfTrue = 7,
    BranchIfFalse = 8,
    /// Send through the superclass of the method's owner; the selector
    /// literal index is the next byte.
    SendToSuper = 11,
    Breakpoint = 12,
}

impl Special {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::SelfReturn),
            2 => Some(Self::StackReturn),
            3 => Some(Self::BlockReturn),
            4 => Some(Self::Duplicate),
            5 => Some(Self::PopTop),
            6 => Some(Self::Branch),
            7 => Some(Self::BranchIfTrue),
            8 => Some(Self::BranchIfFalse),
            11 => Some(Self::SendToSuper),
            12 => Some(Self::Breakpoint),
            _ => None,
        }
    }
}
