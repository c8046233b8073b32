use core::fmt;

/// A decoded instruction with operands resolved.
///
/// Operands are `u8` regardless of whether the instruction was encoded
/// in nibble or extended form; branch targets are absolute byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    PushInstance { index: u8 },
    PushArgument { index: u8 },
    PushTemporary { index: u8 },
    PushLiteral { index: u8 },
    PushConstant { constant: u8 },
    AssignInstance { index: u8 },
    AssignTemporary { index: u8 },
    MarkArguments { count: u8 },
    SendMessage { literal: u8 },
    SendUnary { kind: u8 },
    SendBinary { selector: u8 },
    PushBlock { arg_location: u8, end: u16 },
    DoPrimitive { argc: u8, primitive: u8 },
    SelfReturn,
    StackReturn,
    BlockReturn,
    Duplicate,
    PopTop,
    Branch { target: u16 },
    BranchIfTrue { target: u16 },
    BranchIfFalse { target: u16 },
    SendToSuper { literal: u8 },
    Breakpoint,
}

impl Instruction {
    /// Whether this instruction ends a basic block.
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Self::SelfReturn
                | Self::StackReturn
                | Self::BlockReturn
                | Self::Branch { .. }
                | Self::BranchIfTrue { .. }
                | Self::BranchIfFalse { .. }
        )
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PushInstance { index } => write!(f, "PushInstance {index}"),
            Self::PushArgument { index } => write!(f, "PushArgument {index}"),
            Self::PushTemporary { index } => write!(f, "PushTemporary {index}"),
            Self::PushLiteral { index } => write!(f, "PushLiteral {index}"),
            Self::PushConstant { constant } => write!(f, "PushConstant {constant}"),
            Self::AssignInstance { index } => write!(f, "AssignInstance {index}"),
            Self::AssignTemporary { index } => write!(f, "AssignTemporary {index}"),
            Self::MarkArguments { count } => write!(f, "MarkArguments {count}"),
            Self::SendMessage { literal } => write!(f, "SendMessage #{literal}"),
            Self::SendUnary { kind } => write!(f, "SendUnary {kind}"),
            Self::SendBinary { selector } => write!(f, "SendBinary {selector}"),
            Self::PushBlock { arg_location, end } => {
                write!(f, "PushBlock @{arg_location} end {end}")
            }
            Self::DoPrimitive { argc, primitive } => {
                write!(f, "DoPrimitive #{primitive} argc {argc}")
            }
            Self::SelfReturn => write!(f, "SelfReturn"),
            Self::StackReturn => write!(f, "StackReturn"),
            Self::BlockReturn => write!(f, "BlockReturn"),
            Self::Duplicate => write!(f, "Duplicate"),
            Self::PopTop => write!(f, "PopTop"),
            Self::Branch { target } => write!(f, "Branch {target}"),
            Self::BranchIfTrue { target } => write!(f, "BranchIfTrue {target}"),
            Self::BranchIfFalse { target } => write!(f, "BranchIfFalse {target}"),
            Self::SendToSuper { literal } => write!(f, "SendToSuper #{literal}"),
            Self::Breakpoint => write!(f, "Breakpoint"),
        }
    }
}
