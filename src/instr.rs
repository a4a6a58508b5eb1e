//! Instructions of the analyzed stack machine.

use crate::value::WasmVal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a program point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    /// An instruction of the original function body.
    Instr(u32),
    /// A merge block, named by its block index.
    Merge(usize),
    /// A placeholder inserted by the slicer.
    Synthetic(u32),
}

impl Label {
    pub fn is_synthetic(&self) -> bool {
        matches!(self, Label::Synthetic(_))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Instr(n) => write!(f, "{}", n),
            Label::Merge(block) => write!(f, "merge{}", block),
            Label::Synthetic(n) => write!(f, "synth{}", n),
        }
    }
}

/// Parses the `Display` form: `12`, `merge4` or `synth0`.
impl FromStr for Label {
    type Err = String;

    fn from_str(s: &str) -> Result<Label, String> {
        let parse = |n: &str| {
            n.parse::<u32>()
                .map_err(|e| format!("bad label `{}`: {}", s, e))
        };
        if let Some(block) = s.strip_prefix("merge") {
            parse(block).map(|b| Label::Merge(b as usize))
        } else if let Some(n) = s.strip_prefix("synth") {
            parse(n).map(Label::Synthetic)
        } else {
            parse(s).map(Label::Instr)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnOp {
    Clz,
    Ctz,
    Popcnt,
    Neg,
    Abs,
    Sqrt,
    Ceil,
    Floor,
    Trunc,
    Nearest,
    Extend8S,
    Extend16S,
    Extend32S,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    DivS,
    DivU,
    RemS,
    RemU,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
    Rotl,
    Rotr,
    Min,
    Max,
    Copysign,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelOp {
    Eq,
    Ne,
    Lt,
    LtS,
    LtU,
    Gt,
    GtS,
    GtU,
    Le,
    LeS,
    LeU,
    Ge,
    GeS,
    GeU,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CvtOp {
    Wrap,
    ExtendS,
    ExtendU,
    TruncS,
    TruncU,
    ConvertS,
    ConvertU,
    Demote,
    Promote,
    Reinterpret,
}

/// Memory access immediate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemArg {
    pub ty: ValType,
    pub offset: u32,
    #[serde(default)]
    pub align: u32,
}

/// A non-branching instruction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataOp {
    Nop,
    Drop,
    Select,
    MemorySize,
    MemoryGrow,
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),
    Const(WasmVal),
    Unary(ValType, UnOp),
    /// `eqz`.
    Test(ValType),
    Convert(ValType, CvtOp),
    Binary(ValType, BinOp),
    Compare(ValType, RelOp),
    Load(MemArg),
    Store(MemArg),
}

impl DataOp {
    /// Operands consumed and results produced.
    pub fn arity(&self) -> (usize, usize) {
        match self {
            DataOp::Nop => (0, 0),
            DataOp::Drop => (1, 0),
            DataOp::Select => (3, 1),
            DataOp::MemorySize => (0, 1),
            DataOp::MemoryGrow => (1, 1),
            DataOp::LocalGet(_) | DataOp::GlobalGet(_) | DataOp::Const(_) => (0, 1),
            DataOp::LocalSet(_) | DataOp::GlobalSet(_) => (1, 0),
            DataOp::LocalTee(_) => (1, 1),
            DataOp::Unary(..) | DataOp::Test(_) | DataOp::Convert(..) => (1, 1),
            DataOp::Binary(..) | DataOp::Compare(..) => (2, 1),
            DataOp::Load(_) => (1, 1),
            DataOp::Store(_) => (2, 0),
        }
    }
}

/// Stack arity of a call target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Arity {
    pub params: usize,
    pub results: usize,
}

/// A branching instruction or call. Each one sits alone in a control block.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOp {
    Call { func: u32, arity: Arity },
    CallIndirect { type_index: u32, arity: Arity },
    If,
    Br(u32),
    BrIf(u32),
    BrTable { targets: Vec<u32>, default: u32 },
    Return,
    Unreachable,
}

/// One instruction with the analysis states before and after it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instr<I, A> {
    pub label: Label,
    pub op: I,
    pub before: A,
    pub after: A,
}

pub type DataInstr<A> = Instr<DataOp, A>;
pub type ControlInstr<A> = Instr<ControlOp, A>;

impl<I> Instr<I, ()> {
    pub fn new(label: Label, op: I) -> Self {
        Instr {
            label,
            op,
            before: (),
            after: (),
        }
    }
}

impl<I: Clone, A> Instr<I, A> {
    pub fn map_annotations<B, F: FnMut(&A) -> B>(&self, mut f: F) -> Instr<I, B> {
        Instr {
            label: self.label,
            op: self.op.clone(),
            before: f(&self.before),
            after: f(&self.after),
        }
    }
}

/// Borrowed view of either kind of instruction.
#[derive(Debug)]
pub enum InstrRef<'a, A> {
    Data(&'a DataInstr<A>),
    Control(&'a ControlInstr<A>),
}

impl<'a, A> Clone for InstrRef<'a, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, A> Copy for InstrRef<'a, A> {}

impl<'a, A> InstrRef<'a, A> {
    pub fn label(&self) -> Label {
        match self {
            InstrRef::Data(i) => i.label,
            InstrRef::Control(i) => i.label,
        }
    }

    pub fn before(&self) -> &'a A {
        match self {
            InstrRef::Data(i) => &i.before,
            InstrRef::Control(i) => &i.before,
        }
    }

    pub fn after(&self) -> &'a A {
        match self {
            InstrRef::Data(i) => &i.after,
            InstrRef::Control(i) => &i.after,
        }
    }
}
