//! Symbolic and concrete values.

use crate::instr::Label;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A literal operand, stored as raw bits so that equal literals compare
/// equal (floats included).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WasmVal {
    I32(u32),
    I64(u64),
    F32(u32),
    F64(u64),
}

impl WasmVal {
    pub fn from_f32(f: f32) -> WasmVal {
        WasmVal::F32(f.to_bits())
    }

    pub fn from_f64(f: f64) -> WasmVal {
        WasmVal::F64(f.to_bits())
    }
}

impl fmt::Display for WasmVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WasmVal::I32(v) => write!(f, "{}i32", *v as i32),
            WasmVal::I64(v) => write!(f, "{}i64", *v as i64),
            WasmVal::F32(bits) => write!(f, "{}f32", f32::from_bits(*bits)),
            WasmVal::F64(bits) => write!(f, "{}f64", f64::from_bits(*bits)),
        }
    }
}

/// Symbolic name of one abstract value.
///
/// Identifiers are immutable and compared structurally. Each one is
/// minted exactly once: by the function entry (`Local`, `Global`), by the
/// instruction that produces it (`Origin`), or by the merge engine
/// (`Merge`, `FunctionResult`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Var {
    /// Value produced by the instruction with this label.
    Origin(Label),
    /// Initial value of a parameter or declared local.
    Local(u32),
    /// Initial value of a module global.
    Global(u32),
    /// A literal; equal literals share the identifier.
    Constant(WasmVal),
    /// Value synthesized at a join: (block index, sequence number).
    Merge(usize, usize),
    /// A memory cell, keyed by symbolic address and constant byte offset.
    /// Used as the key of [`crate::state::State::memory`].
    MemoryCell(Box<Var>, u32),
    /// The value returned by the function, as seen at the exit block.
    FunctionResult,
    /// Placeholder for a disagreeing slot while a merge is under
    /// construction; never escapes [`crate::merge`].
    Hole,
}

impl Var {
    pub fn cell(addr: Var, offset: u32) -> Var {
        Var::MemoryCell(Box::new(addr), offset)
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Var::Constant(_))
    }

    /// The label of the instruction that minted this identifier, if any.
    pub fn origin(&self) -> Option<Label> {
        match self {
            Var::Origin(label) => Some(*label),
            _ => None,
        }
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Var::Origin(label) => write!(f, "v{}", label),
            Var::Local(i) => write!(f, "l{}", i),
            Var::Global(i) => write!(f, "g{}", i),
            Var::Constant(v) => write!(f, "{}", v),
            Var::Merge(block, n) => write!(f, "m{}_{}", block, n),
            Var::MemoryCell(addr, offset) => write!(f, "mem[{}+{}]", addr, offset),
            Var::FunctionResult => write!(f, "ret"),
            Var::Hole => write!(f, "_"),
        }
    }
}
