//! Analysis errors.
//!
//! Every error here is fatal for the analysis run that raised it: each one
//! signals a broken structural invariant of the input CFG or of the
//! one-definition-per-identifier property, never a transient condition.

use crate::instr::Label;
use crate::use_def::{Def, Use};
use crate::value::Var;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// An instruction needs more operands than the abstract stack holds.
    #[error("stack underflow at {label}: needs {needed} operand(s), {available} available")]
    StackUnderflow {
        label: Label,
        needed: usize,
        available: usize,
    },

    /// Two states reaching the same point disagree on the number of locals.
    #[error("locals length mismatch at block {block}")]
    LocalsMismatch { block: usize },

    /// Two states reaching the same point disagree on the number of globals.
    #[error("globals length mismatch at block {block}")]
    GlobalsMismatch { block: usize },

    /// Two analyzed predecessors of a join disagree on the stack depth.
    #[error("stack depth mismatch between predecessors of block {block}")]
    StackMismatch { block: usize },

    /// A block that is not a join point is reached by several predecessors.
    #[error("block {block} is not a merge block but has {count} predecessors")]
    MultiplePredecessors { block: usize, count: usize },

    /// A block with predecessors was reached before any of them was analyzed.
    #[error("no analyzed predecessor reaches block {block}")]
    NoAnalyzedPredecessor { block: usize },

    /// The same identifier is produced twice.
    #[error("{var} is defined twice: {first:?} and {second:?}")]
    DuplicateDefinition { var: Var, first: Def, second: Def },

    /// A use refers to an identifier nothing defines.
    #[error("{var} is used at {at:?} but never defined")]
    UndefinedVariable { var: Var, at: Use },

    /// A store left no entry for its cell in the post-state memory map.
    #[error("store {label} has no post-state entry for {cell}")]
    MissingMemoryCell { label: Label, cell: Var },

    /// An instruction shape this analysis does not handle.
    #[error("unsupported instruction {label}: {reason}")]
    Unsupported { label: Label, reason: String },

    #[error("instruction {label} refers to local {index}, which does not exist")]
    InvalidLocal { label: Label, index: u32 },

    #[error("instruction {label} refers to global {index}, which does not exist")]
    InvalidGlobal { label: Label, index: u32 },

    /// A branch targets a label outside of its enclosing constructs.
    #[error("branch {label} has depth {depth} beyond the enclosing labels")]
    InvalidBranchDepth { label: Label, depth: u32 },

    /// A branch, or the end of a `block`/`if`, reaches its target with a
    /// stack height other than the one the target already expects.
    /// Unwinding surplus operands is not modeled.
    #[error("{label} reaches its target with {height} operand(s), {expected} expected")]
    UnbalancedBranch {
        label: Label,
        height: usize,
        expected: usize,
    },

    /// The function body falls through with the wrong number of results.
    #[error("function body ends with {height} operand(s), {expected} expected")]
    UnbalancedResult { height: usize, expected: usize },

    #[error("no instruction or merge block with label {0}")]
    UnknownLabel(Label),

    #[error("no block with index {0}")]
    UnknownBlock(usize),

    /// The driver finished without attaching states to this block.
    #[error("block {0} carries no analysis state")]
    MissingAnnotation(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
