//! State tracking.
//!
//! The symbolic state at one program point names every piece of the
//! abstract machine with a [`Var`]:
//!
//! - the *operand stack*, whose depth must match what each instruction
//!   consumes and produces;
//! - the *locals* (parameters then declared locals) and the *globals*,
//!   two arrays whose lengths never change within one function;
//! - the *memory overlay*, a map from a symbolic cell (address
//!   identifier plus constant byte offset) to the identifier last stored
//!   there. Cells appear lazily as stores happen.
//!
//! States are values: the transfer functions and the merge engine always
//! build a new state and never update one that is already attached to a
//! program point.

use crate::cfg::FuncSig;
use crate::error::{Error, Result};
use crate::instr::Label;
use crate::value::Var;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct State {
    /// Operand stack; the top is the last element.
    pub vstack: Vec<Var>,
    pub locals: Vec<Var>,
    pub globals: Vec<Var>,
    /// Memory overlay, keyed by `Var::MemoryCell`.
    pub memory: BTreeMap<Var, Var>,
}

impl State {
    /// State at function entry: every local and global holds its own
    /// initial identifier, stack and memory are empty.
    pub fn entry(sig: &FuncSig) -> State {
        State {
            vstack: vec![],
            locals: (0..sig.num_locals() as u32).map(Var::Local).collect(),
            globals: (0..sig.globals.len() as u32).map(Var::Global).collect(),
            memory: BTreeMap::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.vstack.len()
    }

    pub fn push(&mut self, var: Var) {
        self.vstack.push(var);
    }

    pub fn pop(&mut self, label: Label) -> Result<Var> {
        self.vstack.pop().ok_or(Error::StackUnderflow {
            label,
            needed: 1,
            available: 0,
        })
    }

    /// Pops `n` values, returned top first.
    pub fn pop_n(&mut self, label: Label, n: usize) -> Result<Vec<Var>> {
        let values = self.top(label, n)?;
        self.vstack.truncate(self.vstack.len() - n);
        Ok(values)
    }

    /// The `n` topmost values, top first, without popping them.
    pub fn top(&self, label: Label, n: usize) -> Result<Vec<Var>> {
        if self.vstack.len() < n {
            return Err(Error::StackUnderflow {
                label,
                needed: n,
                available: self.vstack.len(),
            });
        }
        Ok(self.vstack.iter().rev().take(n).cloned().collect())
    }

    pub fn local(&self, label: Label, index: u32) -> Result<&Var> {
        self.locals
            .get(index as usize)
            .ok_or(Error::InvalidLocal { label, index })
    }

    pub fn set_local(&mut self, label: Label, index: u32, var: Var) -> Result<()> {
        let slot = self
            .locals
            .get_mut(index as usize)
            .ok_or(Error::InvalidLocal { label, index })?;
        *slot = var;
        Ok(())
    }

    pub fn global(&self, label: Label, index: u32) -> Result<&Var> {
        self.globals
            .get(index as usize)
            .ok_or(Error::InvalidGlobal { label, index })
    }

    pub fn set_global(&mut self, label: Label, index: u32, var: Var) -> Result<()> {
        let slot = self
            .globals
            .get_mut(index as usize)
            .ok_or(Error::InvalidGlobal { label, index })?;
        *slot = var;
        Ok(())
    }

    /// Every identifier held in a slot of this state (memory keys excluded).
    pub fn vars(&self) -> impl Iterator<Item = &Var> + '_ {
        self.vstack
            .iter()
            .chain(self.locals.iter())
            .chain(self.globals.iter())
            .chain(self.memory.values())
    }

    /// Pairs `(ours, theirs)` for every aligned slot whose identifiers
    /// differ between `self` and `other`.
    ///
    /// Stacks are aligned from the top and the longer one is truncated to
    /// the length of the shorter, so that an unanalyzed (empty-stack) state
    /// can be compared. Memory is compared on the cells both states hold.
    /// Locals and globals must have equal lengths.
    pub fn diff(&self, other: &State, block: usize) -> Result<Vec<(Var, Var)>> {
        if self.locals.len() != other.locals.len() {
            return Err(Error::LocalsMismatch { block });
        }
        if self.globals.len() != other.globals.len() {
            return Err(Error::GlobalsMismatch { block });
        }
        let stack = self.vstack.iter().rev().zip(other.vstack.iter().rev());
        let locals = self.locals.iter().zip(other.locals.iter());
        let globals = self.globals.iter().zip(other.globals.iter());
        let memory = self
            .memory
            .iter()
            .filter_map(|(cell, ours)| other.memory.get(cell).map(|theirs| (ours, theirs)));
        Ok(stack
            .chain(locals)
            .chain(globals)
            .chain(memory)
            .filter(|(ours, theirs)| ours != theirs)
            .map(|(ours, theirs)| (ours.clone(), theirs.clone()))
            .collect())
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, vars: &[Var]) -> fmt::Result {
            for (i, var) in vars.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", var)?;
            }
            Ok(())
        }
        write!(f, "[")?;
        list(f, &self.vstack)?;
        write!(f, "] locals [")?;
        list(f, &self.locals)?;
        write!(f, "] globals [")?;
        list(f, &self.globals)?;
        write!(f, "] memory {{")?;
        for (i, (cell, var)) in self.memory.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} -> {}", cell, var)?;
        }
        write!(f, "}}")
    }
}
