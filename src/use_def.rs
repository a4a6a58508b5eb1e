//! Use-def chains over an annotated CFG.
//!
//! Uses and definitions are read off the stabilized `(before, after)`
//! states in one pass: an instruction uses identifiers of its pre-state
//! and defines identifiers of its post-state, and a merge block defines
//! the identifiers it minted while using the predecessor identifiers they
//! replace.

use crate::cfg::{BasicBlock, Cfg, FuncSig};
use crate::error::{Error, Result};
use crate::instr::{ControlOp, DataOp, InstrRef, Label};
use crate::state::State;
use crate::value::Var;
use smallvec::SmallVec;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub type Vars = SmallVec<[Var; 4]>;

/// A consuming occurrence of an identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Use {
    Instr(Label, Var),
    /// Use of a predecessor's identifier by the merge block with this index.
    Merge(usize, Var),
}

impl Use {
    pub fn var(&self) -> &Var {
        match self {
            Use::Instr(_, var) | Use::Merge(_, var) => var,
        }
    }

    pub fn label(&self) -> Label {
        match self {
            Use::Instr(label, _) => *label,
            Use::Merge(block, _) => Label::Merge(*block),
        }
    }
}

/// The producing occurrence of an identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Def {
    Instr(Label, Var),
    Merge(usize, Var),
    /// Initial value of a local or global.
    Entry(Var),
    Constant(Var),
}

impl Def {
    pub fn var(&self) -> &Var {
        match self {
            Def::Instr(_, var) | Def::Merge(_, var) | Def::Entry(var) | Def::Constant(var) => var,
        }
    }

    /// Label of the defining program point; none for entry values and
    /// constants.
    pub fn label(&self) -> Option<Label> {
        match self {
            Def::Instr(label, _) => Some(*label),
            Def::Merge(block, _) => Some(Label::Merge(*block)),
            Def::Entry(_) | Def::Constant(_) => None,
        }
    }
}

impl fmt::Display for Use {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.var(), self.label())
    }
}

impl fmt::Display for Def {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Def::Entry(var) => write!(f, "{}@entry", var),
            Def::Constant(var) => write!(f, "{}", var),
            Def::Instr(label, var) => write!(f, "{}@{}", var, label),
            Def::Merge(block, var) => write!(f, "{}@{}", var, Label::Merge(*block)),
        }
    }
}

/// The value an instruction pushed, if the instruction minted it.
fn produced(label: Label, after: &State) -> Option<Var> {
    after
        .vstack
        .last()
        .filter(|var| var.origin() == Some(label))
        .cloned()
}

/// Identifiers read by one instruction.
pub fn instr_uses(sig: &FuncSig, instr: InstrRef<'_, State>) -> Result<Vars> {
    match instr {
        InstrRef::Data(i) => {
            let (params, _) = i.op.arity();
            let mut vars: Vars = i.before.top(i.label, params)?.into_iter().collect();
            match &i.op {
                &DataOp::LocalGet(index) => vars.push(i.before.local(i.label, index)?.clone()),
                &DataOp::GlobalGet(index) => vars.push(i.before.global(i.label, index)?.clone()),
                DataOp::Load(memarg) => {
                    let stored = vars.first().and_then(|addr| {
                        i.before
                            .memory
                            .get(&Var::cell(addr.clone(), memarg.offset))
                    });
                    if let Some(stored) = stored {
                        let stored = stored.clone();
                        vars.push(stored);
                    }
                }
                _ => {}
            }
            Ok(vars)
        }
        InstrRef::Control(i) => {
            let n = match &i.op {
                ControlOp::Call { arity, .. } => arity.params,
                ControlOp::CallIndirect { arity, .. } => arity.params + 1,
                ControlOp::If | ControlOp::BrIf(_) | ControlOp::BrTable { .. } => 1,
                ControlOp::Return if sig.results.len() == 1 => 1,
                ControlOp::Return | ControlOp::Br(_) | ControlOp::Unreachable => 0,
            };
            Ok(i.before.top(i.label, n)?.into_iter().collect())
        }
    }
}

/// Identifiers produced by one instruction.
pub fn instr_defs(instr: InstrRef<'_, State>) -> Result<Vars> {
    let mut vars = Vars::new();
    let results = match instr {
        InstrRef::Data(i) => {
            match &i.op {
                &DataOp::LocalSet(index) | &DataOp::LocalTee(index) => {
                    vars.push(i.after.local(i.label, index)?.clone())
                }
                &DataOp::GlobalSet(index) => vars.push(i.after.global(i.label, index)?.clone()),
                DataOp::Store(memarg) => {
                    let addr = i.before.top(i.label, 2)?.swap_remove(1);
                    let cell = Var::cell(addr, memarg.offset);
                    match i.after.memory.get(&cell) {
                        Some(var) => vars.push(var.clone()),
                        None => {
                            return Err(Error::MissingMemoryCell {
                                label: i.label,
                                cell,
                            })
                        }
                    }
                }
                _ => {}
            }
            i.op.arity().1
        }
        InstrRef::Control(i) => match &i.op {
            ControlOp::Call { arity, .. } | ControlOp::CallIndirect { arity, .. } => arity.results,
            _ => 0,
        },
    };
    if results == 1 {
        if let Some(var) = produced(instr.label(), instr.after()) {
            if !vars.contains(&var) {
                vars.push(var);
            }
        }
    }
    Ok(vars)
}

/// Uses and definitions of a merge block: every slot whose identifier
/// changed between a predecessor's out-state and the merged state.
pub fn merge_uses_defs(
    cfg: &Cfg<State>,
    block: &BasicBlock<State>,
) -> Result<(Vec<Use>, Vec<Def>)> {
    let mut uses = vec![];
    let mut defs = vec![];
    let mut defined = BTreeSet::new();
    for edge in cfg.predecessors(block.idx) {
        let pred = cfg.block(edge.block)?;
        for (ours, theirs) in pred.after.diff(&block.after, block.idx)? {
            if defined.insert(theirs.clone()) {
                defs.push(Def::Merge(block.idx, theirs));
            }
            uses.push(Use::Merge(block.idx, ours));
        }
    }
    Ok((uses, defs))
}

/// Calls `use_func` and `def_func` on every use and definition in `block`.
pub fn scan_block<U: FnMut(Use), D: FnMut(Def)>(
    cfg: &Cfg<State>,
    block: &BasicBlock<State>,
    mut use_func: U,
    mut def_func: D,
) -> Result<()> {
    if block.is_merge() {
        let (uses, defs) = merge_uses_defs(cfg, block)?;
        uses.into_iter().for_each(&mut use_func);
        defs.into_iter().for_each(&mut def_func);
        return Ok(());
    }
    for instr in block.instrs() {
        let label = instr.label();
        for var in instr_uses(&cfg.sig, instr)? {
            use_func(Use::Instr(label, var));
        }
        for var in instr_defs(instr)? {
            def_func(Def::Instr(label, var));
        }
    }
    Ok(())
}

/// Uses at one instruction or merge block.
pub fn uses_at(cfg: &Cfg<State>, label: Label) -> Result<Vec<Use>> {
    let block = match label {
        Label::Merge(idx) => cfg
            .blocks
            .get(&idx)
            .filter(|b| b.is_merge())
            .ok_or(Error::UnknownLabel(label))?,
        _ => {
            let (idx, _) = cfg.find_instr(label).ok_or(Error::UnknownLabel(label))?;
            cfg.block(idx)?
        }
    };
    let mut uses = vec![];
    scan_block(cfg, block, |u| uses.push(u), |_| {})?;
    uses.retain(|u| u.label() == label);
    Ok(uses)
}

/// Definitions, uses and the chain from every use to its definition.
#[derive(Clone, Debug, Default)]
pub struct UseDefs {
    pub defs: BTreeMap<Var, Def>,
    pub uses: BTreeMap<Var, BTreeSet<Use>>,
    pub chains: BTreeMap<Use, Def>,
}

impl UseDefs {
    pub fn build(cfg: &Cfg<State>) -> Result<UseDefs> {
        let mut this = UseDefs::default();
        let mut defs = vec![];

        let entry = cfg.block(cfg.entry)?;
        for var in entry.before.locals.iter().chain(entry.before.globals.iter()) {
            defs.push(Def::Entry(var.clone()));
        }
        for block in cfg.blocks.values() {
            scan_block(
                cfg,
                block,
                |u| this.record_use(u),
                |d| defs.push(d),
            )?;
        }
        for def in defs {
            this.define(def)?;
        }
        this.resolve()?;

        log::debug!(
            "use-def: {} definitions, {} chains",
            this.defs.len(),
            this.chains.len()
        );
        Ok(this)
    }

    /// Records a definition; an identifier may be defined only once.
    pub fn define(&mut self, def: Def) -> Result<()> {
        match self.defs.entry(def.var().clone()) {
            Entry::Occupied(e) => Err(Error::DuplicateDefinition {
                var: e.key().clone(),
                first: e.get().clone(),
                second: def,
            }),
            Entry::Vacant(e) => {
                e.insert(def);
                Ok(())
            }
        }
    }

    pub fn record_use(&mut self, u: Use) {
        self.uses.entry(u.var().clone()).or_default().insert(u);
    }

    /// Links every recorded use to its definition.
    pub fn resolve(&mut self) -> Result<()> {
        let mut chains = BTreeMap::new();
        for (var, uses) in &self.uses {
            for u in uses {
                let def = if var.is_constant() {
                    Def::Constant(var.clone())
                } else {
                    self.defs
                        .get(var)
                        .cloned()
                        .ok_or_else(|| Error::UndefinedVariable {
                            var: var.clone(),
                            at: u.clone(),
                        })?
                };
                chains.insert(u.clone(), def);
            }
        }
        self.chains = chains;
        Ok(())
    }

    pub fn def_of(&self, u: &Use) -> Option<&Def> {
        self.chains.get(u)
    }
}
