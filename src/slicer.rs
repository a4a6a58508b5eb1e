//! Backward slicing.
//!
//! The kept set is the closure of the criterion under data dependence
//! (use to reaching definition) and control dependence (use to governing
//! branch). The sliced CFG keeps those instructions and replaces
//! everything else with placeholders that preserve the operand-stack
//! height seen by every kept instruction, so it can be analyzed again.

use crate::cfg::{BlockContent, Cfg};
use crate::control_deps::{ControlDependence, ControlDeps};
use crate::error::{Error, Result};
use crate::instr::{DataInstr, DataOp, Instr, Label};
use crate::state::State;
use crate::use_def::{self, Use, UseDefs};
use crate::value::WasmVal;
use std::collections::{BTreeMap, BTreeSet};

pub struct Slicer<'a, O = ControlDeps> {
    cfg: &'a Cfg<State>,
    use_defs: UseDefs,
    uses_by_label: BTreeMap<Label, Vec<Use>>,
    oracle: O,
}

impl<'a> Slicer<'a, ControlDeps> {
    pub fn new(cfg: &'a Cfg<State>) -> Result<Self> {
        Slicer::with_oracle(cfg, ControlDeps::new(cfg))
    }
}

impl<'a, O: ControlDependence> Slicer<'a, O> {
    pub fn with_oracle(cfg: &'a Cfg<State>, oracle: O) -> Result<Self> {
        let use_defs = UseDefs::build(cfg)?;
        let mut uses_by_label: BTreeMap<Label, Vec<Use>> = BTreeMap::new();
        for u in use_defs.uses.values().flatten() {
            uses_by_label.entry(u.label()).or_default().push(u.clone());
        }
        Ok(Slicer {
            cfg,
            use_defs,
            uses_by_label,
            oracle,
        })
    }

    pub fn use_defs(&self) -> &UseDefs {
        &self.use_defs
    }

    /// Labels of every instruction and merge block the criterion depends
    /// on, the criterion included.
    pub fn instructions_to_keep(&self, criterion: Label) -> Result<BTreeSet<Label>> {
        // Rejects labels that name nothing in the graph.
        use_def::uses_at(self.cfg, criterion)?;

        let mut worklist: BTreeSet<Label> = Some(criterion).into_iter().collect();
        let mut kept = BTreeSet::new();
        while let Some(label) = worklist.pop_first() {
            if !kept.insert(label) {
                continue;
            }
            for u in self.uses_by_label.get(&label).into_iter().flatten() {
                let def = self
                    .use_defs
                    .def_of(u)
                    .ok_or_else(|| Error::UndefinedVariable {
                        var: u.var().clone(),
                        at: u.clone(),
                    })?;
                let deps = def.label().into_iter().chain(self.oracle.branches(u));
                for dep in deps {
                    if !kept.contains(&dep) {
                        log::trace!("{} needs {} (via {})", label, dep, u);
                        worklist.insert(dep);
                    }
                }
            }
        }
        log::debug!("slice for {} keeps {} labels", criterion, kept.len());
        Ok(kept)
    }

    /// The CFG restricted to the slice of `criterion`, ready for
    /// re-analysis.
    pub fn slice(&self, criterion: Label) -> Result<Cfg<()>> {
        let kept = self.instructions_to_keep(criterion)?;
        let cfg = self.cfg;
        let mut out = cfg.clear_annotations();
        let mut next_synthetic = 0u32;
        let mut doomed = vec![];

        for (&idx, block) in &cfg.blocks {
            let structural =
                idx == cfg.entry || idx == cfg.exit || cfg.predecessors(idx).len() > 1;
            let content = match &block.content {
                BlockContent::Merge => continue,
                BlockContent::Control(instr) if kept.contains(&instr.label) => continue,
                BlockContent::Control(_) => {
                    let effect = block.net_effect();
                    if !structural && effect == 0 {
                        doomed.push(idx);
                        continue;
                    }
                    placeholders(effect, &mut next_synthetic)
                }
                BlockContent::Data(instrs) => {
                    let mut body = vec![];
                    let mut run = 0isize;
                    for instr in instrs {
                        if kept.contains(&instr.label) {
                            body.extend(placeholders(run, &mut next_synthetic));
                            run = 0;
                            body.push(Instr::new(instr.label, instr.op.clone()));
                        } else {
                            run += instr.after.depth() as isize - instr.before.depth() as isize;
                        }
                    }
                    body.extend(placeholders(run, &mut next_synthetic));
                    if body.is_empty() && !structural {
                        doomed.push(idx);
                        continue;
                    }
                    body
                }
            };
            if let Some(block) = out.blocks.get_mut(&idx) {
                block.content = BlockContent::Data(content);
            }
        }

        for idx in doomed {
            splice_out(&mut out, idx);
        }

        let reachable = out.reachable();
        let dangling: Vec<usize> = out
            .predecessors(out.exit)
            .iter()
            .map(|e| e.block)
            .filter(|b| !reachable.contains(b) || !out.blocks.contains_key(b))
            .collect();
        for src in dangling {
            let exit = out.exit;
            out.remove_edges(src, exit);
        }

        log::debug!(
            "slice for {}: {} of {} blocks remain",
            criterion,
            out.blocks.len(),
            cfg.blocks.len()
        );
        Ok(out)
    }
}

/// Synthetic instructions with a net stack effect of `effect`.
fn placeholders(effect: isize, next: &mut u32) -> Vec<DataInstr<()>> {
    let op = if effect < 0 {
        DataOp::Drop
    } else {
        DataOp::Const(WasmVal::I32(0))
    };
    (0..effect.unsigned_abs())
        .map(|_| {
            let label = Label::Synthetic(*next);
            *next += 1;
            Instr::new(label, op.clone())
        })
        .collect()
}

/// Deletes a block, connecting each predecessor to each successor.
fn splice_out(cfg: &mut Cfg<()>, idx: usize) {
    let preds = cfg.predecessors(idx).to_vec();
    let succs = cfg.successors(idx).to_vec();
    cfg.remove_block(idx);
    for pred in &preds {
        for succ in &succs {
            if pred.block == idx || succ.block == idx || pred.block == succ.block {
                continue;
            }
            cfg.add_edge(pred.block, succ.block, pred.cond);
        }
    }
    log::trace!("spliced out block {}", idx);
}
