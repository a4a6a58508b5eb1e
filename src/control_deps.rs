//! Control dependence from post-dominators.
//!
//! Post-dominator sets are computed iteratively on the CFG extended with a
//! virtual sink that the exit block and every block without successors
//! flow into. Block `B` is control-dependent on block `A` when some edge
//! `A -> S` has `B` post-dominating `S` while `B` does not strictly
//! post-dominate `A`.

use crate::cfg::Cfg;
use crate::instr::Label;
use crate::state::State;
use crate::use_def::Use;
use crate::value::Var;
use fxhash::FxHashSet;
use std::collections::{BTreeMap, BTreeSet};

/// Answers which branches decide whether a use executes.
pub trait ControlDependence {
    fn branches(&self, u: &Use) -> BTreeSet<Label>;
}

const SINK: usize = usize::MAX;

struct Pred {
    vars: FxHashSet<Var>,
    /// Branches gating the edge out of this predecessor.
    gates: BTreeSet<Label>,
}

pub struct ControlDeps {
    deps: BTreeMap<usize, BTreeSet<Label>>,
    instr_blocks: BTreeMap<Label, usize>,
    merge_preds: BTreeMap<usize, Vec<Pred>>,
}

fn exits<A>(cfg: &Cfg<A>, block: usize) -> Vec<usize> {
    let mut succs: Vec<usize> = cfg
        .successors(block)
        .iter()
        .map(|e| e.block)
        .filter(|b| cfg.blocks.contains_key(b))
        .collect();
    if block == cfg.exit || succs.is_empty() {
        succs.push(SINK);
    }
    succs
}

/// Post-dominator set of every block (the sink included).
pub fn post_dominators<A>(cfg: &Cfg<A>) -> BTreeMap<usize, BTreeSet<usize>> {
    let all: BTreeSet<usize> = cfg.blocks.keys().copied().chain(Some(SINK)).collect();
    let mut pdom: BTreeMap<usize, BTreeSet<usize>> = cfg
        .blocks
        .keys()
        .map(|&b| (b, all.clone()))
        .collect();
    pdom.insert(SINK, Some(SINK).into_iter().collect());

    let order: Vec<usize> = cfg.blocks.keys().rev().copied().collect();
    let mut changed = true;
    while changed {
        changed = false;
        for &block in &order {
            let mut new: Option<BTreeSet<usize>> = None;
            for succ in exits(cfg, block) {
                let succ_pdom = &pdom[&succ];
                new = Some(match new {
                    None => succ_pdom.clone(),
                    Some(acc) => acc.intersection(succ_pdom).copied().collect(),
                });
            }
            let mut new = new.unwrap_or_default();
            new.insert(block);
            if pdom[&block] != new {
                pdom.insert(block, new);
                changed = true;
            }
        }
    }
    pdom
}

impl ControlDeps {
    pub fn new(cfg: &Cfg<State>) -> ControlDeps {
        let pdom = post_dominators(cfg);
        let mut deps: BTreeMap<usize, BTreeSet<Label>> = BTreeMap::new();
        for (&a, block) in &cfg.blocks {
            let label = match block.control_label() {
                Some(label) => label,
                None => continue,
            };
            for succ in exits(cfg, a) {
                for &b in &pdom[&succ] {
                    if b == SINK || (b != a && pdom[&a].contains(&b)) {
                        continue;
                    }
                    log::trace!("block {} is control-dependent on {}", b, label);
                    deps.entry(b).or_default().insert(label);
                }
            }
        }

        let mut merge_preds = BTreeMap::new();
        for (&m, block) in &cfg.blocks {
            if !block.is_merge() {
                continue;
            }
            let preds = cfg
                .predecessors(m)
                .iter()
                .filter_map(|edge| cfg.blocks.get(&edge.block))
                .map(|pred| {
                    let mut gates = deps.get(&pred.idx).cloned().unwrap_or_default();
                    let distinct: FxHashSet<usize> =
                        cfg.successors(pred.idx).iter().map(|e| e.block).collect();
                    if distinct.len() > 1 {
                        gates.extend(pred.control_label());
                    }
                    Pred {
                        vars: pred.after.vars().cloned().collect(),
                        gates,
                    }
                })
                .collect();
            merge_preds.insert(m, preds);
        }

        ControlDeps {
            deps,
            instr_blocks: cfg.instr_blocks(),
            merge_preds,
        }
    }

    /// Branches block `block` is control-dependent on.
    pub fn block_deps(&self, block: usize) -> BTreeSet<Label> {
        self.deps.get(&block).cloned().unwrap_or_default()
    }
}

impl ControlDependence for ControlDeps {
    fn branches(&self, u: &Use) -> BTreeSet<Label> {
        match u {
            Use::Instr(label, _) => self
                .instr_blocks
                .get(label)
                .map(|&block| self.block_deps(block))
                .unwrap_or_default(),
            Use::Merge(m, var) => {
                let mut branches = self.block_deps(*m);
                for pred in self.merge_preds.get(m).into_iter().flatten() {
                    if pred.vars.contains(var) {
                        branches.extend(pred.gates.iter().copied());
                    }
                }
                branches
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build, Function, Node};
    use crate::cfg::FuncSig;
    use crate::config::Options;
    use crate::instr::{ControlOp, DataOp};
    use crate::transfer::annotate;

    fn analyze(body: Vec<Node>) -> Cfg<State> {
        let cfg = build(&Function {
            sig: FuncSig::default(),
            body,
        })
        .unwrap();
        annotate(&cfg, Options::default()).unwrap()
    }

    fn v(n: u32) -> Var {
        Var::Origin(Label::Instr(n))
    }

    #[test]
    fn code_after_br_if_depends_on_it() {
        let cfg = analyze(vec![Node::Block(vec![
            Node::Op(DataOp::MemorySize),
            Node::Control(ControlOp::BrIf(0)),
            Node::Op(DataOp::MemorySize),
            Node::Op(DataOp::Drop),
        ])]);
        let deps = ControlDeps::new(&cfg);
        let expected: BTreeSet<Label> = Some(Label::Instr(2)).into_iter().collect();
        assert_eq!(deps.branches(&Use::Instr(Label::Instr(4), v(3))), expected);
        assert!(deps.branches(&Use::Instr(Label::Instr(2), v(1))).is_empty());
        // The block end runs either way.
        assert!(deps.block_deps(3).is_empty());
    }

    #[test]
    fn phi_arguments_depend_on_the_if() {
        let cfg = analyze(vec![
            Node::Op(DataOp::MemorySize),
            Node::If {
                then: vec![Node::Op(DataOp::MemorySize)],
                otherwise: vec![Node::Op(DataOp::MemorySize)],
            },
            Node::Op(DataOp::Drop),
        ]);
        let deps = ControlDeps::new(&cfg);
        let expected: BTreeSet<Label> = Some(Label::Instr(1)).into_iter().collect();
        assert_eq!(deps.branches(&Use::Merge(4, v(2))), expected);
        assert_eq!(deps.branches(&Use::Merge(4, v(3))), expected);
        assert!(deps.block_deps(4).is_empty());
    }

    #[test]
    fn one_armed_if_gates_its_fall_through() {
        let cfg = analyze(vec![
            Node::Op(DataOp::MemorySize),
            Node::Op(DataOp::MemorySize),
            Node::If {
                then: vec![Node::Op(DataOp::Drop), Node::Op(DataOp::MemorySize)],
                otherwise: vec![],
            },
            Node::Op(DataOp::Drop),
        ]);
        let deps = ControlDeps::new(&cfg);
        // The value v0 reaches the merge on the false edge straight from
        // the `if` block.
        let expected: BTreeSet<Label> = Some(Label::Instr(2)).into_iter().collect();
        assert_eq!(deps.branches(&Use::Merge(3, v(0))), expected);
    }

    #[test]
    fn post_dominators_meet_at_the_exit() {
        let cfg = analyze(vec![
            Node::Op(DataOp::MemorySize),
            Node::If {
                then: vec![Node::Op(DataOp::Nop)],
                otherwise: vec![],
            },
        ]);
        // 0: entry, 1: if, 2: then arm, 3: merge, 4: exit.
        let pdom = post_dominators(&cfg);
        assert!(pdom[&cfg.entry].contains(&cfg.exit));
        assert!(pdom[&1].contains(&3));
        assert!(!pdom[&1].contains(&2));
    }
}
