//! Generic forward dataflow driver.
//!
//! Blocks are visited in reverse postorder, always taking the pending
//! block with the smallest RPO position, and revisited whenever the
//! out-state of a predecessor changes. The domain's `join` and `widen` need
//! not be monotone: the visiting order is part of the contract, and the
//! symbolic domain relies on it (the newest state wins).

use crate::cfg::{BasicBlock, BlockContent, Cfg};
use crate::error::{Error, Result};
use crate::instr::{ControlInstr, DataInstr};
use crate::rpo::{RPOIndex, RPO};
use crate::transfer::ControlOutcome;
use fxhash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

/// Transfer functions and state combinators of one analysis.
///
/// A predecessor that has not been analyzed yet is passed to `merge` as
/// `None` (the bottom state).
pub trait Domain {
    type State: Clone + PartialEq + Debug;

    /// State at function entry.
    fn init_state(&self, cfg: &Cfg<()>) -> Self::State;

    fn data(&self, instr: &DataInstr<()>, state: &Self::State) -> Result<Self::State>;

    fn control(
        &self,
        cfg: &Cfg<()>,
        instr: &ControlInstr<()>,
        state: &Self::State,
    ) -> Result<ControlOutcome<Self::State>>;

    fn merge(
        &self,
        cfg: &Cfg<()>,
        block: &BasicBlock<()>,
        preds: &[Option<&Self::State>],
    ) -> Result<Self::State>;

    /// Combines a block's previous in-state with a new one.
    fn join(&self, old: &Self::State, new: Self::State) -> Self::State;

    /// Like `join`, at loop heads.
    fn widen(&self, old: &Self::State, new: Self::State) -> Self::State;
}

struct BlockStates<S> {
    /// Block-level pre-state; for merge blocks, the first analyzed
    /// predecessor's out-state.
    before: S,
    instrs: Vec<(S, S)>,
    out: ControlOutcome<S>,
}

/// Runs `domain` to a fixpoint over `cfg` and returns a copy of the graph
/// with a `(before, after)` pair on every block and instruction.
///
/// Blocks unreachable from the entry are removed first (the exit block is
/// always kept).
pub fn analyze<D: Domain>(domain: &D, cfg: &Cfg<()>) -> Result<Cfg<D::State>> {
    let mut cfg = cfg.clone();
    let reachable = cfg.reachable();
    let exit = cfg.exit;
    cfg.retain_blocks(|block| block == exit || reachable.contains(&block));

    let mut rpo = RPO::new(&cfg);
    if cfg.blocks.contains_key(&exit) {
        rpo.push(exit);
    }

    let mut ins: FxHashMap<usize, D::State> = FxHashMap::default();
    let mut results: FxHashMap<usize, BlockStates<D::State>> = FxHashMap::default();
    let mut worklist: BTreeSet<RPOIndex> = rpo.iter_with_index().map(|(i, _)| i).collect();
    let mut visits = 0usize;

    while let Some(index) = worklist.pop_first() {
        let idx = rpo.block_at(index);
        let block = cfg.block(idx)?;
        visits += 1;

        let (merged, first_pred) = {
            let preds: Vec<Option<&D::State>> = cfg
                .predecessors(idx)
                .iter()
                .map(|edge| results.get(&edge.block).map(|r| r.out.along(edge.cond)))
                .collect();
            let first_pred = preds.iter().flatten().next().map(|&s| s.clone());
            let merged = if idx == cfg.entry && first_pred.is_none() {
                domain.init_state(&cfg)
            } else {
                domain.merge(&cfg, block, &preds)?
            };
            (merged, first_pred)
        };

        let loop_head = cfg.predecessors(idx).iter().any(|edge| {
            rpo.index_of_block(edge.block)
                .map_or(false, |pred| pred >= index)
        });
        let in_state = match ins.get(&idx) {
            Some(old) if loop_head => domain.widen(old, merged),
            Some(old) => domain.join(old, merged),
            None => merged,
        };

        let mut instrs = vec![];
        let out = match &block.content {
            BlockContent::Data(body) => {
                let mut state = in_state.clone();
                for instr in body {
                    let next = domain.data(instr, &state)?;
                    instrs.push((state, next.clone()));
                    state = next;
                }
                ControlOutcome::Simple(state)
            }
            BlockContent::Control(instr) => {
                let outcome = domain.control(&cfg, instr, &in_state)?;
                instrs.push((in_state.clone(), outcome.primary().clone()));
                outcome
            }
            BlockContent::Merge => ControlOutcome::Simple(in_state.clone()),
        };

        let before = match (&block.content, first_pred) {
            (BlockContent::Merge, Some(pred)) => pred,
            _ => in_state.clone(),
        };
        let changed = results.get(&idx).map_or(true, |r| r.out != out);
        ins.insert(idx, in_state);
        results.insert(
            idx,
            BlockStates {
                before,
                instrs,
                out,
            },
        );

        if changed {
            for edge in cfg.successors(idx) {
                if let Some(succ) = rpo.index_of_block(edge.block) {
                    log::trace!("block {} changed, enqueueing {}", idx, edge.block);
                    worklist.insert(succ);
                }
            }
        }
    }
    log::debug!(
        "fixpoint over {} blocks after {} visits",
        cfg.blocks.len(),
        visits
    );

    let mut blocks = BTreeMap::new();
    for (&idx, block) in &cfg.blocks {
        let states = results.remove(&idx).ok_or(Error::MissingAnnotation(idx))?;
        let after = states.out.primary().clone();
        let mut pairs = states.instrs.into_iter();
        let annotate =
            |pair: Option<(D::State, D::State)>| pair.ok_or(Error::MissingAnnotation(idx));
        let content = match &block.content {
            BlockContent::Data(body) => {
                let mut annotated = Vec::with_capacity(body.len());
                for instr in body {
                    let (before, after) = annotate(pairs.next())?;
                    annotated.push(DataInstr {
                        label: instr.label,
                        op: instr.op.clone(),
                        before,
                        after,
                    });
                }
                BlockContent::Data(annotated)
            }
            BlockContent::Control(instr) => {
                let (before, after) = annotate(pairs.next())?;
                BlockContent::Control(ControlInstr {
                    label: instr.label,
                    op: instr.op.clone(),
                    before,
                    after,
                })
            }
            BlockContent::Merge => BlockContent::Merge,
        };
        blocks.insert(
            idx,
            BasicBlock {
                idx,
                content,
                before: states.before,
                after,
            },
        );
    }

    Ok(Cfg {
        sig: cfg.sig,
        blocks,
        edges: cfg.edges,
        back_edges: cfg.back_edges,
        entry: cfg.entry,
        exit: cfg.exit,
    })
}

#[cfg(test)]
mod tests {
    use crate::cfg::{BasicBlock, BlockContent, Cfg, FuncSig, ValType};
    use crate::config::Options;
    use crate::instr::{ControlOp, DataOp, Instr, Label};
    use crate::transfer::annotate;
    use crate::value::Var;
    use pretty_assertions::assert_eq;

    fn data(cfg: &mut Cfg<()>, idx: usize, ops: &[(u32, DataOp)]) {
        let instrs = ops
            .iter()
            .map(|(label, op)| Instr::new(Label::Instr(*label), op.clone()))
            .collect();
        cfg.blocks.insert(idx, BasicBlock::new(idx, BlockContent::Data(instrs)));
    }

    fn v(n: u32) -> Var {
        Var::Origin(Label::Instr(n))
    }

    #[test]
    fn straight_line_reaches_the_exit() {
        let sig = FuncSig {
            results: vec![ValType::I32],
            ..FuncSig::default()
        };
        let mut cfg = Cfg::new(sig);
        data(&mut cfg, 0, &[(0, DataOp::MemorySize), (1, DataOp::MemorySize)]);
        cfg.blocks.insert(1, BasicBlock::new(1, BlockContent::Merge));
        cfg.add_edge(0, 1, None);
        cfg.exit = 1;

        let annotated = annotate(&cfg, Options::default()).unwrap();
        let exit = &annotated.blocks[&1];
        assert_eq!(exit.before.vstack, vec![v(0), v(1)]);
        assert_eq!(exit.after.vstack, vec![v(0), Var::FunctionResult]);
    }

    /// `local.set` in a loop body: the header merges the entry value with
    /// the value written on the back edge.
    fn looping() -> Cfg<()> {
        let sig = FuncSig {
            params: vec![ValType::I32],
            ..FuncSig::default()
        };
        let mut cfg = Cfg::new(sig);
        data(&mut cfg, 0, &[(0, DataOp::MemorySize), (1, DataOp::LocalSet(0))]);
        cfg.blocks.insert(1, BasicBlock::new(1, BlockContent::Merge));
        data(
            &mut cfg,
            2,
            &[
                (2, DataOp::LocalGet(0)),
                (3, DataOp::LocalSet(0)),
                (4, DataOp::MemorySize),
            ],
        );
        let br_if = Instr::new(Label::Instr(5), ControlOp::BrIf(0));
        cfg.blocks.insert(3, BasicBlock::new(3, BlockContent::Control(br_if)));
        cfg.blocks.insert(4, BasicBlock::new(4, BlockContent::Merge));
        data(&mut cfg, 9, &[(9, DataOp::Nop)]);
        cfg.add_edge(0, 1, None);
        cfg.add_edge(1, 2, None);
        cfg.add_edge(2, 3, None);
        cfg.add_edge(3, 1, Some(true));
        cfg.add_edge(3, 4, Some(false));
        cfg.add_edge(9, 4, None);
        cfg.exit = 4;
        cfg
    }

    #[test]
    fn loop_header_merges_the_back_edge() {
        let annotated = annotate(&looping(), Options::default()).unwrap();

        let header = &annotated.blocks[&1];
        assert_eq!(header.before.locals, vec![v(1)]);
        assert_eq!(header.after.locals, vec![Var::Merge(1, 0)]);

        let (_, get) = annotated.find_instr(Label::Instr(2)).unwrap();
        assert_eq!(get.before().locals, vec![Var::Merge(1, 0)]);

        let exit = &annotated.blocks[&4];
        assert_eq!(exit.after.locals, vec![v(3)]);
    }

    #[test]
    fn unreachable_blocks_are_pruned() {
        let annotated = annotate(&looping(), Options::default()).unwrap();
        assert!(!annotated.blocks.contains_key(&9));
        assert_eq!(annotated.predecessors(4).len(), 1);
    }

    #[test]
    fn rerunning_is_stable() {
        let cfg = looping();
        let once = annotate(&cfg, Options::default()).unwrap();
        let twice = annotate(&once.clear_annotations(), Options::default()).unwrap();
        assert_eq!(once.blocks, twice.blocks);
    }
}
