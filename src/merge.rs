//! Reconciliation of predecessor states at join points.
//!
//! Disagreeing slots are first marked with [`Var::Hole`] and then plugged
//! with fresh `Var::Merge(block, n)` identifiers, numbered in slot order:
//! stack from the bottom, then locals, then globals, then memory cells in
//! key order. The numbering depends only on the predecessor states, so a
//! revisit of the same join with the same inputs mints the same names.

use crate::cfg::{BasicBlock, Cfg};
use crate::error::{Error, Result};
use crate::state::State;
use crate::value::Var;
use std::collections::BTreeMap;

/// In-state of `block` given the out-states of its predecessors (`None`
/// for a predecessor that has not been analyzed yet).
pub fn merge<A>(cfg: &Cfg<A>, block: &BasicBlock<A>, preds: &[Option<&State>]) -> Result<State> {
    if preds.is_empty() {
        return Ok(State::entry(&cfg.sig));
    }
    let analyzed: Vec<&State> = preds.iter().flatten().copied().collect();
    let mut state = match analyzed.len() {
        0 => return Err(Error::NoAnalyzedPredecessor { block: block.idx }),
        1 => analyzed[0].clone(),
        count if !block.is_merge() => {
            return Err(Error::MultiplePredecessors {
                block: block.idx,
                count,
            })
        }
        _ => reconcile(block.idx, &analyzed)?,
    };
    if block.idx == cfg.exit {
        if let Some(top) = state.vstack.last_mut() {
            *top = Var::FunctionResult;
        }
    }
    Ok(state)
}

/// The identifier every state agrees on, or a hole.
fn agree<'a>(mut vars: impl Iterator<Item = &'a Var>) -> Var {
    match vars.next() {
        Some(first) if vars.all(|v| v == first) => first.clone(),
        _ => Var::Hole,
    }
}

fn reconcile(block: usize, states: &[&State]) -> Result<State> {
    let first = states[0];
    for state in &states[1..] {
        if state.locals.len() != first.locals.len() {
            return Err(Error::LocalsMismatch { block });
        }
        if state.globals.len() != first.globals.len() {
            return Err(Error::GlobalsMismatch { block });
        }
        if state.depth() != first.depth() {
            return Err(Error::StackMismatch { block });
        }
    }

    let column = |get: fn(&State) -> &Vec<Var>| -> Vec<Var> {
        (0..get(first).len())
            .map(|i| agree(states.iter().map(|s| &get(s)[i])))
            .collect()
    };
    // Cells missing on some path are dropped.
    let memory: BTreeMap<Var, Var> = first
        .memory
        .keys()
        .filter_map(|cell| {
            let vars: Option<Vec<&Var>> = states.iter().map(|s| s.memory.get(cell)).collect();
            vars.map(|vars| (cell.clone(), agree(vars.into_iter())))
        })
        .collect();
    let mut merged = State {
        vstack: column(|s| &s.vstack),
        locals: column(|s| &s.locals),
        globals: column(|s| &s.globals),
        memory,
    };

    let mut next = 0;
    let slots = merged
        .vstack
        .iter_mut()
        .chain(merged.locals.iter_mut())
        .chain(merged.globals.iter_mut())
        .chain(merged.memory.values_mut());
    for slot in slots {
        if *slot == Var::Hole {
            *slot = Var::Merge(block, next);
            next += 1;
        }
    }
    log::trace!("merge at block {}: {} new identifier(s): {}", block, next, merged);
    Ok(merged)
}

/// Combines the previous in-state of a block with a newly computed one.
/// The newest state always wins.
pub fn join(_old: &State, new: State) -> State {
    new
}

/// Same policy as [`join`], applied at loop heads.
pub fn widen(_old: &State, new: State) -> State {
    new
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{BlockContent, FuncSig, ValType};
    use crate::instr::Label;
    use pretty_assertions::assert_eq;

    const JOIN: usize = 1;
    const PLAIN: usize = 2;
    const EXIT: usize = 3;

    fn cfg() -> Cfg<()> {
        let sig = FuncSig {
            params: vec![ValType::I32, ValType::I32],
            locals: vec![],
            globals: vec![ValType::I64],
            results: vec![ValType::I32],
        };
        let mut cfg = Cfg::new(sig);
        cfg.blocks.insert(JOIN, BasicBlock::new(JOIN, BlockContent::Merge));
        cfg.blocks.insert(PLAIN, BasicBlock::new(PLAIN, BlockContent::Data(vec![])));
        cfg.blocks.insert(EXIT, BasicBlock::new(EXIT, BlockContent::Merge));
        cfg.exit = EXIT;
        cfg
    }

    fn v(n: u32) -> Var {
        Var::Origin(Label::Instr(n))
    }

    fn state(cfg: &Cfg<()>, stack: &[u32]) -> State {
        let mut state = State::entry(&cfg.sig);
        state.vstack = stack.iter().map(|&n| v(n)).collect();
        state
    }

    #[test]
    fn identical_states_merge_to_themselves() {
        let cfg = cfg();
        let mut s = state(&cfg, &[0, 1]);
        s.memory.insert(Var::cell(v(0), 4), v(1));
        let merged = merge(&cfg, &cfg.blocks[&JOIN], &[Some(&s), Some(&s), Some(&s)]).unwrap();
        assert_eq!(merged, s);
    }

    #[test]
    fn disagreements_are_numbered_in_slot_order() {
        let cfg = cfg();
        let mut a = state(&cfg, &[0, 1]);
        let mut b = state(&cfg, &[0, 2]);
        a.globals[0] = v(5);
        b.globals[0] = v(6);
        a.locals[1] = v(7);
        b.locals[1] = v(8);
        let merged = merge(&cfg, &cfg.blocks[&JOIN], &[Some(&a), Some(&b)]).unwrap();
        assert_eq!(merged.vstack, vec![v(0), Var::Merge(JOIN, 0)]);
        assert_eq!(merged.locals, vec![Var::Local(0), Var::Merge(JOIN, 1)]);
        assert_eq!(merged.globals, vec![Var::Merge(JOIN, 2)]);
    }

    #[test]
    fn memory_cells_missing_on_one_path_are_dropped() {
        let cfg = cfg();
        let mut a = state(&cfg, &[]);
        let mut b = state(&cfg, &[]);
        a.memory.insert(Var::cell(v(0), 0), v(1));
        a.memory.insert(Var::cell(v(0), 8), v(2));
        b.memory.insert(Var::cell(v(0), 8), v(3));
        let merged = merge(&cfg, &cfg.blocks[&JOIN], &[Some(&a), Some(&b)]).unwrap();
        assert_eq!(merged.memory.len(), 1);
        assert_eq!(
            merged.memory.get(&Var::cell(v(0), 8)),
            Some(&Var::Merge(JOIN, 0))
        );
    }

    #[test]
    fn exit_renames_top_of_stack() {
        let cfg = cfg();
        let a = state(&cfg, &[0, 1]);
        let merged = merge(&cfg, &cfg.blocks[&EXIT], &[Some(&a)]).unwrap();
        assert_eq!(merged.vstack, vec![v(0), Var::FunctionResult]);

        let b = state(&cfg, &[0, 2]);
        let merged = merge(&cfg, &cfg.blocks[&EXIT], &[Some(&a), Some(&b)]).unwrap();
        assert_eq!(merged.vstack, vec![v(0), Var::FunctionResult]);
    }

    #[test]
    fn no_predecessors_yields_the_entry_state() {
        let cfg = cfg();
        let merged = merge(&cfg, &cfg.blocks[&JOIN], &[]).unwrap();
        assert_eq!(merged, State::entry(&cfg.sig));
    }

    #[test]
    fn single_analyzed_predecessor_passes_through() {
        // A loop header seen from its entry edge only: the back edge is
        // still unanalyzed, so no merge identifiers are minted.
        let cfg = cfg();
        let a = state(&cfg, &[0]);
        let merged = merge(&cfg, &cfg.blocks[&JOIN], &[Some(&a), None]).unwrap();
        assert_eq!(merged, a);
        let merged = merge(&cfg, &cfg.blocks[&PLAIN], &[None, Some(&a)]).unwrap();
        assert_eq!(merged, a);
    }

    #[test]
    fn loop_header_without_back_edge_mints_nothing() {
        use crate::builder::{build, Function, Node};
        use crate::config::Options;
        use crate::instr::DataOp;
        use crate::transfer::annotate;

        let func = Function {
            sig: FuncSig {
                params: vec![ValType::I32],
                ..FuncSig::default()
            },
            body: vec![Node::Loop(vec![
                Node::Op(DataOp::LocalGet(0)),
                Node::Op(DataOp::LocalSet(0)),
            ])],
        };
        let annotated = annotate(&build(&func).unwrap(), Options::default()).unwrap();
        // 0: entry, 1: loop header, 2: body, 3: exit.
        let header = &annotated.blocks[&1];
        assert!(header.is_merge());
        assert_eq!(annotated.predecessors(1).len(), 1);
        assert_eq!(header.after, header.before);
        assert_eq!(header.after.locals, vec![Var::Local(0)]);
        let minted = annotated
            .blocks
            .values()
            .flat_map(|b| b.after.vars())
            .any(|var| matches!(var, Var::Merge(..)));
        assert!(!minted);
    }

    #[test]
    fn shape_violations_are_fatal() {
        let cfg = cfg();
        let a = state(&cfg, &[0]);
        let b = state(&cfg, &[0, 1]);
        assert!(matches!(
            merge(&cfg, &cfg.blocks[&JOIN], &[None, None]),
            Err(Error::NoAnalyzedPredecessor { block: JOIN })
        ));
        assert!(matches!(
            merge(&cfg, &cfg.blocks[&PLAIN], &[Some(&a), Some(&a)]),
            Err(Error::MultiplePredecessors { block: PLAIN, count: 2 })
        ));
        assert!(matches!(
            merge(&cfg, &cfg.blocks[&JOIN], &[Some(&a), Some(&b)]),
            Err(Error::StackMismatch { block: JOIN })
        ));
        let mut c = a.clone();
        c.locals.pop();
        assert!(matches!(
            merge(&cfg, &cfg.blocks[&JOIN], &[Some(&a), Some(&c)]),
            Err(Error::LocalsMismatch { block: JOIN })
        ));
    }

    #[test]
    fn newest_state_wins() {
        let cfg = cfg();
        let old = state(&cfg, &[0]);
        let new = state(&cfg, &[1]);
        assert_eq!(join(&old, new.clone()), new);
        assert_eq!(widen(&old, new.clone()), new);
    }
}
