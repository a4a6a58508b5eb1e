//! Transfer functions of the symbolic analysis.
//!
//! Every instruction that produces a value names it after itself
//! (`Var::Origin(label)`), so re-running a transfer function on the same
//! input always yields the same state. That determinism is what lets the
//! driver reach a fixpoint without a monotone join.

use crate::cfg::{BasicBlock, Cfg, FuncSig};
use crate::config::Options;
use crate::error::{Error, Result};
use crate::fixpoint::{self, Domain};
use crate::instr::{Arity, ControlInstr, ControlOp, DataInstr, DataOp, Label};
use crate::merge;
use crate::state::State;
use crate::value::Var;

/// Result of a control instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlOutcome<S> {
    /// One state for every successor.
    Simple(S),
    /// States for the taken (`true`) and not-taken (`false`) edges.
    Branch(S, S),
}

impl<S> ControlOutcome<S> {
    /// The state flowing along an edge tagged with `cond`.
    pub fn along(&self, cond: Option<bool>) -> &S {
        match (self, cond) {
            (ControlOutcome::Branch(_, f), Some(false)) => f,
            (ControlOutcome::Branch(t, _), _) => t,
            (ControlOutcome::Simple(s), _) => s,
        }
    }

    /// The state recorded as the instruction's post-state.
    pub fn primary(&self) -> &S {
        self.along(None)
    }
}

fn fresh(label: Label) -> Var {
    Var::Origin(label)
}

/// Successor state of a non-branching instruction.
pub fn transfer_data<A>(options: &Options, instr: &DataInstr<A>, state: &State) -> Result<State> {
    let label = instr.label;
    let mut state = state.clone();
    match &instr.op {
        DataOp::Nop => {}
        DataOp::MemorySize => state.push(fresh(label)),
        DataOp::MemoryGrow => {
            state.pop(label)?;
            state.push(fresh(label));
        }
        DataOp::Drop => {
            state.pop(label)?;
        }
        DataOp::Select => {
            state.pop_n(label, 3)?;
            state.push(fresh(label));
        }
        &DataOp::LocalGet(index) => {
            let current = state.local(label, index)?;
            let var = if options.propagate_locals {
                current.clone()
            } else {
                fresh(label)
            };
            state.push(var);
        }
        &DataOp::LocalSet(index) => {
            state.pop(label)?;
            state.set_local(label, index, fresh(label))?;
        }
        &DataOp::LocalTee(index) => {
            // The operand stays on the stack under its producer's name.
            state.top(label, 1)?;
            state.set_local(label, index, fresh(label))?;
        }
        &DataOp::GlobalGet(index) => {
            let current = state.global(label, index)?;
            let var = if options.propagate_globals {
                current.clone()
            } else {
                fresh(label)
            };
            state.push(var);
        }
        &DataOp::GlobalSet(index) => {
            state.pop(label)?;
            state.set_global(label, index, fresh(label))?;
        }
        DataOp::Const(value) => {
            let var = if options.use_constants {
                Var::Constant(*value)
            } else {
                fresh(label)
            };
            state.push(var);
        }
        DataOp::Unary(..) | DataOp::Test(_) | DataOp::Convert(..) => {
            state.pop(label)?;
            state.push(fresh(label));
        }
        DataOp::Binary(..) | DataOp::Compare(..) => {
            state.pop_n(label, 2)?;
            state.push(fresh(label));
        }
        DataOp::Load(_) => {
            // The loaded value is not looked up in the memory overlay here;
            // consumers that want it resolve it themselves.
            state.pop(label)?;
            state.push(fresh(label));
        }
        DataOp::Store(memarg) => {
            let mut operands = state.pop_n(label, 2)?;
            let addr = operands.swap_remove(1);
            state.memory.insert(Var::cell(addr, memarg.offset), fresh(label));
        }
    }
    log::trace!("{}: {:?} -> {}", label, instr.op, state);
    Ok(state)
}

fn call(state: &State, label: Label, arity: &Arity, extra: usize) -> Result<State> {
    if arity.results > 1 {
        return Err(Error::Unsupported {
            label,
            reason: format!("call with {} results", arity.results),
        });
    }
    let mut state = state.clone();
    state.pop_n(label, arity.params + extra)?;
    if arity.results == 1 {
        state.push(fresh(label));
    }
    Ok(state)
}

/// Successor state(s) of a branch or call.
pub fn transfer_control<A>(
    sig: &FuncSig,
    instr: &ControlInstr<A>,
    state: &State,
) -> Result<ControlOutcome<State>> {
    let label = instr.label;
    let outcome = match &instr.op {
        ControlOp::Call { arity, .. } => ControlOutcome::Simple(call(state, label, arity, 0)?),
        // The callee index sits on top of the arguments.
        ControlOp::CallIndirect { arity, .. } => {
            ControlOutcome::Simple(call(state, label, arity, 1)?)
        }
        ControlOp::If | ControlOp::BrIf(_) => {
            let mut state = state.clone();
            state.pop(label)?;
            ControlOutcome::Branch(state.clone(), state)
        }
        ControlOp::Br(_) => ControlOutcome::Simple(state.clone()),
        ControlOp::BrTable { .. } => {
            let mut state = state.clone();
            state.pop(label)?;
            ControlOutcome::Simple(state)
        }
        ControlOp::Return => {
            let mut state = state.clone();
            match sig.results.len() {
                0 => state.vstack.clear(),
                1 => {
                    let top = state.pop(label)?;
                    state.vstack = vec![top];
                }
                n => {
                    return Err(Error::Unsupported {
                        label,
                        reason: format!("return of {} values", n),
                    })
                }
            }
            ControlOutcome::Simple(state)
        }
        ControlOp::Unreachable => {
            let mut state = state.clone();
            state.vstack.clear();
            ControlOutcome::Simple(state)
        }
    };
    log::trace!("{}: {:?} -> {:?}", label, instr.op, outcome);
    Ok(outcome)
}

/// The symbolic-naming instance of the generic analysis.
#[derive(Clone, Copy, Debug, Default)]
pub struct Symbolic {
    pub options: Options,
}

impl Symbolic {
    pub fn new(options: Options) -> Self {
        Symbolic { options }
    }
}

impl Domain for Symbolic {
    type State = State;

    fn init_state(&self, cfg: &Cfg<()>) -> State {
        State::entry(&cfg.sig)
    }

    fn data(&self, instr: &DataInstr<()>, state: &State) -> Result<State> {
        transfer_data(&self.options, instr, state)
    }

    fn control(
        &self,
        cfg: &Cfg<()>,
        instr: &ControlInstr<()>,
        state: &State,
    ) -> Result<ControlOutcome<State>> {
        transfer_control(&cfg.sig, instr, state)
    }

    fn merge(
        &self,
        cfg: &Cfg<()>,
        block: &BasicBlock<()>,
        preds: &[Option<&State>],
    ) -> Result<State> {
        merge::merge(cfg, block, preds)
    }

    fn join(&self, old: &State, new: State) -> State {
        merge::join(old, new)
    }

    fn widen(&self, old: &State, new: State) -> State {
        merge::widen(old, new)
    }
}

/// Runs the symbolic analysis to a fixpoint and returns the annotated CFG.
pub fn annotate(cfg: &Cfg<()>, options: Options) -> Result<Cfg<State>> {
    fixpoint::analyze(&Symbolic::new(options), cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::ValType;
    use crate::instr::{BinOp, Instr, MemArg};
    use crate::value::WasmVal;

    fn sig() -> FuncSig {
        FuncSig {
            params: vec![ValType::I32],
            locals: vec![],
            globals: vec![ValType::I32],
            results: vec![ValType::I32],
        }
    }

    fn run(options: Options, ops: Vec<DataOp>) -> Result<State> {
        let mut state = State::entry(&sig());
        for (i, op) in ops.into_iter().enumerate() {
            state = transfer_data(&options, &Instr::new(Label::Instr(i as u32), op), &state)?;
        }
        Ok(state)
    }

    fn v(n: u32) -> Var {
        Var::Origin(Label::Instr(n))
    }

    #[test]
    fn binary_ops_pop_two_push_one() {
        let state = run(
            Options::default(),
            vec![
                DataOp::MemorySize,
                DataOp::MemorySize,
                DataOp::Binary(ValType::I32, BinOp::Add),
            ],
        )
        .unwrap();
        assert_eq!(state.vstack, vec![v(2)]);
    }

    #[test]
    fn underflow_is_an_error() {
        let err = run(Options::default(), vec![DataOp::Drop]).unwrap_err();
        assert!(matches!(err, Error::StackUnderflow { label: Label::Instr(0), .. }));
    }

    #[test]
    fn locals_propagate_only_when_asked() {
        let ops = vec![DataOp::LocalGet(0)];
        assert_eq!(run(Options::default(), ops.clone()).unwrap().vstack, vec![v(0)]);
        let options = Options {
            propagate_locals: true,
            ..Options::default()
        };
        assert_eq!(run(options, ops).unwrap().vstack, vec![Var::Local(0)]);
    }

    #[test]
    fn writes_mint_fresh_slot_values() {
        let teed = run(Options::default(), vec![DataOp::MemorySize, DataOp::LocalTee(0)]).unwrap();
        assert_eq!(teed.vstack, vec![v(0)]);
        assert_eq!(teed.locals, vec![v(1)]);

        let state = run(
            Options::default(),
            vec![DataOp::MemorySize, DataOp::LocalTee(0), DataOp::GlobalSet(0)],
        )
        .unwrap();
        assert!(state.vstack.is_empty());
        assert_eq!(state.locals, vec![v(1)]);
        assert_eq!(state.globals, vec![v(2)]);
    }

    #[test]
    fn constants_are_shared_with_use_constants() {
        let ops = vec![
            DataOp::Const(WasmVal::I32(7)),
            DataOp::Const(WasmVal::I32(7)),
        ];
        let shared = run(Options::propagating(), ops.clone()).unwrap();
        assert_eq!(shared.vstack[0], shared.vstack[1]);
        let fresh = run(Options::default(), ops).unwrap();
        assert_ne!(fresh.vstack[0], fresh.vstack[1]);
    }

    #[test]
    fn store_updates_the_overlay_and_load_does_not_read_it() {
        let memarg = MemArg {
            ty: ValType::I32,
            offset: 8,
            align: 2,
        };
        let state = run(
            Options::default(),
            vec![
                DataOp::MemorySize,
                DataOp::MemorySize,
                DataOp::Store(memarg),
                DataOp::MemorySize,
                DataOp::Load(memarg),
            ],
        )
        .unwrap();
        assert_eq!(state.memory.get(&Var::cell(v(0), 8)), Some(&v(2)));
        assert_eq!(state.vstack, vec![v(4)]);
    }

    #[test]
    fn control_arities() {
        let sig = sig();
        let mut state = State::entry(&sig);
        state.vstack = vec![v(0), v(1), v(2)];

        let call = Instr::new(
            Label::Instr(10),
            ControlOp::CallIndirect {
                type_index: 0,
                arity: Arity {
                    params: 1,
                    results: 1,
                },
            },
        );
        let after = transfer_control(&sig, &call, &state).unwrap();
        assert_eq!(after.primary().vstack, vec![v(0), v(10)]);

        let br_if = Instr::new(Label::Instr(11), ControlOp::BrIf(0));
        match transfer_control(&sig, &br_if, &state).unwrap() {
            ControlOutcome::Branch(t, f) => {
                assert_eq!(t.vstack, vec![v(0), v(1)]);
                assert_eq!(t, f);
            }
            other => panic!("expected a branch, got {:?}", other),
        }

        let ret = Instr::new(Label::Instr(12), ControlOp::Return);
        let after = transfer_control(&sig, &ret, &state).unwrap();
        assert_eq!(after.primary().vstack, vec![v(2)]);

        let unreachable = Instr::new(Label::Instr(13), ControlOp::Unreachable);
        let after = transfer_control(&sig, &unreachable, &state).unwrap();
        assert!(after.primary().vstack.is_empty());
    }

    #[test]
    fn multi_value_calls_are_unsupported() {
        let sig = sig();
        let call = Instr::new(
            Label::Instr(0),
            ControlOp::Call {
                func: 3,
                arity: Arity {
                    params: 0,
                    results: 2,
                },
            },
        );
        let err = transfer_control(&sig, &call, &State::entry(&sig)).unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
    }
}
