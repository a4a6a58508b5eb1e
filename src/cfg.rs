//! Control-flow graph of one function body.
//!
//! Blocks are kept in a map keyed by a stable index: the slicer deletes
//! blocks, and every other structure (edges, merge labels, merge
//! identifiers) refers to blocks by index, so indices are never reused.
//! Forward and backward edge maps are kept in sync by [`Cfg::add_edge`]
//! and [`Cfg::remove_block`].

use crate::error::{Error, Result};
use crate::instr::{ControlInstr, DataInstr, InstrRef, Label};
use crate::state::State;
use fxhash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use crate::instr::ValType;

/// Types visible to one function body.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncSig {
    #[serde(default)]
    pub params: Vec<ValType>,
    #[serde(default)]
    pub locals: Vec<ValType>,
    #[serde(default)]
    pub globals: Vec<ValType>,
    #[serde(default)]
    pub results: Vec<ValType>,
}

impl FuncSig {
    /// Parameters followed by declared locals.
    pub fn num_locals(&self) -> usize {
        self.params.len() + self.locals.len()
    }
}

/// One end of an edge, with the branch outcome that selects it.
///
/// In [`Cfg::edges`] `block` is the target; in [`Cfg::back_edges`] it is
/// the source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub block: usize,
    pub cond: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockContent<A> {
    /// Straight-line, non-branching instructions.
    Data(Vec<DataInstr<A>>),
    /// A single branch or call.
    Control(ControlInstr<A>),
    /// A join point.
    Merge,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BasicBlock<A> {
    pub idx: usize,
    pub content: BlockContent<A>,
    pub before: A,
    pub after: A,
}

impl<A> BasicBlock<A> {
    pub fn is_merge(&self) -> bool {
        matches!(self.content, BlockContent::Merge)
    }

    /// The instructions of the block, in order.
    pub fn instrs(&self) -> Vec<InstrRef<'_, A>> {
        match &self.content {
            BlockContent::Data(instrs) => instrs.iter().map(InstrRef::Data).collect(),
            BlockContent::Control(instr) => vec![InstrRef::Control(instr)],
            BlockContent::Merge => vec![],
        }
    }

    /// The branch or call label of a control block.
    pub fn control_label(&self) -> Option<Label> {
        match &self.content {
            BlockContent::Control(instr) => Some(instr.label),
            _ => None,
        }
    }
}

impl BasicBlock<State> {
    /// Stack height change across the block.
    pub fn net_effect(&self) -> isize {
        self.after.depth() as isize - self.before.depth() as isize
    }
}

impl BasicBlock<()> {
    pub fn new(idx: usize, content: BlockContent<()>) -> Self {
        BasicBlock {
            idx,
            content,
            before: (),
            after: (),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cfg<A> {
    pub sig: FuncSig,
    pub blocks: BTreeMap<usize, BasicBlock<A>>,
    pub edges: BTreeMap<usize, Vec<Edge>>,
    pub back_edges: BTreeMap<usize, Vec<Edge>>,
    pub entry: usize,
    pub exit: usize,
}

impl<A> Cfg<A> {
    pub fn new(sig: FuncSig) -> Self {
        Cfg {
            sig,
            blocks: BTreeMap::new(),
            edges: BTreeMap::new(),
            back_edges: BTreeMap::new(),
            entry: 0,
            exit: 0,
        }
    }

    pub fn block(&self, idx: usize) -> Result<&BasicBlock<A>> {
        self.blocks.get(&idx).ok_or(Error::UnknownBlock(idx))
    }

    pub fn successors(&self, idx: usize) -> &[Edge] {
        self.edges.get(&idx).map(|v| &v[..]).unwrap_or(&[])
    }

    pub fn predecessors(&self, idx: usize) -> &[Edge] {
        self.back_edges.get(&idx).map(|v| &v[..]).unwrap_or(&[])
    }

    pub fn add_edge(&mut self, from: usize, to: usize, cond: Option<bool>) {
        let fwd = self.edges.entry(from).or_default();
        let edge = Edge { block: to, cond };
        if !fwd.contains(&edge) {
            fwd.push(edge);
        }
        let bwd = self.back_edges.entry(to).or_default();
        let edge = Edge { block: from, cond };
        if !bwd.contains(&edge) {
            bwd.push(edge);
        }
    }

    /// Removes every edge from `from` to `to`, whatever its condition.
    pub fn remove_edges(&mut self, from: usize, to: usize) {
        if let Some(succs) = self.edges.get_mut(&from) {
            succs.retain(|e| e.block != to);
        }
        if let Some(preds) = self.back_edges.get_mut(&to) {
            preds.retain(|e| e.block != from);
        }
    }

    /// Removes a block and every edge touching it.
    pub fn remove_block(&mut self, idx: usize) -> Option<BasicBlock<A>> {
        for edge in self.edges.remove(&idx).unwrap_or_default() {
            if let Some(preds) = self.back_edges.get_mut(&edge.block) {
                preds.retain(|e| e.block != idx);
            }
        }
        for edge in self.back_edges.remove(&idx).unwrap_or_default() {
            if let Some(succs) = self.edges.get_mut(&edge.block) {
                succs.retain(|e| e.block != idx);
            }
        }
        self.blocks.remove(&idx)
    }

    /// Keeps only the blocks for which `keep` holds.
    pub fn retain_blocks<F: Fn(usize) -> bool>(&mut self, keep: F) {
        let doomed: Vec<usize> = self.blocks.keys().copied().filter(|&b| !keep(b)).collect();
        for block in doomed {
            log::trace!("removing block {}", block);
            self.remove_block(block);
        }
    }

    /// Blocks reachable from the entry along forward edges.
    pub fn reachable(&self) -> FxHashSet<usize> {
        let mut queue = vec![self.entry];
        let mut visited = queue.iter().copied().collect::<FxHashSet<_>>();
        while let Some(block) = queue.pop() {
            for edge in self.successors(block) {
                if self.blocks.contains_key(&edge.block) && visited.insert(edge.block) {
                    queue.push(edge.block);
                }
            }
        }
        visited
    }

    /// Finds an instruction and the index of the block holding it.
    pub fn find_instr(&self, label: Label) -> Option<(usize, InstrRef<'_, A>)> {
        self.blocks.values().find_map(|block| {
            block
                .instrs()
                .into_iter()
                .find(|instr| instr.label() == label)
                .map(|instr| (block.idx, instr))
        })
    }

    /// Labels of every instruction in the graph, in block order.
    pub fn labels(&self) -> Vec<Label> {
        self.blocks
            .values()
            .flat_map(|block| block.instrs().into_iter().map(|i| i.label()))
            .collect()
    }

    /// Index of the block holding each instruction.
    pub fn instr_blocks(&self) -> BTreeMap<Label, usize> {
        self.blocks
            .values()
            .flat_map(|block| {
                block
                    .instrs()
                    .into_iter()
                    .map(move |i| (i.label(), block.idx))
            })
            .collect()
    }

    pub fn map_annotations<B, F: FnMut(&A) -> B>(&self, mut f: F) -> Cfg<B> {
        let blocks = self
            .blocks
            .iter()
            .map(|(&idx, block)| {
                let content = match &block.content {
                    BlockContent::Data(instrs) => BlockContent::Data(
                        instrs.iter().map(|i| i.map_annotations(&mut f)).collect(),
                    ),
                    BlockContent::Control(instr) => {
                        BlockContent::Control(instr.map_annotations(&mut f))
                    }
                    BlockContent::Merge => BlockContent::Merge,
                };
                let block = BasicBlock {
                    idx,
                    content,
                    before: f(&block.before),
                    after: f(&block.after),
                };
                (idx, block)
            })
            .collect();
        Cfg {
            sig: self.sig.clone(),
            blocks,
            edges: self.edges.clone(),
            back_edges: self.back_edges.clone(),
            entry: self.entry,
            exit: self.exit,
        }
    }

    /// Same graph with the analysis states stripped, ready for re-analysis.
    pub fn clear_annotations(&self) -> Cfg<()> {
        self.map_annotations(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::{DataOp, Instr};

    fn three_blocks() -> Cfg<()> {
        let mut cfg = Cfg::new(FuncSig::default());
        for idx in 0..3 {
            let nop = Instr::new(Label::Instr(idx as u32), DataOp::Nop);
            let content = BlockContent::Data(vec![nop]);
            cfg.blocks.insert(idx, BasicBlock::new(idx, content));
        }
        cfg.add_edge(0, 1, None);
        cfg.add_edge(1, 2, None);
        cfg.exit = 2;
        cfg
    }

    #[test]
    fn edges_stay_in_sync() {
        let mut cfg = three_blocks();
        cfg.add_edge(0, 1, None);
        assert_eq!(cfg.successors(0).len(), 1);
        assert_eq!(cfg.predecessors(1), &[Edge { block: 0, cond: None }]);

        cfg.remove_block(1);
        assert!(cfg.successors(0).is_empty());
        assert!(cfg.predecessors(2).is_empty());
        assert!(!cfg.reachable().contains(&2));
    }

    #[test]
    fn finds_instructions_by_label() {
        let cfg = three_blocks();
        let (block, instr) = cfg.find_instr(Label::Instr(2)).unwrap();
        assert_eq!(block, 2);
        assert_eq!(instr.label(), Label::Instr(2));
        assert!(cfg.find_instr(Label::Instr(7)).is_none());
        assert_eq!(cfg.labels().len(), 3);
    }
}
