//! Reverse-postorder numbering of a CFG's blocks.

use crate::cfg::Cfg;
use fxhash::{FxHashMap, FxHashSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RPOIndex(u32);
impl RPOIndex {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

pub struct RPO {
    order: Vec<usize>,
    rev: FxHashMap<usize, RPOIndex>,
}

impl RPO {
    pub fn new<A>(cfg: &Cfg<A>) -> RPO {
        let mut postorder = vec![];
        let mut visited = FxHashSet::default();
        visited.insert(cfg.entry);
        // Each frame is a block and the position of its next successor, so
        // deep graphs do not grow the native stack.
        let mut stack = vec![(cfg.entry, 0usize)];
        while let Some((block, next)) = stack.pop() {
            match cfg.successors(block).get(next) {
                Some(edge) => {
                    stack.push((block, next + 1));
                    if cfg.blocks.contains_key(&edge.block) && visited.insert(edge.block) {
                        stack.push((edge.block, 0));
                    }
                }
                None => postorder.push(block),
            }
        }
        postorder.reverse();

        let rev = postorder
            .iter()
            .enumerate()
            .map(|(i, &block)| (block, RPOIndex(i as u32)))
            .collect();
        log::trace!("rpo: {:?}", postorder);

        RPO {
            order: postorder,
            rev,
        }
    }

    /// Appends a block not reachable from the entry so that it still
    /// gets a position.
    pub fn push(&mut self, block: usize) -> RPOIndex {
        if let Some(&index) = self.rev.get(&block) {
            return index;
        }
        let index = RPOIndex(self.order.len() as u32);
        self.order.push(block);
        self.rev.insert(block, index);
        index
    }

    pub fn block_at(&self, index: RPOIndex) -> usize {
        self.order[index.index()]
    }

    pub fn iter<'a>(&'a self) -> impl Iterator<Item = usize> + 'a {
        self.order.iter().copied()
    }

    pub fn iter_with_index<'a>(&'a self) -> impl Iterator<Item = (RPOIndex, usize)> + 'a {
        self.order
            .iter()
            .copied()
            .enumerate()
            .map(|(i, block)| (RPOIndex(i as u32), block))
    }

    pub fn index_of_block(&self, block: usize) -> Option<RPOIndex> {
        self.rev.get(&block).copied()
    }
}
