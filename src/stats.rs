//! Size stats for comparing a function with its slices.

use crate::cfg::Cfg;
use crate::instr::InstrRef;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SliceStats {
    /// Blocks reachable from the entry.
    pub blocks: usize,
    /// Instructions of the original body in reachable blocks.
    pub instrs: usize,
    /// Placeholders inserted by the slicer.
    pub synthetic: usize,
}

impl SliceStats {
    pub fn of<A>(cfg: &Cfg<A>) -> Self {
        let mut stats = SliceStats::default();
        stats.blocks = count_reachable_blocks(cfg, |instr| {
            if instr.label().is_synthetic() {
                stats.synthetic += 1;
            } else {
                stats.instrs += 1;
            }
        });
        stats
    }
}

fn count_reachable_blocks<A, F: FnMut(InstrRef<'_, A>)>(cfg: &Cfg<A>, mut visit: F) -> usize {
    let reachable = cfg.reachable();
    for block in cfg.blocks.values() {
        if reachable.contains(&block.idx) {
            block.instrs().into_iter().for_each(&mut visit);
        }
    }
    reachable.len()
}
