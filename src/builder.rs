//! Construction of a [`Cfg`] from a structured function body.
//!
//! Every node of the body gets the next sequential label, including
//! `block`/`loop`/`if` nodes and code that turns out to be dead, so labels
//! match the position of each node in a pre-order walk of the input.
//!
//! The builder also tracks the static operand-stack height. Every source
//! reaching the same join must carry the same height, since the CFG has no
//! way to drop the operands a Wasm branch would unwind.

use crate::cfg::{BasicBlock, BlockContent, Cfg, FuncSig};
use crate::error::{Error, Result};
use crate::instr::{ControlOp, DataOp, Instr, Label};
use serde::{Deserialize, Serialize};

/// A function as read from JSON: its signature fields and its body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Function {
    #[serde(flatten)]
    pub sig: FuncSig,
    pub body: Vec<Node>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Op(DataOp),
    /// A branch, call, `return` or `unreachable`. `if` is written as
    /// [`Node::If`].
    Control(ControlOp),
    Block(Vec<Node>),
    Loop(Vec<Node>),
    If {
        then: Vec<Node>,
        #[serde(rename = "else", default)]
        otherwise: Vec<Node>,
    },
}

impl Node {
    fn children(&self) -> Box<dyn Iterator<Item = &Node> + '_> {
        match self {
            Node::Op(_) | Node::Control(_) => Box::new(std::iter::empty()),
            Node::Block(body) | Node::Loop(body) => Box::new(body.iter()),
            Node::If { then, otherwise } => Box::new(then.iter().chain(otherwise.iter())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScopeKind {
    Block,
    Loop(usize),
    If,
}

struct Scope {
    kind: ScopeKind,
    /// Branch sources targeting the end of this scope.
    breaks: Vec<(usize, Option<bool>)>,
    /// Stack height every source reaching the target must have; fixed by
    /// the first one when not known up front.
    height: Option<usize>,
}

impl Scope {
    fn new(kind: ScopeKind, height: Option<usize>) -> Self {
        Scope {
            kind,
            breaks: vec![],
            height,
        }
    }

    fn reach(&mut self, label: Label, height: usize) -> Result<()> {
        match self.height {
            Some(expected) if expected != height => Err(Error::UnbalancedBranch {
                label,
                height,
                expected,
            }),
            Some(_) => Ok(()),
            None => {
                self.height = Some(height);
                Ok(())
            }
        }
    }
}

/// Where control goes after the last emitted node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Frontier {
    /// Nothing falls through.
    Dead,
    /// A data block that further data ops are appended to.
    Open(usize),
    /// The next block is entered from this block along an edge with this
    /// condition.
    Edge(usize, Option<bool>),
}

impl Frontier {
    fn source(self) -> Option<(usize, Option<bool>)> {
        match self {
            Frontier::Dead => None,
            Frontier::Open(block) => Some((block, None)),
            Frontier::Edge(block, cond) => Some((block, cond)),
        }
    }
}

struct Builder {
    cfg: Cfg<()>,
    next_label: u32,
    scopes: Vec<Scope>,
    frontier: Frontier,
    /// Operand-stack height at the frontier.
    height: usize,
}

/// Builds the CFG of `func`.
pub fn build(func: &Function) -> Result<Cfg<()>> {
    let results = match func.sig.results.len() {
        0 => None,
        n => Some(n),
    };
    let mut builder = Builder {
        cfg: Cfg::new(func.sig.clone()),
        next_label: 0,
        scopes: vec![Scope::new(ScopeKind::Block, results)],
        frontier: Frontier::Dead,
        height: 0,
    };
    let entry = builder.new_block(BlockContent::Data(vec![]));
    builder.cfg.entry = entry;
    builder.frontier = Frontier::Open(entry);

    builder.seq(&func.body)?;

    let root = builder
        .scopes
        .pop()
        .unwrap_or_else(|| Scope::new(ScopeKind::Block, results));
    if builder.frontier != Frontier::Dead {
        match root.height {
            Some(expected) if expected != builder.height => {
                return Err(Error::UnbalancedResult {
                    height: builder.height,
                    expected,
                })
            }
            _ => {}
        }
    }
    let mut sources = root.breaks;
    sources.extend(builder.frontier.source());
    let exit = builder.new_block(BlockContent::Merge);
    for (src, cond) in sources {
        builder.cfg.add_edge(src, exit, cond);
    }
    builder.cfg.exit = exit;

    log::debug!(
        "built CFG: {} blocks, {} labels",
        builder.cfg.blocks.len(),
        builder.next_label
    );
    Ok(builder.cfg)
}

impl Builder {
    fn label(&mut self) -> Label {
        let label = Label::Instr(self.next_label);
        self.next_label += 1;
        label
    }

    fn new_block(&mut self, content: BlockContent<()>) -> usize {
        let idx = self.cfg.blocks.len();
        self.cfg.blocks.insert(idx, BasicBlock::new(idx, content));
        idx
    }

    /// Adds the fall-through edge from the frontier to `target`.
    fn flow_into(&mut self, target: usize) {
        if let Some((src, cond)) = self.frontier.source() {
            self.cfg.add_edge(src, target, cond);
        }
    }

    fn pop(&mut self, label: Label, n: usize) -> Result<()> {
        self.height = self.height.checked_sub(n).ok_or(Error::StackUnderflow {
            label,
            needed: n,
            available: self.height,
        })?;
        Ok(())
    }

    /// Pops the scope that just ended, checking the fall-through height.
    fn end_scope(&mut self, label: Label) -> Result<Scope> {
        let mut scope = self
            .scopes
            .pop()
            .ok_or(Error::InvalidBranchDepth { label, depth: 0 })?;
        if self.frontier != Frontier::Dead {
            scope.reach(label, self.height)?;
        }
        Ok(scope)
    }

    fn skip_children(&mut self, node: &Node) {
        for child in node.children() {
            self.label();
            self.skip_children(child);
        }
    }

    fn seq(&mut self, nodes: &[Node]) -> Result<()> {
        for node in nodes {
            self.node(node)?;
        }
        Ok(())
    }

    fn node(&mut self, node: &Node) -> Result<()> {
        let label = self.label();
        if self.frontier == Frontier::Dead {
            log::trace!("{} is dead code", label);
            self.skip_children(node);
            return Ok(());
        }
        match node {
            Node::Op(op) => {
                let (params, results) = op.arity();
                self.pop(label, params)?;
                self.height += results;
                self.data(label, op.clone());
            }
            Node::Control(op) => self.control(label, op)?,
            Node::Block(body) => {
                self.scopes.push(Scope::new(ScopeKind::Block, None));
                self.seq(body)?;
                let scope = self.end_scope(label)?;
                self.join(scope.breaks, scope.height);
            }
            Node::Loop(body) => {
                let header = self.new_block(BlockContent::Merge);
                self.flow_into(header);
                self.frontier = Frontier::Edge(header, None);
                self.scopes.push(Scope::new(ScopeKind::Loop(header), Some(self.height)));
                self.seq(body)?;
                self.scopes.pop();
            }
            Node::If { then, otherwise } => {
                self.pop(label, 1)?;
                let entry_height = self.height;
                let cond = self.new_control(label, ControlOp::If);
                self.scopes.push(Scope::new(ScopeKind::If, None));
                self.frontier = Frontier::Edge(cond, Some(true));
                self.seq(then)?;
                let then_end = self.frontier.source();
                if then_end.is_some() {
                    if let Some(scope) = self.scopes.last_mut() {
                        scope.reach(label, self.height)?;
                    }
                }
                self.height = entry_height;
                self.frontier = Frontier::Edge(cond, Some(false));
                self.seq(otherwise)?;
                let scope = self.end_scope(label)?;
                let mut sources: Vec<_> = then_end.into_iter().collect();
                sources.extend(scope.breaks);
                self.join(sources, scope.height);
            }
        }
        Ok(())
    }

    fn data(&mut self, label: Label, op: DataOp) {
        let block = match self.frontier {
            Frontier::Open(block) => block,
            _ => {
                let block = self.new_block(BlockContent::Data(vec![]));
                self.flow_into(block);
                self.frontier = Frontier::Open(block);
                block
            }
        };
        if let Some(BasicBlock {
            content: BlockContent::Data(instrs),
            ..
        }) = self.cfg.blocks.get_mut(&block)
        {
            instrs.push(Instr::new(label, op));
        }
    }

    fn new_control(&mut self, label: Label, op: ControlOp) -> usize {
        let block = self.new_block(BlockContent::Control(Instr::new(label, op)));
        self.flow_into(block);
        block
    }

    fn control(&mut self, label: Label, op: &ControlOp) -> Result<()> {
        if *op == ControlOp::If {
            return Err(Error::Unsupported {
                label,
                reason: "`if` must be given as a structured node".to_string(),
            });
        }
        let block = self.new_control(label, op.clone());
        self.frontier = match op {
            ControlOp::Call { arity, .. } => {
                self.pop(label, arity.params)?;
                self.height += arity.results;
                Frontier::Edge(block, None)
            }
            ControlOp::CallIndirect { arity, .. } => {
                self.pop(label, arity.params + 1)?;
                self.height += arity.results;
                Frontier::Edge(block, None)
            }
            &ControlOp::Br(depth) => {
                self.branch(label, block, depth, None)?;
                Frontier::Dead
            }
            &ControlOp::BrIf(depth) => {
                self.pop(label, 1)?;
                self.branch(label, block, depth, Some(true))?;
                Frontier::Edge(block, Some(false))
            }
            ControlOp::BrTable { targets, default } => {
                self.pop(label, 1)?;
                for &depth in targets.iter().chain(std::iter::once(default)) {
                    self.branch(label, block, depth, None)?;
                }
                Frontier::Dead
            }
            ControlOp::Return => {
                // Returning keeps only the results.
                let results = self.cfg.sig.results.len();
                self.pop(label, results)?;
                if let Some(root) = self.scopes.first_mut() {
                    root.reach(label, results)?;
                    root.breaks.push((block, None));
                }
                Frontier::Dead
            }
            ControlOp::Unreachable | ControlOp::If => Frontier::Dead,
        };
        Ok(())
    }

    fn branch(&mut self, label: Label, src: usize, depth: u32, cond: Option<bool>) -> Result<()> {
        let scope = self
            .scopes
            .len()
            .checked_sub(depth as usize + 1)
            .and_then(|i| self.scopes.get_mut(i))
            .ok_or(Error::InvalidBranchDepth { label, depth })?;
        scope.reach(label, self.height)?;
        match scope.kind {
            ScopeKind::Loop(header) => self.cfg.add_edge(src, header, cond),
            ScopeKind::Block | ScopeKind::If => scope.breaks.push((src, cond)),
        }
        Ok(())
    }

    /// Ends a `block` or `if`: a merge block joins the fall-through and
    /// every branch to the end, if there is any.
    fn join(&mut self, mut sources: Vec<(usize, Option<bool>)>, height: Option<usize>) {
        sources.extend(self.frontier.source());
        if sources.is_empty() {
            self.frontier = Frontier::Dead;
            return;
        }
        if let Some(height) = height {
            self.height = height;
        }
        let merge = self.new_block(BlockContent::Merge);
        for (src, cond) in sources {
            self.cfg.add_edge(src, merge, cond);
        }
        self.frontier = Frontier::Edge(merge, None);
    }
}
