//! Control Flow Graph Model
//!
//! Arena-based CFG: blocks and edges are dense `u32`-indexed entries of two
//! vectors owned by the graph; edges store (source, sink) indices and blocks
//! store their in/out edge index lists. This removes lifetime cycles between
//! blocks, edges and graphs, and makes cloning for the transformers a vector
//! duplication.
//!
//! Every CFG carries exactly one entry, one exit and one unknown sentinel
//! block (indices 0, 1 and 2). Calls between CFGs go through synthetic
//! blocks; an edge never crosses graphs.
//!
//! # Memory Layout
//! - block and edge ids are `u32`
//! - `Block.ins` / `Block.outs` use `SmallVec<[u32; 2]>` (most blocks have ≤2)

use crate::prog::Inst;
use crate::prop::PropList;
use smallvec::SmallVec;
use std::sync::Arc;

pub mod builder;
pub mod dominance;
pub mod loops;
pub mod restructure;
pub mod subcfg;
pub mod unroll;
pub mod virtualize;

/// Block index within its CFG.
pub type BlockId = u32;
/// Edge index within its CFG.
pub type EdgeId = u32;
/// CFG index within the collection.
pub type CfgId = u32;

pub const ENTRY: BlockId = 0;
pub const EXIT: BlockId = 1;
pub const UNKNOWN: BlockId = 2;

/// Kind of a CFG block.
pub enum BlockKind {
    /// Entry sentinel: no predecessors.
    Entry,
    /// Exit sentinel: no successors.
    Exit,
    /// Sink for unresolved control flow.
    Unknown,
    /// Ordered, non-empty run of contiguous instructions ending at most once.
    Basic { insts: Vec<Arc<Inst>> },
    /// Placeholder for a call to another CFG (`None` when the callee is
    /// unknown).
    Synth {
        callee: Option<CfgId>,
        call_inst: Option<Arc<Inst>>,
    },
}

/// A CFG block.
pub struct Block {
    pub id: BlockId,
    pub kind: BlockKind,
    /// Incoming edge indices.
    pub ins: SmallVec<[EdgeId; 2]>,
    /// Outgoing edge indices.
    pub outs: SmallVec<[EdgeId; 2]>,
    pub props: PropList,
}

impl Block {
    pub fn is_basic(&self) -> bool {
        matches!(self.kind, BlockKind::Basic { .. })
    }

    pub fn is_synth(&self) -> bool {
        matches!(self.kind, BlockKind::Synth { .. })
    }

    pub fn is_end(&self) -> bool {
        matches!(
            self.kind,
            BlockKind::Entry | BlockKind::Exit | BlockKind::Unknown
        )
    }

    /// Instructions of a basic block, empty for every other kind.
    pub fn insts(&self) -> &[Arc<Inst>] {
        match &self.kind {
            BlockKind::Basic { insts } => insts,
            _ => &[],
        }
    }

    /// Address of the first instruction (or of the call site for a
    /// synthetic block).
    pub fn address(&self) -> Option<u32> {
        match &self.kind {
            BlockKind::Basic { insts } => insts.first().map(|i| i.address),
            BlockKind::Synth { call_inst, .. } => call_inst.as_ref().map(|i| i.address),
            _ => None,
        }
    }

    /// Sum of instruction sizes.
    pub fn size(&self) -> u32 {
        self.insts().iter().map(|i| i.size).sum()
    }

    /// Address of the byte after the block.
    pub fn top_address(&self) -> Option<u32> {
        self.address().map(|a| a.wrapping_add(self.size()))
    }

    /// The control instruction ending a basic block, if the block ends with
    /// one.
    pub fn control(&self) -> Option<&Arc<Inst>> {
        self.insts().last().filter(|i| i.is_control())
    }

    pub fn callee(&self) -> Option<CfgId> {
        match self.kind {
            BlockKind::Synth { callee, .. } => callee,
            _ => None,
        }
    }
}

/// Kind of a control-flow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EdgeKind {
    /// Branch taken.
    Taken = 0,
    /// Branch not taken or sequential flow.
    NotTaken = 1,
    /// Caller block to synthetic call block.
    Call = 2,
    /// Synthetic call block to the continuation.
    Return = 3,
    /// Inserted by a transformer; carries no machine branch.
    Virtual = 4,
}

/// A directed edge between two blocks of the same CFG.
pub struct Edge {
    pub id: EdgeId,
    pub source: BlockId,
    pub sink: BlockId,
    pub kind: EdgeKind,
    pub props: PropList,
}

impl Edge {
    pub fn is_taken(&self) -> bool {
        self.kind == EdgeKind::Taken
    }
    pub fn is_not_taken(&self) -> bool {
        self.kind == EdgeKind::NotTaken
    }
}

/// Control flow graph of one function (after virtualization, of the whole
/// task).
pub struct Cfg {
    pub label: String,
    /// Address of the first instruction.
    pub address: u32,
    pub blocks: Vec<Block>,
    pub edges: Vec<Edge>,
    pub props: PropList,
}

impl Cfg {
    /// Create a CFG holding only its three sentinel blocks.
    pub fn new(label: impl Into<String>, address: u32) -> Cfg {
        let mut cfg = Cfg {
            label: label.into(),
            address,
            blocks: Vec::new(),
            edges: Vec::new(),
            props: PropList::new(),
        };
        cfg.push_block(BlockKind::Entry);
        cfg.push_block(BlockKind::Exit);
        cfg.push_block(BlockKind::Unknown);
        cfg
    }

    pub fn entry(&self) -> BlockId {
        ENTRY
    }
    pub fn exit(&self) -> BlockId {
        EXIT
    }
    pub fn unknown(&self) -> BlockId {
        UNKNOWN
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id as usize]
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id as usize]
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
        &mut self.edges[id as usize]
    }

    pub fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    fn push_block(&mut self, kind: BlockKind) -> BlockId {
        let id = self.blocks.len() as BlockId;
        self.blocks.push(Block {
            id,
            kind,
            ins: SmallVec::new(),
            outs: SmallVec::new(),
            props: PropList::new(),
        });
        id
    }

    pub fn add_basic(&mut self, insts: Vec<Arc<Inst>>) -> BlockId {
        debug_assert!(!insts.is_empty(), "basic blocks are non-empty");
        self.push_block(BlockKind::Basic { insts })
    }

    pub fn add_synth(&mut self, callee: Option<CfgId>, call_inst: Option<Arc<Inst>>) -> BlockId {
        self.push_block(BlockKind::Synth { callee, call_inst })
    }

    pub fn add_edge(&mut self, source: BlockId, sink: BlockId, kind: EdgeKind) -> EdgeId {
        let id = self.edges.len() as EdgeId;
        self.edges.push(Edge {
            id,
            source,
            sink,
            kind,
            props: PropList::new(),
        });
        self.blocks[source as usize].outs.push(id);
        self.blocks[sink as usize].ins.push(id);
        id
    }

    /// Successor block ids of a block.
    pub fn succs(&self, id: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.block(id).outs.iter().map(move |&e| self.edge(e).sink)
    }

    /// Predecessor block ids of a block.
    pub fn preds(&self, id: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.block(id).ins.iter().map(move |&e| self.edge(e).source)
    }

    /// Outgoing edges of a block.
    pub fn out_edges(&self, id: BlockId) -> impl Iterator<Item = &Edge> + '_ {
        self.block(id).outs.iter().map(move |&e| self.edge(e))
    }

    /// Incoming edges of a block.
    pub fn in_edges(&self, id: BlockId) -> impl Iterator<Item = &Edge> + '_ {
        self.block(id).ins.iter().map(move |&e| self.edge(e))
    }

    /// Basic blocks of the graph, in index order.
    pub fn basic_blocks(&self) -> impl Iterator<Item = &Block> + '_ {
        self.blocks.iter().filter(|b| b.is_basic())
    }

    /// The basic block whose byte range contains the address.
    pub fn block_at(&self, address: u32) -> Option<BlockId> {
        self.blocks.iter().find_map(|b| match (b.address(), b.top_address()) {
            (Some(lo), Some(hi)) if b.is_basic() && lo <= address && address < hi => Some(b.id),
            _ => None,
        })
    }
}

/// The set of CFGs involved in the analysis. The first one is the task
/// entry.
#[derive(Default)]
pub struct CfgCollection {
    pub cfgs: Vec<Cfg>,
}

impl CfgCollection {
    pub fn entry_cfg(&self) -> &Cfg {
        &self.cfgs[0]
    }

    pub fn get(&self, id: CfgId) -> &Cfg {
        &self.cfgs[id as usize]
    }

    pub fn get_mut(&mut self, id: CfgId) -> &mut Cfg {
        &mut self.cfgs[id as usize]
    }

    pub fn count(&self) -> u32 {
        self.cfgs.len() as u32
    }

    pub fn iter(&self) -> impl Iterator<Item = (CfgId, &Cfg)> + '_ {
        self.cfgs.iter().enumerate().map(|(i, c)| (i as CfgId, c))
    }
}
