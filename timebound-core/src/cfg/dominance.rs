//! Dominance
//!
//! Classical bit-vector dominator computation: for each block v,
//! `dom(v) = {v} ∪ ⋂_{u ∈ pred(v)} dom(u)` with `dom(entry) = {entry}` and
//! every other block initialized to the full set, iterated to fix-point.
//! After convergence, edges whose sink dominates their source are back
//! edges and their sinks are loop headers.
//!
//! The module also computes the CFG *ranking*: a reverse post-order on the
//! acyclic skeleton (back edges removed) such that every forward edge goes
//! to a strictly greater rank. The abstract-interpretation work-list
//! consumes it.

use crate::cfg::{BlockId, Cfg, EdgeId};
use crate::prop::PropId;
use bitvec::prelude::*;

/// Marks blocks that are entries of loops.
pub fn loop_header() -> PropId<bool> {
    PropId::of("timebound::loop_header")
}

/// Marks back edges.
pub fn back_edge() -> PropId<bool> {
    PropId::of("timebound::back_edge")
}

/// Dominance information of one CFG. Computed once, never mutated.
pub struct DomInfo {
    /// Per block, the bit-vector of its dominators.
    doms: Vec<BitVec>,
    /// Per edge id, whether the edge is a back edge.
    pub back_edges: BitVec,
    /// Per block id, whether the block is a loop header.
    pub headers: BitVec,
    /// Per block id, its rank.
    pub ranking: Vec<u32>,
    /// Blocks in increasing rank order.
    pub order: Vec<BlockId>,
}

impl DomInfo {
    pub fn compute(cfg: &Cfg) -> DomInfo {
        let n = cfg.blocks.len();
        let entry = cfg.entry() as usize;

        let mut doms: Vec<BitVec> = (0..n)
            .map(|i| {
                let mut set = bitvec![0; n];
                if i == entry {
                    set.set(entry, true);
                } else {
                    set.fill(true);
                }
                set
            })
            .collect();

        // iterate in a DFS post-order-derived order for fast convergence
        let rpo = reverse_post_order(cfg, |_| true);
        let mut changed = true;
        let mut buf = bitvec![0; n];
        while changed {
            changed = false;
            for &v in &rpo {
                let v = v as usize;
                if v == entry {
                    continue;
                }
                buf.fill(true);
                for u in cfg.preds(v as BlockId) {
                    intersect(&mut buf, &doms[u as usize]);
                }
                buf.set(v, true);
                if buf != doms[v] {
                    doms[v].copy_from_bitslice(&buf);
                    changed = true;
                }
            }
        }

        let mut back_edges = bitvec![0; cfg.edges.len()];
        let mut headers = bitvec![0; n];
        for edge in &cfg.edges {
            if doms[edge.source as usize][edge.sink as usize] {
                back_edges.set(edge.id as usize, true);
                headers.set(edge.sink as usize, true);
            }
        }

        // ranking: reverse post-order with back edges removed
        let order = {
            let back = &back_edges;
            reverse_post_order(cfg, |e| !back[e as usize])
        };
        let mut ranking = vec![u32::MAX; n];
        for (rank, &b) in order.iter().enumerate() {
            ranking[b as usize] = rank as u32;
        }
        // unreachable blocks rank last, in index order
        let mut order = order;
        let mut next = order.len() as u32;
        for b in 0..n {
            if ranking[b] == u32::MAX {
                ranking[b] = next;
                order.push(b as BlockId);
                next += 1;
            }
        }

        DomInfo { doms, back_edges, headers, ranking, order }
    }

    /// Does `a` dominate `b`? A block dominates itself.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.doms[b as usize][a as usize]
    }

    pub fn is_back_edge(&self, e: EdgeId) -> bool {
        self.back_edges[e as usize]
    }

    pub fn is_header(&self, b: BlockId) -> bool {
        self.headers[b as usize]
    }

    /// In-edges of `h` that enter the loop from outside (not back edges).
    pub fn entry_edges<'a>(&'a self, cfg: &'a Cfg, h: BlockId) -> impl Iterator<Item = EdgeId> + 'a {
        cfg.block(h)
            .ins
            .iter()
            .copied()
            .filter(move |&e| !self.is_back_edge(e))
    }

    /// Back edges targeting `h`.
    pub fn back_edges_of<'a>(&'a self, cfg: &'a Cfg, h: BlockId) -> impl Iterator<Item = EdgeId> + 'a {
        cfg.block(h)
            .ins
            .iter()
            .copied()
            .filter(move |&e| self.is_back_edge(e))
    }
}

/// Record the relation as block and edge annotations.
pub fn annotate(cfg: &mut Cfg, dom: &DomInfo) {
    for b in 0..cfg.blocks.len() {
        if dom.headers[b] {
            cfg.blocks[b].props.set(loop_header(), true);
        }
    }
    for e in 0..cfg.edges.len() {
        if dom.back_edges[e] {
            cfg.edges[e].props.set(back_edge(), true);
        }
    }
}

fn intersect(dst: &mut BitVec, src: &BitVec) {
    for (mut d, s) in dst.iter_mut().zip(src.iter()) {
        *d = *d && *s;
    }
}

/// Reverse post-order from the entry, following edges accepted by `keep`.
fn reverse_post_order(cfg: &Cfg, keep: impl Fn(EdgeId) -> bool) -> Vec<BlockId> {
    let n = cfg.blocks.len();
    let mut visited = bitvec![0; n];
    let mut post: Vec<BlockId> = Vec::with_capacity(n);
    // iterative DFS: (block, next out-edge position)
    let mut stack: Vec<(BlockId, usize)> = vec![(cfg.entry(), 0)];
    visited.set(cfg.entry() as usize, true);
    loop {
        let next = match stack.last_mut() {
            Some(top) => {
                let outs = &cfg.block(top.0).outs;
                if top.1 < outs.len() {
                    let e = outs[top.1];
                    top.1 += 1;
                    Some(e)
                } else {
                    None
                }
            }
            None => break,
        };
        match next {
            Some(e) => {
                if !keep(e) {
                    continue;
                }
                let sink = cfg.edge(e).sink;
                if !visited[sink as usize] {
                    visited.set(sink as usize, true);
                    stack.push((sink, 0));
                }
            }
            None => {
                let (b, _) = stack.pop().unwrap();
                post.push(b);
            }
        }
    }
    post.reverse();
    post
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{Cfg, EdgeKind, ENTRY, EXIT};
    use crate::prog::{Inst, InstKind};
    use smallvec::SmallVec;
    use std::sync::Arc;

    fn basic(cfg: &mut Cfg, address: u32) -> BlockId {
        cfg.add_basic(vec![Arc::new(Inst {
            address,
            size: 4,
            kind: InstKind::ALU,
            target: None,
            reads: SmallVec::new(),
            writes: SmallVec::new(),
            condition: None,
            uops: SmallVec::new(),
        })])
    }

    /// entry -> a -> b -> c -> exit with a back edge c -> b.
    fn diamond_with_loop() -> (Cfg, BlockId, BlockId, BlockId, EdgeId) {
        let mut cfg = Cfg::new("t", 0);
        let a = basic(&mut cfg, 0x00);
        let b = basic(&mut cfg, 0x04);
        let c = basic(&mut cfg, 0x08);
        cfg.add_edge(ENTRY, a, EdgeKind::Virtual);
        cfg.add_edge(a, b, EdgeKind::NotTaken);
        cfg.add_edge(b, c, EdgeKind::NotTaken);
        let back = cfg.add_edge(c, b, EdgeKind::Taken);
        cfg.add_edge(c, EXIT, EdgeKind::NotTaken);
        (cfg, a, b, c, back)
    }

    #[test]
    fn test_dominators() {
        let (cfg, a, b, c, _) = diamond_with_loop();
        let dom = DomInfo::compute(&cfg);
        assert!(dom.dominates(ENTRY, c));
        assert!(dom.dominates(a, b));
        assert!(dom.dominates(b, c));
        assert!(!dom.dominates(c, b));
        // a block dominates itself
        assert!(dom.dominates(b, b));
        // unique minimum: entry dominates everything reachable
        assert!(dom.dominates(ENTRY, EXIT));
    }

    #[test]
    fn test_back_edge_and_header() {
        let (cfg, _, b, _, back) = diamond_with_loop();
        let dom = DomInfo::compute(&cfg);
        assert!(dom.is_back_edge(back));
        assert!(dom.is_header(b));
        assert_eq!(dom.headers.count_ones(), 1);
        assert_eq!(dom.back_edges.count_ones(), 1);
    }

    #[test]
    fn test_ranking_is_topological_on_forward_edges() {
        let (cfg, _, _, _, back) = diamond_with_loop();
        let dom = DomInfo::compute(&cfg);
        for edge in &cfg.edges {
            if edge.id == back {
                continue;
            }
            assert!(
                dom.ranking[edge.source as usize] < dom.ranking[edge.sink as usize],
                "forward edge {} -> {} must increase rank",
                edge.source,
                edge.sink
            );
        }
    }
}
