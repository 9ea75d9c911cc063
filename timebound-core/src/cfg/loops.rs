//! Loop Information
//!
//! Materializes one `LoopInfo` per back-edge target plus the implicit top
//! loop of the CFG: header, parent loop, children, depth, contained blocks
//! and exit edges. Built from the dominance relation; natural-loop bodies of
//! the same header are merged.

use crate::cfg::dominance::DomInfo;
use crate::cfg::{BlockId, Cfg, EdgeId};
use crate::prop::PropId;
use bitvec::prelude::*;
use smallvec::SmallVec;
use std::collections::HashMap;

/// Innermost enclosing loop header of a block (for a header block, the
/// header of the parent loop).
pub fn enclosing_loop_header() -> PropId<BlockId> {
    PropId::of("timebound::enclosing_loop_header")
}

/// Marks edges leaving a loop.
pub fn loop_exit_edge() -> PropId<bool> {
    PropId::of("timebound::loop_exit_edge")
}

/// One natural loop.
pub struct LoopInfo {
    pub header: BlockId,
    /// Header of the innermost enclosing loop, `None` for outermost loops.
    pub parent: Option<BlockId>,
    /// Headers of directly nested loops.
    pub children: SmallVec<[BlockId; 2]>,
    /// Nesting depth; outermost real loops have depth 1 (the top loop of the
    /// CFG has depth 0).
    pub depth: u32,
    /// Blocks of the loop, header included.
    pub body: BitVec,
    /// Edges from a body block to a block outside the loop.
    pub exits: SmallVec<[EdgeId; 2]>,
}

/// All loops of one CFG.
pub struct LoopForest {
    pub loops: HashMap<BlockId, LoopInfo>,
    /// Headers of outermost loops.
    pub top: SmallVec<[BlockId; 2]>,
    /// Per block, the innermost header whose loop contains it; for a header
    /// block, the parent header.
    pub enclosing: Vec<Option<BlockId>>,
    /// Per block, its loop nesting depth (0 outside every loop).
    pub depth: Vec<u32>,
}

impl LoopForest {
    pub fn build(cfg: &Cfg, dom: &DomInfo) -> LoopForest {
        let n = cfg.blocks.len();

        // natural loop bodies, merged per header
        let mut bodies: HashMap<BlockId, BitVec> = HashMap::new();
        for edge in &cfg.edges {
            if !dom.is_back_edge(edge.id) {
                continue;
            }
            let h = edge.sink;
            let body = bodies.entry(h).or_insert_with(|| {
                let mut b = bitvec![0; n];
                b.set(h as usize, true);
                b
            });
            let mut stack = vec![edge.source];
            while let Some(x) = stack.pop() {
                if body[x as usize] {
                    continue;
                }
                body.set(x as usize, true);
                for p in cfg.preds(x) {
                    stack.push(p);
                }
            }
        }

        // parent = header of the smallest strictly-containing body
        let mut headers: Vec<BlockId> = bodies.keys().copied().collect();
        headers.sort_by_key(|h| bodies[h].count_ones());
        let parent_of = |h: BlockId| -> Option<BlockId> {
            headers
                .iter()
                .copied()
                .filter(|&p| p != h && bodies[&p][h as usize])
                .min_by_key(|p| bodies[p].count_ones())
        };

        let mut loops: HashMap<BlockId, LoopInfo> = HashMap::new();
        for &h in &headers {
            let body = bodies[&h].clone();
            let exits = cfg
                .edges
                .iter()
                .filter(|e| body[e.source as usize] && !body[e.sink as usize])
                .map(|e| e.id)
                .collect();
            loops.insert(
                h,
                LoopInfo {
                    header: h,
                    parent: parent_of(h),
                    children: SmallVec::new(),
                    depth: 0,
                    body,
                    exits,
                },
            );
        }

        // children and depths; headers sorted by body size, so parents come
        // after children and depth is resolved by chasing the parent chain
        let mut top = SmallVec::new();
        for &h in &headers {
            match loops[&h].parent {
                Some(p) => loops.get_mut(&p).unwrap().children.push(h),
                None => top.push(h),
            }
            let mut depth = 1;
            let mut cur = loops[&h].parent;
            while let Some(p) = cur {
                depth += 1;
                cur = loops[&p].parent;
            }
            loops.get_mut(&h).unwrap().depth = depth;
        }

        // per-block innermost enclosing header and depth
        let mut enclosing: Vec<Option<BlockId>> = vec![None; n];
        let mut depth = vec![0u32; n];
        for b in 0..n as u32 {
            let innermost = headers
                .iter()
                .copied()
                .filter(|&h| loops[&h].body[b as usize] && h != b)
                .min_by_key(|h| loops[h].body.count_ones());
            enclosing[b as usize] = innermost;
            let own = loops.get(&b).map(|l| l.depth);
            depth[b as usize] = own.unwrap_or_else(|| {
                innermost.map(|h| loops[&h].depth).unwrap_or(0)
            });
        }

        LoopForest { loops, top, enclosing, depth }
    }

    /// The loop headed at `h`, if `h` is a header.
    pub fn of(&self, h: BlockId) -> Option<&LoopInfo> {
        self.loops.get(&h)
    }

    /// Innermost header whose loop contains the block, the block's own
    /// header included when it is one.
    pub fn innermost_containing(&self, b: BlockId) -> Option<BlockId> {
        if self.loops.contains_key(&b) {
            Some(b)
        } else {
            self.enclosing[b as usize]
        }
    }
}

/// Record enclosing headers and exit edges as annotations.
pub fn annotate(cfg: &mut Cfg, forest: &LoopForest) {
    for b in 0..cfg.blocks.len() {
        if let Some(h) = forest.enclosing[b] {
            cfg.blocks[b].props.set(enclosing_loop_header(), h);
        }
    }
    let mut exit_edges: Vec<EdgeId> = Vec::new();
    for info in forest.loops.values() {
        exit_edges.extend(info.exits.iter().copied());
    }
    for e in exit_edges {
        cfg.edges[e as usize].props.set(loop_exit_edge(), true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{Cfg, EdgeKind, ENTRY, EXIT};
    use crate::prog::{Inst, InstKind};
    use smallvec::SmallVec as SV;
    use std::sync::Arc;

    fn basic(cfg: &mut Cfg, address: u32) -> BlockId {
        cfg.add_basic(vec![Arc::new(Inst {
            address,
            size: 4,
            kind: InstKind::ALU,
            target: None,
            reads: SV::new(),
            writes: SV::new(),
            condition: None,
            uops: SV::new(),
        })])
    }

    /// Two nested loops:
    /// entry -> h1 -> h2 -> b -> h2 (back), b -> h1 (back), h1 -> exit
    fn nested() -> (Cfg, BlockId, BlockId, BlockId) {
        let mut cfg = Cfg::new("t", 0);
        let h1 = basic(&mut cfg, 0x00);
        let h2 = basic(&mut cfg, 0x04);
        let b = basic(&mut cfg, 0x08);
        cfg.add_edge(ENTRY, h1, EdgeKind::Virtual);
        cfg.add_edge(h1, h2, EdgeKind::NotTaken);
        cfg.add_edge(h2, b, EdgeKind::NotTaken);
        cfg.add_edge(b, h2, EdgeKind::Taken);
        cfg.add_edge(b, h1, EdgeKind::Taken);
        cfg.add_edge(h1, EXIT, EdgeKind::Taken);
        (cfg, h1, h2, b)
    }

    #[test]
    fn test_nesting_and_depth() {
        let (cfg, h1, h2, b) = nested();
        let dom = DomInfo::compute(&cfg);
        let forest = LoopForest::build(&cfg, &dom);

        assert_eq!(forest.loops.len(), 2);
        let outer = forest.of(h1).unwrap();
        let inner = forest.of(h2).unwrap();
        assert_eq!(outer.depth, 1);
        assert_eq!(inner.depth, 2);
        assert_eq!(inner.parent, Some(h1));
        assert_eq!(outer.parent, None);
        assert_eq!(outer.children.as_slice(), &[h2]);
        assert!(outer.body[b as usize]);
        assert!(inner.body[b as usize]);
        assert!(!inner.body[h1 as usize]);
        assert_eq!(forest.top.as_slice(), &[h1]);
    }

    #[test]
    fn test_enclosing_headers() {
        let (cfg, h1, h2, b) = nested();
        let dom = DomInfo::compute(&cfg);
        let forest = LoopForest::build(&cfg, &dom);
        assert_eq!(forest.enclosing[b as usize], Some(h2));
        assert_eq!(forest.enclosing[h2 as usize], Some(h1));
        assert_eq!(forest.enclosing[h1 as usize], None);
        assert_eq!(forest.depth[b as usize], 2);
        assert_eq!(forest.depth[h1 as usize], 1);
        assert_eq!(forest.depth[ENTRY as usize], 0);
    }

    #[test]
    fn test_exit_edges() {
        let (cfg, h1, h2, _) = nested();
        let dom = DomInfo::compute(&cfg);
        let forest = LoopForest::build(&cfg, &dom);
        let outer = forest.of(h1).unwrap();
        assert_eq!(outer.exits.len(), 1);
        assert_eq!(cfg.edge(outer.exits[0]).sink, EXIT);
        // the inner loop exits through h2 -> ... nothing: its only exit is
        // b -> h1 which stays in the outer loop but leaves the inner one
        let inner = forest.of(h2).unwrap();
        assert_eq!(inner.exits.len(), 1);
        assert_eq!(cfg.edge(inner.exits[0]).sink, h1);
    }
}
