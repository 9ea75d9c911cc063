//! Loop Unroller
//!
//! Splits every bounded loop into a "first iteration" copy and a "remaining
//! iterations" copy: entry edges are redirected to the first copy of the
//! header, back edges from the first copy target the second copy, and back
//! edges from the second copy target itself. Exit edges from either copy go
//! to the original exit target; edges into headers not yet cloned are
//! delayed on the target header until it is cloned.
//!
//! A loop with `MAX_ITERATION == 0` is left untouched, otherwise the
//! remaining part would carry an infeasible count of -1. The remaining-copy
//! header of an unrolled loop carries `UNROLLED_FROM` pointing at the
//! first-iteration copy, and its bound is lowered by one.

use crate::cfg::dominance::DomInfo;
use crate::cfg::loops::LoopForest;
use crate::cfg::{BlockId, BlockKind, Cfg, CfgCollection, EdgeKind, ENTRY, EXIT, UNKNOWN};
use crate::cfg::virtualize::recursive_loop;
use crate::error::Result;
use crate::flowfacts::max_iteration;
use crate::prop::PropId;
use std::collections::{HashMap, HashSet, VecDeque};

/// On the remaining-iterations copy of an unrolled header, the block id of
/// its first-iteration copy.
pub fn unrolled_from() -> PropId<BlockId> {
    PropId::of("timebound::unrolled_from")
}

/// Unroll the first iteration of every bounded loop of every CFG.
pub fn unroll_collection(coll: &CfgCollection) -> Result<CfgCollection> {
    let mut out = CfgCollection::default();
    for (_, cfg) in coll.iter() {
        out.cfgs.push(unroll_cfg(cfg)?);
    }
    Ok(out)
}

pub fn unroll_cfg(src: &Cfg) -> Result<Cfg> {
    let dom = DomInfo::compute(src);
    let forest = LoopForest::build(src, &dom);
    let mut u = Unroller {
        src,
        dom: &dom,
        forest: &forest,
        out: Cfg::new(src.label.clone(), src.address),
        map: HashMap::new(),
        delayed: HashMap::new(),
    };
    u.map.insert(ENTRY, ENTRY);
    u.map.insert(EXIT, EXIT);
    u.map.insert(UNKNOWN, UNKNOWN);
    u.unroll(None);
    // delayed edges whose target header got no further clone connect to the
    // target's last copy (a self back edge of the remaining-iterations copy)
    let leftovers: Vec<(BlockId, Vec<(BlockId, EdgeKind)>)> = u.delayed.drain().collect();
    for (t, pending) in leftovers {
        if let Some(&vdst) = u.map.get(&t) {
            for (vsrc, kind) in pending {
                u.out.add_edge(vsrc, vdst, kind);
            }
        }
    }
    Ok(u.out)
}

struct Unroller<'a> {
    src: &'a Cfg,
    dom: &'a DomInfo,
    forest: &'a LoopForest,
    out: Cfg,
    /// Original block to its most recent clone.
    map: HashMap<BlockId, BlockId>,
    /// Edges waiting for their target header to be cloned.
    delayed: HashMap<BlockId, Vec<(BlockId, EdgeKind)>>,
}

impl<'a> Unroller<'a> {
    fn clone_block(&mut self, b: BlockId) -> BlockId {
        let block = self.src.block(b);
        let nb = match &block.kind {
            BlockKind::Basic { insts } => self.out.add_basic(insts.clone()),
            BlockKind::Synth { callee, call_inst } => {
                let nb = self.out.add_synth(*callee, call_inst.clone());
                if block.props.get_or_default(recursive_loop()) {
                    self.out.block_mut(nb).props.set(recursive_loop(), true);
                }
                nb
            }
            _ => unreachable!("end blocks are never cloned"),
        };
        if let Some(&n) = block.props.get(max_iteration()) {
            self.out.block_mut(nb).props.set(max_iteration(), n);
        }
        nb
    }

    fn is_sub_header(&self, b: BlockId, header: Option<BlockId>) -> bool {
        self.forest.loops.contains_key(&b) && Some(b) != header
    }

    /// Duplicate the body of the given loop (or the whole top level when
    /// `header` is `None`), unrolling its first iteration.
    fn unroll(&mut self, header: Option<BlockId>) {
        let bound = header.and_then(|h| self.src.block(h).props.get(max_iteration()).copied());
        let dont_unroll = header.is_some() && bound == Some(0);
        let start = if dont_unroll { 1 } else { 0 };
        let end = if header.is_some() { 2 } else { 1 };

        let mut back_edges: Vec<(BlockId, EdgeKind)> = Vec::new();
        let mut first_copy: Option<BlockId> = None;

        for i in start..end {
            let seed = header.unwrap_or(ENTRY);
            let mut worklist: VecDeque<BlockId> = VecDeque::new();
            let mut done: HashSet<BlockId> = HashSet::new();
            let mut bbs: Vec<BlockId> = Vec::new();
            let mut sub_loops: Vec<BlockId> = Vec::new();
            worklist.push_back(seed);
            done.insert(seed);

            // duplicate the blocks of this level
            while let Some(current) = worklist.pop_front() {
                if self.is_sub_header(current, header) {
                    sub_loops.push(current);
                    // the sub-loop body is cloned by its own instance; keep
                    // walking from its exits
                    let exits: Vec<BlockId> = self.forest.loops[&current]
                        .exits
                        .iter()
                        .map(|&e| self.src.edge(e).sink)
                        .collect();
                    for t in exits {
                        if self.forest.enclosing_of(t) == header
                            && !matches!(t, EXIT | UNKNOWN)
                            && done.insert(t)
                        {
                            worklist.push_back(t);
                        }
                    }
                    continue;
                }

                let nb = if current == ENTRY {
                    ENTRY
                } else {
                    self.clone_block(current)
                };

                if let Some(pending) = self.delayed.remove(&current) {
                    for (vsrc, kind) in pending {
                        self.out.add_edge(vsrc, nb, kind);
                    }
                }

                if Some(current) == header && !dont_unroll {
                    if i == 0 {
                        first_copy = Some(nb);
                    } else {
                        let from = first_copy.expect("first copy cloned before second");
                        self.out.block_mut(nb).props.set(unrolled_from(), from);
                        if let Some(n) = bound {
                            self.out.block_mut(nb).props.set(max_iteration(), n - 1);
                        }
                    }
                }

                self.map.insert(current, nb);
                bbs.push(current);

                for eid in self.src.block(current).outs.clone() {
                    let edge = self.src.edge(eid);
                    let (t, kind) = (edge.sink, edge.kind);

                    // successors of this level, sub-loop headers included
                    if self.forest.enclosing_of(t) == header
                        && !matches!(t, ENTRY | EXIT | UNKNOWN)
                        && !done.contains(&t)
                    {
                        done.insert(t);
                        worklist.push_back(t);
                    }

                    // exit edges connect right away; targets that are
                    // themselves headers wait for their next clone so the
                    // flow enters their first-iteration copy
                    if header.is_some() && self.leaves_loop(eid, header.unwrap()) {
                        match self.map.get(&t).copied() {
                            Some(vdst) if !self.forest.loops.contains_key(&t) => {
                                self.out.add_edge(nb, vdst, kind);
                            }
                            _ => {
                                self.delayed.entry(t).or_default().push((nb, kind));
                            }
                        }
                    }
                }
            }

            // duplicate the sub-loops of this copy
            for l in sub_loops {
                self.unroll(Some(l));
            }

            // connect the internal edges of this copy
            for &b in &bbs {
                for eid in self.src.block(b).outs.clone() {
                    let edge = self.src.edge(eid);
                    let (t, kind) = (edge.sink, edge.kind);
                    if header.is_some() && self.leaves_loop(eid, header.unwrap()) {
                        continue;
                    }
                    if self.is_sub_header(t, header) {
                        continue; // wired by the sub-loop's entry pass
                    }
                    let vsrc = self.map[&b];
                    if Some(t) != header || i == 1 {
                        let vdst = self.map[&t];
                        self.out.add_edge(vsrc, vdst, kind);
                    } else {
                        back_edges.push((vsrc, kind));
                    }
                }
            }

            if i == start {
                // first copy: redirect the loop entry edges here; sources
                // sitting inside a loop not containing the header reach it
                // through an exit edge, wired by that loop's own instance
                if let Some(h) = header {
                    let vdst = self.map[&h];
                    let ins: Vec<(BlockId, EdgeKind)> = self
                        .src
                        .in_edges(h)
                        .filter(|e| !self.dom.is_back_edge(e.id))
                        .filter(|e| match self.forest.innermost_containing(e.source) {
                            Some(l) => self.forest.loops[&l].body[h as usize],
                            None => true,
                        })
                        .map(|e| (e.source, e.kind))
                        .collect();
                    for (s, kind) in ins {
                        if let Some(&vsrc) = self.map.get(&s) {
                            self.out.add_edge(vsrc, vdst, kind);
                        }
                    }
                }
            }
            if i == 1 {
                // remaining copy: back edges of the first copy land here
                let vdst = self.map[&header.unwrap()];
                for (vsrc, kind) in back_edges.drain(..) {
                    self.out.add_edge(vsrc, vdst, kind);
                }
            }
        }
    }

    fn leaves_loop(&self, eid: crate::cfg::EdgeId, header: BlockId) -> bool {
        let body = &self.forest.loops[&header].body;
        let e = self.src.edge(eid);
        body[e.source as usize] && !body[e.sink as usize]
    }
}

impl LoopForest {
    /// Enclosing header of a block as an `Option`, treating end blocks as
    /// top-level.
    fn enclosing_of(&self, b: BlockId) -> Option<BlockId> {
        self.enclosing.get(b as usize).copied().flatten()
    }
}
