//! Monotone Fix-Point Engine
//!
//! Generic abstract-interpretation driver over a CFG collection. The engine
//! owns a per-block value store (initialized to bottom), seeds the task
//! entry with the domain's entry value and drains a work-list ordered by the
//! CFG ranking:
//!
//! 1. pop the smallest-rank block v;
//! 2. IN(v) = join of the depth-adjusted OUT of every predecessor;
//! 3. OUT(v) = update(v, IN(v)) for basic blocks; synthetic call blocks
//!    propagate into the callee entry and read back the callee exit; exit
//!    blocks wake their call sites up;
//! 4. if OUT(v) changed, store and enqueue the successors.
//!
//! Crossing a loop boundary adjusts the value: entering k levels applies
//! `enter_loop` k times, leaving applies `leave_loop` (the persistence
//! domain keeps one item per level this way, and joined stacks always have
//! equal depth). With `unroll` set, each loop header keeps two input values,
//! one joined from the entry edges and one from the back edges, and its
//! output is the join of both updates.
//!
//! Termination requires the domain to have finite height along every
//! ascending chain; the cache domains all range over functions into
//! {⊥, 0, …, A}.

use crate::cfg::dominance::DomInfo;
use crate::cfg::loops::LoopForest;
use crate::cfg::{Block, BlockId, CfgCollection, CfgId, Edge, ENTRY, EXIT};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// An abstract domain for the fix-point engine.
pub trait Domain {
    type Value: Clone;

    /// Join identity; the initial value of every block store entry.
    fn bottom(&self) -> Self::Value;
    /// Value at the task entry.
    fn entry(&self) -> Self::Value;
    /// Least upper bound, accumulated into `a`.
    fn join(&self, a: &mut Self::Value, b: &Self::Value);
    fn equals(&self, a: &Self::Value, b: &Self::Value) -> bool;
    /// Transfer function of one basic block.
    fn update(&mut self, out: &mut Self::Value, input: &Self::Value, cfg: CfgId, block: &Block);
    /// Crossing into one loop level.
    fn enter_loop(&self, _v: &mut Self::Value) {}
    /// Crossing out of one loop level.
    fn leave_loop(&self, _v: &mut Self::Value) {}
    /// Effect of a call to an unknown callee.
    fn clobber(&self, v: &mut Self::Value);
}

/// Fix-point result: the abstract value at the entry and exit of every
/// block.
pub struct Solution<V> {
    pub ins: Vec<Vec<V>>,
    pub outs: Vec<Vec<V>>,
}

/// Inputs of one engine run.
pub struct Analysis<'a> {
    pub coll: &'a CfgCollection,
    pub doms: &'a [DomInfo],
    pub forests: &'a [LoopForest],
    /// First-iteration pseudo-unrolling of loop headers.
    pub unroll: bool,
}

impl<'a> Analysis<'a> {
    /// Run `domain` to fix-point. `entry_value` overrides the domain's
    /// entry value when the task starts in a non-default context.
    pub fn solve<D: Domain>(
        &self,
        domain: &mut D,
        entry_value: Option<D::Value>,
    ) -> Solution<D::Value> {
        let mut outs: Vec<Vec<D::Value>> = self
            .coll
            .iter()
            .map(|(_, cfg)| (0..cfg.blocks.len()).map(|_| domain.bottom()).collect())
            .collect();

        // call sites per callee
        let mut callers: HashMap<CfgId, Vec<(CfgId, BlockId)>> = HashMap::new();
        for (c, cfg) in self.coll.iter() {
            for block in &cfg.blocks {
                if let Some(k) = block.callee() {
                    callers.entry(k).or_default().push((c, block.id));
                }
            }
        }

        let mut heap: BinaryHeap<Reverse<(CfgId, u32, BlockId)>> = BinaryHeap::new();
        let mut queued: HashSet<(CfgId, BlockId)> = HashSet::new();
        let mut push = |heap: &mut BinaryHeap<_>, queued: &mut HashSet<_>, c: CfgId, b: BlockId| {
            if b != ENTRY && queued.insert((c, b)) {
                heap.push(Reverse((c, self.doms[c as usize].ranking[b as usize], b)));
            }
        };

        outs[0][ENTRY as usize] = entry_value.unwrap_or_else(|| domain.entry());
        let entry_succs: Vec<BlockId> = self.coll.get(0).succs(ENTRY).collect();
        for s in entry_succs {
            push(&mut heap, &mut queued, 0, s);
        }

        while let Some(Reverse((c, _, b))) = heap.pop() {
            queued.remove(&(c, b));
            let cfg = self.coll.get(c);
            let block = cfg.block(b);

            let input = self.input_of(domain, &outs, c, b);
            let mut out_new = domain.bottom();
            let mut wake_callers_of: Option<CfgId> = None;
            let mut callee_entry_changed: Option<CfgId> = None;

            match block.callee() {
                Some(k) if block.is_synth() => {
                    // feed the callee entry with this call site's input
                    let mut acc = outs[k as usize][ENTRY as usize].clone();
                    domain.join(&mut acc, &input);
                    if !domain.equals(&acc, &outs[k as usize][ENTRY as usize]) {
                        outs[k as usize][ENTRY as usize] = acc;
                        callee_entry_changed = Some(k);
                    }
                    // and resume with whatever the callee exit holds
                    out_new = outs[k as usize][EXIT as usize].clone();
                }
                _ if block.is_synth() => {
                    out_new = input.clone();
                    domain.clobber(&mut out_new);
                }
                _ if block.is_basic() => {
                    if self.unroll && self.doms[c as usize].is_header(b) {
                        let first = self
                            .input_over(domain, &outs, c, b, Some(false))
                            .unwrap_or_else(|| domain.bottom());
                        let rest = self.input_over(domain, &outs, c, b, Some(true));
                        let mut fo = domain.bottom();
                        domain.update(&mut fo, &first, c, block);
                        out_new = fo;
                        if let Some(rest) = rest {
                            let mut ro = domain.bottom();
                            domain.update(&mut ro, &rest, c, block);
                            domain.join(&mut out_new, &ro);
                        }
                    } else {
                        domain.update(&mut out_new, &input, c, block);
                    }
                }
                _ => {
                    // end blocks forward their input
                    out_new = input.clone();
                    if b == EXIT {
                        wake_callers_of = Some(c);
                    }
                }
            }

            if let Some(k) = callee_entry_changed {
                let succs: Vec<BlockId> = self.coll.get(k).succs(ENTRY).collect();
                for s in succs {
                    push(&mut heap, &mut queued, k, s);
                }
            }

            if !domain.equals(&out_new, &outs[c as usize][b as usize]) {
                outs[c as usize][b as usize] = out_new;
                for s in cfg.succs(b).collect::<Vec<_>>() {
                    push(&mut heap, &mut queued, c, s);
                }
                if let Some(k) = wake_callers_of {
                    if let Some(sites) = callers.get(&k) {
                        for &(cc, sb) in sites.clone().iter() {
                            push(&mut heap, &mut queued, cc, sb);
                        }
                    }
                }
            }
        }

        let ins: Vec<Vec<D::Value>> = self
            .coll
            .iter()
            .map(|(c, cfg)| {
                (0..cfg.blocks.len() as u32)
                    .map(|b| {
                        if b == ENTRY {
                            outs[c as usize][ENTRY as usize].clone()
                        } else {
                            self.input_of(domain, &outs, c, b)
                        }
                    })
                    .collect()
            })
            .collect();

        Solution { ins, outs }
    }

    /// IN(b): join over all in-edges of the depth-adjusted source outputs.
    fn input_of<D: Domain>(
        &self,
        domain: &D,
        outs: &[Vec<D::Value>],
        c: CfgId,
        b: BlockId,
    ) -> D::Value {
        self.input_over(domain, outs, c, b, None)
            .unwrap_or_else(|| domain.bottom())
    }

    /// Join over the in-edges of `b`, restricted to back edges
    /// (`Some(true)`), entry edges (`Some(false)`) or all (`None`).
    /// `None` is returned when no edge was joined.
    fn input_over<D: Domain>(
        &self,
        domain: &D,
        outs: &[Vec<D::Value>],
        c: CfgId,
        b: BlockId,
        back_only: Option<bool>,
    ) -> Option<D::Value> {
        let cfg = self.coll.get(c);
        let dom = &self.doms[c as usize];
        let mut acc: Option<D::Value> = None;
        for e in cfg.in_edges(b) {
            if let Some(want_back) = back_only {
                if dom.is_back_edge(e.id) != want_back {
                    continue;
                }
            }
            let v = self.adjusted(domain, &outs[c as usize][e.source as usize], c, e);
            match &mut acc {
                Some(a) => domain.join(a, &v),
                None => acc = Some(v),
            }
        }
        acc
    }

    /// Depth-adjust a value flowing along `e`: leave the loops of the
    /// source not containing the sink, then enter the sink's fresh levels.
    fn adjusted<D: Domain>(&self, domain: &D, v: &D::Value, c: CfgId, e: &Edge) -> D::Value {
        let forest = &self.forests[c as usize];
        let src_chain = header_chain(forest, forest.innermost_containing(e.source));
        let sink_chain = header_chain(forest, forest.innermost_containing(e.sink));
        let common = src_chain
            .iter()
            .zip(sink_chain.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let mut out = v.clone();
        for _ in common..src_chain.len() {
            domain.leave_loop(&mut out);
        }
        for _ in common..sink_chain.len() {
            domain.enter_loop(&mut out);
        }
        out
    }
}

/// Loop headers enclosing `innermost`, outermost first, `innermost`
/// included.
fn header_chain(forest: &LoopForest, innermost: Option<BlockId>) -> Vec<BlockId> {
    let mut chain = Vec::new();
    let mut cur = innermost;
    while let Some(h) = cur {
        chain.push(h);
        cur = forest.of(h).and_then(|l| l.parent);
    }
    chain.reverse();
    chain
}
