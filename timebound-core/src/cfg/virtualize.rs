//! Virtualizer
//!
//! Inlines called CFGs at their call sites, producing a single CFG per entry
//! function. The inlining decision per site is, in priority order: the
//! per-site `NO_INLINE` flag, the callee's `INLINING_POLICY` property, the
//! caller's propagated local policy, and finally the global default.
//!
//! Recursive calls are not inlined: when the callee is already on the
//! current call stack, the synthetic block stays and is flagged
//! `RECURSIVE_LOOP`. Non-inlined callees are virtualized on their own and
//! kept in the output collection.

use crate::cfg::{BlockId, BlockKind, Cfg, CfgCollection, CfgId, EdgeKind, ENTRY, EXIT, UNKNOWN};
use crate::error::Result;
use crate::prop::PropId;
use std::collections::{HashMap, HashSet};

/// Flags a kept synthetic block performing a recursive call.
pub fn recursive_loop() -> PropId<bool> {
    PropId::of("timebound::recursive_loop")
}

/// Per-CFG default inlining behavior, overriding the global default.
pub fn inlining_policy() -> PropId<bool> {
    PropId::of("timebound::inlining_policy")
}

/// Virtualization options.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Global default inlining policy (`VIRTUAL_DEFAULT`).
    pub default_inline: bool,
    /// Call-site instruction addresses where inlining is disabled.
    pub no_inline: HashSet<u32>,
}

impl Options {
    pub fn inline_all() -> Options {
        Options { default_inline: true, no_inline: HashSet::new() }
    }
}

/// Virtualize the collection rooted at its first CFG.
pub fn virtualize(old: &CfgCollection, opts: &Options) -> Result<CfgCollection> {
    let mut v = Virtualizer {
        old,
        opts,
        out: CfgCollection::default(),
        maker_of: HashMap::new(),
        todo: Vec::new(),
    };
    v.maker_for(0);
    while let Some(o) = v.todo.pop() {
        let into = v.maker_of[&o];
        let mut stack = vec![o];
        v.inline(o, into, &mut stack, None)?;
    }
    Ok(v.out)
}

struct Virtualizer<'a> {
    old: &'a CfgCollection,
    opts: &'a Options,
    out: CfgCollection,
    /// Old CFG id to its standalone virtualized counterpart.
    maker_of: HashMap<CfgId, CfgId>,
    todo: Vec<CfgId>,
}

impl<'a> Virtualizer<'a> {
    /// Standalone output CFG for an old CFG, queueing its construction.
    fn maker_for(&mut self, old_id: CfgId) -> CfgId {
        if let Some(&id) = self.maker_of.get(&old_id) {
            return id;
        }
        let old_cfg = self.old.get(old_id);
        let id = self.out.count();
        self.out.cfgs.push(Cfg::new(old_cfg.label.clone(), old_cfg.address));
        self.maker_of.insert(old_id, id);
        self.todo.push(old_id);
        id
    }

    fn is_inlined(&self, callee: CfgId, call_addr: Option<u32>, local: Option<bool>) -> bool {
        if let Some(addr) = call_addr {
            if self.opts.no_inline.contains(&addr) {
                return false;
            }
        }
        if let Some(&policy) = self.old.get(callee).props.get(inlining_policy()) {
            return policy;
        }
        local.unwrap_or(self.opts.default_inline)
    }

    /// Clone the body of `old_id` into the output CFG `into`, inlining
    /// callees per policy. The result maps old blocks to new blocks (end
    /// blocks to the output sentinels, inlined synthetics to `None`) and
    /// lists the connection points a call site of this body wires to.
    fn inline(
        &mut self,
        old_id: CfgId,
        into: CfgId,
        stack: &mut Vec<CfgId>,
        mut local: Option<bool>,
    ) -> Result<Inlined> {
        let old_cfg = self.old.get(old_id);
        log::debug!("inlining {} into output CFG {}", old_cfg.label, into);
        if let Some(&policy) = old_cfg.props.get(inlining_policy()) {
            local = Some(policy);
        }

        let n = old_cfg.blocks.len();
        let mut map: Vec<Option<BlockId>> = vec![None; n];
        map[ENTRY as usize] = Some(ENTRY);
        map[EXIT as usize] = Some(EXIT);
        map[UNKNOWN as usize] = Some(UNKNOWN);
        // per inlined synth block: the callee's inlining result
        let mut inlined: HashMap<BlockId, Inlined> = HashMap::new();

        for block in &old_cfg.blocks {
            match &block.kind {
                BlockKind::Entry | BlockKind::Exit | BlockKind::Unknown => {}
                BlockKind::Basic { insts } => {
                    let nb = self.out.get_mut(into).add_basic(insts.clone());
                    map[block.id as usize] = Some(nb);
                }
                BlockKind::Synth { callee, call_inst } => {
                    let call_addr = call_inst.as_ref().map(|i| i.address);
                    match callee {
                        Some(c) if stack.contains(c) => {
                            // recursion frontier: keep the call
                            let target = self.maker_for(*c);
                            let nb = self
                                .out
                                .get_mut(into)
                                .add_synth(Some(target), call_inst.clone());
                            self.out
                                .get_mut(into)
                                .block_mut(nb)
                                .props
                                .set(recursive_loop(), true);
                            log::debug!(
                                "recursive call at {:?} in {}: left as synthetic",
                                call_addr,
                                old_cfg.label
                            );
                            map[block.id as usize] = Some(nb);
                        }
                        Some(c) if self.is_inlined(*c, call_addr, local) => {
                            stack.push(*c);
                            let inner = self.inline(*c, into, stack, local)?;
                            stack.pop();
                            inlined.insert(block.id, inner);
                        }
                        Some(c) => {
                            let target = self.maker_for(*c);
                            let nb = self
                                .out
                                .get_mut(into)
                                .add_synth(Some(target), call_inst.clone());
                            map[block.id as usize] = Some(nb);
                        }
                        None => {
                            let nb = self.out.get_mut(into).add_synth(None, call_inst.clone());
                            map[block.id as usize] = Some(nb);
                        }
                    }
                }
            }
        }

        // reproduce the edges; a nested callee's own entry and exit edges
        // are rewired through its call site instead
        for e in &old_cfg.edges {
            if stack.len() > 1 && (e.source == ENTRY || e.sink == EXIT) {
                continue;
            }
            match (map[e.source as usize], map[e.sink as usize]) {
                (Some(src), Some(sink)) => {
                    self.out.get_mut(into).add_edge(src, sink, e.kind);
                }
                (Some(src), None) => {
                    // edge into an inlined call: connect to the callee body
                    let targets = inlined[&e.sink].entry_targets.clone();
                    for t in targets {
                        self.out.get_mut(into).add_edge(src, t, EdgeKind::Virtual);
                    }
                }
                (None, Some(sink)) => {
                    // return edge of an inlined call: connect the callee's
                    // returning blocks to the continuation
                    let sources = inlined[&e.source].return_sources.clone();
                    for s in sources {
                        self.out.get_mut(into).add_edge(s, sink, EdgeKind::Virtual);
                    }
                }
                (None, None) => {
                    // between two inlined synthetics: impossible, a synth
                    // never links directly to another synth
                    debug_assert!(false, "edge between two inlined call sites");
                }
            }
        }

        // connection points for this body's own call sites
        let mut entry_targets = Vec::new();
        for e in old_cfg.out_edges(ENTRY) {
            match map[e.sink as usize] {
                Some(t) => entry_targets.push(t),
                None => entry_targets.extend(inlined[&e.sink].entry_targets.iter().copied()),
            }
        }
        let mut return_sources = Vec::new();
        for e in old_cfg.in_edges(EXIT) {
            match map[e.source as usize] {
                Some(s) => return_sources.push(s),
                None => return_sources.extend(inlined[&e.source].return_sources.iter().copied()),
            }
        }

        Ok(Inlined { map, entry_targets, return_sources })
    }
}

/// Result of inlining one CFG body.
struct Inlined {
    /// Old block index to new block index.
    map: Vec<Option<BlockId>>,
    /// New blocks a call edge into this body connects to.
    entry_targets: Vec<BlockId>,
    /// New blocks that return out of this body.
    return_sources: Vec<BlockId>,
}

/// Count of reachable synthetic blocks with a known, non-recursive callee;
/// zero after a complete inline-everything virtualization.
pub fn reachable_inlinable_synths(cfg: &Cfg) -> usize {
    cfg.blocks
        .iter()
        .filter(|b| b.is_synth())
        .filter(|b| !b.props.get_or_default(recursive_loop()))
        .filter(|b| b.callee().is_some())
        .filter(|b| reachable_from_entry(cfg, b.id))
        .count()
}

fn reachable_from_entry(cfg: &Cfg, target: BlockId) -> bool {
    let mut seen = vec![false; cfg.blocks.len()];
    let mut stack = vec![ENTRY];
    while let Some(b) = stack.pop() {
        if b == target {
            return true;
        }
        if std::mem::replace(&mut seen[b as usize], true) {
            continue;
        }
        for s in cfg.succs(b) {
            stack.push(s);
        }
    }
    false
}
