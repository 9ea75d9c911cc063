//! Event Model
//!
//! Per-instruction variable-time events derived from the cache and
//! branch-prediction categories. Events are attached to blocks (or edges)
//! for downstream time analyses: each declares where it arises (fetch,
//! memory, branch or a custom unit), its cost in cycles, an occurrence
//! class and how it relates to the pipeline, plus hooks contributing its
//! occurrence bound to an ILP constraint.

use crate::branch::branch_category;
use crate::cache::dcache::DataBlocks;
use crate::cache::lblock::LBlockSet;
use crate::cache::purge::Purge;
use crate::cache::Category;
use crate::cfg::CfgCollection;
use crate::hard::{Bht, CacheConfig};
use crate::ilp::{Constraint, VarId};
use crate::ipet::misspred_var;
use crate::prog::Inst;
use crate::prop::PropId;
use std::rc::Rc;
use std::sync::Arc;

/// Which hardware feature causes the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Fetch,
    Mem,
    Branch,
    Custom(String),
}

/// How often the event arises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurrence {
    Never,
    Sometimes,
    Always,
    NoOccurrence,
}

impl Occurrence {
    /// Combine two occurrence classes; disagreement degrades to
    /// `Sometimes`.
    pub fn combine(self, other: Occurrence) -> Occurrence {
        use Occurrence::*;
        match (self, other) {
            (a, b) if a == b => a,
            (NoOccurrence, x) | (x, NoOccurrence) => x,
            _ => Sometimes,
        }
    }
}

/// How the event relates to the pipeline stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    /// The cost applies to the stage where the event arises.
    Local,
    /// The event starts after the end of the named unit.
    After(String),
    /// The event cannot start before the named unit.
    NotBefore(String),
}

/// One variable-time event attached to an instruction.
#[derive(Debug, Clone)]
pub struct Event {
    pub inst: Arc<Inst>,
    pub kind: EventKind,
    /// Cost in cycles when the event occurs.
    pub cost: u64,
    pub occurrence: Occurrence,
    pub ty: EventType,
    /// Counter variable bounding the occurrences, when the ILP has one.
    pub count_var: Option<VarId>,
}

impl Event {
    /// Does the event support estimating an upper (`on`) or lower (`!on`)
    /// occurrence bound?
    pub fn is_estimating(&self, on: bool) -> bool {
        on && self.count_var.is_some()
    }

    /// Contribute the occurrence count to a constraint.
    pub fn estimate(&self, cons: &mut Constraint, on: bool) {
        if on {
            if let Some(v) = self.count_var {
                cons.add_lhs(1.0, v);
            }
        }
    }
}

/// Events of a block.
pub fn events() -> PropId<Rc<Vec<Event>>> {
    PropId::of("timebound::events")
}

fn occurrence_of(cat: Category) -> Occurrence {
    match cat {
        Category::AlwaysHit => Occurrence::Never,
        Category::AlwaysMiss => Occurrence::Always,
        Category::FirstMiss(_) | Category::FirstHit | Category::NotClassified => {
            Occurrence::Sometimes
        }
    }
}

/// Derive the standard events from the computed categories and attach them
/// to their blocks. Runs after the ILP assembly so the miss counters are
/// known.
pub fn build_events(
    coll: &mut CfgCollection,
    lbsets: Option<&[LBlockSet]>,
    icache: Option<&CacheConfig>,
    data: Option<&DataBlocks>,
    dcache: Option<&CacheConfig>,
    bht: Option<&Bht>,
) {
    let mut per_block: std::collections::HashMap<(u32, u32), Vec<Event>> = Default::default();

    if let (Some(lbsets), Some(cache)) = (lbsets, icache) {
        for lbset in lbsets {
            for lb in &lbset.lblocks {
                let cfg = coll.get(lb.cfg);
                let inst = cfg
                    .block(lb.block)
                    .insts()
                    .iter()
                    .find(|i| i.address >= lb.address)
                    .cloned();
                let inst = match inst {
                    Some(i) => i,
                    None => continue,
                };
                per_block.entry((lb.cfg, lb.block)).or_default().push(Event {
                    inst,
                    kind: EventKind::Fetch,
                    cost: cache.miss_penalty,
                    occurrence: occurrence_of(lb.category),
                    ty: EventType::Local,
                    count_var: lb.miss_var,
                });
            }
        }
    }

    if let (Some(data), Some(cache)) = (data, dcache) {
        for (&(c, b), accs) in &data.accesses {
            for acc in accs {
                let cost = cache.miss_penalty
                    + match acc.purge {
                        Purge::Invalid | Purge::No => 0,
                        _ => acc.purge_time,
                    };
                per_block.entry((c, b)).or_default().push(Event {
                    inst: acc.inst.clone(),
                    kind: EventKind::Mem,
                    cost,
                    occurrence: occurrence_of(acc.category),
                    ty: EventType::Local,
                    count_var: acc.miss_var,
                });
            }
        }
    }

    if let Some(bht) = bht {
        for (c, cfg) in coll.iter() {
            for block in cfg.basic_blocks() {
                if !block.props.has(branch_category()) {
                    continue;
                }
                let ctrl = match block.control() {
                    Some(i) => i.clone(),
                    None => continue,
                };
                let cost = if ctrl.target.is_none() {
                    bht.cond_indirect_penalty
                } else {
                    bht.cond_penalty
                };
                per_block.entry((c, block.id)).or_default().push(Event {
                    inst: ctrl,
                    kind: EventKind::Branch,
                    cost,
                    occurrence: Occurrence::Sometimes,
                    ty: EventType::Local,
                    count_var: block.props.get(misspred_var()).copied(),
                });
            }
        }
    }

    for ((c, b), list) in per_block {
        coll.get_mut(c).block_mut(b).props.set(events(), Rc::new(list));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_occurrence_combine() {
        use Occurrence::*;
        assert_eq!(Never.combine(Never), Never);
        assert_eq!(NoOccurrence.combine(Always), Always);
        assert_eq!(Always.combine(Never), Sometimes);
        assert_eq!(Sometimes.combine(Always), Sometimes);
    }
}
