//! Conditional Restructurer
//!
//! Splits every basic block containing conditional instructions into one
//! block per feasible combination of predicate evaluations. Each case keeps
//! the set of conditions it assumed; an instruction whose condition register
//! is written later drops the assumption, a contradicted instruction is
//! replaced by a NOP placeholder, and the branch mode of the case (taken
//! only, not-taken only, or both) restricts which outgoing edges each case
//! version connects to.

use crate::cfg::{BlockId, BlockKind, Cfg, CfgCollection, EdgeKind, ENTRY, EXIT, UNKNOWN};
use crate::error::Result;
use crate::prog::{Condition, Inst};
use smallvec::SmallVec;
use std::sync::Arc;

const TAKEN: u8 = 0b01;
const NOT_TAKEN: u8 = 0b10;
const BOTH: u8 = 0b11;
const NONE: u8 = 0b00;

pub fn restructure_collection(coll: &CfgCollection) -> Result<CfgCollection> {
    let mut out = CfgCollection::default();
    for (_, cfg) in coll.iter() {
        out.cfgs.push(restructure_cfg(cfg));
    }
    Ok(out)
}

pub fn restructure_cfg(src: &Cfg) -> Cfg {
    let mut out = Cfg::new(src.label.clone(), src.address);

    // split the blocks; each original block maps to its case versions
    let mut versions: Vec<SmallVec<[(BlockId, u8); 2]>> = Vec::with_capacity(src.blocks.len());
    for block in &src.blocks {
        let vs = match &block.kind {
            BlockKind::Entry => SmallVec::from_slice(&[(ENTRY, BOTH)]),
            BlockKind::Exit => SmallVec::from_slice(&[(EXIT, BOTH)]),
            BlockKind::Unknown => SmallVec::from_slice(&[(UNKNOWN, BOTH)]),
            BlockKind::Synth { callee, call_inst } => {
                let nb = out.add_synth(*callee, call_inst.clone());
                if block.props.get_or_default(crate::cfg::virtualize::recursive_loop()) {
                    out.block_mut(nb)
                        .props
                        .set(crate::cfg::virtualize::recursive_loop(), true);
                }
                SmallVec::from_slice(&[(nb, BOTH)])
            }
            BlockKind::Basic { insts } => {
                let bound = block.props.get(crate::flowfacts::max_iteration()).copied();
                let mut vs = SmallVec::new();
                for case in split(insts) {
                    let nb = out.add_basic(case.insts);
                    if let Some(n) = bound {
                        out.block_mut(nb)
                            .props
                            .set(crate::flowfacts::max_iteration(), n);
                    }
                    vs.push((nb, case.bra));
                }
                vs
            }
        };
        versions.push(vs);
    }

    // re-build the edges: every compatible source version connects to every
    // version of the target
    for e in &src.edges {
        for &(sb, sbra) in &versions[e.source as usize] {
            let compatible = match e.kind {
                EdgeKind::Taken => sbra & TAKEN != 0,
                EdgeKind::NotTaken => sbra & NOT_TAKEN != 0,
                _ => true,
            };
            if !compatible {
                continue;
            }
            for &(tb, _) in &versions[e.sink as usize] {
                out.add_edge(sb, tb, e.kind);
            }
        }
    }

    out
}

/// One case of a split block: the instructions it executes and the
/// conditions it assumed along the way.
struct Case {
    conds: Vec<Condition>,
    insts: Vec<Arc<Inst>>,
    bra: u8,
}

impl Case {
    fn new() -> Case {
        Case { conds: Vec::new(), insts: Vec::new(), bra: BOTH }
    }

    fn fork(&self) -> Case {
        Case {
            conds: self.conds.clone(),
            insts: self.insts.clone(),
            bra: self.bra,
        }
    }

    /// The assumed condition on the same subject, or the empty condition.
    fn matches(&self, c: &Condition) -> Condition {
        self.conds
            .iter()
            .find(|cc| cc.same_subject(c))
            .copied()
            .unwrap_or(Condition { pred: crate::prog::Pred::empty(), ..*c })
    }

    fn add(&mut self, inst: Arc<Inst>, bra: u8) {
        let writes = inst.writes.clone();
        self.insts.push(inst);
        self.conds.retain(|c| !writes.contains(&c.reg));
        if bra != NONE {
            self.bra = bra;
        }
    }

    fn assume(&mut self, c: Condition) {
        match self.conds.iter_mut().find(|cc| cc.same_subject(&c)) {
            Some(slot) => *slot = c,
            None => self.conds.push(c),
        }
    }
}

/// Enumerate the feasible cases of one instruction sequence.
fn split(insts: &[Arc<Inst>]) -> Vec<Case> {
    let mut cases = vec![Case::new()];
    let last = insts.len() - 1;
    for (idx, inst) in insts.iter().enumerate() {
        let is_branch = idx == last && inst.is_control();
        let cond = inst.condition;
        match cond {
            None => {
                for case in &mut cases {
                    case.add(inst.clone(), NONE);
                }
            }
            Some(c) if c.is_any() => {
                // unanalyzable predicate: both outcomes, no assumption kept
                let l = cases.len();
                for k in 0..l {
                    let mut skipped = cases[k].fork();
                    skipped.add(Arc::new(Inst::nop_for(inst)), if is_branch { NOT_TAKEN } else { NONE });
                    cases[k].add(inst.clone(), if is_branch { TAKEN } else { NONE });
                    cases.push(skipped);
                }
            }
            Some(c) => {
                let l = cases.len();
                for k in 0..l {
                    let cc = cases[k].matches(&c);
                    if l == 1 && is_branch && cc.is_empty() {
                        // a lone conditional branch: the taken/not-taken
                        // split is already carried by the out edges
                        cases[k].add(inst.clone(), NONE);
                    } else if cc.is_empty() {
                        // first sight of this subject: split on it
                        let mut skipped = cases[k].fork();
                        skipped.assume(c.revert());
                        skipped.add(Arc::new(Inst::nop_for(inst)), if is_branch { NOT_TAKEN } else { NONE });
                        cases.push(skipped);
                        cases[k].assume(c);
                        cases[k].add(inst.clone(), if is_branch { TAKEN } else { NONE });
                    } else if cc.subset_of(&c) {
                        // the assumption implies the condition: executes
                        cases[k].add(inst.clone(), if is_branch { TAKEN } else { NONE });
                    } else if c.subset_of(&cc) {
                        // the condition narrows the assumption: split it
                        let mut skipped = cases[k].fork();
                        skipped.assume(cc.complement_of(&c));
                        skipped.add(Arc::new(Inst::nop_for(inst)), if is_branch { NOT_TAKEN } else { NONE });
                        cases.push(skipped);
                        cases[k].assume(c);
                        cases[k].add(inst.clone(), if is_branch { TAKEN } else { NONE });
                    } else if c.pred.intersection(cc.pred).is_empty() {
                        // contradiction: the instruction cannot execute here
                        cases[k].add(Arc::new(Inst::nop_for(inst)), if is_branch { NOT_TAKEN } else { NONE });
                    } else {
                        // overlapping, neither contains the other: split on
                        // the intersection
                        let both = Condition { pred: c.pred.intersection(cc.pred), ..c };
                        let mut skipped = cases[k].fork();
                        skipped.assume(cc.complement_of(&c));
                        skipped.add(Arc::new(Inst::nop_for(inst)), if is_branch { NOT_TAKEN } else { NONE });
                        cases.push(skipped);
                        cases[k].assume(both);
                        cases[k].add(inst.clone(), if is_branch { TAKEN } else { NONE });
                    }
                }
            }
        }
    }
    cases
}
