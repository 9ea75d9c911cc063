//! Branch Prediction Classification
//!
//! Maps every conditional control instruction to a BHT row and assigns a
//! prediction category consumed by the IPET branch constraints:
//!
//! - a direct conditional branch alone in its BHT row always finds its own
//!   counter (always-hit rules);
//! - a branch whose row is shared only with branches *outside* its
//!   enclosing loop loses the counter between loop entries but keeps it
//!   across iterations: first-unknown at the outermost loop the row is
//!   private to;
//! - a row contested inside the loop, or an unknown target, gives no
//!   guarantee (not-classified);
//! - a predictor without dynamic state (zero rows) predicts the static
//!   default (always-default rules).

use crate::cfg::loops::LoopForest;
use crate::cfg::{BlockId, CfgCollection, CfgId};
use crate::hard::Bht;
use crate::prop::PropId;
use std::collections::HashMap;

/// Prediction category of a conditional block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCategory {
    /// The branch is always predicted by the static default direction.
    AlwaysDefault,
    /// The branch always finds its own predictor entry.
    AlwaysHit,
    /// Unknown at each entry of the loop headed by the given block,
    /// predicted afterwards.
    FirstUnknown(BlockId),
    NotClassified,
}

/// Category annotation on conditional blocks.
pub fn branch_category() -> PropId<BranchCategory> {
    PropId::of("timebound::branch_category")
}

/// Classify every conditional block of the collection against the BHT.
/// `forests` holds the loop information of every CFG, in collection order.
pub fn classify(coll: &mut CfgCollection, forests: &[LoopForest], bht: &Bht) {
    // conditional branch sites per row, across the whole task; clones of
    // one instruction share its address and train the same counter
    let mut by_row: HashMap<u32, Vec<(CfgId, BlockId, u32)>> = HashMap::new();
    if bht.rows > 0 {
        for (c, cfg) in coll.iter() {
            for block in cfg.basic_blocks() {
                if let Some(ctrl) = block.control() {
                    if ctrl.is_cond() && ctrl.target.is_some() {
                        by_row
                            .entry(bht.row_of(ctrl.address))
                            .or_default()
                            .push((c, block.id, ctrl.address));
                    }
                }
            }
        }
    }

    let mut stats: HashMap<&'static str, usize> = HashMap::new();
    for c in 0..coll.count() {
        let forest = &forests[c as usize];
        let cfg = coll.get_mut(c);
        for b in 0..cfg.blocks.len() {
            let cat = {
                let block = &cfg.blocks[b];
                if !block.is_basic() {
                    continue;
                }
                let ctrl = match block.control() {
                    Some(i) if i.is_cond() => i,
                    _ => continue,
                };
                if ctrl.target.is_none() {
                    BranchCategory::NotClassified
                } else if bht.rows == 0 {
                    BranchCategory::AlwaysDefault
                } else {
                    let row = &by_row[&bht.row_of(ctrl.address)];
                    let competitors: Vec<&(CfgId, BlockId, u32)> =
                        row.iter().filter(|(_, _, a)| *a != ctrl.address).collect();
                    if competitors.is_empty() {
                        BranchCategory::AlwaysHit
                    } else {
                        match private_loop(forest, c, b as BlockId, &competitors) {
                            Some(h) => BranchCategory::FirstUnknown(h),
                            None => BranchCategory::NotClassified,
                        }
                    }
                }
            };
            let key = match cat {
                BranchCategory::AlwaysDefault => "always-default",
                BranchCategory::AlwaysHit => "always-hit",
                BranchCategory::FirstUnknown(_) => "first-unknown",
                BranchCategory::NotClassified => "not-classified",
            };
            *stats.entry(key).or_default() += 1;
            cfg.blocks[b].props.set(branch_category(), cat);
        }
    }
    for (k, n) in stats {
        log::debug!("branch prediction: {} {} block(s)", n, k);
    }
}

/// Outermost enclosing loop of `b` whose body holds none of the competing
/// branches: inside it the row is rewritten at most once per entry, so the
/// branch is predicted from its second occurrence on.
fn private_loop(
    forest: &LoopForest,
    c: CfgId,
    b: BlockId,
    competitors: &[&(CfgId, BlockId, u32)],
) -> Option<BlockId> {
    let mut best = None;
    let mut header = forest.innermost_containing(b);
    while let Some(h) = header {
        let body = &forest.of(h)?.body;
        let private = competitors
            .iter()
            .all(|&&(cc, cb, _)| cc == c && !body[cb as usize]);
        if !private {
            break;
        }
        best = Some(h);
        header = forest.enclosing[h as usize];
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::dominance::DomInfo;
    use crate::cfg::{Cfg, EdgeKind, ENTRY, EXIT};
    use crate::hard::DefaultPrediction;
    use crate::prog::{Inst, InstKind};
    use smallvec::SmallVec;
    use std::sync::Arc;

    fn cond_branch(address: u32, target: Option<u32>) -> Arc<Inst> {
        Arc::new(Inst {
            address,
            size: 4,
            kind: if target.is_some() {
                InstKind::CONTROL | InstKind::COND
            } else {
                InstKind::CONTROL | InstKind::COND | InstKind::INDIRECT
            },
            target,
            reads: SmallVec::new(),
            writes: SmallVec::new(),
            condition: None,
            uops: SmallVec::new(),
        })
    }

    fn bht(rows: u32) -> Bht {
        Bht {
            rows,
            cond_penalty: 3,
            indirect_penalty: 5,
            cond_indirect_penalty: 6,
            default_prediction: DefaultPrediction::NotTaken,
        }
    }

    fn classify_all(coll: &mut CfgCollection, bht: &Bht) {
        let doms: Vec<DomInfo> = coll.iter().map(|(_, c)| DomInfo::compute(c)).collect();
        let forests: Vec<LoopForest> = coll
            .iter()
            .zip(doms.iter())
            .map(|((_, c), d)| LoopForest::build(c, d))
            .collect();
        classify(coll, &forests, bht);
    }

    fn one_branch_cfg(insts: Vec<Arc<Inst>>) -> (CfgCollection, u32) {
        let mut cfg = Cfg::new("t", 0);
        let mut prev = None;
        let mut first = None;
        for i in insts {
            let b = cfg.add_basic(vec![i]);
            if let Some(p) = prev {
                cfg.add_edge(p, b, EdgeKind::NotTaken);
            } else {
                cfg.add_edge(ENTRY, b, EdgeKind::Virtual);
                first = Some(b);
            }
            prev = Some(b);
        }
        cfg.add_edge(prev.unwrap(), EXIT, EdgeKind::NotTaken);
        (CfgCollection { cfgs: vec![cfg] }, first.unwrap())
    }

    #[test]
    fn test_alone_in_row_is_always_hit() {
        let (mut coll, b) = one_branch_cfg(vec![cond_branch(0x100, Some(0x80))]);
        classify_all(&mut coll, &bht(16));
        assert_eq!(
            coll.get(0).block(b).props.get(branch_category()),
            Some(&BranchCategory::AlwaysHit)
        );
    }

    #[test]
    fn test_aliased_rows_not_classified() {
        // rows = 1: every branch lands in the same row; neither sits in a
        // loop, so nothing shields the counter
        let (mut coll, b) = one_branch_cfg(vec![
            cond_branch(0x100, Some(0x80)),
            cond_branch(0x104, Some(0x90)),
        ]);
        classify_all(&mut coll, &bht(1));
        assert_eq!(
            coll.get(0).block(b).props.get(branch_category()),
            Some(&BranchCategory::NotClassified)
        );
    }

    #[test]
    fn test_aliased_from_outside_loop_is_first_unknown() {
        // loop branch at 0x100, aliased only by a branch after the loop:
        // the row is lost across entries but kept across iterations
        let mut cfg = Cfg::new("t", 0);
        let h = cfg.add_basic(vec![cond_branch(0x100, Some(0x100))]);
        let after = cfg.add_basic(vec![cond_branch(0x104, Some(0x90))]);
        cfg.add_edge(ENTRY, h, EdgeKind::Virtual);
        cfg.add_edge(h, h, EdgeKind::Taken);
        cfg.add_edge(h, after, EdgeKind::NotTaken);
        cfg.add_edge(after, EXIT, EdgeKind::NotTaken);
        let mut coll = CfgCollection { cfgs: vec![cfg] };

        classify_all(&mut coll, &bht(1));
        assert_eq!(
            coll.get(0).block(h).props.get(branch_category()),
            Some(&BranchCategory::FirstUnknown(h))
        );
        // the branch outside the loop stays unclassified
        assert_eq!(
            coll.get(0).block(after).props.get(branch_category()),
            Some(&BranchCategory::NotClassified)
        );
    }

    #[test]
    fn test_aliased_inside_loop_not_classified() {
        // two branches of the same row inside one loop contest the counter
        // every iteration
        let mut cfg = Cfg::new("t", 0);
        let h = cfg.add_basic(vec![cond_branch(0x100, Some(0x108))]);
        let b2 = cfg.add_basic(vec![cond_branch(0x104, Some(0x100))]);
        cfg.add_edge(ENTRY, h, EdgeKind::Virtual);
        cfg.add_edge(h, b2, EdgeKind::NotTaken);
        cfg.add_edge(b2, h, EdgeKind::Taken);
        cfg.add_edge(b2, EXIT, EdgeKind::NotTaken);
        cfg.add_edge(h, EXIT, EdgeKind::Taken);
        let mut coll = CfgCollection { cfgs: vec![cfg] };

        classify_all(&mut coll, &bht(1));
        assert_eq!(
            coll.get(0).block(h).props.get(branch_category()),
            Some(&BranchCategory::NotClassified)
        );
        assert_eq!(
            coll.get(0).block(b2).props.get(branch_category()),
            Some(&BranchCategory::NotClassified)
        );
    }

    #[test]
    fn test_nested_privacy_picks_outermost_private_loop() {
        // inner loop h2 inside outer loop h1; the competing branch sits in
        // the outer body, so only the inner loop shields the row
        let mut cfg = Cfg::new("t", 0);
        let h1 = cfg.add_basic(vec![cond_branch(0x100, Some(0x110))]);
        let h2 = cfg.add_basic(vec![cond_branch(0x104, Some(0x104))]);
        cfg.add_edge(ENTRY, h1, EdgeKind::Virtual);
        cfg.add_edge(h1, h2, EdgeKind::NotTaken);
        cfg.add_edge(h2, h2, EdgeKind::Taken);
        cfg.add_edge(h2, h1, EdgeKind::NotTaken);
        cfg.add_edge(h1, EXIT, EdgeKind::Taken);
        let mut coll = CfgCollection { cfgs: vec![cfg] };

        classify_all(&mut coll, &bht(1));
        // h2's competitor h1 lies outside the inner body but inside the
        // outer one: first-unknown at the inner header only
        assert_eq!(
            coll.get(0).block(h2).props.get(branch_category()),
            Some(&BranchCategory::FirstUnknown(h2))
        );
        // h1 is contested within its own loop by h2
        assert_eq!(
            coll.get(0).block(h1).props.get(branch_category()),
            Some(&BranchCategory::NotClassified)
        );
    }

    #[test]
    fn test_static_predictor_is_always_default() {
        let (mut coll, b) = one_branch_cfg(vec![cond_branch(0x100, Some(0x80))]);
        classify_all(&mut coll, &bht(0));
        assert_eq!(
            coll.get(0).block(b).props.get(branch_category()),
            Some(&BranchCategory::AlwaysDefault)
        );
    }

    #[test]
    fn test_indirect_not_classified() {
        let (mut coll, b) = one_branch_cfg(vec![cond_branch(0x100, None)]);
        classify_all(&mut coll, &bht(16));
        assert_eq!(
            coll.get(0).block(b).props.get(branch_category()),
            Some(&BranchCategory::NotClassified)
        );
    }
}
