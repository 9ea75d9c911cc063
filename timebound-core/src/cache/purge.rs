//! Purge Analysis
//!
//! For write-back data caches, tracks the dirtiness of every cache block
//! under MUST and MAY and classifies whether an eviction caused by an
//! access triggers a write-back, attaching the worst-case write-back
//! latency. Write-through caches never purge.

use crate::cache::dcache::{AccessTarget, BlockAccess, DataBlocks, DcacheMay, DcacheMust, SetView};
use crate::cache::{Acs, Category};
use crate::cfg::{Block, BlockId, CfgId};
use crate::dfa::{Analysis, Domain};
use crate::hard::{CacheConfig, HardwareConfig, WritePolicy};
use bitvec::prelude::*;

/// Write-back classification of one access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Purge {
    #[default]
    Invalid,
    /// No write-back can happen.
    No,
    /// A write-back happens at most once per enclosing-loop entry.
    Pers,
    /// A write-back may happen.
    May,
    /// A write-back happens whenever the access misses.
    Must,
}

impl Purge {
    pub fn code(&self) -> &'static str {
        match self {
            Purge::Invalid => "inv",
            Purge::No => "no",
            Purge::Pers => "pers",
            Purge::May => "may",
            Purge::Must => "must",
        }
    }
}

/// Dirtiness of the blocks of one set: guaranteed-dirty and possibly-dirty
/// bit sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyState {
    pub must: BitVec,
    pub may: BitVec,
}

/// Dirtiness domain of one data-cache set.
pub struct Dirtiness<'a>(pub SetView<'a>);

impl<'a> Dirtiness<'a> {
    fn size(&self) -> usize {
        self.0.coll.count()
    }

    fn apply(&self, out: &mut DirtyState, acc: &BlockAccess) {
        let cache = self.0.cache;
        let set = self.0.coll.set;
        match acc.target {
            AccessTarget::Any => {
                if acc.store {
                    out.may.fill(true);
                } else {
                    out.must.fill(false);
                }
            }
            AccessTarget::Block { set: s, index } if s == set => {
                let i = index as usize;
                if acc.store {
                    out.must.set(i, true);
                    out.may.set(i, true);
                } else {
                    // a missing load refetches the block clean
                    out.must.set(i, false);
                }
            }
            AccessTarget::Block { .. } => {}
            AccessTarget::Range { first, last } => {
                let addrs = crate::cache::dcache::range_in_set(cache, first, last, set);
                match addrs {
                    Some(addrs) => {
                        for a in addrs {
                            if let Some(i) = self.0.coll.index_of(cache.tag_of(a)) {
                                if acc.store {
                                    out.may.set(i as usize, true);
                                } else {
                                    out.must.set(i as usize, false);
                                }
                            }
                        }
                    }
                    None => {
                        if acc.store {
                            out.may.fill(true);
                        } else {
                            out.must.fill(false);
                        }
                    }
                }
            }
        }
    }
}

impl<'a> Domain for Dirtiness<'a> {
    type Value = DirtyState;

    fn bottom(&self) -> DirtyState {
        DirtyState {
            must: bitvec![1; self.size()],
            may: bitvec![0; self.size()],
        }
    }
    fn entry(&self) -> DirtyState {
        DirtyState {
            must: bitvec![0; self.size()],
            may: bitvec![0; self.size()],
        }
    }
    fn join(&self, a: &mut DirtyState, b: &DirtyState) {
        for (mut x, y) in a.must.iter_mut().zip(b.must.iter()) {
            *x = *x && *y;
        }
        for (mut x, y) in a.may.iter_mut().zip(b.may.iter()) {
            *x = *x || *y;
        }
    }
    fn equals(&self, a: &DirtyState, b: &DirtyState) -> bool {
        a == b
    }
    fn update(&mut self, out: &mut DirtyState, input: &DirtyState, cfg: CfgId, block: &Block) {
        *out = input.clone();
        for acc in self.0.data.of_block(cfg, block.id) {
            self.apply(out, acc);
        }
    }
    fn clobber(&self, v: &mut DirtyState) {
        v.must.fill(false);
        v.may.fill(true);
    }
}

/// Classify the write-back behavior of every access of a write-back data
/// cache. Requires the category pass to have run.
pub fn analyze(
    analysis: &Analysis,
    data: &mut DataBlocks,
    cache: &CacheConfig,
    hw: &HardwareConfig,
) {
    if cache.write != WritePolicy::WriteBack {
        return;
    }
    for s in 0..cache.sets as usize {
        if data.colls[s].count() == 0 {
            continue;
        }
        log::debug!("purge analysis on set {}", s);
        let view = SetView { coll: &data.colls[s], cache, data };
        let dirty_sol = analysis.solve(&mut Dirtiness(view), None);
        let must_sol = analysis.solve(&mut DcacheMust(view), None);
        let may_sol = analysis.solve(&mut DcacheMay(view), None);

        let keys: Vec<(CfgId, BlockId)> = data.accesses.keys().copied().collect();
        for (c, b) in keys {
            let mut dirty = dirty_sol.ins[c as usize][b as usize].clone();
            let mut must = must_sol.ins[c as usize][b as usize].clone();
            let mut may = may_sol.ins[c as usize][b as usize].clone();
            let list = data.accesses.get(&(c, b)).unwrap().clone();
            let mut updates: Vec<(usize, Purge, u64)> = Vec::new();
            for (i, acc) in list.iter().enumerate() {
                if touches(&acc.target, cache, s as u32) {
                    let (purge, time) =
                        classify_access(acc, &data.colls[s], cache, hw, &dirty, &must, &may);
                    updates.push((i, purge, time));
                }
                let view = SetView { coll: &data.colls[s], cache, data };
                Dirtiness(view).apply(&mut dirty, acc);
                view.apply_must(&mut must, acc);
                view.apply_may(&mut may, acc);
            }
            if let Some(accs) = data.accesses.get_mut(&(c, b)) {
                for (i, purge, time) in updates {
                    if purge >= accs[i].purge {
                        accs[i].purge = purge;
                        accs[i].purge_time = accs[i].purge_time.max(time);
                    }
                }
            }
        }
    }
}

fn touches(target: &AccessTarget, cache: &CacheConfig, set: u32) -> bool {
    match *target {
        AccessTarget::Any => true,
        AccessTarget::Block { set: s, .. } => s == set,
        AccessTarget::Range { first, last } => {
            crate::cache::dcache::range_in_set(cache, first, last, set)
                .map(|v| !v.is_empty())
                .unwrap_or(true)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn classify_access(
    acc: &BlockAccess,
    coll: &crate::cache::dcache::BlockCollection,
    cache: &CacheConfig,
    hw: &HardwareConfig,
    dirty: &DirtyState,
    must: &Acs,
    may: &Acs,
) -> (Purge, u64) {
    let may_p = may_purge(acc, coll, cache, hw, dirty, may);
    let must_p = must_purge(acc, coll, cache, hw, dirty, must);
    match acc.category {
        Category::AlwaysHit => (Purge::No, 0),
        Category::FirstMiss(_) => match may_p {
            Some(t) => (Purge::Pers, t),
            None => (Purge::No, 0),
        },
        Category::AlwaysMiss => match (must_p, may_p) {
            (Some(t), _) => (Purge::Must, t),
            (None, Some(t)) => (Purge::May, t),
            (None, None) => (Purge::No, 0),
        },
        Category::NotClassified | Category::FirstHit => match may_p {
            Some(t) => (Purge::May, t),
            None => (Purge::No, 0),
        },
    }
}

/// A dirty block may sit in the eviction slot: worst-case write-back time,
/// or `None` when no eviction can write back.
fn may_purge(
    acc: &BlockAccess,
    coll: &crate::cache::dcache::BlockCollection,
    cache: &CacheConfig,
    hw: &HardwareConfig,
    dirty: &DirtyState,
    may: &Acs,
) -> Option<u64> {
    let mut time = None;
    for (i, block) in coll.blocks.iter().enumerate() {
        if is_target(acc, i as u32) {
            continue;
        }
        if may.age[i] == cache.assoc as i32 - 1 && dirty.may[i] {
            let t = hw.write_latency(block.address).max(1);
            time = Some(time.map_or(t, |x: u64| x.max(t)));
        }
    }
    time
}

fn must_purge(
    acc: &BlockAccess,
    coll: &crate::cache::dcache::BlockCollection,
    cache: &CacheConfig,
    hw: &HardwareConfig,
    dirty: &DirtyState,
    must: &Acs,
) -> Option<u64> {
    let mut time = None;
    for (i, block) in coll.blocks.iter().enumerate() {
        if is_target(acc, i as u32) {
            continue;
        }
        if must.age[i] == cache.assoc as i32 - 1 && dirty.must[i] {
            let t = hw.write_latency(block.address).max(1);
            time = Some(time.map_or(t, |x: u64| x.max(t)));
        }
    }
    time
}

fn is_target(acc: &BlockAccess, index: u32) -> bool {
    matches!(acc.target, AccessTarget::Block { index: i, .. } if i == index)
}
