//! L-Blocks
//!
//! The portion of a basic block lying in exactly one cache block. Basic
//! blocks are partitioned into L-blocks per cache set; consecutive L-blocks
//! of one basic block that land in the same cache block are *linked* (they
//! share the cache fill, and later one miss variable).

use crate::cfg::{BlockId, CfgCollection, CfgId};
use crate::hard::CacheConfig;
use smallvec::SmallVec;
use std::collections::HashMap;

/// One L-block.
#[derive(Debug, Clone)]
pub struct LBlock {
    /// Owning cache set.
    pub set: u32,
    /// Dense id within the set.
    pub id: u32,
    pub cfg: CfgId,
    pub block: BlockId,
    /// Starting address.
    pub address: u32,
    /// Size in bytes.
    pub size: u32,
    /// Dense id of the cache block (set-local tag index) it occupies.
    pub cache_block: u32,
    /// First L-block of its basic block within this set.
    pub first: bool,
    /// Linked to the previous L-block of the same basic block (same cache
    /// block).
    pub linked_to_prev: bool,
    /// Category assigned by the classification pass.
    pub category: super::Category,
    /// Miss-count variable assigned by the ILP assembly; linked L-blocks
    /// share their leader's variable.
    pub miss_var: Option<crate::ilp::VarId>,
}

/// The L-blocks of one cache set.
pub struct LBlockSet {
    pub set: u32,
    pub lblocks: Vec<LBlock>,
    /// Number of distinct cache blocks tracked in this set.
    pub cache_block_count: u32,
    /// L-block indices per basic block, in address order.
    by_block: HashMap<(CfgId, BlockId), SmallVec<[u32; 2]>>,
}

impl LBlockSet {
    pub fn of_block(&self, cfg: CfgId, block: BlockId) -> &[u32] {
        self.by_block
            .get(&(cfg, block))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn count(&self) -> usize {
        self.lblocks.len()
    }

    /// Basic blocks owning L-blocks in this set, with their L-block index
    /// lists in address order.
    pub fn blocks(&self) -> impl Iterator<Item = (&(CfgId, BlockId), &SmallVec<[u32; 2]>)> {
        self.by_block.iter()
    }
}

/// Partition every basic block of the collection into per-set L-blocks.
pub fn partition(coll: &CfgCollection, cache: &CacheConfig) -> Vec<LBlockSet> {
    let mut sets: Vec<LBlockSet> = (0..cache.sets)
        .map(|s| LBlockSet {
            set: s,
            lblocks: Vec::new(),
            cache_block_count: 0,
            by_block: HashMap::new(),
        })
        .collect();
    let mut tags: Vec<HashMap<u32, u32>> = vec![HashMap::new(); cache.sets as usize];

    for (c, cfg) in coll.iter() {
        for block in cfg.basic_blocks() {
            let (lo, hi) = match (block.address(), block.top_address()) {
                (Some(lo), Some(hi)) if lo < hi => (lo, hi),
                _ => continue,
            };
            let mut addr = lo;
            while addr < hi {
                let next = (cache.round_down(addr)).wrapping_add(cache.block_size).min(hi);
                let s = cache.set_of(addr) as usize;
                let tag = cache.tag_of(addr);
                let next_id = tags[s].len() as u32;
                let cb = *tags[s].entry(tag).or_insert(next_id);
                let lbs = &mut sets[s];
                lbs.cache_block_count = lbs.cache_block_count.max(cb + 1);
                let prev = lbs
                    .by_block
                    .get(&(c, block.id))
                    .and_then(|l| l.last().copied());
                let linked = prev
                    .map(|p| lbs.lblocks[p as usize].cache_block == cb)
                    .unwrap_or(false);
                let id = lbs.lblocks.len() as u32;
                lbs.lblocks.push(LBlock {
                    set: s as u32,
                    id,
                    cfg: c,
                    block: block.id,
                    address: addr,
                    size: next - addr,
                    cache_block: cb,
                    first: prev.is_none(),
                    linked_to_prev: linked,
                    category: Default::default(),
                    miss_var: None,
                });
                lbs.by_block.entry((c, block.id)).or_default().push(id);
                addr = next;
            }
        }
    }
    log::debug!(
        "L-block partition: {} sets, {} l-blocks",
        sets.len(),
        sets.iter().map(|s| s.count()).sum::<usize>()
    );
    sets
}
