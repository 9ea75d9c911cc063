//! Data Cache Classification
//!
//! Data accesses carry an address kind: a single block, a contiguous range
//! (possibly wrapping modulo the address space), or any address. The MUST /
//! MAY / PERS domains of the instruction side apply per set, with
//! kind-specific transfers:
//!
//! - BLOCK: an ordinary access to the containing set;
//! - RANGE: the join of the block-accessed transfer over every cache block
//!   of the range falling into the set; a range spanning more blocks than
//!   the associativity ages the whole set;
//! - ANY: ages every entry of every set under MUST, refreshes everything
//!   under MAY.
//!
//! Write-through stores never allocate: a store only refreshes a line the
//! set may already hold.

use crate::cache::icache::MustPers;
use crate::cache::purge::Purge;
use crate::cache::{Acs, CacheBlock, Category, FirstMissLevel, ABSENT};
use crate::cfg::{Block, BlockId, CfgCollection, CfgId};
use crate::dfa::{Analysis, Domain, Solution};
use crate::hard::{CacheConfig, WritePolicy};
use crate::prog::{Inst, MemTarget};
use std::collections::HashMap;
use std::sync::Arc;

/// Target of one data-cache access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessTarget {
    /// Any address.
    Any,
    /// One registered cache block.
    Block { set: u32, index: u32 },
    /// A contiguous byte interval, wrapping when `first > last`.
    Range { first: u32, last: u32 },
}

/// One data-cache access of a basic block.
#[derive(Debug, Clone)]
pub struct BlockAccess {
    pub inst: Arc<Inst>,
    /// Store (true) or load (false).
    pub store: bool,
    pub target: AccessTarget,
    pub category: Category,
    pub purge: Purge,
    /// Worst-case write-back latency charged to the access.
    pub purge_time: u64,
    /// Miss-count variable assigned by the ILP assembly.
    pub miss_var: Option<crate::ilp::VarId>,
}

/// The cache blocks tracked for one set.
#[derive(Debug, Default, Clone)]
pub struct BlockCollection {
    pub set: u32,
    pub blocks: Vec<CacheBlock>,
    by_tag: HashMap<u32, u32>,
}

impl BlockCollection {
    pub fn count(&self) -> usize {
        self.blocks.len()
    }

    pub fn index_of(&self, tag: u32) -> Option<u32> {
        self.by_tag.get(&tag).copied()
    }

    fn register(&mut self, cache: &CacheConfig, address: u32) -> u32 {
        let tag = cache.tag_of(address);
        if let Some(i) = self.index_of(tag) {
            return i;
        }
        let i = self.blocks.len() as u32;
        self.blocks.push(CacheBlock {
            set: self.set,
            tag,
            address: cache.round_down(address),
        });
        self.by_tag.insert(tag, i);
        i
    }
}

/// Data-block information of the task: per-set collections plus the access
/// lists of every basic block.
#[derive(Default)]
pub struct DataBlocks {
    pub colls: Vec<BlockCollection>,
    pub accesses: HashMap<(CfgId, BlockId), Vec<BlockAccess>>,
}

impl DataBlocks {
    pub fn of_block(&self, cfg: CfgId, block: BlockId) -> &[BlockAccess] {
        self.accesses
            .get(&(cfg, block))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Cache blocks of the byte range `[first, last]` that fall into `set`,
/// or `None` when the range covers more blocks in the set than the
/// associativity (the whole set is aged instead).
pub fn range_in_set(cache: &CacheConfig, first: u32, last: u32, set: u32) -> Option<Vec<u32>> {
    let span = cache.block_span(first, last);
    let per_set = span_in_set(cache, span, first, set);
    if per_set == 0 {
        return Some(Vec::new());
    }
    if per_set > cache.assoc as u64 {
        return None;
    }
    let mut out = Vec::new();
    let mut addr = cache.round_down(first);
    for _ in 0..span {
        if cache.set_of(addr) == set {
            out.push(addr);
        }
        addr = addr.wrapping_add(cache.block_size);
    }
    Some(out)
}

/// Number of cache blocks of a `span`-line range starting at `first` that
/// map into `set`. Sets are visited round-robin by consecutive lines.
fn span_in_set(cache: &CacheConfig, span: u64, first: u32, set: u32) -> u64 {
    let sets = cache.sets as u64;
    let base = span / sets;
    let rem = span % sets;
    let start_set = cache.set_of(cache.round_down(first)) as u64;
    let offset = (set as u64 + sets - start_set) % sets;
    base + if offset < rem { 1 } else { 0 }
}

/// Does the range touch any set other than `set`?
fn range_touches_others(cache: &CacheConfig, first: u32, last: u32, set: u32) -> bool {
    let span = cache.block_span(first, last);
    span > span_in_set(cache, span, first, set)
}

/// Collect the data accesses of every basic block from the memory
/// micro-operations of its instructions and register the touched cache
/// blocks.
pub fn build_data_blocks(coll: &CfgCollection, cache: &CacheConfig) -> DataBlocks {
    let mut data = DataBlocks {
        colls: (0..cache.sets)
            .map(|s| BlockCollection { set: s, ..Default::default() })
            .collect(),
        accesses: HashMap::new(),
    };
    for (c, cfg) in coll.iter() {
        for block in cfg.basic_blocks() {
            let mut list = Vec::new();
            for inst in block.insts() {
                for (store, target) in inst.mem_ops() {
                    let target = match target {
                        MemTarget::Any => AccessTarget::Any,
                        MemTarget::Addr(a) => {
                            let set = cache.set_of(a);
                            let index = data.colls[set as usize].register(cache, a);
                            AccessTarget::Block { set, index }
                        }
                        MemTarget::Range(first, last) => {
                            // register what each set will track
                            for s in 0..cache.sets {
                                if let Some(addrs) = range_in_set(cache, first, last, s) {
                                    for a in addrs {
                                        data.colls[s as usize].register(cache, a);
                                    }
                                }
                            }
                            AccessTarget::Range { first, last }
                        }
                    };
                    list.push(BlockAccess {
                        inst: inst.clone(),
                        store,
                        target,
                        category: Category::NotClassified,
                        purge: Purge::Invalid,
                        purge_time: 0,
                        miss_var: None,
                    });
                }
            }
            if !list.is_empty() {
                data.accesses.insert((c, block.id), list);
            }
        }
    }
    log::debug!(
        "data blocks: {} accesses over {} tracked blocks",
        data.accesses.values().map(|v| v.len()).sum::<usize>(),
        data.colls.iter().map(|c| c.count()).sum::<usize>()
    );
    data
}

/// Shared transfer plumbing of the per-set data-cache domains.
#[derive(Clone, Copy)]
pub struct SetView<'a> {
    pub coll: &'a BlockCollection,
    pub cache: &'a CacheConfig,
    pub data: &'a DataBlocks,
}

impl<'a> SetView<'a> {
    fn set(&self) -> u32 {
        self.coll.set
    }

    /// Apply one access under MUST.
    pub(crate) fn apply_must(&self, out: &mut Acs, acc: &BlockAccess) {
        let write_through = self.cache.write == WritePolicy::WriteThrough;
        match acc.target {
            AccessTarget::Any => out.age_all(),
            AccessTarget::Block { set, index } => {
                if set != self.set() {
                    return;
                }
                let i = index as usize;
                if acc.store && write_through {
                    if out.contains(i) {
                        out.inject_must(i);
                    } else {
                        out.age_all();
                    }
                } else {
                    out.inject_must(i);
                }
            }
            AccessTarget::Range { first, last } => {
                match range_in_set(self.cache, first, last, self.set()) {
                    None => out.age_all(),
                    Some(addrs) if addrs.is_empty() => {}
                    Some(addrs) => {
                        let keep_original =
                            range_touches_others(self.cache, first, last, self.set());
                        let mut acc_state: Option<Acs> =
                            if keep_original { Some(out.clone()) } else { None };
                        for a in addrs {
                            let i = self
                                .coll
                                .index_of(self.cache.tag_of(a))
                                .expect("range block registered") as usize;
                            let mut t = out.clone();
                            if acc.store && write_through {
                                if t.contains(i) {
                                    t.inject_must(i);
                                } else {
                                    t.age_all();
                                }
                            } else {
                                t.inject_must(i);
                            }
                            match &mut acc_state {
                                Some(s) => s.join_must(&t),
                                None => acc_state = Some(t),
                            }
                        }
                        *out = acc_state.expect("at least one range block");
                    }
                }
            }
        }
    }

    /// Apply one access under MAY.
    pub(crate) fn apply_may(&self, out: &mut Acs, acc: &BlockAccess) {
        let write_through = self.cache.write == WritePolicy::WriteThrough;
        match acc.target {
            AccessTarget::Any => {
                if acc.store && write_through {
                    // refresh without allocating
                    for a in &mut out.age {
                        if *a != ABSENT {
                            *a = 0;
                        }
                    }
                } else {
                    out.refresh_all();
                }
            }
            AccessTarget::Block { set, index } => {
                if set != self.set() {
                    return;
                }
                let i = index as usize;
                if acc.store && write_through {
                    if out.contains(i) {
                        out.age[i] = 0;
                    }
                } else {
                    out.inject_may(i);
                }
            }
            AccessTarget::Range { first, last } => {
                let addrs = match range_in_set(self.cache, first, last, self.set()) {
                    None => {
                        // too wide for precise tracking: anything may be
                        // refreshed
                        out.refresh_all();
                        return;
                    }
                    Some(a) => a,
                };
                for a in addrs {
                    let i = self
                        .coll
                        .index_of(self.cache.tag_of(a))
                        .expect("range block registered") as usize;
                    let mut t = out.clone();
                    if acc.store && write_through {
                        if t.contains(i) {
                            t.age[i] = 0;
                        }
                    } else {
                        t.inject_may(i);
                    }
                    out.join_may(&t);
                }
            }
        }
    }

    /// Apply one access under combined MUST/PERS. A write-through store
    /// never allocates, so it never establishes persistence either.
    pub(crate) fn apply_must_pers(&self, out: &mut MustPers, acc: &BlockAccess) {
        let wt_store = acc.store && self.cache.write == WritePolicy::WriteThrough;
        match acc.target {
            AccessTarget::Block { set, index } if set == self.set() && !wt_store => {
                let i = index as usize;
                let in_must = out.must.contains(i);
                for item in &mut out.pers {
                    item.pers_inject(i, in_must);
                }
            }
            AccessTarget::Block { .. } => {}
            AccessTarget::Any => {
                for item in &mut out.pers {
                    pers_age_all(item);
                }
            }
            AccessTarget::Range { .. } if wt_store => {}
            AccessTarget::Range { first, last } => {
                match range_in_set(self.cache, first, last, self.set()) {
                    None => {
                        for item in &mut out.pers {
                            pers_age_all(item);
                        }
                    }
                    Some(addrs) => {
                        let mut joined: Option<Vec<Acs>> = None;
                        for a in &addrs {
                            let i = self
                                .coll
                                .index_of(self.cache.tag_of(*a))
                                .expect("range block registered")
                                as usize;
                            let mut t = out.pers.clone();
                            let in_must = out.must.contains(i);
                            for item in &mut t {
                                item.pers_inject(i, in_must);
                            }
                            match &mut joined {
                                Some(j) => MustPers::join_pers(j, &t),
                                None => joined = Some(t),
                            }
                        }
                        if let Some(mut j) = joined {
                            if range_touches_others(self.cache, first, last, self.set()) {
                                MustPers::join_pers(&mut j, &out.pers);
                            }
                            out.pers = j;
                        }
                    }
                }
            }
        }
        // the MUST half follows its own transfer
        self.apply_must(&mut out.must, acc);
    }
}

fn pers_age_all(item: &mut Acs) {
    for j in 0..item.age.len() {
        if item.age[j] != ABSENT && item.age[j] != item.assoc {
            item.age[j] += 1;
        }
    }
}

/// MUST domain of one data-cache set.
pub struct DcacheMust<'a>(pub SetView<'a>);

impl<'a> Domain for DcacheMust<'a> {
    type Value = Acs;

    fn bottom(&self) -> Acs {
        Acs::new(self.0.coll.count(), self.0.cache.assoc, 0)
    }
    fn entry(&self) -> Acs {
        Acs::new(self.0.coll.count(), self.0.cache.assoc, ABSENT)
    }
    fn join(&self, a: &mut Acs, b: &Acs) {
        a.join_must(b);
    }
    fn equals(&self, a: &Acs, b: &Acs) -> bool {
        a == b
    }
    fn update(&mut self, out: &mut Acs, input: &Acs, cfg: CfgId, block: &Block) {
        *out = input.clone();
        for acc in self.0.data.of_block(cfg, block.id) {
            self.0.apply_must(out, acc);
        }
    }
    fn clobber(&self, v: &mut Acs) {
        v.age.fill(ABSENT);
    }
}

/// MAY domain of one data-cache set.
pub struct DcacheMay<'a>(pub SetView<'a>);

impl<'a> Domain for DcacheMay<'a> {
    type Value = Acs;

    fn bottom(&self) -> Acs {
        Acs::new(self.0.coll.count(), self.0.cache.assoc, ABSENT)
    }
    fn entry(&self) -> Acs {
        Acs::new(self.0.coll.count(), self.0.cache.assoc, 0)
    }
    fn join(&self, a: &mut Acs, b: &Acs) {
        a.join_may(b);
    }
    fn equals(&self, a: &Acs, b: &Acs) -> bool {
        a == b
    }
    fn update(&mut self, out: &mut Acs, input: &Acs, cfg: CfgId, block: &Block) {
        *out = input.clone();
        for acc in self.0.data.of_block(cfg, block.id) {
            self.0.apply_may(out, acc);
        }
    }
    fn clobber(&self, v: &mut Acs) {
        v.refresh_all();
    }
}

/// Combined MUST/PERS domain of one data-cache set.
pub struct DcacheMustPers<'a>(pub SetView<'a>);

impl<'a> Domain for DcacheMustPers<'a> {
    type Value = MustPers;

    fn bottom(&self) -> MustPers {
        MustPers {
            must: Acs::new(self.0.coll.count(), self.0.cache.assoc, 0),
            pers: Vec::new(),
        }
    }
    fn entry(&self) -> MustPers {
        MustPers {
            must: Acs::new(self.0.coll.count(), self.0.cache.assoc, ABSENT),
            pers: Vec::new(),
        }
    }
    fn join(&self, a: &mut MustPers, b: &MustPers) {
        a.must.join_must(&b.must);
        MustPers::join_pers(&mut a.pers, &b.pers);
    }
    fn equals(&self, a: &MustPers, b: &MustPers) -> bool {
        a == b
    }
    fn update(&mut self, out: &mut MustPers, input: &MustPers, cfg: CfgId, block: &Block) {
        *out = input.clone();
        for acc in self.0.data.of_block(cfg, block.id) {
            self.0.apply_must_pers(out, acc);
        }
    }
    fn enter_loop(&self, v: &mut MustPers) {
        v.pers.push(Acs::new(self.0.coll.count(), self.0.cache.assoc, ABSENT));
    }
    fn leave_loop(&self, v: &mut MustPers) {
        if let Some(top) = v.pers.pop() {
            if let Some(new_top) = v.pers.last_mut() {
                new_top.pers_join(&top);
            }
        }
    }
    fn clobber(&self, v: &mut MustPers) {
        v.must.age.fill(ABSENT);
        for item in &mut v.pers {
            for i in 0..item.age.len() {
                item.pers_damage(i, item.assoc);
            }
        }
    }
}

/// Classification options of the data side.
#[derive(Debug, Clone)]
pub struct DcacheOptions {
    pub level: FirstMissLevel,
    pub pseudo_unroll: bool,
    pub with_may: bool,
}

impl Default for DcacheOptions {
    fn default() -> Self {
        DcacheOptions {
            level: FirstMissLevel::Multi,
            pseudo_unroll: true,
            with_may: false,
        }
    }
}

/// Classify every data access in place and return the per-category counts.
pub fn classify(
    analysis: &Analysis,
    data: &mut DataBlocks,
    cache: &CacheConfig,
    opts: &DcacheOptions,
) -> crate::cache::icache::CategoryStats {
    let mut stats = crate::cache::icache::CategoryStats::default();

    // solve every set up front; accesses are classified at their program
    // point by replaying the block-local state
    for s in 0..cache.sets as usize {
        if data.colls[s].count() == 0 {
            continue;
        }
        log::debug!("classifying dcache set {}", s);
        let view = SetView { coll: &data.colls[s], cache, data };
        let mp_sol: Solution<MustPers> = {
            let mut dom = DcacheMustPers(view);
            analysis.solve(&mut dom, None)
        };
        let may_sol: Option<Solution<Acs>> = if opts.with_may {
            let mut dom = DcacheMay(view);
            Some(analysis.solve(&mut dom, None))
        } else {
            None
        };

        let keys: Vec<(CfgId, BlockId)> = data.accesses.keys().copied().collect();
        for (c, b) in keys {
            let mut mp = mp_sol.ins[c as usize][b as usize].clone();
            let mut may = may_sol.as_ref().map(|s| s.ins[c as usize][b as usize].clone());
            let list = data.accesses.get(&(c, b)).unwrap().clone();
            let mut cats: Vec<(usize, Category)> = Vec::new();
            for (i, acc) in list.iter().enumerate() {
                if let AccessTarget::Block { set, index } = acc.target {
                    if set as usize == s {
                        let cat = crate::cache::icache::classify_access(
                            analysis,
                            c,
                            b,
                            index as usize,
                            &mp,
                            may.as_ref(),
                            opts.level,
                        );
                        cats.push((i, cat));
                    }
                }
                let view = SetView { coll: &data.colls[s], cache, data };
                view.apply_must_pers(&mut mp, acc);
                if let Some(m) = may.as_mut() {
                    view.apply_may(m, acc);
                }
            }
            if let Some(accs) = data.accesses.get_mut(&(c, b)) {
                for (i, cat) in cats {
                    accs[i].category = cat;
                }
            }
        }
    }

    for accs in data.accesses.values() {
        for acc in accs {
            stats.add(acc.category);
        }
    }
    stats.log_summary("dcache categories");
    stats
}
