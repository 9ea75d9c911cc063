//! Instruction Cache Classification
//!
//! MUST / MAY / PERS abstract domains over the fetch L-blocks of one cache
//! set, and the per-L-block category assignment:
//!
//! - present in MUST with a finite age: always-hit;
//! - absent from MAY: always-miss;
//! - otherwise the persistence stack is walked from the innermost level
//!   outwards in lockstep with the enclosing loop headers; the outermost
//!   level at which the block stays persistent yields first-miss at that
//!   level's header;
//! - anything else stays not-classified.
//!
//! The second and following L-blocks of a basic block are always-miss,
//! except when linked to their predecessor (same cache block): those share
//! the fill and are always-hit.

use crate::cache::lblock::LBlockSet;
use crate::cache::{Acs, Category, FirstMissLevel, ABSENT};
use crate::cfg::{Block, CfgId};
use crate::dfa::{Analysis, Domain, Solution};
use crate::hard::CacheConfig;
use crate::prop::PropId;
use std::rc::Rc;

/// Per-block MUST abstract cache states of the instruction cache, one entry
/// per set, attached after the fix-point when requested.
pub fn icache_acs_must() -> PropId<Rc<Vec<(u32, Acs)>>> {
    PropId::of("timebound::icache_acs_must")
}

/// MUST domain of one instruction-cache set.
pub struct IcacheMust<'a> {
    pub set: &'a LBlockSet,
    pub assoc: u32,
}

impl<'a> Domain for IcacheMust<'a> {
    type Value = Acs;

    fn bottom(&self) -> Acs {
        Acs::new(self.set.cache_block_count as usize, self.assoc, 0)
    }
    fn entry(&self) -> Acs {
        Acs::new(self.set.cache_block_count as usize, self.assoc, ABSENT)
    }
    fn join(&self, a: &mut Acs, b: &Acs) {
        a.join_must(b);
    }
    fn equals(&self, a: &Acs, b: &Acs) -> bool {
        a == b
    }
    fn update(&mut self, out: &mut Acs, input: &Acs, cfg: CfgId, block: &Block) {
        *out = input.clone();
        for &lbi in self.set.of_block(cfg, block.id) {
            let cb = self.set.lblocks[lbi as usize].cache_block as usize;
            out.inject_must(cb);
        }
    }
    fn clobber(&self, v: &mut Acs) {
        // unknown code may have evicted anything
        v.age.fill(ABSENT);
    }
}

/// MAY domain of one instruction-cache set.
pub struct IcacheMay<'a> {
    pub set: &'a LBlockSet,
    pub assoc: u32,
}

impl<'a> Domain for IcacheMay<'a> {
    type Value = Acs;

    fn bottom(&self) -> Acs {
        Acs::new(self.set.cache_block_count as usize, self.assoc, ABSENT)
    }
    fn entry(&self) -> Acs {
        Acs::new(self.set.cache_block_count as usize, self.assoc, 0)
    }
    fn join(&self, a: &mut Acs, b: &Acs) {
        a.join_may(b);
    }
    fn equals(&self, a: &Acs, b: &Acs) -> bool {
        a == b
    }
    fn update(&mut self, out: &mut Acs, input: &Acs, cfg: CfgId, block: &Block) {
        *out = input.clone();
        for &lbi in self.set.of_block(cfg, block.id) {
            let cb = self.set.lblocks[lbi as usize].cache_block as usize;
            out.inject_may(cb);
        }
    }
    fn clobber(&self, v: &mut Acs) {
        // unknown code may have loaded anything
        v.refresh_all();
    }
}

/// Combined MUST and per-loop-level persistence state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MustPers {
    pub must: Acs,
    /// One item per loop level, outermost first.
    pub pers: Vec<Acs>,
}

impl MustPers {
    /// Join of the persistence stacks; an empty stack is bottom.
    pub fn join_pers(a: &mut Vec<Acs>, b: &[Acs]) {
        if a.is_empty() {
            a.extend(b.iter().cloned());
            return;
        }
        if b.is_empty() {
            return;
        }
        let n = a.len().min(b.len());
        a.truncate(n);
        for (x, y) in a.iter_mut().zip(b.iter()) {
            x.pers_join(y);
        }
    }
}

/// Combined MUST/PERS domain of one instruction-cache set.
pub struct IcacheMustPers<'a> {
    pub set: &'a LBlockSet,
    pub assoc: u32,
}

impl<'a> IcacheMustPers<'a> {
    fn size(&self) -> usize {
        self.set.cache_block_count as usize
    }
}

impl<'a> Domain for IcacheMustPers<'a> {
    type Value = MustPers;

    fn bottom(&self) -> MustPers {
        MustPers { must: Acs::new(self.size(), self.assoc, 0), pers: Vec::new() }
    }
    fn entry(&self) -> MustPers {
        MustPers { must: Acs::new(self.size(), self.assoc, ABSENT), pers: Vec::new() }
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
        for &lbi in self.set.of_block(cfg, block.id) {
            let cb = self.set.lblocks[lbi as usize].cache_block as usize;
            let in_must = out.must.contains(cb);
            for item in &mut out.pers {
                item.pers_inject(cb, in_must);
            }
            out.must.inject_must(cb);
        }
    }
    fn enter_loop(&self, v: &mut MustPers) {
        v.pers.push(Acs::new(self.size(), self.assoc, ABSENT));
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

/// Per-category counters of one classification pass.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CategoryStats {
    pub total: usize,
    pub always_hit: usize,
    pub always_miss: usize,
    pub first_miss: usize,
    pub first_hit: usize,
    pub not_classified: usize,
}

impl CategoryStats {
    pub fn add(&mut self, cat: Category) {
        self.total += 1;
        match cat {
            Category::AlwaysHit => self.always_hit += 1,
            Category::AlwaysMiss => self.always_miss += 1,
            Category::FirstMiss(_) => self.first_miss += 1,
            Category::FirstHit => self.first_hit += 1,
            Category::NotClassified => self.not_classified += 1,
        }
    }

    pub fn log_summary(&self, what: &str) {
        if self.total == 0 {
            return;
        }
        let pct = |n: usize| n * 100 / self.total;
        log::info!(
            "{}: total={} AH={} ({}%) AM={} ({}%) FM={} ({}%) NC={} ({}%)",
            what,
            self.total,
            self.always_hit,
            pct(self.always_hit),
            self.always_miss,
            pct(self.always_miss),
            self.first_miss,
            pct(self.first_miss),
            self.not_classified,
            pct(self.not_classified),
        );
    }
}

/// Classification options.
#[derive(Debug, Clone)]
pub struct IcacheOptions {
    pub level: FirstMissLevel,
    /// First-iteration pseudo-unrolling in the fix-point driver.
    pub pseudo_unroll: bool,
    /// Run the MAY analysis to prove always-miss.
    pub with_may: bool,
    /// Entry MUST state per set, for tasks started in a warm cache.
    pub entry_must: Option<Vec<Acs>>,
}

impl Default for IcacheOptions {
    fn default() -> Self {
        IcacheOptions {
            level: FirstMissLevel::Multi,
            pseudo_unroll: true,
            with_may: false,
            entry_must: None,
        }
    }
}

/// Per-block MUST states, `[cfg][block]` holding (set, state) pairs.
pub type AcsStore = Vec<Vec<Vec<(u32, Acs)>>>;

/// Run the abstract interpretations for every set and categorize every
/// L-block in place. When `acs_out` is given, the MUST state at every block
/// entry is recorded there for annotation.
pub fn classify(
    analysis: &Analysis,
    lbsets: &mut [LBlockSet],
    cache: &CacheConfig,
    opts: &IcacheOptions,
    mut acs_out: Option<&mut AcsStore>,
) -> CategoryStats {
    let mut stats = CategoryStats::default();
    for s in 0..lbsets.len() {
        classify_set(
            analysis,
            &mut lbsets[s],
            cache,
            opts,
            &mut stats,
            acs_out.as_deref_mut(),
        );
    }
    stats.log_summary("icache categories");
    stats
}

fn classify_set(
    analysis: &Analysis,
    lbset: &mut LBlockSet,
    cache: &CacheConfig,
    opts: &IcacheOptions,
    stats: &mut CategoryStats,
    acs_out: Option<&mut AcsStore>,
) {
    if lbset.count() == 0 {
        return;
    }
    log::debug!("classifying icache set {}", lbset.set);

    let entry_must = opts
        .entry_must
        .as_ref()
        .map(|v| v[lbset.set as usize].clone());
    // without a persistence level, the cheaper MUST-only domain suffices
    let mp_sol: Solution<MustPers> = if matches!(opts.level, FirstMissLevel::None) {
        let mut dom = IcacheMust { set: lbset, assoc: cache.assoc };
        let sol = analysis.solve(&mut dom, entry_must);
        let lift = |per_cfg: Vec<Vec<Acs>>| {
            per_cfg
                .into_iter()
                .map(|blocks| {
                    blocks
                        .into_iter()
                        .map(|must| MustPers { must, pers: Vec::new() })
                        .collect()
                })
                .collect()
        };
        Solution { ins: lift(sol.ins), outs: lift(sol.outs) }
    } else {
        let mut dom = IcacheMustPers { set: lbset, assoc: cache.assoc };
        let entry = entry_must.map(|m| MustPers { must: m, pers: Vec::new() });
        analysis.solve(&mut dom, entry)
    };
    let may_sol: Option<Solution<Acs>> = if opts.with_may {
        let mut dom = IcacheMay { set: lbset, assoc: cache.assoc };
        Some(analysis.solve(&mut dom, None))
    } else {
        None
    };

    if let Some(store) = acs_out {
        for (c, cfg) in analysis.coll.iter() {
            for b in 0..cfg.blocks.len() {
                store[c as usize][b].push((lbset.set, mp_sol.ins[c as usize][b].must.clone()));
            }
        }
    }

    // group the l-blocks of each basic block in address order
    let groups: Vec<((CfgId, u32), Vec<u32>)> = lbset
        .blocks()
        .map(|(k, v)| (*k, v.to_vec()))
        .collect();
    for ((cfg, block), list) in groups {
        let ins = &mp_sol.ins[cfg as usize][block as usize];
        let may_in = may_sol.as_ref().map(|s| &s.ins[cfg as usize][block as usize]);
        for (pos, &lbi) in list.iter().enumerate() {
            let cat = if pos == 0 {
                let cb = lbset.lblocks[lbi as usize].cache_block as usize;
                classify_access(analysis, cfg, block, cb, ins, may_in, opts.level)
            } else if lbset.lblocks[lbi as usize].linked_to_prev {
                // shares the cache fill of its predecessor
                Category::AlwaysHit
            } else {
                Category::AlwaysMiss
            };
            lbset.lblocks[lbi as usize].category = cat;
            stats.add(cat);
        }
    }
}

/// Categorize one first access from the abstract states at block entry.
pub(crate) fn classify_access(
    analysis: &Analysis,
    cfg: CfgId,
    block: u32,
    cb: usize,
    ins: &MustPers,
    may_in: Option<&Acs>,
    level: FirstMissLevel,
) -> Category {
    if ins.must.contains(cb) {
        return Category::AlwaysHit;
    }
    if let Some(may) = may_in {
        if !may.contains(cb) {
            return Category::AlwaysMiss;
        }
    }
    let default = if may_in.is_some() {
        Category::NotClassified
    } else {
        Category::AlwaysMiss
    };
    if matches!(level, FirstMissLevel::None) {
        return default;
    }

    let forest = &analysis.forests[cfg as usize];
    let mut header = forest.innermost_containing(block);
    let pers = &ins.pers;
    if pers.is_empty() || header.is_none() {
        return default;
    }
    let bound = match level {
        FirstMissLevel::Inner if pers.len() > 1 => pers.len() - 1,
        _ => 0,
    };

    let mut cat = default;
    let mut perfect = true;
    for k in (bound..pers.len()).rev() {
        let h = match header {
            Some(h) => h,
            None => break,
        };
        if pers[k].is_persistent(cb) {
            cat = Category::FirstMiss(h);
        } else {
            perfect = false;
        }
        header = forest.enclosing[h as usize];
    }
    if matches!(level, FirstMissLevel::Outer) && !perfect {
        cat = Category::AlwaysMiss;
    }
    cat
}
