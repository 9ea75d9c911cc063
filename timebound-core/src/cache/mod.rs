//! Cache Model
//!
//! Abstract cache states, cache-block identification and the access
//! categories shared by the instruction- and data-cache analyses.
//! Classification is only sound for LRU replacement with block-granular
//! accesses.

use crate::cfg::BlockId;

pub mod dcache;
pub mod icache;
pub mod lblock;
pub mod purge;

/// Age value marking a block absent from the abstract set.
pub const ABSENT: i32 = -1;

/// Classification of a cache access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Category {
    AlwaysHit,
    AlwaysMiss,
    /// One miss charged at each entry of the loop headed by the block.
    FirstMiss(BlockId),
    FirstHit,
    #[default]
    NotClassified,
}

impl Category {
    /// Short code used in logs and statistics dumps.
    pub fn code(&self) -> &'static str {
        match self {
            Category::AlwaysHit => "AH",
            Category::AlwaysMiss => "AM",
            Category::FirstMiss(_) => "FM",
            Category::FirstHit => "FH",
            Category::NotClassified => "NC",
        }
    }
}

/// Loop-level granularity of the first-miss computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirstMissLevel {
    /// No persistence analysis: unclassified accesses stay conservative.
    None,
    /// Innermost level only.
    Inner,
    /// Outermost level only; an imperfect stack degrades to always-miss.
    Outer,
    /// Any level, outermost persistent level wins.
    #[default]
    Multi,
}

/// A line-sized aligned region: (set, tag) plus its base address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheBlock {
    pub set: u32,
    pub tag: u32,
    pub address: u32,
}

/// Abstract cache state of one set: per tracked block, an age in
/// {⊥, 0, …, A}. The meaning of an age depends on the domain using it:
/// under MUST lower is more recently used, under MAY an age is the youngest
/// the block can be, under PERS ages saturate at A ("wiped").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acs {
    pub assoc: i32,
    pub age: Vec<i32>,
}

impl Acs {
    pub fn new(size: usize, assoc: u32, init: i32) -> Acs {
        Acs { assoc: assoc as i32, age: vec![init; size] }
    }

    pub fn contains(&self, i: usize) -> bool {
        self.age[i] != ABSENT
    }

    /// MUST transfer for an access to block `i`: the block becomes most
    /// recently used and every younger block ages by one, evicted past
    /// `A - 1`.
    pub fn inject_must(&mut self, i: usize) {
        let old = if self.age[i] == ABSENT { i32::MAX } else { self.age[i] };
        for j in 0..self.age.len() {
            if j != i && self.age[j] != ABSENT && self.age[j] < old {
                self.age[j] += 1;
                if self.age[j] >= self.assoc {
                    self.age[j] = ABSENT;
                }
            }
        }
        self.age[i] = 0;
    }

    /// MAY transfer for an access to block `i`.
    pub fn inject_may(&mut self, i: usize) {
        let old = if self.age[i] == ABSENT { i32::MAX } else { self.age[i] };
        for j in 0..self.age.len() {
            if j != i && self.age[j] != ABSENT && self.age[j] <= old {
                self.age[j] += 1;
                if self.age[j] >= self.assoc {
                    self.age[j] = ABSENT;
                }
            }
        }
        self.age[i] = 0;
    }

    /// Age every present block by one (MUST view of an unknown access).
    pub fn age_all(&mut self) {
        for a in &mut self.age {
            if *a != ABSENT {
                *a += 1;
                if *a >= self.assoc {
                    *a = ABSENT;
                }
            }
        }
    }

    /// Make every block most recently used (MAY view of an unknown access).
    pub fn refresh_all(&mut self) {
        for a in &mut self.age {
            *a = 0;
        }
    }

    /// MUST join: pointwise maximum, absence wins.
    pub fn join_must(&mut self, other: &Acs) {
        for (a, &b) in self.age.iter_mut().zip(other.age.iter()) {
            *a = if *a == ABSENT || b == ABSENT { ABSENT } else { (*a).max(b) };
        }
    }

    /// MAY join: pointwise minimum, absence is the identity.
    pub fn join_may(&mut self, other: &Acs) {
        for (a, &b) in self.age.iter_mut().zip(other.age.iter()) {
            *a = match (*a, b) {
                (ABSENT, x) => x,
                (x, ABSENT) => x,
                (x, y) => x.min(y),
            };
        }
    }

    // persistence item operations; ages may saturate at `assoc` ("wiped")
    // and never recover

    pub fn is_wiped(&self, i: usize) -> bool {
        self.age[i] == self.assoc
    }

    pub fn is_persistent(&self, i: usize) -> bool {
        self.contains(i) && !self.is_wiped(i)
    }

    /// PERS transfer for an access to block `i`; `in_must` tells whether
    /// the combined MUST state guarantees the block present.
    pub fn pers_inject(&mut self, i: usize, in_must: bool) {
        if in_must {
            let old = self.age[i];
            if old != ABSENT {
                for j in 0..self.age.len() {
                    if j != i
                        && self.age[j] != ABSENT
                        && self.age[j] != self.assoc
                        && self.age[j] < old
                    {
                        self.age[j] += 1;
                    }
                }
            }
        } else {
            for j in 0..self.age.len() {
                if j != i && self.age[j] != ABSENT && self.age[j] != self.assoc {
                    self.age[j] += 1;
                }
            }
        }
        self.age[i] = 0;
    }

    /// PERS join: the older age wins, absence is the identity, `A` sticks.
    pub fn pers_join(&mut self, other: &Acs) {
        for (a, &b) in self.age.iter_mut().zip(other.age.iter()) {
            if (*a < b && b != ABSENT) || *a == ABSENT {
                *a = b;
            }
        }
    }

    /// Saturating aging of one block by `damage`.
    pub fn pers_damage(&mut self, i: usize, damage: i32) {
        if self.age[i] == ABSENT {
            return;
        }
        self.age[i] = (self.age[i] + damage).min(self.assoc);
    }
}
