//! Hardware Description
//!
//! Configuration structs consumed by the analyses: cache hierarchy, memory
//! banks and branch history table. An external front-end parses the XML
//! hardware file into these (they all derive serde); the core never touches
//! XML itself. Missing subsystems are modeled as absent: with no cache,
//! every memory access costs its memory-bank latency.

use serde::{Deserialize, Serialize};

/// Cache replacement policy. Classification is only sound for LRU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReplacePolicy {
    #[default]
    Lru,
    Other,
}

/// Cache write policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WritePolicy {
    #[default]
    WriteThrough,
    WriteBack,
}

/// One cache level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Associativity (way count).
    pub assoc: u32,
    /// Number of sets. Power of two.
    pub sets: u32,
    /// Block (line) size in bytes. Power of two.
    pub block_size: u32,
    pub replace: ReplacePolicy,
    pub write: WritePolicy,
    /// Penalty in cycles of a miss at this level.
    pub miss_penalty: u64,
    /// Next cache level, if any.
    pub next: Option<Box<CacheConfig>>,
}

impl CacheConfig {
    pub fn offset_bits(&self) -> u32 {
        self.block_size.trailing_zeros()
    }

    pub fn set_bits(&self) -> u32 {
        self.sets.trailing_zeros()
    }

    /// Cache set of an address.
    pub fn set_of(&self, address: u32) -> u32 {
        (address >> self.offset_bits()) & (self.sets - 1)
    }

    /// Tag of an address.
    pub fn tag_of(&self, address: u32) -> u32 {
        address >> (self.offset_bits() + self.set_bits())
    }

    /// Line-aligned base address of the block containing `address`.
    pub fn round_down(&self, address: u32) -> u32 {
        address & !(self.block_size - 1)
    }

    /// Address of the next block boundary at or after `address`.
    pub fn round_up(&self, address: u32) -> u32 {
        self.round_down(address.wrapping_add(self.block_size - 1))
    }

    /// Number of cache blocks covered by the byte interval `[first, last]`,
    /// wrapping modulo the address space when `first > last`.
    pub fn block_span(&self, first: u32, last: u32) -> u64 {
        let span = last.wrapping_sub(self.round_down(first)) as u64;
        span / self.block_size as u64 + 1
    }
}

/// Instruction and data cache configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheHierarchy {
    pub inst: Option<CacheConfig>,
    pub data: Option<CacheConfig>,
}

/// A memory bank: an address range with access latencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryBank {
    pub name: String,
    pub base: u32,
    pub size: u32,
    /// Read latency in cycles.
    pub read_latency: u64,
    /// Write latency in cycles.
    pub write_latency: u64,
    pub cached: bool,
}

impl MemoryBank {
    pub fn contains(&self, address: u32) -> bool {
        address.wrapping_sub(self.base) < self.size
    }
}

/// Default prediction strategy of the branch predictor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DefaultPrediction {
    #[default]
    NotTaken,
    Taken,
    /// Backward branches predicted taken, forward not-taken.
    Direct,
}

/// Branch history table description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bht {
    /// Number of table rows. Power of two.
    pub rows: u32,
    /// Misprediction penalty for a conditional direct branch.
    pub cond_penalty: u64,
    /// Misprediction penalty for an indirect branch.
    pub indirect_penalty: u64,
    /// Misprediction penalty for a conditional indirect branch.
    pub cond_indirect_penalty: u64,
    pub default_prediction: DefaultPrediction,
}

impl Bht {
    /// BHT row of a branch instruction address.
    pub fn row_of(&self, address: u32) -> u32 {
        if self.rows == 0 {
            return 0;
        }
        (address >> 2) & (self.rows - 1)
    }

    /// Resolve the default prediction for a branch from `address` to
    /// `target`: `Direct` predicts backward branches taken.
    pub fn actual_default(&self, address: u32, target: u32) -> DefaultPrediction {
        match self.default_prediction {
            DefaultPrediction::Direct => {
                if target <= address {
                    DefaultPrediction::Taken
                } else {
                    DefaultPrediction::NotTaken
                }
            }
            other => other,
        }
    }
}

/// One pipeline stage of the processor description. The core carries these
/// for event routing only; there is no cycle-accurate pipeline model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStage {
    pub name: String,
    pub width: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub stages: Vec<PipelineStage>,
}

/// Complete hardware description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareConfig {
    pub processor: Option<PipelineConfig>,
    pub caches: CacheHierarchy,
    pub memory: Vec<MemoryBank>,
    pub bht: Option<Bht>,
}

impl HardwareConfig {
    /// Read latency of the bank containing the address; zero when unmapped.
    pub fn read_latency(&self, address: u32) -> u64 {
        self.memory
            .iter()
            .find(|b| b.contains(address))
            .map(|b| b.read_latency)
            .unwrap_or(0)
    }

    /// Write latency of the bank containing the address; zero when unmapped.
    pub fn write_latency(&self, address: u32) -> u64 {
        self.memory
            .iter()
            .find(|b| b.contains(address))
            .map(|b| b.write_latency)
            .unwrap_or(0)
    }

    /// Worst write latency over all banks.
    pub fn worst_write_latency(&self) -> u64 {
        self.memory.iter().map(|b| b.write_latency).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_2w_4s_16b() -> CacheConfig {
        CacheConfig {
            assoc: 2,
            sets: 4,
            block_size: 16,
            replace: ReplacePolicy::Lru,
            write: WritePolicy::WriteThrough,
            miss_penalty: 10,
            next: None,
        }
    }

    #[test]
    fn test_geometry() {
        let c = cache_2w_4s_16b();
        assert_eq!(c.set_of(0x0000), 0);
        assert_eq!(c.set_of(0x0010), 1);
        assert_eq!(c.set_of(0x0040), 0);
        assert_eq!(c.tag_of(0x0040), 1);
        assert_eq!(c.round_down(0x001c), 0x0010);
        assert_eq!(c.round_up(0x0011), 0x0020);
        assert_eq!(c.block_span(0x0000, 0x000f), 1);
        assert_eq!(c.block_span(0x0008, 0x0010), 2);
    }

    #[test]
    fn test_wrapping_span() {
        let c = cache_2w_4s_16b();
        // interval wrapping past the top of the address space
        assert_eq!(c.block_span(0xffff_fff0, 0x0000_000f), 2);
    }

    #[test]
    fn test_direct_default_prediction() {
        let bht = Bht {
            rows: 16,
            cond_penalty: 3,
            indirect_penalty: 5,
            cond_indirect_penalty: 6,
            default_prediction: DefaultPrediction::Direct,
        };
        assert_eq!(bht.actual_default(0x100, 0x80), DefaultPrediction::Taken);
        assert_eq!(bht.actual_default(0x100, 0x140), DefaultPrediction::NotTaken);
    }
}
