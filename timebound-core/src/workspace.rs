//! Workspace
//!
//! Process-wide container of one analysis: the program model, the CFG
//! collection and its derived information, the annotation store and the
//! assembled ILP system. Analyses run strictly sequentially and own the
//! workspace exclusively while they do.

use crate::cache::dcache::DataBlocks;
use crate::cache::lblock::LBlockSet;
use crate::cache::FirstMissLevel;
use crate::cfg::dominance::DomInfo;
use crate::cfg::loops::LoopForest;
use crate::cfg::CfgCollection;
use crate::error::{AnalysisError, Result};
use crate::flowfacts::FlowFacts;
use crate::hard::HardwareConfig;
use crate::ilp::IlpSystem;
use crate::proc::Feature;
use crate::prog::Program;
use crate::prop::{PropId, PropList};
use std::collections::HashSet;

// configuration identifiers

/// Task entry function, by name or address.
pub fn entry_cfg() -> PropId<String> {
    PropId::of("timebound::config::entry_cfg")
}

/// Default inlining policy of the virtualizer.
pub fn virtual_default() -> PropId<bool> {
    PropId::of("timebound::config::virtual_default")
}

/// Call-site addresses where inlining is disabled.
pub fn no_inline() -> PropId<HashSet<u32>> {
    PropId::of("timebound::config::no_inline")
}

/// Persistence granularity of the first-miss computation.
pub fn firstmiss_level() -> PropId<FirstMissLevel> {
    PropId::of("timebound::config::firstmiss_level")
}

/// First-iteration unrolling inside the abstract-interpretation driver.
pub fn pseudo_unrolling() -> PropId<bool> {
    PropId::of("timebound::config::pseudo_unrolling")
}

/// Run the MAY analyses next to MUST.
pub fn with_may() -> PropId<bool> {
    PropId::of("timebound::config::with_may")
}

/// Entry MUST abstract cache state per instruction-cache set, for tasks
/// analyzed in a warm-cache context.
pub fn entry_acs() -> PropId<Vec<crate::cache::Acs>> {
    PropId::of("timebound::config::entry_acs")
}

/// Sub-CFG extraction start address.
pub fn cfg_start() -> PropId<u32> {
    PropId::of("timebound::config::cfg_start")
}

/// Sub-CFG extraction stop addresses.
pub fn cfg_stop() -> PropId<Vec<u32>> {
    PropId::of("timebound::config::cfg_stop")
}

/// Generate human-readable ILP variable names.
pub fn explicit() -> PropId<bool> {
    PropId::of("timebound::config::explicit")
}

/// Trivial per-instruction time of the default block-time assignment.
pub fn time_per_inst() -> PropId<u64> {
    PropId::of("timebound::config::time_per_inst")
}

/// Apply the CFG transformers (virtualize, unroll, restructure).
pub fn do_virtualize() -> PropId<bool> {
    PropId::of("timebound::config::do_virtualize")
}
pub fn do_unroll() -> PropId<bool> {
    PropId::of("timebound::config::do_unroll")
}
pub fn do_restructure() -> PropId<bool> {
    PropId::of("timebound::config::do_restructure")
}

/// Log granularity of the analyses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    #[default]
    None,
    Proc,
    File,
    Fun,
    Block,
    Inst,
}

pub fn log_level() -> PropId<LogLevel> {
    PropId::of("timebound::config::log_level")
}

pub fn verbose() -> PropId<bool> {
    PropId::of("timebound::config::verbose")
}

/// Restrict detailed logging to one processor name.
pub fn log_for() -> PropId<String> {
    PropId::of("timebound::config::log_for")
}

/// The analysis workspace.
pub struct Workspace {
    pub program: Program,
    pub hardware: HardwareConfig,
    pub flow_facts: FlowFacts,
    /// Configuration property list consumed by the processors.
    pub config: PropList,
    /// Workspace-level annotations (WCET among them).
    pub props: PropList,

    pub cfgs: Option<CfgCollection>,
    /// Dominance information, parallel to `cfgs`.
    pub doms: Vec<DomInfo>,
    /// Loop forests, parallel to `cfgs`.
    pub forests: Vec<LoopForest>,
    pub lbsets: Option<Vec<LBlockSet>>,
    pub data: Option<DataBlocks>,
    pub system: Option<IlpSystem>,

    pub(crate) provided: HashSet<Feature>,
}

impl Workspace {
    pub fn new(program: Program, hardware: HardwareConfig, flow_facts: FlowFacts) -> Workspace {
        Workspace {
            program,
            hardware,
            flow_facts,
            config: PropList::new(),
            props: PropList::new(),
            cfgs: None,
            doms: Vec::new(),
            forests: Vec::new(),
            lbsets: None,
            data: None,
            system: None,
            provided: HashSet::new(),
        }
    }

    pub fn is_provided(&self, f: Feature) -> bool {
        self.provided.contains(&f)
    }

    pub fn mark_provided(&mut self, f: Feature) {
        self.provided.insert(f);
    }

    pub fn drop_provided(&mut self, f: Feature) {
        self.provided.remove(&f);
    }

    /// The CFG collection; an error when no collector ran yet.
    pub fn collection(&self) -> Result<&CfgCollection> {
        self.cfgs
            .as_ref()
            .ok_or(AnalysisError::UnsupportedFeature("cfg.collected"))
    }

    /// Resolve the configured task entry address.
    pub fn entry_address(&self) -> Result<u32> {
        match self.config.get(entry_cfg()) {
            Some(spec) => self.program.resolve_entry(spec),
            None => Ok(self.program.entry),
        }
    }

    /// Should a processor emit detail at the given granularity? Gated by
    /// the `LOG_LEVEL`, `VERBOSE` and `LOG_FOR` configuration keys.
    pub fn logs(&self, level: LogLevel, processor: &str) -> bool {
        if let Some(only) = self.config.get(log_for()) {
            if !processor.contains(only.as_str()) {
                return false;
            }
        }
        if self.config.get_or_default(verbose()) {
            return true;
        }
        self.config.get_or_default(log_level()) >= level
    }

    /// Attach the loop bounds of the flow facts to their header blocks.
    pub fn apply_flow_facts(&mut self) {
        let facts = std::mem::take(&mut self.flow_facts);
        if let Some(coll) = self.cfgs.as_mut() {
            for (&addr, &bound) in &facts.loops {
                let mut found = false;
                // virtualization and unrolling clone code: every copy of
                // the header gets the bound
                for cfg in coll.cfgs.iter_mut() {
                    let hits: Vec<u32> = cfg
                        .blocks
                        .iter()
                        .filter(|b| {
                            b.is_basic()
                                && matches!(
                                    (b.address(), b.top_address()),
                                    (Some(lo), Some(hi)) if lo <= addr && addr < hi
                                )
                        })
                        .map(|b| b.id)
                        .collect();
                    for b in hits {
                        cfg.block_mut(b)
                            .props
                            .set(crate::flowfacts::max_iteration(), bound);
                        found = true;
                    }
                }
                if !found {
                    log::warn!("flow fact for 0x{:08X} matches no block", addr);
                }
            }
        }
        self.flow_facts = facts;
    }
}
