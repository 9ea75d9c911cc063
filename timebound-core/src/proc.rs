//! Processor Registry
//!
//! Analyses ("processors") declare what they require, provide and
//! invalidate in a plain descriptor; the registry holds the default
//! processor of every feature and runs them in dependency order. A missing
//! requirement is satisfied by running the feature's default processor;
//! invalidations drop the invalidated feature's artifacts before the new
//! processor runs.

use crate::branch;
use crate::cache::icache::{self, AcsStore, IcacheOptions};
use crate::cache::{dcache, lblock, purge};
use crate::cfg::dominance::DomInfo;
use crate::cfg::loops::LoopForest;
use crate::cfg::{builder, dominance, loops, restructure, subcfg, unroll, virtualize};
use crate::error::{AnalysisError, Result};
use crate::ilp::{IlpSystem, Solver};
use crate::ipet::{self, IpetConfig};
use crate::prop::PropId;
use crate::prop::PropList;
use crate::workspace::{self, Workspace};
use std::collections::HashMap;
use std::rc::Rc;

/// A named analysis feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Feature(pub &'static str);

pub const COLLECTED_CFG: Feature = Feature("cfg.collected");
pub const VIRTUALIZED_CFG: Feature = Feature("cfg.virtualized");
pub const SPLIT_CFG: Feature = Feature("cfg.split");
pub const RESTRUCTURED_CFG: Feature = Feature("cfg.restructured");
pub const LOOP_BOUNDS: Feature = Feature("cfg.loop_bounds");
pub const UNROLLED_LOOPS: Feature = Feature("cfg.unrolled");
pub const DOMINANCE: Feature = Feature("cfg.dominance");
pub const LOOP_INFO: Feature = Feature("cfg.loop_info");
pub const COLLECTED_LBLOCKS: Feature = Feature("cache.lblocks");
pub const ICACHE_CATEGORY: Feature = Feature("cache.icache_category");
pub const DATA_BLOCKS: Feature = Feature("cache.data_blocks");
pub const DCACHE_CATEGORY: Feature = Feature("cache.dcache_category");
pub const PURGE: Feature = Feature("cache.purge");
pub const BRANCH_CATEGORY: Feature = Feature("branch.category");
pub const ILP_SYSTEM: Feature = Feature("ipet.system");
pub const ASSIGNED_VARS: Feature = Feature("ipet.assigned_vars");
pub const CONTROL_CONSTRAINTS: Feature = Feature("ipet.control_constraints");
pub const FLOW_FACT_CONSTRAINTS: Feature = Feature("ipet.flow_fact_constraints");
pub const OBJECT_FUNCTION: Feature = Feature("ipet.object_function");
pub const ICACHE_SUPPORT: Feature = Feature("ipet.icache_support");
pub const DCACHE_SUPPORT: Feature = Feature("ipet.dcache_support");
pub const BRANCH_SUPPORT: Feature = Feature("ipet.branch_support");
pub const EVENTS: Feature = Feature("events.standard");
pub const WCET: Feature = Feature("ipet.wcet");

/// Declarative metadata of a processor.
pub struct ProcDesc {
    pub name: &'static str,
    pub requires: &'static [Feature],
    pub provides: &'static [Feature],
    pub invalidates: &'static [Feature],
}

/// One analysis step.
pub trait Processor {
    fn desc(&self) -> &'static ProcDesc;
    /// Pick the processor's knobs out of the configuration property list.
    fn configure(&mut self, _config: &PropList) -> Result<()> {
        Ok(())
    }
    fn process(&mut self, ws: &mut Workspace) -> Result<()>;
}

type Maker = fn() -> Box<dyn Processor>;

/// Default processor of every feature.
pub struct Registry {
    defaults: HashMap<Feature, Maker>,
}

impl Registry {
    /// The standard analysis registry.
    pub fn standard() -> Registry {
        let mut r = Registry { defaults: HashMap::new() };
        r.register(COLLECTED_CFG, || Box::new(CfgCollector));
        r.register(VIRTUALIZED_CFG, || Box::new(Virtualizer));
        r.register(SPLIT_CFG, || Box::new(SubCfgBuilder));
        r.register(RESTRUCTURED_CFG, || Box::new(ConditionalRestructurer));
        r.register(LOOP_BOUNDS, || Box::new(LoopBoundsLoader));
        r.register(UNROLLED_LOOPS, || Box::new(LoopUnroller));
        r.register(DOMINANCE, || Box::new(DominanceBuilder));
        r.register(LOOP_INFO, || Box::new(LoopInfoBuilder));
        r.register(COLLECTED_LBLOCKS, || Box::new(LBlockBuilder));
        r.register(ICACHE_CATEGORY, || Box::new(IcacheCategorizer::default()));
        r.register(DATA_BLOCKS, || Box::new(DataBlockBuilder));
        r.register(DCACHE_CATEGORY, || Box::new(DcacheCategorizer::default()));
        r.register(PURGE, || Box::new(PurgeAnalyzer));
        r.register(BRANCH_CATEGORY, || Box::new(BranchClassifier));
        r.register(ILP_SYSTEM, || Box::new(IlpSystemBuilder));
        r.register(ASSIGNED_VARS, || Box::new(VarAssigner));
        r.register(CONTROL_CONSTRAINTS, || Box::new(BasicConstraintsBuilder));
        r.register(FLOW_FACT_CONSTRAINTS, || Box::new(FlowFactConstraintsBuilder));
        r.register(OBJECT_FUNCTION, || Box::new(ObjectFunctionBuilder));
        r.register(ICACHE_SUPPORT, || Box::new(IcacheConstraintsBuilder));
        r.register(DCACHE_SUPPORT, || Box::new(DcacheConstraintsBuilder));
        r.register(BRANCH_SUPPORT, || Box::new(BranchConstraintsBuilder));
        r.register(EVENTS, || Box::new(EventBuilder));
        r
    }

    pub fn register(&mut self, feature: Feature, maker: Maker) {
        self.defaults.insert(feature, maker);
    }

    /// Ensure a feature is provided, running its default processor (and
    /// that processor's requirements) when missing.
    pub fn require(&self, ws: &mut Workspace, feature: Feature) -> Result<()> {
        if ws.is_provided(feature) {
            return Ok(());
        }
        let maker = self
            .defaults
            .get(&feature)
            .ok_or(AnalysisError::UnsupportedFeature(feature.0))?;
        let mut p = maker();
        let desc = p.desc();
        for &r in desc.requires {
            self.require(ws, r)?;
        }
        if ws.logs(crate::workspace::LogLevel::Proc, desc.name) {
            log::info!("running {}", desc.name);
        } else {
            log::debug!("running {}", desc.name);
        }
        p.configure(&ws.config)?;
        for &f in desc.invalidates {
            invalidate(ws, f);
        }
        p.process(ws)?;
        for &f in desc.provides {
            ws.mark_provided(f);
        }
        Ok(())
    }
}

/// Drop a feature and the workspace artifacts it produced.
pub fn invalidate(ws: &mut Workspace, f: Feature) {
    ws.drop_provided(f);
    match f {
        DOMINANCE => ws.doms.clear(),
        LOOP_INFO => ws.forests.clear(),
        COLLECTED_LBLOCKS => ws.lbsets = None,
        DATA_BLOCKS => ws.data = None,
        ILP_SYSTEM => ws.system = None,
        _ => {}
    }
}

// transformers invalidate everything derived from the block structure
const DERIVED: &[Feature] = &[
    DOMINANCE,
    LOOP_INFO,
    COLLECTED_LBLOCKS,
    DATA_BLOCKS,
    ICACHE_CATEGORY,
    DCACHE_CATEGORY,
    BRANCH_CATEGORY,
];

struct CfgCollector;

impl Processor for CfgCollector {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::CfgCollector",
            requires: &[],
            provides: &[COLLECTED_CFG],
            invalidates: &[],
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        let entry = ws.entry_address()?;
        ws.cfgs = Some(builder::build(&ws.program, entry)?);
        Ok(())
    }
}

struct Virtualizer;

impl Processor for Virtualizer {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::Virtualizer",
            requires: &[COLLECTED_CFG],
            provides: &[VIRTUALIZED_CFG, COLLECTED_CFG],
            invalidates: DERIVED,
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        let opts = virtualize::Options {
            default_inline: ws.config.get(workspace::virtual_default()).copied().unwrap_or(true),
            no_inline: ws.config.get_or_default(workspace::no_inline()),
        };
        let new = virtualize::virtualize(ws.collection()?, &opts)?;
        ws.cfgs = Some(new);
        Ok(())
    }
}

struct SubCfgBuilder;

impl Processor for SubCfgBuilder {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::SubCfgBuilder",
            requires: &[COLLECTED_CFG],
            provides: &[SPLIT_CFG, COLLECTED_CFG],
            invalidates: DERIVED,
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        let start = *ws.config.get(workspace::cfg_start()).ok_or_else(|| {
            AnalysisError::Configuration("sub-CFG extraction without CFG_START".into())
        })?;
        let stops = ws.config.get_or_default(workspace::cfg_stop());
        let sub = subcfg::extract(ws.collection()?.entry_cfg(), start, &stops)?;
        ws.cfgs.as_mut().expect("collection present").cfgs[0] = sub;
        Ok(())
    }
}

struct ConditionalRestructurer;

impl Processor for ConditionalRestructurer {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::ConditionalRestructurer",
            requires: &[COLLECTED_CFG],
            provides: &[RESTRUCTURED_CFG, COLLECTED_CFG],
            invalidates: DERIVED,
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        ws.cfgs = Some(restructure::restructure_collection(ws.collection()?)?);
        Ok(())
    }
}

struct LoopBoundsLoader;

impl Processor for LoopBoundsLoader {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::LoopBoundsLoader",
            requires: &[COLLECTED_CFG],
            provides: &[LOOP_BOUNDS],
            invalidates: &[],
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        ws.apply_flow_facts();
        Ok(())
    }
}

struct LoopUnroller;

impl Processor for LoopUnroller {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::LoopUnroller",
            requires: &[COLLECTED_CFG, LOOP_BOUNDS],
            provides: &[UNROLLED_LOOPS, COLLECTED_CFG],
            invalidates: DERIVED,
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        ws.cfgs = Some(unroll::unroll_collection(ws.collection()?)?);
        Ok(())
    }
}

struct DominanceBuilder;

impl Processor for DominanceBuilder {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::Dominance",
            requires: &[COLLECTED_CFG],
            provides: &[DOMINANCE],
            invalidates: &[],
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        let coll = ws.cfgs.as_mut().expect("collection present");
        let mut doms = Vec::new();
        for cfg in coll.cfgs.iter_mut() {
            let dom = DomInfo::compute(cfg);
            dominance::annotate(cfg, &dom);
            doms.push(dom);
        }
        ws.doms = doms;
        Ok(())
    }
}

struct LoopInfoBuilder;

impl Processor for LoopInfoBuilder {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::LoopInfoBuilder",
            requires: &[DOMINANCE],
            provides: &[LOOP_INFO],
            invalidates: &[],
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        let Workspace { cfgs, doms, forests, .. } = ws;
        let coll = cfgs.as_mut().expect("collection present");
        forests.clear();
        for (cfg, dom) in coll.cfgs.iter_mut().zip(doms.iter()) {
            let forest = LoopForest::build(cfg, dom);
            loops::annotate(cfg, &forest);
            forests.push(forest);
        }
        Ok(())
    }
}

fn icache_config(ws: &Workspace) -> Result<crate::hard::CacheConfig> {
    ws.hardware
        .caches
        .inst
        .clone()
        .ok_or(AnalysisError::UnsupportedFeature("icache configuration"))
}

fn dcache_config(ws: &Workspace) -> Result<crate::hard::CacheConfig> {
    ws.hardware
        .caches
        .data
        .clone()
        .ok_or(AnalysisError::UnsupportedFeature("dcache configuration"))
}

struct LBlockBuilder;

impl Processor for LBlockBuilder {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::LBlockBuilder",
            requires: &[COLLECTED_CFG],
            provides: &[COLLECTED_LBLOCKS],
            invalidates: &[],
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        let cache = icache_config(ws)?;
        ws.lbsets = Some(lblock::partition(ws.collection()?, &cache));
        Ok(())
    }
}

/// Per-classification statistics, kept on the workspace.
pub fn icache_stats() -> PropId<icache::CategoryStats> {
    PropId::of("timebound::icache_stats")
}
pub fn dcache_stats() -> PropId<icache::CategoryStats> {
    PropId::of("timebound::dcache_stats")
}

#[derive(Default)]
struct IcacheCategorizer {
    opts: IcacheOptions,
    attach_acs: bool,
}

impl Processor for IcacheCategorizer {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::IcacheCategorizer",
            requires: &[COLLECTED_CFG, DOMINANCE, LOOP_INFO, COLLECTED_LBLOCKS],
            provides: &[ICACHE_CATEGORY],
            invalidates: &[],
        };
        &DESC
    }

    fn configure(&mut self, config: &PropList) -> Result<()> {
        self.opts.level = config.get_or_default(workspace::firstmiss_level());
        self.opts.pseudo_unroll = config
            .get(workspace::pseudo_unrolling())
            .copied()
            .unwrap_or(true);
        self.opts.with_may = config.get_or_default(workspace::with_may());
        self.opts.entry_must = config.get(workspace::entry_acs()).cloned();
        self.attach_acs = config.get_or_default(workspace::verbose());
        Ok(())
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        let cache = icache_config(ws)?;
        let stats;
        let mut store: Option<AcsStore> = None;
        {
            let Workspace { cfgs, doms, forests, lbsets, config, .. } = ws;
            let coll = cfgs.as_ref().expect("collection present");
            let analysis = crate::dfa::Analysis {
                coll,
                doms,
                forests,
                unroll: config.get(workspace::pseudo_unrolling()).copied().unwrap_or(true),
            };
            if self.attach_acs {
                store = Some(
                    coll.cfgs
                        .iter()
                        .map(|c| vec![Vec::new(); c.blocks.len()])
                        .collect(),
                );
            }
            stats = icache::classify(
                &analysis,
                lbsets.as_mut().expect("l-blocks built"),
                &cache,
                &self.opts,
                store.as_mut(),
            );
        }
        if let Some(store) = store {
            let coll = ws.cfgs.as_mut().expect("collection present");
            for (c, per_block) in store.into_iter().enumerate() {
                for (b, acs) in per_block.into_iter().enumerate() {
                    if !acs.is_empty() {
                        coll.cfgs[c].blocks[b]
                            .props
                            .set(icache::icache_acs_must(), Rc::new(acs));
                    }
                }
            }
        }
        ws.props.set(icache_stats(), stats);
        Ok(())
    }
}

struct DataBlockBuilder;

impl Processor for DataBlockBuilder {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::DataBlockBuilder",
            requires: &[COLLECTED_CFG],
            provides: &[DATA_BLOCKS],
            invalidates: &[],
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        let cache = dcache_config(ws)?;
        ws.data = Some(dcache::build_data_blocks(ws.collection()?, &cache));
        Ok(())
    }
}

#[derive(Default)]
struct DcacheCategorizer {
    opts: dcache::DcacheOptions,
}

impl Processor for DcacheCategorizer {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::DcacheCategorizer",
            requires: &[COLLECTED_CFG, DOMINANCE, LOOP_INFO, DATA_BLOCKS],
            provides: &[DCACHE_CATEGORY],
            invalidates: &[],
        };
        &DESC
    }

    fn configure(&mut self, config: &PropList) -> Result<()> {
        self.opts.level = config.get_or_default(workspace::firstmiss_level());
        self.opts.pseudo_unroll = config
            .get(workspace::pseudo_unrolling())
            .copied()
            .unwrap_or(true);
        self.opts.with_may = config.get_or_default(workspace::with_may());
        Ok(())
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        let cache = dcache_config(ws)?;
        let stats;
        {
            let Workspace { cfgs, doms, forests, data, config, .. } = ws;
            let analysis = crate::dfa::Analysis {
                coll: cfgs.as_ref().expect("collection present"),
                doms,
                forests,
                unroll: config.get(workspace::pseudo_unrolling()).copied().unwrap_or(true),
            };
            stats = dcache::classify(
                &analysis,
                data.as_mut().expect("data blocks built"),
                &cache,
                &self.opts,
            );
        }
        ws.props.set(dcache_stats(), stats);
        Ok(())
    }
}

struct PurgeAnalyzer;

impl Processor for PurgeAnalyzer {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::PurgeAnalyzer",
            requires: &[DCACHE_CATEGORY],
            provides: &[PURGE],
            invalidates: &[],
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        let cache = dcache_config(ws)?;
        let Workspace { cfgs, doms, forests, data, hardware, .. } = ws;
        let analysis = crate::dfa::Analysis {
            coll: cfgs.as_ref().expect("collection present"),
            doms,
            forests,
            unroll: false,
        };
        purge::analyze(
            &analysis,
            data.as_mut().expect("data blocks built"),
            &cache,
            hardware,
        );
        Ok(())
    }
}

struct BranchClassifier;

impl Processor for BranchClassifier {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::BranchClassifier",
            requires: &[COLLECTED_CFG, DOMINANCE, LOOP_INFO],
            provides: &[BRANCH_CATEGORY],
            invalidates: &[],
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        let bht = ws
            .hardware
            .bht
            .clone()
            .ok_or(AnalysisError::UnsupportedFeature("BHT configuration"))?;
        let Workspace { cfgs, forests, .. } = ws;
        branch::classify(cfgs.as_mut().expect("collection present"), forests, &bht);
        Ok(())
    }
}

struct IlpSystemBuilder;

impl Processor for IlpSystemBuilder {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::IlpSystemBuilder",
            requires: &[],
            provides: &[ILP_SYSTEM],
            invalidates: &[],
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        ws.system = Some(IlpSystem::new());
        Ok(())
    }
}

fn ipet_config(ws: &Workspace) -> IpetConfig {
    IpetConfig {
        explicit: ws.config.get_or_default(workspace::explicit()),
        time_per_inst: ws
            .config
            .get(workspace::time_per_inst())
            .copied()
            .unwrap_or_else(|| IpetConfig::default().time_per_inst),
    }
}

struct VarAssigner;

impl Processor for VarAssigner {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::VarAssigner",
            requires: &[COLLECTED_CFG, ILP_SYSTEM],
            provides: &[ASSIGNED_VARS],
            invalidates: &[],
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        let config = ipet_config(ws);
        let Workspace { cfgs, system, .. } = ws;
        ipet::assign_vars(
            cfgs.as_mut().expect("collection present"),
            system.as_mut().expect("ILP system created"),
            &config,
        );
        Ok(())
    }
}

struct BasicConstraintsBuilder;

impl Processor for BasicConstraintsBuilder {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::BasicConstraintsBuilder",
            requires: &[ASSIGNED_VARS],
            provides: &[CONTROL_CONSTRAINTS],
            invalidates: &[],
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        let Workspace { cfgs, system, .. } = ws;
        ipet::build_structural(
            cfgs.as_ref().expect("collection present"),
            system.as_mut().expect("ILP system created"),
        );
        Ok(())
    }
}

struct FlowFactConstraintsBuilder;

impl Processor for FlowFactConstraintsBuilder {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::FlowFactConstraintsBuilder",
            requires: &[ASSIGNED_VARS, LOOP_BOUNDS, DOMINANCE],
            provides: &[FLOW_FACT_CONSTRAINTS],
            invalidates: &[],
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        let Workspace { cfgs, doms, system, .. } = ws;
        ipet::build_flow_facts(
            cfgs.as_ref().expect("collection present"),
            doms,
            system.as_mut().expect("ILP system created"),
        )
    }
}

struct ObjectFunctionBuilder;

impl Processor for ObjectFunctionBuilder {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::ObjectFunctionBuilder",
            requires: &[ASSIGNED_VARS],
            provides: &[OBJECT_FUNCTION],
            invalidates: &[],
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        let config = ipet_config(ws);
        let Workspace { cfgs, system, .. } = ws;
        ipet::build_objective(
            cfgs.as_mut().expect("collection present"),
            system.as_mut().expect("ILP system created"),
            &config,
        );
        Ok(())
    }
}

struct IcacheConstraintsBuilder;

impl Processor for IcacheConstraintsBuilder {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::IcacheConstraintsBuilder",
            requires: &[ASSIGNED_VARS, ICACHE_CATEGORY],
            provides: &[ICACHE_SUPPORT],
            invalidates: &[],
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        let cache = icache_config(ws)?;
        let config = ipet_config(ws);
        let Workspace { cfgs, doms, lbsets, system, .. } = ws;
        ipet::build_icache_constraints(
            cfgs.as_ref().expect("collection present"),
            doms,
            lbsets.as_mut().expect("l-blocks built"),
            system.as_mut().expect("ILP system created"),
            cache.miss_penalty,
            &config,
        );
        Ok(())
    }
}

struct DcacheConstraintsBuilder;

impl Processor for DcacheConstraintsBuilder {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::DcacheConstraintsBuilder",
            requires: &[ASSIGNED_VARS, DCACHE_CATEGORY],
            provides: &[DCACHE_SUPPORT],
            invalidates: &[],
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        let cache = dcache_config(ws)?;
        let config = ipet_config(ws);
        let Workspace { cfgs, doms, data, system, .. } = ws;
        ipet::build_dcache_constraints(
            cfgs.as_ref().expect("collection present"),
            doms,
            data.as_mut().expect("data blocks built"),
            system.as_mut().expect("ILP system created"),
            cache.miss_penalty,
            &config,
        );
        Ok(())
    }
}

struct BranchConstraintsBuilder;

impl Processor for BranchConstraintsBuilder {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::BranchConstraintsBuilder",
            requires: &[ASSIGNED_VARS, BRANCH_CATEGORY, DOMINANCE],
            provides: &[BRANCH_SUPPORT],
            invalidates: &[],
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        let bht = ws
            .hardware
            .bht
            .clone()
            .ok_or(AnalysisError::UnsupportedFeature("BHT configuration"))?;
        let config = ipet_config(ws);
        let Workspace { cfgs, doms, system, .. } = ws;
        ipet::build_branch_constraints(
            cfgs.as_mut().expect("collection present"),
            doms,
            system.as_mut().expect("ILP system created"),
            &bht,
            &config,
        );
        Ok(())
    }
}

struct EventBuilder;

impl Processor for EventBuilder {
    fn desc(&self) -> &'static ProcDesc {
        static DESC: ProcDesc = ProcDesc {
            name: "timebound::EventBuilder",
            requires: &[COLLECTED_CFG],
            provides: &[EVENTS],
            invalidates: &[],
        };
        &DESC
    }

    fn process(&mut self, ws: &mut Workspace) -> Result<()> {
        let icache = ws.hardware.caches.inst.clone();
        let dcache = ws.hardware.caches.data.clone();
        let bht = ws.hardware.bht.clone();
        let Workspace { cfgs, lbsets, data, .. } = ws;
        crate::events::build_events(
            cfgs.as_mut().expect("collection present"),
            lbsets.as_deref(),
            icache.as_ref(),
            data.as_ref(),
            dcache.as_ref(),
            bht.as_ref(),
        );
        Ok(())
    }
}

/// Run every pass up to the assembled ILP system: transforms per
/// configuration, the cache and branch analyses the hardware supports, and
/// the IPET constraint assembly.
pub fn assemble(ws: &mut Workspace, registry: &Registry) -> Result<()> {
    registry.require(ws, COLLECTED_CFG)?;
    if ws.config.get(workspace::do_virtualize()).copied().unwrap_or(true) {
        registry.require(ws, VIRTUALIZED_CFG)?;
    }
    if ws.config.has(workspace::cfg_start()) {
        registry.require(ws, SPLIT_CFG)?;
    }
    if ws.config.get_or_default(workspace::do_restructure()) {
        registry.require(ws, RESTRUCTURED_CFG)?;
    }
    registry.require(ws, LOOP_BOUNDS)?;
    if ws.config.get_or_default(workspace::do_unroll()) {
        registry.require(ws, UNROLLED_LOOPS)?;
    }
    registry.require(ws, DOMINANCE)?;
    registry.require(ws, LOOP_INFO)?;

    let has_icache = ws.hardware.caches.inst.is_some();
    let has_dcache = ws.hardware.caches.data.is_some();
    let has_bht = ws.hardware.bht.is_some();
    if has_icache {
        registry.require(ws, ICACHE_CATEGORY)?;
    }
    if has_dcache {
        registry.require(ws, DCACHE_CATEGORY)?;
        if ws.hardware.caches.data.as_ref().map(|c| c.write)
            == Some(crate::hard::WritePolicy::WriteBack)
        {
            registry.require(ws, PURGE)?;
        }
    }
    if has_bht {
        registry.require(ws, BRANCH_CATEGORY)?;
    }

    registry.require(ws, ASSIGNED_VARS)?;
    registry.require(ws, CONTROL_CONSTRAINTS)?;
    registry.require(ws, FLOW_FACT_CONSTRAINTS)?;
    registry.require(ws, OBJECT_FUNCTION)?;
    if has_icache {
        registry.require(ws, ICACHE_SUPPORT)?;
    }
    if has_dcache {
        registry.require(ws, DCACHE_SUPPORT)?;
    }
    if has_bht {
        registry.require(ws, BRANCH_SUPPORT)?;
    }
    registry.require(ws, EVENTS)?;
    Ok(())
}

/// Assemble and solve: the WCET driver.
pub fn run_wcet(ws: &mut Workspace, registry: &Registry, solver: &dyn Solver) -> Result<u64> {
    assemble(ws, registry)?;
    let wcet = ipet::compute_wcet(ws.system.as_mut().expect("ILP system built"), solver)?;
    ws.props.set(ipet::wcet(), wcet);
    ws.mark_provided(WCET);
    Ok(wcet)
}
