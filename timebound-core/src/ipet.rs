//! IPET Assembly
//!
//! Implicit Path Enumeration: every block and edge becomes an integer flow
//! variable, structural and flow-fact constraints tie them together, cache
//! misses and branch mispredictions get bounded counter variables, and the
//! objective maximizes the accumulated execution time. The assembly runs in
//! fixed passes:
//!
//! 1. variable assignment;
//! 2. structural flow constraints (entry count, Kirchhoff law);
//! 3. loop-bound flow facts;
//! 4. block-time objective;
//! 5. cache constraints from the access categories;
//! 6. branch-prediction constraints;
//! 7. external solving.

use crate::branch::{branch_category, BranchCategory};
use crate::cache::dcache::DataBlocks;
use crate::cache::lblock::LBlockSet;
use crate::cache::purge::Purge;
use crate::cache::Category;
use crate::cfg::dominance::DomInfo;
use crate::cfg::{BlockId, CfgCollection, CfgId, EdgeKind, ENTRY, EXIT, UNKNOWN};
use crate::error::{AnalysisError, Result};
use crate::flowfacts::max_iteration;
use crate::hard::{Bht, DefaultPrediction};
use crate::ilp::{Comp, Constraint, IlpSystem, Solver, VarId, VarKind};
use crate::prop::PropId;

/// Flow variable of a block or edge.
pub fn var() -> PropId<VarId> {
    PropId::of("timebound::var")
}

/// Edge flow variable.
pub fn edge_var() -> PropId<VarId> {
    PropId::of("timebound::edge_var")
}

/// Static execution time of a block, in cycles.
pub fn time() -> PropId<u64> {
    PropId::of("timebound::time")
}

/// Misprediction counter variable of a conditional block.
pub fn misspred_var() -> PropId<VarId> {
    PropId::of("timebound::misspred_var")
}

/// The computed WCET, on the workspace.
pub fn wcet() -> PropId<u64> {
    PropId::of("timebound::wcet")
}

/// Assembly options.
#[derive(Debug, Clone)]
pub struct IpetConfig {
    /// Generate human-readable variable names.
    pub explicit: bool,
    /// Trivial per-instruction time used when a block carries no `TIME`
    /// annotation.
    pub time_per_inst: u64,
}

impl Default for IpetConfig {
    fn default() -> Self {
        IpetConfig { explicit: false, time_per_inst: 5 }
    }
}

/// Pass 1: one integer counter per block and per edge.
pub fn assign_vars(coll: &mut CfgCollection, sys: &mut IlpSystem, config: &IpetConfig) {
    for c in 0..coll.count() {
        let cfg = coll.get_mut(c);
        for b in 0..cfg.blocks.len() {
            let name = config
                .explicit
                .then(|| format!("x_b{}_{}", c, b));
            let v = sys.new_var(name, VarKind::Int);
            cfg.blocks[b].props.set(var(), v);
        }
        for e in 0..cfg.edges.len() {
            let name = config.explicit.then(|| {
                let edge = &cfg.edges[e];
                format!("x_e{}_{}_{}", c, edge.source, edge.sink)
            });
            let v = sys.new_var(name, VarKind::Int);
            cfg.edges[e].props.set(edge_var(), v);
        }
    }
}

pub fn block_var(coll: &CfgCollection, c: CfgId, b: BlockId) -> VarId {
    *coll.get(c).block(b).props.get(var()).expect("vars assigned")
}

pub fn edge_var_of(coll: &CfgCollection, c: CfgId, e: u32) -> VarId {
    *coll
        .get(c)
        .edge(e)
        .props
        .get(edge_var())
        .expect("vars assigned")
}

/// Pass 2: entry counts and the Kirchhoff law at every block.
pub fn build_structural(coll: &CfgCollection, sys: &mut IlpSystem) {
    // the task runs exactly once
    let mut entry = Constraint::new("task entry", Comp::Eq, 1.0);
    entry.add_lhs(1.0, block_var(coll, 0, ENTRY));
    sys.add(entry);

    // a kept callee runs once per call
    for (c, cfg) in coll.iter() {
        if c != 0 {
            let mut cons = Constraint::new(format!("calls of {}", cfg.label), Comp::Eq, 0.0);
            cons.add_lhs(1.0, block_var(coll, c, ENTRY));
            for (cc, caller) in coll.iter() {
                for block in &caller.blocks {
                    if block.callee() == Some(c) {
                        cons.add_rhs(1.0, block_var(coll, cc, block.id));
                    }
                }
            }
            sys.add(cons);
        }
    }

    for (c, cfg) in coll.iter() {
        for block in &cfg.blocks {
            let xv = block_var(coll, c, block.id);
            if block.id != ENTRY && !block.ins.is_empty() {
                let mut cons = Constraint::new("flow in", Comp::Eq, 0.0);
                cons.add_lhs(1.0, xv);
                for &e in &block.ins {
                    cons.add_rhs(1.0, edge_var_of(coll, c, e));
                }
                sys.add(cons);
            }
            if !matches!(block.id, EXIT | UNKNOWN) && !block.outs.is_empty() {
                let mut cons = Constraint::new("flow out", Comp::Eq, 0.0);
                cons.add_lhs(1.0, xv);
                for &e in &block.outs {
                    cons.add_rhs(1.0, edge_var_of(coll, c, e));
                }
                sys.add(cons);
            }
        }
    }
}

/// Pass 3: loop bounds. Every header must carry `MAX_ITERATION`; the back
/// edges then iterate at most `N` times per loop entry.
pub fn build_flow_facts(coll: &CfgCollection, doms: &[DomInfo], sys: &mut IlpSystem) -> Result<()> {
    for (c, cfg) in coll.iter() {
        let dom = &doms[c as usize];
        for block in &cfg.blocks {
            if !dom.is_header(block.id) {
                continue;
            }
            let backs: Vec<u32> = dom.back_edges_of(cfg, block.id).collect();
            if backs.is_empty() {
                continue;
            }
            let bound = match block.props.get(max_iteration()) {
                Some(&n) => n,
                None => {
                    return Err(AnalysisError::FlowFactMissing(
                        block.address().unwrap_or(cfg.address),
                    ))
                }
            };
            let mut cons = Constraint::new(
                format!("loop 0x{:08X} bound", block.address().unwrap_or(0)),
                Comp::Le,
                0.0,
            );
            for e in backs {
                cons.add_lhs(1.0, edge_var_of(coll, c, e));
            }
            for e in dom.entry_edges(cfg, block.id) {
                cons.add_rhs(bound as f64, edge_var_of(coll, c, e));
            }
            sys.add(cons);
        }
    }
    Ok(())
}

/// Pass 4: the block-time objective. Blocks without a `TIME` annotation get
/// the trivial per-instruction default, and the annotation is recorded.
pub fn build_objective(coll: &mut CfgCollection, sys: &mut IlpSystem, config: &IpetConfig) {
    for c in 0..coll.count() {
        let cfg = coll.get_mut(c);
        for b in 0..cfg.blocks.len() {
            let block = &mut cfg.blocks[b];
            if !block.is_basic() {
                continue;
            }
            let t = match block.props.get(time()) {
                Some(&t) => t,
                None => {
                    let t = block.insts().len() as u64 * config.time_per_inst;
                    block.props.set(time(), t);
                    t
                }
            };
            let xv = *block.props.get(var()).expect("vars assigned");
            sys.add_objective(t as f64, xv);
        }
    }
}

/// Emit the miss-count constraints of one categorized access.
fn miss_constraints(
    coll: &CfgCollection,
    doms: &[DomInfo],
    sys: &mut IlpSystem,
    c: CfgId,
    b: BlockId,
    category: Category,
    x_miss: VarId,
    what: &str,
) {
    let xb = block_var(coll, c, b);
    match category {
        Category::AlwaysHit => {
            let mut cons = Constraint::new(format!("{} always-hit", what), Comp::Eq, 0.0);
            cons.add_lhs(1.0, x_miss);
            sys.add(cons);
        }
        Category::AlwaysMiss => {
            let mut cons = Constraint::new(format!("{} always-miss", what), Comp::Eq, 0.0);
            cons.add_lhs(1.0, x_miss).add_rhs(1.0, xb);
            sys.add(cons);
        }
        Category::FirstMiss(h) => {
            let cfg = coll.get(c);
            let mut cons = Constraint::new(format!("{} first-miss", what), Comp::Le, 0.0);
            cons.add_lhs(1.0, x_miss);
            for e in doms[c as usize].entry_edges(cfg, h) {
                cons.add_rhs(1.0, edge_var_of(coll, c, e));
            }
            sys.add(cons);
            let mut cap = Constraint::new(format!("{} miss cap", what), Comp::Le, 0.0);
            cap.add_lhs(1.0, x_miss).add_rhs(1.0, xb);
            sys.add(cap);
        }
        Category::FirstHit | Category::NotClassified => {
            let mut cons = Constraint::new(format!("{} miss cap", what), Comp::Le, 0.0);
            cons.add_lhs(1.0, x_miss).add_rhs(1.0, xb);
            sys.add(cons);
        }
    }
}

/// Pass 5a: instruction-cache constraints. Linked L-blocks share their
/// leader's miss variable; only the leader contributes constraints and
/// objective weight.
pub fn build_icache_constraints(
    coll: &CfgCollection,
    doms: &[DomInfo],
    lbsets: &mut [LBlockSet],
    sys: &mut IlpSystem,
    penalty: u64,
    config: &IpetConfig,
) {
    for lbset in lbsets.iter_mut() {
        for i in 0..lbset.lblocks.len() {
            if lbset.lblocks[i].linked_to_prev {
                let prev = lbset.lblocks[i - 1].miss_var;
                lbset.lblocks[i].miss_var = prev;
                continue;
            }
            let lb = &lbset.lblocks[i];
            let name = config
                .explicit
                .then(|| format!("x_miss_{:08X}_{}", lb.address, lb.id));
            let x_miss = sys.new_var(name, VarKind::Int);
            let (c, b, cat, addr) = (lb.cfg, lb.block, lb.category, lb.address);
            miss_constraints(
                coll,
                doms,
                sys,
                c,
                b,
                cat,
                x_miss,
                &format!("ifetch 0x{:08X}", addr),
            );
            sys.add_objective(penalty as f64, x_miss);
            lbset.lblocks[i].miss_var = Some(x_miss);
        }
    }
}

/// Pass 5b: data-cache constraints, with the write-back purge latency
/// folded into the penalty of each access.
pub fn build_dcache_constraints(
    coll: &CfgCollection,
    doms: &[DomInfo],
    data: &mut DataBlocks,
    sys: &mut IlpSystem,
    penalty: u64,
    config: &IpetConfig,
) {
    let keys: Vec<(CfgId, BlockId)> = data.accesses.keys().copied().collect();
    for (c, b) in keys {
        let list = data.accesses.get_mut(&(c, b)).unwrap();
        for i in 0..list.len() {
            let acc = &list[i];
            let name = config
                .explicit
                .then(|| format!("x_dmiss_{:08X}_{}", acc.inst.address, i));
            let x_miss = sys.new_var(name, VarKind::Int);
            let cat = acc.category;
            let addr = acc.inst.address;
            let cost = penalty
                + match acc.purge {
                    Purge::Invalid | Purge::No => 0,
                    _ => acc.purge_time,
                };
            list[i].miss_var = Some(x_miss);
            miss_constraints(
                coll,
                doms,
                sys,
                c,
                b,
                cat,
                x_miss,
                &format!("dmem 0x{:08X}", addr),
            );
            sys.add_objective(cost as f64, x_miss);
        }
    }
}

/// Pass 6: branch-prediction constraints, one misprediction counter per
/// classified conditional block.
pub fn build_branch_constraints(
    coll: &mut CfgCollection,
    doms: &[DomInfo],
    sys: &mut IlpSystem,
    bht: &Bht,
    config: &IpetConfig,
) {
    for c in 0..coll.count() {
        for b in 0..coll.get(c).blocks.len() as u32 {
            let cat = match coll.get(c).block(b).props.get(branch_category()) {
                Some(&cat) => cat,
                None => continue,
            };
            let ctrl = match coll.get(c).block(b).control() {
                Some(i) => i.clone(),
                None => continue,
            };
            let name = config.explicit.then(|| format!("x_mp{}_{}", c, b));
            let x_mp = sys.new_var(name, VarKind::Int);

            let xb = block_var(coll, c, b);
            let taken: Vec<VarId> = coll
                .get(c)
                .out_edges(b)
                .filter(|e| e.kind == EdgeKind::Taken)
                .map(|e| edge_var_of(coll, c, e.id))
                .collect();
            let not_taken: Vec<VarId> = coll
                .get(c)
                .out_edges(b)
                .filter(|e| e.kind == EdgeKind::NotTaken)
                .map(|e| edge_var_of(coll, c, e.id))
                .collect();

            match cat {
                BranchCategory::AlwaysDefault => {
                    // every occurrence against the default direction
                    // mispredicts
                    let default = match ctrl.target {
                        Some(t) => bht.actual_default(ctrl.address, t),
                        None => DefaultPrediction::NotTaken,
                    };
                    let against = if default == DefaultPrediction::NotTaken {
                        &taken
                    } else {
                        &not_taken
                    };
                    let mut cons =
                        Constraint::new("always-default misprediction", Comp::Eq, 0.0);
                    cons.add_lhs(1.0, x_mp);
                    for &e in against {
                        cons.add_rhs(1.0, e);
                    }
                    sys.add(cons);
                }
                BranchCategory::AlwaysHit => {
                    for (dir, edges) in [("taken", &taken), ("not-taken", &not_taken)] {
                        let mut cons = Constraint::new(
                            format!("always-hit misprediction vs {}", dir),
                            Comp::Le,
                            2.0,
                        );
                        cons.add_lhs(1.0, x_mp);
                        for &e in edges {
                            cons.add_rhs(2.0, e);
                        }
                        sys.add(cons);
                    }
                    let mut cap = Constraint::new("misprediction cap", Comp::Le, 0.0);
                    cap.add_lhs(1.0, x_mp).add_rhs(1.0, xb);
                    sys.add(cap);
                }
                BranchCategory::FirstUnknown(h) => {
                    let entries: Vec<VarId> = doms[c as usize]
                        .entry_edges(coll.get(c), h)
                        .map(|e| edge_var_of(coll, c, e))
                        .collect();
                    for (dir, edges) in [("taken", &taken), ("not-taken", &not_taken)] {
                        let mut cons = Constraint::new(
                            format!("first-unknown misprediction vs {}", dir),
                            Comp::Le,
                            0.0,
                        );
                        cons.add_lhs(1.0, x_mp);
                        for &e in edges {
                            cons.add_rhs(2.0, e);
                        }
                        for &e in &entries {
                            cons.add_rhs(2.0, e);
                        }
                        sys.add(cons);
                    }
                    let mut cap = Constraint::new("misprediction cap", Comp::Le, 0.0);
                    cap.add_lhs(1.0, x_mp).add_rhs(1.0, xb);
                    sys.add(cap);
                }
                BranchCategory::NotClassified => {
                    let mut cons = Constraint::new("misprediction cap", Comp::Le, 0.0);
                    cons.add_lhs(1.0, x_mp).add_rhs(1.0, xb);
                    sys.add(cons);
                }
            }

            let penalty = if ctrl.target.is_none() {
                bht.cond_indirect_penalty
            } else {
                bht.cond_penalty
            };
            sys.add_objective(penalty as f64, x_mp);
            coll.get_mut(c).block_mut(b).props.set(misspred_var(), x_mp);
        }
    }
}

/// Pass 7: hand the system to the solver; the objective value is the WCET.
pub fn compute_wcet(sys: &mut IlpSystem, solver: &dyn Solver) -> Result<u64> {
    log::info!(
        "launching ILP solver {} on {} variables, {} constraints",
        solver.name(),
        sys.count_vars(),
        sys.count_constraints()
    );
    let objective = solver.solve(sys)?;
    let wcet = objective.round();
    if wcet < 0.0 {
        return Err(AnalysisError::Solver(format!(
            "negative objective {}",
            objective
        )));
    }
    log::info!("WCET = {} cycles", wcet as u64);
    Ok(wcet as u64)
}
