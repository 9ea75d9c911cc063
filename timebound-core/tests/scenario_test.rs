//! End-to-end scenarios: program in, assembled ILP system out, checked
//! against hand-computed worst-case paths.

mod utils;

use timebound_core::cache::Category;
use timebound_core::cfg::{Cfg, CfgCollection, EdgeKind, ENTRY, EXIT};
use timebound_core::error::AnalysisError;
use timebound_core::ilp::Solver;
use timebound_core::ipet;
use timebound_core::proc::{self, Registry};
use timebound_core::prog::ProgramBuilder;
use timebound_core::workspace;
use timebound_core::Workspace;
use utils::*;

fn bvar(ws: &Workspace, cfg: u32, b: u32) -> timebound_core::ilp::VarId {
    *ws.cfgs
        .as_ref()
        .unwrap()
        .get(cfg)
        .block(b)
        .props
        .get(ipet::var())
        .expect("block var")
}

fn evar(ws: &Workspace, cfg: u32, src: u32, dst: u32) -> timebound_core::ilp::VarId {
    let g = ws.cfgs.as_ref().unwrap().get(cfg);
    let edge = g
        .edges
        .iter()
        .find(|e| e.source == src && e.sink == dst)
        .expect("edge");
    *edge.props.get(ipet::edge_var()).expect("edge var")
}

/// S2: two straight-line runs of four instructions each, cache off.
/// 8 instructions at 5 cycles each: WCET = 40.
#[test]
fn test_s2_sequential_blocks() {
    let mut program = ProgramBuilder::new(0x2000).segment(".text", 0x2000);
    for i in 0..7 {
        program = program.push(alu(0x2000 + i * 4));
    }
    let program = program.push(ret(0x201c)).build();

    let mut ws = Workspace::new(program, Default::default(), Default::default());
    let registry = Registry::standard();
    proc::assemble(&mut ws, &registry).unwrap();

    let body = ws.cfgs.as_ref().unwrap().entry_cfg().block_at(0x2000).unwrap();
    let mut solver = CheckSolver::new();
    solver
        .set(bvar(&ws, 0, ENTRY), 1.0)
        .set(bvar(&ws, 0, body), 1.0)
        .set(bvar(&ws, 0, EXIT), 1.0)
        .set(evar(&ws, 0, ENTRY, body), 1.0)
        .set(evar(&ws, 0, body, EXIT), 1.0);
    let wcet = ipet::compute_wcet(ws.system.as_mut().unwrap(), &solver).unwrap();
    assert_eq!(wcet, 40);
}

/// S1 CFG: a single two-instruction loop block, branching back to itself.
fn s1_workspace() -> Workspace {
    let mut cfg = Cfg::new("task", 0x1000);
    let body = cfg.add_basic(vec![
        std::sync::Arc::new(alu(0x1000)),
        std::sync::Arc::new(cond_br(0x1004, 0x1000)),
    ]);
    cfg.add_edge(ENTRY, body, EdgeKind::Virtual);
    cfg.add_edge(body, body, EdgeKind::Taken);
    cfg.add_edge(body, EXIT, EdgeKind::NotTaken);

    let hardware = with_icache(cache(2, 1, 4, 10));
    let mut ws = Workspace::new(Default::default(), hardware, Default::default());
    ws.flow_facts.loops.insert(0x1000, 10);
    ws.cfgs = Some(CfgCollection { cfgs: vec![cfg] });
    ws.mark_provided(proc::COLLECTED_CFG);
    ws.config.set(workspace::do_virtualize(), false);
    ws
}

/// S1: single loop over a direct-mapped cache. Both fetch lines are
/// persistent: one miss each at loop entry, every other fetch hits.
/// WCET = 10 iterations x 10 cycles + 2 misses x 10 = 120.
#[test]
fn test_s1_single_loop_direct_mapped() {
    let mut ws = s1_workspace();
    let registry = Registry::standard();
    proc::assemble(&mut ws, &registry).unwrap();

    // both l-blocks classified first-miss at the loop header
    let lbsets = ws.lbsets.as_ref().unwrap();
    let body = ws.cfgs.as_ref().unwrap().entry_cfg().block_at(0x1000).unwrap();
    let mut miss_vars = Vec::new();
    for lbset in lbsets {
        for lb in &lbset.lblocks {
            assert_eq!(lb.category, Category::FirstMiss(body), "lblock 0x{:08X}", lb.address);
            miss_vars.push(lb.miss_var.unwrap());
        }
    }
    assert_eq!(miss_vars.len(), 2);

    // worst case: 10 executions of the body, one miss per line
    let mut solver = CheckSolver::new();
    solver
        .set(bvar(&ws, 0, ENTRY), 1.0)
        .set(bvar(&ws, 0, body), 10.0)
        .set(bvar(&ws, 0, EXIT), 1.0)
        .set(evar(&ws, 0, ENTRY, body), 1.0)
        .set(evar(&ws, 0, body, body), 9.0)
        .set(evar(&ws, 0, body, EXIT), 1.0);
    for v in miss_vars {
        solver.set(v, 1.0);
    }
    let wcet = ipet::compute_wcet(ws.system.as_mut().unwrap(), &solver).unwrap();
    assert_eq!(wcet, 120);
}

/// A loop without any flow-fact bound fails the whole analysis.
#[test]
fn test_unbounded_loop_is_fatal() {
    let mut ws = s1_workspace();
    ws.flow_facts.loops.clear();
    let registry = Registry::standard();
    assert!(matches!(
        proc::assemble(&mut ws, &registry),
        Err(AnalysisError::FlowFactMissing(0x1000))
    ));
}

/// `MAX_ITERATION = 0`: the ILP forces every edge inside the loop to zero.
#[test]
fn test_zero_bound_forces_empty_loop() {
    let mut ws = s1_workspace();
    ws.flow_facts.loops.insert(0x1000, 0);
    let registry = Registry::standard();
    proc::assemble(&mut ws, &registry).unwrap();

    let body = ws.cfgs.as_ref().unwrap().entry_cfg().block_at(0x1000).unwrap();
    // the back edge cannot be taken at all; one pass through the body
    // remains feasible
    let mut solver = CheckSolver::new();
    solver
        .set(bvar(&ws, 0, ENTRY), 1.0)
        .set(bvar(&ws, 0, body), 1.0)
        .set(bvar(&ws, 0, EXIT), 1.0)
        .set(evar(&ws, 0, ENTRY, body), 1.0)
        .set(evar(&ws, 0, body, EXIT), 1.0);
    for lbset in ws.lbsets.as_ref().unwrap() {
        for lb in &lbset.lblocks {
            solver.set(lb.miss_var.unwrap(), 1.0);
        }
    }
    assert!(ipet::compute_wcet(ws.system.as_mut().unwrap(), &solver).is_ok());

    // taking the back edge violates the zero bound
    let mut bad = CheckSolver::new();
    bad.set(bvar(&ws, 0, ENTRY), 1.0)
        .set(bvar(&ws, 0, body), 2.0)
        .set(bvar(&ws, 0, EXIT), 1.0)
        .set(evar(&ws, 0, ENTRY, body), 1.0)
        .set(evar(&ws, 0, body, body), 1.0)
        .set(evar(&ws, 0, body, EXIT), 1.0);
    for lbset in ws.lbsets.as_ref().unwrap() {
        for lb in &lbset.lblocks {
            bad.set(lb.miss_var.unwrap(), 1.0);
        }
    }
    assert!(matches!(
        bad.solve(ws.system.as_mut().unwrap()),
        Err(AnalysisError::Solver(_))
    ));
}

/// S3: nested loops; the inner body's line survives inner iterations but
/// not outer ones: first-miss at the inner header.
#[test]
fn test_s3_nested_persistence() {
    let mut cfg = Cfg::new("task", 0x100);
    let h1 = cfg.add_basic(vec![std::sync::Arc::new(alu(0x100))]);
    let h2 = cfg.add_basic(vec![std::sync::Arc::new(alu(0x104))]);
    let b = cfg.add_basic(vec![std::sync::Arc::new(alu(0x108))]);
    cfg.add_edge(ENTRY, h1, EdgeKind::Virtual);
    cfg.add_edge(h1, h2, EdgeKind::NotTaken);
    cfg.add_edge(h2, b, EdgeKind::NotTaken);
    cfg.add_edge(b, h2, EdgeKind::Taken);
    cfg.add_edge(h2, h1, EdgeKind::Taken);
    cfg.add_edge(h1, EXIT, EdgeKind::Taken);

    // one set, two ways: h2 and b fit, h1 evicts across outer iterations
    let hardware = with_icache(cache(1, 2, 4, 10));
    let mut ws = Workspace::new(Default::default(), hardware, Default::default());
    ws.flow_facts.loops.insert(0x100, 5);
    ws.flow_facts.loops.insert(0x104, 3);
    ws.cfgs = Some(CfgCollection { cfgs: vec![cfg] });
    ws.mark_provided(proc::COLLECTED_CFG);
    ws.config.set(workspace::do_virtualize(), false);

    let registry = Registry::standard();
    proc::assemble(&mut ws, &registry).unwrap();

    let lbsets = ws.lbsets.as_ref().unwrap();
    let lb_b = lbsets[0]
        .lblocks
        .iter()
        .find(|lb| lb.address == 0x108)
        .unwrap();
    assert_eq!(lb_b.category, Category::FirstMiss(h2));
    let lb_h1 = lbsets[0]
        .lblocks
        .iter()
        .find(|lb| lb.address == 0x100)
        .unwrap();
    assert_ne!(lb_h1.category, Category::AlwaysHit);

    // worst case: 5 outer x 3 inner iterations, one miss of X per inner
    // entry (5 entries): x_miss(b) = 5 <= 5 x 3 = x_b
    let mut solver = CheckSolver::new();
    solver
        .set(bvar(&ws, 0, ENTRY), 1.0)
        .set(bvar(&ws, 0, EXIT), 1.0)
        .set(bvar(&ws, 0, h1), 6.0)
        .set(bvar(&ws, 0, h2), 20.0)
        .set(bvar(&ws, 0, b), 15.0)
        .set(evar(&ws, 0, ENTRY, h1), 1.0)
        .set(evar(&ws, 0, h1, h2), 5.0)
        .set(evar(&ws, 0, h2, b), 15.0)
        .set(evar(&ws, 0, b, h2), 15.0)
        .set(evar(&ws, 0, h2, h1), 5.0)
        .set(evar(&ws, 0, h1, EXIT), 1.0);
    // miss counters at their per-category upper bounds
    for lb in &lbsets[0].lblocks {
        let v = lb.miss_var.unwrap();
        match (lb.address, lb.category) {
            (0x108, Category::FirstMiss(_)) => solver.set(v, 5.0),
            (_, Category::AlwaysMiss) => {
                let owner = match lb.address {
                    0x100 => 6.0,
                    0x104 => 20.0,
                    _ => 15.0,
                };
                solver.set(v, owner)
            }
            (_, Category::FirstMiss(_)) => solver.set(v, 5.0),
            (_, Category::NotClassified) => solver.set(v, 1.0),
            (_, Category::AlwaysHit) => solver.set(v, 0.0),
            _ => &mut solver,
        };
    }
    assert!(ipet::compute_wcet(ws.system.as_mut().unwrap(), &solver).is_ok());
}

/// S4: an indirect call keeps an unresolved synthetic block; the system
/// stays structurally consistent.
#[test]
fn test_s4_indirect_call() {
    let program = ProgramBuilder::new(0x400)
        .segment(".text", 0x400)
        .push(indirect_call(0x400))
        .push(ret(0x404))
        .build();
    let mut ws = Workspace::new(program, Default::default(), Default::default());
    let registry = Registry::standard();
    proc::assemble(&mut ws, &registry).unwrap();

    let cfg = ws.cfgs.as_ref().unwrap().entry_cfg();
    let synth = cfg
        .blocks
        .iter()
        .find(|b| b.is_synth())
        .expect("synthetic block survives virtualization");
    assert_eq!(synth.callee(), None);

    // one pass through the call is feasible
    let caller = cfg.block_at(0x400).unwrap();
    let cont = cfg.block_at(0x404).unwrap();
    let sid = synth.id;
    let mut solver = CheckSolver::new();
    solver
        .set(bvar(&ws, 0, ENTRY), 1.0)
        .set(bvar(&ws, 0, caller), 1.0)
        .set(bvar(&ws, 0, sid), 1.0)
        .set(bvar(&ws, 0, cont), 1.0)
        .set(bvar(&ws, 0, EXIT), 1.0)
        .set(evar(&ws, 0, ENTRY, caller), 1.0)
        .set(evar(&ws, 0, caller, sid), 1.0)
        .set(evar(&ws, 0, sid, cont), 1.0)
        .set(evar(&ws, 0, cont, EXIT), 1.0);
    let wcet = ipet::compute_wcet(ws.system.as_mut().unwrap(), &solver).unwrap();
    assert_eq!(wcet, 10);
}

/// S5: a self-recursive function is inlined once; the second call stays as
/// a synthetic flagged as a recursive frontier.
#[test]
fn test_s5_recursion_frontier() {
    let program = ProgramBuilder::new(0x500)
        .segment(".text", 0x500)
        .push(cond_br(0x500, 0x50c))
        .push(call(0x504, 0x500))
        .push(ret(0x508))
        .push(ret(0x50c))
        .build();
    let mut ws = Workspace::new(program, Default::default(), Default::default());
    let registry = Registry::standard();
    proc::assemble(&mut ws, &registry).unwrap();

    let cfg = ws.cfgs.as_ref().unwrap().entry_cfg();
    let synth = cfg
        .blocks
        .iter()
        .find(|b| b.is_synth())
        .expect("recursive call survives");
    assert!(synth
        .props
        .get_or_default(timebound_core::cfg::virtualize::recursive_loop()));
    assert_eq!(synth.callee(), Some(0));
}

/// S6: sub-CFG extraction through the configuration keys. The start
/// address splits its block, the side path misses the stop and is dropped,
/// and the stop block's predecessors reach the exit directly.
#[test]
fn test_s6_sub_cfg_extraction() {
    let mut program = ProgramBuilder::new(0x2ff0).segment(".text", 0x2ff0);
    for i in 0..8 {
        program = program.push(alu(0x2ff0 + i * 4));
    }
    let program = program
        .push(cond_br(0x3010, 0x3030))
        .push(alu(0x3014))
        .push(branch(0x3018, 0x3040))
        .push(ret(0x3030))
        .push(ret(0x3040))
        .build();
    let mut ws = Workspace::new(program, Default::default(), Default::default());
    ws.config.set(workspace::cfg_start(), 0x3000u32);
    ws.config.set(workspace::cfg_stop(), vec![0x3040u32]);
    let registry = Registry::standard();
    proc::assemble(&mut ws, &registry).unwrap();

    let cfg = ws.cfgs.as_ref().unwrap().entry_cfg();
    // start block split at 0x3000: nothing before it survives
    let first = cfg
        .blocks
        .iter()
        .filter(|b| b.is_basic())
        .map(|b| b.address().unwrap())
        .min()
        .unwrap();
    assert_eq!(first, 0x3000);
    // the side path at 0x3030 never reaches the stop: dropped
    assert!(cfg.blocks.iter().all(|b| b.address() != Some(0x3030)));
    // the stop is exclusive
    assert!(cfg
        .blocks
        .iter()
        .flat_map(|b| b.insts())
        .all(|i| i.address < 0x3040));

    // the kept path runs once: 5 + 2 instructions at 5 cycles
    let head = cfg.block_at(0x3000).unwrap();
    let tail = cfg.block_at(0x3014).unwrap();
    let mut solver = CheckSolver::new();
    solver
        .set(bvar(&ws, 0, ENTRY), 1.0)
        .set(bvar(&ws, 0, head), 1.0)
        .set(bvar(&ws, 0, tail), 1.0)
        .set(bvar(&ws, 0, EXIT), 1.0)
        .set(evar(&ws, 0, ENTRY, head), 1.0)
        .set(evar(&ws, 0, head, tail), 1.0)
        .set(evar(&ws, 0, tail, EXIT), 1.0);
    let wcet = ipet::compute_wcet(ws.system.as_mut().unwrap(), &solver).unwrap();
    assert_eq!(wcet, 35);
}

/// Invariant: after an inline-everything virtualization, no reachable
/// synthetic block with a known non-recursive callee remains.
#[test]
fn test_virtualization_leaves_no_inlinable_synth() {
    let program = ProgramBuilder::new(0x600)
        .segment(".text", 0x600)
        .push(call(0x600, 0x610))
        .push(ret(0x604))
        .push(alu(0x608))
        .push(alu(0x60c))
        .push(ret(0x610))
        .build();
    let mut ws = Workspace::new(program, Default::default(), Default::default());
    let registry = Registry::standard();
    registry.require(&mut ws, proc::VIRTUALIZED_CFG).unwrap();
    let task = ws.cfgs.as_ref().unwrap().entry_cfg();
    assert_eq!(
        timebound_core::cfg::virtualize::reachable_inlinable_synths(task),
        0
    );
}

/// A conditional branch alone in its BHT row gets the always-hit
/// misprediction bound: at most two mispredictions per direction plus two.
#[test]
fn test_branch_misprediction_bound() {
    let program = ProgramBuilder::new(0x1000)
        .segment(".text", 0x1000)
        .push(alu(0x1000))
        .push(cond_br(0x1004, 0x1000))
        .push(ret(0x1008))
        .build();
    let mut hardware = timebound_core::hard::HardwareConfig::default();
    hardware.bht = Some(bht(16, 3));
    let mut ws = Workspace::new(program, hardware, Default::default());
    ws.flow_facts.loops.insert(0x1000, 10);
    let registry = Registry::standard();
    proc::assemble(&mut ws, &registry).unwrap();

    let cfg = ws.cfgs.as_ref().unwrap().entry_cfg();
    let body = cfg.block_at(0x1000).unwrap();
    let ret_block = cfg.block_at(0x1008).unwrap();
    let x_mp = *cfg
        .block(body)
        .props
        .get(ipet::misspred_var())
        .expect("misprediction counter");

    let mut solver = CheckSolver::new();
    solver
        .set(bvar(&ws, 0, ENTRY), 1.0)
        .set(bvar(&ws, 0, body), 10.0)
        .set(bvar(&ws, 0, ret_block), 1.0)
        .set(bvar(&ws, 0, EXIT), 1.0)
        .set(evar(&ws, 0, ENTRY, body), 1.0)
        .set(evar(&ws, 0, body, body), 9.0)
        .set(evar(&ws, 0, body, ret_block), 1.0)
        .set(evar(&ws, 0, ret_block, EXIT), 1.0)
        .set(x_mp, 2.0);
    let wcet = ipet::compute_wcet(ws.system.as_mut().unwrap(), &solver).unwrap();
    // 10 x 10 + 5 for the return + 2 mispredictions x 3 cycles
    assert_eq!(wcet, 111);

    // four mispredictions overrun the not-taken bound (2 x 1 + 2)
    solver.set(x_mp, 5.0);
    assert!(solver.solve(ws.system.as_mut().unwrap()).is_err());
}

/// A loop branch whose BHT row is contested only from outside the loop is
/// first-unknown: mispredictions are bounded per loop entry, not per
/// execution.
#[test]
fn test_branch_first_unknown_bound() {
    let program = ProgramBuilder::new(0x1000)
        .segment(".text", 0x1000)
        .push(alu(0x1000))
        .push(cond_br(0x1004, 0x1000))
        .push(cond_br(0x1008, 0x1010))
        .push(ret(0x100c))
        .push(ret(0x1010))
        .build();
    let mut hardware = timebound_core::hard::HardwareConfig::default();
    // one row: both conditional branches alias
    hardware.bht = Some(bht(1, 3));
    let mut ws = Workspace::new(program, hardware, Default::default());
    ws.flow_facts.loops.insert(0x1000, 10);
    let registry = Registry::standard();
    proc::assemble(&mut ws, &registry).unwrap();

    let cfg = ws.cfgs.as_ref().unwrap().entry_cfg();
    let body = cfg.block_at(0x1000).unwrap();
    let tail = cfg.block_at(0x1008).unwrap();
    let taken_ret = cfg.block_at(0x1010).unwrap();
    assert_eq!(
        cfg.block(body).props.get(timebound_core::branch::branch_category()),
        Some(&timebound_core::branch::BranchCategory::FirstUnknown(body))
    );
    assert_eq!(
        cfg.block(tail).props.get(timebound_core::branch::branch_category()),
        Some(&timebound_core::branch::BranchCategory::NotClassified)
    );
    let x_mp = *cfg.block(body).props.get(ipet::misspred_var()).unwrap();
    let x_mp_tail = *cfg.block(tail).props.get(ipet::misspred_var()).unwrap();

    let mut solver = CheckSolver::new();
    solver
        .set(bvar(&ws, 0, ENTRY), 1.0)
        .set(bvar(&ws, 0, body), 10.0)
        .set(bvar(&ws, 0, tail), 1.0)
        .set(bvar(&ws, 0, taken_ret), 1.0)
        .set(bvar(&ws, 0, EXIT), 1.0)
        .set(evar(&ws, 0, ENTRY, body), 1.0)
        .set(evar(&ws, 0, body, body), 9.0)
        .set(evar(&ws, 0, body, tail), 1.0)
        .set(evar(&ws, 0, tail, taken_ret), 1.0)
        .set(evar(&ws, 0, taken_ret, EXIT), 1.0)
        // not-taken bound: 2 x 1 + 2 entry edges of the loop
        .set(x_mp, 4.0)
        .set(x_mp_tail, 1.0);
    let wcet = ipet::compute_wcet(ws.system.as_mut().unwrap(), &solver).unwrap();
    // 10 x 10 + two return-path instructions + (4 + 1) mispredictions x 3
    assert_eq!(wcet, 125);

    // one more misprediction overruns the per-entry bound
    solver.set(x_mp, 5.0);
    assert!(solver.solve(ws.system.as_mut().unwrap()).is_err());
}

/// Statistics survive a dump/reload cycle with identical tuples.
#[test]
fn test_stats_round_trip() {
    let mut program = ProgramBuilder::new(0x2000).segment(".text", 0x2000);
    for i in 0..3 {
        program = program.push(alu(0x2000 + i * 4));
    }
    let program = program.push(ret(0x200c)).build();
    let mut ws = Workspace::new(program, Default::default(), Default::default());
    let registry = Registry::standard();
    proc::assemble(&mut ws, &registry).unwrap();

    let body = ws.cfgs.as_ref().unwrap().entry_cfg().block_at(0x2000).unwrap();
    let mut solver = CheckSolver::new();
    solver
        .set(bvar(&ws, 0, ENTRY), 1.0)
        .set(bvar(&ws, 0, body), 1.0)
        .set(bvar(&ws, 0, EXIT), 1.0)
        .set(evar(&ws, 0, ENTRY, body), 1.0)
        .set(evar(&ws, 0, body, EXIT), 1.0);
    let wcet = ipet::compute_wcet(ws.system.as_mut().unwrap(), &solver).unwrap();
    ws.props.set(ipet::wcet(), wcet);

    let collectors = timebound_core::stats::standard();
    let mut buf = Vec::new();
    timebound_core::stats::write_stats(&ws, &collectors, &mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();
    let reloaded = timebound_core::stats::read_stats(&text).unwrap();

    let counts = reloaded
        .iter()
        .find(|(id, _)| id == "ipet/total_count")
        .map(|(_, r)| r.clone())
        .unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].address, 0x2000);
    assert_eq!(counts[0].size, 16);
    assert_eq!(counts[0].value, 1);

    let times = reloaded
        .iter()
        .find(|(id, _)| id == "ipet/total_time")
        .map(|(_, r)| r.clone())
        .unwrap();
    assert_eq!(times[0].value, 20);
}
