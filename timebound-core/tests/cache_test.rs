//! Data-cache classification, purge analysis, unrolling and event tests.

mod utils;

use timebound_core::cache::purge::Purge;
use timebound_core::cache::Category;
use timebound_core::cfg::unroll::unrolled_from;
use timebound_core::cfg::{Cfg, CfgCollection, EdgeKind, ENTRY, EXIT};
use timebound_core::events;
use timebound_core::hard::WritePolicy;
use timebound_core::ilp::VarId;
use timebound_core::ipet;
use timebound_core::proc::{self, Registry};
use timebound_core::prog::{MemTarget, ProgramBuilder};
use timebound_core::workspace;
use timebound_core::Workspace;
use utils::*;

fn bvar(ws: &Workspace, b: u32) -> VarId {
    *ws.cfgs
        .as_ref()
        .unwrap()
        .entry_cfg()
        .block(b)
        .props
        .get(ipet::var())
        .unwrap()
}

fn evar(ws: &Workspace, src: u32, dst: u32) -> VarId {
    let g = ws.cfgs.as_ref().unwrap().entry_cfg();
    let edge = g
        .edges
        .iter()
        .find(|e| e.source == src && e.sink == dst)
        .expect("edge");
    *edge.props.get(ipet::edge_var()).unwrap()
}

/// A load at a fixed address inside a loop is a first miss at the loop
/// header: one fill per loop entry.
#[test]
fn test_dcache_first_miss_in_loop() {
    let mut cfg = Cfg::new("task", 0x100);
    let body = cfg.add_basic(vec![
        std::sync::Arc::new(load(0x100, MemTarget::Addr(0x8000))),
        std::sync::Arc::new(cond_br(0x104, 0x100)),
    ]);
    cfg.add_edge(ENTRY, body, EdgeKind::Virtual);
    cfg.add_edge(body, body, EdgeKind::Taken);
    cfg.add_edge(body, EXIT, EdgeKind::NotTaken);

    let hardware = with_dcache(cache(1, 2, 16, 20));
    let mut ws = Workspace::new(Default::default(), hardware, Default::default());
    ws.flow_facts.loops.insert(0x100, 4);
    ws.cfgs = Some(CfgCollection { cfgs: vec![cfg] });
    ws.mark_provided(proc::COLLECTED_CFG);
    ws.config.set(workspace::do_virtualize(), false);

    let registry = Registry::standard();
    proc::assemble(&mut ws, &registry).unwrap();

    let body = ws.cfgs.as_ref().unwrap().entry_cfg().block_at(0x100).unwrap();
    let data = ws.data.as_ref().unwrap();
    let accs = data.of_block(0, body);
    assert_eq!(accs.len(), 1);
    assert_eq!(accs[0].category, Category::FirstMiss(body));
    let miss = accs[0].miss_var.unwrap();

    let mut solver = CheckSolver::new();
    solver
        .set(bvar(&ws, ENTRY), 1.0)
        .set(bvar(&ws, body), 4.0)
        .set(bvar(&ws, EXIT), 1.0)
        .set(evar(&ws, ENTRY, body), 1.0)
        .set(evar(&ws, body, body), 3.0)
        .set(evar(&ws, body, EXIT), 1.0)
        .set(miss, 1.0);
    let wcet = ipet::compute_wcet(ws.system.as_mut().unwrap(), &solver).unwrap();
    // 4 iterations x 2 instructions x 5 cycles + one 20-cycle fill
    assert_eq!(wcet, 60);
}

/// Write-back cache: a store makes its line dirty; a load evicting it must
/// write it back.
#[test]
fn test_purge_on_eviction() {
    let mut dcache = cache(1, 1, 16, 20);
    dcache.write = WritePolicy::WriteBack;

    let program = ProgramBuilder::new(0x200)
        .segment(".text", 0x200)
        .push({
            let mut i = load(0x200, MemTarget::Addr(0x8000));
            i.uops[0] = timebound_core::prog::MicroOp::Mem {
                store: true,
                target: MemTarget::Addr(0x8000),
            };
            i
        })
        .push(load(0x204, MemTarget::Addr(0x9000)))
        .push(ret(0x208))
        .build();

    let mut ws = Workspace::new(program, with_dcache(dcache), Default::default());
    let registry = Registry::standard();
    proc::assemble(&mut ws, &registry).unwrap();

    let cfg = ws.cfgs.as_ref().unwrap().entry_cfg();
    let body = cfg.block_at(0x200).unwrap();
    let accs = ws.data.as_ref().unwrap().of_block(0, body);
    assert_eq!(accs.len(), 2);
    // the load of 0x9000 evicts the dirty 0x8000 line from the one-way set
    let evicting = accs.iter().find(|a| a.inst.address == 0x204).unwrap();
    assert_eq!(evicting.purge, Purge::Must);
    assert!(evicting.purge_time >= 1);
}

/// First-iteration unrolling splits the loop; the remaining copy iterates
/// one time less and the flow facts follow.
#[test]
fn test_unrolled_loop_flow() {
    let program = ProgramBuilder::new(0x1000)
        .segment(".text", 0x1000)
        .push(alu(0x1000))
        .push(cond_br(0x1004, 0x1000))
        .push(ret(0x1008))
        .build();

    let mut ws = Workspace::new(program, Default::default(), Default::default());
    ws.flow_facts.loops.insert(0x1000, 10);
    ws.config.set(workspace::do_unroll(), true);
    let registry = Registry::standard();
    proc::assemble(&mut ws, &registry).unwrap();

    let cfg = ws.cfgs.as_ref().unwrap().entry_cfg();
    let copies: Vec<u32> = cfg
        .blocks
        .iter()
        .filter(|b| b.address() == Some(0x1000))
        .map(|b| b.id)
        .collect();
    assert_eq!(copies.len(), 2);
    let rest = copies
        .iter()
        .copied()
        .find(|&b| cfg.block(b).props.has(unrolled_from()))
        .expect("remaining-iterations copy");
    let first = copies.into_iter().find(|&b| b != rest).unwrap();
    assert_eq!(
        cfg.block(rest).props.get(timebound_core::flowfacts::max_iteration()),
        Some(&9)
    );

    let exit_block = cfg.block_at(0x1008).unwrap();
    let mut solver = CheckSolver::new();
    solver
        .set(bvar(&ws, ENTRY), 1.0)
        .set(bvar(&ws, first), 1.0)
        .set(bvar(&ws, rest), 9.0)
        .set(bvar(&ws, exit_block), 1.0)
        .set(bvar(&ws, EXIT), 1.0)
        .set(evar(&ws, ENTRY, first), 1.0)
        .set(evar(&ws, first, rest), 1.0)
        .set(evar(&ws, rest, rest), 8.0)
        .set(evar(&ws, rest, exit_block), 1.0)
        .set(evar(&ws, exit_block, EXIT), 1.0);
    let wcet = ipet::compute_wcet(ws.system.as_mut().unwrap(), &solver).unwrap();
    // 10 passes through the two-instruction body plus the return
    assert_eq!(wcet, 105);
}

/// Fetch events carry the miss counters of their L-blocks.
#[test]
fn test_events_reference_miss_vars() {
    let program = ProgramBuilder::new(0x3000)
        .segment(".text", 0x3000)
        .push(alu(0x3000))
        .push(ret(0x3004))
        .build();
    let mut ws = Workspace::new(
        program,
        with_icache(cache(2, 1, 4, 10)),
        Default::default(),
    );
    let registry = Registry::standard();
    proc::assemble(&mut ws, &registry).unwrap();

    let cfg = ws.cfgs.as_ref().unwrap().entry_cfg();
    let body = cfg.block_at(0x3000).unwrap();
    let evs = cfg
        .block(body)
        .props
        .get(events::events())
        .expect("fetch events attached");
    assert!(!evs.is_empty());
    for ev in evs.iter() {
        assert_eq!(ev.kind, events::EventKind::Fetch);
        assert!(ev.count_var.is_some());
        assert!(ev.is_estimating(true));
        assert!(!ev.is_estimating(false));
    }
}
