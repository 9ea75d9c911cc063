//! CFG Provider
//!
//! Builds one CFG per function reachable from the task entry. Block
//! boundaries follow the usual rules: a block starts at the function entry,
//! at any branch target and at the instruction following a control transfer;
//! a block ends at a control instruction. Calls become synthetic blocks with
//! an outgoing return edge; unresolved indirect branches create edges to the
//! CFG's `unknown` sentinel.

use crate::cfg::{BlockId, Cfg, CfgCollection, CfgId, EdgeKind, ENTRY, EXIT, UNKNOWN};
use crate::error::{AnalysisError, Result};
use crate::prog::{Inst, Program};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Build the CFG collection of the task rooted at `entry`.
pub fn build(program: &Program, entry: u32) -> Result<CfgCollection> {
    let mut collection = CfgCollection::default();
    let mut index_of: HashMap<u32, CfgId> = HashMap::new();
    let mut todo: VecDeque<u32> = VecDeque::new();
    // (cfg, synth block, callee address) triples to patch once every
    // function got its index
    let mut call_fixups: Vec<(CfgId, BlockId, u32)> = Vec::new();

    index_of.insert(entry, 0);
    todo.push_back(entry);

    while let Some(addr) = todo.pop_front() {
        let id = index_of[&addr];
        debug_assert_eq!(id as usize, collection.cfgs.len());
        let scan = scan_function(program, addr)?;
        for &callee in &scan.callees {
            if !index_of.contains_key(&callee) {
                index_of.insert(callee, index_of.len() as CfgId);
                todo.push_back(callee);
            }
        }
        let cfg = assemble(program, addr, scan, id, &mut call_fixups)?;
        collection.cfgs.push(cfg);
    }

    for (cfg, synth, callee) in call_fixups {
        let callee_id = index_of.get(&callee).copied();
        if let crate::cfg::BlockKind::Synth { callee: c, .. } =
            &mut collection.get_mut(cfg).block_mut(synth).kind
        {
            *c = callee_id;
        }
    }
    Ok(collection)
}

struct FunctionScan {
    /// Scanned instructions, keyed by address.
    insts: BTreeMap<u32, Arc<Inst>>,
    /// Addresses starting a block.
    boundaries: HashSet<u32>,
    /// Known callee entry addresses.
    callees: Vec<u32>,
}

/// Follow intra-procedural control flow from the function entry, collecting
/// instructions and block boundaries.
fn scan_function(program: &Program, entry: u32) -> Result<FunctionScan> {
    let mut scan = FunctionScan {
        insts: BTreeMap::new(),
        boundaries: HashSet::new(),
        callees: Vec::new(),
    };
    scan.boundaries.insert(entry);
    let mut todo = vec![entry];
    let mut visited: HashSet<u32> = HashSet::new();

    while let Some(start) = todo.pop() {
        if !visited.insert(start) {
            continue;
        }
        let mut addr = start;
        loop {
            let inst = match program.find_inst_at(addr) {
                Some(inst) => inst.clone(),
                None => {
                    return Err(AnalysisError::UnstructuredCfg {
                        function: format!("0x{:08X}", entry),
                        reason: format!("fell off decoded code at 0x{:08X}", addr),
                    });
                }
            };
            let next = inst.top_address();
            scan.insts.insert(addr, inst.clone());

            if inst.is_control() {
                scan.boundaries.insert(next);
                if inst.is_call() {
                    if let Some(target) = inst.target {
                        scan.callees.push(target);
                    }
                    // execution resumes after the call
                    if !visited.contains(&next) {
                        todo.push(next);
                    }
                } else if inst.is_return() {
                    // path ends here
                } else {
                    if let Some(target) = inst.target {
                        if program.find_inst_at(target).is_some() {
                            scan.boundaries.insert(target);
                            if !visited.contains(&target) {
                                todo.push(target);
                            }
                        }
                    }
                    if inst.is_cond() && !visited.contains(&next) {
                        todo.push(next);
                    }
                }
                break;
            }

            if scan.insts.contains_key(&next) || visited.contains(&next) {
                // ran into already-scanned code: boundary, stop the walk
                scan.boundaries.insert(next);
                break;
            }
            addr = next;
        }
    }
    Ok(scan)
}

/// Turn a function scan into a CFG.
fn assemble(
    program: &Program,
    entry: u32,
    scan: FunctionScan,
    id: CfgId,
    call_fixups: &mut Vec<(CfgId, BlockId, u32)>,
) -> Result<Cfg> {
    let label = program
        .symbols
        .iter()
        .find(|(_, &a)| a == entry)
        .map(|(n, _)| n.clone())
        .unwrap_or_else(|| format!("f_0x{:08X}", entry));
    let mut cfg = Cfg::new(label, entry);

    // group scanned instructions into blocks
    let mut block_of: HashMap<u32, BlockId> = HashMap::new();
    let mut run: Vec<Arc<Inst>> = Vec::new();
    let mut blocks: Vec<BlockId> = Vec::new();
    let mut flush = |cfg: &mut Cfg, run: &mut Vec<Arc<Inst>>, blocks: &mut Vec<BlockId>| {
        if run.is_empty() {
            return;
        }
        let first = run[0].address;
        let b = cfg.add_basic(std::mem::take(run));
        block_of.insert(first, b);
        blocks.push(b);
    };
    let mut prev_top: Option<u32> = None;
    for (&addr, inst) in &scan.insts {
        let contiguous = prev_top == Some(addr);
        if scan.boundaries.contains(&addr) || !contiguous {
            flush(&mut cfg, &mut run, &mut blocks);
        }
        run.push(inst.clone());
        prev_top = Some(inst.top_address());
        if inst.is_control() {
            flush(&mut cfg, &mut run, &mut blocks);
        }
    }
    flush(&mut cfg, &mut run, &mut blocks);

    let entry_block = *block_of.get(&entry).ok_or_else(|| AnalysisError::UnstructuredCfg {
        function: cfg.label.clone(),
        reason: "entry instruction missing".into(),
    })?;
    cfg.add_edge(ENTRY, entry_block, EdgeKind::Virtual);

    // connect blocks
    for &b in &blocks {
        let (last, top) = {
            let block = cfg.block(b);
            (
                block.insts().last().cloned(),
                block.top_address().unwrap_or(0),
            )
        };
        let last = match last {
            Some(i) => i,
            None => continue,
        };

        if !last.is_control() {
            // fall-through into the next block
            match block_of.get(&top) {
                Some(&next) => {
                    cfg.add_edge(b, next, EdgeKind::NotTaken);
                }
                None => {
                    return Err(AnalysisError::UnstructuredCfg {
                        function: cfg.label.clone(),
                        reason: format!("no block at fall-through 0x{:08X}", top),
                    })
                }
            }
            continue;
        }

        if last.is_call() {
            let synth = cfg.add_synth(None, Some(last.clone()));
            cfg.add_edge(b, synth, EdgeKind::Call);
            match last.target {
                Some(target) => call_fixups.push((id, synth, target)),
                None => {
                    // unknown callee: the synthetic stays unresolved
                    log::debug!(
                        "indirect call at 0x{:08X} in {}: callee unknown",
                        last.address,
                        cfg.label
                    );
                }
            }
            match block_of.get(&top) {
                Some(&cont) => {
                    cfg.add_edge(synth, cont, EdgeKind::Return);
                }
                None => {
                    cfg.add_edge(synth, EXIT, EdgeKind::Return);
                }
            }
            continue;
        }

        if last.is_return() {
            cfg.add_edge(b, EXIT, EdgeKind::Return);
            continue;
        }

        // plain branch
        match last.target.and_then(|t| block_of.get(&t).copied()) {
            Some(target) => {
                cfg.add_edge(b, target, EdgeKind::Taken);
            }
            None => {
                log::debug!(
                    "unresolved branch at 0x{:08X} in {}: edge to unknown",
                    last.address,
                    cfg.label
                );
                cfg.add_edge(b, UNKNOWN, EdgeKind::Taken);
            }
        }
        if last.is_cond() {
            match block_of.get(&top) {
                Some(&next) => {
                    cfg.add_edge(b, next, EdgeKind::NotTaken);
                }
                None => {
                    return Err(AnalysisError::UnstructuredCfg {
                        function: cfg.label.clone(),
                        reason: format!("no block after branch at 0x{:08X}", last.address),
                    })
                }
            }
        }
    }

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prog::{InstKind, MicroOp, ProgramBuilder};
    use smallvec::SmallVec;

    fn inst(address: u32, kind: InstKind, target: Option<u32>) -> Inst {
        Inst {
            address,
            size: 4,
            kind,
            target,
            reads: SmallVec::new(),
            writes: SmallVec::new(),
            condition: None,
            uops: SmallVec::from_slice(&[MicroOp::Alu]),
        }
    }

    /// Straight-line code with one conditional backward branch: one loop.
    fn looped_program() -> Program {
        ProgramBuilder::new(0x1000)
            .segment(".text", 0x1000)
            .push(inst(0x1000, InstKind::INT | InstKind::ALU, None))
            .push(inst(
                0x1004,
                InstKind::CONTROL | InstKind::COND,
                Some(0x1000),
            ))
            .push(inst(0x1008, InstKind::CONTROL | InstKind::RETURN, None))
            .build()
    }

    #[test]
    fn test_single_loop_shape() {
        let program = looped_program();
        let coll = build(&program, 0x1000).unwrap();
        assert_eq!(coll.count(), 1);
        let cfg = coll.entry_cfg();
        // entry, exit, unknown + loop body + return block
        assert_eq!(cfg.block_count(), 5);
        let body = cfg.block_at(0x1000).unwrap();
        let ret = cfg.block_at(0x1008).unwrap();
        assert!(cfg.succs(body).any(|s| s == body));
        assert!(cfg.succs(body).any(|s| s == ret));
        assert!(cfg.succs(ret).any(|s| s == EXIT));
    }

    #[test]
    fn test_call_becomes_synth() {
        let program = ProgramBuilder::new(0x2000)
            .segment(".text", 0x2000)
            .push(inst(
                0x2000,
                InstKind::CONTROL | InstKind::CALL,
                Some(0x2010),
            ))
            .push(inst(0x2004, InstKind::CONTROL | InstKind::RETURN, None))
            .push(inst(0x2008, InstKind::INT | InstKind::ALU, None))
            .push(inst(0x200c, InstKind::INT | InstKind::ALU, None))
            .push(inst(0x2010, InstKind::CONTROL | InstKind::RETURN, None))
            .build();
        let coll = build(&program, 0x2000).unwrap();
        assert_eq!(coll.count(), 2);
        let cfg = coll.entry_cfg();
        let synth = cfg
            .blocks
            .iter()
            .find(|b| b.is_synth())
            .expect("call site produced no synthetic block");
        assert_eq!(synth.callee(), Some(1));
        assert_eq!(cfg.in_edges(synth.id).count(), 1);
        assert!(cfg.in_edges(synth.id).all(|e| e.kind == EdgeKind::Call));
        assert!(cfg.out_edges(synth.id).all(|e| e.kind == EdgeKind::Return));
    }

    #[test]
    fn test_indirect_branch_goes_unknown() {
        let program = ProgramBuilder::new(0x3000)
            .segment(".text", 0x3000)
            .push(inst(
                0x3000,
                InstKind::CONTROL | InstKind::INDIRECT,
                None,
            ))
            .build();
        let coll = build(&program, 0x3000).unwrap();
        let cfg = coll.entry_cfg();
        let b = cfg.block_at(0x3000).unwrap();
        assert_eq!(cfg.succs(b).collect::<Vec<_>>(), vec![UNKNOWN]);
    }
}
