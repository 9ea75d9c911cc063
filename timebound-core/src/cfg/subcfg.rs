//! Sub-CFG Extraction
//!
//! Builds a sub-CFG between a start address and a set of stop addresses of
//! the same CFG: the start and stop blocks are split at the given
//! boundaries, a forward flood from the start and a backward flood from the
//! stops keep only blocks on a path between them, and virtual entry/exit
//! edges are inserted.

use crate::cfg::{BlockId, BlockKind, Cfg, EdgeKind, ENTRY, EXIT, UNKNOWN};
use crate::error::{AnalysisError, Result};
use bitvec::prelude::*;

/// Extract the sub-CFG of `cfg` from `start` (inclusive) to the `stops`
/// (exclusive).
pub fn extract(cfg: &Cfg, start: u32, stops: &[u32]) -> Result<Cfg> {
    let start_block = cfg.block_at(start).ok_or_else(|| {
        AnalysisError::Configuration(format!("cannot find the start address 0x{:08X}", start))
    })?;
    let mut stop_blocks: Vec<(BlockId, u32)> = Vec::new();
    for &stop in stops {
        if let Some(b) = cfg.block_at(stop) {
            stop_blocks.push((b, stop));
        }
    }
    if stop_blocks.is_empty() {
        return Err(AnalysisError::Configuration(
            "cannot find any stop address".to_string(),
        ));
    }
    log::debug!(
        "extracting sub-CFG of {} from 0x{:08X} to {} stop(s)",
        cfg.label,
        start,
        stop_blocks.len()
    );

    let n = cfg.blocks.len();
    let is_stop = {
        let mut v = bitvec![0; n];
        for &(b, _) in &stop_blocks {
            v.set(b as usize, true);
        }
        v
    };

    // forward flood from the start, not crossing stops
    let mut forward = bitvec![0; n];
    let mut todo = vec![start_block];
    while let Some(b) = todo.pop() {
        if forward.replace(b as usize, true) {
            continue;
        }
        if is_stop[b as usize] {
            continue;
        }
        for s in cfg.succs(b) {
            if !forward[s as usize] {
                todo.push(s);
            }
        }
    }

    // backward flood from the stops, not crossing the start
    let mut backward = bitvec![0; n];
    let mut todo: Vec<BlockId> = stop_blocks.iter().map(|&(b, _)| b).collect();
    while let Some(b) = todo.pop() {
        if backward.replace(b as usize, true) {
            continue;
        }
        if b == start_block {
            continue;
        }
        for p in cfg.preds(b) {
            if !backward[p as usize] {
                todo.push(p);
            }
        }
    }

    // build the kept blocks, slicing at the start/stop boundaries
    let mut out = Cfg::new(format!("{}@0x{:08X}", cfg.label, start), start);
    let mut map: Vec<Option<BlockId>> = vec![None; n];
    map[UNKNOWN as usize] = Some(UNKNOWN);
    for block in &cfg.blocks {
        if block.is_end() {
            continue;
        }
        let kept = forward[block.id as usize] && backward[block.id as usize];
        if !kept {
            continue;
        }
        let nb = match &block.kind {
            BlockKind::Basic { insts } => {
                let lo = if block.id == start_block { start } else { 0 };
                let hi = stop_blocks
                    .iter()
                    .find(|&&(b, _)| b == block.id)
                    .map(|&(_, a)| a)
                    .unwrap_or(u32::MAX);
                let sliced: Vec<_> = insts
                    .iter()
                    .filter(|i| i.address >= lo && i.address < hi)
                    .cloned()
                    .collect();
                if sliced.is_empty() {
                    // stop right at the block start: predecessors connect
                    // straight to the exit
                    map[block.id as usize] = Some(EXIT);
                    continue;
                }
                out.add_basic(sliced)
            }
            BlockKind::Synth { callee, call_inst } => out.add_synth(*callee, call_inst.clone()),
            _ => unreachable!(),
        };
        map[block.id as usize] = Some(nb);
    }

    // virtual boundary edges and inner edges
    let start_new = map[start_block as usize].ok_or_else(|| {
        AnalysisError::Configuration(format!(
            "start address 0x{:08X} is not on a path to a stop",
            start
        ))
    })?;
    out.add_edge(ENTRY, start_new, EdgeKind::Virtual);
    for block in &cfg.blocks {
        let src = match map[block.id as usize] {
            Some(s) if s != EXIT => s,
            _ => continue,
        };
        if is_stop[block.id as usize] {
            out.add_edge(src, EXIT, EdgeKind::Virtual);
            continue;
        }
        for e in cfg.out_edges(block.id) {
            if e.sink == UNKNOWN {
                out.add_edge(src, UNKNOWN, e.kind);
            } else if let Some(sink) = map[e.sink as usize] {
                let kind = if sink == EXIT { EdgeKind::Virtual } else { e.kind };
                out.add_edge(src, sink, kind);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prog::{Inst, InstKind};
    use smallvec::SmallVec;
    use std::sync::Arc;

    fn run(cfg: &mut Cfg, base: u32, count: u32) -> BlockId {
        let insts = (0..count)
            .map(|i| {
                Arc::new(Inst {
                    address: base + i * 4,
                    size: 4,
                    kind: InstKind::ALU,
                    target: None,
                    reads: SmallVec::new(),
                    writes: SmallVec::new(),
                    condition: None,
                    uops: SmallVec::new(),
                })
            })
            .collect();
        cfg.add_basic(insts)
    }

    /// a(0x2ff0..0x3000) -> b(0x3000..) -> c -> d(0x3040..), with a side
    /// block s hanging off b that never reaches d.
    fn sample() -> Cfg {
        let mut cfg = Cfg::new("f", 0x2ff0);
        let a = run(&mut cfg, 0x2ff0, 8); // 0x2ff0..0x3010, start in middle
        let c = run(&mut cfg, 0x3010, 4);
        let s = run(&mut cfg, 0x3030, 4);
        let d = run(&mut cfg, 0x3040, 4);
        cfg.add_edge(ENTRY, a, EdgeKind::Virtual);
        cfg.add_edge(a, c, EdgeKind::NotTaken);
        cfg.add_edge(c, s, EdgeKind::Taken);
        cfg.add_edge(c, d, EdgeKind::NotTaken);
        cfg.add_edge(s, EXIT, EdgeKind::Taken);
        cfg.add_edge(d, EXIT, EdgeKind::NotTaken);
        cfg
    }

    #[test]
    fn test_extract_splits_and_floods() {
        let cfg = sample();
        let out = extract(&cfg, 0x3000, &[0x3040]).unwrap();

        // start block split at 0x3000: the first kept instruction is there
        let first = out
            .blocks
            .iter()
            .filter(|b| b.is_basic())
            .map(|b| b.address().unwrap())
            .min()
            .unwrap();
        assert_eq!(first, 0x3000);

        // the side block never reaches the stop: dropped
        assert!(out.blocks.iter().all(|b| b.address() != Some(0x3030)));

        // stop block split exclusively: no instruction at or past 0x3040
        assert!(out
            .blocks
            .iter()
            .flat_map(|b| b.insts())
            .all(|i| i.address < 0x3040));

        // virtual entry and exit edges in place
        assert_eq!(out.succs(ENTRY).count(), 1);
        assert!(out.preds(EXIT).count() >= 1);
    }

    #[test]
    fn test_missing_start_is_fatal() {
        let cfg = sample();
        assert!(matches!(
            extract(&cfg, 0x9000, &[0x3040]),
            Err(AnalysisError::Configuration(_))
        ));
        assert!(matches!(
            extract(&cfg, 0x3000, &[0x9000]),
            Err(AnalysisError::Configuration(_))
        ));
    }
}
