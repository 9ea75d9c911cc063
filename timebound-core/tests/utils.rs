//! Shared helpers for the integration tests: hand-assembled programs,
//! hardware descriptions and a solver stub that checks a hand-computed
//! worst-case assignment against the assembled system.
#![allow(dead_code)]

use smallvec::SmallVec;
use std::collections::HashMap;
use timebound_core::error::{AnalysisError, Result};
use timebound_core::hard::{
    Bht, CacheConfig, DefaultPrediction, HardwareConfig, ReplacePolicy, WritePolicy,
};
use timebound_core::ilp::{Comp, IlpSystem, Solver, VarId};
use timebound_core::prog::{Condition, Inst, InstKind, MemTarget, MicroOp};

pub fn alu(address: u32) -> Inst {
    Inst {
        address,
        size: 4,
        kind: InstKind::INT | InstKind::ALU,
        target: None,
        reads: SmallVec::new(),
        writes: SmallVec::new(),
        condition: None,
        uops: SmallVec::from_slice(&[MicroOp::Alu]),
    }
}

pub fn cond_br(address: u32, target: u32) -> Inst {
    Inst {
        address,
        size: 4,
        kind: InstKind::CONTROL | InstKind::COND,
        target: Some(target),
        reads: SmallVec::new(),
        writes: SmallVec::new(),
        condition: None,
        uops: SmallVec::from_slice(&[MicroOp::Branch]),
    }
}

pub fn branch(address: u32, target: u32) -> Inst {
    Inst {
        address,
        size: 4,
        kind: InstKind::CONTROL,
        target: Some(target),
        reads: SmallVec::new(),
        writes: SmallVec::new(),
        condition: None,
        uops: SmallVec::from_slice(&[MicroOp::Branch]),
    }
}

pub fn ret(address: u32) -> Inst {
    Inst {
        address,
        size: 4,
        kind: InstKind::CONTROL | InstKind::RETURN,
        target: None,
        reads: SmallVec::new(),
        writes: SmallVec::new(),
        condition: None,
        uops: SmallVec::from_slice(&[MicroOp::Branch]),
    }
}

pub fn call(address: u32, target: u32) -> Inst {
    Inst {
        address,
        size: 4,
        kind: InstKind::CONTROL | InstKind::CALL,
        target: Some(target),
        reads: SmallVec::new(),
        writes: SmallVec::new(),
        condition: None,
        uops: SmallVec::from_slice(&[MicroOp::Branch]),
    }
}

pub fn indirect_call(address: u32) -> Inst {
    Inst {
        address,
        size: 4,
        kind: InstKind::CONTROL | InstKind::CALL | InstKind::INDIRECT,
        target: None,
        reads: SmallVec::new(),
        writes: SmallVec::new(),
        condition: None,
        uops: SmallVec::from_slice(&[MicroOp::Branch]),
    }
}

pub fn load(address: u32, target: MemTarget) -> Inst {
    Inst {
        address,
        size: 4,
        kind: InstKind::MEM | InstKind::LOAD,
        target: None,
        reads: SmallVec::new(),
        writes: SmallVec::new(),
        condition: None,
        uops: SmallVec::from_slice(&[MicroOp::Mem { store: false, target }]),
    }
}

pub fn cond_alu(address: u32, cond: Condition) -> Inst {
    Inst {
        address,
        size: 4,
        kind: InstKind::INT | InstKind::ALU | InstKind::COND,
        target: None,
        reads: SmallVec::new(),
        writes: SmallVec::new(),
        condition: Some(cond),
        uops: SmallVec::from_slice(&[MicroOp::Alu]),
    }
}

pub fn cache(sets: u32, assoc: u32, block_size: u32, miss_penalty: u64) -> CacheConfig {
    CacheConfig {
        assoc,
        sets,
        block_size,
        replace: ReplacePolicy::Lru,
        write: WritePolicy::WriteThrough,
        miss_penalty,
        next: None,
    }
}

pub fn with_icache(cache: CacheConfig) -> HardwareConfig {
    HardwareConfig {
        caches: timebound_core::hard::CacheHierarchy { inst: Some(cache), data: None },
        ..HardwareConfig::default()
    }
}

pub fn with_dcache(cache: CacheConfig) -> HardwareConfig {
    HardwareConfig {
        caches: timebound_core::hard::CacheHierarchy { inst: None, data: Some(cache) },
        ..HardwareConfig::default()
    }
}

pub fn bht(rows: u32, cond_penalty: u64) -> Bht {
    Bht {
        rows,
        cond_penalty,
        indirect_penalty: cond_penalty + 2,
        cond_indirect_penalty: cond_penalty + 3,
        default_prediction: DefaultPrediction::NotTaken,
    }
}

/// Solver stub: the test supplies the worst-case assignment it computed by
/// hand; the stub checks it against every constraint and evaluates the
/// objective. Unassigned variables default to zero.
#[derive(Default)]
pub struct CheckSolver {
    pub assign: HashMap<VarId, f64>,
}

impl CheckSolver {
    pub fn new() -> CheckSolver {
        CheckSolver::default()
    }

    pub fn set(&mut self, var: VarId, value: f64) -> &mut Self {
        self.assign.insert(var, value);
        self
    }
}

impl Solver for CheckSolver {
    fn name(&self) -> &str {
        "check-stub"
    }

    fn solve(&self, sys: &mut IlpSystem) -> Result<f64> {
        let mut values = vec![0.0; sys.count_vars()];
        for (&var, &v) in &self.assign {
            values[var.0 as usize] = v;
        }
        for cons in sys.constraints() {
            let lhs: f64 = cons
                .terms
                .iter()
                .map(|&(c, v)| c * values[v.0 as usize])
                .sum();
            let ok = match cons.comp {
                Comp::Eq => (lhs - cons.rhs).abs() < 1e-6,
                Comp::Le => lhs <= cons.rhs + 1e-6,
                Comp::Ge => lhs >= cons.rhs - 1e-6,
            };
            if !ok {
                return Err(AnalysisError::Solver(format!(
                    "assignment violates '{}': {} {} {}",
                    cons.label,
                    lhs,
                    cons.comp.symbol(),
                    cons.rhs
                )));
            }
        }
        let objective: f64 = sys
            .objective
            .iter()
            .map(|&(c, v)| c * values[v.0 as usize])
            .sum();
        sys.set_solution(values);
        Ok(objective)
    }
}
