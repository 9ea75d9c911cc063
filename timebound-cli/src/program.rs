//! Program Description Loading
//!
//! The analysis core treats instruction decoding as an external
//! collaborator, so the CLI consumes an already-decoded program description
//! in JSON and converts it into the core program model. Front-ends wrapping
//! real decoders produce the same shape.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use smallvec::SmallVec;
use std::collections::HashMap;
use timebound_core::prog::{
    Condition, Inst, InstKind, MemTarget, MicroOp, Pred, Program, Segment,
};

#[derive(Deserialize)]
struct ProgramSpec {
    entry: u32,
    #[serde(default)]
    symbols: HashMap<String, u32>,
    segments: Vec<SegmentSpec>,
}

#[derive(Deserialize)]
struct SegmentSpec {
    name: String,
    base: u32,
    insts: Vec<InstSpec>,
}

#[derive(Deserialize)]
struct InstSpec {
    address: u32,
    #[serde(default = "default_size")]
    size: u32,
    #[serde(default)]
    kind: Vec<String>,
    #[serde(default)]
    target: Option<u32>,
    #[serde(default)]
    reads: Vec<u16>,
    #[serde(default)]
    writes: Vec<u16>,
    #[serde(default)]
    cond: Option<CondSpec>,
    #[serde(default)]
    mem: Option<MemSpec>,
}

fn default_size() -> u32 {
    4
}

#[derive(Deserialize)]
struct CondSpec {
    reg: u16,
    #[serde(default)]
    signed: bool,
    pred: Vec<String>,
}

#[derive(Deserialize)]
struct MemSpec {
    #[serde(default)]
    store: bool,
    #[serde(default)]
    addr: Option<u32>,
    #[serde(default)]
    range: Option<(u32, u32)>,
}

fn kind_of(names: &[String]) -> Result<InstKind> {
    let mut kind = InstKind::empty();
    for name in names {
        kind |= match name.as_str() {
            "control" => InstKind::CONTROL,
            "call" => InstKind::CALL,
            "return" => InstKind::RETURN,
            "cond" => InstKind::COND,
            "mem" => InstKind::MEM,
            "load" => InstKind::LOAD,
            "store" => InstKind::STORE,
            "int" => InstKind::INT,
            "float" => InstKind::FLOAT,
            "alu" => InstKind::ALU,
            "mul" => InstKind::MUL,
            "div" => InstKind::DIV,
            "multi" => InstKind::MULTI,
            "indirect" => InstKind::INDIRECT,
            "unknown" => InstKind::UNKNOWN,
            "atomic" => InstKind::ATOMIC,
            "bundle" => InstKind::BUNDLE,
            "intern" => InstKind::INTERN,
            "trap" => InstKind::TRAP,
            other => bail!("unknown instruction kind '{}'", other),
        };
    }
    Ok(kind)
}

fn pred_of(names: &[String]) -> Result<Pred> {
    let mut pred = Pred::empty();
    for name in names {
        pred |= match name.as_str() {
            "eq" => Pred::EQ,
            "lt" => Pred::LT,
            "gt" => Pred::GT,
            "any" => Pred::ANY,
            other => bail!("unknown predicate '{}'", other),
        };
    }
    Ok(pred)
}

fn convert(spec: InstSpec) -> Result<Inst> {
    let kind = kind_of(&spec.kind)?;
    let mut uops: SmallVec<[MicroOp; 2]> = SmallVec::new();
    if let Some(mem) = &spec.mem {
        let target = match (mem.addr, mem.range) {
            (Some(a), None) => MemTarget::Addr(a),
            (None, Some((first, last))) => MemTarget::Range(first, last),
            (None, None) => MemTarget::Any,
            _ => bail!("memory access with both 'addr' and 'range'"),
        };
        uops.push(MicroOp::Mem { store: mem.store, target });
    }
    if kind.contains(InstKind::CONTROL) {
        uops.push(MicroOp::Branch);
    } else if uops.is_empty() {
        uops.push(MicroOp::Alu);
    }
    Ok(Inst {
        address: spec.address,
        size: spec.size,
        kind,
        target: spec.target,
        reads: SmallVec::from_vec(spec.reads),
        writes: SmallVec::from_vec(spec.writes),
        condition: match spec.cond {
            Some(c) => Some(Condition::new(c.reg, c.signed, pred_of(&c.pred)?)),
            None => None,
        },
        uops,
    })
}

/// Load a JSON program description.
pub fn load(path: &std::path::Path) -> Result<Program> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read program '{}'", path.display()))?;
    let spec: ProgramSpec = serde_json::from_str(&text)
        .with_context(|| format!("bad program description '{}'", path.display()))?;
    let mut program = Program {
        entry: spec.entry,
        symbols: spec.symbols,
        ..Program::default()
    };
    for seg in spec.segments {
        let mut insts = Vec::with_capacity(seg.insts.len());
        for i in seg.insts {
            insts.push(std::sync::Arc::new(convert(i)?));
        }
        let size = insts
            .last()
            .map(|i: &std::sync::Arc<Inst>| i.address + i.size - seg.base)
            .unwrap_or(0);
        program.segments.push(Segment {
            name: seg.name,
            base: seg.base,
            size,
            executable: true,
            insts,
        });
    }
    Ok(program)
}
