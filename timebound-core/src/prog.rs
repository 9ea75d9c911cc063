//! Program Model
//!
//! Immutable view of the decoded program: instructions grouped into segments,
//! a platform description of the register banks, and the `Loader` interface
//! that decoding front-ends implement. Instructions are produced by the
//! loader and never mutated; CFGs only reference them.

use crate::error::{AnalysisError, Result};
use bitflags::bitflags;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

bitflags! {
    /// Instruction kind bitfield.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InstKind: u32 {
        const CONTROL  = 1 << 0;
        const CALL     = 1 << 1;
        const RETURN   = 1 << 2;
        const COND     = 1 << 3;
        const MEM      = 1 << 4;
        const LOAD     = 1 << 5;
        const STORE    = 1 << 6;
        const INT      = 1 << 7;
        const FLOAT    = 1 << 8;
        const ALU      = 1 << 9;
        const MUL      = 1 << 10;
        const DIV      = 1 << 11;
        const MULTI    = 1 << 12;
        const INDIRECT = 1 << 13;
        const UNKNOWN  = 1 << 14;
        const ATOMIC   = 1 << 15;
        const BUNDLE   = 1 << 16;
        const INTERN   = 1 << 17;
        const TRAP     = 1 << 18;
    }
}

bitflags! {
    /// Set of comparison outcomes a condition accepts.
    ///
    /// A condition holds when the comparison outcome of its register is one
    /// of the set bits. The full set is the "any" condition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Pred: u8 {
        const EQ = 1 << 0;
        const LT = 1 << 1;
        const GT = 1 << 2;
    }
}

impl Pred {
    pub const ANY: Pred = Pred::all();
}

/// Condition guarding a conditional instruction: which outcomes of a
/// comparison on a register allow it to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Condition {
    pub reg: u16,
    pub signed: bool,
    pub pred: Pred,
}

impl Condition {
    pub fn new(reg: u16, signed: bool, pred: Pred) -> Condition {
        Condition { reg, signed, pred }
    }

    pub fn any(reg: u16) -> Condition {
        Condition { reg, signed: false, pred: Pred::ANY }
    }

    pub fn is_any(&self) -> bool {
        self.pred == Pred::ANY
    }

    pub fn is_empty(&self) -> bool {
        self.pred.is_empty()
    }

    /// Same register and signedness: the two conditions talk about the same
    /// comparison.
    pub fn same_subject(&self, other: &Condition) -> bool {
        self.reg == other.reg && self.signed == other.signed
    }

    /// The negation of this condition.
    pub fn revert(&self) -> Condition {
        Condition { pred: Pred::ANY - self.pred, ..*self }
    }

    pub fn subset_of(&self, other: &Condition) -> bool {
        self.same_subject(other) && other.pred.contains(self.pred)
    }

    /// Outcomes of `self` not covered by `other`.
    pub fn complement_of(&self, other: &Condition) -> Condition {
        Condition { pred: self.pred - other.pred, ..*self }
    }
}

/// Target of a data-memory access, as recovered by the address analysis of
/// the loader front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemTarget {
    /// Any address; the analysis could not narrow the access.
    Any,
    /// A single known address.
    Addr(u32),
    /// A contiguous interval `[first, last]` of addresses. `first > last`
    /// means the interval wraps modulo the address space.
    Range(u32, u32),
}

/// Semantic micro-operation of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroOp {
    Alu,
    Mul,
    Div,
    Branch,
    Mem { store: bool, target: MemTarget },
}

/// An immutable decoded instruction descriptor.
#[derive(Debug, Clone)]
pub struct Inst {
    pub address: u32,
    /// Size in bytes.
    pub size: u32,
    pub kind: InstKind,
    /// Branch target address, when statically known.
    pub target: Option<u32>,
    /// Registers read, by platform number.
    pub reads: SmallVec<[u16; 4]>,
    /// Registers written, by platform number.
    pub writes: SmallVec<[u16; 4]>,
    /// Condition guarding the instruction, if any.
    pub condition: Option<Condition>,
    /// Expansion into semantic micro-operations.
    pub uops: SmallVec<[MicroOp; 2]>,
}

impl Inst {
    pub fn is_control(&self) -> bool {
        self.kind.contains(InstKind::CONTROL)
    }
    pub fn is_call(&self) -> bool {
        self.kind.contains(InstKind::CALL)
    }
    pub fn is_return(&self) -> bool {
        self.kind.contains(InstKind::RETURN)
    }
    pub fn is_cond(&self) -> bool {
        self.kind.contains(InstKind::COND)
    }
    pub fn is_mem(&self) -> bool {
        self.kind.contains(InstKind::MEM)
    }
    pub fn is_indirect(&self) -> bool {
        self.kind.contains(InstKind::INDIRECT)
    }
    pub fn is_bundle(&self) -> bool {
        self.kind.contains(InstKind::BUNDLE)
    }

    /// Address of the byte following the instruction.
    pub fn top_address(&self) -> u32 {
        self.address.wrapping_add(self.size)
    }

    /// Memory micro-operations of the instruction, in program order.
    pub fn mem_ops(&self) -> impl Iterator<Item = (bool, MemTarget)> + '_ {
        self.uops.iter().filter_map(|u| match u {
            MicroOp::Mem { store, target } => Some((*store, *target)),
            _ => None,
        })
    }

    /// Synthetic no-operation placeholder standing in for `orig` in a
    /// restructured block. Keeps address and size so cache behavior is
    /// unchanged.
    pub fn nop_for(orig: &Inst) -> Inst {
        Inst {
            address: orig.address,
            size: orig.size,
            kind: InstKind::INTERN,
            target: None,
            reads: SmallVec::new(),
            writes: SmallVec::new(),
            condition: None,
            uops: SmallVec::new(),
        }
    }
}

/// One register bank of the platform.
#[derive(Debug, Clone)]
pub struct RegBank {
    pub name: String,
    /// Number of registers in the bank.
    pub count: u16,
    /// Register width in bits.
    pub width: u16,
}

/// Register banks of the target platform.
#[derive(Debug, Clone, Default)]
pub struct Platform {
    pub banks: Vec<RegBank>,
}

/// A contiguous region of decoded instructions.
#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    pub base: u32,
    pub size: u32,
    pub executable: bool,
    /// Instructions in address order.
    pub insts: Vec<Arc<Inst>>,
}

impl Segment {
    pub fn contains(&self, address: u32) -> bool {
        address.wrapping_sub(self.base) < self.size
    }
}

/// Decoded program: the loader-produced, immutable instruction store.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub segments: Vec<Segment>,
    /// Task entry address.
    pub entry: u32,
    pub platform: Platform,
    /// Known function symbols, name to address.
    pub symbols: HashMap<String, u32>,
}

impl Program {
    /// Find the instruction starting at the given address.
    pub fn find_inst_at(&self, address: u32) -> Option<&Arc<Inst>> {
        let seg = self.segments.iter().find(|s| s.contains(address))?;
        // Segments are decoded densely in address order.
        seg.insts
            .binary_search_by_key(&address, |i| i.address)
            .ok()
            .map(|idx| &seg.insts[idx])
    }

    /// Like [`Program::find_inst_at`], failing with an out-of-segment error.
    pub fn inst_at(&self, address: u32) -> Result<&Arc<Inst>> {
        match self.find_inst_at(address) {
            Some(inst) => Ok(inst),
            None => {
                if self.segments.iter().any(|s| s.contains(address)) {
                    Err(AnalysisError::Decode(address))
                } else {
                    Err(AnalysisError::OutOfSegment(address))
                }
            }
        }
    }

    /// First instruction of the task.
    pub fn start(&self) -> Option<&Arc<Inst>> {
        self.find_inst_at(self.entry)
    }

    /// Resolve an entry-point specification: a known symbol name, or a hex
    /// (`0x…`) or decimal address.
    pub fn resolve_entry(&self, spec: &str) -> Result<u32> {
        if let Some(&addr) = self.symbols.get(spec) {
            return Ok(addr);
        }
        let parsed = match spec.strip_prefix("0x") {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => spec.parse(),
        };
        parsed
            .map_err(|_| AnalysisError::Configuration(format!("unknown entry '{}'", spec)))
    }
}

/// Loader interface: what the decoding front-end exposes to the analysis.
pub trait Loader {
    fn find_inst_at(&self, address: u32) -> Option<&Arc<Inst>>;
    fn start(&self) -> Option<&Arc<Inst>>;
    fn platform(&self) -> &Platform;
    fn segments(&self) -> &[Segment];
}

impl Loader for Program {
    fn find_inst_at(&self, address: u32) -> Option<&Arc<Inst>> {
        Program::find_inst_at(self, address)
    }
    fn start(&self) -> Option<&Arc<Inst>> {
        Program::start(self)
    }
    fn platform(&self) -> &Platform {
        &self.platform
    }
    fn segments(&self) -> &[Segment] {
        &self.segments
    }
}

/// Builder for hand-assembled programs, used by tests and by front-ends that
/// synthesize code rather than decode it.
#[derive(Default)]
pub struct ProgramBuilder {
    program: Program,
    current: Option<Segment>,
}

impl ProgramBuilder {
    pub fn new(entry: u32) -> ProgramBuilder {
        ProgramBuilder {
            program: Program { entry, ..Program::default() },
            current: None,
        }
    }

    pub fn segment(mut self, name: &str, base: u32) -> ProgramBuilder {
        self.finish_segment();
        self.current = Some(Segment {
            name: name.to_string(),
            base,
            size: 0,
            executable: true,
            insts: Vec::new(),
        });
        self
    }

    pub fn push(mut self, inst: Inst) -> ProgramBuilder {
        let seg = self.current.as_mut().expect("no open segment");
        seg.size = inst.address.wrapping_add(inst.size).wrapping_sub(seg.base);
        seg.insts.push(Arc::new(inst));
        self
    }

    pub fn symbol(mut self, name: &str, address: u32) -> ProgramBuilder {
        self.program.symbols.insert(name.to_string(), address);
        self
    }

    pub fn build(mut self) -> Program {
        self.finish_segment();
        self.program
    }

    fn finish_segment(&mut self) {
        if let Some(seg) = self.current.take() {
            self.program.segments.push(seg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(address: u32) -> Inst {
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

    #[test]
    fn test_find_inst_at() {
        let program = ProgramBuilder::new(0x1000)
            .segment(".text", 0x1000)
            .push(plain(0x1000))
            .push(plain(0x1004))
            .build();
        assert_eq!(program.find_inst_at(0x1004).unwrap().address, 0x1004);
        assert!(program.find_inst_at(0x1008).is_none());
        assert!(matches!(
            program.inst_at(0x2000),
            Err(AnalysisError::OutOfSegment(0x2000))
        ));
    }

    #[test]
    fn test_condition_algebra() {
        let lt = Condition::new(3, true, Pred::LT);
        let le = Condition::new(3, true, Pred::LT | Pred::EQ);
        assert!(lt.subset_of(&le));
        assert!(!le.subset_of(&lt));
        assert_eq!(le.complement_of(&lt).pred, Pred::EQ);
        assert_eq!(lt.revert().pred, Pred::EQ | Pred::GT);
        assert!(Condition::any(3).is_any());
    }
}
