//! Static worst-case execution time (WCET) analysis for embedded binaries.
//!
//! The core pipeline turns decoded instructions into a safe WCET bound:
//! 1. **CFG collection**: build one control-flow graph per reachable function,
//!    then transform (virtualize calls, unroll loops, split by condition).
//! 2. **Abstract interpretation**: a generic monotone fix-point engine runs
//!    the MUST / MAY / PERS cache domains over the CFGs.
//! 3. **Classification**: every cache access gets a category
//!    (always-hit, always-miss, first-miss, not-classified).
//! 4. **IPET**: blocks and edges become ILP flow variables, structural and
//!    flow-fact constraints are assembled, miss and misprediction penalties
//!    enter the objective, and an external solver maximizes it.
//!
//! Instruction decoding, hardware-description parsing and ILP solving are
//! external collaborators behind narrow interfaces (`prog::Loader`,
//! `hard::HardwareConfig`, `ilp::Solver`).

pub mod branch;
pub mod cache;
pub mod cfg;
pub mod dfa;
pub mod error;
pub mod events;
pub mod flowfacts;
pub mod hard;
pub mod ilp;
pub mod ipet;
pub mod proc;
pub mod prog;
pub mod prop;
pub mod stats;
pub mod workspace;

pub use error::{AnalysisError, Result};
pub use workspace::Workspace;
