//! Execution units. One `Vec` of state-machine instances per unit type,
//! each unit working on at most one instruction at a time, so instructions
//! retire in issue order within a unit.

pub mod alu;
pub mod indirect;
pub mod invalidator;
pub mod range;
pub mod stream;

pub use alu::AluUnit;
pub use indirect::IndirectUnit;
pub use invalidator::Invalidator;
pub use range::RangeUnit;
pub use stream::StreamUnit;

use super::instruction::Opcode;
use super::ports::DownstreamPort;
use super::spd::{RegisterFile, Scratchpad};

/// Shared resources a unit borrows for its slice of the current cycle.
///
/// Scratchpad ports and the downstream budgets are the only contended
/// resources; everything else a unit touches is its own state.
pub struct ExecContext<'a> {
    pub cycle: u64,
    pub spd: &'a mut Scratchpad,
    pub rf: &'a mut RegisterFile,
    pub cache_port: &'a mut DownstreamPort,
    pub mem_port: &'a mut DownstreamPort,
    pub stats: &'a mut stats::Stats,
}

/// A finished instruction, handed back to the accelerator for retirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retired {
    pub slot: usize,
    pub opcode: Opcode,
    pub dst1_tile: Option<usize>,
    pub dst2_tile: Option<usize>,
}
