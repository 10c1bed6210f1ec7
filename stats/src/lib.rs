pub mod coalescing;
pub mod instructions;
pub mod ports;
pub mod sim;
pub mod spd;

pub use coalescing::{Coalescing, PerUnit};
pub use instructions::InstructionCounts;
pub use ports::{Port, Ports};
pub use sim::Sim;
pub use spd::Spd;

use serde::{Deserialize, Serialize};

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub sim: Sim,
    pub ports: Ports,
    pub spd: Spd,
    pub instructions: InstructionCounts,
    pub coalescing: PerUnit,
}

impl Stats {
    #[must_use]
    pub fn new(num_indirect_units: usize) -> Self {
        Self {
            coalescing: PerUnit::new(num_indirect_units),
            ..Self::default()
        }
    }
}

impl std::ops::AddAssign for Stats {
    fn add_assign(&mut self, other: Self) {
        self.sim += other.sim;
        self.ports += other.ports;
        self.spd += other.spd;
        self.instructions += other.instructions;
        self.coalescing += other.coalescing;
    }
}
