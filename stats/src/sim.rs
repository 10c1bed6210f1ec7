use serde::{Deserialize, Serialize};

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sim {
    pub cycles: u64,
    pub instructions_pushed: u64,
    pub instructions_refused: u64,
    pub instructions_finished: u64,
}

impl std::ops::AddAssign for Sim {
    fn add_assign(&mut self, other: Self) {
        self.cycles += other.cycles;
        self.instructions_pushed += other.instructions_pushed;
        self.instructions_refused += other.instructions_refused;
        self.instructions_finished += other.instructions_finished;
    }
}
