use serde::{Deserialize, Serialize};

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spd {
    pub reads: u64,
    pub writes: u64,
    /// Accesses that had to wait for a read or write port to free up.
    pub port_conflicts: u64,
}

impl std::ops::AddAssign for Spd {
    fn add_assign(&mut self, other: Self) {
        self.reads += other.reads;
        self.writes += other.writes;
        self.port_conflicts += other.port_conflicts;
    }
}
