use serde::{Deserialize, Serialize};

/// Counters for one downstream request port.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Requests handed to the port.
    pub issued: u64,
    /// Completions matched back to an issued request.
    pub completed: u64,
    /// Issue attempts refused because the outstanding budget was saturated.
    pub stalls: u64,
    /// High-water mark of outstanding requests.
    pub max_outstanding_seen: u64,
}

impl Port {
    pub fn record_outstanding(&mut self, outstanding: u64) {
        self.max_outstanding_seen = self.max_outstanding_seen.max(outstanding);
    }
}

impl std::ops::AddAssign for Port {
    fn add_assign(&mut self, other: Self) {
        self.issued += other.issued;
        self.completed += other.completed;
        self.stalls += other.stalls;
        self.max_outstanding_seen = self.max_outstanding_seen.max(other.max_outstanding_seen);
    }
}

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ports {
    pub cache_side: Port,
    pub mem_side: Port,
}

impl std::ops::AddAssign for Ports {
    fn add_assign(&mut self, other: Self) {
        self.cache_side += other.cache_side;
        self.mem_side += other.mem_side;
    }
}
