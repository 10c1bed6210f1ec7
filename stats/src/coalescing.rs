use serde::{Deserialize, Serialize};

/// Row-table activity of one indirect access unit.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coalescing {
    /// Tile words linked into the offset table.
    pub words_inserted: u64,
    /// Distinct cache-line addresses tracked in row-table rows.
    pub cache_lines_inserted: u64,
    /// Distinct DRAM rows opened in the row table.
    pub rows_inserted: u64,
    /// Rows drained because a full bank needed space for a new row tag.
    pub rows_evicted: u64,
    /// Drain batches issued downstream.
    pub drains: u64,
    /// Address decodes answered by the row-decode config cache.
    pub decode_cache_hits: u64,
    pub decode_cache_misses: u64,
}

impl Coalescing {
    /// Cache lines merged per opened row, the metric the row table exists for.
    #[must_use]
    pub fn lines_per_row(&self) -> f64 {
        if self.rows_inserted == 0 {
            return 0.0;
        }
        self.cache_lines_inserted as f64 / self.rows_inserted as f64
    }
}

impl std::ops::AddAssign for Coalescing {
    fn add_assign(&mut self, other: Self) {
        self.words_inserted += other.words_inserted;
        self.cache_lines_inserted += other.cache_lines_inserted;
        self.rows_inserted += other.rows_inserted;
        self.rows_evicted += other.rows_evicted;
        self.drains += other.drains;
        self.decode_cache_hits += other.decode_cache_hits;
        self.decode_cache_misses += other.decode_cache_misses;
    }
}

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerUnit(pub Vec<Coalescing>);

impl PerUnit {
    #[must_use]
    pub fn new(num_units: usize) -> Self {
        Self(vec![Coalescing::default(); num_units])
    }
}

impl std::ops::Index<usize> for PerUnit {
    type Output = Coalescing;

    fn index(&self, unit_id: usize) -> &Self::Output {
        &self.0[unit_id]
    }
}

impl std::ops::IndexMut<usize> for PerUnit {
    fn index_mut(&mut self, unit_id: usize) -> &mut Self::Output {
        &mut self.0[unit_id]
    }
}

impl std::ops::AddAssign for PerUnit {
    fn add_assign(&mut self, other: Self) {
        if self.0.len() < other.0.len() {
            self.0.resize(other.0.len(), Coalescing::default());
        }
        for (unit_id, unit) in other.0.into_iter().enumerate() {
            self.0[unit_id] += unit;
        }
    }
}
