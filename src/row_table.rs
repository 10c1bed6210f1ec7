//! Row-granularity request coalescing for the indirect access units.
//!
//! Addresses landing in the same open DRAM row are merged into one row-table
//! row; each row tracks up to `num_entries_per_row` distinct cache-line
//! addresses, and every tile element that mapped to a line is linked into a
//! per-element offset-table chain so a single line reply can be scattered
//! back to all the elements that wanted it.

use super::address;
use smallvec::SmallVec;
use std::collections::HashMap;

/// One tile element waiting for a word of a coalesced cache line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetChainLink {
    /// Element index in the tile.
    pub itr: usize,
    /// Word index within the cache line.
    pub wid: usize,
}

#[derive(Debug, Clone, Copy)]
struct OffsetEntry {
    valid: bool,
    wid: usize,
    next: Option<usize>,
}

/// Per-element linked chains, one slot per tile element.
///
/// A chain starts at a line's `first_itr` and threads through every element
/// that merged into that line, in insertion order.
#[derive(Debug)]
pub struct OffsetTable {
    entries: Vec<OffsetEntry>,
}

impl OffsetTable {
    #[must_use]
    pub fn new(num_tile_elements: usize) -> Self {
        Self {
            entries: vec![
                OffsetEntry {
                    valid: false,
                    wid: 0,
                    next: None,
                };
                num_tile_elements
            ],
        }
    }

    pub fn insert(&mut self, itr: usize, wid: usize, last_itr: Option<usize>) {
        debug_assert!(!self.entries[itr].valid, "element {itr} linked twice");
        self.entries[itr] = OffsetEntry {
            valid: true,
            wid,
            next: None,
        };
        if let Some(last_itr) = last_itr {
            self.entries[last_itr].next = Some(itr);
        }
    }

    /// Walk a chain from its first element, unlinking as we go.
    pub fn take_chain(&mut self, first_itr: usize) -> Vec<OffsetChainLink> {
        let mut chain = Vec::new();
        let mut itr = Some(first_itr);
        while let Some(current) = itr {
            let entry = self.entries[current];
            assert!(entry.valid, "chain element {current} is invalid");
            chain.push(OffsetChainLink {
                itr: current,
                wid: entry.wid,
            });
            self.entries[current] = OffsetEntry {
                valid: false,
                wid: 0,
                next: None,
            };
            itr = entry.next;
        }
        chain
    }

    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.entries.iter().all(|entry| !entry.valid)
    }
}

/// One cache line tracked inside a row.
#[derive(Debug, Clone, Copy)]
struct LineEntry {
    addr: address,
    first_itr: usize,
    last_itr: usize,
}

/// One open DRAM row: a tag plus the lines pending under it.
#[derive(Debug)]
struct Row {
    row_tag: address,
    /// Cycle the tag was installed, for least-recently-filled eviction.
    filled_at: u64,
    lines: SmallVec<[LineEntry; 8]>,
}

/// What an insert did, for the stats ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Word merged into a line already tracked, no new downstream request.
    CoalescedWord,
    /// New line under an already-open row.
    CoalescedLine,
    /// A new row had to be opened.
    NewRow,
}

/// Insert refused: every row slot holds a different tag and none can take
/// the new line. The caller must drain a row first.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("row-table bank full, drain required")]
pub struct BankFull;

/// A line handed downstream when its row drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainEntry {
    pub addr: address,
    pub first_itr: usize,
}

/// All pending lines of one row, issued together as a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainBatch {
    pub row_tag: address,
    pub entries: Vec<DrainEntry>,
}

/// One bank of row-table rows.
#[derive(Debug)]
pub struct RowTable {
    rows: Vec<Option<Row>>,
    num_entries_per_row: usize,
}

impl RowTable {
    #[must_use]
    pub fn new(num_rows: usize, num_entries_per_row: usize) -> Self {
        assert!(num_rows > 0);
        assert!(num_entries_per_row > 0);
        Self {
            rows: (0..num_rows).map(|_| None).collect(),
            num_entries_per_row,
        }
    }

    #[must_use]
    pub fn occupancy(&self) -> usize {
        self.rows.iter().filter(|row| row.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }

    /// Track `addr` (a cache-line address) under `row_tag`, linking tile
    /// element `itr` / line word `wid` into the offset table.
    pub fn insert(
        &mut self,
        row_tag: address,
        addr: address,
        itr: usize,
        wid: usize,
        now: u64,
        offset_table: &mut OffsetTable,
    ) -> Result<InsertOutcome, BankFull> {
        // 1. the line may already be tracked under this tag
        for row in self.rows.iter_mut().flatten() {
            if row.row_tag != row_tag {
                continue;
            }
            if let Some(line) = row.lines.iter_mut().find(|line| line.addr == addr) {
                offset_table.insert(itr, wid, Some(line.last_itr));
                line.last_itr = itr;
                return Ok(InsertOutcome::CoalescedWord);
            }
        }
        // 2. an open row with this tag may have a free line slot
        for row in self.rows.iter_mut().flatten() {
            if row.row_tag == row_tag && row.lines.len() < self.num_entries_per_row {
                offset_table.insert(itr, wid, None);
                row.lines.push(LineEntry {
                    addr,
                    first_itr: itr,
                    last_itr: itr,
                });
                return Ok(InsertOutcome::CoalescedLine);
            }
        }
        // 3. open a new row (also the overflow path when all same-tag rows
        //    are at line capacity)
        let Some(free) = self.rows.iter().position(Option::is_none) else {
            return Err(BankFull);
        };
        offset_table.insert(itr, wid, None);
        let mut lines = SmallVec::new();
        lines.push(LineEntry {
            addr,
            first_itr: itr,
            last_itr: itr,
        });
        self.rows[free] = Some(Row {
            row_tag,
            filled_at: now,
            lines,
        });
        Ok(InsertOutcome::NewRow)
    }

    fn drain_row(row: Row) -> DrainBatch {
        DrainBatch {
            row_tag: row.row_tag,
            entries: row
                .lines
                .into_iter()
                .map(|line| DrainEntry {
                    addr: line.addr,
                    first_itr: line.first_itr,
                })
                .collect(),
        }
    }

    /// Evict the least-recently-filled row, returning its batch.
    pub fn evict_oldest(&mut self) -> Option<DrainBatch> {
        let oldest = self
            .rows
            .iter()
            .enumerate()
            .filter_map(|(slot, row)| Some((slot, row.as_ref()?.filled_at)))
            .min_by_key(|(_, filled_at)| *filled_at)
            .map(|(slot, _)| slot)?;
        self.rows[oldest].take().map(Self::drain_row)
    }

    /// Drain every open row, oldest first.
    pub fn drain_all(&mut self) -> Vec<DrainBatch> {
        let mut batches: Vec<DrainBatch> = Vec::new();
        while let Some(batch) = self.evict_oldest() {
            batches.push(batch);
        }
        batches
    }
}

/// LRU cache over block-address decode results, so a hot line does not pay
/// the DRAM address slicing on every touch.
#[derive(Debug)]
pub struct RowDecodeCache {
    capacity: usize,
    entries: HashMap<address, CachedDecode>,
}

#[derive(Debug, Clone, Copy)]
struct CachedDecode {
    row_tag: address,
    bank: usize,
    last_used: u64,
}

impl RowDecodeCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
        }
    }

    pub fn get(&mut self, addr: address, now: u64) -> Option<(address, usize)> {
        let entry = self.entries.get_mut(&addr)?;
        entry.last_used = now;
        Some((entry.row_tag, entry.bank))
    }

    pub fn put(&mut self, addr: address, row_tag: address, bank: usize, now: u64) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&addr) {
            let lru = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(addr, _)| *addr);
            if let Some(lru) = lru {
                self.entries.remove(&lru);
            }
        }
        self.entries.insert(
            addr,
            CachedDecode {
                row_tag,
                bank,
                last_used: now,
            },
        );
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_row_addresses_coalesce_into_one_batch() {
        let mut table = RowTable::new(4, 8);
        let mut offsets = OffsetTable::new(64);

        assert_eq!(
            table.insert(7, 0x1000, 0, 0, 0, &mut offsets),
            Ok(InsertOutcome::NewRow)
        );
        assert_eq!(
            table.insert(7, 0x1040, 1, 1, 1, &mut offsets),
            Ok(InsertOutcome::CoalescedLine)
        );
        assert_eq!(table.occupancy(), 1);

        let batches = table.drain_all();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].row_tag, 7);
        let addrs: Vec<_> = batches[0].entries.iter().map(|entry| entry.addr).collect();
        assert_eq!(addrs, vec![0x1000, 0x1040]);
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_line_words_chain_in_order() {
        let mut table = RowTable::new(2, 4);
        let mut offsets = OffsetTable::new(16);

        table.insert(3, 0x2000, 0, 2, 0, &mut offsets).unwrap();
        assert_eq!(
            table.insert(3, 0x2000, 5, 9, 0, &mut offsets),
            Ok(InsertOutcome::CoalescedWord)
        );
        assert_eq!(
            table.insert(3, 0x2000, 11, 2, 0, &mut offsets),
            Ok(InsertOutcome::CoalescedWord)
        );

        let batch = table.evict_oldest().unwrap();
        assert_eq!(batch.entries.len(), 1);
        let chain = offsets.take_chain(batch.entries[0].first_itr);
        assert_eq!(
            chain,
            vec![
                OffsetChainLink { itr: 0, wid: 2 },
                OffsetChainLink { itr: 5, wid: 9 },
                OffsetChainLink { itr: 11, wid: 2 },
            ]
        );
        assert!(offsets.is_drained());
    }

    #[test]
    fn line_capacity_overflow_opens_second_row() {
        let mut table = RowTable::new(4, 2);
        let mut offsets = OffsetTable::new(16);

        table.insert(5, 0x0000, 0, 0, 0, &mut offsets).unwrap();
        table.insert(5, 0x0040, 1, 0, 0, &mut offsets).unwrap();
        // third distinct line under the same tag exceeds per-row capacity
        assert_eq!(
            table.insert(5, 0x0080, 2, 0, 0, &mut offsets),
            Ok(InsertOutcome::NewRow)
        );
        assert_eq!(table.occupancy(), 2);
    }

    #[test]
    fn full_bank_refuses_then_evicts_least_recently_filled() {
        let mut table = RowTable::new(2, 4);
        let mut offsets = OffsetTable::new(16);

        table.insert(1, 0x0000, 0, 0, 10, &mut offsets).unwrap();
        table.insert(2, 0x1000, 1, 0, 20, &mut offsets).unwrap();
        assert_eq!(
            table.insert(3, 0x2000, 2, 0, 30, &mut offsets),
            Err(BankFull)
        );

        let evicted = table.evict_oldest().unwrap();
        assert_eq!(evicted.row_tag, 1);
        assert_eq!(
            table.insert(3, 0x2000, 2, 0, 30, &mut offsets),
            Ok(InsertOutcome::NewRow)
        );
    }

    #[test]
    fn decode_cache_evicts_least_recently_used() {
        let mut cache = RowDecodeCache::new(2);
        cache.put(0x1000, 11, 0, 1);
        cache.put(0x2000, 22, 1, 2);
        // touch the first entry so the second becomes LRU
        assert_eq!(cache.get(0x1000, 3), Some((11, 0)));
        cache.put(0x3000, 33, 2, 4);
        assert_eq!(cache.get(0x2000, 5), None);
        assert_eq!(cache.get(0x1000, 6), Some((11, 0)));
        assert_eq!(cache.get(0x3000, 7), Some((33, 2)));
    }
}
