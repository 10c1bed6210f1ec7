use super::address;
use serde::{Deserialize, Serialize};

/// Cache block size of the downstream ports.
pub const BLOCK_SIZE: address = 64;

/// Scratchpad element and scalar register width.
pub const WORD_SIZE: address = 4;

/// Size of the address-mapped instruction trigger region.
///
/// Fixed independent of `num_instructions`: the region is a doorbell, not a
/// backing store. Slots live in the decode table behind it.
pub const INSTRUCTION_FILE_SIZE: address = 64;

#[must_use]
pub fn block_align(addr: address) -> address {
    addr & !(BLOCK_SIZE - 1)
}

/// The six address-mapped regions of the accelerator, in layout order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::EnumIter, strum::EnumCount,
)]
pub enum Region {
    SpdDataCacheable,
    SpdDataNoncacheable,
    SpdSize,
    SpdReady,
    Scalar,
    InstructionFile,
}

impl Region {
    /// Only scratchpad data read through the cache hierarchy is cacheable.
    #[must_use]
    pub fn is_cacheable(self) -> bool {
        self == Region::SpdDataCacheable
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("address {addr:#x} outside all accelerator ranges")]
    OutOfRange { addr: address },
    #[error("address {addr:#x} not aligned to {required} bytes")]
    Misaligned { addr: address, required: address },
    #[error("{cmd} to {region:?} region is illegal")]
    IllegalAccess { region: Region, cmd: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: address,
    pub end: address,
}

impl AddressRange {
    #[must_use]
    pub fn contains(&self, addr: address) -> bool {
        self.start <= addr && addr < self.end
    }

    #[must_use]
    pub fn size(&self) -> address {
        self.end - self.start
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:#x}..{:#x}", self.start, self.end)
    }
}

/// The six ranges laid out back to back from the end of system memory.
///
/// Computed once at construction and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressMap {
    ranges: [AddressRange; 6],
}

impl AddressMap {
    #[must_use]
    pub fn new(
        base: address,
        num_tiles: usize,
        num_tile_elements: usize,
        num_regs: usize,
    ) -> Self {
        let spd_data_size = (num_tiles * num_tile_elements) as address * WORD_SIZE;
        let spd_size_size = num_tiles as address * 2;
        let spd_ready_size = num_tiles as address * 2;
        let scalar_regs_size = num_regs as address * WORD_SIZE;

        let sizes = [
            spd_data_size,
            spd_data_size,
            spd_size_size,
            spd_ready_size,
            scalar_regs_size,
            INSTRUCTION_FILE_SIZE,
        ];
        let mut start = base;
        let ranges = sizes.map(|size| {
            let range = AddressRange {
                start,
                end: start + size,
            };
            start = range.end;
            range
        });
        Self { ranges }
    }

    #[must_use]
    pub fn range(&self, region: Region) -> AddressRange {
        self.ranges[region as usize]
    }

    #[must_use]
    pub fn ranges(&self) -> &[AddressRange; 6] {
        &self.ranges
    }

    #[must_use]
    pub fn start(&self) -> address {
        self.ranges[0].start
    }

    #[must_use]
    pub fn end(&self) -> address {
        self.ranges[5].end
    }

    #[must_use]
    pub fn total_size(&self) -> address {
        self.end() - self.start()
    }

    /// Resolve an upstream address to its region and byte offset within it.
    pub fn resolve(&self, addr: address) -> Result<(Region, address), Fault> {
        use strum::IntoEnumIterator;
        for region in Region::iter() {
            let range = self.range(region);
            if range.contains(addr) {
                return Ok((region, addr - range.start));
            }
        }
        Err(Fault::OutOfRange { addr })
    }
}

/// DRAM organization used to decode physical addresses.
///
/// Level sizes must be powers of two; the address is sliced RoBaRaCoCh style
/// from the LSB up: channel, column, rank, bank group, bank, row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DramGeometry {
    pub num_channels: usize,
    pub num_ranks: usize,
    pub num_bank_groups: usize,
    pub num_banks: usize,
    pub num_rows: usize,
    pub num_columns: usize,
}

impl Default for DramGeometry {
    fn default() -> Self {
        Self {
            num_channels: 2,
            num_ranks: 1,
            num_bank_groups: 4,
            num_banks: 4,
            num_rows: 1 << 16,
            num_columns: 1 << 10,
        }
    }
}

/// A physical address decoded into DRAM coordinates.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DramCoord {
    pub channel: usize,
    pub rank: usize,
    pub bank_group: usize,
    pub bank: usize,
    pub row: usize,
    pub column: usize,
}

#[derive(Debug, Clone)]
pub struct DramAddressMap {
    geometry: DramGeometry,
    /// log2 of the burst size sliced off before level decoding.
    tx_offset: u32,
}

fn slice_lower_bits(addr: &mut address, bits: u32) -> usize {
    let lower = *addr & ((1u64 << bits) - 1);
    *addr >>= bits;
    lower as usize
}

impl DramAddressMap {
    #[must_use]
    pub fn new(geometry: DramGeometry) -> Self {
        debug_assert!(geometry.num_channels.is_power_of_two());
        debug_assert!(geometry.num_ranks.is_power_of_two());
        debug_assert!(geometry.num_bank_groups.is_power_of_two());
        debug_assert!(geometry.num_banks.is_power_of_two());
        debug_assert!(geometry.num_rows.is_power_of_two());
        debug_assert!(geometry.num_columns.is_power_of_two());
        Self {
            geometry,
            tx_offset: BLOCK_SIZE.trailing_zeros(),
        }
    }

    #[must_use]
    pub fn geometry(&self) -> &DramGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn decode(&self, addr: address) -> DramCoord {
        let g = &self.geometry;
        let mut addr = addr >> self.tx_offset;
        let channel = slice_lower_bits(&mut addr, g.num_channels.trailing_zeros());
        let column = slice_lower_bits(&mut addr, g.num_columns.trailing_zeros());
        let rank = slice_lower_bits(&mut addr, g.num_ranks.trailing_zeros());
        let bank_group = slice_lower_bits(&mut addr, g.num_bank_groups.trailing_zeros());
        let bank = slice_lower_bits(&mut addr, g.num_banks.trailing_zeros());
        let row = slice_lower_bits(&mut addr, g.num_rows.trailing_zeros());
        DramCoord {
            channel,
            rank,
            bank_group,
            bank,
            row,
            column,
        }
    }

    /// Global row tag: unique per physical DRAM row across bank pairs.
    ///
    /// Two addresses share a tag exactly when they activate the same row.
    #[must_use]
    pub fn global_row(&self, coord: DramCoord) -> address {
        let g = &self.geometry;
        let mut grow = (coord.bank_group >> 1) * g.num_banks;
        grow = (grow + coord.bank) * g.num_rows;
        (grow + coord.row) as address
    }

    /// Row-table bank an address is steered to.
    #[must_use]
    pub fn row_table_bank(&self, coord: DramCoord, num_row_table_banks: usize) -> usize {
        let g = &self.geometry;
        let bank = (coord.channel * g.num_ranks + coord.rank) * g.num_bank_groups
            + coord.bank_group;
        bank % num_row_table_banks
    }
}

/// Single-range translation from the accelerator's virtual view to physical
/// addresses. Instruction base addresses are virtual; everything issued
/// downstream is physical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub range: AddressRange,
    pub physical_base: address,
}

impl Translation {
    /// Identity mapping over all addresses.
    #[must_use]
    pub fn identity() -> Self {
        Self {
            range: AddressRange {
                start: 0,
                end: address::MAX,
            },
            physical_base: 0,
        }
    }

    pub fn translate(&self, vaddr: address) -> Result<address, Fault> {
        if !self.range.contains(vaddr) {
            return Err(Fault::OutOfRange { addr: vaddr });
        }
        Ok(self.physical_base + (vaddr - self.range.start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn address_map_is_contiguous_and_ordered() {
        let map = AddressMap::new(0x8000_0000, 32, 1024, 32);
        let ranges = map.ranges();
        for window in ranges.windows(2) {
            assert_eq!(window[0].end, window[1].start);
            assert!(window[0].start < window[0].end);
        }
        let total: u64 = ranges.iter().map(AddressRange::size).sum();
        assert_eq!(total, map.total_size());
    }

    #[test]
    fn address_map_sizes_match_reference_scenario() {
        // num_tiles=32, num_tile_elements=1024, num_regs=32
        let map = AddressMap::new(0x8000_0000, 32, 1024, 32);
        assert_eq!(map.range(Region::SpdDataCacheable).size(), 131_072);
        assert_eq!(map.range(Region::SpdDataNoncacheable).size(), 131_072);
        assert_eq!(map.range(Region::SpdSize).size(), 64);
        assert_eq!(map.range(Region::SpdReady).size(), 64);
        assert_eq!(map.range(Region::Scalar).size(), 128);
        assert_eq!(map.range(Region::InstructionFile).size(), 64);
        assert_eq!(map.total_size(), 262_464);
    }

    #[test]
    fn only_first_region_is_cacheable() {
        for region in Region::iter() {
            assert_eq!(region.is_cacheable(), region == Region::SpdDataCacheable);
        }
    }

    #[test]
    fn resolve_finds_each_region_and_faults_outside() {
        let map = AddressMap::new(0x8000_0000, 4, 16, 8);
        for region in Region::iter() {
            let range = map.range(region);
            assert_eq!(map.resolve(range.start), Ok((region, 0)));
            assert_eq!(map.resolve(range.end - 1), Ok((region, range.size() - 1)));
        }
        assert_eq!(
            map.resolve(map.start() - 1),
            Err(Fault::OutOfRange {
                addr: map.start() - 1
            })
        );
        assert_eq!(
            map.resolve(map.end()),
            Err(Fault::OutOfRange { addr: map.end() })
        );
    }

    #[test]
    fn instruction_file_size_is_fixed() {
        let small = AddressMap::new(0, 4, 16, 8);
        let large = AddressMap::new(0, 64, 2048, 64);
        assert_eq!(small.range(Region::InstructionFile).size(), 64);
        assert_eq!(large.range(Region::InstructionFile).size(), 64);
    }

    #[test]
    fn same_row_addresses_share_a_tag() {
        let map = DramAddressMap::new(DramGeometry::default());
        let a = map.decode(0x1000);
        let b = map.decode(0x1040);
        // both blocks sit in the same channel and row
        if a.channel == b.channel && a.row == b.row && a.bank == b.bank {
            assert_eq!(map.global_row(a), map.global_row(b));
        }
    }

    #[test]
    fn decode_roundtrips_block_alignment() {
        let map = DramAddressMap::new(DramGeometry::default());
        let coord = map.decode(0xdead_beef);
        assert_eq!(coord, map.decode(block_align(0xdead_beef)));
        assert!(coord.bank < map.geometry().num_banks);
        assert!(coord.row < map.geometry().num_rows);
    }

    #[test]
    fn translation_offsets_within_range() {
        let translation = Translation {
            range: AddressRange {
                start: 0x1000,
                end: 0x2000,
            },
            physical_base: 0x10_0000,
        };
        assert_eq!(translation.translate(0x1040), Ok(0x10_0040));
        assert!(translation.translate(0x2000).is_err());
        assert_eq!(Translation::identity().translate(0x42), Ok(0x42));
    }
}
