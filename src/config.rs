use super::addrdec::{AddressMap, DramGeometry, Translation};
use super::address;
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{what} must be nonzero")]
    Zero { what: &'static str },
    #[error("{what} must be a power of two (got {got})")]
    NotPowerOfTwo { what: &'static str, got: usize },
    #[error("num_tile_elements {got} exceeds the 16-bit tile size field")]
    TileElementsTooLarge { got: usize },
    #[error("memory_size {got:#x} must be {align}-byte aligned")]
    MemoryMisaligned { got: address, align: address },
}

/// All construction-time parameters of the accelerator. Immutable once the
/// accelerator is built; derived values (address map, port budgets) are
/// computed exactly once from this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub num_tiles: usize,
    pub num_tile_elements: usize,
    pub num_regs: usize,
    pub num_instructions: usize,

    pub num_stream_access_units: usize,
    pub num_indirect_access_units: usize,
    pub num_range_units: usize,
    pub num_alu_units: usize,

    pub num_alu_lanes: usize,
    pub alu_lane_latency: u64,

    pub num_row_table_banks: usize,
    pub num_row_table_rows_per_bank: usize,
    pub num_row_table_entries_per_row: usize,
    pub num_row_table_config_cache_entries: usize,
    pub rowtable_latency: u64,

    pub spd_read_latency: u64,
    pub spd_write_latency: u64,
    pub num_spd_read_ports: usize,
    pub num_spd_write_ports: usize,

    /// End of normal system memory; the six accelerator ranges start here.
    pub memory_size: address,
    pub dram: DramGeometry,
    pub translation: Translation,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_tiles: 32,
            num_tile_elements: 1024,
            num_regs: 32,
            num_instructions: 32,
            num_stream_access_units: 1,
            num_indirect_access_units: 1,
            num_range_units: 1,
            num_alu_units: 1,
            num_alu_lanes: 16,
            alu_lane_latency: 1,
            num_row_table_banks: 4,
            num_row_table_rows_per_bank: 64,
            num_row_table_entries_per_row: 16,
            num_row_table_config_cache_entries: 16,
            rowtable_latency: 1,
            spd_read_latency: 1,
            spd_write_latency: 1,
            num_spd_read_ports: 2,
            num_spd_write_ports: 2,
            memory_size: 0x8000_0000,
            dram: DramGeometry::default(),
            translation: Translation::identity(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            (self.num_tiles, "num_tiles"),
            (self.num_tile_elements, "num_tile_elements"),
            (self.num_regs, "num_regs"),
            (self.num_instructions, "num_instructions"),
            (self.num_stream_access_units, "num_stream_access_units"),
            (self.num_indirect_access_units, "num_indirect_access_units"),
            (self.num_range_units, "num_range_units"),
            (self.num_alu_units, "num_alu_units"),
            (self.num_alu_lanes, "num_alu_lanes"),
            (self.num_row_table_banks, "num_row_table_banks"),
            (self.num_row_table_rows_per_bank, "num_row_table_rows_per_bank"),
            (
                self.num_row_table_entries_per_row,
                "num_row_table_entries_per_row",
            ),
            (self.num_spd_read_ports, "num_spd_read_ports"),
            (self.num_spd_write_ports, "num_spd_write_ports"),
        ];
        for (value, what) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero { what });
            }
        }
        if self.num_tile_elements > u16::MAX as usize {
            return Err(ConfigError::TileElementsTooLarge {
                got: self.num_tile_elements,
            });
        }
        let power_of_two = [
            (self.dram.num_channels, "dram.num_channels"),
            (self.dram.num_ranks, "dram.num_ranks"),
            (self.dram.num_bank_groups, "dram.num_bank_groups"),
            (self.dram.num_banks, "dram.num_banks"),
            (self.dram.num_rows, "dram.num_rows"),
            (self.dram.num_columns, "dram.num_columns"),
        ];
        for (value, what) in power_of_two {
            if !value.is_power_of_two() {
                return Err(ConfigError::NotPowerOfTwo { what, got: value });
            }
        }
        let align = super::addrdec::BLOCK_SIZE;
        if self.memory_size % align != 0 {
            return Err(ConfigError::MemoryMisaligned {
                got: self.memory_size,
                align,
            });
        }
        Ok(())
    }

    /// The six address-mapped ranges, laid out from `memory_size` up.
    #[must_use]
    pub fn address_map(&self) -> AddressMap {
        AddressMap::new(
            self.memory_size,
            self.num_tiles,
            self.num_tile_elements,
            self.num_regs,
        )
    }

    /// Cache-side outstanding-packet budget: enough for every stream and
    /// indirect unit to keep a full tile in flight, floored at 512.
    #[must_use]
    pub fn max_outstanding_cache_side(&self) -> usize {
        let units = self.num_stream_access_units + self.num_indirect_access_units;
        (units * self.num_tile_elements).max(512)
    }

    /// Memory-side outstanding-packet budget; the extra unit share is the
    /// invalidator's reserved capacity.
    #[must_use]
    pub fn max_outstanding_mem_side(&self) -> usize {
        let units = 1 + self.num_indirect_access_units;
        (units * self.num_tile_elements).max(512)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions_sorted::assert_eq;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
    }

    #[test]
    fn zero_unit_count_is_fatal() {
        let config = Config {
            num_indirect_access_units: 0,
            ..Config::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                what: "num_indirect_access_units"
            })
        );
    }

    #[test]
    fn tile_elements_must_fit_size_field() {
        let config = Config {
            num_tile_elements: 70_000,
            ..Config::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::TileElementsTooLarge { got: 70_000 })
        );
    }

    #[test]
    fn budgets_match_reference_scenario() {
        // num_stream=1, num_indirect=1, num_tile_elements=1024
        let config = Config::default();
        assert_eq!(config.max_outstanding_cache_side(), 2048);
        assert_eq!(config.max_outstanding_mem_side(), 2048);
    }

    #[test]
    fn budgets_are_floored_at_512() {
        let config = Config {
            num_tile_elements: 64,
            ..Config::default()
        };
        assert_eq!(config.max_outstanding_cache_side(), 512);
        assert_eq!(config.max_outstanding_mem_side(), 512);
    }

    #[test]
    fn config_deserializes_from_yaml_with_defaults() {
        let config: Config = serde_yaml::from_str(
            "num_tiles: 16\nnum_tile_elements: 256\nnum_indirect_access_units: 2\n",
        )
        .unwrap();
        assert_eq!(config.num_tiles, 16);
        assert_eq!(config.num_tile_elements, 256);
        assert_eq!(config.num_indirect_access_units, 2);
        // untouched fields keep their defaults
        assert_eq!(config.num_regs, 32);
        config.validate().unwrap();
    }
}
