//! Scratchpad (SPD) tiles with size/ready sidecars, and the scalar register
//! file. Access timing is modeled by booking the earliest-free port.

/// One fixed-capacity scratchpad tile.
#[derive(Debug, Clone)]
pub struct Tile {
    data: Vec<u32>,
    size: u16,
    ready: bool,
}

impl Tile {
    fn new(num_tile_elements: usize) -> Self {
        Self {
            data: vec![0; num_tile_elements],
            size: 0,
            ready: true,
        }
    }
}

#[derive(Debug)]
pub struct Scratchpad {
    tiles: Vec<Tile>,
    num_tile_elements: usize,
    read_latency: u64,
    write_latency: u64,
    /// Cycle each port becomes free again.
    read_port_busy_until: Vec<u64>,
    write_port_busy_until: Vec<u64>,
}

impl Scratchpad {
    #[must_use]
    pub fn new(
        num_tiles: usize,
        num_tile_elements: usize,
        read_latency: u64,
        write_latency: u64,
        num_read_ports: usize,
        num_write_ports: usize,
    ) -> Self {
        assert!(num_read_ports > 0);
        assert!(num_write_ports > 0);
        Self {
            tiles: (0..num_tiles).map(|_| Tile::new(num_tile_elements)).collect(),
            num_tile_elements,
            read_latency,
            write_latency,
            read_port_busy_until: vec![0; num_read_ports],
            write_port_busy_until: vec![0; num_write_ports],
        }
    }

    #[must_use]
    pub fn num_tiles(&self) -> usize {
        self.tiles.len()
    }

    #[must_use]
    pub fn num_tile_elements(&self) -> usize {
        self.num_tile_elements
    }

    #[must_use]
    pub fn get_data(&self, tile_id: usize, element_id: usize) -> u32 {
        assert!(tile_id < self.tiles.len());
        assert!(element_id < self.num_tile_elements);
        self.tiles[tile_id].data[element_id]
    }

    pub fn set_data(&mut self, tile_id: usize, element_id: usize, data: u32) {
        assert!(tile_id < self.tiles.len());
        assert!(element_id < self.num_tile_elements);
        self.tiles[tile_id].data[element_id] = data;
    }

    #[must_use]
    pub fn get_ready(&self, tile_id: usize) -> bool {
        assert!(tile_id < self.tiles.len());
        self.tiles[tile_id].ready
    }

    pub fn set_ready(&mut self, tile_id: usize) {
        assert!(tile_id < self.tiles.len());
        self.tiles[tile_id].ready = true;
    }

    pub fn unset_ready(&mut self, tile_id: usize) {
        assert!(tile_id < self.tiles.len());
        self.tiles[tile_id].ready = false;
    }

    #[must_use]
    pub fn get_size(&self, tile_id: usize) -> u16 {
        assert!(tile_id < self.tiles.len());
        self.tiles[tile_id].size
    }

    pub fn set_size(&mut self, tile_id: usize, size: u16) {
        assert!(tile_id < self.tiles.len());
        assert!(size as usize <= self.num_tile_elements);
        self.tiles[tile_id].size = size;
    }

    /// Book `num_accesses` element reads on the earliest-free read port.
    ///
    /// Returns the cycle the data is available and whether the access had to
    /// wait for a port.
    pub fn book_read(&mut self, now: u64, num_accesses: u64) -> (u64, bool) {
        Self::book(
            &mut self.read_port_busy_until,
            now,
            self.read_latency * num_accesses,
        )
    }

    /// Book `num_accesses` element writes on the earliest-free write port.
    pub fn book_write(&mut self, now: u64, num_accesses: u64) -> (u64, bool) {
        Self::book(
            &mut self.write_port_busy_until,
            now,
            self.write_latency * num_accesses,
        )
    }

    fn book(busy_until: &mut [u64], now: u64, duration: u64) -> (u64, bool) {
        let port = busy_until
            .iter()
            .enumerate()
            .min_by_key(|(_, busy)| **busy)
            .map(|(port, _)| port)
            .unwrap_or(0);
        let conflict = busy_until[port] > now;
        let start = busy_until[port].max(now);
        busy_until[port] = start + duration;
        (busy_until[port], conflict)
    }
}

#[derive(Debug, Clone)]
pub struct RegisterFile {
    data: Vec<u32>,
}

impl RegisterFile {
    #[must_use]
    pub fn new(num_regs: usize) -> Self {
        Self {
            data: vec![0; num_regs],
        }
    }

    #[must_use]
    pub fn num_regs(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn get(&self, reg_id: usize) -> u32 {
        assert!(reg_id < self.data.len());
        self.data[reg_id]
    }

    pub fn set(&mut self, reg_id: usize, data: u32) {
        assert!(reg_id < self.data.len());
        self.data[reg_id] = data;
    }

    #[must_use]
    pub fn get_signed(&self, reg_id: usize) -> i32 {
        self.get(reg_id) as i32
    }

    pub fn set_signed(&mut self, reg_id: usize, data: i32) {
        self.set(reg_id, data as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiles_start_ready_empty_and_zeroed() {
        let spd = Scratchpad::new(4, 16, 1, 1, 2, 2);
        for tile_id in 0..4 {
            assert!(spd.get_ready(tile_id));
            assert_eq!(spd.get_size(tile_id), 0);
            assert_eq!(spd.get_data(tile_id, 15), 0);
        }
    }

    #[test]
    fn read_observes_most_recent_write_once_ready() {
        let mut spd = Scratchpad::new(2, 16, 1, 1, 1, 1);
        spd.unset_ready(1);
        spd.set_data(1, 3, 0xdead);
        spd.set_data(1, 3, 0xbeef);
        spd.set_size(1, 4);
        spd.set_ready(1);
        assert_eq!(spd.get_data(1, 3), 0xbeef);
        assert_eq!(spd.get_size(1), 4);
    }

    #[test]
    #[should_panic]
    fn element_index_out_of_bounds_panics() {
        let spd = Scratchpad::new(2, 16, 1, 1, 1, 1);
        let _ = spd.get_data(0, 16);
    }

    #[test]
    #[should_panic]
    fn tile_index_out_of_bounds_panics() {
        let spd = Scratchpad::new(2, 16, 1, 1, 1, 1);
        let _ = spd.get_data(2, 0);
    }

    #[test]
    fn port_booking_serializes_past_port_count() {
        let mut spd = Scratchpad::new(2, 16, 2, 1, 2, 1);
        // two ports absorb two concurrent reads
        let (done_a, conflict_a) = spd.book_read(10, 1);
        let (done_b, conflict_b) = spd.book_read(10, 1);
        assert_eq!((done_a, conflict_a), (12, false));
        assert_eq!((done_b, conflict_b), (12, false));
        // the third waits for a port to free up
        let (done_c, conflict_c) = spd.book_read(10, 1);
        assert_eq!((done_c, conflict_c), (14, true));
    }

    #[test]
    fn write_port_booking_scales_with_access_count() {
        let mut spd = Scratchpad::new(2, 16, 1, 3, 1, 1);
        let (done, conflict) = spd.book_write(0, 4);
        assert_eq!((done, conflict), (12, false));
    }

    #[test]
    fn register_file_roundtrips_signed_values() {
        let mut rf = RegisterFile::new(8);
        rf.set_signed(3, -7);
        assert_eq!(rf.get_signed(3), -7);
        assert_eq!(rf.num_regs(), 8);
    }
}
