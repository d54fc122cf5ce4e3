use std::collections::HashSet;

/// Bounded port allocator over an inclusive range.
///
/// A cursor walks the range and wraps, skipping ports still in use, so
/// consecutive allocations are increasing and a released port is only handed
/// out again once the cursor comes back around.
#[derive(Debug)]
pub struct PortPool {
    start: u16,
    end: u16,
    cursor: u16,
    in_use: HashSet<u16>,
}

impl PortPool {
    pub fn new(start: u16, end: u16) -> Self {
        debug_assert!(start <= end);
        Self {
            start,
            end,
            cursor: start,
            in_use: HashSet::new(),
        }
    }

    fn capacity(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    fn nth_after_cursor(&self, i: u32) -> u16 {
        let offset = (u32::from(self.cursor - self.start) + i) % self.capacity();
        (u32::from(self.start) + offset) as u16
    }

    /// Next free port, or `None` when every port in the range is taken.
    pub fn allocate(&mut self) -> Option<u16> {
        for i in 0..self.capacity() {
            let port = self.nth_after_cursor(i);
            if self.in_use.insert(port) {
                self.cursor = if port == self.end { self.start } else { port + 1 };
                return Some(port);
            }
        }
        None
    }

    /// Return a port to the pool. Returns false if it was not allocated.
    pub fn release(&mut self, port: u16) -> bool {
        self.in_use.remove(&port)
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }
}
