use {
    bytemuck::{Pod, Zeroable},
    std::{
        mem, ptr,
        sync::atomic::{AtomicU64, Ordering},
    },
};

/// One critical section: who ran it and the logical ticks at which it was
/// entered and left.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Entry {
    pub worker: u32,
    pub iteration: u32,
    pub enter: u64,
    pub exit: u64,
}

const ENTRY_SIZE: usize = mem::size_of::<Entry>();

// Header layout: the logical clock, then the next free slot.
const CLOCK_OFFSET: usize = 0;
const SLOTS_OFFSET: usize = 8;
const HEADER_SIZE: usize = 16;

/// Coordinator-side owner of the journal region.
pub struct Journal {
    region: ipc::Region,
    capacity: usize,
}

impl Journal {
    pub fn byte_size(capacity: usize) -> usize {
        HEADER_SIZE + capacity * ENTRY_SIZE
    }

    pub fn new<A: ipc::Adapter>(ctx: &ipc::Context<A>, capacity: usize) -> Result<Journal, ipc::Error> {
        let region = ctx.new_region(Journal::byte_size(capacity))?;
        Ok(Journal { region, capacity })
    }

    pub fn writer(&self) -> Writer {
        Writer {
            region: self.region.view(),
            capacity: self.capacity,
        }
    }

    /// Recorded entries in the order they were entered. Only meaningful once
    /// every worker has finished.
    pub fn entries(&self) -> Vec<Entry> {
        self.writer().entries()
    }

    pub fn free(self) -> Result<(), ipc::Error> {
        self.region.free()
    }
}

/// A worker's handle on the journal. Slots are claimed atomically, so any
/// number of concurrent critical sections can record without colliding.
#[derive(Clone, Debug)]
pub struct Writer {
    region: ipc::RegionView,
    capacity: usize,
}

impl Writer {
    fn counter(&self, offset: usize) -> &AtomicU64 {
        // Region bases are at least 8-byte aligned and the header lies
        // within the region.
        unsafe { &*(self.region.as_mut_ptr().add(offset) as *const AtomicU64) }
    }

    pub fn tick(&self) -> u64 {
        self.counter(CLOCK_OFFSET).fetch_add(1, Ordering::SeqCst)
    }

    pub fn record(&self, entry: Entry) {
        let slot = self.counter(SLOTS_OFFSET).fetch_add(1, Ordering::SeqCst) as usize;
        if slot >= self.capacity {
            log::warn!("journal full, dropping entry for worker {}", entry.worker);
            return;
        }
        let bytes = bytemuck::bytes_of(&entry);
        unsafe {
            let dst = self.region.as_mut_ptr().add(HEADER_SIZE + slot * ENTRY_SIZE);
            ptr::copy_nonoverlapping(bytes.as_ptr(), dst, ENTRY_SIZE);
        }
    }

    fn entries(&self) -> Vec<Entry> {
        let count = (self.counter(SLOTS_OFFSET).load(Ordering::SeqCst) as usize).min(self.capacity);
        let bytes = unsafe {
            std::slice::from_raw_parts(self.region.as_mut_ptr().add(HEADER_SIZE), count * ENTRY_SIZE)
        };
        let mut entries: Vec<Entry> = bytes
            .chunks_exact(ENTRY_SIZE)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        entries.sort_by_key(|entry| entry.enter);
        entries
    }
}

/// Workers in critical-section entry order.
pub fn entry_order(entries: &[Entry]) -> Vec<u32> {
    let mut sorted = entries.to_vec();
    sorted.sort_by_key(|entry| entry.enter);
    sorted.iter().map(|entry| entry.worker).collect()
}

/// Largest number of critical sections that were open at the same tick.
pub fn max_overlap(entries: &[Entry]) -> usize {
    let mut events: Vec<(u64, i64)> = entries
        .iter()
        .flat_map(|entry| [(entry.enter, 1), (entry.exit, -1)])
        .collect();
    events.sort();
    let mut open = 0i64;
    let mut max = 0i64;
    for (_, delta) in events {
        open += delta;
        max = max.max(open);
    }
    max as usize
}
