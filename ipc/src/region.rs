use {
    crate::{semaphore::Permit, Error},
    std::{fmt, ptr, sync::Arc},
};

#[cfg(feature = "sysv")]
use crate::backend::sysv;

#[cfg(feature = "threads")]
use crate::backend::threads;

pub const CHUNK_SIZE: usize = 512;
pub const CHUNKS_PER_REGION: usize = 3;
pub const REGION_SIZE: usize = CHUNK_SIZE * CHUNKS_PER_REGION;

/// One of the fixed subdivisions of a region.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Chunk {
    A,
    B,
    C,
}

impl Chunk {
    pub const ALL: [Chunk; CHUNKS_PER_REGION] = [Chunk::A, Chunk::B, Chunk::C];

    pub fn index(self) -> usize {
        match self {
            Chunk::A => 0,
            Chunk::B => 1,
            Chunk::C => 2,
        }
    }
}

impl TryFrom<usize> for Chunk {
    type Error = Error;

    fn try_from(index: usize) -> Result<Self, Self::Error> {
        Chunk::ALL.get(index).copied().ok_or(Error::OutOfRange {
            what: "chunk",
            index,
            len: CHUNKS_PER_REGION,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChunkAddr {
    pub region: usize,
    pub chunk: Chunk,
}

impl ChunkAddr {
    pub fn new(region: usize, chunk: Chunk) -> ChunkAddr {
        ChunkAddr { region, chunk }
    }
}

impl fmt::Display for ChunkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.region, self.chunk)
    }
}

/// Address of a mapping that is valid in every worker of the run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SharedAddr(pub(crate) *mut u8);

unsafe impl Send for SharedAddr {}
unsafe impl Sync for SharedAddr {}

#[derive(Clone, Debug)]
pub enum RegionHandle {
    #[cfg(feature = "sysv")]
    SysV { id: libc::c_int, addr: SharedAddr },

    #[cfg(feature = "threads")]
    Local(Arc<threads::LocalRegion>),

    Unsupported,
}

impl RegionHandle {
    fn base(&self) -> *mut u8 {
        match self {
            #[cfg(feature = "sysv")]
            RegionHandle::SysV { addr, .. } => addr.0,
            #[cfg(feature = "threads")]
            RegionHandle::Local(region) => region.as_mut_ptr(),
            RegionHandle::Unsupported => ptr::null_mut(),
        }
    }

    fn free(&self) -> Result<(), Error> {
        match self {
            #[cfg(feature = "sysv")]
            RegionHandle::SysV { id, addr } => sysv::free_region(*id, *addr),
            #[cfg(feature = "threads")]
            RegionHandle::Local(region) => region.free(),
            RegionHandle::Unsupported => Ok(()),
        }
    }
}

/// Owner of one shared allocation. Freed exactly once, explicitly or on
/// drop.
#[derive(Debug)]
pub struct Region {
    view: RegionView,
    freed: bool,
}

impl Region {
    pub(crate) fn new(handle: RegionHandle, len: usize) -> Region {
        Region {
            view: RegionView { handle, len },
            freed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.view.len
    }

    pub fn is_empty(&self) -> bool {
        self.view.len == 0
    }

    pub fn view(&self) -> RegionView {
        self.view.clone()
    }

    pub fn free(mut self) -> Result<(), Error> {
        self.freed = true;
        self.view.handle.free()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.freed {
            return;
        }
        log::warn!("region of {} bytes dropped without explicit teardown", self.len());
        if let Err(e) = self.view.handle.free() {
            log::error!("failed to free region: {}", e);
        }
    }
}

#[derive(Clone, Debug)]
pub struct RegionView {
    handle: RegionHandle,
    len: usize,
}

impl RegionView {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base of the mapping in the calling worker. Accesses through it are
    /// not synchronized; the caller is responsible for that.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.handle.base()
    }

    fn chunk_ptr(&self, chunk: Chunk) -> *mut u8 {
        // Every pool region is REGION_SIZE long, so the offset is in bounds.
        unsafe { self.handle.base().add(chunk.index() * CHUNK_SIZE) }
    }
}

/// The fixed set of regions the workers swap chunks between.
#[derive(Debug)]
pub struct RegionPool {
    regions: Vec<Region>,
}

impl RegionPool {
    pub(crate) fn new(regions: Vec<Region>) -> RegionPool {
        RegionPool { regions }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Every chunk address in the pool, region-major.
    pub fn addresses(&self) -> impl Iterator<Item = ChunkAddr> {
        let len = self.len();
        (0..len).flat_map(|region| Chunk::ALL.into_iter().map(move |c| ChunkAddr::new(region, c)))
    }

    /// Copies a chunk out. Only meaningful while no worker holds a permit.
    pub fn read_chunk(&self, addr: ChunkAddr) -> Result<[u8; CHUNK_SIZE], Error> {
        let src = self.region(addr)?.chunk_ptr(addr.chunk);
        let mut out = [0u8; CHUNK_SIZE];
        unsafe { ptr::copy_nonoverlapping(src, out.as_mut_ptr(), CHUNK_SIZE) };
        Ok(out)
    }

    /// Seeds a chunk. Only meaningful before the pool is shared with workers.
    pub fn write_chunk(&mut self, addr: ChunkAddr, data: &[u8; CHUNK_SIZE]) -> Result<(), Error> {
        let dst = self.region(addr)?.chunk_ptr(addr.chunk);
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst, CHUNK_SIZE) };
        Ok(())
    }

    pub fn view(&self) -> Regions {
        Regions {
            regions: self.regions.iter().map(Region::view).collect(),
        }
    }

    /// Frees every region, attempting all of them even if one fails.
    pub fn free(self) -> Result<(), Error> {
        log::debug!("freeing {} regions", self.regions.len());
        let mut first_error = None;
        for region in self.regions {
            if let Err(e) = region.free() {
                log::error!("failed to free region: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn region(&self, addr: ChunkAddr) -> Result<&RegionView, Error> {
        self.regions
            .get(addr.region)
            .map(|region| &region.view)
            .ok_or(Error::OutOfRange {
                what: "region",
                index: addr.region,
                len: self.regions.len(),
            })
    }
}

/// A worker's view of the pool. Swapping requires a permit, which is the
/// only way workers mutate the pool.
#[derive(Clone, Debug)]
pub struct Regions {
    regions: Arc<[RegionView]>,
}

impl Regions {
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn check(&self, addr: ChunkAddr) -> Result<ChunkAddr, Error> {
        self.chunk_ptr(addr).map(|_| addr)
    }

    /// Exchanges the contents of two chunks. Swapping a chunk with itself
    /// leaves it untouched.
    ///
    /// The permit must come from the semaphore set that guards this pool.
    /// Its type only shows that the caller is inside some critical section,
    /// not which one.
    pub fn swap(&self, _permit: &Permit<'_>, a: ChunkAddr, b: ChunkAddr) -> Result<(), Error> {
        let pa = self.chunk_ptr(a)?;
        let pb = self.chunk_ptr(b)?;
        if pa == pb {
            return Ok(());
        }
        // Distinct chunks never overlap.
        unsafe { ptr::swap_nonoverlapping(pa, pb, CHUNK_SIZE) };
        Ok(())
    }

    fn chunk_ptr(&self, addr: ChunkAddr) -> Result<*mut u8, Error> {
        self.regions
            .get(addr.region)
            .map(|region| region.chunk_ptr(addr.chunk))
            .ok_or(Error::OutOfRange {
                what: "region",
                index: addr.region,
                len: self.regions.len(),
            })
    }
}
