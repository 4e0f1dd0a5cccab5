//! Executable memory allocation in a target process
//!
//! Trampolines and jump islands live in pages owned by an [`Allocation`],
//! which releases them when dropped. On x64 the patch core needs pages within
//! rel32 reach of a patch site; [`allocate_page_near`] scans for one.

use crate::error::{Result, SpecterError};
use crate::process::Process;

const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const MEM_RELEASE: u32 = 0x8000;
const PAGE_EXECUTE_READWRITE: u32 = 0x40;

/// how far from the patch site the near scan will look
///
/// slightly under 2 GiB so a rel32 displacement computed from either end of
/// the allocated page still fits.
#[cfg(target_arch = "x86_64")]
const NEAR_SCAN_RANGE: isize = 0x7FFF_FF00;

/// pages allocated in a target process, freed on drop
pub struct Allocation {
    process_handle: usize,
    base: usize,
    size: usize,
    owns_memory: bool,
}

impl Allocation {
    /// allocate committed RWX pages at any address
    pub fn new(process: &Process, size: usize) -> Result<Self> {
        match alloc_at(process, 0, size) {
            Some(base) => Ok(Self {
                process_handle: process.handle(),
                base,
                size,
                owns_memory: true,
            }),
            None => Err(SpecterError::AllocationFailed {
                size,
                code: SpecterError::last_error(),
            }),
        }
    }

    /// try to allocate committed RWX pages at a fixed address
    pub fn try_at(process: &Process, address: usize, size: usize) -> Option<Self> {
        alloc_at(process, address, size).map(|base| Self {
            process_handle: process.handle(),
            base,
            size,
            owns_memory: true,
        })
    }

    /// get the base address
    pub fn base(&self) -> usize {
        self.base
    }

    /// get the allocation size
    pub fn size(&self) -> usize {
        self.size
    }

    /// whether an address falls inside this allocation
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.base + self.size
    }

    /// give up ownership without freeing
    pub fn leak(mut self) -> usize {
        self.owns_memory = false;
        self.base
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if self.owns_memory && self.base != 0 {
            // SAFETY: base was returned by VirtualAllocEx against this handle
            unsafe {
                VirtualFreeEx(self.process_handle as *mut _, self.base as *mut _, 0, MEM_RELEASE);
            }
        }
    }
}

// SAFETY: the allocation is identified by process handle + base, both
// meaningful from any thread
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

/// allocate one page within rel32 reach of `address`
///
/// Scans forward from `address` first and only then backward. Some overlay
/// DLLs resolve `FF 25` indirections without sign-extending the 32-bit
/// displacement and crash on negative ones; pages above the patch site keep
/// those overlays working, the backward scan is the fallback.
#[cfg(target_arch = "x86_64")]
pub fn allocate_page_near(process: &Process, address: usize) -> Result<Allocation> {
    let info = system_info();
    let page_size = info.page_size as usize;

    let search_beg = (address as isize - NEAR_SCAN_RANGE).max(info.min_address as isize);
    let search_end = (address as isize + NEAR_SCAN_RANGE).min(info.max_address as isize);

    let mut index: isize = 0;
    while address as isize + index < search_end {
        if let Some(alloc) = Allocation::try_at(process, (address as isize + index) as usize, page_size)
        {
            return Ok(alloc);
        }
        index += page_size as isize;
    }

    tracing::warn!(
        address,
        "no viable page in forward scan, falling back to backward scan; \
         this may break overlays that mis-handle negative displacements"
    );

    let mut index: isize = 0;
    while address as isize - index > search_beg {
        if let Some(alloc) = Allocation::try_at(process, (address as isize - index) as usize, page_size)
        {
            return Ok(alloc);
        }
        index += page_size as isize;
    }

    Err(SpecterError::AllocationFailed {
        size: page_size,
        code: SpecterError::last_error(),
    })
}

/// x86 reaches everything with rel32, any page will do
#[cfg(target_arch = "x86")]
pub fn allocate_page_near(process: &Process, _address: usize) -> Result<Allocation> {
    let info = system_info();
    Allocation::new(process, info.page_size as usize)
}

fn alloc_at(process: &Process, address: usize, size: usize) -> Option<usize> {
    // SAFETY: an explicit base is only a placement request, failure is an
    // expected outcome during the near scan
    let base = unsafe {
        VirtualAllocEx(
            process.handle() as *mut _,
            address as *mut _,
            size,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_EXECUTE_READWRITE,
        )
    };

    if base.is_null() {
        None
    } else {
        Some(base as usize)
    }
}

/// the slice of SYSTEM_INFO the near scan cares about
struct SystemInfo {
    page_size: u32,
    min_address: usize,
    max_address: usize,
}

fn system_info() -> SystemInfo {
    #[repr(C)]
    struct RawSystemInfo {
        processor_architecture: u16,
        reserved: u16,
        page_size: u32,
        minimum_application_address: *mut core::ffi::c_void,
        maximum_application_address: *mut core::ffi::c_void,
        active_processor_mask: usize,
        number_of_processors: u32,
        processor_type: u32,
        allocation_granularity: u32,
        processor_level: u16,
        processor_revision: u16,
    }

    let mut info = core::mem::MaybeUninit::<RawSystemInfo>::uninit();
    // SAFETY: GetSystemInfo fills the whole structure and cannot fail
    let info = unsafe {
        GetSystemInfo(info.as_mut_ptr() as *mut _);
        info.assume_init()
    };

    SystemInfo {
        page_size: info.page_size,
        min_address: info.minimum_application_address as usize,
        max_address: info.maximum_application_address as usize,
    }
}

#[link(name = "kernel32")]
extern "system" {
    fn VirtualAllocEx(
        process: *mut core::ffi::c_void,
        address: *mut core::ffi::c_void,
        size: usize,
        allocation_type: u32,
        protection: u32,
    ) -> *mut core::ffi::c_void;

    fn VirtualFreeEx(
        process: *mut core::ffi::c_void,
        address: *mut core::ffi::c_void,
        size: usize,
        free_type: u32,
    ) -> i32;

    fn GetSystemInfo(info: *mut core::ffi::c_void);
}
