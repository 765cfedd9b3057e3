//! Virtual memory subsystem
//!
//! Backs per-process address spaces with physical frames:
//! - vm_page: physical frames, the commit pool, sentinel frames
//! - vm_object: backing-store objects (anonymous and inode-backed)
//! - region: a mapping of a virtual range into a slice of an object
//! - range_alloc: per-address-space virtual range reservation
//! - page_directory: per-address-space page-table tree
//! - memory_manager: the process-global coordinator and fault dispatcher
//!
//! A page fault enters through `memory_manager::handle_page_fault`, is
//! resolved to the owning region, classified, and dispatched to a handler
//! that may consult the region's object, allocate frames, and remap.

pub mod anonymous;
pub mod inode;
pub mod memory_manager;
pub mod page_directory;
pub mod range_alloc;
pub mod region;
pub mod vm_object;
pub mod vm_page;

pub use anonymous::{AllocationStrategy, PurgeableRanges, VolatilePageRange};
pub use inode::{Inode, InodeError};
pub use memory_manager::{MemoryManager, PhysicalWindow};
pub use page_directory::PageDirectory;
pub use range_alloc::RangeAllocator;
pub use region::{Access, Region, ShouldDeallocateVirtualRange, ShouldFlushTlb};
pub use vm_object::{CommittedCowPages, VMObject, VmoKind};
pub use vm_page::{CommitError, FrameKind, PhysicalFrame};

use crate::types::VirtualAddress;

// ============================================================================
// Page faults
// ============================================================================

/// Why the CPU faulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The translation was not present
    NotPresent,
    /// The translation was present but the access violated its protection
    ProtectionViolation,
}

/// What kind of access faulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
}

/// A decoded page fault
#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    vaddr: VirtualAddress,
    kind: FaultKind,
    access: FaultAccess,
}

impl PageFault {
    pub fn new(vaddr: VirtualAddress, kind: FaultKind, access: FaultAccess) -> Self {
        Self {
            vaddr,
            kind,
            access,
        }
    }

    pub fn vaddr(&self) -> VirtualAddress {
        self.vaddr
    }

    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    pub fn access(&self) -> FaultAccess {
        self.access
    }

    pub fn is_read(&self) -> bool {
        self.access == FaultAccess::Read
    }

    pub fn is_write(&self) -> bool {
        self.access == FaultAccess::Write
    }
}

/// Outcome of fault handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultResponse {
    /// The fault is resolved; retry the instruction
    Continue,
    /// The access was illegal; terminate the faulting thread
    ShouldCrash,
    /// A frame could not be allocated; the caller decides whether to kill
    /// or retry after reclaim
    OutOfMemory,
}

// ============================================================================
// Bring-up
// ============================================================================

/// Initialize the subsystem over a physical memory window. Must be called
/// exactly once, before any allocation or mapping.
pub fn init_with_memory(window: PhysicalWindow) {
    memory_manager::initialize(window);
}

// ============================================================================
// Test support
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::memory_manager;
    use super::page_directory::PageDirectory;
    use super::{FaultAccess, FaultKind, PageFault, PageFaultResponse, PhysicalWindow};
    use crate::types::{PhysicalAddress, VirtualAddress, PAGE_SIZE};
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::ptr::NonNull;
    use spin::{Mutex, MutexGuard, Once};

    /// Pages in the shared test arena.
    pub const ARENA_PAGES: usize = 512;

    /// Physical base of the test arena.
    pub const ARENA_BASE: u64 = 0x10_0000;

    static INIT: Once<()> = Once::new();
    static GUARD: Mutex<()> = Mutex::new(());

    /// Initialize the global memory manager over a leaked arena (once) and
    /// serialize the caller against other tests that touch global state.
    pub fn lock() -> MutexGuard<'static, ()> {
        INIT.call_once(|| {
            let mut backing: Vec<u8> = alloc::vec![0u8; (ARENA_PAGES + 1) * PAGE_SIZE];
            let addr = backing.as_mut_ptr() as usize;
            core::mem::forget(backing);
            let aligned = (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            super::init_with_memory(PhysicalWindow {
                base: PhysicalAddress::new(ARENA_BASE),
                page_count: ARENA_PAGES,
                window: NonNull::new(aligned as *mut u8).unwrap(),
            });
        });
        GUARD.lock()
    }

    /// Read one byte at `vaddr` the way the MMU would: translate through
    /// the page directory, faulting until the translation is present.
    pub fn mmu_read(pd: &Arc<PageDirectory>, vaddr: VirtualAddress) -> u8 {
        loop {
            if let Some(pte) = pd.pte(vaddr) {
                if pte.is_present() {
                    let ptr = memory_manager::the()
                        .physical_window_ptr(pte.physical_page_base())
                        .expect("PTE points outside the physical window");
                    return unsafe { *ptr.add(vaddr.get() as usize % PAGE_SIZE) };
                }
            }
            let fault = PageFault::new(vaddr, FaultKind::NotPresent, FaultAccess::Read);
            let response = memory_manager::handle_page_fault(pd, &fault);
            assert_eq!(
                response,
                PageFaultResponse::Continue,
                "read fault not resolved"
            );
        }
    }

    /// Write one byte at `vaddr` the way the MMU would, taking not-present
    /// and protection faults as needed.
    pub fn mmu_write(pd: &Arc<PageDirectory>, vaddr: VirtualAddress, value: u8) {
        loop {
            match pd.pte(vaddr) {
                Some(pte) if pte.is_present() && pte.is_writable() => {
                    let ptr = memory_manager::the()
                        .physical_window_ptr(pte.physical_page_base())
                        .expect("PTE points outside the physical window");
                    unsafe { *ptr.add(vaddr.get() as usize % PAGE_SIZE) = value };
                    return;
                }
                Some(pte) if pte.is_present() => {
                    let fault =
                        PageFault::new(vaddr, FaultKind::ProtectionViolation, FaultAccess::Write);
                    let response = memory_manager::handle_page_fault(pd, &fault);
                    assert_eq!(
                        response,
                        PageFaultResponse::Continue,
                        "write protection fault not resolved"
                    );
                }
                _ => {
                    let fault = PageFault::new(vaddr, FaultKind::NotPresent, FaultAccess::Write);
                    let response = memory_manager::handle_page_fault(pd, &fault);
                    assert_eq!(
                        response,
                        PageFaultResponse::Continue,
                        "write fault not resolved"
                    );
                }
            }
        }
    }
}
