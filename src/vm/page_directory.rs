//! Per-address-space page tables
//!
//! A `PageDirectory` owns a software page-table tree, the two virtual
//! range allocators for its address space (general user area and the
//! identity-mapped low region), and a lock guarding structural changes.
//! Table levels are instantiated lazily by `ensure_pte` and collapsed
//! again by `release_pte` when they empty out.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

use crate::arch;
use crate::paging::{entry_index, table_index, PageTable, PageTableEntry, ENTRIES_PER_TABLE};
use crate::types::{
    PhysicalAddress, VirtualAddress, VirtualRange, KERNEL_RANGE_BASE, PAGE_SIZE, USER_RANGE_BASE,
};
use crate::vm::range_alloc::RangeAllocator;

/// End of the user half handed to the user range allocator.
const USER_RANGE_CEILING: u64 = 0x0000_8000_0000_0000;

/// Base of the identity-mapped low region.
const IDENTITY_RANGE_BASE: u64 = 0x1000;

/// Kernel-half span for kernel address spaces (stops one page short of the
/// top to keep range arithmetic away from the u64 edge).
const KERNEL_RANGE_SIZE: usize = (0x8000_0000_0000 - PAGE_SIZE as u64) as usize;

// ============================================================================
// Statistics
// ============================================================================

/// Counters for one address space
#[derive(Debug, Default)]
pub struct PageDirectoryStats {
    tlb_flushes: AtomicU64,
}

impl PageDirectoryStats {
    /// Number of TLB flush operations issued (one per flushed range, not
    /// per page).
    pub fn tlb_flushes(&self) -> u64 {
        self.tlb_flushes.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Page table tree
// ============================================================================

/// The software page-table tree, guarded by the directory lock
pub(crate) struct PageTables {
    tables: BTreeMap<u64, Box<PageTable>>,
}

impl PageTables {
    fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
        }
    }

    /// Find the PTE for `vaddr`, instantiating table levels as needed.
    pub fn ensure_pte(&mut self, vaddr: VirtualAddress) -> &mut PageTableEntry {
        let table = self
            .tables
            .entry(table_index(vaddr.get()))
            .or_insert_with(Box::default);
        table.entry_mut(entry_index(vaddr.get()))
    }

    /// Clear the PTE for `vaddr` and collapse its table level if that left
    /// it empty. `is_last` marks the final page of a release sequence;
    /// intermediate clears only scan for emptiness when they finish a
    /// table, so a range release walks each table once.
    pub fn release_pte(&mut self, vaddr: VirtualAddress, is_last: bool) {
        let index = table_index(vaddr.get());
        if let Some(table) = self.tables.get_mut(&index) {
            let entry = entry_index(vaddr.get());
            table.entry_mut(entry).clear();
            if (is_last || entry == ENTRIES_PER_TABLE - 1) && table.is_empty() {
                self.tables.remove(&index);
            }
        }
    }

    /// Copy of the PTE for `vaddr`, if its table level exists.
    pub fn pte(&self, vaddr: VirtualAddress) -> Option<PageTableEntry> {
        self.tables
            .get(&table_index(vaddr.get()))
            .map(|table| *table.entry(entry_index(vaddr.get())))
    }

    /// Number of instantiated table levels.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}

// ============================================================================
// Page Directory
// ============================================================================

/// The root of one address space: page-table tree plus range allocators
pub struct PageDirectory {
    tables: Mutex<PageTables>,
    range_allocator: Mutex<RangeAllocator>,
    identity_range_allocator: Mutex<RangeAllocator>,
    stats: PageDirectoryStats,
}

impl PageDirectory {
    /// Create an address space for a user process.
    pub fn try_create_for_user() -> Option<Arc<PageDirectory>> {
        let user = VirtualRange::new(
            VirtualAddress::new(USER_RANGE_BASE),
            (USER_RANGE_CEILING - USER_RANGE_BASE) as usize,
        );
        let identity = VirtualRange::new(
            VirtualAddress::new(IDENTITY_RANGE_BASE),
            (USER_RANGE_BASE - IDENTITY_RANGE_BASE) as usize,
        );
        Some(Self::with_ranges(user, identity))
    }

    /// Create the kernel address space.
    pub fn try_create_kernel() -> Option<Arc<PageDirectory>> {
        let kernel = VirtualRange::new(VirtualAddress::new(KERNEL_RANGE_BASE), KERNEL_RANGE_SIZE);
        let identity = VirtualRange::new(
            VirtualAddress::new(IDENTITY_RANGE_BASE),
            (USER_RANGE_BASE - IDENTITY_RANGE_BASE) as usize,
        );
        Some(Self::with_ranges(kernel, identity))
    }

    /// Create an address space over explicit allocator spans.
    pub fn with_ranges(general: VirtualRange, identity: VirtualRange) -> Arc<PageDirectory> {
        Arc::new(Self {
            tables: Mutex::new(PageTables::new()),
            range_allocator: Mutex::new(RangeAllocator::new(general)),
            identity_range_allocator: Mutex::new(RangeAllocator::new(identity)),
            stats: PageDirectoryStats::default(),
        })
    }

    /// The structural lock plus tree. Held for every PTE mutation.
    pub(crate) fn tables(&self) -> MutexGuard<'_, PageTables> {
        self.tables.lock()
    }

    /// Allocator for the general area of this address space.
    pub fn range_allocator(&self) -> &Mutex<RangeAllocator> {
        &self.range_allocator
    }

    /// Allocator for the identity-mapped low region.
    pub fn identity_range_allocator(&self) -> &Mutex<RangeAllocator> {
        &self.identity_range_allocator
    }

    /// Invalidate `count` pages starting at `base` on this address space.
    pub fn flush_tlb(&self, base: VirtualAddress, count: usize) {
        self.stats.tlb_flushes.fetch_add(1, Ordering::Relaxed);
        arch::tlb::invalidate_range(base, count);
    }

    pub fn stats(&self) -> &PageDirectoryStats {
        &self.stats
    }

    /// Copy of the PTE covering `vaddr`.
    pub fn pte(&self, vaddr: VirtualAddress) -> Option<PageTableEntry> {
        self.tables.lock().pte(vaddr)
    }

    /// Resolve a virtual address through the tree.
    pub fn translate(&self, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        let pte = self.pte(vaddr)?;
        if !pte.is_present() {
            return None;
        }
        Some(pte.physical_page_base().offset(vaddr.get() & (PAGE_SIZE as u64 - 1)))
    }
}
