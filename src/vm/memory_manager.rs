//! The memory manager
//!
//! Process-global coordinator for the VM subsystem: owns the frame
//! allocator and its commit pool, the two sentinel frames, the region
//! registry, the per-CPU quick-map windows, and the dispatcher that routes
//! a page fault to the owning region of the faulting address space.
//!
//! Initialized once at bring-up over the machine's physical window and
//! never torn down; everything reaches it through the `the()` façade.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use log::debug;
use spin::{Mutex, MutexGuard, Once};

use crate::arch::{self, CopyFailure, MAX_CPUS};
use crate::types::{PhysicalAddress, PAGE_SIZE};
use crate::vm::page_directory::PageDirectory;
use crate::vm::region::Region;
use crate::vm::vm_object::RegionHandle;
use crate::vm::vm_page::{
    CommitError, FrameAllocator, FrameAllocatorStats, PhysicalFrame,
};
use crate::vm::{PageFault, PageFaultResponse};

// ============================================================================
// Fault statistics
// ============================================================================

/// Global fault counters
#[derive(Debug, Default)]
pub struct FaultStats {
    total: AtomicU64,
    zero_fill: AtomicU64,
    cow: AtomicU64,
    inode_reads: AtomicU64,
    failures: AtomicU64,
}

impl FaultStats {
    pub fn incr_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_zero_fill(&self) {
        self.zero_fill.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_cow(&self) {
        self.cow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_inode_reads(&self) {
        self.inode_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failures(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn zero_fill(&self) -> u64 {
        self.zero_fill.load(Ordering::Relaxed)
    }

    pub fn cow(&self) -> u64 {
        self.cow.load(Ordering::Relaxed)
    }

    pub fn inode_reads(&self) -> u64 {
        self.inode_reads.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Quick-map windows
// ============================================================================

/// Per-CPU scratch window bookkeeping. The window maps one arbitrary frame
/// at a time; acquire, copy, release, never nested.
struct QuickmapWindow {
    mapped: Option<PhysicalAddress>,
}

struct QuickmapWindows {
    windows: heapless::Vec<QuickmapWindow, MAX_CPUS>,
}

/// An acquired quick-map window over one frame
pub struct QuickmapGuard<'a> {
    windows: MutexGuard<'a, QuickmapWindows>,
    ptr: *mut u8,
    cpu: usize,
}

impl QuickmapGuard<'_> {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the window covers exactly one frame while the guard is
        // alive.
        unsafe { core::slice::from_raw_parts(self.ptr, PAGE_SIZE) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and the guard is held uniquely.
        unsafe { core::slice::from_raw_parts_mut(self.ptr, PAGE_SIZE) }
    }
}

impl Drop for QuickmapGuard<'_> {
    fn drop(&mut self) {
        self.windows.windows[self.cpu].mapped = None;
    }
}

// ============================================================================
// Region registry
// ============================================================================

/// Regions of every address space, guarded by the global mm lock
pub(crate) struct RegionRegistry {
    regions: Vec<RegionHandle>,
}

// ============================================================================
// Memory Manager
// ============================================================================

/// Description of the physical memory handed to the VM subsystem
pub struct PhysicalWindow {
    /// First physical address of the managed range
    pub base: PhysicalAddress,
    /// Pages in the range
    pub page_count: usize,
    /// Kernel-virtual address where the range is reachable
    pub window: NonNull<u8>,
}

/// The process-global memory manager
pub struct MemoryManager {
    frame_allocator: Mutex<FrameAllocator>,
    shared_zero: Arc<PhysicalFrame>,
    lazy_committed: Arc<PhysicalFrame>,
    /// Global lock for structural page-table work and the region registry.
    /// Coarse, held only for short sequences.
    mm: Mutex<RegionRegistry>,
    quickmap: Mutex<QuickmapWindows>,
    fault_stats: FaultStats,
    window_base: PhysicalAddress,
    window_pages: usize,
    window_ptr: NonNull<u8>,
}

// SAFETY: the raw window pointer is only dereferenced under the frame
// allocator or quick-map locks.
unsafe impl Send for MemoryManager {}
unsafe impl Sync for MemoryManager {}

static MEMORY_MANAGER: Once<MemoryManager> = Once::new();

/// Initialize the global manager. Called once at bring-up.
pub(crate) fn initialize(window: PhysicalWindow) {
    MEMORY_MANAGER.call_once(|| MemoryManager::new(window));
}

/// The global memory manager. Panics before initialization.
pub fn the() -> &'static MemoryManager {
    MEMORY_MANAGER.get().expect("memory manager not initialized")
}

/// The global memory manager, if it has been brought up yet.
pub fn try_the() -> Option<&'static MemoryManager> {
    MEMORY_MANAGER.get()
}

/// Route a fault on `page_directory` to the owning region.
pub fn handle_page_fault(
    page_directory: &Arc<PageDirectory>,
    fault: &PageFault,
) -> PageFaultResponse {
    the().handle_page_fault(page_directory, fault)
}

impl MemoryManager {
    fn new(window: PhysicalWindow) -> Self {
        let mut frame_allocator =
            FrameAllocator::new(window.base, window.page_count, window.window);

        // The shared zero frame occupies one permanently reserved page;
        // the lazy-committed sentinel is fictitious and never mapped.
        let zero_paddr = frame_allocator.take_permanent_page(true);
        let shared_zero = PhysicalFrame::shared_zero(zero_paddr);
        let lazy_committed = PhysicalFrame::lazy_committed();

        let mut windows = heapless::Vec::new();
        for _ in 0..MAX_CPUS {
            let _ = windows.push(QuickmapWindow { mapped: None });
        }

        Self {
            frame_allocator: Mutex::new(frame_allocator),
            shared_zero,
            lazy_committed,
            mm: Mutex::new(RegionRegistry {
                regions: Vec::new(),
            }),
            quickmap: Mutex::new(QuickmapWindows { windows }),
            fault_stats: FaultStats::default(),
            window_base: window.base,
            window_pages: window.page_count,
            window_ptr: window.window,
        }
    }

    // ------------------------------------------------------------------------
    // Frames and commit accounting
    // ------------------------------------------------------------------------

    /// Allocate an ordinary user frame; fails when only committed reserve
    /// remains.
    pub fn allocate_user_physical_page(&self, zero_fill: bool) -> Option<Arc<PhysicalFrame>> {
        self.frame_allocator.lock().allocate_user_frame(zero_fill)
    }

    /// Allocate against a prior commitment; infallible within it.
    pub fn allocate_committed_user_physical_page(&self, zero_fill: bool) -> Arc<PhysicalFrame> {
        self.frame_allocator
            .lock()
            .allocate_committed_frame(zero_fill)
    }

    /// Reserve `count` pages of the free pool.
    pub fn commit_user_physical_pages(&self, count: usize) -> Result<(), CommitError> {
        self.frame_allocator.lock().commit(count)
    }

    /// Release `count` reserved pages.
    pub fn uncommit_user_physical_pages(&self, count: usize) {
        self.frame_allocator.lock().uncommit(count)
    }

    /// Return a frame to the free pool. Frames wrapped over memory outside
    /// the managed window (reserved ranges, MMIO) are not ours to recycle.
    pub(crate) fn deallocate_user_physical_page(&self, paddr: PhysicalAddress) {
        let mut frame_allocator = self.frame_allocator.lock();
        if frame_allocator.window_contains(paddr) {
            frame_allocator.deallocate(paddr);
        }
    }

    /// The process-wide page of zeros.
    pub fn shared_zero_page(&self) -> Arc<PhysicalFrame> {
        Arc::clone(&self.shared_zero)
    }

    /// The process-wide lazy-commit placeholder.
    pub fn lazy_committed_page(&self) -> Arc<PhysicalFrame> {
        Arc::clone(&self.lazy_committed)
    }

    pub fn frame_stats(&self) -> FrameAllocatorStats {
        self.frame_allocator.lock().stats()
    }

    pub fn fault_stats(&self) -> &FaultStats {
        &self.fault_stats
    }

    // ------------------------------------------------------------------------
    // Quick-map
    // ------------------------------------------------------------------------

    /// Map one frame into this CPU's scratch window. The guard releases the
    /// window; acquisitions never nest.
    pub fn quickmap_page(&self, frame: &PhysicalFrame) -> QuickmapGuard<'_> {
        assert!(
            !frame.is_lazy_committed(),
            "quick-map of the fictitious sentinel"
        );
        let ptr = self
            .physical_window_ptr(frame.paddr())
            .expect("quick-map of a frame outside the physical window");
        let mut windows = self.quickmap.lock();
        let cpu = arch::current_cpu();
        assert!(windows.windows[cpu].mapped.is_none(), "nested quick-map");
        windows.windows[cpu].mapped = Some(frame.paddr());
        QuickmapGuard {
            windows,
            ptr,
            cpu,
        }
    }

    /// Copy one frame onto another inside a single window acquisition.
    /// Reports which side faulted, if either.
    pub fn copy_physical_page(
        &self,
        dest: &PhysicalFrame,
        source: &PhysicalFrame,
    ) -> Result<(), CopyFailure> {
        let dest_ptr = self
            .physical_window_ptr(dest.paddr())
            .expect("copy destination outside the physical window");
        let source_ptr = self
            .physical_window_ptr(source.paddr())
            .expect("copy source outside the physical window");

        let mut windows = self.quickmap.lock();
        let cpu = arch::current_cpu();
        assert!(windows.windows[cpu].mapped.is_none(), "nested quick-map");
        windows.windows[cpu].mapped = Some(dest.paddr());
        // SAFETY: both pointers address full frames inside the window and
        // the frames are distinct.
        let result = unsafe { arch::safe_memcpy(dest_ptr, source_ptr, PAGE_SIZE) };
        windows.windows[cpu].mapped = None;
        result
    }

    /// Kernel-virtual pointer to a frame, if it lies in the managed window.
    pub(crate) fn physical_window_ptr(&self, paddr: PhysicalAddress) -> Option<*mut u8> {
        if paddr < self.window_base {
            return None;
        }
        let offset = (paddr.get() - self.window_base.get()) as usize;
        if offset >= self.window_pages * PAGE_SIZE {
            return None;
        }
        // SAFETY: offset checked against the window span.
        Some(unsafe { self.window_ptr.as_ptr().add(offset) })
    }

    // ------------------------------------------------------------------------
    // Region registry and fault dispatch
    // ------------------------------------------------------------------------

    /// The global mm lock. Structural page-table sequences run under it.
    pub(crate) fn structural_lock(&self) -> MutexGuard<'_, RegionRegistry> {
        self.mm.lock()
    }

    pub(crate) fn register_region(&self, region: &Region) {
        let handle = RegionHandle::new(region);
        let mut registry = self.mm.lock();
        debug_assert!(!registry.regions.contains(&handle));
        registry.regions.push(handle);
    }

    pub(crate) fn unregister_region(&self, region: &Region) {
        let handle = RegionHandle::new(region);
        let mut registry = self.mm.lock();
        if let Some(index) = registry.regions.iter().position(|&h| h == handle) {
            registry.regions.swap_remove(index);
        }
    }

    /// Number of registered regions.
    pub fn region_count(&self) -> usize {
        self.mm.lock().regions.len()
    }

    /// Resolve the faulting address to a region of `page_directory` and
    /// dispatch. No region means the access was to unmapped space.
    pub fn handle_page_fault(
        &self,
        page_directory: &Arc<PageDirectory>,
        fault: &PageFault,
    ) -> PageFaultResponse {
        debug_assert!(arch::interrupts_disabled());
        self.fault_stats.incr_total();

        let handle = {
            let registry = self.mm.lock();
            registry.regions.iter().copied().find(|handle| {
                // SAFETY: handles stay valid while registered; the registry
                // lock is held.
                let region = unsafe { handle.as_region() };
                region.owner_is(page_directory) && region.contains(fault.vaddr())
            })
        };

        match handle {
            // SAFETY: the faulting thread keeps its address space, and with
            // it this region, alive for the duration of the fault.
            Some(handle) => unsafe { handle.as_region() }.handle_fault(fault),
            None => {
                self.fault_stats.incr_failures();
                debug!(
                    "page fault at {:#x} with no region to handle it",
                    fault.vaddr().get()
                );
                PageFaultResponse::ShouldCrash
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::testing;

    #[test]
    fn test_commit_uncommit_round_trip() {
        let _guard = testing::lock();
        let mm = the();
        let committed_before = mm.frame_stats().committed;
        mm.commit_user_physical_pages(5).unwrap();
        assert_eq!(mm.frame_stats().committed, committed_before + 5);
        mm.uncommit_user_physical_pages(5);
        assert_eq!(mm.frame_stats().committed, committed_before);
    }

    #[test]
    fn test_commit_respects_free_pool() {
        let _guard = testing::lock();
        let mm = the();
        let stats = mm.frame_stats();
        let available = stats.free - stats.committed;
        assert_eq!(
            mm.commit_user_physical_pages(available + 1),
            Err(CommitError::Exhausted)
        );
        mm.commit_user_physical_pages(available).unwrap();
        mm.uncommit_user_physical_pages(available);
    }

    #[test]
    fn test_committed_allocation_survives_user_pressure() {
        let _guard = testing::lock();
        let mm = the();
        mm.commit_user_physical_pages(2).unwrap();

        // Exhaust the uncommitted pool.
        let mut hoard = Vec::new();
        while let Some(frame) = mm.allocate_user_physical_page(false) {
            hoard.push(frame);
        }

        // The reservation still delivers.
        let a = mm.allocate_committed_user_physical_page(true);
        let b = mm.allocate_committed_user_physical_page(true);
        assert!(!a.is_sentinel());
        assert!(!b.is_sentinel());
        drop((a, b));
        drop(hoard);
    }

    #[test]
    fn test_shared_zero_page_is_zero() {
        let _guard = testing::lock();
        let mm = the();
        let zero = mm.shared_zero_page();
        let mapping = mm.quickmap_page(&zero);
        assert!(mapping.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_sentinels_compare_by_identity() {
        let _guard = testing::lock();
        let mm = the();
        assert!(Arc::ptr_eq(&mm.shared_zero_page(), &mm.shared_zero_page()));
        assert!(Arc::ptr_eq(
            &mm.lazy_committed_page(),
            &mm.lazy_committed_page()
        ));
        assert!(mm.lazy_committed_page().is_lazy_committed());
    }

    #[test]
    fn test_copy_physical_page() {
        let _guard = testing::lock();
        let mm = the();
        let source = mm.allocate_user_physical_page(true).unwrap();
        let dest = mm.allocate_user_physical_page(false).unwrap();

        {
            let mut mapping = mm.quickmap_page(&source);
            mapping.as_mut_slice()[42] = 0x5A;
        }
        mm.copy_physical_page(&dest, &source).unwrap();
        let mapping = mm.quickmap_page(&dest);
        assert_eq!(mapping.as_slice()[42], 0x5A);
        assert_eq!(mapping.as_slice()[41], 0);
    }
}
