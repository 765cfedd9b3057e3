//! Anonymous memory
//!
//! Zero-initialized backing store with copy-on-write cloning, lazy commit
//! and the purgeable-range protocol. The fork primitive is `try_clone`:
//! it reserves one commit charge per non-volatile page in a pool shared
//! with the clone, arms the CoW bitmap on both sides, and lets faults pull
//! the twins apart page by page.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use log::{debug, error, trace, warn};
use spin::Mutex;

use crate::arch::{self, CopyFailure, SmapPermissiveScope};
use crate::types::{PhysicalAddress, VirtualAddress, PAGE_SIZE};
use crate::vm::memory_manager;
use crate::vm::vm_object::{
    Bitmap, CommittedCowPages, PageSlot, VMObject, VariantState, VmoKind, VmoState,
};
use crate::vm::vm_page::{frame_ref_count, CommitError, PhysicalFrame};
use crate::vm::PageFaultResponse;

// ============================================================================
// Allocation strategy
// ============================================================================

/// How physical backing is arranged at creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Charge the commit pool now, allocate on first touch
    Reserve,
    /// Charge the commit pool and allocate every page immediately
    AllocateNow,
    /// No charge; every page starts as the shared zero page
    None,
}

// ============================================================================
// Volatile page ranges
// ============================================================================

/// A run of pages within a VM object, in page units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolatilePageRange {
    pub base: usize,
    pub count: usize,
}

impl VolatilePageRange {
    pub const fn new(base: usize, count: usize) -> Self {
        Self { base, count }
    }

    pub const fn end(&self) -> usize {
        self.base + self.count
    }

    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub const fn contains_page(&self, page: usize) -> bool {
        page >= self.base && page < self.end()
    }

    pub fn intersects(&self, other: &VolatilePageRange) -> bool {
        self.base < other.end() && other.base < self.end()
    }

    pub fn intersected(&self, other: &VolatilePageRange) -> VolatilePageRange {
        let base = self.base.max(other.base);
        let end = self.end().min(other.end());
        if end <= base {
            VolatilePageRange::new(0, 0)
        } else {
            VolatilePageRange::new(base, end - base)
        }
    }
}

/// A sorted, disjoint, coalesced set of page ranges
#[derive(Clone, Default)]
pub(crate) struct VolatileRangeSet {
    ranges: Vec<VolatilePageRange>,
}

impl VolatileRangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VolatilePageRange> {
        self.ranges.iter()
    }

    pub fn contains_page(&self, page: usize) -> bool {
        self.ranges.iter().any(|r| r.contains_page(page))
    }

    pub fn total_pages(&self) -> usize {
        self.ranges.iter().map(|r| r.count).sum()
    }

    /// Add a range, merging with anything it touches.
    pub fn add(&mut self, range: VolatilePageRange) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for existing in self.ranges.drain(..) {
            // Adjacent ranges coalesce too.
            if existing.end() < merged.base || merged.end() < existing.base {
                kept.push(existing);
            } else {
                let base = merged.base.min(existing.base);
                let end = merged.end().max(existing.end());
                merged = VolatilePageRange::new(base, end - base);
            }
        }
        kept.push(merged);
        kept.sort_unstable_by_key(|r| r.base);
        self.ranges = kept;
    }

    /// Subtract a range, splitting anything it cuts through.
    pub fn remove(&mut self, range: VolatilePageRange) {
        if range.is_empty() {
            return;
        }
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for existing in self.ranges.drain(..) {
            if !existing.intersects(&range) {
                kept.push(existing);
                continue;
            }
            if existing.base < range.base {
                kept.push(VolatilePageRange::new(
                    existing.base,
                    range.base - existing.base,
                ));
            }
            if existing.end() > range.end() {
                kept.push(VolatilePageRange::new(
                    range.end(),
                    existing.end() - range.end(),
                ));
            }
        }
        self.ranges = kept;
    }
}

// ============================================================================
// Purgeable registrations
// ============================================================================

/// A user-controllable volatility set attached to an anonymous object.
/// The owner marks ranges volatile to offer them up under memory pressure
/// and checks `was_purged` when taking them back.
pub struct PurgeableRanges {
    volatile_ranges: Mutex<VolatileRangeSet>,
    was_purged: AtomicBool,
}

impl PurgeableRanges {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            volatile_ranges: Mutex::new(VolatileRangeSet::new()),
            was_purged: AtomicBool::new(false),
        })
    }

    /// Whether `page` is currently volatile under this registration.
    pub fn is_volatile(&self, page: usize) -> bool {
        self.volatile_ranges.lock().contains_page(page)
    }

    pub fn is_empty(&self) -> bool {
        self.volatile_ranges.lock().is_empty()
    }

    pub fn was_purged(&self) -> bool {
        self.was_purged.load(Ordering::Relaxed)
    }

    /// Read and clear the purged flag.
    pub fn take_was_purged(&self) -> bool {
        self.was_purged.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn note_purged(&self, range: VolatilePageRange) {
        if self.volatile_ranges.lock().iter().any(|r| r.intersects(&range)) {
            self.was_purged.store(true, Ordering::Relaxed);
        }
    }

    pub(crate) fn with_ranges(&self, mut f: impl FnMut(&VolatilePageRange)) {
        for range in self.volatile_ranges.lock().iter() {
            f(range);
        }
    }
}

// ============================================================================
// Anonymous object state
// ============================================================================

/// Variant state for anonymous objects, guarded by the object lock
pub(crate) struct AnonymousState {
    /// One bit per page; set means a write must copy
    pub cow_map: Bitmap,
    /// Commit charges held for lazy-committed slots of this object
    pub unused_committed_pages: usize,
    /// Pool shared with clone relatives for outstanding CoW pages
    pub shared_committed_cow_pages: Option<Arc<CommittedCowPages>>,
    /// Volatility registrations
    pub purgeable_ranges: Vec<Arc<PurgeableRanges>>,
    /// Union of all registrations' volatile ranges
    pub volatile_cache: VolatileRangeSet,
    pub volatile_cache_dirty: bool,
}

impl AnonymousState {
    pub fn new(page_count: usize, unused_committed_pages: usize) -> Self {
        Self {
            cow_map: Bitmap::new(page_count, false),
            unused_committed_pages,
            shared_committed_cow_pages: None,
            purgeable_ranges: Vec::new(),
            volatile_cache: VolatileRangeSet::new(),
            volatile_cache_dirty: false,
        }
    }

    pub fn refresh_volatile_cache(&mut self) {
        if !self.volatile_cache_dirty {
            return;
        }
        let mut cache = VolatileRangeSet::new();
        for registration in &self.purgeable_ranges {
            registration.with_ranges(|range| cache.add(*range));
        }
        self.volatile_cache = cache;
        self.volatile_cache_dirty = false;
    }

    pub fn is_nonvolatile(&mut self, page: usize) -> bool {
        self.refresh_volatile_cache();
        !self.volatile_cache.contains_page(page)
    }

    /// Materialise one lazy-committed page. The page must not be volatile
    /// under any registration.
    pub fn allocate_committed_page(&mut self, page: usize) -> Arc<PhysicalFrame> {
        assert!(self.unused_committed_pages > 0, "lazy page without commit");
        assert!(self.is_nonvolatile(page), "committed allocation in volatile range");
        self.unused_committed_pages -= 1;
        memory_manager::the().allocate_committed_user_physical_page(true)
    }
}

// ============================================================================
// Should-cow decision (shared with the mapping path)
// ============================================================================

/// Whether a write to `page_index` must trap. Sentinel slots always trap;
/// otherwise private mappings consult the CoW bitmap.
pub(crate) fn should_cow_locked(
    kind: VmoKind,
    state: &VmoState,
    page_index: usize,
    is_shared: bool,
) -> bool {
    if let Some(frame) = &state.slots[page_index] {
        if frame.is_sentinel() {
            return true;
        }
    }
    if is_shared {
        return false;
    }
    match kind {
        VmoKind::Anonymous => state.anonymous().cow_map.get(page_index),
        VmoKind::PrivateInode => state.inode().cow_map_get(page_index),
        VmoKind::SharedInode => false,
    }
}

// ============================================================================
// Anonymous operations
// ============================================================================

impl VMObject {
    /// Create an anonymous object covering `size` bytes.
    pub fn try_create_anonymous_with_size(
        size: usize,
        strategy: AllocationStrategy,
    ) -> Option<Arc<VMObject>> {
        assert!(size > 0);
        let page_count = crate::types::page_round_up(size);
        let mm = memory_manager::the();

        if matches!(
            strategy,
            AllocationStrategy::Reserve | AllocationStrategy::AllocateNow
        ) {
            mm.commit_user_physical_pages(page_count).ok()?;
        }

        let slots: Vec<PageSlot> = match strategy {
            AllocationStrategy::AllocateNow => (0..page_count)
                .map(|_| Some(mm.allocate_committed_user_physical_page(true)))
                .collect(),
            AllocationStrategy::Reserve => {
                alloc::vec![Some(mm.lazy_committed_page()); page_count]
            }
            AllocationStrategy::None => {
                alloc::vec![Some(mm.shared_zero_page()); page_count]
            }
        };

        let unused = match strategy {
            AllocationStrategy::Reserve => page_count,
            _ => 0,
        };
        Some(VMObject::construct(
            VmoKind::Anonymous,
            None,
            slots,
            VariantState::Anonymous(AnonymousState::new(page_count, unused)),
        ))
    }

    /// Create an anonymous object adopting pre-allocated frames.
    pub fn try_create_anonymous_with_frames(frames: &[Arc<PhysicalFrame>]) -> Option<Arc<VMObject>> {
        assert!(!frames.is_empty());
        let slots: Vec<PageSlot> = frames.iter().cloned().map(Some).collect();
        let page_count = slots.len();
        Some(VMObject::construct(
            VmoKind::Anonymous,
            None,
            slots,
            VariantState::Anonymous(AnonymousState::new(page_count, 0)),
        ))
    }

    /// Wrap an MMIO or reserved physical range. The frames never return to
    /// the allocator.
    pub fn try_create_anonymous_for_physical_range(
        paddr: PhysicalAddress,
        size: usize,
    ) -> Option<Arc<VMObject>> {
        assert!(paddr.is_page_aligned());
        if paddr.checked_offset(size as u64).is_none() {
            warn!(
                "create_for_physical_range({:#x}, {:#x}) would wrap around",
                paddr.get(),
                size
            );
            return None;
        }
        let page_count = crate::types::page_round_up(size);
        let slots: Vec<PageSlot> = (0..page_count)
            .map(|i| {
                Some(PhysicalFrame::new_normal(
                    paddr.offset((i * PAGE_SIZE) as u64),
                    false,
                ))
            })
            .collect();
        Some(VMObject::construct(
            VmoKind::Anonymous,
            None,
            slots,
            VariantState::Anonymous(AnonymousState::new(page_count, 0)),
        ))
    }

    /// The fork primitive: produce a copy-on-write twin.
    ///
    /// Reserves one commit charge per non-volatile page so that neither
    /// side can hit out-of-memory mid-write later, shares the resulting
    /// pool with the twin, and arms the CoW bitmap on both objects.
    /// Returns absence when the commit pool cannot cover the reservation;
    /// the object is unchanged in that case.
    pub(crate) fn clone_anonymous(self: &Arc<Self>) -> Option<Arc<VMObject>> {
        let mm = memory_manager::the();
        let mut state = self.state();

        let page_count = self.page_count();
        let VmoState { slots, variant } = &mut *state;
        let anon = match variant {
            VariantState::Anonymous(anon) => anon,
            VariantState::Inode(_) => return None,
        };

        anon.refresh_volatile_cache();
        let need_cow_pages = page_count - anon.volatile_cache.total_pages();
        debug!("cloning anonymous object, need {} committed cow pages", need_cow_pages);

        if mm.commit_user_physical_pages(need_cow_pages).is_err() {
            return None;
        }
        let pool = CommittedCowPages::new(need_cow_pages);
        anon.shared_committed_cow_pages = Some(Arc::clone(&pool));
        anon.cow_map.fill(true);

        // The child shares every slot frame, but its lazy-committed slots
        // become shared-zero: the reservation they represented now lives in
        // the shared pool.
        let mut child_slots = slots.clone();
        let mut remaining = anon.unused_committed_pages;
        if remaining > 0 {
            for slot in child_slots.iter_mut() {
                let is_lazy = matches!(slot, Some(frame) if frame.is_lazy_committed());
                if is_lazy {
                    *slot = Some(mm.shared_zero_page());
                    remaining -= 1;
                    if remaining == 0 {
                        break;
                    }
                }
            }
            assert_eq!(remaining, 0, "unused commits without lazy slots");
        }

        let mut child_state = AnonymousState::new(page_count, 0);
        child_state.cow_map.fill(true);
        child_state.shared_committed_cow_pages = Some(pool);

        Some(VMObject::construct(
            VmoKind::Anonymous,
            None,
            child_slots,
            VariantState::Anonymous(child_state),
        ))
    }

    /// Whether a write to `page_index` must trap for this object.
    pub fn should_cow(&self, page_index: usize, is_shared: bool) -> bool {
        let state = self.state();
        should_cow_locked(self.kind(), &state, page_index, is_shared)
    }

    /// Arm or clear the CoW bit for one page. Only private mappings may
    /// enter copy-on-write.
    pub fn set_should_cow(&self, page_index: usize, cow: bool) {
        let mut state = self.state();
        match self.kind() {
            VmoKind::Anonymous => state.anonymous_mut().cow_map.set(page_index, cow),
            VmoKind::PrivateInode => state.inode_mut().cow_map_set(page_index, cow),
            VmoKind::SharedInode => panic!("shared inode object cannot enter CoW"),
        }
    }

    /// Number of pages with the CoW bit set (anonymous objects only).
    pub fn cow_pages(&self) -> usize {
        if !self.is_anonymous() {
            return 0;
        }
        self.state().anonymous().cow_map.count_set()
    }

    /// Resolve a write to a copy-on-write page of an anonymous object.
    /// The caller remaps the page across all regions afterwards.
    pub(crate) fn handle_anonymous_cow_fault(
        &self,
        page_index: usize,
        vaddr: VirtualAddress,
    ) -> PageFaultResponse {
        debug_assert!(arch::interrupts_disabled());
        let mm = memory_manager::the();
        let mut state = self.state();
        let VmoState { slots, variant } = &mut *state;
        let anon = match variant {
            VariantState::Anonymous(anon) => anon,
            VariantState::Inode(_) => return PageFaultResponse::ShouldCrash,
        };

        let nonvolatile = anon.is_nonvolatile(page_index);
        // A pool that other sharers already drained has no credit left to
        // take or return.
        let have_committed = nonvolatile
            && anon
                .shared_committed_cow_pages
                .as_ref()
                .map_or(false, |pool| !pool.is_empty());

        {
            let slot = slots[page_index].as_ref().expect("CoW fault on empty slot");
            if frame_ref_count(slot) == 1 {
                // Nobody shares the frame anymore; keep it and lift the trap.
                trace!("cow fault: last sharer, remapping r/w in place");
                anon.cow_map.set(page_index, false);
                if have_committed {
                    if let Some(pool) = &anon.shared_committed_cow_pages {
                        if pool.return_one() {
                            anon.shared_committed_cow_pages = None;
                        }
                    }
                }
                return PageFaultResponse::Continue;
            }
        }

        let page = if have_committed {
            trace!("cow fault: taking page from the committed pool");
            anon.shared_committed_cow_pages
                .as_ref()
                .expect("committed pool vanished")
                .allocate_one()
        } else {
            trace!("cow fault: allocating a fresh user page");
            match mm.allocate_user_physical_page(false) {
                Some(page) => page,
                None => {
                    warn!("cow fault: unable to allocate a physical page");
                    return PageFaultResponse::OutOfMemory;
                }
            }
        };

        let source = slots[page_index].clone().expect("CoW fault on empty slot");
        let _smap = SmapPermissiveScope::new();
        match mm.copy_physical_page(&page, &source) {
            Ok(()) => {}
            Err(CopyFailure::Source) => {
                error!(
                    "cow: failed to read source page {:#x} while copying for {:#x}",
                    source.paddr().get(),
                    vaddr.get()
                );
                return PageFaultResponse::ShouldCrash;
            }
            Err(CopyFailure::Destination) => {
                error!(
                    "cow: failed to write new page {:#x} while copying for {:#x}",
                    page.paddr().get(),
                    vaddr.get()
                );
                return PageFaultResponse::ShouldCrash;
            }
        }
        slots[page_index] = Some(page);
        anon.cow_map.set(page_index, false);
        PageFaultResponse::Continue
    }

    // ------------------------------------------------------------------------
    // Purgeable protocol
    // ------------------------------------------------------------------------

    /// Attach a volatility registration.
    pub fn register_purgeable_ranges(&self, registration: Arc<PurgeableRanges>) {
        assert!(self.is_anonymous());
        let mut state = self.state();
        let anon = state.anonymous_mut();
        assert!(
            !anon
                .purgeable_ranges
                .iter()
                .any(|r| Arc::ptr_eq(r, &registration)),
            "registration attached twice"
        );
        anon.purgeable_ranges.push(registration);
        anon.volatile_cache_dirty = true;
    }

    /// Detach a volatility registration.
    pub fn unregister_purgeable_ranges(&self, registration: &Arc<PurgeableRanges>) {
        assert!(self.is_anonymous());
        let mut state = self.state();
        let anon = state.anonymous_mut();
        let index = anon
            .purgeable_ranges
            .iter()
            .position(|r| Arc::ptr_eq(r, registration))
            .expect("registration was not attached");
        anon.purgeable_ranges.remove(index);
        anon.volatile_cache_dirty = true;
    }

    /// Whether any registration currently marks pages volatile.
    pub fn is_any_volatile(&self) -> bool {
        assert!(self.is_anonymous());
        let state = self.state();
        state
            .anonymous()
            .purgeable_ranges
            .iter()
            .any(|r| !r.is_empty())
    }

    /// Change the volatility of `range` under `registration`.
    ///
    /// Marking volatile releases the commit charges of any lazy-committed
    /// pages inside the range. Marking non-volatile re-reserves a charge
    /// for every shared-zero page in the range; the transition is
    /// all-or-nothing and leaves everything untouched on commit failure.
    pub fn set_volatile(
        &self,
        registration: &Arc<PurgeableRanges>,
        range: VolatilePageRange,
        volatile: bool,
    ) -> Result<(), CommitError> {
        assert!(self.is_anonymous());
        assert!(range.end() <= self.page_count());
        let mm = memory_manager::the();
        let mut state = self.state();
        let VmoState { slots, variant } = &mut *state;
        let anon = match variant {
            VariantState::Anonymous(anon) => anon,
            VariantState::Inode(_) => unreachable!(),
        };
        assert!(
            anon.purgeable_ranges
                .iter()
                .any(|r| Arc::ptr_eq(r, registration)),
            "registration not attached to this object"
        );

        if volatile {
            registration.volatile_ranges.lock().add(range);

            // Lazy-committed pages inside a volatile range stop holding
            // commit charges.
            if anon.unused_committed_pages > 0 {
                let mut uncommitted = 0;
                for index in range.base..range.end() {
                    let is_lazy =
                        matches!(&slots[index], Some(frame) if frame.is_lazy_committed());
                    if is_lazy {
                        slots[index] = Some(mm.shared_zero_page());
                        anon.unused_committed_pages -= 1;
                        uncommitted += 1;
                        if anon.unused_committed_pages == 0 {
                            break;
                        }
                    }
                }
                if uncommitted > 0 {
                    debug!("released {} lazy-commit charges for volatile range", uncommitted);
                    mm.uncommit_user_physical_pages(uncommitted);
                }
            }
            anon.volatile_cache_dirty = true;
            Ok(())
        } else {
            // Every shared-zero page coming back non-volatile needs a
            // commit charge again, and all of them at once.
            let mut needed = 0;
            for index in range.base..range.end() {
                if anon.cow_map.get(index) {
                    continue;
                }
                if matches!(&slots[index], Some(frame) if frame.is_shared_zero()) {
                    needed += 1;
                }
            }
            if needed > 0 {
                mm.commit_user_physical_pages(needed)?;
            }

            registration.volatile_ranges.lock().remove(range);

            let mut marked = 0;
            if needed > 0 {
                for index in range.base..range.end() {
                    if anon.cow_map.get(index) {
                        continue;
                    }
                    if matches!(&slots[index], Some(frame) if frame.is_shared_zero()) {
                        slots[index] = Some(mm.lazy_committed_page());
                        marked += 1;
                        if marked == needed {
                            break;
                        }
                    }
                }
                debug!("re-reserved {} lazy-commit charges for non-volatile range", marked);
            }
            anon.unused_committed_pages += marked;
            anon.volatile_cache_dirty = true;
            Ok(())
        }
    }

    /// Reclaim every volatile page: normal frames are released and their
    /// slots revert to the shared zero page; affected mappings are remapped
    /// read-only zero. Returns the number of pages purged.
    pub fn purge(&self) -> usize {
        assert!(self.is_anonymous());
        let mm = memory_manager::the();
        let mut state = self.state();

        let mut purged_ranges: Vec<VolatilePageRange> = Vec::new();
        let mut purged_total = 0;
        {
            let VmoState { slots, variant } = &mut *state;
            let anon = match variant {
                VariantState::Anonymous(anon) => anon,
                VariantState::Inode(_) => unreachable!(),
            };
            anon.refresh_volatile_cache();
            let ranges: Vec<VolatilePageRange> = anon.volatile_cache.iter().copied().collect();

            for range in ranges {
                let mut purged_in_range = 0;
                for index in range.base..range.end() {
                    if let Some(frame) = &slots[index] {
                        if !frame.is_shared_zero() {
                            assert!(
                                !frame.is_lazy_committed(),
                                "lazy-committed page in volatile range"
                            );
                            purged_in_range += 1;
                        }
                    }
                    slots[index] = Some(mm.shared_zero_page());
                }

                if purged_in_range > 0 {
                    purged_total += purged_in_range;
                    for registration in &anon.purgeable_ranges {
                        registration.note_purged(range);
                    }
                    purged_ranges.push(range);
                }
            }
        }

        for range in &purged_ranges {
            self.for_each_region(|region| {
                warn!(
                    "purged {} pages from region {} at {:#x}",
                    range.count,
                    region.name_for_log(),
                    region.vaddr().get(),
                );
            });
            self.remap_page_range(&state, range.base, range.count);
        }
        purged_total
    }
}
