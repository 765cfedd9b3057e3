//! Regions - virtual memory mappings
//!
//! A region maps a contiguous virtual range into a slice of a VM object,
//! carrying access rights and the shared/private flag. It owns its
//! reservation in the address space's range allocator and its presence in
//! the page tables; it shares its object. Page faults land here and are
//! classified against the access bits and the state of the backing slot.
//!
//! Regions are heap-pinned (`Box`) because their object keeps a non-owning
//! back-edge to them from construction until destruction.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use log::{debug, trace, warn};
use spin::Mutex;

use crate::arch::{self, CpuFeature};
use crate::types::{VirtualAddress, VirtualRange, PAGE_SIZE, USER_RANGE_BASE};
use crate::vm::anonymous::should_cow_locked;
use crate::vm::memory_manager;
use crate::vm::page_directory::{PageDirectory, PageTables};
use crate::vm::vm_object::{PageSlot, VMObject, VmoKind, VmoState};
use crate::vm::vm_page::frame_ref_count;
use crate::vm::{FaultKind, PageFault, PageFaultResponse};

// ============================================================================
// Access rights
// ============================================================================

/// Region access rights
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access(u8);

impl Access {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(2);
    pub const EXECUTE: Self = Self(4);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x7)
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl core::ops::BitOr for Access {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Whether a map operation flushes the TLB when it is done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldFlushTlb {
    Yes,
    No,
}

/// Whether unmapping also releases the virtual range reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldDeallocateVirtualRange {
    Yes,
    No,
}

// ============================================================================
// Region
// ============================================================================

/// A mapping of a virtual range into a slice of a VM object
pub struct Region {
    range: VirtualRange,
    offset_in_vmobject: usize,
    vmobject: Mutex<Arc<VMObject>>,
    name: Mutex<Option<String>>,
    /// Current rights; hardware state follows these.
    access: AtomicU8,
    /// Rights at construction time, preserved across temporary protection
    /// changes so they can be restored.
    original_access: Access,
    cacheable: bool,
    shared: bool,
    user: bool,
    stack: AtomicBool,
    mmap: AtomicBool,
    syscall: AtomicBool,
    page_directory: Mutex<Option<Arc<PageDirectory>>>,
}

impl Region {
    /// Create a user-accessible region. Registers with the object and the
    /// global registry; returns absence on allocation failure.
    pub fn try_create_user(
        range: VirtualRange,
        vmobject: Arc<VMObject>,
        offset_in_vmobject: usize,
        name: Option<String>,
        access: Access,
        cacheable: bool,
        shared: bool,
    ) -> Option<Box<Region>> {
        Self::construct(range, vmobject, offset_in_vmobject, name, access, cacheable, shared, true)
    }

    /// Create a kernel-only region.
    pub fn try_create_kernel(
        range: VirtualRange,
        vmobject: Arc<VMObject>,
        offset_in_vmobject: usize,
        name: Option<String>,
        access: Access,
        cacheable: bool,
    ) -> Option<Box<Region>> {
        assert!(range.base().is_kernel_address(), "kernel region in the user half");
        Self::construct(range, vmobject, offset_in_vmobject, name, access, cacheable, false, false)
    }

    #[allow(clippy::too_many_arguments)]
    fn construct(
        range: VirtualRange,
        vmobject: Arc<VMObject>,
        offset_in_vmobject: usize,
        name: Option<String>,
        access: Access,
        cacheable: bool,
        shared: bool,
        user: bool,
    ) -> Option<Box<Region>> {
        assert!(
            offset_in_vmobject + range.page_count() <= vmobject.page_count(),
            "region window outside its object"
        );
        let region = Box::new(Region {
            range,
            offset_in_vmobject,
            vmobject: Mutex::new(vmobject),
            name: Mutex::new(name),
            access: AtomicU8::new(access.bits()),
            original_access: access,
            cacheable,
            shared,
            user,
            stack: AtomicBool::new(false),
            mmap: AtomicBool::new(false),
            syscall: AtomicBool::new(false),
            page_directory: Mutex::new(None),
        });
        region.vmobject().add_region(&region);
        memory_manager::the().register_region(&region);
        Some(region)
    }

    // ------------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------------

    pub fn range(&self) -> VirtualRange {
        self.range
    }

    pub fn vaddr(&self) -> VirtualAddress {
        self.range.base()
    }

    pub fn size(&self) -> usize {
        self.range.size()
    }

    pub fn page_count(&self) -> usize {
        self.range.page_count()
    }

    /// First page of this region's window into its object.
    pub fn first_page_index(&self) -> usize {
        self.offset_in_vmobject
    }

    pub fn access(&self) -> Access {
        Access::from_bits(self.access.load(Ordering::Relaxed))
    }

    /// The rights this region was created with.
    pub fn original_access(&self) -> Access {
        self.original_access
    }

    pub fn is_readable(&self) -> bool {
        self.access().contains(Access::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.access().contains(Access::WRITE)
    }

    pub fn is_executable(&self) -> bool {
        self.access().contains(Access::EXECUTE)
    }

    pub fn set_readable(&self, readable: bool) {
        self.set_access_bit(Access::READ, readable);
    }

    pub fn set_writable(&self, writable: bool) {
        self.set_access_bit(Access::WRITE, writable);
    }

    pub fn set_executable(&self, executable: bool) {
        self.set_access_bit(Access::EXECUTE, executable);
    }

    fn set_access_bit(&self, bit: Access, value: bool) {
        let access = if value {
            self.access().with(bit)
        } else {
            self.access().without(bit)
        };
        self.access.store(access.bits(), Ordering::Relaxed);
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn is_user(&self) -> bool {
        self.user
    }

    pub fn is_kernel(&self) -> bool {
        !self.user
    }

    pub fn is_stack(&self) -> bool {
        self.stack.load(Ordering::Relaxed)
    }

    pub fn set_stack(&self, stack: bool) {
        self.stack.store(stack, Ordering::Relaxed);
    }

    pub fn is_mmap(&self) -> bool {
        self.mmap.load(Ordering::Relaxed)
    }

    pub fn set_mmap(&self, mmap: bool) {
        self.mmap.store(mmap, Ordering::Relaxed);
    }

    pub fn is_syscall_region(&self) -> bool {
        self.syscall.load(Ordering::Relaxed)
    }

    pub fn set_syscall_region(&self, syscall: bool) {
        self.syscall.store(syscall, Ordering::Relaxed);
    }

    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: Option<String>) {
        *self.name.lock() = name;
    }

    pub(crate) fn name_for_log(&self) -> String {
        self.name().unwrap_or_else(|| String::from("(unnamed)"))
    }

    pub fn contains(&self, vaddr: VirtualAddress) -> bool {
        self.range.contains(vaddr)
    }

    pub fn vaddr_from_page_index(&self, page_index: usize) -> VirtualAddress {
        debug_assert!(page_index < self.page_count());
        self.vaddr().offset((page_index * PAGE_SIZE) as u64)
    }

    pub fn page_index_from_address(&self, vaddr: VirtualAddress) -> usize {
        debug_assert!(self.contains(vaddr));
        ((vaddr.get() - self.vaddr().get()) / PAGE_SIZE as u64) as usize
    }

    /// Region page index to object page index.
    pub fn translate_to_vmobject_page(&self, page_index: usize) -> usize {
        self.offset_in_vmobject + page_index
    }

    /// Object page index to region page index, if the page falls inside
    /// this region's window.
    pub fn translate_vmobject_page(&self, vmobject_page: usize) -> Option<usize> {
        if vmobject_page < self.offset_in_vmobject {
            return None;
        }
        let page_index = vmobject_page - self.offset_in_vmobject;
        if page_index >= self.page_count() {
            return None;
        }
        Some(page_index)
    }

    pub fn vmobject(&self) -> Arc<VMObject> {
        Arc::clone(&self.vmobject.lock())
    }

    /// Switch to a different backing object, moving the back-edge.
    pub fn set_vmobject(&self, new_vmobject: Arc<VMObject>) {
        let mut guard = self.vmobject.lock();
        if Arc::ptr_eq(&guard, &new_vmobject) {
            return;
        }
        guard.remove_region(self);
        *guard = new_vmobject;
        guard.add_region(self);
    }

    /// Slot backing one page of this region.
    pub fn physical_page(&self, page_index: usize) -> PageSlot {
        self.vmobject()
            .physical_page(self.translate_to_vmobject_page(page_index))
    }

    pub(crate) fn owner_page_directory(&self) -> Option<Arc<PageDirectory>> {
        self.page_directory.lock().clone()
    }

    pub(crate) fn owner_is(&self, page_directory: &Arc<PageDirectory>) -> bool {
        self.page_directory
            .lock()
            .as_ref()
            .map_or(false, |owner| Arc::ptr_eq(owner, page_directory))
    }

    // ------------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------------

    /// Bytes of this region backed by materialised frames.
    pub fn amount_resident(&self) -> usize {
        let vmobject = self.vmobject();
        let state = vmobject.state();
        let mut bytes = 0;
        for page_index in 0..self.page_count() {
            if let Some(frame) = &state.slots[self.translate_to_vmobject_page(page_index)] {
                if !frame.is_sentinel() {
                    bytes += PAGE_SIZE;
                }
            }
        }
        bytes
    }

    /// Bytes of this region backed by frames shared with someone else.
    pub fn amount_shared(&self) -> usize {
        let vmobject = self.vmobject();
        let state = vmobject.state();
        let mut bytes = 0;
        for page_index in 0..self.page_count() {
            if let Some(frame) = &state.slots[self.translate_to_vmobject_page(page_index)] {
                if !frame.is_sentinel() && frame_ref_count(frame) > 1 {
                    bytes += PAGE_SIZE;
                }
            }
        }
        bytes
    }

    /// Bytes written but not flushed. Only meaningful for inode-backed
    /// regions; anonymous memory is always "dirty" while resident.
    pub fn amount_dirty(&self) -> usize {
        let vmobject = self.vmobject();
        if vmobject.is_inode() {
            vmobject.amount_dirty()
        } else {
            self.amount_resident()
        }
    }

    /// Pages of the backing object with the CoW bit set (anonymous only).
    pub fn cow_pages(&self) -> usize {
        self.vmobject().cow_pages()
    }

    // ------------------------------------------------------------------------
    // CoW bits
    // ------------------------------------------------------------------------

    pub fn should_cow(&self, page_index: usize) -> bool {
        self.vmobject()
            .should_cow(self.translate_to_vmobject_page(page_index), self.shared)
    }

    pub fn set_should_cow(&self, page_index: usize, cow: bool) {
        assert!(!self.shared, "shared regions may not enter CoW");
        self.vmobject()
            .set_should_cow(self.translate_to_vmobject_page(page_index), cow);
    }

    // ------------------------------------------------------------------------
    // Clone (fork)
    // ------------------------------------------------------------------------

    /// Fork behavior: shared regions produce a sibling over the same
    /// object; private regions clone the object copy-on-write and map the
    /// clone. Returns absence if the object clone fails.
    pub fn clone_region(&self) -> Option<Box<Region>> {
        let vmobject = self.vmobject();

        if self.shared {
            debug_assert!(!self.is_stack());
            if vmobject.is_inode() {
                debug_assert!(vmobject.is_shared_inode());
            }
            let region = Region::try_create_user(
                self.range,
                vmobject,
                self.offset_in_vmobject,
                self.name(),
                self.access(),
                self.cacheable,
                true,
            )?;
            region.set_mmap(self.is_mmap());
            region.set_syscall_region(self.is_syscall_region());
            return Some(region);
        }

        if vmobject.is_inode() {
            debug_assert!(vmobject.is_private_inode());
        }
        let vmobject_clone = vmobject.try_clone()?;

        // Remap ourselves first: the clone armed the CoW bits, and our
        // write permissions must be gone before the child observes the
        // shared frames.
        if self.owner_page_directory().is_some() {
            self.remap();
        }

        let region = Region::try_create_user(
            self.range,
            vmobject_clone,
            self.offset_in_vmobject,
            self.name(),
            self.access(),
            self.cacheable,
            false,
        )?;
        if self.is_stack() {
            debug_assert!(self.is_readable());
            debug_assert!(self.is_writable());
            debug_assert!(self.vmobject().is_anonymous());
            region.set_stack(true);
        }
        region.set_mmap(self.is_mmap());
        region.set_syscall_region(self.is_syscall_region());
        Some(region)
    }

    // ------------------------------------------------------------------------
    // Mapping
    // ------------------------------------------------------------------------

    /// Install every page of this region into `page_directory`. On
    /// mid-sequence failure the pages installed so far are flushed and
    /// failure is reported.
    pub fn map(&self, page_directory: &Arc<PageDirectory>, should_flush: ShouldFlushTlb) -> bool {
        let vmobject = self.vmobject();
        let state = vmobject.state();
        let mm = memory_manager::the();
        let _mm_guard = mm.structural_lock();

        {
            let mut owner = self.page_directory.lock();
            match owner.as_ref() {
                Some(existing) => assert!(
                    Arc::ptr_eq(existing, page_directory),
                    "region mapped into two address spaces"
                ),
                None => *owner = Some(Arc::clone(page_directory)),
            }
        }
        if self.user && !self.shared {
            debug_assert!(!vmobject.is_shared_inode());
        }

        let count = self.page_count();
        let mut mapped = 0;
        {
            let mut tables = page_directory.tables();
            while mapped < count {
                if !self.map_individual_page_locked(&vmobject, &state, &mut tables, mapped) {
                    break;
                }
                mapped += 1;
            }
        }
        if mapped > 0 {
            if should_flush == ShouldFlushTlb::Yes {
                page_directory.flush_tlb(self.vaddr(), mapped);
            }
            mapped == count
        } else {
            false
        }
    }

    /// Re-install every page using the current slots and access bits.
    pub fn remap(&self) {
        let page_directory = self
            .owner_page_directory()
            .expect("remap of an unmapped region");
        self.map(&page_directory, ShouldFlushTlb::Yes);
    }

    /// Clear every PTE, flush once across the range, and optionally hand
    /// the virtual range back to the owning allocator.
    pub fn unmap(&self, deallocate_range: ShouldDeallocateVirtualRange) {
        let mm = memory_manager::the();
        let _mm_guard = mm.structural_lock();
        let mut owner = self.page_directory.lock();
        let page_directory = match owner.as_ref() {
            Some(pd) => Arc::clone(pd),
            None => return,
        };

        {
            let mut tables = page_directory.tables();
            let count = self.page_count();
            for page_index in 0..count {
                tables.release_pte(self.vaddr_from_page_index(page_index), page_index == count - 1);
            }
        }
        page_directory.flush_tlb(self.vaddr(), self.page_count());

        if deallocate_range == ShouldDeallocateVirtualRange::Yes {
            if page_directory.range_allocator().lock().contains(self.range) {
                page_directory.range_allocator().lock().deallocate(self.range);
            } else if page_directory
                .identity_range_allocator()
                .lock()
                .contains(self.range)
            {
                page_directory
                    .identity_range_allocator()
                    .lock()
                    .deallocate(self.range);
            }
        }
        *owner = None;
    }

    /// Install one page. The writable bit is the AND of the caller's
    /// intent and the slot's safety: sentinel and CoW pages must trap
    /// writes. Lazy-committed slots have no mappable frame and stay
    /// not-present so the first touch faults.
    pub(crate) fn map_individual_page_locked(
        &self,
        vmobject: &VMObject,
        state: &VmoState,
        tables: &mut PageTables,
        page_index: usize,
    ) -> bool {
        let page_vaddr = self.vaddr_from_page_index(page_index);
        let user_allowed =
            page_vaddr.get() >= USER_RANGE_BASE && page_vaddr.is_user_address() && self.user;
        assert!(
            !(self.is_mmap() && !user_allowed),
            "about to map mmap'd page at a kernel address"
        );

        let pte = tables.ensure_pte(page_vaddr);
        let vmobject_page = self.translate_to_vmobject_page(page_index);
        let access = self.access();

        let mappable = match &state.slots[vmobject_page] {
            Some(frame) => !frame.is_lazy_committed(),
            None => false,
        };
        if !mappable || (!access.contains(Access::READ) && !access.contains(Access::WRITE)) {
            pte.clear();
            return true;
        }

        let frame = state.slots[vmobject_page].as_ref().unwrap();
        pte.set_cache_disabled(!self.cacheable);
        pte.set_physical_page_base(frame.paddr());
        pte.set_present(true);
        let writable = access.contains(Access::WRITE)
            && !should_cow_locked(vmobject.kind(), state, vmobject_page, self.shared);
        pte.set_writable(writable);
        if arch::has_feature(CpuFeature::Nx) {
            pte.set_execute_disabled(!access.contains(Access::EXECUTE));
        }
        pte.set_user_allowed(user_allowed);
        true
    }

    // ------------------------------------------------------------------------
    // Fault handling
    // ------------------------------------------------------------------------

    /// The arbitration point: classify the fault against the access bits
    /// and the backing slot, then dispatch.
    pub fn handle_fault(&self, fault: &PageFault) -> PageFaultResponse {
        let page_index = self.page_index_from_address(fault.vaddr());
        let vmobject = self.vmobject();

        if fault.kind() == FaultKind::NotPresent {
            if fault.is_read() && !self.is_readable() {
                debug!(
                    "NP(non-readable) fault in region {} page {}",
                    self.name_for_log(),
                    page_index
                );
                return PageFaultResponse::ShouldCrash;
            }
            if fault.is_write() && !self.is_writable() {
                debug!(
                    "NP(non-writable) write fault in region {} page {} at {:#x}",
                    self.name_for_log(),
                    page_index,
                    fault.vaddr().get()
                );
                return PageFaultResponse::ShouldCrash;
            }
            if vmobject.is_inode() {
                trace!("NP(inode) fault in region {} page {}", self.name_for_log(), page_index);
                memory_manager::the().fault_stats().incr_inode_reads();
                return vmobject.handle_inode_fault(self.translate_to_vmobject_page(page_index));
            }

            let vmobject_page = self.translate_to_vmobject_page(page_index);
            let mut state = vmobject.state();
            let is_lazy =
                matches!(&state.slots[vmobject_page], Some(frame) if frame.is_lazy_committed());
            let is_materialised =
                matches!(&state.slots[vmobject_page], Some(frame) if !frame.is_sentinel());
            if is_lazy {
                let frame = state.anonymous_mut().allocate_committed_page(vmobject_page);
                state.slots[vmobject_page] = Some(frame);
                if !vmobject.remap_page_slot(&state, vmobject_page) {
                    return PageFaultResponse::OutOfMemory;
                }
                PageFaultResponse::Continue
            } else if is_materialised {
                // Duplicate delivery: another CPU materialised the page
                // between the fault and now. Remap and retry.
                trace!("NP fault lost the race, slot already normal; remapping");
                if !vmobject.remap_page_slot(&state, vmobject_page) {
                    return PageFaultResponse::OutOfMemory;
                }
                PageFaultResponse::Continue
            } else {
                debug!("BUG! Unexpected not-present fault at {:#x}", fault.vaddr().get());
                PageFaultResponse::ShouldCrash
            }
        } else {
            debug_assert!(fault.kind() == FaultKind::ProtectionViolation);
            if fault.is_write() && self.is_writable() && self.should_cow(page_index) {
                let frame = match self.physical_page(page_index) {
                    Some(frame) => frame,
                    None => return PageFaultResponse::ShouldCrash,
                };
                if frame.is_sentinel() {
                    trace!(
                        "PV(zero) fault in region {} page {} at {:#x}",
                        self.name_for_log(),
                        page_index,
                        fault.vaddr().get()
                    );
                    return self.handle_zero_fault(page_index);
                }
                trace!(
                    "PV(cow) fault in region {} page {} at {:#x}",
                    self.name_for_log(),
                    page_index,
                    fault.vaddr().get()
                );
                return self.handle_cow_fault(page_index);
            }
            debug!(
                "PV(error) fault in region {} page {} at {:#x}",
                self.name_for_log(),
                page_index,
                fault.vaddr().get()
            );
            PageFaultResponse::ShouldCrash
        }
    }

    /// First write to a zero or lazy-committed page. Idempotent: a racing
    /// fault that already installed a frame just remaps.
    pub fn handle_zero_fault(&self, page_index: usize) -> PageFaultResponse {
        debug_assert!(arch::interrupts_disabled());
        let vmobject = self.vmobject();
        debug_assert!(vmobject.is_anonymous());
        let vmobject_page = self.translate_to_vmobject_page(page_index);
        let mm = memory_manager::the();
        mm.fault_stats().incr_zero_fill();

        let mut state = vmobject.state();

        let already_materialised =
            matches!(&state.slots[vmobject_page], Some(frame) if !frame.is_sentinel());
        if already_materialised {
            trace!("zero fault: page already materialised, remapping");
            return if vmobject.remap_page_slot(&state, vmobject_page) {
                PageFaultResponse::Continue
            } else {
                PageFaultResponse::OutOfMemory
            };
        }

        let is_lazy =
            matches!(&state.slots[vmobject_page], Some(frame) if frame.is_lazy_committed());
        let frame = if is_lazy {
            let frame = state.anonymous_mut().allocate_committed_page(vmobject_page);
            trace!("zero fault: allocated committed {:#x}", frame.paddr().get());
            frame
        } else {
            match mm.allocate_user_physical_page(true) {
                Some(frame) => {
                    trace!("zero fault: allocated {:#x}", frame.paddr().get());
                    frame
                }
                None => {
                    warn!("zero fault: unable to allocate a physical page");
                    return PageFaultResponse::OutOfMemory;
                }
            }
        };
        state.slots[vmobject_page] = Some(frame);

        if !vmobject.remap_page_slot(&state, vmobject_page) {
            warn!("zero fault: unable to map the new page");
            return PageFaultResponse::OutOfMemory;
        }
        PageFaultResponse::Continue
    }

    /// Re-install one page of this region's object across every region
    /// mapping it. Returns false if any sub-map failed.
    pub fn remap_vmobject_page(&self, page_index: usize) -> bool {
        let vmobject = self.vmobject();
        let state = vmobject.state();
        vmobject.remap_page_slot(&state, self.translate_to_vmobject_page(page_index))
    }

    /// Write to a copy-on-write page with a materialised frame.
    pub fn handle_cow_fault(&self, page_index: usize) -> PageFaultResponse {
        debug_assert!(arch::interrupts_disabled());
        let vmobject = self.vmobject();
        let vmobject_page = self.translate_to_vmobject_page(page_index);
        let vaddr = self.vaddr_from_page_index(page_index);
        memory_manager::the().fault_stats().incr_cow();

        let response = match vmobject.kind() {
            VmoKind::Anonymous => vmobject.handle_anonymous_cow_fault(vmobject_page, vaddr),
            VmoKind::PrivateInode => vmobject.handle_private_inode_cow_fault(vmobject_page, vaddr),
            VmoKind::SharedInode => return PageFaultResponse::ShouldCrash,
        };

        let state = vmobject.state();
        if !vmobject.remap_page_slot(&state, vmobject_page) {
            return PageFaultResponse::OutOfMemory;
        }
        response
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.vmobject().remove_region(self);

        if self.page_directory.lock().is_some() {
            self.unmap(ShouldDeallocateVirtualRange::Yes);
            debug_assert!(self.page_directory.lock().is_none());
        }

        memory_manager::the().unregister_region(self);
    }
}

// ============================================================================
// Object-side remap fan-out
// ============================================================================

impl VMObject {
    /// Re-install one page across every region mapping this object.
    /// Returns false if any sub-map failed.
    pub(crate) fn remap_page_slot(&self, state: &VmoState, page_index: usize) -> bool {
        self.remap_page_range(state, page_index, 1)
    }

    /// Re-install a run of pages across every region mapping this object,
    /// flushing each affected address space once.
    pub(crate) fn remap_page_range(&self, state: &VmoState, base_page: usize, count: usize) -> bool {
        let mm = memory_manager::the();
        let mut success = true;
        self.for_each_region(|region| {
            let page_directory = match region.owner_page_directory() {
                Some(pd) => pd,
                None => return,
            };
            let _mm_guard = mm.structural_lock();
            let mut first_remapped = None;
            let mut remapped = 0;
            {
                let mut tables = page_directory.tables();
                for vmobject_page in base_page..base_page + count {
                    let page_index = match region.translate_vmobject_page(vmobject_page) {
                        Some(index) => index,
                        None => continue,
                    };
                    if !region.map_individual_page_locked(self, state, &mut tables, page_index) {
                        success = false;
                    }
                    first_remapped.get_or_insert(page_index);
                    remapped += 1;
                }
            }
            if let Some(first) = first_remapped {
                page_directory.flush_tlb(region.vaddr_from_page_index(first), remapped);
            }
        });
        success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::anonymous::{AllocationStrategy, PurgeableRanges, VolatilePageRange};
    use crate::vm::inode::tests::TestInode;
    use crate::vm::memory_manager;
    use crate::vm::page_directory::PageDirectory;
    use crate::vm::testing::{self, mmu_read, mmu_write};
    use crate::vm::vm_object::VMObject;
    use crate::vm::FaultAccess;
    use alloc::string::ToString;

    fn create_mapped_region(
        vmobject: Arc<VMObject>,
        access: Access,
        shared: bool,
    ) -> (Arc<PageDirectory>, Box<Region>) {
        let page_directory = PageDirectory::try_create_for_user().unwrap();
        let range = page_directory
            .range_allocator()
            .lock()
            .allocate_anywhere(vmobject.page_count() * PAGE_SIZE)
            .unwrap();
        let region = Region::try_create_user(
            range,
            vmobject,
            0,
            Some("test".to_string()),
            access,
            true,
            shared,
        )
        .unwrap();
        assert!(region.map(&page_directory, ShouldFlushTlb::Yes));
        (page_directory, region)
    }

    /// Fork helper: reserve the parent's range in a fresh address space,
    /// clone the region and map the clone there.
    fn fork_region(parent: &Region) -> (Arc<PageDirectory>, Box<Region>) {
        let page_directory = PageDirectory::try_create_for_user().unwrap();
        page_directory
            .range_allocator()
            .lock()
            .allocate_specific(parent.vaddr(), parent.size())
            .unwrap();
        let child = parent.clone_region().unwrap();
        assert!(child.map(&page_directory, ShouldFlushTlb::Yes));
        (page_directory, child)
    }

    #[test]
    fn test_lazy_commit_fault() {
        let _guard = testing::lock();
        let mm = memory_manager::the();
        let vmobject =
            VMObject::try_create_anonymous_with_size(3 * PAGE_SIZE, AllocationStrategy::Reserve)
                .unwrap();
        let committed_before = mm.frame_stats().committed;
        let (pd, region) = create_mapped_region(
            Arc::clone(&vmobject),
            Access::READ | Access::WRITE,
            false,
        );

        // Lazy-committed pages have no mappable frame yet.
        assert!(pd.pte(region.vaddr()).map_or(true, |pte| !pte.is_present()));
        assert_eq!(vmobject.state().anonymous().unused_committed_pages, 3);

        // First touch materialises a committed page.
        assert_eq!(mmu_read(&pd, region.vaddr()), 0);
        assert_eq!(vmobject.state().anonymous().unused_committed_pages, 2);
        assert_eq!(mm.frame_stats().committed, committed_before - 1);

        let pte = pd.pte(region.vaddr()).unwrap();
        assert!(pte.is_present());
        assert!(pte.is_writable());

        // The neighbor page is untouched.
        assert!(vmobject.physical_page(1).unwrap().is_lazy_committed());
        assert_eq!(region.amount_resident(), PAGE_SIZE);
    }

    #[test]
    fn test_fork_copy_on_write() {
        let _guard = testing::lock();
        let vmobject =
            VMObject::try_create_anonymous_with_size(PAGE_SIZE, AllocationStrategy::None).unwrap();
        let (parent_pd, parent) = create_mapped_region(
            Arc::clone(&vmobject),
            Access::READ | Access::WRITE,
            false,
        );
        let vaddr = parent.vaddr();

        mmu_write(&parent_pd, vaddr, 0x5A);
        assert_eq!(mmu_read(&parent_pd, vaddr), 0x5A);

        let (child_pd, child) = fork_region(&parent);

        // The child sees the parent's byte through the shared frame.
        assert_eq!(mmu_read(&child_pd, child.vaddr()), 0x5A);
        assert_eq!(parent.amount_shared(), PAGE_SIZE);

        // Child write diverges; parent is untouched.
        mmu_write(&child_pd, child.vaddr(), 0xA5);
        assert_eq!(mmu_read(&child_pd, child.vaddr()), 0xA5);
        assert_eq!(mmu_read(&parent_pd, vaddr), 0x5A);

        // Parent write flips its page back to exclusive r/w in place.
        mmu_write(&parent_pd, vaddr, 0x11);
        assert_eq!(mmu_read(&parent_pd, vaddr), 0x11);
        assert_eq!(mmu_read(&child_pd, child.vaddr()), 0xA5);

        // Both sides ended up sole owners with the traps lifted.
        assert_eq!(parent.amount_shared(), 0);
        assert_eq!(child.amount_shared(), 0);
        assert_eq!(parent.cow_pages(), 0);
        assert_eq!(child.cow_pages(), 0);
    }

    #[test]
    fn test_purge_remaps_read_only_zero() {
        let _guard = testing::lock();
        let mm = memory_manager::the();
        let vmobject =
            VMObject::try_create_anonymous_with_size(4 * PAGE_SIZE, AllocationStrategy::None)
                .unwrap();
        let (pd, region) = create_mapped_region(
            Arc::clone(&vmobject),
            Access::READ | Access::WRITE,
            false,
        );

        for page in 0..4 {
            mmu_write(&pd, region.vaddr_from_page_index(page), 0xEE);
        }
        assert_eq!(region.amount_resident(), 4 * PAGE_SIZE);

        let registration = PurgeableRanges::new();
        vmobject.register_purgeable_ranges(Arc::clone(&registration));
        vmobject
            .set_volatile(&registration, VolatilePageRange::new(0, 4), true)
            .unwrap();

        assert_eq!(vmobject.purge(), 4);
        assert!(registration.was_purged());

        // Every PTE is back to read-only zero; reads allocate nothing.
        for page in 0..4 {
            let vaddr = region.vaddr_from_page_index(page);
            let pte = pd.pte(vaddr).unwrap();
            assert!(pte.is_present());
            assert!(!pte.is_writable());
            assert_eq!(mmu_read(&pd, vaddr), 0);
        }
        assert_eq!(region.amount_resident(), 0);

        // Back to non-volatile with commit available: the next write
        // faults and draws from the new reservation.
        let committed_before = mm.frame_stats().committed;
        vmobject
            .set_volatile(&registration, VolatilePageRange::new(0, 4), false)
            .unwrap();
        assert_eq!(mm.frame_stats().committed, committed_before + 4);

        mmu_write(&pd, region.vaddr(), 0x01);
        assert_eq!(mmu_read(&pd, region.vaddr()), 0x01);
        assert_eq!(vmobject.state().anonymous().unused_committed_pages, 3);

        vmobject.unregister_purgeable_ranges(&registration);
    }

    #[test]
    fn test_shared_file_backed_read() {
        let _guard = testing::lock();
        let inode = TestInode::new(alloc::vec![0x42]);
        let vmobject = VMObject::try_create_shared_inode(inode).unwrap();
        let (pd, region) = create_mapped_region(Arc::clone(&vmobject), Access::READ, true);

        // One byte from the file, the rest zero-padded.
        assert_eq!(mmu_read(&pd, region.vaddr()), 0x42);
        assert_eq!(mmu_read(&pd, region.vaddr().offset(1)), 0);
        assert_eq!(region.amount_resident(), PAGE_SIZE);

        // Read-only mapping of a shared inode page.
        let pte = pd.pte(region.vaddr()).unwrap();
        assert!(pte.is_present());
        assert!(!pte.is_writable());
    }

    #[test]
    fn test_duplicate_zero_fault_is_idempotent() {
        let _guard = testing::lock();
        let mm = memory_manager::the();
        let vmobject =
            VMObject::try_create_anonymous_with_size(PAGE_SIZE, AllocationStrategy::Reserve)
                .unwrap();
        let (_pd, region) = create_mapped_region(
            Arc::clone(&vmobject),
            Access::READ | Access::WRITE,
            false,
        );

        assert_eq!(region.handle_zero_fault(0), PageFaultResponse::Continue);
        let frame = vmobject.physical_page(0).unwrap();
        assert_eq!(vmobject.state().anonymous().unused_committed_pages, 0);
        let free_after_first = mm.frame_stats().free;

        // The loser of a concurrent race delivers the same fault again:
        // same frame, no double allocation, no double decrement.
        assert_eq!(region.handle_zero_fault(0), PageFaultResponse::Continue);
        assert!(Arc::ptr_eq(&vmobject.physical_page(0).unwrap(), &frame));
        assert_eq!(vmobject.state().anonymous().unused_committed_pages, 0);
        assert_eq!(mm.frame_stats().free, free_after_first);

        // A stale not-present delivery resolves the same way.
        let fault = PageFault::new(
            region.vaddr(),
            FaultKind::NotPresent,
            FaultAccess::Write,
        );
        assert_eq!(region.handle_fault(&fault), PageFaultResponse::Continue);
    }

    #[test]
    fn test_fault_table_crash_rows() {
        let _guard = testing::lock();
        let vmobject =
            VMObject::try_create_anonymous_with_size(PAGE_SIZE, AllocationStrategy::None).unwrap();
        let (pd, region) = create_mapped_region(Arc::clone(&vmobject), Access::READ, false);

        // Write fault on a non-writable region.
        let fault = PageFault::new(region.vaddr(), FaultKind::NotPresent, FaultAccess::Write);
        assert_eq!(region.handle_fault(&fault), PageFaultResponse::ShouldCrash);

        // Protection violation that is not a CoW write.
        let fault = PageFault::new(
            region.vaddr(),
            FaultKind::ProtectionViolation,
            FaultAccess::Write,
        );
        assert_eq!(region.handle_fault(&fault), PageFaultResponse::ShouldCrash);

        // A fault with no owning region crashes the faulter.
        let outside = region.vaddr().offset((2 * PAGE_SIZE) as u64);
        let fault = PageFault::new(outside, FaultKind::NotPresent, FaultAccess::Read);
        assert_eq!(
            memory_manager::handle_page_fault(&pd, &fault),
            PageFaultResponse::ShouldCrash
        );
    }

    #[test]
    fn test_unreadable_region_maps_nothing() {
        let _guard = testing::lock();
        let vmobject =
            VMObject::try_create_anonymous_with_size(PAGE_SIZE, AllocationStrategy::None).unwrap();
        let (pd, region) = create_mapped_region(Arc::clone(&vmobject), Access::empty(), false);

        assert!(pd.pte(region.vaddr()).map_or(true, |pte| !pte.is_present()));
        let fault = PageFault::new(region.vaddr(), FaultKind::NotPresent, FaultAccess::Read);
        assert_eq!(region.handle_fault(&fault), PageFaultResponse::ShouldCrash);
    }

    #[test]
    fn test_unmap_releases_range_and_flushes_once() {
        let _guard = testing::lock();
        let vmobject =
            VMObject::try_create_anonymous_with_size(2 * PAGE_SIZE, AllocationStrategy::None)
                .unwrap();
        let (pd, region) = create_mapped_region(
            Arc::clone(&vmobject),
            Access::READ | Access::WRITE,
            false,
        );
        mmu_write(&pd, region.vaddr(), 1);

        let flushes_before = pd.stats().tlb_flushes();
        region.unmap(ShouldDeallocateVirtualRange::Yes);
        assert_eq!(pd.stats().tlb_flushes(), flushes_before + 1);
        assert!(pd.pte(region.vaddr()).is_none());
        assert!(region.owner_page_directory().is_none());

        // The reservation went back to the allocator.
        let again = pd
            .range_allocator()
            .lock()
            .allocate_specific(region.vaddr(), region.size());
        assert!(again.is_some());
    }

    #[test]
    fn test_clone_of_shared_region_aliases_object() {
        let _guard = testing::lock();
        let vmobject =
            VMObject::try_create_anonymous_with_size(PAGE_SIZE, AllocationStrategy::None).unwrap();
        let (_pd, region) = create_mapped_region(
            Arc::clone(&vmobject),
            Access::READ | Access::WRITE,
            true,
        );
        region.set_mmap(true);

        let sibling = region.clone_region().unwrap();
        assert!(Arc::ptr_eq(&region.vmobject(), &sibling.vmobject()));
        assert!(sibling.is_shared());
        assert!(sibling.is_mmap());
        assert_eq!(vmobject.region_count(), 2);
    }

    #[test]
    fn test_temporary_protection_change() {
        let _guard = testing::lock();
        let vmobject =
            VMObject::try_create_anonymous_with_size(PAGE_SIZE, AllocationStrategy::None).unwrap();
        let (pd, region) = create_mapped_region(
            Arc::clone(&vmobject),
            Access::READ | Access::WRITE,
            false,
        );
        mmu_write(&pd, region.vaddr(), 0x33);

        // Drop write access temporarily; the original rights survive.
        region.set_writable(false);
        region.remap();
        assert!(!pd.pte(region.vaddr()).unwrap().is_writable());
        let fault = PageFault::new(
            region.vaddr(),
            FaultKind::ProtectionViolation,
            FaultAccess::Write,
        );
        assert_eq!(region.handle_fault(&fault), PageFaultResponse::ShouldCrash);

        region.set_writable(region.original_access().contains(Access::WRITE));
        region.remap();
        mmu_write(&pd, region.vaddr(), 0x44);
        assert_eq!(mmu_read(&pd, region.vaddr()), 0x44);
    }

    #[test]
    fn test_kernel_region_is_not_user_accessible() {
        let _guard = testing::lock();
        let vmobject =
            VMObject::try_create_anonymous_with_size(PAGE_SIZE, AllocationStrategy::None).unwrap();
        let pd = PageDirectory::try_create_kernel().unwrap();
        let range = pd
            .range_allocator()
            .lock()
            .allocate_anywhere(PAGE_SIZE)
            .unwrap();
        let region = Region::try_create_kernel(
            range,
            vmobject,
            0,
            Some("kernel-test".to_string()),
            Access::READ | Access::WRITE,
            true,
        )
        .unwrap();
        assert!(region.map(&pd, ShouldFlushTlb::Yes));
        assert!(region.is_kernel());

        let pte = pd.pte(region.vaddr()).unwrap();
        assert!(pte.is_present());
        assert!(!pte.is_user_allowed());
    }

    #[test]
    fn test_region_registers_and_deregisters() {
        let _guard = testing::lock();
        let mm = memory_manager::the();
        let vmobject =
            VMObject::try_create_anonymous_with_size(PAGE_SIZE, AllocationStrategy::None).unwrap();
        let regions_before = mm.region_count();

        let (_pd, region) = create_mapped_region(
            Arc::clone(&vmobject),
            Access::READ | Access::WRITE,
            false,
        );
        assert_eq!(mm.region_count(), regions_before + 1);
        assert_eq!(vmobject.region_count(), 1);

        drop(region);
        assert_eq!(mm.region_count(), regions_before);
        assert_eq!(vmobject.region_count(), 0);
    }

    #[test]
    fn test_set_vmobject_moves_back_edge() {
        let _guard = testing::lock();
        let first =
            VMObject::try_create_anonymous_with_size(PAGE_SIZE, AllocationStrategy::None).unwrap();
        let second =
            VMObject::try_create_anonymous_with_size(PAGE_SIZE, AllocationStrategy::None).unwrap();
        let (_pd, region) = create_mapped_region(
            Arc::clone(&first),
            Access::READ | Access::WRITE,
            false,
        );

        region.set_vmobject(Arc::clone(&second));
        assert_eq!(first.region_count(), 0);
        assert_eq!(second.region_count(), 1);

        // Idempotent when the object is unchanged.
        region.set_vmobject(Arc::clone(&second));
        assert_eq!(second.region_count(), 1);
    }

    #[test]
    fn test_clone_then_drop_child_then_write() {
        let _guard = testing::lock();
        let vmobject =
            VMObject::try_create_anonymous_with_size(PAGE_SIZE, AllocationStrategy::None).unwrap();
        let (pd, parent) = create_mapped_region(
            Arc::clone(&vmobject),
            Access::READ | Access::WRITE,
            false,
        );
        mmu_write(&pd, parent.vaddr(), 0x77);

        {
            let (_child_pd, _child) = fork_region(&parent);
            assert_eq!(parent.cow_pages(), 1);
        }

        // Child gone: the parent's write takes the page in place.
        mmu_write(&pd, parent.vaddr(), 0x78);
        assert_eq!(mmu_read(&pd, parent.vaddr()), 0x78);
        assert_eq!(parent.cow_pages(), 0);
        assert_eq!(parent.amount_shared(), 0);
        assert!(pd.pte(parent.vaddr()).unwrap().is_writable());
    }
}
