//! Inode-backed memory
//!
//! Pages are sourced from a file on first touch. The shared variant is one
//! object aliased by every mapper; the private variant deep-copies slot
//! references on clone and diverges through copy-on-write.
//!
//! The inode read happens with the object lock released: it may block on
//! I/O and nothing here may sleep under a spinlock. The pre-read slot peek
//! is only a hint; after re-acquiring the lock the slot is checked again
//! and a fault that lost the race discards its buffer and just remaps.

use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{error, trace, warn};

use crate::arch::{self, CopyFailure, SmapPermissiveScope};
use crate::types::{VirtualAddress, PAGE_SIZE};
use crate::vm::memory_manager;
use crate::vm::vm_object::{Bitmap, PageSlot, VMObject, VariantState, VmoKind, VmoState};
use crate::vm::vm_page::frame_ref_count;
use crate::vm::PageFaultResponse;

// ============================================================================
// Inode interface
// ============================================================================

/// Errors surfaced by the backing filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeError {
    /// The underlying device failed
    Io,
    /// The requested range lies outside the file
    OutOfRange,
}

/// What the VM layer needs from a file
pub trait Inode: Send + Sync {
    /// Current file size in bytes.
    fn size(&self) -> usize;

    /// Read up to `buffer.len()` bytes starting at `offset`, returning how
    /// many were read. Reads past the end return 0. May block on I/O.
    fn read_bytes(&self, offset: usize, buffer: &mut [u8]) -> Result<usize, InodeError>;
}

// ============================================================================
// Inode object state
// ============================================================================

/// Variant state for inode-backed objects, guarded by the object lock
pub(crate) struct InodeState {
    /// Pages written but not yet flushed back to the inode
    pub dirty_map: Bitmap,
    /// CoW bits, armed when a private object is cloned
    cow_map: Option<Bitmap>,
}

impl InodeState {
    pub fn new(page_count: usize) -> Self {
        Self {
            dirty_map: Bitmap::new(page_count, false),
            cow_map: None,
        }
    }

    pub fn cow_map_get(&self, page_index: usize) -> bool {
        self.cow_map.as_ref().map_or(false, |map| map.get(page_index))
    }

    pub fn cow_map_set(&mut self, page_index: usize, cow: bool) {
        let len = self.dirty_map.len();
        self.cow_map
            .get_or_insert_with(|| Bitmap::new(len, false))
            .set(page_index, cow);
    }

    /// Arm every page for copy-on-write (clone time).
    pub fn arm_cow_map(&mut self) {
        let len = self.dirty_map.len();
        match &mut self.cow_map {
            Some(map) => map.fill(true),
            None => self.cow_map = Some(Bitmap::new(len, true)),
        }
    }
}

// ============================================================================
// Inode operations
// ============================================================================

impl VMObject {
    /// Create a shared object over `inode`: every mapper sees every write.
    pub fn try_create_shared_inode(inode: Arc<dyn Inode>) -> Option<Arc<VMObject>> {
        Self::create_inode_backed(inode, VmoKind::SharedInode)
    }

    /// Create a private object over `inode`: clones diverge on write.
    pub fn try_create_private_inode(inode: Arc<dyn Inode>) -> Option<Arc<VMObject>> {
        Self::create_inode_backed(inode, VmoKind::PrivateInode)
    }

    fn create_inode_backed(inode: Arc<dyn Inode>, kind: VmoKind) -> Option<Arc<VMObject>> {
        let page_count = crate::types::page_round_up(inode.size()).max(1);
        let slots: Vec<PageSlot> = alloc::vec![None; page_count];
        Some(VMObject::construct(
            kind,
            Some(inode),
            slots,
            VariantState::Inode(InodeState::new(page_count)),
        ))
    }

    /// Clone a private inode object: the twin shares every resident frame
    /// and both sides are armed for copy-on-write.
    pub(crate) fn clone_private_inode(self: &Arc<Self>) -> Option<Arc<VMObject>> {
        assert!(self.is_private_inode());
        let mut state = self.state();
        state.inode_mut().arm_cow_map();

        let child_slots = state.slots.clone();
        let mut child_state = InodeState::new(self.page_count());
        child_state.arm_cow_map();

        Some(VMObject::construct(
            VmoKind::PrivateInode,
            self.inode().cloned(),
            child_slots,
            VariantState::Inode(child_state),
        ))
    }

    /// Bytes of this object written but not flushed.
    pub fn amount_dirty(&self) -> usize {
        assert!(self.is_inode());
        self.state().inode().dirty_map.count_set() * PAGE_SIZE
    }

    /// Mark one page dirty.
    pub fn set_page_dirty(&self, page_index: usize, dirty: bool) {
        assert!(self.is_inode());
        self.state().inode_mut().dirty_map.set(page_index, dirty);
    }

    /// Resolve a not-present fault on an inode-backed page.
    ///
    /// Entered with interrupts disabled and the object lock released; the
    /// read may block. Short reads are zero-padded. Publication happens
    /// under the lock through the quick-map, and a racing fault that
    /// already filled the slot wins silently.
    pub(crate) fn handle_inode_fault(&self, page_index: usize) -> PageFaultResponse {
        debug_assert!(self.is_inode());
        debug_assert!(arch::interrupts_disabled());
        let mm = memory_manager::the();

        // Hint only; authoritative check happens after the read, under the
        // lock.
        {
            let state = self.state();
            if state.slots[page_index].is_some() {
                return if self.remap_page_slot(&state, page_index) {
                    PageFaultResponse::Continue
                } else {
                    PageFaultResponse::OutOfMemory
                };
            }
        }

        let inode = Arc::clone(self.inode().expect("inode fault without an inode"));
        let mut page_buffer = [0u8; PAGE_SIZE];
        let nread = match inode.read_bytes(page_index * PAGE_SIZE, &mut page_buffer) {
            Ok(nread) => nread,
            Err(err) => {
                error!("inode fault: error {:?} while reading from inode", err);
                return PageFaultResponse::ShouldCrash;
            }
        };
        if nread < PAGE_SIZE {
            page_buffer[nread..].fill(0);
        }

        let mut state = self.state();
        if state.slots[page_index].is_some() {
            trace!("inode fault: page faulted in by someone else, remapping");
            return if self.remap_page_slot(&state, page_index) {
                PageFaultResponse::Continue
            } else {
                PageFaultResponse::OutOfMemory
            };
        }

        let frame = match mm.allocate_user_physical_page(false) {
            Some(frame) => frame,
            None => {
                warn!("inode fault: unable to allocate a physical page");
                return PageFaultResponse::OutOfMemory;
            }
        };

        {
            let mut mapping = mm.quickmap_page(&frame);
            mapping.as_mut_slice().copy_from_slice(&page_buffer);
        }
        state.slots[page_index] = Some(frame);

        if !self.remap_page_slot(&state, page_index) {
            return PageFaultResponse::OutOfMemory;
        }
        PageFaultResponse::Continue
    }

    /// Resolve a write to a copy-on-write page of a private inode object.
    pub(crate) fn handle_private_inode_cow_fault(
        &self,
        page_index: usize,
        vaddr: VirtualAddress,
    ) -> PageFaultResponse {
        debug_assert!(self.is_private_inode());
        debug_assert!(arch::interrupts_disabled());
        let mm = memory_manager::the();
        let mut state = self.state();
        let VmoState { slots, variant } = &mut *state;
        let inode_state = match variant {
            VariantState::Inode(state) => state,
            VariantState::Anonymous(_) => return PageFaultResponse::ShouldCrash,
        };

        {
            let slot = slots[page_index].as_ref().expect("CoW fault on empty slot");
            if frame_ref_count(slot) == 1 {
                trace!("inode cow fault: last sharer, remapping r/w in place");
                inode_state.cow_map_set(page_index, false);
                inode_state.dirty_map.set(page_index, true);
                return PageFaultResponse::Continue;
            }
        }

        let page = match mm.allocate_user_physical_page(false) {
            Some(page) => page,
            None => {
                warn!("inode cow fault: unable to allocate a physical page");
                return PageFaultResponse::OutOfMemory;
            }
        };
        let source = slots[page_index].clone().expect("CoW fault on empty slot");
        let _smap = SmapPermissiveScope::new();
        match mm.copy_physical_page(&page, &source) {
            Ok(()) => {}
            Err(CopyFailure::Source) => {
                error!(
                    "inode cow: failed to read source page {:#x} while copying for {:#x}",
                    source.paddr().get(),
                    vaddr.get()
                );
                return PageFaultResponse::ShouldCrash;
            }
            Err(CopyFailure::Destination) => {
                error!(
                    "inode cow: failed to write new page {:#x} while copying for {:#x}",
                    page.paddr().get(),
                    vaddr.get()
                );
                return PageFaultResponse::ShouldCrash;
            }
        }
        slots[page_index] = Some(page);
        inode_state.cow_map_set(page_index, false);
        inode_state.dirty_map.set(page_index, true);
        PageFaultResponse::Continue
    }
}
