//! The kernel heap hierarchy.
//!
//! A ladder of [`Heap`]s sharing the buddy-tree algorithm, selected per
//! allocation by request size. The first heap lives in the linear mapping;
//! later heaps are created on demand over hi-vmem and back their blocks
//! with physical pages lazily, one `alloc_block_size` chunk at a time.
//!
//! Each heap is mutated only with preemption disabled; the spin lock is the
//! belt to that suspender.

pub mod heap;
pub mod leak;

pub use heap::{BackingMode, Heap};

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use alloc::vec::Vec;
use spin::Mutex;

use super::frame::FRAME_ALLOCATOR;
use super::paging;
use super::{physmem, PhysAddr, VirtAddr};
use crate::config::{
    KERNEL_BASE_VA, KMALLOC_FIRST_HEAP_SIZE, KMALLOC_HEAPS_COUNT, KMALLOC_MIN_BLOCK, PAGE_SIZE,
};
use crate::error::{KernelError, KernelResult};

/// Requested minimum alignment, in multiples of two pointer sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignFlag {
    TwoPtrs,
    FourPtrs,
    EightPtrs,
    SixteenPtrs,
}

impl AlignFlag {
    pub const fn bytes(self) -> usize {
        let ptr = core::mem::size_of::<usize>();
        match self {
            Self::TwoPtrs => 2 * ptr,
            Self::FourPtrs => 4 * ptr,
            Self::EightPtrs => 8 * ptr,
            Self::SixteenPtrs => 16 * ptr,
        }
    }
}

static HEAPS: Mutex<Vec<Heap>> = Mutex::new(Vec::new());
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Largest heap the on-demand growth path will create.
const MAX_DYN_HEAP_SIZE: usize = 64 * 1024 * 1024;
/// Chunk size at which dynamic heaps back virtual with physical pages.
const DYN_HEAP_ALLOC_BLOCK: usize = 32 * PAGE_SIZE;

/// Create the first heap over `[first_heap_paddr, +KMALLOC_FIRST_HEAP_SIZE)`
/// of linearly-mapped physical memory. That region must have been reserved
/// in the frame allocator by the caller.
pub fn init(first_heap_paddr: PhysAddr) -> KernelResult<()> {
    let va = KERNEL_BASE_VA + first_heap_paddr.as_u64();
    let h = Heap::new(
        va,
        KMALLOC_FIRST_HEAP_SIZE,
        KMALLOC_MIN_BLOCK,
        0,
        BackingMode::Linear,
    )?;

    let mut heaps = HEAPS.lock();
    if !heaps.is_empty() {
        return Err(KernelError::AlreadyExists);
    }
    heaps.push(h);
    INITIALIZED.store(true, Ordering::Release);
    log::info!("kmalloc: first heap at {:#x}, {} KB", va, KMALLOC_FIRST_HEAP_SIZE / 1024);
    Ok(())
}

pub fn is_kmalloc_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Sum of allocated bytes across every heap.
pub fn kmalloc_get_total_heap_allocation() -> usize {
    HEAPS.lock().iter().map(|h| h.allocated_bytes()).sum()
}

// ---------------------------------------------------------------------------
// Lazy physical backing for hi-vmem heaps
// ---------------------------------------------------------------------------

/// Make sure every chunk touched by `[va, va+size)` is backed. On failure
/// everything this call mapped is rolled back.
fn ensure_backed(h: &mut Heap, va: u64, size: usize) -> bool {
    if h.mode() != BackingMode::HiVmem {
        return true;
    }

    let mut newly_mapped: Vec<usize> = Vec::new();

    for chunk in h.chunk_range(va, size) {
        if h.chunk_is_mapped(chunk) {
            continue;
        }
        let chunk_va = h.vaddr() + (chunk * h.alloc_block_size()) as u64;
        let pages = h.alloc_block_size() / PAGE_SIZE;
        let mut mapped_pages = 0;

        for i in 0..pages {
            let page_va = VirtAddr::new(chunk_va + (i * PAGE_SIZE) as u64);
            let pa = FRAME_ALLOCATOR.lock().alloc_page();
            let ok = match pa {
                Some(pa) => {
                    // Kernel-half mapping: the pdir argument is unused for
                    // hi-vmem addresses, any directory works.
                    let mut dummy = paging::PageDirectory::new();
                    paging::map_page(&mut dummy, page_va, pa, paging::PteFlags::RW).is_ok()
                }
                None => false,
            };
            if !ok {
                if let Some(pa) = pa {
                    FRAME_ALLOCATOR.lock().free_page(pa);
                }
                // Roll back this partial chunk and all chunks we mapped.
                unmap_chunk_pages(h, chunk_va, mapped_pages);
                for &c in &newly_mapped {
                    let cva = h.vaddr() + (c * h.alloc_block_size()) as u64;
                    unmap_chunk_pages(h, cva, pages);
                    h.set_chunk_mapped(c, false);
                }
                return false;
            }
            mapped_pages += 1;
        }

        h.set_chunk_mapped(chunk, true);
        newly_mapped.push(chunk);
    }

    true
}

fn unmap_chunk_pages(_h: &mut Heap, chunk_va: u64, pages: usize) {
    let mut dummy = paging::PageDirectory::new();
    for i in 0..pages {
        let page_va = VirtAddr::new(chunk_va + (i * PAGE_SIZE) as u64);
        paging::unmap_page_permissive(&mut dummy, page_va, true);
    }
}

/// Release the backing of chunks fully contained in the freed block.
fn release_backing(h: &mut Heap, va: u64, size: usize) {
    if h.mode() != BackingMode::HiVmem {
        return;
    }
    let pages = h.alloc_block_size() / PAGE_SIZE;
    for chunk in h.contained_chunks(va, size) {
        if h.chunk_is_mapped(chunk) {
            let chunk_va = h.vaddr() + (chunk * h.alloc_block_size()) as u64;
            unmap_chunk_pages(h, chunk_va, pages);
            h.set_chunk_mapped(chunk, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Per-heap API (subsystems owning their own heap use these directly)
// ---------------------------------------------------------------------------

/// Allocate from one specific heap. `size` is updated to the rounded size
/// actually reserved, which is what a later free must pass back.
pub fn per_heap_kmalloc(h: &mut Heap, size: &mut usize) -> Option<u64> {
    let (va, actual) = h.alloc(*size)?;
    if !ensure_backed(h, va, actual) {
        h.free(va, actual);
        return None;
    }
    *size = actual;
    Some(va)
}

/// Multi-step variant: a contiguous run of `sub_block`-sized blocks.
pub fn per_heap_kmalloc_multi_step(h: &mut Heap, size: &mut usize, sub_block: usize) -> Option<u64> {
    let (va, actual) = h.alloc_multi_step(*size, sub_block)?;
    if !ensure_backed(h, va, actual) {
        h.free_multi_step(va, actual, sub_block);
        return None;
    }
    *size = actual;
    Some(va)
}

/// Free back into one specific heap. Panics if the pointer does not belong
/// to it (an unknown pointer is a kernel bug, not an error).
pub fn per_heap_kfree(h: &mut Heap, va: u64, size: &mut usize) {
    assert!(h.contains(va), "per_heap_kfree: pointer not in heap");
    let actual = h.free(va, *size);
    release_backing(h, va, actual);
    *size = actual;
}

/// Multi-step free, block by block.
pub fn per_heap_kfree_multi_step(h: &mut Heap, va: u64, size: usize, sub_block: usize) {
    assert!(h.contains(va), "per_heap_kfree: pointer not in heap");
    h.free_multi_step(va, size, sub_block);
    release_backing(h, va, size);
}

// ---------------------------------------------------------------------------
// Global kmalloc
// ---------------------------------------------------------------------------

fn grow_ladder(heaps: &mut Vec<Heap>, at_least: usize) -> KernelResult<()> {
    if heaps.len() >= KMALLOC_HEAPS_COUNT {
        return Err(KernelError::OutOfMemory);
    }

    let last = heaps.last().map(|h| h.size()).unwrap_or(KMALLOC_FIRST_HEAP_SIZE);
    let mut size = (last * 2).min(MAX_DYN_HEAP_SIZE);
    while size < at_least.next_power_of_two() {
        size *= 2;
        if size > MAX_DYN_HEAP_SIZE {
            return Err(KernelError::OutOfMemory);
        }
    }

    let va = paging::hi_vmem_reserve(size)?;
    let h = Heap::new(
        va.as_u64(),
        size,
        KMALLOC_MIN_BLOCK,
        DYN_HEAP_ALLOC_BLOCK,
        BackingMode::HiVmem,
    )?;
    log::info!("kmalloc: new heap at {:#x}, {} KB", va.as_u64(), size / 1024);
    heaps.push(h);
    Ok(())
}

fn general_kmalloc(size: usize) -> Option<u64> {
    let mut heaps = HEAPS.lock();

    for h in heaps.iter_mut() {
        if h.round_up(size) > h.size() {
            continue;
        }
        // A heap only serves requests at least as large as its backing
        // granularity; smaller ones belong to a finer heap (the linear
        // first heap has no granularity and takes anything).
        if h.alloc_block_size() > size {
            continue;
        }
        let mut sz = size;
        if let Some(va) = per_heap_kmalloc(h, &mut sz) {
            return Some(va);
        }
    }

    // Everything full: grow the ladder once and retry.
    if grow_ladder(&mut heaps, size).is_ok() {
        let h = heaps.last_mut().expect("heap just pushed");
        let mut sz = size;
        return per_heap_kmalloc(h, &mut sz);
    }

    None
}

/// Allocate `size` bytes from the smallest heap that accommodates them.
/// Returns `None` on exhaustion.
#[track_caller]
pub fn kmalloc(size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
        return None;
    }
    let va = general_kmalloc(size)?;
    leak::record_alloc(va, size, core::panic::Location::caller());
    NonNull::new(va as usize as *mut u8)
}

/// Allocate with a minimum alignment. Buddy blocks of size `s` are
/// `s`-aligned relative to the (page-aligned) heap base, so rounding the
/// request up to the alignment is sufficient; an aligned request may waste
/// a leaf but never packs externally.
#[track_caller]
pub fn aligned_kmalloc(size: usize, align: AlignFlag) -> Option<NonNull<u8>> {
    kmalloc(size.max(align.bytes()))
}

/// Allocate and zero.
#[track_caller]
pub fn kzmalloc(size: usize) -> Option<NonNull<u8>> {
    let ptr = kmalloc(size)?;
    zero_range(ptr.as_ptr() as u64, size);
    Some(ptr)
}

/// Free an allocation. `size` must be the originally requested size (it is
/// rounded to the owning heap's granularity the same way).
pub fn kfree2(ptr: NonNull<u8>, size: usize) {
    let va = ptr.as_ptr() as u64;
    let mut heaps = HEAPS.lock();

    let h = heaps
        .iter_mut()
        .find(|h| h.contains(va))
        .expect("kfree2: pointer does not belong to any heap");

    let mut sz = size;
    per_heap_kfree(h, va, &mut sz);
    leak::record_free(va);
}

/// Zero kernel memory through the physical view, so it works identically on
/// bare metal and on the host test target.
fn zero_range(va: u64, len: usize) {
    let mut done = 0;
    while done < len {
        let v = VirtAddr::new(va + done as u64);
        let (pa, _) = paging::kernel_translate(v).expect("kmalloc range must be mapped");
        let off = v.page_offset();
        let chunk = (PAGE_SIZE - off).min(len - done);
        physmem::with_frame(pa.frame(), |p| p[off..off + chunk].fill(0));
        done += chunk;
    }
}

/// Destroy a dynamically created heap. Only allowed when fully unallocated.
pub fn destroy_heap(idx: usize) -> KernelResult<()> {
    let mut heaps = HEAPS.lock();
    let h = heaps.get(idx).ok_or(KernelError::InvalidArgument { name: "idx" })?;

    if idx == 0 {
        return Err(KernelError::Busy); // the first heap is permanent
    }
    if !h.is_empty() {
        return Err(KernelError::Busy);
    }

    let (va, size) = (h.vaddr(), h.size());
    heaps.remove(idx);
    paging::hi_vmem_release(VirtAddr::new(va), size);
    Ok(())
}
