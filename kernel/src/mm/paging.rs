//! Virtual memory: page directories, the kernel linear mapping, user
//! mappings, copy-on-write and the hi-vmem reservation window.
//!
//! The page directory here is the *logical* translation structure: a
//! two-level map from virtual page to `{frame, flags}`. The arch layer owns
//! mirroring it into hardware-format tables and the TLB; everything the
//! rest of the kernel needs (including the COW protocol and cross-pdir
//! copies) is expressed against this model, which also makes it testable on
//! the host target.
//!
//! Layout: the upper half `[KERNEL_BASE_VA, LINEAR_MAPPING_END)` is the
//! linear mapping of physical memory and is implicitly present in every
//! directory. Kernel mappings above it (hi-vmem) live in a single table set
//! shared by all directories. The user half is private per process.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use super::frame::{FRAME_ALLOCATOR, SHARED_FOREVER};
use super::{physmem, FrameNumber, PhysAddr, VirtAddr};
use crate::config::{
    HI_VMEM_END, KERNEL_BASE_VA, LINEAR_MAPPING_END, PAGE_SHIFT, PAGE_SIZE, USER_VMEM_END,
};
use crate::error::{KernelError, KernelResult};

bitflags! {
    /// Per-page attributes of a logical PTE. Presence is the entry itself.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u16 {
        const RW    = 1 << 0;
        const USER  = 1 << 1;
        const LARGE = 1 << 2;
        const PAT   = 1 << 3;
        /// Read-only because of fork sharing; a write fault resolves it.
        const COW   = 1 << 4;
    }
}

/// One logical page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte {
    pub frame: FrameNumber,
    pub flags: PteFlags,
}

/// One page-table page: translations for a 4 MiB slot.
pub struct PageTable {
    ptes: [Option<Pte>; 1024],
    live: u32,
}

impl PageTable {
    fn new() -> Box<Self> {
        Box::new(Self {
            ptes: [None; 1024],
            live: 0,
        })
    }
}

#[inline]
fn table_index(va: u64) -> u64 {
    va >> 22
}

#[inline]
fn pte_index(va: u64) -> usize {
    ((va >> PAGE_SHIFT) & 0x3FF) as usize
}

#[inline]
fn is_user_va(va: u64) -> bool {
    va < USER_VMEM_END
}

#[inline]
fn is_linear_va(va: u64) -> bool {
    (KERNEL_BASE_VA..LINEAR_MAPPING_END).contains(&va)
}

#[inline]
fn is_hi_vmem_va(va: u64) -> bool {
    (LINEAR_MAPPING_END..HI_VMEM_END).contains(&va)
}

/// Kernel mappings above the linear region, shared by every directory.
static KERNEL_SPACE: Mutex<BTreeMap<u64, Box<PageTable>>> = Mutex::new(BTreeMap::new());

// The hardware MMU layer (when there is one) shadows the logical
// directories and registers these notifications so stale hardware entries
// never outlive a logical change. All three refer to the *current*
// process's space.

static USER_UNMAP_HOOK: Mutex<Option<fn(u64)>> = Mutex::new(None);
static USER_SPACE_RESET_HOOK: Mutex<Option<fn()>> = Mutex::new(None);
static USER_SPACE_DROP_HOOK: Mutex<Option<fn(u32)>> = Mutex::new(None);
static KERNEL_MAP_HOOK: Mutex<Option<fn(u64)>> = Mutex::new(None);
static KERNEL_UNMAP_HOOK: Mutex<Option<fn(u64)>> = Mutex::new(None);

pub fn set_user_unmap_hook(f: fn(u64)) {
    *USER_UNMAP_HOOK.lock() = Some(f);
}

pub fn set_user_space_reset_hook(f: fn()) {
    *USER_SPACE_RESET_HOOK.lock() = Some(f);
}

pub fn set_user_space_drop_hook(f: fn(u32)) {
    *USER_SPACE_DROP_HOOK.lock() = Some(f);
}

/// Kernel hi-vmem mappings are installed eagerly: a kernel *stack* page
/// cannot be demand-faulted (there is no stack to take the fault on).
pub fn set_kernel_map_hook(f: fn(u64)) {
    *KERNEL_MAP_HOOK.lock() = Some(f);
}

pub fn set_kernel_unmap_hook(f: fn(u64)) {
    *KERNEL_UNMAP_HOOK.lock() = Some(f);
}

fn note_kernel_map(va: u64) {
    if let Some(f) = *KERNEL_MAP_HOOK.lock() {
        f(va);
    }
}

fn note_kernel_unmap(va: u64) {
    if let Some(f) = *KERNEL_UNMAP_HOOK.lock() {
        f(va);
    }
}

fn note_user_unmap(va: u64) {
    if let Some(f) = *USER_UNMAP_HOOK.lock() {
        f(va);
    }
}

fn note_user_space_reset() {
    if let Some(f) = *USER_SPACE_RESET_HOOK.lock() {
        f();
    }
}

/// Tell the hardware layer a user process is gone for good (reap time).
pub fn note_user_space_dropped(pid: u32) {
    if let Some(f) = *USER_SPACE_DROP_HOOK.lock() {
        f(pid);
    }
}

/// The shared all-zero page. `0` until [`init`] runs.
static ZERO_PAGE: AtomicU32 = AtomicU32::new(u32::MAX);

/// A process's page directory: the private user half. The kernel half is
/// shared implicitly (linear mapping) and via [`KERNEL_SPACE`].
pub struct PageDirectory {
    user_tables: BTreeMap<u64, Box<PageTable>>,
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDirectory {
    pub fn new() -> Self {
        Self {
            user_tables: BTreeMap::new(),
        }
    }

    fn pte(&self, va: u64) -> Option<Pte> {
        self.user_tables
            .get(&table_index(va))
            .and_then(|t| t.ptes[pte_index(va)])
    }

    fn pte_mut(&mut self, va: u64) -> Option<&mut Option<Pte>> {
        self.user_tables
            .get_mut(&table_index(va))
            .map(|t| &mut t.ptes[pte_index(va)])
    }

    fn set_pte(&mut self, va: u64, pte: Pte) {
        let table = self
            .user_tables
            .entry(table_index(va))
            .or_insert_with(PageTable::new);
        debug_assert!(table.ptes[pte_index(va)].is_none());
        table.ptes[pte_index(va)] = Some(pte);
        table.live += 1;
    }

    fn clear_pte(&mut self, va: u64) -> Option<Pte> {
        let idx = table_index(va);
        let table = self.user_tables.get_mut(&idx)?;
        let old = table.ptes[pte_index(va)].take();
        if old.is_some() {
            table.live -= 1;
            if table.live == 0 {
                self.user_tables.remove(&idx);
            }
        }
        old
    }

    /// Iterate all present user mappings.
    pub fn user_mappings(&self) -> impl Iterator<Item = (VirtAddr, Pte)> + '_ {
        self.user_tables.iter().flat_map(|(ti, t)| {
            t.ptes.iter().enumerate().filter_map(move |(pi, pte)| {
                pte.map(|p| {
                    let va = (ti << 22) | ((pi as u64) << PAGE_SHIFT);
                    (VirtAddr::new(va), p)
                })
            })
        })
    }
}

/// Initialize the paging layer: allocate and publish the shared zero page.
/// The frame allocator must already be initialized.
pub fn init() -> KernelResult<()> {
    let mut fa = FRAME_ALLOCATOR.lock();
    let pa = fa.alloc_page().ok_or(KernelError::OutOfMemory)?;
    let frame = pa.frame();
    fa.ref_set(frame, SHARED_FOREVER);
    drop(fa);

    physmem::zero_frame(frame);
    ZERO_PAGE.store(frame.0, Ordering::Release);
    log::info!("paging: zero page at frame {}", frame.0);
    Ok(())
}

#[inline]
fn zero_page() -> FrameNumber {
    let f = ZERO_PAGE.load(Ordering::Acquire);
    assert_ne!(f, u32::MAX, "paging::init() not called");
    FrameNumber::new(f)
}

// ---------------------------------------------------------------------------
// map / unmap
// ---------------------------------------------------------------------------

/// Map one page. `va` must not already be mapped; both addresses must be
/// page aligned.
pub fn map_page(pdir: &mut PageDirectory, va: VirtAddr, pa: PhysAddr, flags: PteFlags) -> KernelResult<()> {
    if !va.is_page_aligned() || !pa.is_page_aligned() {
        return Err(KernelError::InvalidArgument { name: "addr" });
    }

    let v = va.as_u64();
    let pte = Pte {
        frame: pa.frame(),
        flags,
    };

    if is_user_va(v) {
        if pdir.pte(v).is_some() {
            return Err(KernelError::AlreadyMapped { vaddr: v });
        }
        pdir.set_pte(v, pte);
        FRAME_ALLOCATOR.lock().ref_inc(pte.frame);
        return Ok(());
    }

    if is_linear_va(v) {
        // The linear mapping is stable after init; remapping it is a bug.
        return Err(KernelError::AlreadyMapped { vaddr: v });
    }

    if is_hi_vmem_va(v) {
        {
            let mut ks = KERNEL_SPACE.lock();
            let table = ks.entry(table_index(v)).or_insert_with(PageTable::new);
            let slot = &mut table.ptes[pte_index(v)];
            if slot.is_some() {
                return Err(KernelError::AlreadyMapped { vaddr: v });
            }
            *slot = Some(pte);
            table.live += 1;
        }
        note_kernel_map(v);
        return Ok(());
    }

    Err(KernelError::InvalidArgument { name: "va" })
}

/// Map `count` consecutive pages; best effort. Returns how many were
/// actually mapped so the caller can roll back.
pub fn map_pages(
    pdir: &mut PageDirectory,
    va: VirtAddr,
    pa: PhysAddr,
    count: usize,
    flags: PteFlags,
) -> usize {
    let mut done = 0;
    for i in 0..count {
        let v = VirtAddr::new(va.as_u64() + (i * PAGE_SIZE) as u64);
        let p = PhysAddr::new(pa.as_u64() + (i * PAGE_SIZE) as u64);
        if map_page(pdir, v, p, flags).is_err() {
            break;
        }
        done += 1;
    }
    done
}

/// Map the shared read-only zero page at `va` (BSS, fresh anonymous mmap).
pub fn map_zero_page(pdir: &mut PageDirectory, va: VirtAddr) -> KernelResult<()> {
    map_page(pdir, va, zero_page().addr(), PteFlags::USER)
}

/// Map `count` zero pages; best effort, returns pages mapped.
pub fn map_zero_pages(pdir: &mut PageDirectory, va: VirtAddr, count: usize) -> usize {
    let mut done = 0;
    for i in 0..count {
        let v = VirtAddr::new(va.as_u64() + (i * PAGE_SIZE) as u64);
        if map_zero_page(pdir, v).is_err() {
            break;
        }
        done += 1;
    }
    done
}

fn drop_user_frame(pte: Pte, free_pa: bool) {
    let mut fa = FRAME_ALLOCATOR.lock();
    let rc = fa.ref_dec(pte.frame);
    if free_pa && rc == 0 {
        fa.free_page(pte.frame.addr());
    }
}

/// Unmap one page; asserts it was mapped.
pub fn unmap_page(pdir: &mut PageDirectory, va: VirtAddr, free_pa: bool) {
    assert!(unmap_page_permissive(pdir, va, free_pa), "unmap of unmapped page {:#x}", va.as_u64());
}

/// Unmap one page if mapped; returns whether it was.
pub fn unmap_page_permissive(pdir: &mut PageDirectory, va: VirtAddr, free_pa: bool) -> bool {
    let v = va.as_u64();

    if is_user_va(v) {
        match pdir.clear_pte(v) {
            Some(pte) => {
                drop_user_frame(pte, free_pa);
                note_user_unmap(v);
                crate::arch::tlb_flush(v);
                true
            }
            None => false,
        }
    } else if is_hi_vmem_va(v) {
        let unmapped = {
            let mut ks = KERNEL_SPACE.lock();
            let Some(table) = ks.get_mut(&table_index(v)) else {
                return false;
            };
            match table.ptes[pte_index(v)].take() {
                Some(pte) => {
                    table.live -= 1;
                    if free_pa {
                        FRAME_ALLOCATOR.lock().free_page(pte.frame.addr());
                    }
                    true
                }
                None => false,
            }
        };
        if unmapped {
            note_kernel_unmap(v);
            crate::arch::tlb_flush(v);
        }
        unmapped
    } else {
        false
    }
}

/// Unmap `count` pages; asserts each was mapped.
pub fn unmap_pages(pdir: &mut PageDirectory, va: VirtAddr, count: usize, free_pa: bool) {
    for i in 0..count {
        unmap_page(pdir, VirtAddr::new(va.as_u64() + (i * PAGE_SIZE) as u64), free_pa);
    }
}

/// Unmap `count` pages tolerating holes; returns pages actually unmapped.
pub fn unmap_pages_permissive(
    pdir: &mut PageDirectory,
    va: VirtAddr,
    count: usize,
    free_pa: bool,
) -> usize {
    let mut done = 0;
    for i in 0..count {
        if unmap_page_permissive(pdir, VirtAddr::new(va.as_u64() + (i * PAGE_SIZE) as u64), free_pa)
        {
            done += 1;
        }
    }
    done
}

/// Whether `va` is mapped in `pdir` (kernel linear counts as mapped).
pub fn is_mapped(pdir: &PageDirectory, va: VirtAddr) -> bool {
    translate(pdir, va).is_some()
}

/// Physical address `va` translates to, if mapped.
pub fn get_mapping(pdir: &PageDirectory, va: VirtAddr) -> Option<PhysAddr> {
    translate(pdir, va).map(|(pa, _)| pa)
}

/// Full translation: physical address and flags.
pub fn translate(pdir: &PageDirectory, va: VirtAddr) -> Option<(PhysAddr, PteFlags)> {
    let v = va.as_u64();
    if is_user_va(v) {
        let off = va.page_offset() as u64;
        return pdir
            .pte(v & !(PAGE_SIZE as u64 - 1))
            .map(|pte| (PhysAddr::new(pte.frame.addr().as_u64() + off), pte.flags));
    }
    kernel_translate(va)
}

/// Translation for kernel-half addresses; independent of any directory.
pub fn kernel_translate(va: VirtAddr) -> Option<(PhysAddr, PteFlags)> {
    let v = va.as_u64();
    let off = va.page_offset() as u64;

    if is_linear_va(v) {
        return Some((PhysAddr::new(v - KERNEL_BASE_VA), PteFlags::RW));
    }
    if is_hi_vmem_va(v) {
        let ks = KERNEL_SPACE.lock();
        return ks
            .get(&table_index(v))
            .and_then(|t| t.ptes[pte_index(v)])
            .map(|pte| (PhysAddr::new(pte.frame.addr().as_u64() + off), pte.flags));
    }
    None
}

// ---------------------------------------------------------------------------
// fork support: COW clone, deep clone, destroy
// ---------------------------------------------------------------------------

/// Lazily clone `src` for fork.
///
/// Every present writable user page loses its `RW` bit in *both*
/// directories and gains `COW`; the frame's refcount grows by one for the
/// new mapping. The kernel half is shared by construction.
pub fn pdir_clone(src: &mut PageDirectory) -> PageDirectory {
    let mut dst = PageDirectory::new();
    let mut fa = FRAME_ALLOCATOR.lock();

    for (_, table) in src.user_tables.iter_mut() {
        for slot in table.ptes.iter_mut() {
            if let Some(pte) = slot {
                if pte.flags.contains(PteFlags::RW) {
                    pte.flags.remove(PteFlags::RW);
                    pte.flags.insert(PteFlags::COW);
                }
            }
        }
    }

    for (ti, table) in src.user_tables.iter() {
        let mut new_table = PageTable::new();
        for (pi, slot) in table.ptes.iter().enumerate() {
            if let Some(pte) = slot {
                new_table.ptes[pi] = Some(*pte);
                new_table.live += 1;
                fa.ref_inc(pte.frame);
            }
        }
        dst.user_tables.insert(*ti, new_table);
    }

    drop(fa);
    // The stripped write permissions must reach the hardware view too.
    note_user_space_reset();
    crate::arch::tlb_flush_all();
    dst
}

/// Eager copy of the whole user half (used when COW is disabled).
pub fn pdir_deep_clone(src: &PageDirectory) -> KernelResult<PageDirectory> {
    let mut dst = PageDirectory::new();

    for (va, pte) in src.user_mappings() {
        let new_pa = FRAME_ALLOCATOR
            .lock()
            .alloc_page()
            .ok_or(KernelError::OutOfMemory)?;
        physmem::copy_frame(new_pa.frame(), pte.frame);

        let mut flags = pte.flags;
        // A deep copy is private: sharing markers do not carry over, and
        // formerly-COW pages become writable again.
        if flags.contains(PteFlags::COW) {
            flags.remove(PteFlags::COW);
            flags.insert(PteFlags::RW);
        }
        map_page(&mut dst, va, new_pa, flags)?;
    }

    Ok(dst)
}

/// Tear down the user half: drop every mapping (freeing frames whose last
/// reference this was) and the table pages themselves.
pub fn pdir_destroy(pdir: &mut PageDirectory) {
    let vas: Vec<u64> = pdir.user_mappings().map(|(va, _)| va.as_u64()).collect();
    for va in vas {
        unmap_page(pdir, VirtAddr::new(va), true);
    }
}

// ---------------------------------------------------------------------------
// COW fault resolution
// ---------------------------------------------------------------------------

/// Resolve a write-protection fault at `fault_va` if it is a COW page (or a
/// shared zero page). Returns whether the fault was handled.
///
/// After handling, the writing directory holds a private writable frame;
/// other sharers keep their read-only view.
pub fn handle_potential_cow(pdir: &mut PageDirectory, fault_va: VirtAddr) -> bool {
    let v = fault_va.as_u64() & !(PAGE_SIZE as u64 - 1);
    if !is_user_va(v) {
        return false;
    }

    let Some(pte) = pdir.pte(v) else {
        return false;
    };

    let is_cow = pte.flags.contains(PteFlags::COW);
    let is_zero = pte.frame == zero_page() && !pte.flags.contains(PteFlags::RW);
    if !is_cow && !is_zero {
        return false;
    }

    let mut fa = FRAME_ALLOCATOR.lock();
    let rc = fa.ref_count(pte.frame);

    if rc > 1 || rc == SHARED_FOREVER {
        // Still shared: allocate a private frame and copy.
        let Some(new_pa) = fa.alloc_page() else {
            return false;
        };
        fa.ref_dec(pte.frame);
        fa.ref_set(new_pa.frame(), 1);
        drop(fa);

        physmem::copy_frame(new_pa.frame(), pte.frame);

        let slot = pdir.pte_mut(v).expect("pte vanished");
        let mut flags = pte.flags;
        flags.remove(PteFlags::COW);
        flags.insert(PteFlags::RW);
        *slot = Some(Pte {
            frame: new_pa.frame(),
            flags,
        });
    } else {
        // Last sharer: just make it writable again.
        drop(fa);
        let slot = pdir.pte_mut(v).expect("pte vanished");
        let mut flags = pte.flags;
        flags.remove(PteFlags::COW);
        flags.insert(PteFlags::RW);
        *slot = Some(Pte {
            frame: pte.frame,
            flags,
        });
    }

    note_user_unmap(v);
    crate::arch::tlb_flush(v);
    true
}

// ---------------------------------------------------------------------------
// Cross-pdir copies
// ---------------------------------------------------------------------------

/// Copy `dst.len()` bytes out of `pdir`'s address space. Fails with a
/// user-pointer error if any touched page is unmapped.
pub fn virtual_read(pdir: &PageDirectory, va: VirtAddr, dst: &mut [u8]) -> KernelResult<()> {
    let mut done = 0;
    while done < dst.len() {
        let v = VirtAddr::new(va.as_u64() + done as u64);
        let (pa, _) = translate(pdir, v).ok_or(KernelError::BadUserPointer { vaddr: v.as_u64() })?;
        let off = v.page_offset();
        let chunk = (PAGE_SIZE - off).min(dst.len() - done);
        physmem::read_bytes(pa.frame(), off, &mut dst[done..done + chunk]);
        done += chunk;
    }
    Ok(())
}

/// Copy `src` into `pdir`'s address space. Fails if any touched page is
/// unmapped; does not resolve COW (callers write through the fault path or
/// to pages they own).
pub fn virtual_write(pdir: &PageDirectory, va: VirtAddr, src: &[u8]) -> KernelResult<()> {
    let mut done = 0;
    while done < src.len() {
        let v = VirtAddr::new(va.as_u64() + done as u64);
        let (pa, _) = translate(pdir, v).ok_or(KernelError::BadUserPointer { vaddr: v.as_u64() })?;
        let off = v.page_offset();
        let chunk = (PAGE_SIZE - off).min(src.len() - done);
        physmem::write_bytes(pa.frame(), off, &src[done..done + chunk]);
        done += chunk;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// hi-vmem reservations
// ---------------------------------------------------------------------------

struct HiVmemState {
    /// Reserved `(start, len)` spans, sorted by start.
    reserved: Vec<(u64, u64)>,
}

static HI_VMEM: Mutex<HiVmemState> = Mutex::new(HiVmemState { reserved: Vec::new() });

/// Reserve `size` bytes of virtual space in the hi-vmem hole. Does not map
/// anything.
pub fn hi_vmem_reserve(size: usize) -> KernelResult<VirtAddr> {
    let size = (size as u64).div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64;
    if size == 0 {
        return Err(KernelError::InvalidArgument { name: "size" });
    }

    let mut st = HI_VMEM.lock();
    let mut candidate = LINEAR_MAPPING_END;

    for &(start, len) in st.reserved.iter() {
        if candidate + size <= start {
            break;
        }
        candidate = start + len;
    }

    if candidate + size > HI_VMEM_END {
        return Err(KernelError::OutOfMemory);
    }

    let pos = st.reserved.iter().position(|&(s, _)| s > candidate).unwrap_or(st.reserved.len());
    st.reserved.insert(pos, (candidate, size));
    Ok(VirtAddr::new(candidate))
}

/// Release a reservation previously returned by [`hi_vmem_reserve`].
pub fn hi_vmem_release(va: VirtAddr, size: usize) {
    let size = (size as u64).div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64;
    let mut st = HI_VMEM.lock();
    let before = st.reserved.len();
    st.reserved.retain(|&(s, l)| !(s == va.as_u64() && l == size));
    assert_eq!(before - 1, st.reserved.len(), "bad hi_vmem_release");
}
