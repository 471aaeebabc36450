//! Hardware page tables, shadowing the logical page directories.
//!
//! The portable paging layer is the source of truth; the hardware tables
//! are a demand-filled cache of it. A user access faults, the fault path
//! consults the logical directory, and the translation is installed here.
//! Logical changes (unmap, COW resolution, fork write-protection) clear
//! the affected hardware state so the next access re-faults.
//!
//! The kernel half of every root is copied from the boot tables and never
//! changes; kernel hi-vmem mappings are reached through the boot-time
//! physical map, so only the user half is shadowed.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use spin::Mutex;

use x86_64::registers::control::Cr3;
use x86_64::structures::paging::PhysFrame;

use crate::config::KERNEL_BASE_VA;
use crate::error::{KernelError, KernelResult};
use crate::mm::frame::FRAME_ALLOCATOR;
use crate::mm::paging::{self, PteFlags};
use crate::mm::{PhysAddr, VirtAddr};
use crate::sched::Pid;

const ENTRIES: usize = 512;
const P_PRESENT: u64 = 1 << 0;
const P_RW: u64 = 1 << 1;
const P_USER: u64 = 1 << 2;
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

#[inline]
fn table_ptr(pa: u64) -> *mut u64 {
    (KERNEL_BASE_VA + pa) as *mut u64
}

/// One process's hardware root plus every table frame it owns.
struct HwSpace {
    pml4: u64,
    table_frames: Vec<u64>,
}

impl HwSpace {
    /// Allocate a root and copy the kernel half from the boot tables.
    fn new(boot_pml4: u64) -> KernelResult<Self> {
        let frame = FRAME_ALLOCATOR
            .lock()
            .alloc_page()
            .ok_or(KernelError::OutOfMemory)?;
        let pa = frame.as_u64();

        // SAFETY: freshly allocated frame, reached via the physical map.
        unsafe {
            let dst = table_ptr(pa);
            let src = table_ptr(boot_pml4);
            for i in 0..ENTRIES {
                let v = if i < ENTRIES / 2 { 0 } else { *src.add(i) };
                dst.add(i).write(v);
            }
        }

        Ok(Self {
            pml4: pa,
            table_frames: Vec::new(),
        })
    }

    /// Walk to the PTE slot for `va`, allocating missing tables.
    fn pte_slot(&mut self, va: u64) -> KernelResult<*mut u64> {
        let idx = [
            (va >> 39) & 0x1FF,
            (va >> 30) & 0x1FF,
            (va >> 21) & 0x1FF,
        ];

        let mut table = self.pml4;
        for level_idx in idx {
            // SAFETY: `table` is one of our table frames (or the root).
            let slot = unsafe { table_ptr(table).add(level_idx as usize) };
            let entry = unsafe { slot.read() };

            let next = if entry & P_PRESENT != 0 {
                entry & ADDR_MASK
            } else {
                let frame = FRAME_ALLOCATOR
                    .lock()
                    .alloc_page()
                    .ok_or(KernelError::OutOfMemory)?;
                let pa = frame.as_u64();
                // SAFETY: fresh frame, zeroed before linking.
                unsafe {
                    core::ptr::write_bytes(table_ptr(pa), 0, ENTRIES);
                    slot.write(pa | P_PRESENT | P_RW | P_USER);
                }
                self.table_frames.push(pa);
                pa
            };
            table = next;
        }

        // SAFETY: `table` is now the level-1 table.
        Ok(unsafe { table_ptr(table).add(((va >> 12) & 0x1FF) as usize) })
    }

    fn map(&mut self, va: u64, pa: u64, rw: bool) -> KernelResult<()> {
        let slot = self.pte_slot(va)?;
        let mut e = pa | P_PRESENT | P_USER;
        if rw {
            e |= P_RW;
        }
        // SAFETY: slot produced by pte_slot.
        unsafe { slot.write(e) };
        crate::arch::tlb_flush(va);
        Ok(())
    }

    fn unmap(&mut self, va: u64) {
        if let Ok(slot) = self.pte_slot(va) {
            // SAFETY: slot produced by pte_slot.
            unsafe { slot.write(0) };
            crate::arch::tlb_flush(va);
        }
    }

    /// Drop the whole user half: unlink it from the root and free every
    /// intermediate table.
    fn clear_user_half(&mut self) {
        // SAFETY: the root is ours; only the lower-half entries go.
        unsafe {
            let root = table_ptr(self.pml4);
            for i in 0..ENTRIES / 2 {
                root.add(i).write(0);
            }
        }
        let mut fa = FRAME_ALLOCATOR.lock();
        for pa in self.table_frames.drain(..) {
            fa.free_page(PhysAddr::new(pa));
        }
        crate::arch::tlb_flush_all();
    }

    fn free(mut self) {
        self.clear_user_half();
        FRAME_ALLOCATOR.lock().free_page(PhysAddr::new(self.pml4));
    }
}

struct MmuState {
    boot_pml4: u64,
    spaces: BTreeMap<Pid, HwSpace>,
}

static MMU: Mutex<Option<MmuState>> = Mutex::new(None);

/// Capture the boot tables and register the shadow hooks with the portable
/// paging layer.
pub fn init() {
    let (frame, _) = Cr3::read();
    *MMU.lock() = Some(MmuState {
        boot_pml4: frame.start_address().as_u64(),
        spaces: BTreeMap::new(),
    });

    paging::set_user_unmap_hook(current_space_unmap);
    paging::set_user_space_reset_hook(current_space_reset);
    paging::set_user_space_drop_hook(drop_space);
    paging::set_kernel_map_hook(install_kernel);
    paging::set_kernel_unmap_hook(uninstall_kernel);
}

fn with_mmu<R>(f: impl FnOnce(&mut MmuState) -> R) -> Option<R> {
    MMU.lock().as_mut().map(f)
}

/// Load the given process's root (creating it on first use).
pub fn activate(pid: Pid) {
    let pml4 = with_mmu(|st| {
        if !st.spaces.contains_key(&pid) {
            let space = HwSpace::new(st.boot_pml4).expect("hw space allocation");
            st.spaces.insert(pid, space);
        }
        st.spaces[&pid].pml4
    });

    if let Some(pml4) = pml4 {
        load_root(pml4);
    }
}

/// Back to the boot tables (kernel threads).
pub fn activate_kernel() {
    if let Some(pml4) = with_mmu(|st| st.boot_pml4) {
        load_root(pml4);
    }
}

fn load_root(pml4: u64) {
    let (cur, flags) = Cr3::read();
    if cur.start_address().as_u64() != pml4 {
        // SAFETY: pml4 names a valid root whose kernel half matches the
        // boot tables.
        unsafe {
            Cr3::write(
                PhysFrame::containing_address(x86_64::PhysAddr::new(pml4)),
                flags,
            );
        }
    }
}

/// Install a kernel-half translation (hi-vmem heap chunks, kernel stacks)
/// into the boot tables. Every space shares the boot root's kernel-half
/// top-level entries, so this is visible everywhere at once.
pub fn install_kernel(va: u64) {
    let page = va & !0xFFF;
    let Some((pa, flags)) = paging::kernel_translate(VirtAddr::new(page)) else {
        return;
    };

    let _ = with_mmu(|st| {
        let idx = [
            (page >> 39) & 0x1FF,
            (page >> 30) & 0x1FF,
            (page >> 21) & 0x1FF,
        ];

        let mut table = st.boot_pml4;
        for level_idx in idx {
            // SAFETY: walking the boot tables through the physical map.
            let slot = unsafe { table_ptr(table).add(level_idx as usize) };
            let entry = unsafe { slot.read() };

            table = if entry & P_PRESENT != 0 {
                entry & ADDR_MASK
            } else {
                let Some(frame) = FRAME_ALLOCATOR.lock().alloc_page() else {
                    return;
                };
                let fpa = frame.as_u64();
                // SAFETY: fresh frame, zeroed before linking. Kernel-half
                // tables are permanent; no tracking needed.
                unsafe {
                    core::ptr::write_bytes(table_ptr(fpa), 0, ENTRIES);
                    slot.write(fpa | P_PRESENT | P_RW);
                }
                fpa
            };
        }

        let mut e = (pa.as_u64() & !0xFFF) | P_PRESENT;
        if flags.contains(PteFlags::RW) {
            e |= P_RW;
        }
        // SAFETY: `table` is the level-1 table for this address.
        unsafe {
            table_ptr(table)
                .add(((page >> 12) & 0x1FF) as usize)
                .write(e);
        }
        crate::arch::tlb_flush(page);
    });
}

/// Remove a kernel-half translation from the boot tables.
pub fn uninstall_kernel(va: u64) {
    let page = va & !0xFFF;

    let _ = with_mmu(|st| {
        let idx = [
            (page >> 39) & 0x1FF,
            (page >> 30) & 0x1FF,
            (page >> 21) & 0x1FF,
        ];

        let mut table = st.boot_pml4;
        for level_idx in idx {
            // SAFETY: walking the boot tables through the physical map.
            let entry = unsafe { table_ptr(table).add(level_idx as usize).read() };
            if entry & P_PRESENT == 0 {
                return;
            }
            table = entry & ADDR_MASK;
        }

        // SAFETY: `table` is the level-1 table for this address.
        unsafe {
            table_ptr(table)
                .add(((page >> 12) & 0x1FF) as usize)
                .write(0);
        }
        crate::arch::tlb_flush(page);
    });
}

/// Install the logical translation for `va` into the current process's
/// space. Called from the page-fault path after the portable layer
/// declared the access resolvable.
pub fn install_current(va: u64) {
    let Some(proc) = crate::process::current_process() else {
        return;
    };
    let page = va & !0xFFF;

    let translation = {
        let mu = proc.mu.lock();
        paging::translate(&mu.pdir, VirtAddr::new(page))
    };

    if let Some((pa, flags)) = translation {
        let _ = with_mmu(|st| {
            if let Some(space) = st.spaces.get_mut(&proc.pid) {
                let _ = space.map(page, pa.as_u64() & !0xFFF, flags.contains(PteFlags::RW));
            }
        });
    }
}

/// Hook: one page vanished (or lost permissions) in the current logical
/// directory.
fn current_space_unmap(va: u64) {
    let Some(proc) = crate::process::current_process() else {
        return;
    };
    let _ = with_mmu(|st| {
        if let Some(space) = st.spaces.get_mut(&proc.pid) {
            space.unmap(va & !0xFFF);
        }
    });
}

/// Hook: the current logical user half changed wholesale (fork
/// write-protection, exec teardown).
fn current_space_reset() {
    let Some(proc) = crate::process::current_process() else {
        return;
    };
    let _ = with_mmu(|st| {
        if let Some(space) = st.spaces.get_mut(&proc.pid) {
            space.clear_user_half();
        }
    });
}

/// Free a reaped process's hardware space. Runs in the reaper's context,
/// never with the dead space active.
pub fn drop_space(pid: Pid) {
    let space = with_mmu(|st| st.spaces.remove(&pid)).flatten();
    if let Some(space) = space {
        space.free();
    }
}
