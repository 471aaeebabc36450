//! Architecture-neutral boot protocol.
//!
//! The kernel image is entered in a flat 64-bit environment with interrupts
//! disabled and a pointer to this structure. The bootloader-specific entry
//! shims (`main.rs`) translate their native info into [`BootInfo`] before
//! `kernel_main` runs.

use crate::mm::regions::{MemRegion, MemRegionExtra, MemRegionKind};

/// Framebuffer pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb888,
    Xrgb8888,
    Rgb565,
}

/// Framebuffer handoff info, if the loader set up a linear framebuffer.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub paddr: u64,
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Initial ramdisk location.
#[derive(Debug, Clone, Copy)]
pub struct InitrdInfo {
    pub paddr: u64,
    pub size: u64,
}

/// One entry of the loader's physical memory map, before normalization.
#[derive(Debug, Clone, Copy)]
pub struct BootMemRegion {
    pub addr: u64,
    pub len: u64,
    pub kind: MemRegionKind,
}

/// Everything the kernel needs from the boot environment.
pub struct BootInfo<'a> {
    /// Raw memory map, in whatever order the firmware produced it.
    pub mem_map: &'a [BootMemRegion],
    /// Kernel command line, or empty.
    pub cmdline: &'a str,
    /// Linear framebuffer, if any.
    pub framebuffer: Option<FramebufferInfo>,
    /// Initial ramdisk, if any.
    pub initrd: Option<InitrdInfo>,
    /// UEFI runtime services pointer, or 0.
    pub efi_runtime_services: u64,
}

impl BootMemRegion {
    /// Convert into a mem-regions table entry (no extra flags yet).
    pub fn to_region(self) -> MemRegion {
        MemRegion {
            addr: self.addr,
            len: self.len,
            kind: self.kind,
            extra: MemRegionExtra::empty(),
        }
    }
}
