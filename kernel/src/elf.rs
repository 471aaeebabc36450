//! ELF64 loader for static user executables.
//!
//! Validation happens entirely before anything touches an address space,
//! so exec can keep the old image intact until the header walk has passed.
//! Only `PT_LOAD` segments are honored; `memsz > filesz` tails are
//! zero-filled by mapping the shared zero page.

use crate::config::{PAGE_SIZE, USER_BASE_VA, USER_VMEM_END};
use crate::error::{KernelError, KernelResult};
use crate::mm::frame::FRAME_ALLOCATOR;
use crate::mm::paging::{self, PageDirectory, PteFlags};
use crate::mm::{physmem, VirtAddr};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const PT_LOAD: u32 = 1;
const PF_W: u32 = 2;

#[cfg(target_arch = "riscv64")]
const EM_EXPECTED: u16 = 0xF3; // EM_RISCV
#[cfg(not(target_arch = "riscv64"))]
const EM_EXPECTED: u16 = 0x3E; // EM_X86_64

fn r16(b: &[u8], off: usize) -> KernelResult<u16> {
    b.get(off..off + 2)
        .map(|s| u16::from_le_bytes([s[0], s[1]]))
        .ok_or(KernelError::BadExecutable)
}

fn r32(b: &[u8], off: usize) -> KernelResult<u32> {
    b.get(off..off + 4)
        .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
        .ok_or(KernelError::BadExecutable)
}

fn r64(b: &[u8], off: usize) -> KernelResult<u64> {
    b.get(off..off + 8)
        .map(|s| u64::from_le_bytes([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]]))
        .ok_or(KernelError::BadExecutable)
}

/// One validated PT_LOAD segment.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub vaddr: u64,
    pub offset: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub writable: bool,
}

/// A fully validated image, ready to load.
pub struct ElfImage<'a> {
    bytes: &'a [u8],
    pub entry: u64,
    pub segments: alloc::vec::Vec<Segment>,
}

/// The results of loading an image into an address space.
#[derive(Debug, Clone, Copy)]
pub struct LoadedElf {
    pub entry: u64,
    /// First page past the highest segment: the initial program break.
    pub brk_start: u64,
}

/// Parse and validate without side effects.
pub fn parse(bytes: &[u8]) -> KernelResult<ElfImage<'_>> {
    if bytes.len() < 64 || bytes[0..4] != ELF_MAGIC {
        return Err(KernelError::BadExecutable);
    }
    if bytes[4] != ELFCLASS64 || bytes[5] != ELFDATA2LSB {
        return Err(KernelError::BadExecutable);
    }
    if r16(bytes, 16)? != ET_EXEC || r16(bytes, 18)? != EM_EXPECTED {
        return Err(KernelError::BadExecutable);
    }

    let entry = r64(bytes, 24)?;
    let phoff = r64(bytes, 32)? as usize;
    let phentsize = r16(bytes, 54)? as usize;
    let phnum = r16(bytes, 56)? as usize;

    if phentsize < 56 || phnum == 0 || phnum > 64 {
        return Err(KernelError::BadExecutable);
    }

    let mut segments = alloc::vec::Vec::new();
    for i in 0..phnum {
        let ph = phoff + i * phentsize;
        if r32(bytes, ph)? != PT_LOAD {
            continue;
        }
        let flags = r32(bytes, ph + 4)?;
        let offset = r64(bytes, ph + 8)?;
        let vaddr = r64(bytes, ph + 16)?;
        let filesz = r64(bytes, ph + 32)?;
        let memsz = r64(bytes, ph + 40)?;

        if memsz < filesz
            || vaddr < USER_BASE_VA
            || vaddr.checked_add(memsz).is_none()
            || vaddr + memsz > USER_VMEM_END
        {
            return Err(KernelError::BadExecutable);
        }
        if (offset as usize)
            .checked_add(filesz as usize)
            .map(|end| end > bytes.len())
            .unwrap_or(true)
        {
            return Err(KernelError::BadExecutable);
        }

        segments.push(Segment {
            vaddr,
            offset,
            filesz,
            memsz,
            writable: flags & PF_W != 0,
        });
    }

    if segments.is_empty() {
        return Err(KernelError::BadExecutable);
    }
    let entry_covered = segments
        .iter()
        .any(|s| entry >= s.vaddr && entry < s.vaddr + s.memsz);
    if !entry_covered {
        return Err(KernelError::BadExecutable);
    }

    Ok(ElfImage {
        bytes,
        entry,
        segments,
    })
}

/// Map the image into `pdir`. Pages with file content get private frames;
/// pure-bss pages share the zero page until first write.
pub fn load(image: &ElfImage<'_>, pdir: &mut PageDirectory) -> KernelResult<LoadedElf> {
    let mut brk_start = 0u64;

    for seg in &image.segments {
        let start = seg.vaddr & !(PAGE_SIZE as u64 - 1);
        let end = (seg.vaddr + seg.memsz).div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64;
        brk_start = brk_start.max(end);

        let mut page_va = start;
        while page_va < end {
            // Byte range of this page that carries file content.
            let content_lo = page_va.max(seg.vaddr);
            let content_hi = (page_va + PAGE_SIZE as u64).min(seg.vaddr + seg.filesz);

            if content_lo < content_hi {
                let pa = FRAME_ALLOCATOR
                    .lock()
                    .alloc_page()
                    .ok_or(KernelError::OutOfMemory)?;
                physmem::zero_frame(pa.frame());

                let file_off = (seg.offset + (content_lo - seg.vaddr)) as usize;
                let len = (content_hi - content_lo) as usize;
                let page_off = (content_lo - page_va) as usize;
                physmem::write_bytes(
                    pa.frame(),
                    page_off,
                    &image.bytes[file_off..file_off + len],
                );

                let mut flags = PteFlags::USER;
                if seg.writable {
                    flags |= PteFlags::RW;
                }
                paging::map_page(pdir, VirtAddr::new(page_va), pa, flags)?;
            } else {
                // Entirely past filesz: zero-page share.
                paging::map_zero_page(pdir, VirtAddr::new(page_va))?;
            }

            page_va += PAGE_SIZE as u64;
        }
    }

    Ok(LoadedElf {
        entry: image.entry,
        brk_start,
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_support::mm_test_init;
    use test_support::synth_elf;

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse(b"not an elf").is_err());
        let mut bad = synth_elf(0x40_0000, b"code", 0);
        bad[4] = 1; // 32-bit class
        assert!(parse(&bad).is_err());
        let mut bad2 = synth_elf(0x40_0000, b"code", 0);
        bad2[24] = 0; // entry outside the only segment
        bad2[25] = 0;
        bad2[26] = 0;
        assert!(parse(&bad2).is_err());
    }

    #[test]
    fn test_parse_extracts_segments() {
        let img = synth_elf(0x40_0000, b"hello world", 0x2000);
        let elf = parse(&img).unwrap();
        assert_eq!(elf.entry, 0x40_0000);
        assert_eq!(elf.segments.len(), 1);
        let s = elf.segments[0];
        assert_eq!(s.vaddr, 0x40_0000);
        assert_eq!(s.filesz, 11);
        assert_eq!(s.memsz, 11 + 0x2000);
        assert!(s.writable);
    }

    #[test]
    fn test_load_copies_content_and_zero_fills() {
        mm_test_init();
        let img = synth_elf(0x40_0000, b"XYZ", 2 * PAGE_SIZE as u64);
        let elf = parse(&img).unwrap();

        let mut pdir = PageDirectory::new();
        let loaded = load(&elf, &mut pdir).unwrap();
        assert_eq!(loaded.entry, 0x40_0000);
        // 3 bytes + 8KiB bss → 3 pages, brk right after.
        assert_eq!(loaded.brk_start, 0x40_3000);

        let mut buf = [0u8; 3];
        paging::virtual_read(&pdir, VirtAddr::new(0x40_0000), &mut buf).unwrap();
        assert_eq!(&buf, b"XYZ");

        // bss reads as zeros via the shared zero page.
        let mut tail = [9u8; 16];
        paging::virtual_read(&pdir, VirtAddr::new(0x40_1000), &mut tail).unwrap();
        assert_eq!(tail, [0u8; 16]);

        paging::pdir_destroy(&mut pdir);
    }
}
