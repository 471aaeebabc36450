//! System memory map.
//!
//! Boot hands over a raw, unordered, possibly-overlapping memory map. This
//! module keeps the architecture-neutral, normalized table everything else
//! reads: sorted by address, non-overlapping, with "reserved beats
//! available" applied wherever entries disagree.

use core::fmt::{self, Write};

use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

use crate::config::{DMA_LIMIT, MAX_DMA};

/// What a region of physical memory holds or may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemRegionKind {
    Available,
    Reserved,
    AcpiReclaim,
    AcpiNvs,
    BadRam,
    Bootloader,
    Kernel,
    Initrd,
    EfiRuntimeRo,
    EfiRuntimeRw,
}

impl MemRegionKind {
    /// Overlap precedence: anything beats `Available`; among the rest,
    /// append order breaks ties (see [`MemRegionTable::normalize`]).
    fn rank(self) -> u8 {
        match self {
            Self::Available => 0,
            _ => 1,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Reserved => "reserved",
            Self::AcpiReclaim => "acpi-reclaim",
            Self::AcpiNvs => "acpi-nvs",
            Self::BadRam => "badram",
            Self::Bootloader => "bootloader",
            Self::Kernel => "kernel",
            Self::Initrd => "initrd",
            Self::EfiRuntimeRo => "efi-rt-ro",
            Self::EfiRuntimeRw => "efi-rt-rw",
        }
    }
}

bitflags! {
    /// Extra attributes a region can carry, orthogonal to its kind.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemRegionExtra: u32 {
        /// Below the legacy 1 MiB line.
        const LOWMEM = 1 << 0;
        /// Part of the carved legacy-DMA window.
        const DMA = 1 << 1;
    }
}

/// One entry of the normalized table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegion {
    pub addr: u64,
    pub len: u64,
    pub kind: MemRegionKind,
    pub extra: MemRegionExtra,
}

impl MemRegion {
    pub const fn end(&self) -> u64 {
        self.addr + self.len
    }
}

/// The memory-map table. Built during boot, never shrinks afterwards.
pub struct MemRegionTable {
    regions: Vec<MemRegion>,
    /// Monotonic append counter, used as the tie-breaker between
    /// same-rank overlapping entries (latest wins).
    seq: u64,
    /// `(seq, region)` pairs of everything ever appended; normalization
    /// is re-derived from this, so no information is lost to splitting.
    sources: Vec<(u64, MemRegion)>,
}

impl MemRegionTable {
    pub const fn new() -> Self {
        Self {
            regions: Vec::new(),
            seq: 0,
            sources: Vec::new(),
        }
    }

    /// Append one region and re-normalize the table.
    pub fn append(&mut self, region: MemRegion) {
        if region.len == 0 {
            return;
        }
        self.seq += 1;
        self.sources.push((self.seq, region));
        self.normalize();
    }

    pub fn count(&self) -> u32 {
        self.regions.len() as u32
    }

    pub fn get(&self, i: u32) -> Option<MemRegion> {
        self.regions.get(i as usize).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemRegion> + '_ {
        self.regions.iter()
    }

    /// Rebuild the normalized view from the source entries.
    ///
    /// Sweep over every boundary point; each elementary interval takes the
    /// kind and extras of the covering source with the highest rank,
    /// latest-appended among equals. Adjacent intervals that agree are
    /// merged back together.
    fn normalize(&mut self) {
        let mut bounds: Vec<u64> = Vec::with_capacity(self.sources.len() * 2);
        for (_, r) in &self.sources {
            bounds.push(r.addr);
            bounds.push(r.end());
        }
        bounds.sort_unstable();
        bounds.dedup();

        let mut out: Vec<MemRegion> = Vec::new();

        for w in bounds.windows(2) {
            let (lo, hi) = (w[0], w[1]);
            let mut winner: Option<(u8, u64, MemRegion)> = None;

            for &(seq, r) in &self.sources {
                if r.addr <= lo && r.end() >= hi {
                    let rank = r.kind.rank();
                    let better = match winner {
                        None => true,
                        Some((wrank, wseq, _)) => rank > wrank || (rank == wrank && seq > wseq),
                    };
                    if better {
                        winner = Some((rank, seq, r));
                    }
                }
            }

            let Some((_, _, src)) = winner else { continue };

            let piece = MemRegion {
                addr: lo,
                len: hi - lo,
                kind: src.kind,
                extra: src.extra,
            };

            match out.last_mut() {
                Some(prev)
                    if prev.end() == piece.addr
                        && prev.kind == piece.kind
                        && prev.extra == piece.extra =>
                {
                    prev.len += piece.len;
                }
                _ => out.push(piece),
            }
        }

        self.regions = out;
    }

    /// Arch pass run before the loader map is appended: keep the first
    /// 64 KiB reserved, and insert a synthetic "available" low-1-MiB region
    /// so ACPI can reach low memory that the firmware map omits. The real
    /// map overrides it wherever the two disagree.
    pub fn add_initial_regions(&mut self) {
        self.append(MemRegion {
            addr: 0,
            len: 64 * 1024,
            kind: MemRegionKind::Reserved,
            extra: MemRegionExtra::LOWMEM,
        });
        self.append(MemRegion {
            addr: 0,
            len: 1024 * 1024,
            kind: MemRegionKind::Available,
            extra: MemRegionExtra::LOWMEM,
        });
    }

    /// Collapse the source list to the current normalized view. Later
    /// appends can still override, but split history is dropped.
    fn collapse_sources(&mut self) {
        self.sources.clear();
        for r in self.regions.iter().copied() {
            self.seq += 1;
            self.sources.push((self.seq, r));
        }
    }

    /// Arch pass run last: carve the legacy DMA window (at most [`MAX_DMA`]
    /// bytes) out of available memory in the first 16 MiB. The host region
    /// shrinks; the carved part is re-appended tagged `DMA`, so no byte is
    /// accounted twice.
    pub fn add_final_regions(&mut self) {
        // Work on the normalized entries: a raw source may be partially
        // overridden by a reserved region and must not donate those bytes.
        self.collapse_sources();

        let mut tot_dma: u64 = 0;
        let mut carved: Vec<MemRegion> = Vec::new();

        for (_, r) in self.sources.iter_mut() {
            if r.kind != MemRegionKind::Available || !r.extra.is_empty() || r.addr > DMA_LIMIT {
                continue;
            }
            if tot_dma >= MAX_DMA {
                break;
            }

            let dma_len = (DMA_LIMIT - r.addr).min(MAX_DMA - tot_dma).min(r.len);
            if dma_len == 0 {
                continue;
            }

            carved.push(MemRegion {
                addr: r.addr,
                len: dma_len,
                kind: MemRegionKind::Available,
                extra: MemRegionExtra::DMA,
            });

            r.addr += dma_len;
            r.len -= dma_len;
            tot_dma += dma_len;
        }

        for c in carved {
            self.append(c);
        }
        self.normalize();
    }

    /// Canonical text report of the table.
    pub fn write_dump(&self, w: &mut dyn Write) -> fmt::Result {
        writeln!(w, "Memory regions ({}):", self.regions.len())?;
        for (i, r) in self.regions.iter().enumerate() {
            writeln!(
                w,
                "  [{:2}] {:#012x} - {:#012x} ({:8} KB) {:12} {}{}",
                i,
                r.addr,
                r.end(),
                r.len / 1024,
                r.kind.name(),
                if r.extra.contains(MemRegionExtra::LOWMEM) { "lowmem " } else { "" },
                if r.extra.contains(MemRegionExtra::DMA) { "dma" } else { "" },
            )?;
        }
        Ok(())
    }

    /// Print the report to the kernel console.
    pub fn dump(&self) {
        struct Sink;
        impl Write for Sink {
            fn write_str(&mut self, s: &str) -> fmt::Result {
                crate::kprint!("{}", s);
                Ok(())
            }
        }
        let _ = self.write_dump(&mut Sink);
    }
}

impl Default for MemRegionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The system-wide table. Mutated only during boot.
pub static MEM_REGIONS: Mutex<MemRegionTable> = Mutex::new(MemRegionTable::new());

#[cfg(test)]
mod tests {
    use super::*;

    fn avail(addr: u64, len: u64) -> MemRegion {
        MemRegion {
            addr,
            len,
            kind: MemRegionKind::Available,
            extra: MemRegionExtra::empty(),
        }
    }

    fn reserved(addr: u64, len: u64) -> MemRegion {
        MemRegion {
            addr,
            len,
            kind: MemRegionKind::Reserved,
            extra: MemRegionExtra::empty(),
        }
    }

    fn assert_sorted_non_overlapping(t: &MemRegionTable) {
        for w in t.regions.windows(2) {
            assert!(w[0].addr < w[1].addr);
            assert!(w[0].end() <= w[1].addr);
        }
    }

    #[test]
    fn test_reserved_beats_available() {
        let mut t = MemRegionTable::new();
        t.append(avail(0, 0x100000));
        t.append(reserved(0x40000, 0x10000));

        assert_sorted_non_overlapping(&t);
        assert_eq!(t.count(), 3);
        assert_eq!(t.get(0).unwrap().kind, MemRegionKind::Available);
        assert_eq!(t.get(1).unwrap(), reserved(0x40000, 0x10000));
        assert_eq!(t.get(2).unwrap().kind, MemRegionKind::Available);
        assert_eq!(t.get(2).unwrap().addr, 0x50000);
    }

    #[test]
    fn test_initial_regions_low_64k_reserved() {
        let mut t = MemRegionTable::new();
        t.add_initial_regions();
        // Firmware then reports the usual low range as available.
        t.append(avail(0, 0x9FC00));

        assert_sorted_non_overlapping(&t);
        // First 64 KiB must still be reserved.
        let first = t.get(0).unwrap();
        assert_eq!(first.addr, 0);
        assert_eq!(first.len, 64 * 1024);
        assert_eq!(first.kind, MemRegionKind::Reserved);
    }

    #[test]
    fn test_dma_carve_budget_and_shrink() {
        let mut t = MemRegionTable::new();
        t.append(avail(0x100000, 32 * 1024 * 1024));
        t.append(avail(0x4000_0000, 16 * 1024 * 1024)); // above 16 MiB: untouched
        t.add_final_regions();

        assert_sorted_non_overlapping(&t);

        let dma_bytes: u64 = t
            .iter()
            .filter(|r| r.extra.contains(MemRegionExtra::DMA))
            .map(|r| r.len)
            .sum();
        assert_eq!(dma_bytes, MAX_DMA);

        // The carve shrank the host rather than duplicating it: total
        // available bytes (dma included) are unchanged.
        let avail_bytes: u64 = t
            .iter()
            .filter(|r| r.kind == MemRegionKind::Available)
            .map(|r| r.len)
            .sum();
        assert_eq!(avail_bytes, (32 + 16) * 1024 * 1024);

        // And the window sits entirely in the first 16 MiB.
        for r in t.iter().filter(|r| r.extra.contains(MemRegionExtra::DMA)) {
            assert!(r.end() <= DMA_LIMIT);
        }
    }

    #[test]
    fn test_dma_carve_ignores_tagged_regions_on_second_pass() {
        let mut t = MemRegionTable::new();
        t.append(avail(0x100000, 8 * 1024 * 1024));
        t.add_final_regions();
        t.add_final_regions();

        let dma_bytes: u64 = t
            .iter()
            .filter(|r| r.extra.contains(MemRegionExtra::DMA))
            .map(|r| r.len)
            .sum();
        assert_eq!(dma_bytes, MAX_DMA);
    }

    #[test]
    fn test_dump_is_stable() {
        let mut t = MemRegionTable::new();
        t.append(avail(0, 0x100000));
        t.append(reserved(0x9F000, 0x61000));

        let mut s = alloc::string::String::new();
        t.write_dump(&mut s).unwrap();
        assert!(s.contains("available"));
        assert!(s.contains("reserved"));
        assert!(s.starts_with("Memory regions"));
    }
}
