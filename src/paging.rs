//! Walking the guest's own page tables for incremental memory dumps.

use std::io;

use x86_64::structures::paging::{PageTable, PageTableFlags};

use crate::{
	consts::{GUEST_PAGE_SIZE, PAGE_SIZE},
	mem::MmapMemory,
};

/// Bit 7 of a page-directory entry marks a 2 MiB leaf. The same bit is PAT
/// in a 4 KiB entry, so [`PageLocation`] never copies raw flag bits.
pub const PG_PSE: u64 = 1 << 7;

const PHYS_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// One record header in a `chk{i}_mem.dat` file: the page's guest-physical
/// address plus the 2 MiB-vs-4 KiB bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageLocation(u64);

impl PageLocation {
	pub fn encode(address: u64, hugepage: bool) -> Self {
		let mut raw = address & PHYS_ADDR_MASK;
		if hugepage {
			raw = (raw & !(GUEST_PAGE_SIZE - 1)) | PG_PSE;
		}
		PageLocation(raw)
	}

	pub fn from_raw(raw: u64) -> Self {
		PageLocation(raw)
	}

	pub fn as_raw(self) -> u64 {
		self.0
	}

	pub fn address(self) -> u64 {
		self.0 & PHYS_ADDR_MASK & !(PG_PSE)
	}

	pub fn is_hugepage(self) -> bool {
		self.0 & PG_PSE != 0
	}

	pub fn len(self) -> usize {
		if self.is_hugepage() {
			GUEST_PAGE_SIZE as usize
		} else {
			PAGE_SIZE
		}
	}
}

fn table_at(mem: &MmapMemory, addr: u64) -> io::Result<&mut PageTable> {
	// Safety: the tables live in guest memory and all vCPUs are paused while
	// the walk runs; the bounds check rejects corrupt table pointers.
	unsafe {
		mem.get_ref_mut::<PageTable>(addr)
			.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
	}
}

/// Walks the four-level hierarchy rooted at `pml4_addr` and emits one
/// [`PageLocation`] for every present leaf whose flags contain `flag`
/// (`ACCESSED` on a first dump, `DIRTY` afterwards).
///
/// With `clear` set, the accessed and dirty bits of emitted leaves are
/// cleared in place so the next scan only sees subsequent guest writes.
pub fn scan_page_tables(
	mem: &MmapMemory,
	pml4_addr: u64,
	flag: PageTableFlags,
	clear: bool,
	emit: &mut dyn FnMut(PageLocation) -> io::Result<()>,
) -> io::Result<()> {
	let wanted = PageTableFlags::PRESENT | flag;
	let scrubbed = PageTableFlags::ACCESSED | PageTableFlags::DIRTY;

	let pml4 = table_at(mem, pml4_addr)?;
	// Slot 511 is the recursive self-mapping; descending through it would
	// re-dump the tables themselves.
	for pml4e in pml4.iter().take(511) {
		if !pml4e.flags().contains(PageTableFlags::PRESENT) {
			continue;
		}

		let pdpt = table_at(mem, pml4e.addr().as_u64())?;
		for pdpte in pdpt.iter() {
			let flags = pdpte.flags();
			if !flags.contains(PageTableFlags::PRESENT)
				|| flags.contains(PageTableFlags::HUGE_PAGE)
			{
				// 1 GiB leaves are never created by the guests we run.
				continue;
			}

			let pd = table_at(mem, pdpte.addr().as_u64())?;
			for pde in pd.iter_mut() {
				let flags = pde.flags();
				if !flags.contains(PageTableFlags::PRESENT) {
					continue;
				}

				if flags.contains(PageTableFlags::HUGE_PAGE) {
					if flags.contains(flag) {
						if clear {
							pde.set_flags(flags - scrubbed);
						}
						emit(PageLocation::encode(pde.addr().as_u64(), true))?;
					}
					continue;
				}

				let pt = table_at(mem, pde.addr().as_u64())?;
				for pte in pt.iter_mut() {
					let flags = pte.flags();
					if flags.contains(wanted) {
						if clear {
							pte.set_flags(flags - scrubbed);
						}
						emit(PageLocation::encode(pte.addr().as_u64(), false))?;
					}
				}
			}
		}
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use x86_64::PhysAddr;

	use super::*;

	#[test]
	fn test_location_encoding() {
		let small = PageLocation::encode(0x42_3000, false);
		assert!(!small.is_hugepage());
		assert_eq!(small.address(), 0x42_3000);
		assert_eq!(small.len(), PAGE_SIZE);

		let huge = PageLocation::encode(0x20_0000, true);
		assert!(huge.is_hugepage());
		assert_eq!(huge.address(), 0x20_0000);
		assert_eq!(huge.len(), GUEST_PAGE_SIZE as usize);
	}

	#[test]
	fn test_location_strips_flag_bits() {
		// A raw entry value with PRESENT/WRITABLE/ACCESSED set must not leak
		// its flags into the stored location.
		let loc = PageLocation::encode(0x42_3000 | 0b110_0011, false);
		assert_eq!(loc.as_raw(), 0x42_3000);

		// For a 2 MiB entry, bit 12 is PAT and must not survive either.
		let huge = PageLocation::encode(0x20_0000 | (1 << 12), true);
		assert_eq!(huge.address(), 0x20_0000);
		assert_eq!(huge.as_raw(), 0x20_0000 | PG_PSE);
	}

	fn build_hierarchy(mem: &MmapMemory) {
		let pml4 = table_at(mem, 0x1000).unwrap();
		pml4[0].set_addr(
			PhysAddr::new(0x2000),
			PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
		);
		let pdpt = table_at(mem, 0x2000).unwrap();
		pdpt[0].set_addr(
			PhysAddr::new(0x3000),
			PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
		);
		let pd = table_at(mem, 0x3000).unwrap();
		// One dirty 2 MiB leaf and one page table with a single dirty entry.
		pd[1].set_addr(
			PhysAddr::new(0x20_0000),
			PageTableFlags::PRESENT
				| PageTableFlags::WRITABLE
				| PageTableFlags::HUGE_PAGE
				| PageTableFlags::ACCESSED
				| PageTableFlags::DIRTY,
		);
		pd[0].set_addr(
			PhysAddr::new(0x4000),
			PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
		);
		let pt = table_at(mem, 0x4000).unwrap();
		pt[5].set_addr(
			PhysAddr::new(0x5000),
			PageTableFlags::PRESENT
				| PageTableFlags::WRITABLE
				| PageTableFlags::ACCESSED
				| PageTableFlags::DIRTY,
		);
		pt[6].set_addr(
			PhysAddr::new(0x6000),
			PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
		);
	}

	#[test]
	fn test_scan_emits_touched_leaves() {
		let mem = MmapMemory::new(0, 0x40_0000, false, false);
		build_hierarchy(&mem);

		let mut seen = Vec::new();
		scan_page_tables(&mem, 0x1000, PageTableFlags::DIRTY, false, &mut |loc| {
			seen.push(loc);
			Ok(())
		})
		.unwrap();

		assert_eq!(
			seen,
			vec![
				PageLocation::encode(0x5000, false),
				PageLocation::encode(0x20_0000, true),
			]
		);
	}

	#[test]
	fn test_scan_clears_accessed_and_dirty() {
		let mem = MmapMemory::new(0, 0x40_0000, false, false);
		build_hierarchy(&mem);

		let mut count = 0;
		scan_page_tables(&mem, 0x1000, PageTableFlags::DIRTY, true, &mut |_| {
			count += 1;
			Ok(())
		})
		.unwrap();
		assert_eq!(count, 2);

		// The second scan must come up empty.
		scan_page_tables(&mem, 0x1000, PageTableFlags::DIRTY, false, &mut |_| {
			panic!("leaf still marked dirty");
		})
		.unwrap();
	}
}
