//! x86_64 boot state: GDT, identity page tables and frequency detection.

use std::fs;

use raw_cpuid::{CpuId, CpuIdReaderNative};
use x86_64::{
	PhysAddr,
	structures::paging::{PageTable, PageTableFlags},
};

use super::FrequencyDetectionFailed;
use crate::consts::*;

pub const ELF_HOST_ARCH: u16 = goblin::elf::header::EM_X86_64;

// Constructor for a conventional segment GDT (or LDT) entry
pub fn create_gdt_entry(flags: u64, base: u64, limit: u64) -> u64 {
	((base & 0xff000000u64) << (56 - 24))
		| ((flags & 0x0000f0ffu64) << 40)
		| ((limit & 0x000f0000u64) << (48 - 16))
		| ((base & 0x00ffffffu64) << 16)
		| (limit & 0x0000ffffu64)
}

/// Creates the boot GDT and the identity page tables in guest memory.
///
/// The tables live at the fixed offsets [`BOOT_GDT`], [`BOOT_PML4`],
/// [`BOOT_PDPTE`] and [`BOOT_PDE`]. `mem` must span at least
/// [`MIN_PHYSMEM_SIZE`] zeroed bytes; a single PDE page identity-maps the
/// first [`BOOT_IDENTITY_MAP_SIZE`] bytes with 2 MiB entries, which is all
/// the kernel needs until it builds its own tables.
pub fn initialize_pagetables(mem: &mut [u8]) {
	assert!(mem.len() >= MIN_PHYSMEM_SIZE);
	let mem_addr = std::ptr::addr_of_mut!(mem[0]);

	let (gdt_entry, pml4, pdpte, pde);
	// Safety:
	// We only operate in `mem`, which is plain bytes and we have ownership of
	// these and it is asserted to be large enough.
	unsafe {
		gdt_entry = mem_addr
			.add(BOOT_GDT as usize)
			.cast::<[u64; BOOT_GDT_MAX]>()
			.as_mut()
			.unwrap();

		pml4 = mem_addr
			.add(BOOT_PML4 as usize)
			.cast::<PageTable>()
			.as_mut()
			.unwrap();
		pdpte = mem_addr
			.add(BOOT_PDPTE as usize)
			.cast::<PageTable>()
			.as_mut()
			.unwrap();
		pde = mem_addr
			.add(BOOT_PDE as usize)
			.cast::<PageTable>()
			.as_mut()
			.unwrap();
	}

	// initialize GDT
	gdt_entry[BOOT_GDT_NULL] = 0;
	gdt_entry[BOOT_GDT_CODE] = create_gdt_entry(0xA09B, 0, 0xFFFFF);
	gdt_entry[BOOT_GDT_DATA] = create_gdt_entry(0xC093, 0, 0xFFFFF);

	let table_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
	pml4[0].set_addr(PhysAddr::new(BOOT_PDPTE), table_flags);
	// Slot 511 maps the tables onto themselves.
	pml4[511].set_addr(PhysAddr::new(BOOT_PML4), table_flags);
	pdpte[0].set_addr(PhysAddr::new(BOOT_PDE), table_flags);

	for i in 0..(BOOT_IDENTITY_MAP_SIZE / GUEST_PAGE_SIZE) as usize {
		pde[i].set_addr(
			PhysAddr::new(i as u64 * GUEST_PAGE_SIZE),
			table_flags | PageTableFlags::HUGE_PAGE,
		);
	}
}

pub fn detect_freq_from_cpuid(
	cpuid: &CpuId<CpuIdReaderNative>,
) -> Result<u32, FrequencyDetectionFailed> {
	let mhz = cpuid
		.get_processor_frequency_info()
		.map(|info| info.processor_base_frequency())
		.ok_or(FrequencyDetectionFailed)?;
	if mhz > 0 {
		Ok(u32::from(mhz))
	} else {
		Err(FrequencyDetectionFailed)
	}
}

pub fn detect_freq_from_cpuid_hypervisor_info(
	cpuid: &CpuId<CpuIdReaderNative>,
) -> Result<u32, FrequencyDetectionFailed> {
	let khz = cpuid
		.get_hypervisor_info()
		.and_then(|info| info.tsc_frequency())
		.ok_or(FrequencyDetectionFailed)?;
	let mhz = khz / 1000;
	if mhz > 0 {
		Ok(mhz)
	} else {
		Err(FrequencyDetectionFailed)
	}
}

pub fn get_cpu_frequency_from_os() -> Result<u32, FrequencyDetectionFailed> {
	let cpuinfo = fs::read_to_string("/proc/cpuinfo").map_err(|_| FrequencyDetectionFailed)?;
	cpuinfo
		.lines()
		.find(|line| line.starts_with("cpu MHz"))
		.and_then(|line| line.split(':').nth(1))
		.and_then(|mhz| mhz.trim().parse::<f64>().ok())
		.map(|mhz| mhz as u32)
		.filter(|mhz| *mhz > 0)
		.ok_or(FrequencyDetectionFailed)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mem::MmapMemory;

	#[test]
	fn test_gdt_entry_encoding() {
		assert_eq!(create_gdt_entry(0, 0, 0), 0);
		assert_eq!(create_gdt_entry(0xA09B, 0, 0xFFFFF), 0xAF9B000000FFFF);
		assert_eq!(create_gdt_entry(0xC093, 0, 0xFFFFF), 0xCF93000000FFFF);
	}

	#[test]
	fn test_pagetable_initialization() {
		let mem = MmapMemory::new(0, MIN_PHYSMEM_SIZE * 2, false, false);
		initialize_pagetables(unsafe { mem.as_slice_mut() });

		let gdt_results = [0x0, 0xAF9B000000FFFF, 0xCF93000000FFFF];
		for (i, expected) in gdt_results.iter().enumerate() {
			let entry = u64::from_le_bytes(unsafe {
				mem.slice_at(BOOT_GDT + 8 * i as u64, 8)
					.unwrap()
					.try_into()
					.unwrap()
			});
			assert_eq!(*expected, entry);
		}

		let pml4 = unsafe { mem.get_ref_mut::<PageTable>(BOOT_PML4).unwrap() };
		assert_eq!(pml4[0].addr().as_u64(), BOOT_PDPTE);
		assert_eq!(pml4[511].addr().as_u64(), BOOT_PML4);
		assert!(
			pml4[0]
				.flags()
				.contains(PageTableFlags::PRESENT | PageTableFlags::WRITABLE)
		);

		let pdpte = unsafe { mem.get_ref_mut::<PageTable>(BOOT_PDPTE).unwrap() };
		assert_eq!(pdpte[0].addr().as_u64(), BOOT_PDE);

		let pde = unsafe { mem.get_ref_mut::<PageTable>(BOOT_PDE).unwrap() };
		let mapped = (BOOT_IDENTITY_MAP_SIZE / GUEST_PAGE_SIZE) as usize;
		for i in 0..mapped {
			assert_eq!(pde[i].addr().as_u64(), i as u64 * GUEST_PAGE_SIZE);
			assert!(pde[i].flags().contains(PageTableFlags::HUGE_PAGE));
		}
		for i in mapped..512 {
			assert!(pde[i].is_unused());
		}
	}
}
