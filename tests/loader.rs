//! End-to-end loader checks against synthetic classic-Hermit images.

use std::net::Ipv4Addr;

use minihyvelib::{
	mem::MmapMemory,
	params::Params,
	vm::{LoadKernelError, place_kernel},
};

const ELFCLASS64: u8 = 2;
const HERMIT_OSABI: u8 = 0x42;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const EM_X86_64: u16 = 62;

struct Segment {
	paddr: u64,
	data: Vec<u8>,
	memsz: u64,
}

/// Assembles a minimal ELF64 image: header, program headers, segment bytes.
fn build_elf(class: u8, osabi: u8, e_type: u16, machine: u16, entry: u64, segments: &[Segment]) -> Vec<u8> {
	let phoff = 64usize;
	let mut data_offset = phoff + 56 * segments.len();
	let mut out = vec![0u8; data_offset];

	out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
	out[4] = class;
	out[5] = 1; // little endian
	out[6] = 1; // EV_CURRENT
	out[7] = osabi;
	out[16..18].copy_from_slice(&e_type.to_le_bytes());
	out[18..20].copy_from_slice(&machine.to_le_bytes());
	out[20..24].copy_from_slice(&1u32.to_le_bytes());
	out[24..32].copy_from_slice(&entry.to_le_bytes());
	out[32..40].copy_from_slice(&(phoff as u64).to_le_bytes());
	out[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
	out[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
	out[56..58].copy_from_slice(&(segments.len() as u16).to_le_bytes());

	for (i, segment) in segments.iter().enumerate() {
		let ph = phoff + 56 * i;
		out[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
		out[ph + 4..ph + 8].copy_from_slice(&7u32.to_le_bytes()); // rwx
		out[ph + 8..ph + 16].copy_from_slice(&(data_offset as u64).to_le_bytes());
		out[ph + 16..ph + 24].copy_from_slice(&segment.paddr.to_le_bytes());
		out[ph + 24..ph + 32].copy_from_slice(&segment.paddr.to_le_bytes());
		out[ph + 32..ph + 40].copy_from_slice(&(segment.data.len() as u64).to_le_bytes());
		out[ph + 40..ph + 48].copy_from_slice(&segment.memsz.to_le_bytes());
		out[ph + 48..ph + 56].copy_from_slice(&0x1000u64.to_le_bytes());
		data_offset += segment.data.len();
	}
	for segment in segments {
		out.extend_from_slice(&segment.data);
	}

	out
}

fn hermit_image(segments: &[Segment]) -> Vec<u8> {
	build_elf(ELFCLASS64, HERMIT_OSABI, ET_EXEC, EM_X86_64, 0x80_0000, segments)
}

fn demo_segments() -> Vec<Segment> {
	let first: Vec<u8> = (0..0x200u32).map(|i| i as u8).collect();
	let second = b"the second loadable segment".to_vec();
	let second_memsz = second.len() as u64 + 0x100;
	vec![
		Segment {
			paddr: 0x80_0000,
			data: first,
			memsz: 0x1000,
		},
		Segment {
			paddr: 0x80_2000,
			data: second,
			memsz: second_memsz,
		},
	]
}

fn read_u32(mem: &MmapMemory, addr: u64) -> u32 {
	u32::from_le_bytes(unsafe { mem.slice_at(addr, 4).unwrap().try_into().unwrap() })
}

fn read_u64(mem: &MmapMemory, addr: u64) -> u64 {
	u64::from_le_bytes(unsafe { mem.slice_at(addr, 8).unwrap().try_into().unwrap() })
}

#[test]
fn test_segments_are_placed_verbatim() {
	let mem = MmapMemory::new(0, 0x200_0000, false, false);
	let image = hermit_image(&demo_segments());
	let params = Params::default();

	let loaded = place_kernel(&mem, &image, &params, 2400).unwrap();
	assert_eq!(loaded.entry_point, 0x80_0000);
	assert_eq!(loaded.kernel_address, 0x80_0000);

	// The boot-info block overwrites the head of the first segment; the
	// bytes behind it must match the file.
	let first = demo_segments().remove(0);
	let placed = unsafe { mem.slice_at(0x80_0000 + 0xc4, 0x200 - 0xc4).unwrap() };
	assert_eq!(placed, &first.data[0xc4..]);

	// The second segment survives untouched.
	let second = b"the second loadable segment";
	let placed = unsafe { mem.slice_at(0x80_2000, second.len()).unwrap() };
	assert_eq!(placed, second);

	// The `memsz - filesz` tail is zero-initialized.
	let bss = unsafe { mem.slice_at(0x80_0200, 0x1000 - 0x200).unwrap() };
	assert!(bss.iter().all(|b| *b == 0));
}

#[test]
fn test_boot_info_block_is_published() {
	let mem = MmapMemory::new(0, 0x200_0000, false, false);
	let image = hermit_image(&demo_segments());
	let mut params = Params::default();
	params.cpu_count = 4.try_into().unwrap();
	params.ip = Some(Ipv4Addr::new(10, 0, 5, 2));
	params.mask = Some(Ipv4Addr::new(255, 255, 255, 0));

	let loaded = place_kernel(&mem, &image, &params, 2400).unwrap();
	let base = loaded.kernel_address;

	assert_eq!(read_u64(&mem, base + 0x08), base);
	assert_eq!(read_u64(&mem, base + 0x10), 0x200_0000);
	assert_eq!(read_u32(&mem, base + 0x18), 2400);
	assert_eq!(read_u32(&mem, base + 0x20), 0, "boot barrier starts at zero");
	assert_eq!(read_u32(&mem, base + 0x24), 4);
	assert_eq!(read_u32(&mem, base + 0x60), 1);
	assert_eq!(read_u32(&mem, base + 0x94), 1);
	let expected_size = 0x1000 + b"the second loadable segment".len() as u64 + 0x100;
	assert_eq!(read_u64(&mem, base + 0x38), expected_size);
	assert_eq!(loaded.image_size, expected_size);
	assert_eq!(
		unsafe { mem.slice_at(base + 0xb0, 4).unwrap() },
		&[10, 0, 5, 2]
	);
	assert_eq!(
		unsafe { mem.slice_at(base + 0xb8, 4).unwrap() },
		&[255, 255, 255, 0]
	);
	assert_eq!(read_u64(&mem, base + 0xbc), mem.host_address as u64);
}

#[test]
fn test_rejects_foreign_images() {
	let mem = MmapMemory::new(0, 0x200_0000, false, false);
	let params = Params::default();

	let wrong_abi = build_elf(ELFCLASS64, 0, ET_EXEC, EM_X86_64, 0x80_0000, &demo_segments());
	assert!(matches!(
		place_kernel(&mem, &wrong_abi, &params, 0),
		Err(LoadKernelError::InvalidKernel)
	));

	let shared_object = build_elf(
		ELFCLASS64,
		HERMIT_OSABI,
		ET_DYN,
		EM_X86_64,
		0x80_0000,
		&demo_segments(),
	);
	assert!(matches!(
		place_kernel(&mem, &shared_object, &params, 0),
		Err(LoadKernelError::InvalidKernel)
	));

	let foreign_machine = build_elf(
		ELFCLASS64,
		HERMIT_OSABI,
		ET_EXEC,
		183, // EM_AARCH64
		0x80_0000,
		&demo_segments(),
	);
	assert!(matches!(
		place_kernel(&mem, &foreign_machine, &params, 0),
		Err(LoadKernelError::InvalidKernel)
	));

	let low_entry = build_elf(
		ELFCLASS64,
		HERMIT_OSABI,
		ET_EXEC,
		EM_X86_64,
		0x8000,
		&demo_segments(),
	);
	assert!(matches!(
		place_kernel(&mem, &low_entry, &params, 0),
		Err(LoadKernelError::InvalidKernel)
	));

	let mut flipped_class = hermit_image(&demo_segments());
	flipped_class[4] = 1; // ELFCLASS32
	assert!(matches!(
		place_kernel(&mem, &flipped_class, &params, 0),
		Err(LoadKernelError::InvalidKernel)
	));
}

#[test]
fn test_rejects_image_larger_than_guest_memory() {
	let mem = MmapMemory::new(0, 0x20_0000, false, false);
	let image = hermit_image(&demo_segments());
	let params = Params::default();

	// Both segments sit at 8 MiB, far beyond the 2 MiB guest.
	assert!(matches!(
		place_kernel(&mem, &image, &params, 0),
		Err(LoadKernelError::InsufficientMemory)
	));
}

#[test]
fn test_rejects_truncated_image() {
	let mem = MmapMemory::new(0, 0x200_0000, false, false);
	let mut image = hermit_image(&demo_segments());
	image.truncate(image.len() - 8);
	let params = Params::default();

	assert!(matches!(
		place_kernel(&mem, &image, &params, 0),
		Err(LoadKernelError::InvalidKernel)
	));
}
