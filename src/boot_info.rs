//! The boot-info block the guest reads at entry.
//!
//! The block lives at the start of the first loaded ELF segment. Its field
//! offsets are a published ABI; [`BootInfoLayout`] mirrors them and the tests
//! below pin every offset. The loader writes the fields exactly once, before
//! any vCPU is dispatched; afterwards only `boot_barrier` and `current_cpu`
//! change, driven by the application processors.

use std::{mem::offset_of, ptr};

/// Field layout of the block. Never instantiated; the monitor reads and
/// writes single fields through [`BootInfoView`] so the kernel bytes between
/// the published offsets stay untouched.
#[repr(C, packed)]
pub struct BootInfoLayout {
	_reserved0: [u8; 8],
	/// Physical address of the kernel image.
	pub base: u64,
	/// Total guest memory size.
	pub limit: u64,
	/// Host-derived CPU frequency in MHz.
	pub cpu_freq: u32,
	_reserved1: u32,
	/// Incremented by each application processor as it finishes its init.
	pub boot_barrier: u32,
	/// Configured vCPU count.
	pub possible_cpus: u32,
	_reserved2: [u8; 8],
	/// Slot an application processor writes to claim startup.
	pub current_cpu: u32,
	_reserved3: u32,
	/// Accumulated `memsz` of all LOAD segments.
	pub image_size: u64,
	_reserved4: [u8; 0x20],
	pub numa_nodes: u32,
	_reserved5: [u8; 0x30],
	/// `1` announces that the kernel runs under this monitor.
	pub hypervisor_tag: u32,
	/// I/O port for single-byte console output, `0` if not announced.
	pub uart_port: u64,
	_reserved6: [u8; 0x10],
	pub ip: [u8; 4],
	pub gateway: [u8; 4],
	pub mask: [u8; 4],
	/// Host virtual base of guest memory, for debugging from the guest side.
	pub host_mem_base: u64,
}

/// Accessor for a boot-info block inside guest memory.
///
/// All stores go through unaligned raw-pointer writes: the block starts at
/// the (page-aligned) first segment, but `host_mem_base` sits at `0xBC` and
/// is not naturally aligned.
#[derive(Clone, Copy, Debug)]
pub struct BootInfoView {
	base: *mut u8,
}

macro_rules! field_ptr {
	($self:ident, $field:ident) => {
		$self
			.base
			.add(offset_of!(BootInfoLayout, $field))
			.cast()
	};
}

impl BootInfoView {
	/// # Safety
	///
	/// `base` must point at the start of the first loaded segment inside the
	/// guest mapping, with at least `size_of::<BootInfoLayout>()` accessible
	/// bytes behind it.
	pub unsafe fn new(base: *mut u8) -> Self {
		Self { base }
	}

	pub fn set_base(&self, paddr: u64) {
		unsafe { ptr::write_unaligned::<u64>(field_ptr!(self, base), paddr) }
	}

	pub fn set_limit(&self, limit: u64) {
		unsafe { ptr::write_unaligned::<u64>(field_ptr!(self, limit), limit) }
	}

	pub fn set_cpu_freq(&self, mhz: u32) {
		unsafe { ptr::write_unaligned::<u32>(field_ptr!(self, cpu_freq), mhz) }
	}

	pub fn set_possible_cpus(&self, cpus: u32) {
		unsafe { ptr::write_unaligned::<u32>(field_ptr!(self, possible_cpus), cpus) }
	}

	pub fn possible_cpus(&self) -> u32 {
		unsafe { ptr::read_unaligned::<u32>(field_ptr!(self, possible_cpus)) }
	}

	/// Volatile: the guest increments this field while the host spins on it.
	pub fn boot_barrier(&self) -> u32 {
		unsafe { ptr::read_volatile::<u32>(field_ptr!(self, boot_barrier)) }
	}

	/// Volatile: the guest polls this slot during application-processor boot.
	pub fn set_current_cpu(&self, id: u32) {
		unsafe { ptr::write_volatile::<u32>(field_ptr!(self, current_cpu), id) }
	}

	pub fn set_image_size(&self, size: u64) {
		unsafe { ptr::write_unaligned::<u64>(field_ptr!(self, image_size), size) }
	}

	pub fn image_size(&self) -> u64 {
		unsafe { ptr::read_unaligned::<u64>(field_ptr!(self, image_size)) }
	}

	pub fn set_numa_nodes(&self, nodes: u32) {
		unsafe { ptr::write_unaligned::<u32>(field_ptr!(self, numa_nodes), nodes) }
	}

	pub fn set_hypervisor_tag(&self, tag: u32) {
		unsafe { ptr::write_unaligned::<u32>(field_ptr!(self, hypervisor_tag), tag) }
	}

	pub fn hypervisor_tag(&self) -> u32 {
		unsafe { ptr::read_unaligned::<u32>(field_ptr!(self, hypervisor_tag)) }
	}

	pub fn set_uart_port(&self, port: u64) {
		unsafe { ptr::write_unaligned::<u64>(field_ptr!(self, uart_port), port) }
	}

	pub fn set_ip(&self, octets: [u8; 4]) {
		unsafe { ptr::write_unaligned::<[u8; 4]>(field_ptr!(self, ip), octets) }
	}

	pub fn set_gateway(&self, octets: [u8; 4]) {
		unsafe { ptr::write_unaligned::<[u8; 4]>(field_ptr!(self, gateway), octets) }
	}

	pub fn set_mask(&self, octets: [u8; 4]) {
		unsafe { ptr::write_unaligned::<[u8; 4]>(field_ptr!(self, mask), octets) }
	}

	pub fn set_host_mem_base(&self, base: u64) {
		unsafe { ptr::write_unaligned::<u64>(field_ptr!(self, host_mem_base), base) }
	}
}

// The view is handed to every vCPU thread; the underlying block is plain
// guest memory.
unsafe impl Send for BootInfoView {}
unsafe impl Sync for BootInfoView {}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_published_offsets() {
		assert_eq!(offset_of!(BootInfoLayout, base), 0x08);
		assert_eq!(offset_of!(BootInfoLayout, limit), 0x10);
		assert_eq!(offset_of!(BootInfoLayout, cpu_freq), 0x18);
		assert_eq!(offset_of!(BootInfoLayout, boot_barrier), 0x20);
		assert_eq!(offset_of!(BootInfoLayout, possible_cpus), 0x24);
		assert_eq!(offset_of!(BootInfoLayout, current_cpu), 0x30);
		assert_eq!(offset_of!(BootInfoLayout, image_size), 0x38);
		assert_eq!(offset_of!(BootInfoLayout, numa_nodes), 0x60);
		assert_eq!(offset_of!(BootInfoLayout, hypervisor_tag), 0x94);
		assert_eq!(offset_of!(BootInfoLayout, uart_port), 0x98);
		assert_eq!(offset_of!(BootInfoLayout, ip), 0xb0);
		assert_eq!(offset_of!(BootInfoLayout, gateway), 0xb4);
		assert_eq!(offset_of!(BootInfoLayout, mask), 0xb8);
		assert_eq!(offset_of!(BootInfoLayout, host_mem_base), 0xbc);
	}

	#[test]
	fn test_view_roundtrip() {
		let mut block = [0u8; 0x100];
		let view = unsafe { BootInfoView::new(block.as_mut_ptr()) };

		view.set_base(0x80_0000);
		view.set_limit(64 * 1024 * 1024);
		view.set_cpu_freq(2400);
		view.set_possible_cpus(4);
		view.set_image_size(0x4_2000);
		view.set_hypervisor_tag(1);
		view.set_ip([10, 0, 5, 2]);
		view.set_host_mem_base(0xdead_beef);

		assert_eq!(view.possible_cpus(), 4);
		assert_eq!(view.image_size(), 0x4_2000);
		assert_eq!(view.hypervisor_tag(), 1);
		assert_eq!(&block[0xb0..0xb4], &[10, 0, 5, 2]);
		assert_eq!(block[0x18], 0x60); // 2400 = 0x960, little endian
		assert_eq!(block[0x19], 0x09);
		assert_eq!(view.boot_barrier(), 0);
	}
}
