//! VM-level KVM plumbing: memory slots, interrupt controller, capabilities.

use std::sync::Arc;

use kvm_bindings::*;
use kvm_ioctls::{Cap, VmFd};
use log::{debug, error};
use vmm_sys_util::eventfd::EventFd;

use super::{KVM, vcpu::KvmCpu};
use crate::{
	consts::{KVM_32BIT_GAP_SIZE, KVM_32BIT_GAP_START, UHYVE_IRQ_NET},
	mem::MmapMemory,
	params::Params,
	vm::{HypervisorResult, MonitorVm, VirtualizationBackend},
};

const KVM_IDENTITY_BASE_SYNC_MMU: u64 = 0xfeffc000;
const KVM_IDENTITY_BASE_LEGACY: u64 = 0xfffbc000;

/// Host capabilities probed once at VM creation.
#[derive(Debug, Default, Clone, Copy)]
pub struct KvmCapabilities {
	pub tsc_deadline: bool,
	pub irqchip: bool,
	/// `KVM_CAP_ADJUST_CLOCK` reported a stable TSC; the guest clock can be
	/// carried across a checkpoint.
	pub adjust_clock_stable: bool,
	pub irqfd: bool,
	pub readonly_mem: bool,
	pub sync_mmu: bool,
}

/// A registered guest memory slot.
#[derive(Debug, Clone, Copy)]
pub struct MemorySlot {
	pub id: u32,
	pub guest_addr: u64,
	pub size: usize,
}

pub struct KvmVm {
	pub vm: VmFd,
	pub caps: KvmCapabilities,
	pub slots: Vec<MemorySlot>,
	/// Signalled to raise the network interrupt line in the guest.
	pub net_evtfd: Option<EventFd>,
}

impl KvmVm {
	fn probe_capabilities() -> KvmCapabilities {
		KvmCapabilities {
			tsc_deadline: KVM.check_extension(Cap::TscDeadlineTimer),
			irqchip: KVM.check_extension(Cap::Irqchip),
			adjust_clock_stable: KVM.check_extension_int(Cap::AdjustClock)
				== KVM_CLOCK_TSC_STABLE as i32,
			irqfd: KVM.check_extension(Cap::Irqfd),
			readonly_mem: KVM.check_extension(Cap::ReadonlyMem),
			sync_mmu: KVM.check_extension(Cap::SyncMmu),
		}
	}

	/// Registers `mem` with KVM. Guests that cross the 32-bit gap get two
	/// slots; the hole in between stays unmapped so stray accesses fault.
	fn register_memory(
		vm: &VmFd,
		mem: &MmapMemory,
		dirty_log: bool,
	) -> HypervisorResult<Vec<MemorySlot>> {
		let flags = if dirty_log {
			KVM_MEM_LOG_DIRTY_PAGES
		} else {
			mem.flags
		};
		let mut slots = Vec::new();

		let first_size = mem.memory_size.min(KVM_32BIT_GAP_START);
		let first = kvm_userspace_memory_region {
			slot: 0,
			flags,
			memory_size: first_size as u64,
			guest_phys_addr: 0,
			userspace_addr: mem.host_address as u64,
		};
		unsafe { vm.set_user_memory_region(first) }?;
		slots.push(MemorySlot {
			id: 0,
			guest_addr: 0,
			size: first_size,
		});

		if mem.has_gap() {
			let offset = (KVM_32BIT_GAP_START + KVM_32BIT_GAP_SIZE) as u64;
			let second = kvm_userspace_memory_region {
				slot: 1,
				flags,
				memory_size: mem.memory_size as u64 - offset,
				guest_phys_addr: offset,
				userspace_addr: mem.host_address as u64 + offset,
			};
			unsafe { vm.set_user_memory_region(second) }?;
			slots.push(MemorySlot {
				id: 1,
				guest_addr: offset,
				size: mem.memory_size - offset as usize,
			});
		}

		Ok(slots)
	}

	fn init_irqchip(vm: &VmFd, caps: &KvmCapabilities) -> HypervisorResult<()> {
		// The identity map and the TSS pages sit right below the IOAPIC.
		let identity_base = if caps.sync_mmu {
			KVM_IDENTITY_BASE_SYNC_MMU
		} else {
			KVM_IDENTITY_BASE_LEGACY
		};
		vm.set_identity_map_address(identity_base)?;
		vm.set_tss_address(identity_base as usize + 0x1000)?;

		debug!("Initialize interrupt controller");
		vm.create_irq_chip()?;

		// Route IOAPIC pin n to vector 0x20+n; pin 2 (the PIC cascade) stays
		// masked.
		let mut chip = kvm_irqchip {
			chip_id: KVM_IRQCHIP_IOAPIC,
			..Default::default()
		};
		vm.get_irqchip(&mut chip)?;
		for i in 0..KVM_IOAPIC_NUM_PINS as usize {
			unsafe {
				let entry = &mut chip.chip.ioapic.redirtbl[i];
				entry.fields.vector = 0x20 + i as u8;
				entry.fields._bitfield_1 =
					kvm_ioapic_state__bindgen_ty_1__bindgen_ty_1::new_bitfield_1(
						0,                             // delivery_mode
						0,                             // dest_mode
						0,                             // delivery_status
						0,                             // polarity
						0,                             // remote_irr
						0,                             // trig_mode
						if i != 2 { 0 } else { 1 },    // mask
						0,                             // reserve
					);
				entry.fields.dest_id = 0;
			}
		}
		vm.set_irqchip(&chip)?;

		// 32-bit APIC ids without the broadcast quirk.
		let mut cap = kvm_enable_cap {
			cap: KVM_CAP_X2APIC_API,
			..Default::default()
		};
		cap.args[0] = u64::from(KVM_X2APIC_API_USE_32BIT_IDS | KVM_X2APIC_API_DISABLE_BROADCAST_QUIRK);
		vm.enable_cap(&cap)?;

		Ok(())
	}
}

impl VirtualizationBackend for KvmVm {
	type VCPU = KvmCpu;
	const NAME: &str = "KvmVm";

	fn new(mem: &MmapMemory, params: &Params, dirty_log: bool) -> HypervisorResult<Self> {
		let vm = KVM.create_vm()?;
		let caps = Self::probe_capabilities();
		debug!("KVM capabilities: {caps:?}");

		if !caps.irqfd {
			error!("The support of KVM_CAP_IRQFD is required");
			return Err(super::HypervisorError::new(libc::ENOSYS));
		}

		let slots = Self::register_memory(&vm, mem, dirty_log)?;
		Self::init_irqchip(&vm, &caps)?;

		let net_evtfd = if params.netif.is_some() {
			let evtfd = EventFd::new(0).map_err(|_| super::HypervisorError::last())?;
			vm.register_irqfd(&evtfd, UHYVE_IRQ_NET)?;
			Some(evtfd)
		} else {
			None
		};

		Ok(Self {
			vm,
			caps,
			slots,
			net_evtfd,
		})
	}

	fn new_cpu(&self, id: u32, parent_vm: Arc<MonitorVm<Self>>) -> HypervisorResult<KvmCpu> {
		KvmCpu::new(id, self.vm.create_vcpu(u64::from(id))?, parent_vm)
	}

	fn restore_clock(&self, clock: &kvm_clock_data) -> HypervisorResult<()> {
		if !self.caps.adjust_clock_stable {
			// Nothing to carry over on hosts without a stable TSC.
			return Ok(());
		}
		self.vm.set_clock(clock)
	}

	fn notify_net_interrupt(&self) {
		if let Some(evtfd) = &self.net_evtfd {
			evtfd.write(1).expect("unable to trigger interrupt");
		}
	}
}
