//! vCPU construction, the exit loop and checkpoint state transfer.

use std::{
	fs::File,
	io::{Read, Write},
	sync::Arc,
};

use kvm_bindings::*;
use kvm_ioctls::{VcpuExit, VcpuFd};
use log::{debug, error};
use x86_64::registers::control::{Cr0Flags, Cr4Flags};

use super::KvmVm;
use crate::{
	checkpoint::{
		self, CheckpointConfig, SnapshotCoordinator, any_as_u8_mut_slice, any_as_u8_slice,
	},
	consts::*,
	hypercall,
	vcpu::{VcpuStopReason, VirtualCPU},
	vm::{HypervisorResult, MonitorVm},
};

/// CPUID leaf 1 ECX: a hypervisor is present.
const CPUID_HYPERVISOR: u32 = 1 << 31;
/// CPUID leaf 1 ECX: TSC deadline timer.
const CPUID_TSC_DEADLINE: u32 = 1 << 24;
/// CPUID leaf 1 EDX: MSR support.
const CPUID_ENABLE_MSR: u32 = 1 << 5;

mod msr {
	pub const IA32_SYSENTER_CS: u32 = 0x174;
	pub const IA32_SYSENTER_ESP: u32 = 0x175;
	pub const IA32_SYSENTER_EIP: u32 = 0x176;
	pub const IA32_CR_PAT: u32 = 0x277;
	pub const IA32_MISC_ENABLE: u32 = 0x1a0;
	pub const IA32_TSC: u32 = 0x10;
	pub const STAR: u32 = 0xc000_0081;
	pub const LSTAR: u32 = 0xc000_0082;
	pub const CSTAR: u32 = 0xc000_0083;
	pub const SFMASK: u32 = 0xc000_0084;
	pub const KERNEL_GS_BASE: u32 = 0xc000_0102;

	/// Bit 0 of `IA32_MISC_ENABLE`: fast string operations.
	pub const MISC_ENABLE_FAST_STRING: u64 = 1;
}

/// The model-specific registers carried through a checkpoint.
const SAVED_MSR_INDICES: [u32; 11] = [
	msr::IA32_SYSENTER_CS,
	msr::IA32_SYSENTER_ESP,
	msr::IA32_SYSENTER_EIP,
	msr::IA32_CR_PAT,
	msr::IA32_MISC_ENABLE,
	msr::IA32_TSC,
	msr::STAR,
	msr::LSTAR,
	msr::CSTAR,
	msr::SFMASK,
	msr::KERNEL_GS_BASE,
];

/// One vCPU's complete architectural state as stored in a
/// `chk{i}_core{c}.dat` file. Plain old data; serialized as raw bytes.
#[repr(C)]
#[derive(Default)]
pub struct VcpuState {
	sregs: kvm_sregs,
	regs: kvm_regs,
	fpu: kvm_fpu,
	msrs: [kvm_msr_entry; SAVED_MSR_INDICES.len()],
	lapic: kvm_lapic_state,
	xsave: kvm_xsave,
	xcrs: kvm_xcrs,
	events: kvm_vcpu_events,
	mp_state: kvm_mp_state,
}

pub struct KvmCpu {
	id: u32,
	vcpu: VcpuFd,
	parent_vm: Arc<MonitorVm<KvmVm>>,
}

impl KvmCpu {
	pub fn new(
		id: u32,
		vcpu: VcpuFd,
		parent_vm: Arc<MonitorVm<KvmVm>>,
	) -> HypervisorResult<KvmCpu> {
		let mut cpu = KvmCpu {
			id,
			vcpu,
			parent_vm,
		};
		cpu.setup_cpuid()?;
		Ok(cpu)
	}

	pub fn id(&self) -> u32 {
		self.id
	}

	/// Applies the host CPUID with the monitor's adjustments: announce the
	/// hypervisor, pass the TSC deadline timer through iff the host has it,
	/// and hide performance monitoring.
	fn setup_cpuid(&mut self) -> HypervisorResult<()> {
		let mut cpuid = super::KVM.get_supported_cpuid(KVM_MAX_CPUID_ENTRIES as usize)?;

		for entry in cpuid.as_mut_slice().iter_mut() {
			match entry.function {
				1 => {
					entry.ecx |= CPUID_HYPERVISOR;
					if self.parent_vm.virt_backend.caps.tsc_deadline {
						entry.ecx |= CPUID_TSC_DEADLINE;
					}
					entry.edx |= CPUID_ENABLE_MSR;
				}
				0x0a => {
					// Disable the performance monitoring leaf.
					entry.eax = 0;
					entry.ebx = 0;
					entry.ecx = 0;
					entry.edx = 0;
				}
				_ => {}
			}
		}

		self.vcpu.set_cpuid2(&cpuid)?;
		Ok(())
	}

	fn kvm_segment(selector_index: u16, type_: u8) -> kvm_segment {
		kvm_segment {
			base: 0,
			limit: 0xfffff,
			selector: selector_index << 3,
			type_,
			present: 1,
			dpl: 0,
			db: 0,
			s: 1,
			l: 1,
			g: 1,
			..Default::default()
		}
	}

	/// Builds the fresh-boot register file: flat 64-bit segments out of the
	/// boot GDT, the identity page tables, long mode enabled, `rip` at the
	/// kernel entry.
	fn init_boot_state(&mut self, entry_point: u64) -> HypervisorResult<()> {
		let misc_enable = Msrs::from_entries(&[kvm_msr_entry {
			index: msr::IA32_MISC_ENABLE,
			data: msr::MISC_ENABLE_FAST_STRING,
			..Default::default()
		}])
		.expect("unable to build the boot MSR list");
		self.vcpu.set_msrs(&misc_enable)?;

		let mut sregs = self.vcpu.get_sregs()?;

		let code_seg = Self::kvm_segment(BOOT_GDT_CODE as u16, 0xb);
		let data_seg = Self::kvm_segment(BOOT_GDT_DATA as u16, 0x3);
		sregs.cs = code_seg;
		sregs.ds = data_seg;
		sregs.es = data_seg;
		sregs.fs = data_seg;
		sregs.gs = data_seg;
		sregs.ss = data_seg;
		sregs.gdt.base = BOOT_GDT;
		sregs.gdt.limit = (size_of::<u64>() * BOOT_GDT_MAX - 1) as u16;

		sregs.cr3 = BOOT_PML4;
		sregs.cr4 |= Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits();
		sregs.cr0 |=
			(Cr0Flags::PROTECTED_MODE_ENABLE | Cr0Flags::PAGING).bits();
		sregs.efer |= EFER_LME | EFER_LMA;
		sregs.apic_base = APIC_DEFAULT_BASE;

		self.vcpu.set_sregs(&sregs)?;

		let regs = kvm_regs {
			rip: entry_point,
			rflags: 0x2,
			..Default::default()
		};
		self.vcpu.set_regs(&regs)?;

		let fpu = kvm_fpu {
			fcw: 0x37f,
			mxcsr: 0x1f80,
			..Default::default()
		};
		self.vcpu.set_fpu(&fpu)?;

		Ok(())
	}

	fn save_cpu_state(&self) -> HypervisorResult<VcpuState> {
		let mut state = VcpuState::default();

		let entries = SAVED_MSR_INDICES.map(|index| kvm_msr_entry {
			index,
			..Default::default()
		});
		let mut msrs = Msrs::from_entries(&entries).expect("unable to build the MSR list");
		let nmsrs = self.vcpu.get_msrs(&mut msrs)?;
		assert_eq!(nmsrs, SAVED_MSR_INDICES.len());
		state.msrs.copy_from_slice(msrs.as_slice());

		state.sregs = self.vcpu.get_sregs()?;
		state.regs = self.vcpu.get_regs()?;
		state.fpu = self.vcpu.get_fpu()?;
		state.lapic = self.vcpu.get_lapic()?;
		state.xsave = self.vcpu.get_xsave()?;
		state.xcrs = self.vcpu.get_xcrs()?;
		state.events = self.vcpu.get_vcpu_events()?;
		state.mp_state = self.vcpu.get_mp_state()?;

		Ok(state)
	}

	fn apply_cpu_state(&self, state: &VcpuState) -> HypervisorResult<()> {
		self.vcpu.set_sregs(&state.sregs)?;
		self.vcpu.set_regs(&state.regs)?;
		self.vcpu.set_fpu(&state.fpu)?;
		unsafe { self.vcpu.set_xsave(&state.xsave) }?;
		self.vcpu.set_xcrs(&state.xcrs)?;

		let msrs = Msrs::from_entries(&state.msrs).expect("unable to build the MSR list");
		self.vcpu.set_msrs(&msrs)?;

		self.vcpu.set_lapic(&state.lapic)?;
		self.vcpu.set_vcpu_events(&state.events)?;
		self.vcpu.set_mp_state(state.mp_state)?;

		Ok(())
	}

	/// The rendezvous every vCPU enters once a snapshot was requested.
	///
	/// Phase 1 ends when all vCPUs have serialized their own register file;
	/// the boot processor then owns guest memory exclusively and writes the
	/// memory image plus the new config. Phase 2 releases everyone back into
	/// the guest. Checkpoint I/O failures abort the process: silently
	/// dropping a snapshot would corrupt the incremental chain.
	fn checkpoint_rendezvous(&mut self, coordinator: &SnapshotCoordinator) {
		let index = coordinator.index();
		debug!("vCPU {} entering snapshot {} rendezvous", self.id, index);

		let state = self
			.save_cpu_state()
			.expect("unable to serialize the vCPU state");
		File::create(CheckpointConfig::core_file_path(index, self.id))
			.and_then(|mut f| f.write_all(unsafe { any_as_u8_slice(&state) }))
			.unwrap_or_else(|e| {
				error!("Failed to write checkpoint: {e}");
				std::process::exit(1);
			});

		coordinator.barrier.wait();

		if self.id == 0 {
			if let Err(e) = self.write_memory_checkpoint(coordinator, index) {
				error!("Failed to write checkpoint: {e}");
				std::process::exit(1);
			}
			coordinator.advance_index();
			coordinator.clear_pause();
		}

		coordinator.barrier.wait();
	}

	/// Boot-processor half of a snapshot: guest clock, memory image, config.
	fn write_memory_checkpoint(
		&self,
		coordinator: &SnapshotCoordinator,
		index: u32,
	) -> std::io::Result<()> {
		let vm = &self.parent_vm;
		let backend = &vm.virt_backend;

		let clock = backend.vm.get_clock().map_err(std::io::Error::from)?;
		let mut file = checkpoint::create_mem_file(index)?;
		checkpoint::write_clock(&mut file, &clock)?;

		if coordinator.full {
			checkpoint::dump_full_image(&mut file, vm.mem())?;
		} else if coordinator.dirty_log {
			let mut bitmaps = Vec::new();
			for slot in &backend.slots {
				let bitmap = backend
					.vm
					.get_dirty_log(slot.id, slot.size)
					.map_err(std::io::Error::from)?;
				bitmaps.push((slot.guest_addr, bitmap));
			}
			checkpoint::dump_dirty_bitmap(&mut file, vm.mem(), &bitmaps)?;
		} else {
			checkpoint::dump_page_table_walk(
				&mut file,
				vm.mem(),
				vm.entry_point(),
				index == 0,
			)?;
		}
		file.flush()?;

		// The descriptor is the commit point and therefore the last write.
		// The recorded size is the configured one; rebuilding the mapping
		// from it re-derives the 32-bit gap on its own.
		CheckpointConfig {
			num_cpus: vm.num_cpus(),
			mem_size: vm.get_params().memory_size.get(),
			checkpoint_number: index,
			elf_entry: vm.entry_point(),
			full: coordinator.full,
		}
		.save()
		.map_err(|e| std::io::Error::other(e.to_string()))
	}

	/// Decodes one I/O exit. The 4-byte payload of every hypercall port is
	/// the guest-physical address of its request struct; the UART port
	/// carries the byte itself.
	fn handle_io_exit(&self, port: u16, data: &[u8]) -> HypervisorResult<Option<i32>> {
		let vm = &self.parent_vm;
		let mem = vm.mem();

		if port == PORT_UART {
			hypercall::uart(data[0]).map_err(|_| super::HypervisorError::last())?;
			return Ok(None);
		}

		let gpa = u64::from(u32::from_le_bytes(
			data.try_into()
				.map_err(|_| super::HypervisorError::new(libc::EINVAL))?,
		));
		let invalid_param = |what: &str| {
			error!("hypercall struct of port {port:#x} is invalid: {what}");
			super::HypervisorError::new(libc::EFAULT)
		};

		match port {
			PORT_WRITE => {
				let params = unsafe { mem.get_ref_mut(gpa) }
					.map_err(|e| invalid_param(&e.to_string()))?;
				hypercall::write(mem, params);
			}
			PORT_READ => {
				let params = unsafe { mem.get_ref_mut(gpa) }
					.map_err(|e| invalid_param(&e.to_string()))?;
				hypercall::read(mem, params);
			}
			PORT_OPEN => {
				let params = unsafe { mem.get_ref_mut(gpa) }
					.map_err(|e| invalid_param(&e.to_string()))?;
				hypercall::open(mem, params);
			}
			PORT_CLOSE => {
				let params = unsafe { mem.get_ref_mut(gpa) }
					.map_err(|e| invalid_param(&e.to_string()))?;
				hypercall::close(params);
			}
			PORT_LSEEK => {
				let params = unsafe { mem.get_ref_mut(gpa) }
					.map_err(|e| invalid_param(&e.to_string()))?;
				hypercall::lseek(params);
			}
			PORT_EXIT => return Ok(Some(hypercall::exit_code(mem, gpa))),
			PORT_CMDSIZE => {
				let params = unsafe { mem.get_ref_mut(gpa) }
					.map_err(|e| invalid_param(&e.to_string()))?;
				hypercall::cmdsize(vm.kernel_path().as_os_str(), vm.args(), params);
			}
			PORT_CMDVAL => {
				let params = unsafe { mem.get_ref_mut(gpa) }
					.map_err(|e| invalid_param(&e.to_string()))?;
				hypercall::cmdval(mem, vm.kernel_path().as_os_str(), vm.args(), params);
			}
			PORT_NETINFO => {
				let params: &mut hypercall::NetinfoParams = unsafe { mem.get_ref_mut(gpa) }
					.map_err(|e| invalid_param(&e.to_string()))?;
				if let Some(net) = vm.net() {
					params.mac_str = *net.mac_str();
				}
			}
			PORT_NETWRITE => {
				let params: &mut hypercall::NetwriteParams = unsafe { mem.get_ref_mut(gpa) }
					.map_err(|e| invalid_param(&e.to_string()))?;
				match vm.net() {
					Some(net) => net.send(mem, params),
					None => params.ret = -1,
				}
			}
			PORT_NETREAD => {
				let params: &mut hypercall::NetreadParams = unsafe { mem.get_ref_mut(gpa) }
					.map_err(|e| invalid_param(&e.to_string()))?;
				match vm.net() {
					Some(net) => net.recv(mem, params),
					None => params.ret = -1,
				}
			}
			PORT_NETSTAT => {
				let params: &mut hypercall::NetstatParams = unsafe { mem.get_ref_mut(gpa) }
					.map_err(|e| invalid_param(&e.to_string()))?;
				params.status = match vm.net() {
					Some(net) => net.poll_readable(),
					None => 0,
				};
			}
			_ => {
				error!("unhandled I/O port {port:#x}");
				self.print_registers();
				return Err(super::HypervisorError::new(libc::EINVAL));
			}
		}

		Ok(None)
	}

	fn fatal_exit(&self, what: &str) -> super::HypervisorError {
		if let Ok(regs) = self.vcpu.get_regs() {
			error!("vCPU {} {what} at rip {:#x}", self.id, regs.rip);
		} else {
			error!("vCPU {} {what}", self.id);
		}
		self.print_registers();
		super::HypervisorError::new(libc::EIO)
	}
}

impl VirtualCPU for KvmCpu {
	fn init(&mut self, entry_point: u64) -> HypervisorResult<()> {
		self.init_boot_state(entry_point)
	}

	/// Reads this vCPU's register file of checkpoint `index` and applies it.
	fn restore_from(&mut self, index: u32) -> HypervisorResult<()> {
		let path = CheckpointConfig::core_file_path(index, self.id);
		let mut state = VcpuState::default();
		File::open(&path)
			.and_then(|mut f| f.read_exact(unsafe { any_as_u8_mut_slice(&mut state) }))
			.unwrap_or_else(|e| {
				error!("Unable to read vCPU state from {}: {e}", path.display());
				std::process::exit(1);
			});
		self.apply_cpu_state(&state)
	}

	/// Application processors may only enter the guest one at a time: wait
	/// until the guest published our predecessor, then claim the startup
	/// slot.
	fn wait_for_boot_turn(&self) {
		let boot_info = self.parent_vm.boot_info();
		while boot_info.boot_barrier() < self.id {
			std::hint::spin_loop();
		}
		debug!("Application processor {} enters the guest", self.id);
		boot_info.set_current_cpu(self.id);
	}

	fn r#continue(&mut self) -> HypervisorResult<VcpuStopReason> {
		loop {
			match self.vcpu.run() {
				Ok(exit) => match exit {
					VcpuExit::Hlt => {
						// A halting guest has nothing left to do.
						debug!("vCPU {} halted", self.id);
						return Ok(VcpuStopReason::Exit(0));
					}
					VcpuExit::IoOut(port, data) => {
						let data = data.to_vec();
						if let Some(code) = self.handle_io_exit(port, &data)? {
							return Ok(VcpuStopReason::Exit(code));
						}
					}
					VcpuExit::IoIn(port, _) => {
						return Err(self.fatal_exit(&format!(
							"performed an unsupported I/O read on port {port:#x}"
						)));
					}
					VcpuExit::MmioRead(addr, _) | VcpuExit::MmioWrite(addr, _) => {
						// The machine model has no MMIO devices at all.
						return Err(
							self.fatal_exit(&format!("accessed unmapped memory at {addr:#x}"))
						);
					}
					VcpuExit::FailEntry(reason, cpu) => {
						return Err(self.fatal_exit(&format!(
							"failed to enter the guest (reason {reason:#x}, cpu {cpu})"
						)));
					}
					VcpuExit::InternalError => {
						return Err(self.fatal_exit("hit an internal hypervisor error"));
					}
					VcpuExit::Shutdown => {
						return Err(self.fatal_exit("shut down unexpectedly"));
					}
					VcpuExit::Debug(_) => {
						return Err(self.fatal_exit("took an unexpected debug exit"));
					}
					other => {
						let msg = format!("stopped with unknown exit {other:?}");
						return Err(self.fatal_exit(&msg));
					}
				},
				Err(e) if e.errno() == libc::EINTR => return Ok(VcpuStopReason::Kick),
				Err(e) => {
					self.print_registers();
					return Err(e);
				}
			}
		}
	}

	fn run(&mut self) -> HypervisorResult<Option<i32>> {
		let vm = self.parent_vm.clone();
		if let Some(coordinator) = vm.coordinator() {
			coordinator.register_current_thread();
		}

		loop {
			if !vm.running() {
				return Ok(None);
			}
			if let Some(coordinator) = vm.coordinator()
				&& coordinator.pause_requested()
			{
				self.checkpoint_rendezvous(coordinator);
			}

			match self.r#continue()? {
				VcpuStopReason::Exit(code) => return Ok(Some(code)),
				VcpuStopReason::Kick => continue,
			}
		}
	}

	fn print_registers(&self) {
		let Ok(regs) = self.vcpu.get_regs() else {
			eprintln!("vCPU {}: registers unavailable", self.id);
			return;
		};
		let Ok(sregs) = self.vcpu.get_sregs() else {
			eprintln!("vCPU {}: special registers unavailable", self.id);
			return;
		};

		eprintln!("\nDump state of CPU {}", self.id);
		eprintln!("\nRegisters:");
		eprintln!("----------");
		eprintln!(
			"rip: {:016x}   rsp: {:016x} flags: {:016x}",
			regs.rip, regs.rsp, regs.rflags
		);
		eprintln!(
			"rax: {:016x}   rbx: {:016x}   rcx: {:016x}",
			regs.rax, regs.rbx, regs.rcx
		);
		eprintln!(
			"rdx: {:016x}   rsi: {:016x}   rdi: {:016x}",
			regs.rdx, regs.rsi, regs.rdi
		);
		eprintln!(
			"rbp: {:016x}    r8: {:016x}    r9: {:016x}",
			regs.rbp, regs.r8, regs.r9
		);
		eprintln!(
			"r10: {:016x}   r11: {:016x}   r12: {:016x}",
			regs.r10, regs.r11, regs.r12
		);
		eprintln!(
			"r13: {:016x}   r14: {:016x}   r15: {:016x}",
			regs.r13, regs.r14, regs.r15
		);
		eprintln!(
			"cr0: {:016x}   cr2: {:016x}   cr3: {:016x}",
			sregs.cr0, sregs.cr2, sregs.cr3
		);
		eprintln!("cr4: {:016x}  efer: {:016x}", sregs.cr4, sregs.efer);
		eprintln!(
			"apic base: {:016x}  gdt: base {:x} limit {:x}",
			sregs.apic_base, sregs.gdt.base, sregs.gdt.limit
		);
	}
}
