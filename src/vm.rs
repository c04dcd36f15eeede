//! The monitor-level view of one virtual machine.

use std::{
	ffi::CStr,
	fmt, fs, io,
	os::unix::thread::JoinHandleExt,
	path::{Path, PathBuf},
	sync::{
		Arc, Mutex,
		atomic::{AtomicBool, Ordering},
	},
	thread,
};

use goblin::elf::{
	Elf,
	header::{EI_CLASS, EI_DATA, EI_OSABI, ELFCLASS64, ELFDATA2LSB, ET_EXEC},
	program_header::PT_LOAD,
};
use kvm_bindings::kvm_clock_data;
use log::{debug, error, warn};
use thiserror::Error;

use crate::{
	arch,
	boot_info::{BootInfoLayout, BootInfoView},
	checkpoint::{self, CheckpointConfig, SnapshotCoordinator},
	consts::*,
	mem::MmapMemory,
	net::NetBridge,
	os::HypervisorError,
	params::Params,
	vcpu::VirtualCPU,
};

pub type HypervisorResult<T> = Result<T, HypervisorError>;

#[derive(Error, Debug)]
pub enum LoadKernelError {
	#[error(transparent)]
	Io(#[from] io::Error),
	#[error("the file is not a classic 64-bit unikernel image")]
	InvalidKernel,
	#[error("guest memory size is not large enough")]
	InsufficientMemory,
}

pub type LoadKernelResult<T> = Result<T, LoadKernelError>;

/// Trait marking an interface for creating (accelerated) VMs.
pub trait VirtualizationBackend: Sized {
	type VCPU: VirtualCPU;
	const NAME: &str;

	fn new(mem: &MmapMemory, params: &Params, dirty_log: bool) -> HypervisorResult<Self>;

	/// Create a new CPU object.
	fn new_cpu(&self, id: u32, parent_vm: Arc<MonitorVm<Self>>) -> HypervisorResult<Self::VCPU>;

	/// Applies a checkpointed guest clock, if the host supports it.
	fn restore_clock(&self, clock: &kvm_clock_data) -> HypervisorResult<()>;

	/// Raises the paravirtual network interrupt line.
	fn notify_net_interrupt(&self);
}

#[cfg(target_os = "linux")]
pub type DefaultBackend = crate::linux::KvmVm;

/// Result of placing a kernel image into guest memory.
#[derive(Clone, Copy, Debug)]
pub struct LoadedKernel {
	pub entry_point: u64,
	/// Physical address of the first loaded segment; the boot-info block
	/// starts here.
	pub kernel_address: u64,
	/// Accumulated `memsz` over all loadable segments.
	pub image_size: u64,
	pub boot_info: BootInfoView,
}

/// Places a classic unikernel image into guest memory and writes the
/// boot-info block onto its first loadable segment.
///
/// Accepts exactly the published contract: 64-bit little-endian `ET_EXEC`
/// with the Hermit OS-ABI tag, the host architecture and an entry point
/// above [`KERNEL_SPACE_FLOOR`]. Anything else is rejected outright. For
/// every `PT_LOAD` segment, `filesz` bytes are copied to `p_paddr`; the
/// `memsz - filesz` tail stays zero because the mapping is fresh.
pub fn place_kernel(
	mem: &MmapMemory,
	buffer: &[u8],
	params: &Params,
	cpu_freq: u32,
) -> LoadKernelResult<LoadedKernel> {
	let elf = Elf::parse(buffer).map_err(|_| LoadKernelError::InvalidKernel)?;

	let ident = &elf.header.e_ident;
	if ident[EI_CLASS] != ELFCLASS64
		|| ident[EI_DATA] != ELFDATA2LSB
		|| ident[EI_OSABI] != HERMIT_ELFOSABI
		|| elf.header.e_type != ET_EXEC
		|| elf.header.e_machine != arch::x86_64::ELF_HOST_ARCH
		|| elf.header.e_entry < KERNEL_SPACE_FLOOR
	{
		return Err(LoadKernelError::InvalidKernel);
	}

	debug!("ELF entry point at {:#x}", elf.header.e_entry);

	// Safety: loading happens strictly before any vCPU is created.
	let vm_slice = unsafe { mem.as_slice_mut() };

	let mut image_size: u64 = 0;
	let mut first_segment = None;
	for header in elf
		.program_headers
		.iter()
		.filter(|header| header.p_type == PT_LOAD)
	{
		let region_start = header.p_paddr as usize;
		let region_end = region_start + header.p_filesz as usize;
		let kernel_start = header.p_offset as usize;
		let kernel_end = kernel_start + header.p_filesz as usize;

		debug!(
			"Load segment with start addr {:#x} and size {:#x}, offset {:#x}",
			header.p_paddr, header.p_filesz, header.p_offset
		);

		let region_span = header
			.p_paddr
			.checked_add(header.p_memsz)
			.ok_or(LoadKernelError::InvalidKernel)?;
		if region_span as usize > vm_slice.len() {
			return Err(LoadKernelError::InsufficientMemory);
		}
		if kernel_end > buffer.len() || header.p_filesz > header.p_memsz {
			return Err(LoadKernelError::InvalidKernel);
		}

		vm_slice[region_start..region_end].copy_from_slice(&buffer[kernel_start..kernel_end]);

		if first_segment.is_none() {
			if (header.p_memsz as usize) < size_of::<BootInfoLayout>() {
				return Err(LoadKernelError::InvalidKernel);
			}
			first_segment = Some(header.p_paddr);
		}

		image_size += header.p_memsz;
	}

	let kernel_address = first_segment.ok_or(LoadKernelError::InvalidKernel)?;

	// Publish the machine parameters. This is the only write of the block;
	// afterwards only the guest touches it.
	// Safety: the first segment was just placed and spans the whole block.
	let boot_info =
		unsafe { BootInfoView::new(vm_slice.as_mut_ptr().add(kernel_address as usize)) };
	boot_info.set_base(kernel_address);
	boot_info.set_limit(mem.memory_size as u64);
	boot_info.set_cpu_freq(cpu_freq);
	boot_info.set_possible_cpus(params.cpu_count.get());
	boot_info.set_numa_nodes(1);
	boot_info.set_hypervisor_tag(1);
	if params.verbose {
		boot_info.set_uart_port(PORT_UART.into());
	}
	if let Some(ip) = params.ip {
		boot_info.set_ip(ip.octets());
	}
	if let Some(gateway) = params.gateway {
		boot_info.set_gateway(gateway.octets());
	}
	if let Some(mask) = params.mask {
		boot_info.set_mask(mask.octets());
	}
	boot_info.set_host_mem_base(mem.host_address as u64);
	boot_info.set_image_size(image_size);

	Ok(LoadedKernel {
		entry_point: elf.header.e_entry,
		kernel_address,
		image_size,
		boot_info,
	})
}

pub struct MonitorVm<VirtBackend: VirtualizationBackend> {
	/// The starting position of the kernel image in physical memory; the
	/// boot-info block lives at this address.
	kernel_address: u64,
	entry_point: u64,
	mem: Arc<MmapMemory>,
	path: PathBuf,
	boot_info: Option<BootInfoView>,
	net: Option<Arc<NetBridge>>,
	coordinator: Option<Arc<SnapshotCoordinator>>,
	/// Index of the checkpoint this VM resumes from, if any.
	restored_from: Option<u32>,
	running: AtomicBool,
	/// Serializes teardown against concurrent vCPU failures.
	exit_guard: Mutex<()>,
	pub virt_backend: VirtBackend,
	params: Params,
}

impl<VirtBackend: VirtualizationBackend + Send + Sync + 'static> MonitorVm<VirtBackend> {
	/// Builds the machine: guest memory, the virtualization backend, the
	/// network bridge and the snapshot coordinator. The kernel (or a
	/// checkpoint chain) is loaded in a second step.
	pub fn new(
		kernel_path: PathBuf,
		params: Params,
		restore: Option<&CheckpointConfig>,
	) -> HypervisorResult<MonitorVm<VirtBackend>> {
		let memory_size = params.memory_size.get();
		let mem = MmapMemory::new(0, memory_size, params.ksm, params.thp);

		let checkpointing = params.checkpoint_interval > 0;
		let dirty_log = checkpointing && params.dirty_log && !params.full_checkpoint;
		let virt_backend = VirtBackend::new(&mem, &params, dirty_log)?;

		let net = match &params.netif {
			Some(netif) => {
				debug!("Initialize network interface");
				let bridge =
					NetBridge::new(netif, params.mac.as_deref()).map_err(|e| {
						error!("Cannot set up the network bridge: {e}");
						HypervisorError::new(libc::EIO)
					})?;
				Some(Arc::new(bridge))
			}
			None => None,
		};

		let coordinator = checkpointing.then(|| {
			let start_index = restore.map_or(0, |chk| chk.checkpoint_number + 1);
			Arc::new(SnapshotCoordinator::new(
				params.cpu_count.get(),
				params.full_checkpoint,
				dirty_log,
				start_index,
			))
		});

		let mut vm = Self {
			kernel_address: 0,
			entry_point: 0,
			mem: Arc::new(mem),
			path: kernel_path,
			boot_info: None,
			net,
			coordinator,
			restored_from: None,
			running: AtomicBool::new(false),
			exit_guard: Mutex::new(()),
			virt_backend,
			params,
		};

		vm.init_guest_mem();

		Ok(vm)
	}

	pub fn mem(&self) -> &MmapMemory {
		&self.mem
	}

	pub fn entry_point(&self) -> u64 {
		self.entry_point
	}

	pub fn kernel_start_addr(&self) -> u64 {
		self.kernel_address
	}

	pub fn boot_info(&self) -> BootInfoView {
		self.boot_info
			.expect("the kernel has not been loaded yet")
	}

	/// Returns the number of cores for the vm.
	pub fn num_cpus(&self) -> u32 {
		self.params.cpu_count.get()
	}

	pub fn kernel_path(&self) -> &Path {
		&self.path
	}

	pub fn args(&self) -> &[String] {
		&self.params.kernel_args
	}

	pub fn net(&self) -> Option<&Arc<NetBridge>> {
		self.net.as_ref()
	}

	pub fn coordinator(&self) -> Option<&Arc<SnapshotCoordinator>> {
		self.coordinator.as_ref()
	}

	pub fn running(&self) -> bool {
		self.running.load(Ordering::Acquire)
	}

	pub fn get_params(&self) -> &Params {
		&self.params
	}

	/// Initialize the boot page tables and the GDT for the guest.
	fn init_guest_mem(&mut self) {
		debug!("Initialize guest memory");
		#[cfg(target_arch = "x86_64")]
		// Safety: no vCPU exists yet, the slice is dropped before any runs.
		arch::x86_64::initialize_pagetables(unsafe { self.mem.as_slice_mut() });
	}

	/// Loads the kernel image and publishes the boot-info block.
	pub fn load_kernel(&mut self) -> LoadKernelResult<()> {
		debug!("Load kernel from {}", self.path.display());

		let buffer = fs::read(&self.path)?;
		let loaded = place_kernel(&self.mem, &buffer, &self.params, arch::detect_cpu_freq())?;

		self.entry_point = loaded.entry_point;
		self.kernel_address = loaded.kernel_address;
		self.boot_info = Some(loaded.boot_info);

		debug!("Kernel loaded");

		Ok(())
	}

	/// Replays a checkpoint chain into guest memory. The boot info block is
	/// not rewritten: the restored pages already carry the state the guest
	/// saw when the snapshot was taken.
	pub fn load_checkpoint(&mut self, chk: &CheckpointConfig) -> HypervisorResult<()> {
		if chk.elf_entry as usize + size_of::<BootInfoLayout>() > self.mem.memory_size {
			error!("The checkpointed entry point lies outside of guest memory");
			return Err(HypervisorError::new(libc::EINVAL));
		}

		self.entry_point = chk.elf_entry;
		self.kernel_address = chk.elf_entry;
		self.restored_from = Some(chk.checkpoint_number);

		// Safety: vCPUs do not exist yet.
		let base = unsafe {
			self.mem
				.as_slice_mut()
				.as_mut_ptr()
				.add(self.kernel_address as usize)
		};
		self.boot_info = Some(unsafe { BootInfoView::new(base) });

		let start = if chk.full { chk.checkpoint_number } else { 0 };
		for i in start..=chk.checkpoint_number {
			let path = CheckpointConfig::mem_file_path(i);
			let mut file = std::io::BufReader::new(fs::File::open(&path).map_err(|e| {
				error!("Unable to open {}: {e}", path.display());
				HypervisorError::new(libc::ENOENT)
			})?);

			let io_fail = |e: io::Error| {
				error!("Unable to replay {}: {e}", path.display());
				HypervisorError::new(libc::EIO)
			};
			let clock = checkpoint::read_clock(&mut file).map_err(io_fail)?;
			if i == chk.checkpoint_number {
				let restored = kvm_clock_data {
					clock: clock.clock,
					..Default::default()
				};
				let _ = self.virt_backend.restore_clock(&restored);
			}

			if chk.full {
				checkpoint::load_full_image(&mut file, &self.mem).map_err(io_fail)?;
			} else {
				checkpoint::load_page_records(&mut file, &self.mem).map_err(io_fail)?;
			}
			debug!("Loaded checkpoint {i}");
		}

		Ok(())
	}

	/// The guest's kernel log ring, if the kernel has produced one.
	pub fn klog(&self) -> Option<String> {
		let addr = self.kernel_address + KLOG_OFFSET;
		let slice = unsafe { self.mem.slice_at(addr, PAGE_SIZE).ok()? };
		let log = CStr::from_bytes_until_nul(slice).ok()?;
		Some(log.to_string_lossy().into_owned())
	}

	fn boot_cpu(vm: Arc<Self>, id: u32) -> HypervisorResult<Option<i32>> {
		let mut cpu = vm.virt_backend.new_cpu(id, vm.clone())?;
		if let Some(index) = vm.restored_from {
			cpu.restore_from(index)?;
		} else {
			cpu.init(vm.entry_point)?;
			if id > 0 {
				cpu.wait_for_boot_turn();
			}
		}
		cpu.run()
	}

	/// Runs the machine: the boot processor on the calling thread, one host
	/// thread per application processor. Returns the guest's exit code.
	pub fn run(self: Arc<Self>) -> i32 {
		self.running.store(true, Ordering::Release);
		checkpoint::install_kick_handler();

		if let Some(coordinator) = &self.coordinator {
			SnapshotCoordinator::start_timer(
				coordinator.clone(),
				self.params.checkpoint_interval,
			);
		}

		if let Some(net) = &self.net {
			let vm = self.clone();
			let net = net.clone();
			thread::Builder::new()
				.name("netif".into())
				.spawn(move || {
					while vm.running() {
						net.wait_for_frame();
						vm.virt_backend.notify_net_interrupt();
					}
				})
				.expect("unable to spawn the network interrupt thread");
		}

		let mut handles = Vec::new();
		for id in 1..self.num_cpus() {
			let vm = self.clone();
			let handle = thread::Builder::new()
				.name(format!("vcpu{id}"))
				.spawn(move || match Self::boot_cpu(vm.clone(), id) {
					Ok(code) => {
						if let Some(code) = code {
							debug!("Application processor {id} left the guest with code {code}");
						}
					}
					Err(e) => {
						error!("vCPU {id} failed: {e}");
						std::process::exit(1);
					}
				})
				.expect("unable to spawn a vCPU thread");
			handles.push(handle);
		}

		let code = match Self::boot_cpu(self.clone(), 0) {
			Ok(Some(code)) => code,
			Ok(None) => 0,
			Err(e) => {
				error!("Boot processor failed: {e}");
				if self.params.verbose && let Some(klog) = self.klog() {
					eprintln!("Kernel log:\n{klog}");
				}
				self.shutdown(handles);
				std::process::exit(1);
			}
		};

		if code == -14 {
			warn!("The guest exited with -14. Did the guest receive an exception?");
		}

		self.shutdown(handles);
		code
	}

	/// Stops all remaining vCPU threads and joins them. The backend (and
	/// with it the VM descriptors) dies with the surrounding value, after
	/// every thread is gone.
	fn shutdown(&self, handles: Vec<thread::JoinHandle<()>>) {
		let _guard = self.exit_guard.lock().unwrap();
		self.running.store(false, Ordering::Release);

		for handle in &handles {
			unsafe {
				libc::pthread_kill(handle.as_pthread_t(), libc::SIGRTMIN());
			}
		}
		for handle in handles {
			let _ = handle.join();
		}
	}
}

impl<VirtIf: VirtualizationBackend> fmt::Debug for MonitorVm<VirtIf> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct(&format!("MonitorVm<{}>", VirtIf::NAME))
			.field("kernel_address", &self.kernel_address)
			.field("entry_point", &self.entry_point)
			.field("mem", &self.mem)
			.field("path", &self.path)
			.field("restored_from", &self.restored_from)
			.field("params", &self.params)
			.finish()
	}
}
