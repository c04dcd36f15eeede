//! Coordinated snapshot and restore of the whole VM.
//!
//! A snapshot pauses every vCPU at an exit boundary via a realtime-signal
//! kick and a two-phase barrier. Each vCPU serializes its own register state
//! into `checkpoint/chk{i}_core{c}.dat`; the boot processor then writes the
//! guest clock and a memory image into `checkpoint/chk{i}_mem.dat` and
//! finally rewrites `chk_config.txt` — the config file is the commit point.

use std::{
	fs::{self, File},
	io::{self, BufRead, BufReader, BufWriter, Read, Write},
	path::{Path, PathBuf},
	sync::{
		Barrier,
		atomic::{AtomicBool, AtomicU32, Ordering},
	},
	thread,
	time::Duration,
};

use kvm_bindings::kvm_clock_data;
use log::{debug, warn};
use thiserror::Error;
use x86_64::structures::paging::PageTableFlags;

use crate::{
	consts::{
		CHECKPOINT_CONFIG, CHECKPOINT_DIR, KVM_32BIT_GAP_SIZE, KVM_32BIT_GAP_START, PAGE_SIZE,
	},
	mem::MmapMemory,
	paging::{PageLocation, scan_page_tables},
};

#[derive(Error, Debug)]
pub enum CheckpointError {
	#[error("unable to read the checkpoint descriptor: {0}")]
	InvalidConfig(String),
	#[error(transparent)]
	Io(#[from] io::Error),
}

/// Reinterprets a plain-old-data value as its raw bytes.
pub(crate) unsafe fn any_as_u8_slice<T: Sized>(p: &T) -> &[u8] {
	unsafe { std::slice::from_raw_parts((p as *const T) as *const u8, size_of::<T>()) }
}

pub(crate) unsafe fn any_as_u8_mut_slice<T: Sized>(p: &mut T) -> &mut [u8] {
	unsafe { std::slice::from_raw_parts_mut((p as *mut T) as *mut u8, size_of::<T>()) }
}

/// The on-disk `chk_config.txt` descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointConfig {
	pub num_cpus: u32,
	pub mem_size: usize,
	pub checkpoint_number: u32,
	pub elf_entry: u64,
	pub full: bool,
}

impl CheckpointConfig {
	pub fn exists() -> bool {
		Path::new(CHECKPOINT_CONFIG).exists()
	}

	pub fn mem_file_path(checkpoint: u32) -> PathBuf {
		PathBuf::from(format!("{CHECKPOINT_DIR}/chk{checkpoint}_mem.dat"))
	}

	pub fn core_file_path(checkpoint: u32, core: u32) -> PathBuf {
		PathBuf::from(format!("{CHECKPOINT_DIR}/chk{checkpoint}_core{core}.dat"))
	}

	pub fn load() -> Result<CheckpointConfig, CheckpointError> {
		Self::parse(BufReader::new(File::open(CHECKPOINT_CONFIG)?))
	}

	fn parse(reader: impl BufRead) -> Result<CheckpointConfig, CheckpointError> {
		let mut num_cpus = None;
		let mut mem_size = None;
		let mut checkpoint_number = None;
		let mut elf_entry = None;
		let mut full = None;

		for line in reader.lines() {
			let line = line?;
			let Some((key, value)) = line.split_once(':') else {
				continue;
			};
			// Older writers leave out the final newline; trimming covers both.
			let value = value.trim();
			match key.trim() {
				"number of cores" => num_cpus = Some(parse_int(value)? as u32),
				"memory size" => mem_size = Some(parse_int(value)? as usize),
				"checkpoint number" => checkpoint_number = Some(parse_int(value)? as u32),
				"entry point" => elf_entry = Some(parse_int(value)?),
				"full checkpoint" => full = Some(parse_int(value)? != 0),
				other => warn!("Ignoring unknown checkpoint key `{other}`"),
			}
		}

		let missing =
			|field: &str| CheckpointError::InvalidConfig(format!("missing field `{field}`"));
		Ok(CheckpointConfig {
			num_cpus: num_cpus.ok_or_else(|| missing("number of cores"))?,
			mem_size: mem_size.ok_or_else(|| missing("memory size"))?,
			checkpoint_number: checkpoint_number.ok_or_else(|| missing("checkpoint number"))?,
			elf_entry: elf_entry.ok_or_else(|| missing("entry point"))?,
			full: full.ok_or_else(|| missing("full checkpoint"))?,
		})
	}

	/// Rewrites the descriptor. This is the last write of a snapshot, so a
	/// reader that sees the new index also sees all files it refers to.
	pub fn save(&self) -> Result<(), CheckpointError> {
		let mut file = File::create(CHECKPOINT_CONFIG)?;
		write!(
			file,
			"number of cores: {}\nmemory size: {:#x}\ncheckpoint number: {}\nentry point: {:#x}\nfull checkpoint: {}",
			self.num_cpus,
			self.mem_size,
			self.checkpoint_number,
			self.elf_entry,
			self.full as u32,
		)?;
		Ok(())
	}
}

fn parse_int(value: &str) -> Result<u64, CheckpointError> {
	let parsed = if let Some(hex) = value.strip_prefix("0x") {
		u64::from_str_radix(hex, 16)
	} else {
		value.parse()
	};
	parsed.map_err(|_| CheckpointError::InvalidConfig(format!("bad integer `{value}`")))
}

/// Ranges of guest memory that are actually backed; everything but the
/// 32-bit device gap.
fn backed_ranges(mem: &MmapMemory) -> Vec<(u64, usize)> {
	if mem.has_gap() {
		vec![
			(0, KVM_32BIT_GAP_START),
			(
				(KVM_32BIT_GAP_START + KVM_32BIT_GAP_SIZE) as u64,
				mem.memory_size - KVM_32BIT_GAP_START - KVM_32BIT_GAP_SIZE,
			),
		]
	} else {
		vec![(0, mem.memory_size)]
	}
}

pub fn write_clock(file: &mut impl Write, clock: &kvm_clock_data) -> io::Result<()> {
	file.write_all(unsafe { any_as_u8_slice(clock) })
}

pub fn read_clock(file: &mut impl Read) -> io::Result<kvm_clock_data> {
	let mut clock = kvm_clock_data::default();
	file.read_exact(unsafe { any_as_u8_mut_slice(&mut clock) })?;
	Ok(clock)
}

/// Full mode: the raw image of every backed byte.
pub fn dump_full_image(file: &mut impl Write, mem: &MmapMemory) -> io::Result<()> {
	for (start, len) in backed_ranges(mem) {
		let slice = unsafe { mem.slice_at(start, len) }
			.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
		file.write_all(slice)?;
	}
	Ok(())
}

pub fn load_full_image(file: &mut impl Read, mem: &MmapMemory) -> io::Result<()> {
	for (start, len) in backed_ranges(mem) {
		let slice = unsafe { mem.slice_at_mut(start, len) }
			.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
		file.read_exact(slice)?;
	}
	Ok(())
}

fn write_page_record(file: &mut impl Write, mem: &MmapMemory, loc: PageLocation) -> io::Result<()> {
	let bytes = unsafe { mem.slice_at(loc.address(), loc.len()) }
		.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
	file.write_all(&loc.as_raw().to_le_bytes())?;
	file.write_all(bytes)
}

/// Incremental mode, driven by the guest's own page tables rooted one page
/// behind the entry point. The first dump of a chain selects on the accessed
/// bit, successors on the dirty bit; emitted leaves get both bits cleared so
/// the next dump only carries the delta.
pub fn dump_page_table_walk(
	file: &mut impl Write,
	mem: &MmapMemory,
	elf_entry: u64,
	first_checkpoint: bool,
) -> io::Result<()> {
	let flag = if first_checkpoint {
		PageTableFlags::ACCESSED
	} else {
		PageTableFlags::DIRTY
	};
	let pml4_addr = elf_entry + PAGE_SIZE as u64;

	scan_page_tables(mem, pml4_addr, flag, true, &mut |loc| {
		write_page_record(file, mem, loc)
	})
}

/// Incremental mode, driven by KVM's per-slot dirty bitmaps. `bitmaps` holds
/// one `(first guest-physical address, bitmap)` pair per memory slot; the
/// kernel resets each bitmap as it is fetched.
pub fn dump_dirty_bitmap(
	file: &mut impl Write,
	mem: &MmapMemory,
	bitmaps: &[(u64, Vec<u64>)],
) -> io::Result<()> {
	for (base, bitmap) in bitmaps {
		for (word_idx, word) in bitmap.iter().enumerate() {
			let mut word = *word;
			while word != 0 {
				let bit = word.trailing_zeros() as u64;
				word &= word - 1;
				let gpa = base + (word_idx as u64 * 64 + bit) * PAGE_SIZE as u64;
				write_page_record(file, mem, PageLocation::encode(gpa, false))?;
			}
		}
	}
	Ok(())
}

/// Replays one incremental memory file into guest memory.
pub fn load_page_records(file: &mut impl Read, mem: &MmapMemory) -> io::Result<()> {
	let mut raw = [0u8; 8];
	loop {
		match file.read_exact(&mut raw) {
			Ok(()) => {}
			Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
			Err(e) => return Err(e),
		}
		let loc = PageLocation::from_raw(u64::from_le_bytes(raw));
		let dest = unsafe { mem.slice_at_mut(loc.address(), loc.len()) }
			.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
		file.read_exact(dest)?;
	}
}

/// Shared state of the snapshot protocol.
///
/// The timer thread requests a pause and kicks every vCPU out of its run
/// call; each vCPU parks in `barrier` twice per snapshot (phase 1 after
/// serializing its own state, phase 2 after the boot processor finished the
/// memory image). No guest code runs between the two phases.
pub struct SnapshotCoordinator {
	pub barrier: Barrier,
	pause_requested: AtomicBool,
	index: AtomicU32,
	pub full: bool,
	pub dirty_log: bool,
	threads: std::sync::Mutex<Vec<libc::pthread_t>>,
}

impl SnapshotCoordinator {
	pub fn new(num_cpus: u32, full: bool, dirty_log: bool, start_index: u32) -> Self {
		Self {
			barrier: Barrier::new(num_cpus as usize),
			pause_requested: AtomicBool::new(false),
			index: AtomicU32::new(start_index),
			full,
			dirty_log,
			threads: std::sync::Mutex::new(Vec::new()),
		}
	}

	/// Registers the calling vCPU thread as a kick target.
	pub fn register_current_thread(&self) {
		self.threads.lock().unwrap().push(unsafe { libc::pthread_self() });
	}

	pub fn pause_requested(&self) -> bool {
		self.pause_requested.load(Ordering::Acquire)
	}

	/// Called by the boot processor right before the phase-2 barrier.
	pub fn clear_pause(&self) {
		self.pause_requested.store(false, Ordering::Release);
	}

	pub fn index(&self) -> u32 {
		self.index.load(Ordering::Acquire)
	}

	pub fn advance_index(&self) {
		self.index.fetch_add(1, Ordering::Release);
	}

	/// Asks every vCPU to pause at its next exit boundary. A kick that
	/// arrives while a snapshot is still in flight is ignored.
	pub fn request_snapshot(&self) {
		if self
			.pause_requested
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return;
		}
		for thread in self.threads.lock().unwrap().iter() {
			unsafe {
				libc::pthread_kill(*thread, libc::SIGRTMIN());
			}
		}
	}

	/// Spawns the periodic snapshot trigger.
	pub fn start_timer(coordinator: std::sync::Arc<Self>, interval_secs: u32) {
		if interval_secs == 0 {
			return;
		}
		fs::create_dir_all(CHECKPOINT_DIR).expect("unable to create the checkpoint directory");
		thread::Builder::new()
			.name("chk-timer".into())
			.spawn(move || {
				loop {
					thread::sleep(Duration::from_secs(interval_secs.into()));
					debug!("Requesting snapshot {}", coordinator.index());
					coordinator.request_snapshot();
				}
			})
			.expect("unable to spawn the checkpoint timer");
	}
}

/// Installs the no-op handler for the kick signal. The handler's only job is
/// to make a blocking `KVM_RUN` return `EINTR`; all real work happens at the
/// run-loop exit boundary.
pub fn install_kick_handler() {
	extern "C" fn kick(_signum: libc::c_int) {}

	unsafe {
		let mut action: libc::sigaction = std::mem::zeroed();
		action.sa_sigaction = kick as extern "C" fn(libc::c_int) as usize;
		// No SA_RESTART: the interrupted ioctl must not be resumed.
		action.sa_flags = 0;
		libc::sigemptyset(&mut action.sa_mask);
		libc::sigaction(libc::SIGRTMIN(), &action, std::ptr::null_mut());
	}
}

/// Opens the memory-image file for the current snapshot.
pub fn create_mem_file(index: u32) -> io::Result<BufWriter<File>> {
	Ok(BufWriter::new(File::create(
		CheckpointConfig::mem_file_path(index),
	)?))
}

#[cfg(test)]
mod tests {
	use std::io::Cursor;

	use super::*;

	const CONFIG_TEXT: &str = "number of cores: 4\nmemory size: 0x10000000\ncheckpoint number: 2\nentry point: 0x800000\nfull checkpoint: 0";

	#[test]
	fn test_config_parse_without_trailing_newline() {
		let config = CheckpointConfig::parse(Cursor::new(CONFIG_TEXT)).unwrap();
		assert_eq!(
			config,
			CheckpointConfig {
				num_cpus: 4,
				mem_size: 0x1000_0000,
				checkpoint_number: 2,
				elf_entry: 0x80_0000,
				full: false,
			}
		);
	}

	#[test]
	fn test_config_parse_with_trailing_newline() {
		let text = format!("{CONFIG_TEXT}\n");
		let config = CheckpointConfig::parse(Cursor::new(text)).unwrap();
		assert_eq!(config.checkpoint_number, 2);
		assert!(!config.full);
	}

	#[test]
	fn test_config_rejects_missing_fields() {
		let text = "number of cores: 1\nmemory size: 0x1000\n";
		assert!(CheckpointConfig::parse(Cursor::new(text)).is_err());
	}

	#[test]
	fn test_page_record_roundtrip() {
		let mem = MmapMemory::new(0, 0x40_0000, false, false);
		unsafe {
			mem.slice_at_mut(0x5000, 4).unwrap().copy_from_slice(b"ping");
		}

		let mut buffer = Vec::new();
		write_page_record(&mut buffer, &mem, PageLocation::encode(0x5000, false)).unwrap();
		assert_eq!(buffer.len(), 8 + PAGE_SIZE);

		// Wipe and replay.
		unsafe {
			mem.slice_at_mut(0x5000, 4).unwrap().copy_from_slice(&[0; 4]);
		}
		load_page_records(&mut Cursor::new(buffer), &mem).unwrap();
		unsafe {
			assert_eq!(mem.slice_at(0x5000, 4).unwrap(), b"ping");
		}
	}

	#[test]
	fn test_dirty_bitmap_dump() {
		let mem = MmapMemory::new(0, 0x40_0000, false, false);
		unsafe {
			mem.slice_at_mut(3 * PAGE_SIZE as u64, 4)
				.unwrap()
				.copy_from_slice(b"dirt");
		}

		// Pages 0 and 3 of the single slot are dirty.
		let bitmaps = vec![(0u64, vec![0b1001u64])];
		let mut buffer = Vec::new();
		dump_dirty_bitmap(&mut buffer, &mem, &bitmaps).unwrap();
		assert_eq!(buffer.len(), 2 * (8 + PAGE_SIZE));

		let second = &buffer[8 + PAGE_SIZE..];
		let loc = PageLocation::from_raw(u64::from_le_bytes(second[..8].try_into().unwrap()));
		assert_eq!(loc.address(), 3 * PAGE_SIZE as u64);
		assert_eq!(&second[8..12], b"dirt");
	}

	#[test]
	fn test_clock_record_roundtrip() {
		let mut clock = kvm_clock_data::default();
		clock.clock = 0x1122_3344_5566_7788;

		let mut buffer = Vec::new();
		write_clock(&mut buffer, &clock).unwrap();
		let restored = read_clock(&mut Cursor::new(buffer)).unwrap();
		assert_eq!(restored.clock, 0x1122_3344_5566_7788);
	}
}
