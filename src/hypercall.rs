//! The paravirtual host-call interface.
//!
//! Every port has one packed request struct in guest physical memory. The
//! guest writes the struct's guest-physical address to the port; the monitor
//! translates it into the mapping, performs the host work and stores the
//! results back into the same struct before re-entering the vCPU.

use std::{
	ffi::OsStr,
	io::{self, Write},
	os::unix::ffi::OsStrExt,
	ptr,
};

use log::warn;

use crate::{
	consts::{MAX_ARGC, MAX_ENVC, MAC_STR_LEN},
	mem::MmapMemory,
};

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct WriteParams {
	pub fd: i32,
	/// Guest-physical address of the buffer.
	pub buf: u64,
	/// In: bytes to write. Out: result of the host `write`.
	pub len: usize,
}

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct ReadParams {
	pub fd: i32,
	pub buf: u64,
	pub len: usize,
	/// Bytes read on success, `-1` on failure.
	pub ret: isize,
}

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct OpenParams {
	/// Guest-physical address of the NUL-terminated path.
	pub name: u64,
	pub flags: i32,
	pub mode: i32,
	pub ret: i32,
}

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct CloseParams {
	pub fd: i32,
	pub ret: i32,
}

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct LseekParams {
	pub fd: i32,
	/// In: requested offset. Out: resulting offset.
	pub offset: isize,
	pub whence: i32,
}

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct ExitParams {
	pub arg: i32,
}

#[repr(C, packed)]
pub struct CmdsizeParams {
	pub argc: i32,
	pub argsz: [i32; MAX_ARGC],
	pub envc: i32,
	pub envsz: [i32; MAX_ENVC],
}

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct CmdvalParams {
	/// Guest-physical address of an `argc`-sized array of guest-physical
	/// string destinations.
	pub argv: u64,
	pub envp: u64,
}

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct NetinfoParams {
	pub mac_str: [u8; MAC_STR_LEN],
}

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct NetwriteParams {
	pub data: u64,
	pub len: usize,
	pub ret: i32,
}

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct NetreadParams {
	pub data: u64,
	/// Out: number of bytes placed into the buffer.
	pub len: usize,
	/// `0` when a frame was delivered, `-1` when the TAP would block.
	pub ret: i32,
}

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct NetstatParams {
	/// `1` when a frame is waiting on the TAP, `0` otherwise.
	pub status: i32,
}

/// Handles a write hypercall on the host. The result of the host `write`
/// goes back verbatim, including a short count.
pub fn write(mem: &MmapMemory, syswrite: &mut WriteParams) {
	let Ok(buf) = mem.host_address(syswrite.buf) else {
		syswrite.len = -1isize as usize;
		return;
	};
	unsafe {
		syswrite.len = libc::write(syswrite.fd, buf as *const libc::c_void, syswrite.len) as usize;
	}
}

/// Handles a read hypercall on the host.
pub fn read(mem: &MmapMemory, sysread: &mut ReadParams) {
	let Ok(buf) = mem.host_address(sysread.buf) else {
		sysread.ret = -1;
		return;
	};
	unsafe {
		let bytes_read = libc::read(sysread.fd, buf as *mut libc::c_void, sysread.len);
		if bytes_read >= 0 {
			sysread.ret = bytes_read;
		} else {
			sysread.ret = -1;
		}
	}
}

/// Handles an open hypercall by opening the file on the host.
pub fn open(mem: &MmapMemory, sysopen: &mut OpenParams) {
	let Ok(name) = mem.host_address(sysopen.name) else {
		sysopen.ret = -1;
		return;
	};
	unsafe {
		sysopen.ret = libc::open(name as *const libc::c_char, sysopen.flags, sysopen.mode);
	}
}

/// Handles a close hypercall. The monitor's standard descriptors are never
/// closed on behalf of the guest.
pub fn close(sysclose: &mut CloseParams) {
	if sysclose.fd > 2 {
		unsafe {
			sysclose.ret = libc::close(sysclose.fd);
		}
	} else {
		sysclose.ret = 0;
	}
}

/// Handles an lseek hypercall on the host.
pub fn lseek(syslseek: &mut LseekParams) {
	unsafe {
		syslseek.offset =
			libc::lseek(syslseek.fd, syslseek.offset as i64, syslseek.whence) as isize;
	}
}

/// Forwards one console byte to the monitor's stdout.
pub fn uart(byte: u8) -> io::Result<()> {
	io::stdout().write_all(&[byte])
}

/// Reports the argument and environment sizes the guest has to reserve.
pub fn cmdsize(path: &OsStr, args: &[String], syssize: &mut CmdsizeParams) {
	syssize.argc = 0;
	syssize.envc = 0;

	// The kernel path is argv[0].
	syssize.argsz[0] = path.len() as i32 + 1;
	for (i, argument) in args.iter().take(MAX_ARGC - 1).enumerate() {
		syssize.argsz[i + 1] = argument.len() as i32 + 1;
	}
	syssize.argc = args.len().min(MAX_ARGC - 1) as i32 + 1;

	let mut counter = 0;
	for (key, value) in std::env::vars_os() {
		if counter >= MAX_ENVC {
			warn!("Environment is too large, remaining variables are not forwarded");
			break;
		}
		syssize.envsz[counter] = (key.len() + value.len()) as i32 + 2;
		counter += 1;
	}
	syssize.envc = counter as i32;
}

fn guest_ptr_array(mem: &MmapMemory, addr: u64, len: usize) -> Option<Vec<u64>> {
	let raw = unsafe { mem.slice_at(addr, len * size_of::<u64>()).ok()? };
	Some(
		raw.chunks_exact(size_of::<u64>())
			.map(|c| u64::from_le_bytes(c.try_into().unwrap()))
			.collect(),
	)
}

fn copy_cstring(mem: &MmapMemory, dest: u64, bytes: &[u8]) {
	if let Ok(slice) = unsafe { mem.slice_at_mut(dest, bytes.len() + 1) } {
		slice[..bytes.len()].copy_from_slice(bytes);
		slice[bytes.len()] = 0;
	} else {
		warn!("cmdval destination {dest:#x} is outside of guest memory");
	}
}

/// Copies the kernel path, the guest arguments and the environment into the
/// destinations the guest reserved after its cmdsize hypercall.
pub fn cmdval(mem: &MmapMemory, path: &OsStr, args: &[String], syscmdval: &CmdvalParams) {
	let argc = args.len().min(MAX_ARGC - 1) + 1;
	let Some(arg_addrs) = guest_ptr_array(mem, syscmdval.argv, argc) else {
		warn!("cmdval argv array is outside of guest memory");
		return;
	};

	copy_cstring(mem, arg_addrs[0], path.as_bytes());
	for (argument, dest) in args.iter().zip(arg_addrs[1..].iter()) {
		copy_cstring(mem, *dest, argument.as_bytes());
	}

	let envc = std::env::vars_os().count().min(MAX_ENVC);
	let Some(env_addrs) = guest_ptr_array(mem, syscmdval.envp, envc) else {
		warn!("cmdval envp array is outside of guest memory");
		return;
	};

	for ((key, value), dest) in std::env::vars_os().take(MAX_ENVC).zip(env_addrs.iter()) {
		let mut entry = Vec::with_capacity(key.len() + value.len() + 1);
		entry.extend_from_slice(key.as_bytes());
		entry.push(b'=');
		entry.extend_from_slice(value.as_bytes());
		copy_cstring(mem, *dest, &entry);
	}
}

/// Reads the guest's exit code from the exit hypercall struct.
pub fn exit_code(mem: &MmapMemory, addr: u64) -> i32 {
	match mem.host_address(addr) {
		Ok(ptr) => unsafe { ptr::read_unaligned(ptr as *const i32) },
		Err(_) => {
			warn!("exit hypercall struct is outside of guest memory");
			libc::EFAULT
		}
	}
}

#[cfg(test)]
mod tests {
	use std::mem::size_of;

	use super::*;

	#[test]
	fn test_param_struct_layouts() {
		assert_eq!(size_of::<WriteParams>(), 4 + 8 + 8);
		assert_eq!(size_of::<ReadParams>(), 4 + 8 + 8 + 8);
		assert_eq!(size_of::<OpenParams>(), 8 + 4 + 4 + 4);
		assert_eq!(size_of::<CloseParams>(), 8);
		assert_eq!(size_of::<LseekParams>(), 4 + 8 + 4);
		assert_eq!(size_of::<ExitParams>(), 4);
		assert_eq!(size_of::<CmdvalParams>(), 16);
		assert_eq!(size_of::<NetinfoParams>(), MAC_STR_LEN);
		assert_eq!(size_of::<NetstatParams>(), 4);
		assert_eq!(
			size_of::<CmdsizeParams>(),
			4 + 4 * MAX_ARGC + 4 + 4 * MAX_ENVC
		);
	}

	#[test]
	fn test_close_spares_standard_descriptors() {
		for fd in 0..=2 {
			let mut params = CloseParams { fd, ret: -1 };
			close(&mut params);
			let ret = params.ret;
			assert_eq!(ret, 0);
		}
	}

	#[test]
	fn test_cmdsize_counts_kernel_path() {
		let mut params = CmdsizeParams {
			argc: 0,
			argsz: [0; MAX_ARGC],
			envc: 0,
			envsz: [0; MAX_ENVC],
		};
		let args = vec!["arg0".to_string(), "seventeen".to_string()];
		cmdsize(OsStr::new("/bin/kernel"), &args, &mut params);

		let argc = params.argc;
		let argsz0 = params.argsz[0];
		let argsz1 = params.argsz[1];
		let argsz2 = params.argsz[2];
		assert_eq!(argc, 3);
		assert_eq!(argsz0, "/bin/kernel".len() as i32 + 1);
		assert_eq!(argsz1, 5);
		assert_eq!(argsz2, 10);
		let envc = params.envc;
		assert_eq!(envc as usize, std::env::vars_os().count().min(MAX_ENVC));
	}

	#[test]
	fn test_exit_code_roundtrip() {
		let mem = MmapMemory::new(0, 0x2000, false, false);
		unsafe {
			mem.slice_at_mut(0x100, 4)
				.unwrap()
				.copy_from_slice(&(-14i32).to_le_bytes());
		}
		assert_eq!(exit_code(&mem, 0x100), -14);
	}

	#[test]
	fn test_cmdval_copies_arguments() {
		let mem = MmapMemory::new(0, 0x4000, false, false);
		// Guest layout: argv array at 0x100 with two entries, the
		// destination buffers at 0x200 and 0x240.
		unsafe {
			mem.slice_at_mut(0x100, 8)
				.unwrap()
				.copy_from_slice(&0x200u64.to_le_bytes());
			mem.slice_at_mut(0x108, 8)
				.unwrap()
				.copy_from_slice(&0x240u64.to_le_bytes());
			// One env destination so the env loop has somewhere to go.
			let envc = std::env::vars_os().count().min(MAX_ENVC);
			for i in 0..envc {
				mem.slice_at_mut(0x1000 + 8 * i as u64, 8)
					.unwrap()
					.copy_from_slice(&(0x2000u64 + 0x40 * i as u64).to_le_bytes());
			}
		}

		let params = CmdvalParams {
			argv: 0x100,
			envp: 0x1000,
		};
		let args = vec!["demo".to_string()];
		cmdval(&mem, OsStr::new("/k"), &args, &params);

		unsafe {
			assert_eq!(mem.slice_at(0x200, 3).unwrap(), b"/k\0");
			assert_eq!(mem.slice_at(0x240, 5).unwrap(), b"demo\0");
		}
	}
}
