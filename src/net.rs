//! Bridging the paravirtual network ports to a host TAP device.

use std::{
	fs::File,
	io::Read,
	os::fd::{AsRawFd, BorrowedFd, RawFd},
	sync::{Condvar, Mutex},
};

use log::debug;
use nix::{
	errno::Errno,
	fcntl::{F_GETFL, F_SETFL, OFlag, fcntl},
	poll::{PollFd, PollFlags, PollTimeout, poll},
};
use thiserror::Error;
use tun_tap::{Iface, Mode};

use crate::{
	consts::MAC_STR_LEN,
	hypercall::{NetreadParams, NetwriteParams},
	mem::MmapMemory,
};

#[derive(Error, Debug)]
pub enum NetBridgeError {
	#[error("unable to attach to TAP interface `{0}`")]
	TapAttach(String),
	#[error("`{0}` is not a valid MAC address")]
	InvalidMac(String),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

enum TapBacking {
	/// Interface created (or opened) by name; the `Iface` owns the fd.
	Iface(Iface),
	/// Descriptor inherited from the parent via `@<fd>`; the parent keeps
	/// ownership, so it is never closed here.
	Inherited(RawFd),
}

/// One TAP descriptor shared by all vCPUs. Frame-level serialization is left
/// to the kernel's TAP semantics; the monitor performs exactly one read or
/// write per hypercall.
pub struct NetBridge {
	backing: TapBacking,
	mac: [u8; MAC_STR_LEN],
	/// Gate for the interrupt thread: closed after a frame notification was
	/// injected, reopened once the guest drained the TAP.
	poll_gate: Mutex<bool>,
	drained: Condvar,
}

impl NetBridge {
	/// Attaches to `netif`, which is either an interface name or `@<fd>` for
	/// an already-open TAP descriptor, and switches it to non-blocking mode.
	pub fn new(netif: &str, mac_override: Option<&str>) -> Result<NetBridge, NetBridgeError> {
		let backing = if let Some(fd) = netif.strip_prefix('@') {
			let raw: RawFd = fd
				.parse()
				.map_err(|_| NetBridgeError::TapAttach(netif.to_string()))?;
			TapBacking::Inherited(raw)
		} else {
			let iface = Iface::without_packet_info(netif, Mode::Tap)
				.map_err(|_| NetBridgeError::TapAttach(netif.to_string()))?;
			TapBacking::Iface(iface)
		};

		let bridge = NetBridge {
			backing,
			mac: match mac_override {
				Some(mac) => parse_mac(mac)?,
				None => generate_mac()?,
			},
			poll_gate: Mutex::new(true),
			drained: Condvar::new(),
		};
		set_nonblocking(bridge.raw_fd())?;

		debug!(
			"Network bridge attached, guest MAC {}",
			String::from_utf8_lossy(&bridge.mac[..MAC_STR_LEN - 1])
		);
		Ok(bridge)
	}

	pub fn raw_fd(&self) -> RawFd {
		match &self.backing {
			TapBacking::Iface(iface) => iface.as_raw_fd(),
			TapBacking::Inherited(fd) => *fd,
		}
	}

	/// The guest MAC as a NUL-terminated `xx:xx:xx:xx:xx:xx` string.
	pub fn mac_str(&self) -> &[u8; MAC_STR_LEN] {
		&self.mac
	}

	/// `1` when a frame is waiting on the TAP.
	pub fn poll_readable(&self) -> i32 {
		i32::from(self.wait_readable(PollTimeout::ZERO))
	}

	fn wait_readable(&self, timeout: PollTimeout) -> bool {
		// Safety: the descriptor outlives the borrow; the backing is not
		// dropped while the bridge is alive.
		let fd = unsafe { BorrowedFd::borrow_raw(self.raw_fd()) };
		let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
		matches!(poll(&mut fds, timeout), Ok(n) if n > 0)
			&& fds[0]
				.revents()
				.is_some_and(|r| r.contains(PollFlags::POLLIN))
	}

	/// Sends one frame from guest memory to the TAP.
	pub fn send(&self, mem: &MmapMemory, params: &mut NetwriteParams) {
		let Ok(data) = mem.host_address(params.data) else {
			params.ret = -1;
			return;
		};
		let ret = unsafe { libc::write(self.raw_fd(), data as *const libc::c_void, params.len) };
		if ret >= 0 {
			params.len = ret as usize;
			params.ret = 0;
		} else {
			params.ret = -1;
		}
	}

	/// Receives one frame into guest memory; `-1` when the TAP would block.
	/// Draining the TAP reopens the gate of the interrupt thread.
	pub fn recv(&self, mem: &MmapMemory, params: &mut NetreadParams) {
		let Ok(data) = mem.host_address(params.data) else {
			params.ret = -1;
			return;
		};
		let ret = unsafe { libc::read(self.raw_fd(), data as *mut libc::c_void, params.len) };
		if ret > 0 {
			params.len = ret as usize;
			params.ret = 0;
		} else {
			params.ret = -1;
			let mut open = self.poll_gate.lock().unwrap();
			*open = true;
			self.drained.notify_one();
		}
	}

	/// Blocks until a frame is available *and* the previous notification was
	/// consumed. Used by the interrupt thread: one irqfd trigger per batch of
	/// frames, re-armed when the guest reads until `EAGAIN`.
	pub fn wait_for_frame(&self) {
		let mut open = self.poll_gate.lock().unwrap();
		while !*open {
			open = self.drained.wait(open).unwrap();
		}
		*open = false;
		drop(open);

		while !self.wait_readable(PollTimeout::NONE) {}
	}
}

fn set_nonblocking(fd: RawFd) -> Result<(), NetBridgeError> {
	// Safety: see `wait_readable`.
	let fd = unsafe { BorrowedFd::borrow_raw(fd) };
	let flags = fcntl(fd, F_GETFL).map_err(io_err)?;
	let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
	fcntl(fd, F_SETFL(flags)).map_err(io_err)?;
	Ok(())
}

fn io_err(errno: Errno) -> NetBridgeError {
	NetBridgeError::Io(std::io::Error::from_raw_os_error(errno as i32))
}

/// Parses and re-formats a `xx:xx:xx:xx:xx:xx` MAC string.
fn parse_mac(mac: &str) -> Result<[u8; MAC_STR_LEN], NetBridgeError> {
	let invalid = || NetBridgeError::InvalidMac(mac.to_string());

	let octets = mac
		.split(':')
		.map(|part| {
			if part.len() == 2 {
				u8::from_str_radix(part, 16).map_err(|_| invalid())
			} else {
				Err(invalid())
			}
		})
		.collect::<Result<Vec<u8>, _>>()?;
	let octets: [u8; 6] = octets.try_into().map_err(|_| invalid())?;

	Ok(format_mac(&octets))
}

/// Draws a fresh MAC from the kernel's entropy pool: locally administered,
/// not multicast.
fn generate_mac() -> Result<[u8; MAC_STR_LEN], NetBridgeError> {
	let mut octets = [0u8; 6];
	File::open("/dev/urandom")?.read_exact(&mut octets)?;
	octets[0] = (octets[0] & 0xfe) | 0x02;
	Ok(format_mac(&octets))
}

fn format_mac(octets: &[u8; 6]) -> [u8; MAC_STR_LEN] {
	let formatted = format!(
		"{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
		octets[0], octets[1], octets[2], octets[3], octets[4], octets[5]
	);
	let mut mac = [0u8; MAC_STR_LEN];
	mac[..MAC_STR_LEN - 1].copy_from_slice(formatted.as_bytes());
	mac
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_mac() {
		let mac = parse_mac("52:54:00:ab:cd:ef").unwrap();
		assert_eq!(&mac[..17], b"52:54:00:ab:cd:ef");
		assert_eq!(mac[17], 0);

		// Re-formatting normalizes the case.
		let mac = parse_mac("52:54:00:AB:CD:EF").unwrap();
		assert_eq!(&mac[..17], b"52:54:00:ab:cd:ef");
	}

	#[test]
	fn test_parse_mac_rejects_malformed_input() {
		assert!(parse_mac("").is_err());
		assert!(parse_mac("52:54:00:ab:cd").is_err());
		assert!(parse_mac("52:54:00:ab:cd:ef:01").is_err());
		assert!(parse_mac("5g:54:00:ab:cd:ef").is_err());
		assert!(parse_mac("525400abcdef").is_err());
	}

	#[test]
	fn test_generated_mac_is_locally_administered() {
		let mac = generate_mac().unwrap();
		let first =
			u8::from_str_radix(std::str::from_utf8(&mac[0..2]).unwrap(), 16).unwrap();
		assert_eq!(first & 0x02, 0x02, "locally administered bit");
		assert_eq!(first & 0x01, 0x00, "multicast bit");
		assert_eq!(mac[17], 0);
		for i in [2, 5, 8, 11, 14] {
			assert_eq!(mac[i], b':');
		}
	}
}
