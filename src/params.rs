//! Monitor configuration, collected from `HERMIT_*` environment variables.

use std::{
	env,
	net::Ipv4Addr,
	num::{NonZeroU32, NonZeroUsize},
};

use byte_unit::Byte;
use thiserror::Error;

use crate::consts::MIN_PHYSMEM_SIZE;

#[derive(Error, Debug)]
pub enum ParamsError {
	#[error("invalid value `{value}` for {var}")]
	InvalidValue { var: &'static str, value: String },
	#[error("guest memory size must be at least {MIN_PHYSMEM_SIZE:#x} bytes")]
	MemoryTooSmall,
}

/// Runtime parameters of the VM.
///
/// Everything except the kernel path and the guest arguments comes from the
/// environment, matching the interface of the classic monitor.
#[derive(Debug, Clone)]
pub struct Params {
	/// Guest memory size in bytes (`HERMIT_MEM`).
	pub memory_size: NonZeroUsize,
	/// Number of vCPUs (`HERMIT_CPUS`).
	pub cpu_count: NonZeroU32,
	/// Announce the UART port to the guest (`HERMIT_VERBOSE`).
	pub verbose: bool,
	/// Advise the kernel to merge identical pages (`HERMIT_MERGEABLE`).
	pub ksm: bool,
	/// Advise the kernel to back the guest with huge pages (`HERMIT_HUGEPAGE`).
	pub thp: bool,
	/// Seconds between snapshots; `0` disables checkpointing (`HERMIT_CHECKPOINT`).
	pub checkpoint_interval: u32,
	/// Dump every page instead of the incremental delta (`HERMIT_FULLCHECKPOINT`).
	pub full_checkpoint: bool,
	/// Use the KVM dirty bitmap instead of the guest page-table walk
	/// (`HERMIT_DIRTY_LOG`).
	pub dirty_log: bool,
	/// Guest network configuration, forwarded through the boot info block.
	pub ip: Option<Ipv4Addr>,
	pub gateway: Option<Ipv4Addr>,
	pub mask: Option<Ipv4Addr>,
	/// TAP interface name, or `@<fd>` to inherit an open descriptor (`HERMIT_NETIF`).
	pub netif: Option<String>,
	/// Override for the generated guest MAC (`HERMIT_NETIF_MAC`).
	pub mac: Option<String>,
	/// Arguments forwarded to the guest via the cmdline hypercalls.
	pub kernel_args: Vec<String>,
}

impl Default for Params {
	fn default() -> Self {
		Self {
			memory_size: NonZeroUsize::new(512 * 1024 * 1024).unwrap(),
			cpu_count: NonZeroU32::new(1).unwrap(),
			verbose: false,
			ksm: false,
			thp: false,
			checkpoint_interval: 0,
			full_checkpoint: false,
			dirty_log: false,
			ip: None,
			gateway: None,
			mask: None,
			netif: None,
			mac: None,
			kernel_args: Vec::new(),
		}
	}
}

impl Params {
	/// Reads all `HERMIT_*` variables from the process environment.
	pub fn from_env() -> Result<Self, ParamsError> {
		let mut params = Params::default();

		if let Some(mem) = env_var("HERMIT_MEM") {
			params.memory_size = parse_memory("HERMIT_MEM", &mem)?;
		}
		if let Some(cpus) = env_var("HERMIT_CPUS") {
			params.cpu_count = cpus
				.parse::<u32>()
				.ok()
				.and_then(NonZeroU32::new)
				.ok_or(ParamsError::InvalidValue {
					var: "HERMIT_CPUS",
					value: cpus,
				})?;
		}

		params.verbose = env_flag("HERMIT_VERBOSE");
		params.ksm = env_flag("HERMIT_MERGEABLE");
		params.thp = env_flag("HERMIT_HUGEPAGE");
		params.full_checkpoint = env_flag("HERMIT_FULLCHECKPOINT");
		params.dirty_log = env_flag("HERMIT_DIRTY_LOG");

		if let Some(secs) = env_var("HERMIT_CHECKPOINT") {
			params.checkpoint_interval =
				secs.parse().map_err(|_| ParamsError::InvalidValue {
					var: "HERMIT_CHECKPOINT",
					value: secs,
				})?;
		}

		params.ip = parse_addr("HERMIT_IP")?;
		params.gateway = parse_addr("HERMIT_GATEWAY")?;
		params.mask = parse_addr("HERMIT_MASK")?;
		params.netif = env_var("HERMIT_NETIF");
		params.mac = env_var("HERMIT_NETIF_MAC");

		Ok(params)
	}
}

fn env_var(var: &str) -> Option<String> {
	env::var(var).ok().filter(|v| !v.is_empty())
}

/// `0` and an unset variable both mean "off"; anything else means "on".
fn env_flag(var: &str) -> bool {
	env_var(var).is_some_and(|v| v != "0")
}

fn parse_memory(var: &'static str, value: &str) -> Result<NonZeroUsize, ParamsError> {
	// The classic single-letter suffixes are binary: `64M` is 64 MiB.
	let normalized = match value.as_bytes().last() {
		Some(b'K' | b'k' | b'M' | b'm' | b'G' | b'g' | b'T' | b't' | b'P' | b'p' | b'E'
		| b'e') => format!("{value}iB"),
		_ => value.to_string(),
	};
	let bytes = Byte::parse_str(&normalized, true)
		.map_err(|_| ParamsError::InvalidValue {
			var,
			value: value.to_string(),
		})?
		.as_u64() as usize;

	if bytes < MIN_PHYSMEM_SIZE {
		return Err(ParamsError::MemoryTooSmall);
	}

	// KVM wants page-granular memory slots.
	NonZeroUsize::new(bytes & !0xfff).ok_or(ParamsError::MemoryTooSmall)
}

fn parse_addr(var: &'static str) -> Result<Option<Ipv4Addr>, ParamsError> {
	match env_var(var) {
		Some(value) => value
			.parse()
			.map(Some)
			.map_err(|_| ParamsError::InvalidValue { var, value }),
		None => Ok(None),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_memory_suffixes() {
		assert_eq!(
			parse_memory("HERMIT_MEM", "64M").unwrap().get(),
			64 * 1024 * 1024
		);
		assert_eq!(
			parse_memory("HERMIT_MEM", "5G").unwrap().get(),
			5 * 1024 * 1024 * 1024
		);
		assert_eq!(
			parse_memory("HERMIT_MEM", "1024K").unwrap().get(),
			1024 * 1024
		);
	}

	#[test]
	fn test_parse_memory_rejects_garbage() {
		assert!(parse_memory("HERMIT_MEM", "lots").is_err());
		assert!(parse_memory("HERMIT_MEM", "4K").is_err());
	}

	#[test]
	fn test_default_params() {
		let params = Params::default();
		assert_eq!(params.cpu_count.get(), 1);
		assert_eq!(params.checkpoint_interval, 0);
		assert!(!params.full_checkpoint);
		assert!(params.netif.is_none());
	}
}
