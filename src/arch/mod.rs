//! Architecture specific code.

pub mod x86_64;

use log::{debug, warn};
use sysinfo::System;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("frequency detection failed")]
pub struct FrequencyDetectionFailed;

pub fn detect_freq_from_sysinfo() -> Result<u32, FrequencyDetectionFailed> {
	debug!("Trying to detect CPU frequency using sysinfo");

	let mut system = System::new();
	system.refresh_cpu_frequency();

	let frequency = system
		.cpus()
		.first()
		.ok_or(FrequencyDetectionFailed)?
		.frequency();
	if !system.cpus().iter().all(|cpu| cpu.frequency() == frequency) {
		// The frequency of the first CPU is treated as authoritative.
		warn!("CPU frequencies are not all equal");
	}

	if frequency > 0 {
		Ok(frequency.try_into().unwrap())
	} else {
		Err(FrequencyDetectionFailed)
	}
}

/// The frequency in MHz that gets published in the boot-info block.
pub fn detect_cpu_freq() -> u32 {
	let mhz = {
		let mhz: u32 = detect_freq_from_sysinfo().unwrap_or_else(|_| {
			debug!("Failed to detect using sysinfo");
			let cpuid = raw_cpuid::CpuId::new();
			x86_64::detect_freq_from_cpuid(&cpuid).unwrap_or_else(|_| {
				debug!("Failed to detect from cpuid");
				x86_64::detect_freq_from_cpuid_hypervisor_info(&cpuid).unwrap_or_else(|_| {
					debug!("Failed to detect from hypervisor_info");
					x86_64::get_cpu_frequency_from_os().unwrap_or(0)
				})
			})
		});
		debug!("detected a cpu frequency of {mhz} Mhz");

		mhz
	};
	if mhz == 0 {
		warn!("Unable to determine processor frequency");
	}
	mhz
}

#[cfg(test)]
mod tests {
	#[test]
	fn test_detect_freq_from_sysinfo() {
		// CI machines occasionally report 0 MHz; only the success path is
		// checked for plausibility.
		if let Ok(freq) = super::detect_freq_from_sysinfo() {
			assert!(freq > 0);
			assert!(freq < 10000, "more than 10 GHz is implausible");
		}
	}
}
