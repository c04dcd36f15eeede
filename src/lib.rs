//! minihyve — a minimal hypervisor monitor for classic Hermit unikernels.
//!
//! The monitor owns exactly one hardware-accelerated VM: it loads a
//! statically linked 64-bit kernel image into guest physical memory, runs one
//! host thread per configured vCPU and mediates a small set of host services
//! through a paravirtual port-I/O interface. Periodic checkpoints and the
//! matching restore path allow a guest to be killed and resumed.

#[macro_use]
extern crate log;

pub mod arch;
pub mod boot_info;
pub mod checkpoint;
pub mod consts;
pub mod hypercall;
pub mod mem;
pub mod net;
pub mod paging;
pub mod params;
pub mod vcpu;
pub mod vm;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod linux;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use linux as os;

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("the monitor requires x86_64 Linux with KVM");

pub use crate::vm::{DefaultBackend, MonitorVm};
