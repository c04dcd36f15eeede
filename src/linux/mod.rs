//! The Linux backend, built on KVM.

pub mod vcpu;
pub mod vm;

use std::sync::LazyLock;

use kvm_bindings::KVM_API_VERSION;
use kvm_ioctls::Kvm;

pub use self::{vcpu::KvmCpu, vm::KvmVm};

pub type HypervisorError = kvm_ioctls::Error;

/// The process-wide handle to `/dev/kvm`.
///
/// Opening the device also pins the API contract: everything in this backend
/// is written against the stable [`KVM_API_VERSION`].
pub static KVM: LazyLock<Kvm> = LazyLock::new(|| {
	let kvm = Kvm::new().expect("unable to open /dev/kvm");
	assert_eq!(
		kvm.get_api_version(),
		KVM_API_VERSION as i32,
		"unsupported KVM API version"
	);
	kvm
});
