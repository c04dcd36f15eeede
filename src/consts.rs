pub const PAGE_SIZE: usize = 0x1000;
pub const GUEST_PAGE_SIZE: u64 = 0x20_0000; /* 2 MB pages in guest */

pub const BOOT_GDT: u64 = 0x1000;
pub const BOOT_PML4: u64 = 0x10000;
pub const BOOT_PDPTE: u64 = 0x11000;
pub const BOOT_PDE: u64 = 0x12000;
pub const MIN_PHYSMEM_SIZE: usize = 0x13000;

pub const BOOT_GDT_NULL: usize = 0;
pub const BOOT_GDT_CODE: usize = 1;
pub const BOOT_GDT_DATA: usize = 2;
pub const BOOT_GDT_MAX: usize = 3;

/// Size of the initial identity mapping built from `BOOT_PDE`.
pub const BOOT_IDENTITY_MAP_SIZE: u64 = 0x2000_0000;

pub const APIC_DEFAULT_BASE: u64 = 0xfee0_0000;

/// Offset of the guest's kernel log ring relative to the kernel image.
pub const KLOG_OFFSET: u64 = 0x5000;

/// Lowest acceptable ELF entry point; everything below is legacy low memory.
pub const KERNEL_SPACE_FLOOR: u64 = 0x10_0000;

/// ELF OS-ABI tag of classic Hermit kernels.
pub const HERMIT_ELFOSABI: u8 = 0x42;

pub const EFER_SCE: u64 = 1; /* System Call Extensions */
pub const EFER_LME: u64 = 1 << 8; /* Long mode enable */
pub const EFER_LMA: u64 = 1 << 10; /* Long mode active (read-only) */
pub const EFER_NXE: u64 = 1 << 11; /* PTE No-Execute bit enable */

/// A 32-bit PC leaves a hole below 4 GiB for devices. Guests larger than
/// `GAP_START` get two memory slots with the gap mprotected on the host.
pub const KVM_32BIT_GAP_START: usize = 0xc000_0000;
pub const KVM_32BIT_GAP_SIZE: usize = 0x3000_0000;

/* The port-I/O hypercall numbers understood by the guest. */
pub const PORT_WRITE: u16 = 0x400;
pub const PORT_OPEN: u16 = 0x440;
pub const PORT_CLOSE: u16 = 0x480;
pub const PORT_READ: u16 = 0x500;
pub const PORT_EXIT: u16 = 0x540;
pub const PORT_LSEEK: u16 = 0x580;
pub const PORT_NETINFO: u16 = 0x600;
pub const PORT_NETWRITE: u16 = 0x640;
pub const PORT_NETREAD: u16 = 0x680;
pub const PORT_NETSTAT: u16 = 0x700;
pub const PORT_CMDSIZE: u16 = 0x740;
pub const PORT_CMDVAL: u16 = 0x780;
pub const PORT_UART: u16 = 0x800;

pub const UHYVE_IRQ_NET: u32 = 11;

pub const MAX_ARGC: usize = 128;
pub const MAX_ENVC: usize = 128;

/// 17 characters plus the terminating NUL.
pub const MAC_STR_LEN: usize = 18;

pub const CHECKPOINT_DIR: &str = "checkpoint";
pub const CHECKPOINT_CONFIG: &str = "checkpoint/chk_config.txt";
