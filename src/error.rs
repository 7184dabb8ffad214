use std::path::PathBuf;
use thiserror::Error;

use crate::vmm::layout::LayoutError;

pub type Result<T> = std::result::Result<T, VmmError>;

#[derive(Error, Debug)]
pub enum VmmError {
    #[error("failed to open /dev/kvm: {0}")]
    OpenKvm(#[source] kvm_ioctls::Error),

    #[error("KVM API version mismatch: expected {expected}, found {found}")]
    ApiVersion { expected: i32, found: i32 },

    #[error("failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    #[error("KVM supports {available} memory slots, {required} required")]
    MemorySlots { required: usize, available: usize },

    #[error("failed to allocate guest memory: {0}")]
    GuestMemory(String),

    #[error("guest memory access failed: {0}")]
    GuestAccess(#[from] vm_memory::GuestMemoryError),

    #[error("payload is {size} bytes, code region holds {capacity}")]
    PayloadTooLarge { size: usize, capacity: u64 },

    #[error("failed to register memory slot {slot}: {source}")]
    SetMemoryRegion {
        slot: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    #[error("failed to query vCPU mmap size: {0}")]
    VcpuMmapSize(#[source] kvm_ioctls::Error),

    #[error("vCPU mmap size {size} is smaller than kvm_run ({min})")]
    VcpuMmapTooSmall { size: usize, min: usize },

    #[error("failed to read special registers: {0}")]
    GetSregs(#[source] kvm_ioctls::Error),

    #[error("failed to write special registers: {0}")]
    SetSregs(#[source] kvm_ioctls::Error),

    #[error("failed to write general registers: {0}")]
    SetRegs(#[source] kvm_ioctls::Error),

    #[error("KVM_RUN failed: {0}")]
    Run(#[source] kvm_ioctls::Error),

    #[error("KVM_EXIT_FAIL_ENTRY on cpu {cpu}: hardware_entry_failure_reason = {reason:#x}")]
    FailEntry { reason: u64, cpu: u32 },

    #[error("KVM_EXIT_INTERNAL_ERROR: suberror = {suberror:#x}")]
    InternalError { suberror: u32 },

    #[error("guest did not halt within {0} exits")]
    ExitLimit(u64),

    #[error("invalid guest layout: {0}")]
    Layout(#[from] LayoutError),

    #[error("failed to read layout {path}: {source}")]
    LayoutFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse layout: {0}")]
    LayoutFormat(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
