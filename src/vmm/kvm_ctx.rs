use kvm_bindings::{kvm_run, kvm_userspace_memory_region};
use kvm_ioctls::{Kvm, VcpuFd, VmFd};
use log::{debug, info};

use super::memory::GuestMem;
use crate::error::{Result, VmmError};

/// Version the register and `kvm_run` layouts in kvm-bindings are written against.
pub const KVM_API_VERSION: i32 = 12;

/// code, data and user regions each take a slot.
pub const REQUIRED_MEMSLOTS: usize = 3;


pub struct KvmContext {
    pub kvm: Kvm,
    pub vm: VmFd,
}


impl KvmContext {
    pub fn new() -> Result<Self> {
        let kvm = Kvm::new().map_err(VmmError::OpenKvm)?;

        let found = kvm.get_api_version();
        if found != KVM_API_VERSION {
            return Err(VmmError::ApiVersion { expected: KVM_API_VERSION, found });
        }

        let vm = kvm.create_vm().map_err(VmmError::CreateVm)?;

        let available = kvm.get_nr_memslots();
        if available < REQUIRED_MEMSLOTS {
            return Err(VmmError::MemorySlots { required: REQUIRED_MEMSLOTS, available });
        }
        info!("KVM API {}, {} memory slots", found, available);

        Ok(Self { kvm, vm })
    }

    /// Registers every guest region as its own memory slot.
    pub fn register_memory(&self, gm: &GuestMem) -> Result<()> {
        for region in &gm.regions {
            let slot = region.kind.slot();
            let mem_region = kvm_userspace_memory_region {
                slot,
                flags: 0,
                guest_phys_addr: region.base,
                memory_size: region.size,
                userspace_addr: gm.host_address(region)?,
            };
            // SAFETY: the mapping is owned by `gm`, which outlives the VM, and
            // the slot numbers are unique per region kind.
            unsafe { self.vm.set_user_memory_region(mem_region) }
                .map_err(|source| VmmError::SetMemoryRegion { slot, source })?;
            debug!(
                "slot {} ({}): gpa {:#x} size {:#x} -> hva {:#x}",
                slot,
                region.kind.name(),
                mem_region.guest_phys_addr,
                mem_region.memory_size,
                mem_region.userspace_addr
            );
        }
        Ok(())
    }

    /// Creates vCPU 0. kvm-ioctls maps the shared `kvm_run` area for it.
    pub fn create_vcpu(&self) -> Result<VcpuFd> {
        let size = self.kvm.get_vcpu_mmap_size().map_err(VmmError::VcpuMmapSize)?;
        let min = std::mem::size_of::<kvm_run>();
        if size < min {
            return Err(VmmError::VcpuMmapTooSmall { size, min });
        }
        self.vm.create_vcpu(0).map_err(VmmError::CreateVcpu)
    }
}
