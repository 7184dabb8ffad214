use kvm_ioctls::VcpuFd;
use log::info;
use std::io::Write;
use vm_memory::GuestMemoryMmap;

use super::{boot, devices::HypercallPorts, event_loop::VmLoop, gdt::BootSegments, kvm_ctx::KvmContext, layout::GuestLayout, memory::GuestMem};
use crate::config::VmmConfig;
use crate::error::Result;
use crate::types::RunReport;


/// One VM with one vCPU. Field order is drop order: the vCPU and VM file
/// descriptors close before the guest memory they reference is unmapped.
pub struct Vmm {
    vcpu: VcpuFd,
    _kvm: KvmContext,
    guest: GuestMem,
    layout: GuestLayout,
}


impl Vmm {
    /// Opens KVM, creates the VM, backs and registers the guest regions,
    /// loads the payload and creates the vCPU.
    pub fn new(layout: GuestLayout, payload: &[u8]) -> Result<Self> {
        layout.validate()?;

        let kvm = KvmContext::new()?;
        let guest = GuestMem::create(&layout)?;
        guest.load_payload(payload)?;
        kvm.register_memory(&guest)?;
        let vcpu = kvm.create_vcpu()?;

        Ok(Self { vcpu, _kvm: kvm, guest, layout })
    }

    pub fn configure_vcpu(&self, segments: &BootSegments) -> Result<()> {
        boot::setup_vcpu(&self.vcpu, &self.guest.mem, &self.layout, segments)
    }

    pub fn run<O: Write, D: Write>(&mut self, vm_loop: &mut VmLoop<O, D>) -> Result<RunReport> {
        vm_loop.run_until_exit(&mut self.vcpu)
    }

    pub fn guest_memory(&self) -> &GuestMemoryMmap {
        &self.guest.mem
    }

    pub fn layout(&self) -> &GuestLayout {
        &self.layout
    }
}


/// Boots `payload` under `config` and relays its output until it halts.
pub fn run_vm<O: Write, D: Write>(config: &VmmConfig, payload: &[u8], stdout: O, diag: D) -> Result<RunReport> {
    let mut vmm = Vmm::new(config.layout.clone(), payload)?;
    vmm.configure_vcpu(&BootSegments::new(&config.layout))?;

    let mut vm_loop = VmLoop::new(HypercallPorts::new(stdout, diag), config.exit_limit);
    let report = vmm.run(&mut vm_loop)?;
    info!("guest halted: {:?}", report);
    Ok(report)
}
