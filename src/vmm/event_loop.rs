use kvm_ioctls::{VcpuExit, VcpuFd};
use log::{debug, error, info, warn};
use std::io::Write;

use super::devices::HypercallPorts;
use crate::error::{Result, VmmError};
use crate::types::RunReport;


/// What the run loop needs from a vCPU.
pub trait Vcpu {
    /// KVM_RUN. Blocks until the guest exits to the host.
    fn resume(&mut self) -> std::result::Result<VcpuExit<'_>, kvm_ioctls::Error>;

    /// Sub-error code of the last `KVM_EXIT_INTERNAL_ERROR`.
    fn internal_suberror(&mut self) -> u32;

    /// Logs register state after a fatal exit.
    fn log_state(&self) {}
}


impl Vcpu for VcpuFd {
    fn resume(&mut self) -> std::result::Result<VcpuExit<'_>, kvm_ioctls::Error> {
        self.run()
    }

    fn internal_suberror(&mut self) -> u32 {
        let run = self.get_kvm_run();
        // SAFETY: called right after KVM_EXIT_INTERNAL_ERROR, so `internal`
        // is the active member of the exit union.
        unsafe { run.__bindgen_anon_1.internal.suberror }
    }

    fn log_state(&self) {
        match (self.get_regs(), self.get_sregs()) {
            (Ok(regs), Ok(sregs)) => {
                error!(
                    "regs: rip={:#x} rsp={:#x} rbp={:#x} rflags={:#x}",
                    regs.rip, regs.rsp, regs.rbp, regs.rflags
                );
                error!(
                    "sregs: cr0={:#x} cr3={:#x} cr4={:#x} efer={:#x} cs={:#x}/l={} db={}",
                    sregs.cr0, sregs.cr3, sregs.cr4, sregs.efer, sregs.cs.selector, sregs.cs.l, sregs.cs.db
                );
            }
            (Err(e), _) | (_, Err(e)) => warn!("could not read vcpu state: {}", e),
        }
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Halt,
    /// The exit carries a sub-error code that has to be read back from `kvm_run`.
    InternalError,
}


pub struct VmLoop<O, D> {
    ports: HypercallPorts<O, D>,
    exit_limit: Option<u64>,
    report: RunReport,
}


impl<O: Write, D: Write> VmLoop<O, D> {
    pub fn new(ports: HypercallPorts<O, D>, exit_limit: Option<u64>) -> Self {
        Self { ports, exit_limit, report: RunReport::default() }
    }

    /// Resumes the vCPU until the guest halts or something fatal happens.
    pub fn run_until_exit<V: Vcpu>(&mut self, vcpu: &mut V) -> Result<RunReport> {
        loop {
            if let Some(limit) = self.exit_limit {
                if self.report.resumes >= limit {
                    return Err(VmmError::ExitLimit(limit));
                }
            }
            self.report.resumes += 1;

            let flow = {
                let exit = vcpu.resume().map_err(VmmError::Run)?;
                self.dispatch(exit)
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Halt) => {
                    info!("KVM_EXIT_HLT after {} resumes", self.report.resumes);
                    return Ok(self.report.clone());
                }
                Ok(Flow::InternalError) => {
                    let suberror = vcpu.internal_suberror();
                    vcpu.log_state();
                    return Err(VmmError::InternalError { suberror });
                }
                Err(e @ VmmError::FailEntry { .. }) => {
                    vcpu.log_state();
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn dispatch(&mut self, exit: VcpuExit<'_>) -> Result<Flow> {
        match exit {
            VcpuExit::IoOut(port, data) => {
                self.report.io_exits += 1;
                debug!("KVM_EXIT_IO out port={:#x} size={}", port, data.len());
                if let Some(channel) = self.ports.write(port, data)? {
                    self.report.record_output(channel, data.len());
                }
                Ok(Flow::Continue)
            }
            VcpuExit::IoIn(port, data) => {
                self.report.io_exits += 1;
                debug!("KVM_EXIT_IO in port={:#x} size={} (ignored)", port, data.len());
                Ok(Flow::Continue)
            }
            VcpuExit::Hlt => Ok(Flow::Halt),
            VcpuExit::FailEntry(reason, cpu) => Err(VmmError::FailEntry { reason, cpu }),
            VcpuExit::InternalError => Ok(Flow::InternalError),
            VcpuExit::Shutdown => {
                self.report.ignored_exits += 1;
                warn!("KVM_EXIT_SHUTDOWN");
                Ok(Flow::Continue)
            }
            other => {
                self.report.ignored_exits += 1;
                info!("unhandled exit: {:?}", other);
                Ok(Flow::Continue)
            }
        }
    }

    pub fn ports(&self) -> &HypercallPorts<O, D> {
        &self.ports
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    pub fn into_ports(self) -> HypercallPorts<O, D> {
        self.ports
    }
}
