use bitflags::bitflags;
use kvm_bindings::{kvm_regs, kvm_sregs};
use kvm_ioctls::VcpuFd;
use log::debug;
use vm_memory::{Bytes, GuestAddress, GuestMemory};

use super::gdt::{BootSegments, GDT_BYTES, TSS_BYTES};
use super::layout::GuestLayout;
use super::paging;
use crate::error::{Result, VmmError};


bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr0: u64 {
        const PE = 1 << 0;
        const MP = 1 << 1;
        const ET = 1 << 4;
        const NE = 1 << 5;
        const WP = 1 << 16;
        const AM = 1 << 18;
        const PG = 1 << 31;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr4: u64 {
        const PAE = 1 << 5;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Efer: u64 {
        const LME = 1 << 8;
        const LMA = 1 << 10;
    }
}

/// RFLAGS bit 1 reads as one on every x86 CPU.
pub const RFLAGS_RESERVED: u64 = 1 << 1;

// Offset of the I/O permission bitmap base inside a 64-bit TSS.
const TSS_IOPB_OFFSET: u64 = 102;


/// Writes the GDT and TSS into the data region.
pub fn write_system_tables<M: GuestMemory>(mem: &M, layout: &GuestLayout, segments: &BootSegments) -> Result<()> {
    mem.write_slice(&segments.table(), GuestAddress(layout.gdt_addr()))?;
    // IOPB base past the TSS limit: no I/O bitmap.
    mem.write_obj(TSS_BYTES as u16, GuestAddress(layout.tss_addr() + TSS_IOPB_OFFSET))?;
    Ok(())
}


/// Long mode state on top of whatever defaults KVM reported in `sregs`.
pub fn configure_sregs(sregs: &mut kvm_sregs, layout: &GuestLayout, segments: &BootSegments, cr3: u64) {
    sregs.cr3 = cr3;
    sregs.cr4 = Cr4::PAE.bits();
    sregs.cr0 = (Cr0::PE | Cr0::MP | Cr0::ET | Cr0::NE | Cr0::WP | Cr0::AM | Cr0::PG).bits();
    sregs.efer = (Efer::LME | Efer::LMA).bits();

    sregs.cs = (&segments.code).into();
    let data = (&segments.data).into();
    sregs.ds = data;
    sregs.es = data;
    sregs.fs = data;
    sregs.gs = data;
    sregs.ss = data;
    sregs.tr = (&segments.tss).into();

    sregs.gdt.base = layout.gdt_addr();
    sregs.gdt.limit = GDT_BYTES as u16 - 1;
}


pub fn initial_regs(layout: &GuestLayout) -> kvm_regs {
    kvm_regs {
        rip: layout.entry_point(),
        rsp: layout.stack_top(),
        rflags: RFLAGS_RESERVED,
        ..Default::default()
    }
}


/// Builds page tables and descriptor tables in guest memory and loads the
/// vCPU so its first instruction is the payload's byte 0, in 64-bit mode.
pub fn setup_vcpu<M: GuestMemory>(vcpu: &VcpuFd, mem: &M, layout: &GuestLayout, segments: &BootSegments) -> Result<()> {
    let cr3 = paging::setup_page_tables(mem, layout)?;
    write_system_tables(mem, layout, segments)?;

    let mut sregs = vcpu.get_sregs().map_err(VmmError::GetSregs)?;
    configure_sregs(&mut sregs, layout, segments, cr3);
    vcpu.set_sregs(&sregs).map_err(VmmError::SetSregs)?;

    let regs = initial_regs(layout);
    vcpu.set_regs(&regs).map_err(VmmError::SetRegs)?;

    debug!(
        "vcpu ready: rip={:#x} rsp={:#x} cr0={:#x} cr3={:#x} cr4={:#x} efer={:#x}",
        regs.rip, regs.rsp, sregs.cr0, sregs.cr3, sregs.cr4, sregs.efer
    );
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::gdt::{Segment, CODE_SELECTOR, DATA_SELECTOR, TSS_SELECTOR};
    use crate::vmm::memory::GuestMem;

    #[test]
    fn test_control_registers() {
        let layout = GuestLayout::default();
        let segments = BootSegments::new(&layout);
        let mut sregs = kvm_sregs::default();
        sregs.apic_base = 0xfee0_0900;
        configure_sregs(&mut sregs, &layout, &segments, layout.pml4_addr());

        assert_eq!(sregs.cr0, 0x8005_0033);
        assert_eq!(sregs.cr3, 0x11_f000);
        assert_eq!(sregs.cr4, 0x20);
        assert_eq!(sregs.efer, 0x500);
        // Fields outside the boot state keep their template value.
        assert_eq!(sregs.apic_base, 0xfee0_0900);
    }

    #[test]
    fn test_segment_registers() {
        let layout = GuestLayout::default();
        let segments = BootSegments::new(&layout);
        let mut sregs = kvm_sregs::default();
        configure_sregs(&mut sregs, &layout, &segments, layout.pml4_addr());

        assert_eq!(sregs.cs.selector, CODE_SELECTOR);
        assert_eq!((sregs.cs.l, sregs.cs.db, sregs.cs.g, sregs.cs.type_), (1, 0, 1, 11));
        for seg in [sregs.ds, sregs.es, sregs.fs, sregs.gs, sregs.ss] {
            assert_eq!(seg.selector, DATA_SELECTOR);
            assert_eq!((seg.type_, seg.s, seg.present), (3, 1, 1));
        }
        assert_eq!(sregs.tr.selector, TSS_SELECTOR);
        assert_eq!(sregs.tr.base, layout.tss_addr());
        assert_eq!(sregs.gdt.base, layout.gdt_addr());
        assert_eq!(sregs.gdt.limit, 39);
    }

    #[test]
    fn test_initial_regs() {
        let layout = GuestLayout::default();
        let regs = initial_regs(&layout);
        assert_eq!(regs.rip, 0x10_0000);
        assert_eq!(regs.rsp, 0x11_b000);
        assert_eq!(regs.rflags, 0x2);
        assert_eq!((regs.rax, regs.rbx, regs.rbp), (0, 0, 0));
    }

    #[test]
    fn test_system_tables_in_guest_memory() {
        let layout = GuestLayout::default();
        let gm = GuestMem::create(&layout).unwrap();
        let segments = BootSegments::new(&layout);
        write_system_tables(&gm.mem, &layout, &segments).unwrap();

        let code: u64 = gm.mem.read_obj(GuestAddress(layout.gdt_addr() + 8)).unwrap();
        assert_eq!(code, Segment::code64().descriptor_low());
        let null: u64 = gm.mem.read_obj(GuestAddress(layout.gdt_addr())).unwrap();
        assert_eq!(null, 0);
        let iopb: u16 = gm.mem.read_obj(GuestAddress(layout.tss_addr() + 102)).unwrap();
        assert_eq!(iopb, 104);
    }
}
