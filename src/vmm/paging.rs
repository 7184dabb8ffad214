//! Identity-mapped long mode page tables.
//!
//! One PML4 entry -> one PDPT entry -> a PD with two 2 MiB leaves covering
//! guest physical `[0, 4 MiB)`. Nothing else is allocated; any access above
//! that range faults in the guest.

use bitflags::bitflags;
use log::debug;
use vm_memory::{Bytes, GuestAddress, GuestMemory};

use super::layout::GuestLayout;
use crate::error::Result;

pub const LARGE_PAGE_SIZE: u64 = 0x20_0000;
const HUGE_PAGE_SIZE: u64 = 0x4000_0000;
const IDENTITY_LEAVES: u64 = 2;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const PAGE_SIZE = 1 << 7;
        const GLOBAL = 1 << 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
    const LARGE_ADDR_MASK: u64 = 0x000f_ffff_ffe0_0000;

    /// Non-leaf entry pointing at the next table.
    pub fn table(next: u64) -> Self {
        debug_assert_eq!(next & !Self::ADDR_MASK, 0);
        Self((next & Self::ADDR_MASK) | (PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER).bits())
    }

    /// 2 MiB leaf entry in a page directory.
    pub fn large_page(frame: u64) -> Self {
        debug_assert_eq!(frame % LARGE_PAGE_SIZE, 0);
        let flags = PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER | PteFlags::PAGE_SIZE;
        Self((frame & Self::LARGE_ADDR_MASK) | flags.bits())
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    pub fn is_leaf(self) -> bool {
        self.flags().contains(PteFlags::PAGE_SIZE)
    }

    pub fn addr(self) -> u64 {
        if self.is_leaf() {
            self.0 & Self::LARGE_ADDR_MASK
        } else {
            self.0 & Self::ADDR_MASK
        }
    }
}

/// Writes the paging hierarchy into the data region and returns the CR3 value.
pub fn setup_page_tables<M: GuestMemory>(mem: &M, layout: &GuestLayout) -> Result<u64> {
    let pml4 = layout.pml4_addr();
    let pdpt = layout.pdpt_addr();
    let pd = layout.pd_addr();

    mem.write_obj(PageTableEntry::table(pdpt).raw(), GuestAddress(pml4))?;
    mem.write_obj(PageTableEntry::table(pd).raw(), GuestAddress(pdpt))?;
    for i in 0..IDENTITY_LEAVES {
        let entry = PageTableEntry::large_page(i * LARGE_PAGE_SIZE);
        mem.write_obj(entry.raw(), GuestAddress(pd + i * 8))?;
    }

    debug!("page tables: pml4={:#x} pdpt={:#x} pd={:#x}", pml4, pdpt, pd);
    Ok(pml4)
}

fn read_entry<M: GuestMemory>(mem: &M, table: u64, index: u64) -> Option<PageTableEntry> {
    mem.read_obj::<u64>(GuestAddress(table + index * 8))
        .ok()
        .map(PageTableEntry::from_raw)
}

/// Walks the guest's 4-level tables the way the MMU would, returning the
/// physical address `vaddr` resolves to, or `None` if no present leaf maps it.
pub fn translate<M: GuestMemory>(mem: &M, cr3: u64, vaddr: u64) -> Option<u64> {
    let index = |shift: u32| (vaddr >> shift) & 0x1ff;

    let pml4e = read_entry(mem, cr3 & PageTableEntry::ADDR_MASK, index(39))?;
    if !pml4e.is_present() {
        return None;
    }

    let pdpte = read_entry(mem, pml4e.addr(), index(30))?;
    if !pdpte.is_present() {
        return None;
    }
    if pdpte.is_leaf() {
        let frame = pdpte.raw() & PageTableEntry::ADDR_MASK & !(HUGE_PAGE_SIZE - 1);
        return Some(frame | (vaddr & (HUGE_PAGE_SIZE - 1)));
    }

    let pde = read_entry(mem, pdpte.addr(), index(21))?;
    if !pde.is_present() {
        return None;
    }
    if pde.is_leaf() {
        return Some(pde.addr() | (vaddr & (LARGE_PAGE_SIZE - 1)));
    }

    let pte = read_entry(mem, pde.addr(), index(12))?;
    if !pte.is_present() {
        return None;
    }
    Some(pte.addr() | (vaddr & 0xfff))
}
