//! Guest physical address space contract.
//!
//! The same structure is exported as JSON (`tinyvmm --print-layout`) so the
//! payload build links against exactly the addresses the monitor sets up.
//!
//! ```text
//!   0x000000 +-----------+  user  (reserved)
//!            |           |
//!   0x100000 +-----------+  code  <- RIP
//!            |  payload  |
//!   0x110000 +-----------+  data
//!            |   free    |
//!            |   stack   |  grows down from the TSS page
//!            |    TSS    |
//!            |    GDT    |
//!            |    PD     |
//!            |   PDPT    |
//!            |   PML4    |
//!   0x120000 +-----------+
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::error::{Result, VmmError};

pub const LAYOUT_VERSION: u32 = 1;

pub const PAGE_SIZE: u64 = 0x1000;
/// Extent of the identity map built by the page table builder (two 2 MiB pages).
pub const IDENTITY_MAP_SIZE: u64 = 0x40_0000;

pub const PAGING_SIZE: u64 = 3 * PAGE_SIZE;
pub const GDT_SIZE: u64 = PAGE_SIZE;
pub const TSS_SIZE: u64 = PAGE_SIZE;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LayoutError {
    #[error("unsupported layout version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("{0} region is empty")]
    EmptyRegion(&'static str),

    #[error("{region} region is not page aligned (base {base:#x}, size {size:#x})")]
    Misaligned { region: &'static str, base: u64, size: u64 },

    #[error("{0} and {1} regions overlap")]
    Overlap(&'static str, &'static str),

    #[error("{region} region ends at {end:#x}, past the {limit:#x} identity map")]
    OutsideIdentityMap { region: &'static str, end: u64, limit: u64 },

    #[error("stack size {0:#x} must be a non-zero multiple of the page size")]
    StackSize(u64),

    #[error("data region holds {size:#x} bytes, needs {required:#x} for paging, GDT, TSS and stack")]
    DataTooSmall { size: u64, required: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSpec {
    pub base: u64,
    pub size: u64,
}

impl RegionSpec {
    pub const fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    pub const fn end(&self) -> u64 {
        self.base + self.size
    }

    fn overlaps(&self, other: &RegionSpec) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Code,
    Data,
    User,
}

impl RegionKind {
    pub fn name(self) -> &'static str {
        match self {
            RegionKind::Code => "code",
            RegionKind::Data => "data",
            RegionKind::User => "user",
        }
    }

    /// KVM memory slot the region is registered under.
    pub fn slot(self) -> u32 {
        match self {
            RegionKind::Code => 0,
            RegionKind::Data => 1,
            RegionKind::User => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestRegion {
    pub kind: RegionKind,
    pub base: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestLayout {
    pub version: u32,
    pub code: RegionSpec,
    pub data: RegionSpec,
    pub user: RegionSpec,
    pub stack_size: u64,
}

impl Default for GuestLayout {
    fn default() -> Self {
        Self {
            version: LAYOUT_VERSION,
            code: RegionSpec::new(0x10_0000, 0x1_0000),
            data: RegionSpec::new(0x11_0000, 0x1_0000),
            user: RegionSpec::new(0x0, 0x1_0000),
            stack_size: 0x2000,
        }
    }
}

impl GuestLayout {
    pub fn regions(&self) -> [GuestRegion; 3] {
        let region = |kind, spec: &RegionSpec| GuestRegion { kind, base: spec.base, size: spec.size };
        [
            region(RegionKind::Code, &self.code),
            region(RegionKind::Data, &self.data),
            region(RegionKind::User, &self.user),
        ]
    }

    pub fn entry_point(&self) -> u64 {
        self.code.base
    }

    pub fn pml4_addr(&self) -> u64 {
        self.data.end() - PAGE_SIZE
    }

    pub fn pdpt_addr(&self) -> u64 {
        self.pml4_addr() - PAGE_SIZE
    }

    pub fn pd_addr(&self) -> u64 {
        self.pdpt_addr() - PAGE_SIZE
    }

    pub fn gdt_addr(&self) -> u64 {
        self.pd_addr() - GDT_SIZE
    }

    pub fn tss_addr(&self) -> u64 {
        self.gdt_addr() - TSS_SIZE
    }

    /// Initial RSP. The stack sits right below the TSS page.
    pub fn stack_top(&self) -> u64 {
        self.tss_addr()
    }

    pub fn stack_bottom(&self) -> u64 {
        self.stack_top() - self.stack_size
    }

    pub fn validate(&self) -> std::result::Result<(), LayoutError> {
        if self.version != LAYOUT_VERSION {
            return Err(LayoutError::UnsupportedVersion {
                found: self.version,
                expected: LAYOUT_VERSION,
            });
        }

        let regions = self.regions();
        for r in &regions {
            let name = r.kind.name();
            if r.size == 0 {
                return Err(LayoutError::EmptyRegion(name));
            }
            if r.base % PAGE_SIZE != 0 || r.size % PAGE_SIZE != 0 {
                return Err(LayoutError::Misaligned { region: name, base: r.base, size: r.size });
            }
            match r.base.checked_add(r.size) {
                Some(end) if end <= IDENTITY_MAP_SIZE => {}
                _ => {
                    return Err(LayoutError::OutsideIdentityMap {
                        region: name,
                        end: r.base.saturating_add(r.size),
                        limit: IDENTITY_MAP_SIZE,
                    })
                }
            }
        }

        for (i, a) in regions.iter().enumerate() {
            for b in &regions[i + 1..] {
                let (sa, sb) = (RegionSpec::new(a.base, a.size), RegionSpec::new(b.base, b.size));
                if sa.overlaps(&sb) {
                    return Err(LayoutError::Overlap(a.kind.name(), b.kind.name()));
                }
            }
        }

        if self.stack_size == 0 || self.stack_size % PAGE_SIZE != 0 {
            return Err(LayoutError::StackSize(self.stack_size));
        }

        let required = PAGING_SIZE + GDT_SIZE + TSS_SIZE + self.stack_size;
        if self.data.size < required {
            return Err(LayoutError::DataTooSmall { size: self.data.size, required });
        }

        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let layout: GuestLayout = serde_json::from_str(json)?;
        layout.validate()?;
        Ok(layout)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|source| VmmError::LayoutFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
