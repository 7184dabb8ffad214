//! Minimal KVM monitor: boots a flat payload straight into 64-bit long mode
//! and relays the bytes it writes to I/O ports 0 and 1.

pub mod config;
pub mod error;
pub mod types;
pub mod vmm;


pub use crate::config::VmmConfig;
pub use crate::error::{Result, VmmError};
pub use crate::types::RunReport;
pub use crate::vmm::gdt::{BootSegments, Segment};
pub use crate::vmm::layout::GuestLayout;
pub use crate::vmm::run::{run_vm, Vmm};
