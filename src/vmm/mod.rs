pub mod layout;
pub mod paging;
pub mod gdt;
pub mod memory;
pub mod kvm_ctx;
pub mod boot;
pub mod devices;
pub mod event_loop;
pub mod run;
