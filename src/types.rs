use serde::{Deserialize, Serialize};

use crate::vmm::devices::Channel;


/// What a guest did between boot and `hlt`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// KVM_RUN calls, including the one that returned the halt.
    pub resumes: u64,
    pub io_exits: u64,
    pub stdout_bytes: u64,
    pub diag_bytes: u64,
    /// Exits that were only logged (shutdown, MMIO, debug, ...).
    pub ignored_exits: u64,
}


impl RunReport {
    pub fn record_output(&mut self, channel: Channel, len: usize) {
        let len = len as u64;
        match channel {
            Channel::Stdout => self.stdout_bytes += len,
            Channel::Diag => self.diag_bytes += len,
        }
    }
}
