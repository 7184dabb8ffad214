use serde::{Deserialize, Serialize};

use crate::vmm::layout::GuestLayout;

/// Settings for one run of a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmmConfig {
    /// Guest physical layout shared with the payload build
    pub layout: GuestLayout,
    /// Stop with an error after this many KVM_RUN calls (None = run until halt)
    pub exit_limit: Option<u64>,
}

impl VmmConfig {
    pub fn with_layout(layout: GuestLayout) -> Self {
        Self { layout, ..Default::default() }
    }
}
