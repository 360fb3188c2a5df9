use serde::{Deserialize, Serialize};

/// Address of a companion computer on the telemetry link.
pub type ComponentId = u8;

/// "No device" value of the current selection.
pub const NO_DEVICE: ComponentId = 0;

/// Vendor id reported by the vendor's own guidance module.
pub const VENDOR_MODULE_ID: u16 = 0xF4;

/// Capability and version record published by a companion computer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanionInfo {
    pub capabilities: u64,
    pub uid: u64,
    pub firmware_version: u32,
    pub middleware_version: u32,
    pub os_version: u32,
    pub hardware_version: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub firmware_version_hash: String,
    pub middleware_version_hash: String,
    pub os_version_hash: String,
}

impl CompanionInfo {
    pub fn is_vendor_module(&self) -> bool {
        self.vendor_id == VENDOR_MODULE_ID
    }
}
