//! Stable device identity
//!
//! The lounge service recognises a receiver by the `id` it announces. It is
//! derived from the primary hardware address so that it survives restarts
//! without any persisted state.

use pmoutils::HardwareAddress;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identity announced by the receiver
pub fn device_identity(configured: Option<&str>) -> String {
    if let Some(id) = configured.map(str::trim).filter(|id| !id.is_empty()) {
        debug!(device_id = id, "Using configured device id");
        return id.to_string();
    }

    match pmoutils::primary_hardware_address() {
        Some(address) => {
            let id = identity_from_hardware(&address);
            debug!(interface = %address.interface, device_id = %id, "Derived device id");
            id.to_string()
        }
        None => {
            warn!("No hardware address available, using a random device id");
            Uuid::new_v4().to_string()
        }
    }
}

/// UUID v5 of `<mac>-<interface>` in the OID namespace
pub fn identity_from_hardware(address: &HardwareAddress) -> Uuid {
    let name = format!("{}-{}", address.mac, address.interface);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}
