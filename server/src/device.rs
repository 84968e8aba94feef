use crate::error::{Result, ServerErr};

/// Devices this build can actually allocate on.
const AVAILABLE: &[&str] = &["cpu"];

/// Probe-before-commit device validation.
///
/// With no accelerator backend in this build, the probe is a
/// membership check against the devices the process can serve.
///
/// # Returns
/// `DeviceUnavailable` if `device` cannot be used.
pub fn probe(device: &str) -> Result<()> {
    if AVAILABLE.contains(&device) {
        Ok(())
    } else {
        Err(ServerErr::DeviceUnavailable {
            device: device.to_string(),
        })
    }
}
