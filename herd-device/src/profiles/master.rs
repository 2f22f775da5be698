use super::DeviceProfile;
use crate::device::DeviceHandle;
use crate::worker::Worker;

/// Coordinating node: only the mandatory workers and built-in commands
#[derive(Debug, Default)]
pub struct MasterProfile;

impl DeviceProfile for MasterProfile {
    fn kind(&self) -> &'static str {
        "master"
    }

    fn workers(&mut self, _device: &DeviceHandle) -> Vec<Box<dyn Worker>> {
        Vec::new()
    }
}
