//! Device variants. A profile declares the workers and extra commands a device
//! carries on top of the mandatory ones.

mod camera;
mod master;

pub use camera::{
    controller_name, recorder_name, streamer_name, CameraProfile, CameraSettings, GstMediaFactory, MediaFactory,
};
pub use master::MasterProfile;

use crate::device::{CommandTable, DeviceHandle};
use crate::worker::Worker;

pub trait DeviceProfile: Send + Sized + 'static {
    /// Short label used in logs
    fn kind(&self) -> &'static str;

    /// Profile workers in start order. Called once, while the device is built.
    fn workers(&mut self, device: &DeviceHandle) -> Vec<Box<dyn Worker>>;

    /// Profile commands. Verbs colliding with a built-in are rejected.
    fn commands() -> CommandTable<Self> {
        CommandTable::new()
    }
}
