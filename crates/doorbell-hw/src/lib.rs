//! doorbell-hw — Hardware abstraction for the doorbell.
//!
//! Provides V4L2-based camera capture and a sysfs GPIO panel for the
//! status lights, the bell button and the door switch.

pub mod camera;
pub mod frame;
pub mod gpio;
pub mod panel;

pub use camera::{Camera, CameraError, PixelFormat};
pub use panel::{EdgeWatcher, GpioPanel, PinMap};
