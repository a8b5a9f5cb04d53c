// src/io/mod.rs
//
// Device-facing I/O: hotplug detection and the serial session path.

pub mod hotplug;
pub mod serial;

pub use hotplug::{HotplugIntent, HotplugWatcher, WatchError};
