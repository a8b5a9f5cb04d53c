// src/io/serial/mod.rs
//
// Serial side of a device session.
//
// - link: opening and reading a device node
// - framer: byte stream to schema-sized frames
// - reader: the per-device blocking loop tying the two to the store

pub mod framer;
pub mod link;
pub mod reader;
pub(crate) mod utils;

pub use framer::{FrameEvent, FrameReassembler, FramingConfig, FramingPolicy};
pub use link::{ByteSource, LinkConfig, LinkError, LinkOpener, SerialOpener};
pub use reader::{list_serial_ports, ExitReason, SessionExit, SessionTiming};
pub use utils::PortInfo;
