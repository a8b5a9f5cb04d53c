// src/io/serial/link.rs
//
// Serial link: an open, configured byte source for one device node.
// Reads are bounded by a timeout so the owning session can notice a stop
// request between reads.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use thiserror::Error;

use super::utils::is_idle;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: serialport::Error,
    },
    #[error("failed to configure {path}: {reason}")]
    Configure { path: PathBuf, reason: String },
    #[error("read error on {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Line settings. Data format is fixed at 8-N-1 without flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    pub baud_rate: u32,
    /// Upper bound on how long one read may block
    pub read_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            baud_rate: 115_200,
            read_timeout: Duration::from_millis(1000),
        }
    }
}

/// An open link as seen by a session.
pub trait ByteSource: Send {
    /// Read whatever is available. `Ok(0)` means the timeout passed without data.
    /// An `Err` is fatal to the session.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, LinkError>;

    /// Release the device. Safe to call more than once.
    fn close(&mut self);
}

/// Opens links for device nodes. The session manager holds one of these.
pub trait LinkOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn ByteSource>, LinkError>;
}

// ============================================================================
// serialport-backed link
// ============================================================================

pub struct SerialLink {
    path: PathBuf,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialLink {
    /// Open in raw mode (serialport's default on unix), 8-N-1, no flow control.
    /// The port is held exclusively until closed.
    pub fn open(path: &Path, config: &LinkConfig) -> Result<SerialLink, LinkError> {
        let name = path.to_string_lossy();
        let port = serialport::new(name.as_ref(), config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(config.read_timeout)
            .open()
            .map_err(|source| LinkError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        // Drop anything the kernel buffered before we were listening
        port.clear(serialport::ClearBuffer::Input)
            .map_err(|e| LinkError::Configure {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        tlog!(
            "[link] Opened {} at {} baud (8-N-1, timeout {}ms)",
            path.display(),
            config.baud_rate,
            config.read_timeout.as_millis()
        );

        Ok(SerialLink {
            path: path.to_path_buf(),
            port: Some(port),
        })
    }
}

impl ByteSource for SerialLink {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        let Some(port) = self.port.as_mut() else {
            return Err(LinkError::Read {
                path: self.path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotConnected, "link closed"),
            });
        };

        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if is_idle(e.kind()) => Ok(0),
            Err(source) => Err(LinkError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            tlog!("[link] Closed {}", self.path.display());
        }
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens real serial ports with one shared line configuration
pub struct SerialOpener {
    config: LinkConfig,
}

impl SerialOpener {
    pub fn new(config: LinkConfig) -> Self {
        SerialOpener { config }
    }
}

impl LinkOpener for SerialOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn ByteSource>, LinkError> {
        Ok(Box::new(SerialLink::open(path, &self.config)?))
    }
}
