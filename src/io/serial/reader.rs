// src/io/serial/reader.rs
//
// Per-device read loop. Runs on a blocking thread, owns its link and its
// reassembler, and stops within one read timeout of the cancel flag being set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;

use super::framer::{FrameEvent, FrameReassembler, FramingConfig};
use super::link::ByteSource;
use super::utils::PortInfo;
use crate::identity::DeviceIdentity;
use crate::schema::Schema;
use crate::store::{PersistenceSink, Record};

/// Longest single sleep between cancel checks
const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    /// Wait after the link opens before the first read
    pub settle_delay: Duration,
    /// Pause after a read that returned nothing
    pub idle_sleep: Duration,
    pub read_buffer_bytes: usize,
}

impl Default for SessionTiming {
    fn default() -> Self {
        SessionTiming {
            settle_delay: Duration::from_millis(1000),
            idle_sleep: Duration::from_millis(100),
            read_buffer_bytes: 256,
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Cancel flag observed
    Stopped,
    /// Link error or panic; the device returns to absent
    Failed(String),
}

/// Sent by every session when its loop ends, so the manager can forget
/// sessions that died on their own.
#[derive(Debug, Clone)]
pub struct SessionExit {
    pub identity: DeviceIdentity,
    pub generation: u64,
    pub reason: ExitReason,
}

/// Everything a session needs besides its link
pub struct SessionContext {
    pub identity: DeviceIdentity,
    pub generation: u64,
    pub schema: Schema,
    pub framing: FramingConfig,
    pub timing: SessionTiming,
    pub sink: Arc<dyn PersistenceSink>,
    pub cancel: Arc<AtomicBool>,
    pub exits: UnboundedSender<SessionExit>,
}

/// Sleep in short slices. Returns true if cancelled before the time ran out.
fn sleep_cancellable(cancel: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}

struct Counters {
    records: u64,
    rejected: u64,
    failed_inserts: u64,
}

fn handle_event(ctx: &SessionContext, event: FrameEvent, counters: &mut Counters) {
    match event {
        FrameEvent::Complete(frame) => {
            if frame.padded {
                tlog!(
                    "[session:{}] Padding partial frame to {} fields",
                    ctx.identity,
                    ctx.schema.len()
                );
            }
            let record = Record {
                device: ctx.identity.clone(),
                values: frame.fields,
                captured_at: chrono::Utc::now(),
            };
            match ctx.sink.insert(&record) {
                Ok(()) => counters.records += 1,
                Err(e) => {
                    counters.failed_inserts += 1;
                    tlog!("[session:{}] Dropped record: {}", ctx.identity, e);
                }
            }
        }
        FrameEvent::Rejected { reason, raw } => {
            counters.rejected += 1;
            tlog!("[session:{}] Discarded {:?}: {}", ctx.identity, raw, reason);
        }
    }
}

/// Blocking session loop.
/// Settle, then read/reassemble/insert until cancelled or the link fails.
/// The link is closed exactly once on every exit path.
pub fn run_session_blocking(ctx: SessionContext, mut link: Box<dyn ByteSource>) -> ExitReason {
    tlog!("[session:{}] Started (generation {})", ctx.identity, ctx.generation);

    let mut reassembler = FrameReassembler::new(&ctx.framing, &ctx.schema);
    let mut buf = vec![0u8; ctx.timing.read_buffer_bytes.max(1)];
    let mut counters = Counters {
        records: 0,
        rejected: 0,
        failed_inserts: 0,
    };

    let reason = if sleep_cancellable(&ctx.cancel, ctx.timing.settle_delay) {
        ExitReason::Stopped
    } else {
        loop {
            if ctx.cancel.load(Ordering::Relaxed) {
                break ExitReason::Stopped;
            }

            match link.read_chunk(&mut buf) {
                Ok(0) => {
                    if sleep_cancellable(&ctx.cancel, ctx.timing.idle_sleep) {
                        break ExitReason::Stopped;
                    }
                }
                Ok(n) => {
                    for event in reassembler.feed(&buf[..n]) {
                        handle_event(&ctx, event, &mut counters);
                    }
                }
                Err(e) => {
                    tlog!("[session:{}] {}", ctx.identity, e);
                    break ExitReason::Failed(e.to_string());
                }
            }
        }
    };

    if let Some(event) = reassembler.flush() {
        handle_event(&ctx, event, &mut counters);
    }
    link.close();

    tlog!(
        "[session:{}] {} after {} records ({} discarded, {} failed inserts)",
        ctx.identity,
        match reason {
            ExitReason::Stopped => "Stopped",
            ExitReason::Failed(_) => "Failed",
        },
        counters.records,
        counters.rejected,
        counters.failed_inserts
    );

    // Receiver gone means the manager is already tearing down
    let _ = ctx.exits.send(SessionExit {
        identity: ctx.identity.clone(),
        generation: ctx.generation,
        reason: reason.clone(),
    });
    reason
}

/// List available serial ports
///
/// On macOS, filters out /dev/tty.* devices and only shows /dev/cu.* devices.
pub fn list_serial_ports() -> Result<Vec<PortInfo>, String> {
    let ports =
        serialport::available_ports().map_err(|e| format!("Failed to enumerate ports: {}", e))?;

    Ok(ports
        .into_iter()
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .map(PortInfo::from)
        .collect())
}
