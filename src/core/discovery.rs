use std::io;

use serde::Serialize;

use super::{bus::GpibBus, pool::ControllerSlot, settings::Timing};
use crate::{
    protocol::{Candidate, Command, Transport, PRODUCT_SIGNATURE, VERSION_REPLY_LEN},
    utils::sleep_ms,
    GpibError, GpibResult,
};

/// Bytes of the version line read after the signature, for logging only.
const VERSION_TAIL_LEN: usize = 37;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub path: String,
    pub reason: String,
}

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    /// Slots that became Ready during this pass.
    pub opened: Vec<usize>,
    /// Slots whose node was already held open.
    pub already_open: Vec<usize>,
    pub rejected: Vec<Rejection>,
    /// Some candidate was skipped because every slot was taken.
    pub exhausted: bool,
}

enum Handshake {
    Accepted(String),
    Rejected(String),
}

/// Ask for the version string and check it is a Prologix adapter.
///
/// A short first reply gets one more try after flushing the line; a second
/// short reply is a [`GpibError::ShortRead`].
fn handshake(transport: &mut dyn Transport, timeout_ms: u64) -> GpibResult<Handshake> {
    let request = Command::Version.to_bytes();
    let mut reply = [0u8; VERSION_REPLY_LEN];
    let mut received = 0;
    for attempt in 0..2 {
        if attempt > 0 {
            transport.discard()?;
        }
        transport.write(&request)?;
        received = transport.poll_read(&mut reply, timeout_ms)?;
        if received == VERSION_REPLY_LEN {
            break;
        }
    }
    if received < VERSION_REPLY_LEN {
        return Err(GpibError::ShortRead {
            received,
            expected: VERSION_REPLY_LEN,
        });
    }
    if !reply.starts_with(PRODUCT_SIGNATURE) {
        return Ok(Handshake::Rejected(format!(
            "unexpected identity \"{}\"",
            String::from_utf8_lossy(&reply).trim()
        )));
    }

    let mut tail = [0u8; VERSION_TAIL_LEN];
    let n = transport.poll_read(&mut tail, timeout_ms)?;
    let mut version = reply.to_vec();
    version.extend_from_slice(&tail[..n]);
    Ok(Handshake::Accepted(
        String::from_utf8_lossy(&version).trim().to_string(),
    ))
}

/// One-time setup of a freshly opened adapter.
fn initialize(slot: &mut ControllerSlot, timing: &Timing) -> GpibResult<()> {
    slot.command(Command::ControllerMode)?;
    slot.command(Command::InterfaceClear)?;
    sleep_ms(timing.ifc_settle_ms);
    slot.command(Command::ReadTimeout(timing.adapter_read_timeout_ms))?;
    slot.command(Command::Auto(false))?;
    slot.auto_read = false;
    Ok(())
}

impl GpibBus {
    /// Open every adapter that is plugged in but not yet held.
    ///
    /// Already-Ready controllers are left untouched, so this can be called
    /// as often as needed.
    pub fn discover(&mut self) -> GpibResult<DiscoveryReport> {
        let candidates = self.provider.candidates()?;
        let mut report = DiscoveryReport::default();

        for candidate in &candidates {
            if let Some(index) = self.pool.owner_of_node(candidate.node) {
                report.already_open.push(index);
                continue;
            }
            let Some(index) = self.pool.free_slot() else {
                log::warn!(
                    "No free controller slot for {} (capacity {})",
                    candidate.path,
                    self.pool.capacity()
                );
                report.exhausted = true;
                continue;
            };
            match self.try_open(index, candidate) {
                Ok(()) => report.opened.push(index),
                Err(reason) => report.rejected.push(Rejection {
                    path: candidate.path.clone(),
                    reason,
                }),
            }
        }

        if report.opened.is_empty() && report.already_open.is_empty() {
            if report.exhausted {
                return Err(GpibError::ResourceExhausted {
                    capacity: self.pool.capacity(),
                });
            }
            return Err(GpibError::NoAdapterFound);
        }
        Ok(report)
    }

    fn try_open(&mut self, index: usize, candidate: &Candidate) -> Result<(), String> {
        let timing = self.settings.timing.clone();
        let mut transport = match self.provider.open(candidate, self.settings.baud_rate) {
            Ok(transport) => transport,
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                log::warn!("No permission to open {}: {err}", candidate.path);
                return Err(err.to_string());
            }
            Err(err) => {
                log::warn!("Cannot open {}: {err}", candidate.path);
                return Err(err.to_string());
            }
        };

        let version = match handshake(transport.as_mut(), timing.handshake_timeout_ms) {
            Ok(Handshake::Accepted(version)) => version,
            Ok(Handshake::Rejected(reason)) => {
                log::warn!("Rejecting {}: {reason}", candidate.path);
                return Err(reason);
            }
            Err(err) => {
                log::warn!("Handshake with {} failed: {err}", candidate.path);
                return Err(err.to_string());
            }
        };

        log::info!(
            "Controller {index}: {} on {}",
            version,
            candidate.path
        );
        let result = self
            .pool
            .install(index, candidate, transport, version)
            .and_then(|slot| initialize(slot, &timing));
        if let Err(err) = result {
            log::warn!("Initialization of {} failed: {err}", candidate.path);
            self.pool.release(index);
            return Err(err.to_string());
        }
        Ok(())
    }
}
