//! Scan session handling
//! One session accumulates discovered peripherals, deduplicated by
//! identifier, until its timeout fires or a newer request cancels it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::{Discovery, Peripheral};

/// A single timed scan over a stream of advertisement reports.
///
/// The session only completes at its deadline; there is no early-exit path
/// no matter how quiet the radio goes. Cancellation (a newer scan, or a
/// connect request, since scanning and connecting are mutually exclusive)
/// aborts it with [`Error::ScanSuperseded`].
pub struct ScanSession {
    accumulator: Arc<Mutex<Vec<Peripheral>>>,
    cancel: CancellationToken,
}

impl ScanSession {
    /// Starts a fresh session over a shared accumulator, clearing whatever
    /// a previous session left in it.
    pub fn new(accumulator: Arc<Mutex<Vec<Peripheral>>>) -> Self {
        accumulator.lock().unwrap().clear();
        Self {
            accumulator,
            cancel: CancellationToken::new(),
        }
    }

    /// Token a newer request cancels this session through.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drains advertisement reports until the deadline, deduplicating by
    /// peripheral identifier, and returns the accumulated list.
    pub async fn run(
        &self,
        mut discoveries: mpsc::UnboundedReceiver<Discovery>,
        timeout: Duration,
    ) -> Result<Vec<Peripheral>> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut stream_open = true;

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = self.cancel.cancelled() => {
                    debug!("scan session superseded");
                    return Err(Error::ScanSuperseded);
                }
                discovery = discoveries.recv(), if stream_open => match discovery {
                    Some(discovery) => self.record(discovery),
                    // The discovery stream ending does not end the session;
                    // completion happens only at the deadline.
                    None => stream_open = false,
                }
            }
        }

        let peripherals = self.accumulator.lock().unwrap().clone();
        info!("scan finished with {} peripheral(s)", peripherals.len());
        Ok(peripherals)
    }

    fn record(&self, discovery: Discovery) {
        let mut accumulator = self.accumulator.lock().unwrap();
        if accumulator.iter().all(|p| p.id != discovery.peripheral.id) {
            debug!(
                "discovered {} ({:?}, rssi {:?})",
                discovery.peripheral.id, discovery.peripheral.name, discovery.rssi
            );
            accumulator.push(discovery.peripheral);
        }
    }
}
