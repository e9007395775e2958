//! Per-device bounded delivery queues.
//!
//! Every connected device gets one bounded queue between the router and its
//! transport pump. Sends never block: a device that cannot drain 256 events
//! is dropped and must reconnect, so one slow subscriber cannot stall the
//! others.

use tokio::sync::mpsc;

use tiflis_protocol::Outbound;

/// Default queue capacity per device.
pub const DEVICE_QUEUE_SIZE: usize = 256;

/// Why a sink rejected a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkError {
    /// Queue full — the device is too slow and must be dropped.
    Overflow,
    /// Transport pump already gone.
    Closed,
}

/// Sending half of one device's delivery queue.
pub struct DeviceSink {
    device_id: String,
    tx: mpsc::Sender<Outbound>,
}

impl DeviceSink {
    /// Create a sink and its receiving half for the transport pump.
    pub fn new(device_id: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                device_id: device_id.into(),
                tx,
            },
            rx,
        )
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Non-blocking enqueue.
    pub fn send(&self, frame: Outbound) -> Result<(), SinkError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Overflow,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}
