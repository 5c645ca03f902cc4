//! Transport abstraction for device communication.
//!
//! Real devices answer out-of-band: an outbound report is written, and any
//! response arrives later as an inbound report event. Transports therefore
//! expose a write call plus a broadcast subscription for inbound reports, so
//! real HID handles, serial ports and mock devices share one interface.

use crate::error::{Error, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Capacity of an inbound report broadcast channel.
pub const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// A report received from the device.
///
/// For HID transports `data` excludes the report id byte. Byte-stream
/// transports deliver raw chunks with `report_id == 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundReport {
    pub report_id: u8,
    pub data: Vec<u8>,
}

impl InboundReport {
    pub fn new(report_id: u8, data: Vec<u8>) -> Self {
        Self { report_id, data }
    }
}

/// Physical link class of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Report-based USB HID.
    Hid,
    /// Byte stream (USB CDC serial).
    Serial,
}

/// Abstraction over an open-able device link.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable identity of the physical link (HID path, TTY path).
    fn id(&self) -> &str;

    fn kind(&self) -> TransportKind {
        TransportKind::Hid
    }

    fn is_open(&self) -> bool;

    async fn open(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Write one outbound report. Serial transports ignore `report_id` and
    /// write `data` verbatim.
    async fn send_report(&self, report_id: u8, data: &[u8]) -> Result<()>;

    /// Subscribe to inbound reports from this point on.
    fn subscribe(&self) -> broadcast::Receiver<InboundReport>;

    /// Input report ids declared by the device, empty when unknown.
    fn input_report_ids(&self) -> Vec<u8> {
        Vec::new()
    }
}

/// Write a report after checking the transport is open.
pub async fn write_report(transport: &dyn Transport, report_id: u8, data: &[u8]) -> Result<()> {
    if !transport.is_open() {
        return Err(Error::TransportNotOpen(transport.id().to_string()));
    }
    trace!(
        transport = transport.id(),
        report_id = format_args!("0x{:02X}", report_id),
        report_hex = format_args!("{:02X?}", data),
        "TX"
    );
    transport.send_report(report_id, data).await
}

/// Background task feeding inbound reports into a handler.
///
/// The subscription is taken when the listener is created, so reports sent in
/// reply to a request written afterwards are never missed. Dropping the
/// listener stops the task.
pub struct ReportListener {
    task: JoinHandle<()>,
}

impl ReportListener {
    pub fn spawn<F>(transport: &dyn Transport, mut handler: F) -> Self
    where
        F: FnMut(&InboundReport) + Send + 'static,
    {
        let mut rx = transport.subscribe();
        let transport_id = transport.id().to_string();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(report) => {
                        trace!(
                            transport = %transport_id,
                            report_id = format_args!("0x{:02X}", report.report_id),
                            report_hex = format_args!("{:02X?}", report.data),
                            "RX"
                        );
                        handler(&report);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(transport = %transport_id, skipped, "Inbound reports dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(transport = %transport_id, "Inbound report stream closed");
                        break;
                    }
                }
            }
        });
        Self { task }
    }
}

impl Drop for ReportListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A mock transport for testing.
///
/// Records every outbound report and answers it through a scripted responder,
/// emitting the responder's output as inbound report events.
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    type Responder = Box<dyn FnMut(u8, &[u8]) -> Vec<InboundReport> + Send>;

    pub struct MockTransport {
        id: String,
        kind: TransportKind,
        open: AtomicBool,
        fail_writes: AtomicBool,
        input_ids: Vec<u8>,
        tx: broadcast::Sender<InboundReport>,
        sent: Mutex<Vec<(u8, Vec<u8>)>>,
        responder: Mutex<Option<Responder>>,
    }

    impl MockTransport {
        pub fn new(id: &str) -> Self {
            let (tx, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
            Self {
                id: id.to_string(),
                kind: TransportKind::Hid,
                open: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
                input_ids: Vec::new(),
                tx,
                sent: Mutex::new(Vec::new()),
                responder: Mutex::new(None),
            }
        }

        pub fn serial(id: &str) -> Self {
            Self {
                kind: TransportKind::Serial,
                ..Self::new(id)
            }
        }

        pub fn with_input_report_ids(mut self, ids: &[u8]) -> Self {
            self.input_ids = ids.to_vec();
            self
        }

        /// Install the function answering outbound reports.
        pub fn on_report<F>(&self, responder: F)
        where
            F: FnMut(u8, &[u8]) -> Vec<InboundReport> + Send + 'static,
        {
            *self.responder.lock().unwrap() = Some(Box::new(responder));
        }

        /// Emit an unsolicited inbound report.
        pub fn emit(&self, report: InboundReport) {
            let _ = self.tx.send(report);
        }

        pub fn set_fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }

        /// Simulate the host platform invalidating the device.
        pub fn unplug(&self) {
            self.open.store(false, Ordering::SeqCst);
        }

        pub fn sent(&self) -> Vec<(u8, Vec<u8>)> {
            self.sent.lock().unwrap().clone()
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        pub fn clear_sent(&self) {
            self.sent.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn open(&self) -> Result<()> {
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn send_report(&self, report_id: u8, data: &[u8]) -> Result<()> {
            if !self.is_open() {
                return Err(Error::TransportNotOpen(self.id.clone()));
            }
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Error::WriteFailed("mock: write rejected".into()));
            }
            self.sent.lock().unwrap().push((report_id, data.to_vec()));
            let responses = match self.responder.lock().unwrap().as_mut() {
                Some(responder) => responder(report_id, data),
                None => Vec::new(),
            };
            for report in responses {
                let _ = self.tx.send(report);
            }
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<InboundReport> {
            self.tx.subscribe()
        }

        fn input_report_ids(&self) -> Vec<u8> {
            self.input_ids.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn write_report_rejects_closed_transport() {
        let mock = MockTransport::new("hid-0");
        let result = write_report(&mock, 0x07, &[0x01]).await;
        assert!(matches!(result, Err(Error::TransportNotOpen(_))));
        assert_eq!(mock.sent_count(), 0);
    }

    #[tokio::test]
    async fn write_report_records_and_echoes() {
        let mock = MockTransport::new("hid-0");
        mock.open().await.unwrap();
        mock.on_report(|id, data| vec![InboundReport::new(id, data.to_vec())]);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let _listener = ReportListener::spawn(&mock, move |r| sink.lock().unwrap().push(r.clone()));

        write_report(&mock, 0x07, &[0xAA, 0x0A]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(mock.sent(), vec![(0x07, vec![0xAA, 0x0A])]);
        assert_eq!(
            received.lock().unwrap().as_slice(),
            &[InboundReport::new(0x07, vec![0xAA, 0x0A])]
        );
    }

    #[tokio::test]
    async fn dropped_listener_stops_receiving() {
        let mock = MockTransport::new("hid-0");
        mock.open().await.unwrap();

        let received = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&received);
        let listener = ReportListener::spawn(&mock, move |_| *sink.lock().unwrap() += 1);
        mock.emit(InboundReport::new(1, vec![1]));
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(listener);
        mock.emit(InboundReport::new(1, vec![2]));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*received.lock().unwrap(), 1);
    }
}
