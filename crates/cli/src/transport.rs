//! Real transports: hidapi devices and USB serial TTYs.
//!
//! Both run a blocking reader thread that forwards everything the device
//! sends into the broadcast channel adapters subscribe to.

use async_trait::async_trait;
use open_peq_core::error::{Error, Result};
use open_peq_core::transport::INBOUND_CHANNEL_CAPACITY;
use open_peq_core::{InboundReport, Transport, TransportKind};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Output reports shorter than this are zero-padded.
const HID_REPORT_SIZE: usize = 64;
const HID_READ_TIMEOUT_MS: i32 = 20;
const SERIAL_IDLE_PAUSE: Duration = Duration::from_millis(10);
/// termios VTIME, in tenths of a second.
#[cfg(unix)]
const SERIAL_READ_TIMEOUT_DS: u8 = 1;

/// A hidapi device with a background reader.
pub struct HidDeviceTransport {
    path: String,
    device: Arc<Mutex<Option<hidapi::HidDevice>>>,
    open: Arc<AtomicBool>,
    /// Set once the host writes report id 0; inbound reports then carry no
    /// id byte either.
    unnumbered: Arc<AtomicBool>,
    input_ids: Arc<Mutex<BTreeSet<u8>>>,
    tx: broadcast::Sender<InboundReport>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl HidDeviceTransport {
    /// `input_ids` are report ids known to be device-to-host; ids seen on
    /// inbound reports are added as they arrive.
    pub fn new(path: &str, input_ids: &[u8]) -> Self {
        let (tx, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        Self {
            path: path.to_string(),
            device: Arc::new(Mutex::new(None)),
            open: Arc::new(AtomicBool::new(false)),
            unnumbered: Arc::new(AtomicBool::new(false)),
            input_ids: Arc::new(Mutex::new(input_ids.iter().copied().collect())),
            tx,
            reader: Mutex::new(None),
        }
    }

    fn spawn_reader(&self) -> JoinHandle<()> {
        let device = Arc::clone(&self.device);
        let open = Arc::clone(&self.open);
        let unnumbered = Arc::clone(&self.unnumbered);
        let input_ids = Arc::clone(&self.input_ids);
        let tx = self.tx.clone();
        let path = self.path.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; HID_REPORT_SIZE + 1];
            while open.load(Ordering::SeqCst) {
                let read = match device.lock().as_ref() {
                    Some(d) => d.read_timeout(&mut buf, HID_READ_TIMEOUT_MS),
                    None => break,
                };
                let n = match read {
                    Ok(0) => continue,
                    Ok(n) => n,
                    Err(e) => {
                        warn!(path = %path, error = %e, "HID read failed, closing");
                        open.store(false, Ordering::SeqCst);
                        break;
                    }
                };
                let report = if unnumbered.load(Ordering::SeqCst) {
                    InboundReport::new(0, buf[..n].to_vec())
                } else {
                    input_ids.lock().insert(buf[0]);
                    InboundReport::new(buf[0], buf[1..n].to_vec())
                };
                let _ = tx.send(report);
            }
            debug!(path = %path, "HID reader stopped");
        })
    }
}

#[async_trait]
impl Transport for HidDeviceTransport {
    fn id(&self) -> &str {
        &self.path
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn open(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let api = hidapi::HidApi::new().map_err(|e| Error::Hid(format!("hidapi init: {e}")))?;
        let path = CString::new(self.path.as_str())
            .map_err(|_| Error::DeviceNotFound(self.path.clone()))?;
        let device = api
            .open_path(&path)
            .map_err(|e| Error::Hid(format!("open {}: {e}", self.path)))?;
        *self.device.lock() = Some(device);
        self.open.store(true, Ordering::SeqCst);
        *self.reader.lock() = Some(self.spawn_reader());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            let _ = reader.join();
        }
        *self.device.lock() = None;
        Ok(())
    }

    async fn send_report(&self, report_id: u8, data: &[u8]) -> Result<()> {
        if report_id == 0 {
            self.unnumbered.store(true, Ordering::SeqCst);
        }
        let mut buf = Vec::with_capacity(HID_REPORT_SIZE + 1);
        buf.push(report_id);
        buf.extend_from_slice(data);
        if buf.len() < HID_REPORT_SIZE + 1 {
            buf.resize(HID_REPORT_SIZE + 1, 0);
        }
        let guard = self.device.lock();
        let device = guard
            .as_ref()
            .ok_or_else(|| Error::TransportNotOpen(self.path.clone()))?;
        device
            .write(&buf)
            .map_err(|e| Error::WriteFailed(format!("hid write: {e}")))?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<InboundReport> {
        self.tx.subscribe()
    }

    fn input_report_ids(&self) -> Vec<u8> {
        self.input_ids.lock().iter().copied().collect()
    }
}

/// Raw mode with a bounded read: `read()` returns after at most
/// `SERIAL_READ_TIMEOUT_DS` tenths of a second so the reader can notice close.
#[cfg(unix)]
fn configure_line(port: &File, path: &str) {
    use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, SpecialCharacterIndices};

    let applied = tcgetattr(port).and_then(|mut termios| {
        cfmakeraw(&mut termios);
        termios.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        termios.control_chars[SpecialCharacterIndices::VTIME as usize] = SERIAL_READ_TIMEOUT_DS;
        tcsetattr(port, SetArg::TCSANOW, &termios)
    });
    if let Err(e) = applied {
        // Not a TTY; reads block as long as the file itself does.
        debug!(path, error = %e, "Line settings not applied");
    }
}

#[cfg(not(unix))]
fn configure_line(_port: &File, _path: &str) {}

/// A USB CDC serial device opened as a plain file.
pub struct SerialTransport {
    path: String,
    port: Mutex<Option<File>>,
    open: Arc<AtomicBool>,
    tx: broadcast::Sender<InboundReport>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SerialTransport {
    pub fn new(path: &str) -> Self {
        let (tx, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        Self {
            path: path.to_string(),
            port: Mutex::new(None),
            open: Arc::new(AtomicBool::new(false)),
            tx,
            reader: Mutex::new(None),
        }
    }

    fn spawn_reader(&self, mut reader: File) -> JoinHandle<()> {
        let open = Arc::clone(&self.open);
        let tx = self.tx.clone();
        let path = self.path.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 256];
            while open.load(Ordering::SeqCst) {
                match reader.read(&mut buf) {
                    Ok(0) => std::thread::sleep(SERIAL_IDLE_PAUSE),
                    Ok(n) => {
                        let _ = tx.send(InboundReport::new(0, buf[..n].to_vec()));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        warn!(path = %path, error = %e, "Serial read failed, closing");
                        open.store(false, Ordering::SeqCst);
                    }
                }
            }
            debug!(path = %path, "Serial reader stopped");
        })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn id(&self) -> &str {
        &self.path
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn open(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let port = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| Error::DeviceNotFound(format!("{}: {e}", self.path)))?;
        configure_line(&port, &self.path);
        let reader = port
            .try_clone()
            .map_err(|e| Error::Hid(format!("clone {}: {e}", self.path)))?;
        *self.port.lock() = Some(port);
        self.open.store(true, Ordering::SeqCst);
        *self.reader.lock() = Some(self.spawn_reader(reader));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            let _ = reader.join();
        }
        *self.port.lock() = None;
        Ok(())
    }

    async fn send_report(&self, _report_id: u8, data: &[u8]) -> Result<()> {
        let mut guard = self.port.lock();
        let port = guard
            .as_mut()
            .ok_or_else(|| Error::TransportNotOpen(self.path.clone()))?;
        trace!(path = %self.path, bytes = data.len(), "Serial write");
        port.write_all(data)
            .and_then(|_| port.flush())
            .map_err(|e| Error::WriteFailed(format!("serial write: {e}")))
    }

    fn subscribe(&self) -> broadcast::Receiver<InboundReport> {
        self.tx.subscribe()
    }
}
