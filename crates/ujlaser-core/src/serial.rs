//! Serial transport abstractions.
//!
//! The controller talks to the device through the [`Transport`] trait: write a
//! frame, read up to a terminator with a timeout, report whether the link is
//! open. [`SerialTransport`] implements it over any async byte stream, a real
//! `tokio_serial::SerialStream` or a `tokio::io::DuplexStream` in tests.
//!
//! # Feature Flag
//!
//! [`open_serial_async`] requires the `serial` feature:
//!
//! ```toml
//! [dependencies]
//! ujlaser-core = { path = "../ujlaser-core", features = ["serial"] }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use ujlaser_core::serial::{open_serial_async, wrap_shared, SerialTransport};
//!
//! let port = open_serial_async("/dev/ttyUSB0", 115_200, "MicroJewel").await?;
//! let shared = wrap_shared(Box::new(SerialTransport::new(Box::new(port))));
//! ```

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::limits::MAX_RESPONSE_LEN;

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// Transport
// =============================================================================

/// Byte transport consumed by the controller.
///
/// Implementations are driven by one exchange at a time; callers share them
/// behind [`SharedTransport`].
#[async_trait]
pub trait Transport: Send {
    /// Write a complete frame and flush it.
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read up to and including `terminator`.
    ///
    /// Returns `Ok(None)` when nothing terminated arrives within `timeout`.
    /// Bytes read before the timeout are kept for the next call unless
    /// [`Transport::discard_pending`] drops them.
    async fn read_until(&mut self, terminator: u8, timeout: Duration)
        -> io::Result<Option<Vec<u8>>>;

    /// Whether the link can still carry frames.
    fn is_open(&self) -> bool;

    /// Shut the link down. Later writes fail with `NotConnected`.
    async fn close(&mut self) -> io::Result<()>;

    /// Drop partially read bytes and anything arriving within `window`.
    /// Returns the number of bytes discarded.
    async fn discard_pending(&mut self, window: Duration) -> usize;
}

/// Transport shared between the foreground caller and background tasks.
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Wrap a transport for sharing.
pub fn wrap_shared(transport: Box<dyn Transport>) -> SharedTransport {
    Arc::new(Mutex::new(transport))
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "serial port is closed")
}

/// [`Transport`] over an async byte stream.
pub struct SerialTransport {
    port: Option<BufReader<DynSerial>>,
    pending: Vec<u8>,
}

impl SerialTransport {
    /// Wrap an open stream.
    pub fn new(port: DynSerial) -> Self {
        Self {
            port: Some(BufReader::new(port)),
            pending: Vec::with_capacity(MAX_RESPONSE_LEN),
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let port = self.port.as_mut().ok_or_else(not_connected)?;
        port.get_mut().write_all(bytes).await?;
        port.get_mut().flush().await
    }

    async fn read_until(
        &mut self,
        terminator: u8,
        timeout: Duration,
    ) -> io::Result<Option<Vec<u8>>> {
        let port = self.port.as_mut().ok_or_else(not_connected)?;

        // Partial bytes stay in `pending` if the timeout cancels the read.
        let read = port.read_until(terminator, &mut self.pending);
        match tokio::time::timeout(timeout, read).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(e),
            Ok(Ok(0)) if self.pending.is_empty() => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "serial stream closed by peer",
            )),
            Ok(Ok(_)) => {
                let line = std::mem::take(&mut self.pending);
                if line.len() > MAX_RESPONSE_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("response exceeds {MAX_RESPONSE_LEN} bytes"),
                    ));
                }
                Ok(Some(line))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn close(&mut self) -> io::Result<()> {
        self.pending.clear();
        match self.port.take() {
            Some(mut port) => port.get_mut().shutdown().await,
            None => Ok(()),
        }
    }

    async fn discard_pending(&mut self, window: Duration) -> usize {
        let mut discarded = std::mem::take(&mut self.pending).len();
        if let Some(port) = self.port.as_mut() {
            discarded += drain_serial_buffer(port, window).await;
        }
        discarded
    }
}

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Open a serial port on the blocking pool with 8N1 and no flow control.
///
/// # Errors
///
/// Returns an error if the port cannot be opened or `spawn_blocking` fails.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> io::Result<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                let e = io::Error::from(e);
                io::Error::new(
                    e.kind(),
                    format!(
                        "failed to open {} serial port {}: {}",
                        device_name_owned, port_path_owned, e
                    ),
                )
            })
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// Read and discard whatever arrives within `window`.
///
/// Stops early on EOF or an I/O error. Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    if total_discarded > 0 {
        tracing::debug!(bytes = total_discarded, "discarded stale serial data");
    }
    total_discarded
}
