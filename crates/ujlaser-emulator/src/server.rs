//! Serving the engine over a byte stream.

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tracing::{debug, info, warn};

use ujlaser_core::config::LaserConfig;
use ujlaser_core::protocol::{format_response, ErrorCode, Response};
use ujlaser_core::status::StatusWord;

use crate::engine::ProtocolEngine;
use crate::faults::Fault;
use crate::registers::{ArmState, DeviceRegisters};

/// Longest frame accepted before the buffer is discarded.
const MAX_FRAME_LEN: usize = 256;

/// Shared access to a running emulator.
///
/// The engine is locked once per frame; no lock is held across an await.
#[derive(Clone, Debug)]
pub struct EmulatorHandle {
    engine: Arc<Mutex<ProtocolEngine>>,
}

impl EmulatorHandle {
    /// Engine at factory settings behind a shared lock.
    pub fn new(config: &LaserConfig) -> Self {
        let engine = Arc::new_cyclic(|weak| {
            let mut engine = ProtocolEngine::new(config);
            engine.attach(weak.clone());
            Mutex::new(engine)
        });
        Self { engine }
    }

    /// Answer one raw frame, terminator included.
    pub fn handle_bytes(&self, raw: &[u8]) -> Response {
        self.engine.lock().handle_raw(raw)
    }

    /// Current status word.
    pub fn status(&self) -> StatusWord {
        self.engine.lock().status()
    }

    /// Current arm state.
    pub fn state(&self) -> ArmState {
        self.engine.lock().state()
    }

    /// Snapshot of the registers.
    pub fn registers(&self) -> DeviceRegisters {
        self.engine.lock().registers().clone()
    }

    /// Raise a fault; a running sequence is cut off.
    pub fn inject_fault(&self, fault: Fault) {
        self.engine.lock().inject_fault(fault);
    }

    /// Clear a fault.
    pub fn clear_fault(&self, fault: Fault) {
        self.engine.lock().clear_fault(fault);
    }

    /// Run `f` with the engine locked.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut ProtocolEngine) -> R) -> R {
        f(&mut self.engine.lock())
    }
}

/// Answer frames from `stream` until the peer closes it.
///
/// Frames may end in `\r`, `\n` or `\r\n`; empty lines are ignored.
pub async fn serve<S>(handle: EmulatorHandle, stream: S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = BytesMut::with_capacity(MAX_FRAME_LEN);

    loop {
        while let Some(end) = buf.iter().position(|b| *b == b'\r' || *b == b'\n') {
            let line = buf.split_to(end + 1);
            if line[..end].iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let response = handle.handle_bytes(&line);
            debug!(frame = %String::from_utf8_lossy(&line).trim_end(), %response, "emulator exchange");
            writer.write_all(&format_response(&response)).await?;
            writer.flush().await?;
        }

        if buf.len() > MAX_FRAME_LEN {
            warn!(bytes = buf.len(), "discarding oversized frame");
            buf.advance(buf.len());
            writer
                .write_all(&format_response(&Response::Error(ErrorCode::NotRecognized)))
                .await?;
            writer.flush().await?;
        }

        if reader.read_buf(&mut buf).await? == 0 {
            info!("emulator peer closed the link");
            return Ok(());
        }
    }
}

/// Start an emulator on an in-memory pipe.
///
/// Returns the handle and the client end of the pipe. The serving task ends
/// when the client end is dropped.
pub fn spawn_emulator(config: &LaserConfig) -> (EmulatorHandle, DuplexStream) {
    let handle = EmulatorHandle::new(config);
    let (client, device) = tokio::io::duplex(1024);

    let server = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(server, device).await {
            warn!(error = %e, "emulator stopped");
        }
    });

    (handle, client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn serves_frames_with_any_terminator() {
        let (_handle, client) = spawn_emulator(&LaserConfig::default());
        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();

        write.write_all(b";LA:SS?\r\n\n;LA:ID?\n;LA:BC 5\r").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "1024");
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "QC,MicroJewel,00101,1.0-0.0.0.8"
        );
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "OK");
    }

    #[tokio::test]
    async fn handle_shares_state_with_server() {
        let (handle, client) = spawn_emulator(&LaserConfig::default());
        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();

        handle.inject_fault(Fault::ExternalInterlock);
        write.write_all(b";LA:SS?\r").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "64");
        assert!(handle.status().external_interlock);
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_applies_timer_on_time() {
        let handle = EmulatorHandle::new(&LaserConfig::default());
        assert_eq!(handle.handle_bytes(b";LA:EN 1\r"), Response::Ok);

        tokio::time::sleep(std::time::Duration::from_secs(9)).await;
        let armed = handle.with_engine(|engine| engine.timer_remaining());
        assert_eq!(armed, None);
        assert_eq!(handle.state(), ArmState::Armed);
    }
}
