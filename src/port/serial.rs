//! # NozzlePort: line-framed transport with request/response correlation.
//!
//! One serial wire carries solicited replies and spontaneous events
//! interleaved. The port owns the transport handle and a pending-request
//! table keyed by verb family; everything else in the system only calls
//! [`NozzleLink::request`]/[`NozzleLink::send`] and consumes frames from the
//! supervisor's input queue.
//!
//! ## Architecture
//! ```text
//! request(cmd) ──► pending[family] = oneshot ──► write line
//!                                                    │
//! serial line ──► FramedRead<LinesCodec> ──► Frame::parse
//!                                                    │
//!                       ┌────────────────────────────┤
//!                       ▼                            ▼
//!             frames queue (every frame,   pending[family].take()
//!              before correlation)          └──► resolve oldest request
//! ```
//!
//! ## Rules
//! - At most one outstanding request per verb family (single-writer).
//! - Every inbound frame is forwarded to the supervisor **before**
//!   correlation is attempted.
//! - `rfid_match`, `rfid_alarm`, `nhb` never resolve a request.
//! - Deadline expiry deletes the pending entry and surfaces as
//!   [`PortError::Timeout`]; the transport itself is never cancelled, and a
//!   late reply is simply an unsolicited frame.
//! - Malformed or unknown frames are logged at warn and dropped.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::config::SerialConfig;
use crate::error::{PortError, RuntimeError};
use crate::events::{Bus, Event, EventKind};

use super::frame::{Command, Family, Frame};
use super::link::NozzleLink;

const SERIAL_OPEN_RETRIES: usize = 10;
const SERIAL_OPEN_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Opens the nozzle UART (8-N-1) with bounded retries.
pub fn open_serial(cfg: &SerialConfig) -> Result<tokio_serial::SerialStream, RuntimeError> {
    use tokio_serial::SerialPortBuilderExt;

    let mut last_error = String::new();
    for attempt in 1..=SERIAL_OPEN_RETRIES {
        let builder = tokio_serial::new(&cfg.path, cfg.baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None);
        match builder.open_native_async() {
            Ok(stream) => {
                if attempt > 1 {
                    log::info!("opened serial port {} after {attempt} attempts", cfg.path);
                }
                return Ok(stream);
            }
            Err(err) => {
                last_error = err.to_string();
                if attempt < SERIAL_OPEN_RETRIES {
                    log::warn!(
                        "failed to open serial port {} (attempt {attempt}/{SERIAL_OPEN_RETRIES}): {last_error}",
                        cfg.path
                    );
                    std::thread::sleep(SERIAL_OPEN_RETRY_DELAY);
                }
            }
        }
    }
    Err(RuntimeError::SerialOpen {
        path: cfg.path.clone(),
        reason: last_error,
    })
}

/// Line-framed nozzle transport with per-family correlation.
///
/// Accepts any byte stream: the serial line in production,
/// `tokio::io::duplex` in tests.
pub struct NozzlePort {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: StdMutex<HashMap<Family, oneshot::Sender<Frame>>>,
    bus: Bus,
    deadline: Duration,
}

impl NozzlePort {
    /// Wraps a transport, spawns the reader loop, and returns the port.
    ///
    /// Every inbound frame is pushed into `frames_tx` (the supervisor's
    /// input queue); the queue is bounded and the reader applies
    /// back-pressure rather than dropping frames. When the transport ends,
    /// `frames_tx` is dropped, which the wiring observes as link closure.
    pub fn spawn<T>(
        transport: T,
        frames_tx: mpsc::Sender<Frame>,
        bus: Bus,
        deadline: Duration,
    ) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let port = Arc::new(Self {
            writer: Mutex::new(Box::new(write_half)),
            pending: StdMutex::new(HashMap::new()),
            bus,
            deadline,
        });
        let reader = Arc::clone(&port);
        tokio::spawn(async move {
            reader.read_loop(read_half, frames_tx).await;
        });
        port
    }

    async fn read_loop<R>(self: Arc<Self>, read_half: R, frames_tx: mpsc::Sender<Frame>)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut lines = FramedRead::new(read_half, LinesCodec::new());
        while let Some(item) = lines.next().await {
            let line = match item {
                Ok(l) => l,
                Err(err) => {
                    log::error!("serial read failed: {err}");
                    break;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let frame = match Frame::parse(trimmed) {
                Ok(f) => f,
                Err(err) => {
                    log::warn!("dropping frame: {err}");
                    continue;
                }
            };

            // Observers see every frame before correlation.
            self.bus
                .publish(Event::now(EventKind::FrameReceived).with_frame(frame.raw.clone()));
            if frames_tx.send(frame.clone()).await.is_err() {
                break;
            }

            if !frame.family.always_unsolicited() {
                let waiter = self.pending.lock().unwrap().remove(&frame.family);
                if let Some(tx) = waiter {
                    let _ = tx.send(frame);
                }
            }
        }

        log::error!("nozzle transport closed");
        // Dropping the senders fails outstanding requests as TransportClosed.
        self.pending.lock().unwrap().clear();
    }

    async fn write_line(&self, line: &str) -> Result<(), PortError> {
        let mut writer = self.writer.lock().await;
        let framed = format!("{line}\n");
        writer
            .write_all(framed.as_bytes())
            .await
            .map_err(|e| PortError::TransportClosed {
                reason: e.to_string(),
            })?;
        writer.flush().await.map_err(|e| PortError::TransportClosed {
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl NozzleLink for NozzlePort {
    async fn request(&self, cmd: Command) -> Result<Frame, PortError> {
        let Some(family) = cmd.response_family() else {
            debug_assert!(false, "request() called with a fire-and-forget command");
            self.send(cmd).await?;
            return Err(PortError::Busy {
                family: "fire_and_forget",
            });
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.contains_key(&family) {
                // The supervisor is the single writer per family.
                debug_assert!(false, "duplicate in-flight request for {}", family.as_str());
                return Err(PortError::Busy {
                    family: family.as_str(),
                });
            }
            pending.insert(family, tx);
        }

        let line = cmd.encode();
        if let Err(err) = self.write_line(&line).await {
            self.pending.lock().unwrap().remove(&family);
            return Err(err);
        }
        self.bus
            .publish(Event::now(EventKind::FrameSent).with_frame(line));

        match timeout(self.deadline, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(PortError::TransportClosed {
                reason: "reader terminated".to_string(),
            }),
            Err(_) => {
                self.pending.lock().unwrap().remove(&family);
                Err(PortError::Timeout {
                    family: family.as_str(),
                    deadline: self.deadline,
                })
            }
        }
    }

    async fn send(&self, cmd: Command) -> Result<(), PortError> {
        let line = cmd.encode();
        self.write_line(&line).await?;
        self.bus
            .publish(Event::now(EventKind::FrameSent).with_frame(line));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pipe() -> (
        Arc<NozzlePort>,
        tokio::io::DuplexStream,
        mpsc::Receiver<Frame>,
    ) {
        let (local, remote) = tokio::io::duplex(4096);
        let (frames_tx, frames_rx) = mpsc::channel(64);
        let port = NozzlePort::spawn(local, frames_tx, Bus::new(64), Duration::from_millis(200));
        (port, remote, frames_rx)
    }

    async fn remote_reply(remote: &mut tokio::io::DuplexStream, line: &str) {
        use tokio::io::AsyncWriteExt;
        remote.write_all(format!("{line}\n").as_bytes()).await.unwrap();
    }

    async fn remote_read_line(remote: &mut tokio::io::DuplexStream) -> String {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            remote.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
            buf.push(byte[0]);
        }
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn request_resolves_with_the_matching_family() {
        let (port, mut remote, _frames) = pipe().await;
        let task = tokio::spawn({
            let port = Arc::clone(&port);
            async move { port.request(Command::MeterRead).await }
        });
        assert_eq!(remote_read_line(&mut remote).await, "meter_read()");
        remote_reply(&mut remote, "meter_read(4.1)").await;
        let frame = task.await.unwrap().unwrap();
        assert_eq!(frame.meter_liters(), Some("4.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn deadline_expiry_times_out_without_killing_the_port() {
        let (port, mut remote, mut frames) = pipe().await;
        let err = port.request(Command::MeterRead).await.unwrap_err();
        assert!(matches!(err, PortError::Timeout { family: "meter_read", .. }));

        // A late reply surfaces as an unsolicited frame, not a response.
        let _ = remote_read_line(&mut remote).await;
        remote_reply(&mut remote, "meter_read(9.0)").await;
        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.family, Family::MeterRead);
    }

    #[tokio::test]
    async fn unsolicited_events_never_resolve_requests() {
        let (port, mut remote, mut frames) = pipe().await;
        let task = tokio::spawn({
            let port = Arc::clone(&port);
            async move { port.request(Command::RfidGet { nozzle: "0076".into() }).await }
        });
        let _ = remote_read_line(&mut remote).await;
        remote_reply(&mut remote, "rfid_match(0076,1)").await;
        remote_reply(&mut remote, "rfid_get(0076,-,2013)").await;

        // The match is forwarded as an event; the rfid_get resolves the request.
        assert_eq!(frames.recv().await.unwrap().family, Family::RfidMatch);
        let frame = task.await.unwrap().unwrap();
        assert_eq!(frame.family, Family::RfidGet);
    }

    #[tokio::test]
    async fn every_frame_reaches_the_queue_before_correlation() {
        let (port, mut remote, mut frames) = pipe().await;
        let task = tokio::spawn({
            let port = Arc::clone(&port);
            async move { port.request(Command::Heartbeat).await }
        });
        let _ = remote_read_line(&mut remote).await;
        remote_reply(&mut remote, "heartbeat(0)").await;
        // The solicited reply is visible on the queue too.
        assert_eq!(frames.recv().await.unwrap().family, Family::Heartbeat);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn malformed_lines_are_dropped() {
        let (_port, mut remote, mut frames) = pipe().await;
        remote_reply(&mut remote, "garbage").await;
        remote_reply(&mut remote, "meter_read(1.0)").await;
        // Only the well-formed frame comes through.
        assert_eq!(frames.recv().await.unwrap().family, Family::MeterRead);
    }

    #[tokio::test]
    async fn fire_and_forget_writes_the_exact_record() {
        let (port, mut remote, _frames) = pipe().await;
        port.send(Command::SetSolenoid { open: true }).await.unwrap();
        port.send(Command::RfidStop { nozzle: "0076".into() }).await.unwrap();
        assert_eq!(remote_read_line(&mut remote).await, "set_solenoid(1)");
        assert_eq!(remote_read_line(&mut remote).await, "rfid_stop(0076)");
    }
}
