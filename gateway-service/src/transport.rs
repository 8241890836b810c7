//! The byte-stream link to the bus: a serial PC-Link or a transparent TCP
//! bridge.
//!
//! Both transports present the same small surface — `send`, `read_line`,
//! `handshake` — over a boxed `AsyncRead + AsyncWrite` stream, the same
//! style as wrapping a process's stdout in a `BufReader` and driving it
//! with `AsyncBufReadExt`. We use an owned
//! trait object instead of generics so the engine can hold one transport
//! value regardless of which concrete stream backs it.
//!
//! The Scheduler holds exclusive write ownership and the Listener exclusive
//! read ownership of the same link, so `open` hands back a
//! `(TransportReader, TransportWriter)` pair — the two halves of a
//! `tokio::io::split`, handed to two different tasks.

use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::error::{NikobusError, Result};

/// The fixed handshake sequence. Each frame is sent in order
/// with a short settle delay; no correlated response is required.
const HANDSHAKE_FRAMES: &[&str] = &["++++\r", "ATH0\r", "ATZ\r", "$10110000B8CF9D\r"];

const HANDSHAKE_SETTLE: Duration = Duration::from_millis(150);

/// CR, the line terminator for every frame on this bus.
const CR: u8 = 0x0D;

/// Where to (re)connect, kept around so the engine can replay a reconnect
/// without the caller supplying the address again.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Serial { path: String, baud_rate: u32 },
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    pub fn serial(path: impl Into<String>) -> Self {
        Endpoint::Serial {
            path: path.into(),
            baud_rate: 9600,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }
}

trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}

type BoxedDuplex = Box<dyn Duplex>;

/// Read half of an open link. Owned exclusively by the Listener task.
pub struct TransportReader {
    reader: BufReader<ReadHalf<BoxedDuplex>>,
}

impl TransportReader {
    /// Read one CR-terminated line. Decoding is byte-for-byte
    /// Windows-1252 → `char`: every byte this protocol ever emits (hex
    /// digits, `$`, `#`, control chars) is also valid ASCII, so a full
    /// charset crate isn't needed — see DESIGN.md.
    pub async fn read_line(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        let n = self
            .reader
            .read_until(CR, &mut buf)
            .await
            .map_err(|_| NikobusError::TransportLost)?;
        if n == 0 {
            return Err(NikobusError::TransportLost);
        }
        if buf.last() == Some(&CR) {
            buf.pop();
        }
        let decoded: String = buf.iter().map(|&b| b as char).collect();
        Ok(decoded.trim().to_string())
    }

    /// Read one line, failing with [`NikobusError::TransportLost`] if
    /// nothing arrives within `timeout`.
    pub async fn read_line_timeout(&mut self, timeout: Duration) -> Result<String> {
        match tokio::time::timeout(timeout, self.read_line()).await {
            Ok(result) => result,
            Err(_) => Err(NikobusError::TransportLost),
        }
    }
}

/// Write half of an open link. Owned exclusively by the Scheduler task.
pub struct TransportWriter {
    write: WriteHalf<BoxedDuplex>,
}

impl TransportWriter {
    /// Write a frame (without trailing CR) plus the CR terminator.
    pub async fn send(&mut self, frame: &str) -> Result<()> {
        debug!(frame, "transport send");
        let mut bytes = frame.as_bytes().to_vec();
        bytes.push(CR);
        self.write.write_all(&bytes).await.map_err(|_| NikobusError::TransportLost)
    }
}

/// Open the link and run the fixed handshake, then split it into
/// independent read/write halves.
pub async fn open(endpoint: &Endpoint) -> Result<(TransportReader, TransportWriter)> {
    let stream: BoxedDuplex = match endpoint {
        Endpoint::Serial { path, baud_rate } => {
            let port = tokio_serial::new(path.clone(), *baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .open_native_async()
                .map_err(|e| NikobusError::TransportUnavailable(e.to_string()))?;
            Box::new(port)
        }
        Endpoint::Tcp { host, port } => {
            let stream = tokio::net::TcpStream::connect((host.as_str(), *port))
                .await
                .map_err(|e| NikobusError::TransportUnavailable(e.to_string()))?;
            Box::new(stream)
        }
    };

    let (read_half, write_half) = tokio::io::split(stream);
    let mut writer = TransportWriter { write: write_half };
    handshake(&mut writer).await?;

    Ok((
        TransportReader {
            reader: BufReader::new(read_half),
        },
        writer,
    ))
}

/// Send the four fixed handshake frames with a settle delay after each.
/// No response is awaited — the bus may not answer any of these.
async fn handshake(writer: &mut TransportWriter) -> Result<()> {
    for frame in HANDSHAKE_FRAMES {
        writer
            .write
            .write_all(frame.as_bytes())
            .await
            .map_err(|_| NikobusError::TransportLost)?;
        tokio::time::sleep(HANDSHAKE_SETTLE).await;
    }
    info!("handshake complete");
    Ok(())
}

/// Exponential reconnect backoff, capped at 60s. `next()` both
/// returns the delay to sleep and advances the internal state; `reset()` is
/// called after a successful reconnect.
pub struct ReconnectBackoff {
    current: Duration,
    max: Duration,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self {
            current: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }

    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = Duration::from_secs(1);
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconnect loop: retries [`open`] with exponential backoff until it
/// succeeds. Callers run this after a `TransportLost` to get a fresh,
/// already-handshaken link.
pub async fn reconnect(endpoint: &Endpoint) -> (TransportReader, TransportWriter) {
    let mut backoff = ReconnectBackoff::new();
    loop {
        match open(endpoint).await {
            Ok(pair) => return pair,
            Err(e) => {
                let delay = backoff.next();
                warn!(error = %e, delay_s = delay.as_secs(), "reconnect attempt failed, backing off");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_sixty_seconds() {
        let mut b = ReconnectBackoff::new();
        assert_eq!(b.next(), Duration::from_secs(1));
        assert_eq!(b.next(), Duration::from_secs(2));
        assert_eq!(b.next(), Duration::from_secs(4));
        for _ in 0..10 {
            b.next();
        }
        assert_eq!(b.next(), Duration::from_secs(60));
    }

    #[test]
    fn backoff_resets_to_one_second() {
        let mut b = ReconnectBackoff::new();
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.next(), Duration::from_secs(1));
    }

    /// The four handshake frames, sent in order, with no
    /// response awaited. `tokio::io::duplex` gives an in-memory
    /// `AsyncRead + AsyncWrite` pair without touching a real serial port or
    /// socket. Real (unpaused) time is used here — the reader side blocks on
    /// in-memory I/O rather than a timer, which doesn't mix safely with
    /// `start_paused`'s auto-advance-on-idle-timers behaviour.
    #[tokio::test]
    async fn handshake_sends_the_four_fixed_frames_in_order() {
        let (bus_side, engine_side) = tokio::io::duplex(256);
        let boxed: BoxedDuplex = Box::new(engine_side);
        let (_read_half, write_half) = tokio::io::split(boxed);
        let mut writer = TransportWriter { write: write_half };

        let handshake_task = tokio::spawn(async move {
            handshake(&mut writer).await.unwrap();
        });

        let mut bus_reader = BufReader::new(bus_side);
        let mut collected = Vec::new();
        for _ in 0..4 {
            let mut line = Vec::new();
            bus_reader.read_until(CR, &mut line).await.unwrap();
            collected.push(String::from_utf8(line).unwrap());
        }
        handshake_task.await.unwrap();

        assert_eq!(collected, vec!["++++\r", "ATH0\r", "ATZ\r", "$10110000B8CF9D\r"]);
    }
}
