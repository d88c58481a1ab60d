//! Octet-stuffed serial framing owned above a bare byte stream.
//!
//! Generic over the underlying stream so tests can drive the framing and
//! reader-task logic over an in-memory duplex pair, the way this codebase's
//! client transport tests ran against a loopback connection rather than real
//! hardware. Production callers only ever see [`Transport<SerialStream>`].

use std::time::Duration;

use bidib_proto::{encode_frame, encode_one, parse_all, Address, FrameReader, Message, ParsedMessage, SequenceNumber};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{watch, Mutex},
};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use crate::error::HostError;

/// How long a single baud candidate is given to produce a `SYS_MAGIC` reply
/// before the probe moves on to the next rate.
const PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// Read buffer size for one `poll_read` of the underlying stream.
const READ_CHUNK: usize = 256;

/// Owns the write half of a byte stream and serialises frame sends over it.
///
/// The read half is handed to [`spawn_reader`] separately: the reader task
/// is the only code that mutates the frame state machine, matching the
/// "reader task owns framing, scheduler task owns node state" split.
pub struct Transport<S> {
    writer: Mutex<WriteHalf<S>>,
    port_name: String,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an already-connected stream as a transport, splitting it into
    /// the write half kept here and the read half returned for
    /// [`spawn_reader`]. Used directly by tests (and by
    /// [`crate::host::Host::bind_with_transport`]) to drive the framing and
    /// dispatcher logic over an in-memory pipe instead of a real port.
    #[must_use]
    pub fn from_stream(port_name: impl Into<String>, stream: S) -> (Self, ReadHalf<S>) {
        let (reader, writer) = tokio::io::split(stream);
        (Self { writer: Mutex::new(writer), port_name: port_name.into() }, reader)
    }

    /// Device path this transport was opened against.
    #[must_use]
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Encodes `batch` as one frame (consecutive envelopes, each already
    /// carrying its own sequence number) and writes it whole, serialised by
    /// a mutex so two concurrent sends never interleave their bytes.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::TransportIo`] if the write fails.
    pub async fn send(&self, batch: &[(Address, SequenceNumber, Message)]) -> Result<(), HostError> {
        let frame = encode_batch_frame(batch);
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await.map_err(HostError::TransportIo)?;
        writer.flush().await.map_err(HostError::TransportIo)
    }

    /// Shuts down the write half. The reader task notices the peer close (or
    /// its own cancellation signal) independently.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::TransportIo`] if the shutdown fails.
    pub async fn close(&self) -> Result<(), HostError> {
        self.writer.lock().await.shutdown().await.map_err(HostError::TransportIo)
    }
}

impl Transport<SerialStream> {
    /// Opens the serial port at `port_name`, probing `baud_probe_order` in
    /// turn until one candidate's `SYS_GET_MAGIC` probe draws a `SYS_MAGIC`
    /// reply. Returns the transport and the read half for [`spawn_reader`].
    ///
    /// # Errors
    ///
    /// Returns [`HostError::TransportOpen`] if every candidate fails.
    pub async fn open(
        port_name: &str,
        baud_probe_order: &[u32],
    ) -> Result<(Self, ReadHalf<SerialStream>), HostError> {
        let mut last_error = None;
        for &baud in baud_probe_order {
            match probe_baud(port_name, baud).await {
                Ok(stream) => {
                    info!(port = port_name, baud, "serial transport opened");
                    return Ok(Self::from_stream(port_name, stream));
                },
                Err(err) => {
                    debug!(port = port_name, baud, error = %err, "baud probe failed");
                    last_error = Some(err);
                },
            }
        }
        Err(HostError::TransportOpen {
            port: port_name.to_string(),
            source: last_error.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "no baud rates configured")
            }),
        })
    }
}

async fn probe_baud(port_name: &str, baud: u32) -> Result<SerialStream, std::io::Error> {
    let mut stream = tokio_serial::new(port_name, baud).open_native_async()?;

    let probe = encode_frame(&encode_one(&Address::INTERFACE, SequenceNumber::RESET, &Message::SysGetMagic));
    stream.write_all(&probe).await?;

    let mut frame_reader = FrameReader::new();
    let mut byte = [0u8; 1];
    let deadline = tokio::time::Instant::now() + PROBE_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no SYS_MAGIC reply"));
        }
        match tokio::time::timeout(remaining, stream.read(&mut byte)).await {
            Ok(Ok(0)) => {
                return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "port closed during probe"))
            },
            Ok(Ok(_)) => {
                if let Some(Ok(payload)) = frame_reader.feed(byte[0]) {
                    if let Ok(messages) = parse_all(&payload) {
                        if messages.iter().any(|m| matches!(m.message, Message::SysMagic { .. })) {
                            return Ok(stream);
                        }
                    }
                }
            },
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no SYS_MAGIC reply")),
        }
    }
}

fn encode_batch_frame(batch: &[(Address, SequenceNumber, Message)]) -> Vec<u8> {
    let mut payload = Vec::new();
    for (addr, seq, message) in batch {
        payload.extend_from_slice(&encode_one(addr, *seq, message));
    }
    encode_frame(&payload)
}

/// Spawns the reader task: drives the frame state machine over `reader` and
/// invokes `processor` once per parsed message, awaiting it before resuming
/// the read loop (so a processor that itself enqueues with a timeout bounds
/// how long one slow consumer can stall the reader).
///
/// Exits when the stream reaches EOF, a read fails, or `cancel` is set.
pub fn spawn_reader<S, P, F>(
    mut reader: ReadHalf<S>,
    mut cancel: watch::Receiver<bool>,
    processor: P,
) -> tokio::task::JoinHandle<()>
where
    S: AsyncRead + Unpin + Send + 'static,
    P: Fn(ParsedMessage) -> F + Send + Sync + 'static,
    F: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut frame_reader = FrameReader::new();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
                result = reader.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            info!("serial transport closed by peer");
                            break;
                        },
                        Ok(n) => {
                            for outcome in frame_reader.feed_all(&buf[..n]) {
                                match outcome {
                                    Ok(payload) => match parse_all(&payload) {
                                        Ok(messages) => {
                                            for message in messages {
                                                processor(message).await;
                                            }
                                        },
                                        Err(err) => warn!(error = %err, "dropping unparsable frame payload"),
                                    },
                                    Err(err) => warn!(error = %err, "dropping frame with bad CRC"),
                                }
                            }
                        },
                        Err(err) => {
                            warn!(error = %err, "serial read error, reader task exiting");
                            break;
                        },
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use bidib_proto::SequenceNumber;

    use super::*;

    #[tokio::test]
    async fn send_produces_a_single_decodable_frame() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (transport, _reader) = Transport::from_stream("test", client);

        let batch = vec![
            (Address::INTERFACE, SequenceNumber::from(1), Message::SysGetMagic),
            (Address::INTERFACE, SequenceNumber::from(2), Message::SysReset),
        ];
        transport.send(&batch).await.unwrap();

        let mut buf = [0u8; 256];
        let n = server.read(&mut buf).await.unwrap();
        let mut frame_reader = FrameReader::new();
        let frames = frame_reader.feed_all(&buf[..n]);
        assert_eq!(frames.len(), 1);
        let parsed = parse_all(frames[0].as_ref().unwrap()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].message, Message::SysGetMagic);
        assert_eq!(parsed[1].message, Message::SysReset);
    }

    #[tokio::test]
    async fn reader_task_invokes_processor_per_message() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (_server_transport, reader) = Transport::from_stream("test", server);

        let seen: Arc<StdMutex<Vec<Message>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let handle = spawn_reader(reader, cancel_rx, move |parsed: ParsedMessage| {
            let seen = Arc::clone(&seen_clone);
            async move {
                seen.lock().unwrap().push(parsed.message);
            }
        });

        let frame = encode_batch_frame(&[(Address::INTERFACE, SequenceNumber::from(1), Message::SysEnable)]);
        client.write_all(&frame).await.unwrap();
        client.shutdown().await.unwrap();

        handle.await.unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), [Message::SysEnable]);
    }

    #[tokio::test]
    async fn reader_task_exits_on_cancellation() {
        let (_client, server) = tokio::io::duplex(4096);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (_server_transport, reader) = Transport::from_stream("test", server);

        let handle = spawn_reader(reader, cancel_rx, |_: ParsedMessage| async {});
        cancel_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
