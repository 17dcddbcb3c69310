//! The admin's end of the tunnel connection.

use anyhow::Context;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use tunnel_wire::{Frame, FrameDecoder, FrameSink, WireError, DEFAULT_MAX_FRAME_SIZE};

/// Link tuning
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Frames queued for the writer before senders wait
    pub outbound_queue: usize,
    /// Largest frame accepted in either direction
    pub max_frame_size: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 256,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Counters reported by the writer task when it stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Frames written
    pub frames_sent: u64,
    /// Bytes written
    pub bytes_out: u64,
    /// Frames dropped because they could not be encoded
    pub frames_dropped: u64,
}

/// A running tunnel connection
pub struct TunnelLink {
    /// Cloneable outbound side
    pub sender: LinkSender,
    /// Inbound frames
    pub reader: FrameReader,
    /// Writer task; ends when every sender is gone or the socket fails
    pub writer: JoinHandle<anyhow::Result<LinkStats>>,
}

impl TunnelLink {
    /// Split the connection and start its writer task
    pub fn spawn(stream: TcpStream, config: LinkConfig) -> Self {
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(config.outbound_queue.max(1));

        let writer = tokio::spawn(write_loop(write_half, rx, config.max_frame_size));
        debug!("Tunnel link to {:?} started", peer);

        Self {
            sender: LinkSender { tx },
            reader: FrameReader::new(read_half, config.max_frame_size),
            writer,
        }
    }
}

/// Queues frames for the link's writer task
#[derive(Debug, Clone)]
pub struct LinkSender {
    tx: mpsc::Sender<Frame>,
}

#[async_trait]
impl FrameSink for LinkSender {
    async fn send_frame(&self, frame: Frame) -> Result<(), WireError> {
        self.tx.send(frame).await.map_err(|_| WireError::SinkClosed)
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::Receiver<Frame>,
    max_frame_size: usize,
) -> anyhow::Result<LinkStats> {
    let mut stats = LinkStats::default();

    while let Some(frame) = frames.recv().await {
        let bytes = match frame.encode(max_frame_size) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    "Dropping {:?} frame for {}: {}",
                    frame.header.message_type, frame.header.accepter, e
                );
                stats.frames_dropped += 1;
                continue;
            }
        };
        writer
            .write_all(&bytes)
            .await
            .context("tunnel write failed")?;
        stats.frames_sent += 1;
        stats.bytes_out += bytes.len() as u64;
        trace!("Sent {:?} frame ({} bytes)", frame.header.message_type, bytes.len());
    }

    let _ = writer.shutdown().await;
    debug!("Tunnel writer stopped after {} frames", stats.frames_sent);
    Ok(stats)
}

/// Decodes frames from the link's read half
pub struct FrameReader {
    reader: OwnedReadHalf,
    decoder: FrameDecoder,
    buffer: BytesMut,
}

impl FrameReader {
    fn new(reader: OwnedReadHalf, max_frame_size: usize) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::with_max_frame_size(max_frame_size),
            buffer: BytesMut::with_capacity(64 * 1024),
        }
    }

    /// Next inbound frame; `None` when the peer closed cleanly between frames
    pub async fn next_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }

            let bytes_read = self
                .reader
                .read_buf(&mut self.buffer)
                .await
                .context("tunnel read failed")?;
            if bytes_read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                anyhow::bail!("EOF inside a frame ({} bytes pending)", self.buffer.len());
            }
            trace!("Read {} bytes, buffer now has {} bytes", bytes_read, self.buffer.len());
        }
    }
}
