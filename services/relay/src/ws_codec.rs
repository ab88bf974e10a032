//! WebSocket frame codec with permessage-deflate.
//!
//! The reader half decodes masked client frames, reassembles fragments and
//! inflates compressed messages; the writer half is a task owning the write
//! side of the socket, fed over a channel so the session, the event writer
//! and the fanout workers can all write without interleaving bytes.
//!
//! Writes are buffered: `Text` appends a framed (and usually deflated)
//! message to an in-memory buffer, and only the `Flush` sentinel pushes the
//! buffer to the network. A REQ backfill therefore coalesces many EVENT
//! frames into large deflate blocks while still giving the client a byte
//! boundary at every logical reply. Compression contexts keep their sliding
//! window across messages unless `no_context_takeover` was negotiated.

use flate2::{Compress, Decompress, FlushCompress, FlushDecompress};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::pools::Pooled;
use crate::ws_handshake::DeflateConfig;

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xa;

/// The trailing bytes every deflate sync flush emits; stripped on send and
/// restored before inflating, per RFC 7692.
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("websocket protocol violation: {0}")]
    Protocol(&'static str),
    #[error("message exceeds the configured maximum size")]
    MessageTooLarge,
    #[error("deflate stream error: {0}")]
    Deflate(String),
    #[error("writer task is gone")]
    WriterClosed,
}

/// Deflate state for one direction of one connection.
pub struct InflateState {
    pub config: DeflateConfig,
    pub context: Pooled<Decompress>,
}

pub struct DeflateState {
    pub config: DeflateConfig,
    pub context: Pooled<Compress>,
}

/// One logical inbound item. Close frames surface as `Ok(None)` from
/// [`FrameReader::next_message`].
#[derive(Debug)]
pub enum InboundEvent {
    Text(String),
    Ping(Vec<u8>),
}

struct Frame {
    fin: bool,
    rsv1: bool,
    opcode: u8,
    payload: Vec<u8>,
}

/// Decodes logical text messages from a client byte stream.
pub struct FrameReader<R> {
    reader: R,
    inflate: Option<InflateState>,
    max_message: usize,
    partial: Vec<u8>,
    partial_compressed: bool,
    in_message: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, inflate: Option<InflateState>, max_message: usize) -> Self {
        Self {
            reader,
            inflate,
            max_message,
            partial: Vec::new(),
            partial_compressed: false,
            in_message: false,
        }
    }

    /// Next logical message. `Ok(None)` means the peer sent a close frame.
    /// Any error is fatal for the connection; the codec does not resynchronize.
    pub async fn next_message(&mut self) -> Result<Option<InboundEvent>, CodecError> {
        loop {
            let frame = self.read_frame().await?;
            match frame.opcode {
                OP_PING => return Ok(Some(InboundEvent::Ping(frame.payload))),
                OP_PONG => continue,
                OP_CLOSE => return Ok(None),
                OP_TEXT => {
                    if self.in_message {
                        return Err(CodecError::Protocol("data frame inside a fragmented message"));
                    }
                    if frame.rsv1 && self.inflate.is_none() {
                        return Err(CodecError::Protocol("compressed frame was not negotiated"));
                    }
                    self.in_message = true;
                    self.partial_compressed = frame.rsv1;
                    self.partial.clear();
                    self.partial.extend_from_slice(&frame.payload);
                }
                OP_CONTINUATION => {
                    if !self.in_message {
                        return Err(CodecError::Protocol("continuation without a message"));
                    }
                    if frame.rsv1 {
                        return Err(CodecError::Protocol("rsv1 set on a continuation frame"));
                    }
                    self.partial.extend_from_slice(&frame.payload);
                }
                OP_BINARY => {
                    return Err(CodecError::Protocol("binary messages are not supported"))
                }
                _ => return Err(CodecError::Protocol("unknown opcode")),
            }
            if frame.fin {
                self.in_message = false;
                let data = if self.partial_compressed {
                    self.inflate_partial()?
                } else {
                    std::mem::take(&mut self.partial)
                };
                let text = String::from_utf8(data)
                    .map_err(|_| CodecError::Protocol("text message is not valid utf-8"))?;
                return Ok(Some(InboundEvent::Text(text)));
            }
        }
    }

    async fn read_frame(&mut self) -> Result<Frame, CodecError> {
        let b0 = self.reader.read_u8().await?;
        let b1 = self.reader.read_u8().await?;
        let fin = b0 & 0x80 != 0;
        let rsv1 = b0 & 0x40 != 0;
        if b0 & 0x30 != 0 {
            return Err(CodecError::Protocol("reserved bits rsv2/rsv3 set"));
        }
        let opcode = b0 & 0x0f;
        if b1 & 0x80 == 0 {
            return Err(CodecError::Protocol("client frames must be masked"));
        }
        let short_len = b1 & 0x7f;
        let control = opcode >= 0x8;
        if control && (!fin || short_len > 125) {
            return Err(CodecError::Protocol("fragmented or oversized control frame"));
        }
        let len = match short_len {
            126 => u64::from(self.reader.read_u16().await?),
            127 => self.reader.read_u64().await?,
            n => u64::from(n),
        };
        let len = usize::try_from(len).map_err(|_| CodecError::MessageTooLarge)?;
        if len > self.max_message || self.partial.len() + len > self.max_message {
            return Err(CodecError::MessageTooLarge);
        }
        let mut mask = [0u8; 4];
        self.reader.read_exact(&mut mask).await?;
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload).await?;
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
        Ok(Frame {
            fin,
            rsv1,
            opcode,
            payload,
        })
    }

    fn inflate_partial(&mut self) -> Result<Vec<u8>, CodecError> {
        let state = self
            .inflate
            .as_mut()
            .ok_or(CodecError::Protocol("compressed frame was not negotiated"))?;
        self.partial.extend_from_slice(&DEFLATE_TAIL);
        let out = inflate_message(&mut state.context, &self.partial, self.max_message);
        self.partial.clear();
        if state.config.client_no_context_takeover {
            state.context.reset(false);
        }
        out
    }
}

fn inflate_message(
    ctx: &mut Decompress,
    input: &[u8],
    max: usize,
) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(input.len().saturating_mul(2).max(256));
    let mut read = 0usize;
    loop {
        if out.capacity() - out.len() < 1024 {
            out.reserve(8 * 1024);
        }
        let before_in = ctx.total_in();
        let before_out = ctx.total_out();
        ctx.decompress_vec(&input[read..], &mut out, FlushDecompress::None)
            .map_err(|e| CodecError::Deflate(e.to_string()))?;
        let consumed = usize::try_from(ctx.total_in() - before_in).unwrap_or(usize::MAX);
        let produced = ctx.total_out() - before_out;
        read += consumed;
        if out.len() > max {
            return Err(CodecError::MessageTooLarge);
        }
        if read >= input.len() && produced == 0 {
            return Ok(out);
        }
        if consumed == 0 && produced == 0 {
            return Err(CodecError::Deflate("inflate made no progress".to_owned()));
        }
    }
}

fn deflate_message(ctx: &mut Compress, data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    let mut read = 0usize;
    while read < data.len() {
        if out.capacity() - out.len() < 64 {
            out.reserve(4 * 1024);
        }
        let before_in = ctx.total_in();
        ctx.compress_vec(&data[read..], &mut out, FlushCompress::None)
            .map_err(|e| CodecError::Deflate(e.to_string()))?;
        read += usize::try_from(ctx.total_in() - before_in).unwrap_or(usize::MAX);
    }
    // Finalize the block: the sync flush ends with an empty stored block
    // (00 00 ff ff) which the wire format omits.
    while !out.ends_with(&DEFLATE_TAIL) {
        if out.capacity() - out.len() < 64 {
            out.reserve(1024);
        }
        ctx.compress_vec(&[], &mut out, FlushCompress::Sync)
            .map_err(|e| CodecError::Deflate(e.to_string()))?;
    }
    out.truncate(out.len() - DEFLATE_TAIL.len());
    if out.is_empty() {
        out.push(0x00);
    }
    Ok(out)
}

/// Commands accepted by the writer task.
enum WriterCmd {
    Text(String),
    Flush,
    Pong(Vec<u8>),
    Close,
}

/// Cloneable handle to a connection's writer task. All writers into one
/// connection funnel through the same queue, which serializes their bytes.
#[derive(Clone)]
pub struct MessageWriter {
    tx: mpsc::Sender<WriterCmd>,
}

impl MessageWriter {
    /// Buffers one logical message. Nothing reaches the network until
    /// [`MessageWriter::flush`].
    pub async fn write(&self, msg: String) -> Result<(), CodecError> {
        self.tx
            .send(WriterCmd::Text(msg))
            .await
            .map_err(|_| CodecError::WriterClosed)
    }

    /// The flush sentinel: pushes all buffered frames to the socket.
    pub async fn flush(&self) -> Result<(), CodecError> {
        self.tx
            .send(WriterCmd::Flush)
            .await
            .map_err(|_| CodecError::WriterClosed)
    }

    /// Write followed by flush; the common single-reply path.
    pub async fn send(&self, msg: String) -> Result<(), CodecError> {
        self.write(msg).await?;
        self.flush().await
    }

    pub async fn pong(&self, payload: Vec<u8>) -> Result<(), CodecError> {
        self.tx
            .send(WriterCmd::Pong(payload))
            .await
            .map_err(|_| CodecError::WriterClosed)
    }

    /// Sends a close frame and stops the writer task.
    pub async fn close(&self) {
        let _ = self.tx.send(WriterCmd::Close).await;
    }
}

/// Spawns the writer task for one connection.
pub fn spawn_writer<W>(
    socket: W,
    deflate: Option<DeflateState>,
    token: CancellationToken,
) -> MessageWriter
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(writer_task(socket, rx, deflate, token));
    MessageWriter { tx }
}

async fn writer_task<W: AsyncWrite + Unpin>(
    mut socket: W,
    mut rx: mpsc::Receiver<WriterCmd>,
    mut deflate: Option<DeflateState>,
    token: CancellationToken,
) {
    let mut out: Vec<u8> = Vec::with_capacity(4 * 1024);
    while let Some(cmd) = rx.recv().await {
        let result = match cmd {
            WriterCmd::Text(msg) => encode_text(&mut out, msg.as_bytes(), deflate.as_mut()),
            WriterCmd::Flush => flush(&mut socket, &mut out).await,
            WriterCmd::Pong(payload) => {
                push_frame(&mut out, 0x80 | OP_PONG, &payload);
                flush(&mut socket, &mut out).await
            }
            WriterCmd::Close => {
                push_frame(&mut out, 0x80 | OP_CLOSE, &[]);
                let _ = flush(&mut socket, &mut out).await;
                break;
            }
        };
        if result.is_err() {
            // A dead socket tears the whole session down.
            token.cancel();
            break;
        }
    }
}

fn encode_text(
    out: &mut Vec<u8>,
    payload: &[u8],
    deflate: Option<&mut DeflateState>,
) -> Result<(), CodecError> {
    match deflate {
        Some(state) => {
            let compressed = deflate_message(&mut state.context, payload)?;
            push_frame(out, 0x80 | 0x40 | OP_TEXT, &compressed);
            if state.config.server_no_context_takeover {
                state.context.reset();
            }
        }
        None => push_frame(out, 0x80 | OP_TEXT, payload),
    }
    Ok(())
}

async fn flush<W: AsyncWrite + Unpin>(socket: &mut W, out: &mut Vec<u8>) -> Result<(), CodecError> {
    if out.is_empty() {
        return Ok(());
    }
    socket.write_all(out).await?;
    socket.flush().await?;
    out.clear();
    Ok(())
}

/// Appends one server frame (never masked) to `out`.
fn push_frame(out: &mut Vec<u8>, first: u8, payload: &[u8]) {
    out.push(first);
    if payload.len() < 126 {
        out.push(payload.len() as u8);
    } else if payload.len() <= usize::from(u16::MAX) {
        out.push(126);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
}
