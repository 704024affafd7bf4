// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Framing for the channelled websocket protocol.
//!
//! Every binary message starts with a channel byte. The port requested at index `i`
//! owns data channel `2i` and error channel `2i + 1`. The server opens every channel
//! by sending the port number as two little-endian bytes; only after that does the
//! channel carry payload.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::trace;

// Error channel text is a single message; anything longer is truncated.
pub const MAX_ERROR_MESSAGE: usize = 4 * 1024;
// Upper bound on the payload of one outgoing data message.
const MAX_WRITE_PAYLOAD: usize = 32 * 1024;

pub fn data_channel(index: usize) -> u8 {
    (index * 2) as u8
}

pub fn error_channel(index: usize) -> u8 {
    (index * 2 + 1) as u8
}

/// Builds a binary message carrying `payload` on `channel`.
pub fn frame(channel: u8, payload: &[u8]) -> Message {
    let mut buf = Vec::with_capacity(payload.len() + 1);
    buf.push(channel);
    buf.extend_from_slice(payload);
    Message::Binary(buf)
}

/// Splits a binary message into its channel and payload.
pub fn split_frame(message: &[u8]) -> Option<(u8, &[u8])> {
    message.split_first().map(|(channel, payload)| (*channel, payload))
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("empty message")]
    Empty,
    #[error("message on unknown channel {0}")]
    UnknownChannel(u8),
    #[error("channel {channel} opened with a truncated port prefix")]
    ShortPrefix { channel: u8 },
    #[error("channel {channel} opened for port {got}, expected {expected}")]
    PortMismatch { channel: u8, expected: u16, got: u16 },
}

impl From<ChannelError> for io::Error {
    fn from(e: ChannelError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

/// Tracks the port prefix the server sends first on every channel.
#[derive(Debug, Clone)]
pub struct Prefixes {
    ports: Vec<u16>,
    opened: Vec<bool>,
    remaining: usize,
}

impl Prefixes {
    pub fn new(ports: &[u16]) -> Self {
        Prefixes {
            ports: ports.to_vec(),
            opened: vec![false; ports.len() * 2],
            remaining: ports.len() * 2,
        }
    }

    /// Whether every channel has been opened.
    pub fn complete(&self) -> bool {
        self.remaining == 0
    }

    /// Strips the port prefix from the first message on a channel and checks it
    /// names the port requested for that channel. Returns the rest of the payload.
    pub fn accept<'a>(&mut self, channel: u8, payload: &'a [u8]) -> Result<&'a [u8], ChannelError> {
        let index = usize::from(channel);
        let opened = self
            .opened
            .get_mut(index)
            .ok_or(ChannelError::UnknownChannel(channel))?;
        if *opened {
            return Ok(payload);
        }
        let (prefix, rest) = payload
            .split_first_chunk::<2>()
            .ok_or(ChannelError::ShortPrefix { channel })?;
        let got = u16::from_le_bytes(*prefix);
        let expected = self.ports[index / 2];
        if got != expected {
            return Err(ChannelError::PortMismatch {
                channel,
                expected,
                got,
            });
        }
        *opened = true;
        self.remaining -= 1;
        Ok(rest)
    }
}

/// Maps websocket failures onto the io errors a byte stream user expects.
pub fn ws_to_io_error(e: WsError) -> io::Error {
    match e {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => io::ErrorKind::BrokenPipe.into(),
        e => io::Error::other(e),
    }
}

/// ChannelStream exposes the data channel of a single-port session as a byte stream.
///
/// Reads return data channel payload and end when the server closes the session.
/// Text on the error channel is collected and can be read with
/// [`ChannelStream::remote_error`] once the stream has ended. The protocol has no
/// half-close, so shutdown closes the whole session.
pub struct ChannelStream<IO> {
    ws: WebSocketStream<IO>,
    prefixes: Prefixes,
    // Remainder of a data message larger than the caller's buffer.
    pending: Bytes,
    remote_error: String,
    eof: bool,
}

impl<IO> ChannelStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(ws: WebSocketStream<IO>, port: u16) -> Self {
        ChannelStream {
            ws,
            prefixes: Prefixes::new(&[port]),
            pending: Bytes::new(),
            remote_error: String::new(),
            eof: false,
        }
    }

    /// Text the server wrote on the error channel so far.
    pub fn remote_error(&self) -> &str {
        &self.remote_error
    }

    fn on_message(&mut self, data: Vec<u8>) -> io::Result<()> {
        let (channel, payload) = split_frame(&data).ok_or(ChannelError::Empty)?;
        let rest = self.prefixes.accept(channel, payload)?;
        if channel == data_channel(0) {
            let skip = data.len() - rest.len();
            self.pending = Bytes::from(data).slice(skip..);
        } else {
            let room = MAX_ERROR_MESSAGE.saturating_sub(self.remote_error.len());
            let text = String::from_utf8_lossy(&rest[..rest.len().min(room)]);
            self.remote_error.push_str(&text);
        }
        Ok(())
    }
}

impl<IO> AsyncRead for ChannelStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.ws.poll_next_unpin(cx)) {
                Some(Ok(Message::Binary(data))) => this.on_message(data)?,
                Some(Ok(Message::Close(frame))) => {
                    trace!(?frame, "session closed by remote");
                    this.eof = true;
                }
                // Control frames are answered by the websocket itself.
                Some(Ok(_)) => {}
                // A server dropping the connection without a close handshake still ends the stream.
                None
                | Some(Err(
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake),
                )) => {
                    this.eof = true;
                }
                Some(Err(e)) => return Poll::Ready(Err(ws_to_io_error(e))),
            }
        }
    }
}

impl<IO> AsyncWrite for ChannelStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(this.ws.poll_ready_unpin(cx)).map_err(ws_to_io_error)?;
        let n = buf.len().min(MAX_WRITE_PAYLOAD);
        this.ws
            .start_send_unpin(frame(data_channel(0), &buf[..n]))
            .map_err(ws_to_io_error)?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut()
            .ws
            .poll_flush_unpin(cx)
            .map_err(ws_to_io_error)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(self.get_mut().ws.poll_close_unpin(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(ws_to_io_error(e))),
        }
    }
}
