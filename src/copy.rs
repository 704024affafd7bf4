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

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::trace;

// Every spliced connection starts with a small buffer in each direction.
const INITIAL_BUFFER_SIZE: usize = 1024;
// Busy connections are moved to a larger buffer, which also means fewer, larger frames.
const LARGE_BUFFER_SIZE: usize = 16_384;
// Bytes moved in one direction before the buffer for that direction grows.
const RESIZE_THRESHOLD: u64 = 128 * 1024;

/// Byte counts for a finished splice, from the point of view of the local side.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Transferred {
    pub sent: u64,
    pub received: u64,
}

/// Copies bytes in both directions until each side has reached EOF.
///
/// A read EOF on one side is propagated as a write shutdown on the other, so a local
/// client closing its socket ends the remote stream while the reverse direction keeps
/// flowing until the remote closes too.
pub async fn copy_bidirectional<A, B>(local: A, remote: B) -> io::Result<Transferred>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = io::split(local);
    let (mut remote_read, mut remote_write) = io::split(remote);

    let local_to_remote = async {
        let res = Splice::new(&mut local_read, &mut remote_write).await;
        trace!(?res, "local to remote finished");
        ignore_shutdown_errors(remote_write.shutdown().await)?;
        res
    };

    let remote_to_local = async {
        let res = Splice::new(&mut remote_read, &mut local_write).await;
        trace!(?res, "remote to local finished");
        ignore_shutdown_errors(local_write.shutdown().await)?;
        res
    };

    // join, not try_join: a failed direction must not cut off data still flowing the other way.
    let (sent, received) = tokio::join!(local_to_remote, remote_to_local);
    let transferred = Transferred {
        sent: sent?,
        received: received?,
    };
    trace!(
        sent = transferred.sent,
        received = transferred.received,
        "splice complete"
    );
    Ok(transferred)
}

// The peer may already be gone when we shut down our write side.
fn ignore_shutdown_errors(res: io::Result<()>) -> io::Result<()> {
    match &res {
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
            ) =>
        {
            Ok(())
        }
        _ => res,
    }
}

/// One direction of a splice. Owns its buffer and grows it once the direction proves busy.
#[must_use = "futures do nothing unless you `.await` or poll them"]
struct Splice<'a, R: ?Sized, W: ?Sized> {
    reader: &'a mut R,
    writer: &'a mut W,
    buf: Box<[u8]>,
    pos: usize,
    cap: usize,
    amt: u64,
    read_done: bool,
    // Written bytes may sit in a buffering writer until flushed.
    need_flush: bool,
}

impl<'a, R, W> Splice<'a, R, W>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    fn new(reader: &'a mut R, writer: &'a mut W) -> Self {
        Splice {
            reader,
            writer,
            buf: vec![0; INITIAL_BUFFER_SIZE].into_boxed_slice(),
            pos: 0,
            cap: 0,
            amt: 0,
            read_done: false,
            need_flush: false,
        }
    }

    fn grow(&mut self) {
        debug_assert_eq!(self.buf.len(), INITIAL_BUFFER_SIZE);
        let mut larger = vec![0u8; LARGE_BUFFER_SIZE].into_boxed_slice();
        larger[..self.cap].copy_from_slice(&self.buf[..self.cap]);
        self.buf = larger;
        trace!("resized buffer to {LARGE_BUFFER_SIZE}");
    }
}

impl<R, W> Future for Splice<'_, R, W>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    type Output = io::Result<u64>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = &mut *self;
        loop {
            if me.pos == me.cap && !me.read_done {
                let mut buf = ReadBuf::new(&mut me.buf);
                match Pin::new(&mut *me.reader).poll_read(cx, &mut buf) {
                    Poll::Ready(res) => res?,
                    Poll::Pending => {
                        // Nothing more to read for now: push out what was written.
                        if me.need_flush {
                            ready!(Pin::new(&mut *me.writer).poll_flush(cx))?;
                            me.need_flush = false;
                        }
                        return Poll::Pending;
                    }
                }
                let n = buf.filled().len();
                if n == 0 {
                    me.read_done = true;
                } else {
                    me.pos = 0;
                    me.cap = n;
                }
            }

            if me.pos < me.cap {
                let i = ready!(Pin::new(&mut *me.writer).poll_write(cx, &me.buf[me.pos..me.cap]))?;
                if i == 0 {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                me.pos += i;
                me.need_flush = true;
                let before = me.amt;
                me.amt += i as u64;
                if before < RESIZE_THRESHOLD && RESIZE_THRESHOLD <= me.amt {
                    me.grow();
                }
            }

            if me.pos == me.cap && me.read_done {
                ready!(Pin::new(&mut *me.writer).poll_flush(cx))?;
                return Poll::Ready(Ok(me.amt));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn copies_both_directions_until_eof() {
        let (local, mut client) = io::duplex(64);
        let (remote, mut server) = io::duplex(64);
        let splice = tokio::spawn(copy_bidirectional(local, remote));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        // Closing the client half-closes the remote side, which then closes too.
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(server);

        let transferred = splice.await.unwrap().unwrap();
        assert_eq!(
            transferred,
            Transferred {
                sent: 4,
                received: 5
            }
        );
    }

    #[tokio::test]
    async fn buffered_writer_is_flushed_while_idle() {
        let (local, mut client) = io::duplex(64);
        let (remote, mut server) = io::duplex(64);
        // BufWriter holds everything until flushed.
        let splice = tokio::spawn(copy_bidirectional(local, io::BufWriter::new(remote)));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tokio::time::timeout(std::time::Duration::from_secs(5), server.read_exact(&mut buf))
            .await
            .expect("bytes stuck in the writer")
            .unwrap();
        assert_eq!(&buf, b"ping");

        drop(client);
        drop(server);
        let _ = splice.await.unwrap();
    }

    #[tokio::test]
    async fn large_transfer_grows_buffer() {
        let (local, mut client) = io::duplex(8 * 1024);
        let (remote, mut server) = io::duplex(8 * 1024);
        let splice = tokio::spawn(copy_bidirectional(local, remote));

        let payload: Vec<u8> = (0..(RESIZE_THRESHOLD as usize * 2))
            .map(|i| (i % 251) as u8)
            .collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
            client
        });
        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, expected);
        drop(server);
        drop(writer.await.unwrap());

        let transferred = splice.await.unwrap().unwrap();
        assert_eq!(transferred.sent, expected.len() as u64);
        assert_eq!(transferred.received, 0);
    }
}
