//! Byte streams for accepted VNet TCP connections.

use super::{ConnId, StackCmd};
use bytes::{Buf, Bytes};
use smoltcp::iface::SocketHandle;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::{CancellationToken, PollSender};

/// Connection halves handed back by the driver when an attempt is accepted.
pub(crate) struct AcceptedConn {
    pub handle: SocketHandle,
    pub read_rx: mpsc::Receiver<Bytes>,
    pub write_tx: mpsc::Sender<Bytes>,
    /// Cancelled by the driver on peer FIN/RST or transport error.
    pub peer_events: CancellationToken,
    pub cmds: mpsc::UnboundedSender<StackCmd>,
    pub wake: Arc<Notify>,
}

/// Shared close handle for one connection.
///
/// Closing is idempotent; the first call fires the close-notifier token and
/// asks the driver to close the endpoint once buffered writes have drained.
#[derive(Clone)]
pub(crate) struct ConnCloser {
    handle: SocketHandle,
    cmds: mpsc::UnboundedSender<StackCmd>,
    wake: Arc<Notify>,
    closed: CancellationToken,
}

impl ConnCloser {
    pub(crate) fn new(
        handle: SocketHandle,
        cmds: mpsc::UnboundedSender<StackCmd>,
        wake: Arc<Notify>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            handle,
            cmds,
            wake,
            closed,
        }
    }

    /// Close the connection. Safe to call any number of times from any
    /// holder of the handle.
    pub(crate) fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let _ = self.cmds.send(StackCmd::Close {
            handle: self.handle,
        });
        self.wake.notify_one();
    }

    /// The close-notifier: fires once when the stream is first closed.
    pub(crate) fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }
}

/// Full-duplex byte stream over one accepted VNet TCP connection.
///
/// Reads yield the bytes the peer sent, ending with EOF after the peer
/// closes; writes are flushed into the connection's send buffer. Dropping
/// the stream closes the connection.
pub struct VnetStream {
    id: ConnId,
    read_rx: mpsc::Receiver<Bytes>,
    leftover: Bytes,
    write_tx: PollSender<Bytes>,
    closer: ConnCloser,
}

impl VnetStream {
    pub(crate) fn new(
        id: ConnId,
        read_rx: mpsc::Receiver<Bytes>,
        write_tx: mpsc::Sender<Bytes>,
        closer: ConnCloser,
    ) -> Self {
        Self {
            id,
            read_rx,
            leftover: Bytes::new(),
            write_tx: PollSender::new(write_tx),
            closer,
        }
    }

    /// The VNet-side address the peer connected to.
    pub fn local_addr(&self) -> SocketAddr {
        self.id.local
    }

    /// The peer's address on the host side of the TUN.
    pub fn remote_addr(&self) -> SocketAddr {
        self.id.remote
    }

    /// Close the stream. Equivalent to dropping it; safe to call more than
    /// once.
    pub fn close(&self) {
        self.closer.close();
    }
}

impl AsyncRead for VnetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.leftover.is_empty() {
            let n = this.leftover.len().min(buf.remaining());
            buf.put_slice(&this.leftover[..n]);
            this.leftover.advance(n);
            return Poll::Ready(Ok(()));
        }

        match this.read_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                if n < chunk.len() {
                    this.leftover = chunk.slice(n..);
                }
                // Freed channel capacity; let the driver refill it.
                this.closer.wake();
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())), // EOF
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for VnetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if ready!(this.write_tx.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "VNet connection closed",
            )));
        }
        let len = buf.len();
        if this.write_tx.send_item(Bytes::copy_from_slice(buf)).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "VNet connection closed",
            )));
        }
        this.closer.wake();
        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().closer.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for VnetStream {
    fn drop(&mut self) {
        self.closer.close();
    }
}
