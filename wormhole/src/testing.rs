//! In-memory transports for tests.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, duplex};
use wormhole_proto::{FrameReader, Packet};

/// Buffer size of each in-memory pipe.
const PIPE: usize = 64 * 1024;

/// The far end of a channel's transport.
pub(crate) struct Remote {
    /// Bytes written here appear on the channel's input.
    to_channel: DuplexStream,
    /// Frames the channel wrote to its output.
    from_channel: FrameReader<DuplexStream>,
}

impl Remote {
    /// Returns `(input, output)` for a channel plus the matching far end.
    pub(crate) fn pair() -> (DuplexStream, DuplexStream, Self) {
        let (input, to_channel) = duplex(PIPE);
        let (output, from_channel) = duplex(PIPE);
        (input, output, Self::from_parts(to_channel, from_channel))
    }

    pub(crate) fn from_parts(to_channel: DuplexStream, from_channel: DuplexStream) -> Self {
        Self {
            to_channel,
            from_channel: FrameReader::new(from_channel),
        }
    }

    pub(crate) async fn send(&mut self, packet: &Packet) {
        self.try_send(packet).await.unwrap();
    }

    pub(crate) async fn try_send(&mut self, packet: &Packet) -> io::Result<()> {
        let frame = wormhole_proto::encode(packet).unwrap();
        self.to_channel.write_all(&frame).await
    }

    /// Writes `bytes` to the channel's input as they are.
    pub(crate) async fn send_raw(&mut self, bytes: &[u8]) {
        self.to_channel.write_all(bytes).await.unwrap();
    }

    pub(crate) async fn recv(&mut self) -> Packet {
        self.from_channel.next_packet().await.unwrap()
    }

    /// Returns `true` if nothing arrives within `window`.
    pub(crate) async fn silent(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.from_channel.next_packet())
            .await
            .is_err()
    }
}

/// Wires two transports back to back: what one side writes, the other reads.
///
/// Returns `(host_input, host_output, guest_input, guest_output)`.
pub(crate) fn crossover() -> (DuplexStream, DuplexStream, DuplexStream, DuplexStream) {
    let (host_input, guest_output) = duplex(PIPE);
    let (guest_input, host_output) = duplex(PIPE);
    (host_input, host_output, guest_input, guest_output)
}

/// A writer whose every write fails.
pub(crate) struct BrokenPipe;

impl AsyncWrite for BrokenPipe {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A reader that fails its first few reads, then behaves.
pub(crate) struct FlakyReader<R> {
    inner: R,
    failures: usize,
}

impl<R> FlakyReader<R> {
    pub(crate) const fn new(inner: R, failures: usize) -> Self {
        Self { inner, failures }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for FlakyReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.failures > 0 {
            self.failures -= 1;
            return Poll::Ready(Err(io::Error::other("link not ready")));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}
