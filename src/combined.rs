// ABOUTME: In-process pipe merging forwarded stdout and stderr bytes into one stream
// ABOUTME: Each channel relay writes through a tap; the combined relay reads the merged side
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::PollSender;
use tracing::warn;

/// Chunks buffered between the taps and the combined relay
const PIPE_DEPTH: usize = 16;

/// Readable side of the combined pipe
pub(crate) type CombinedReader = StreamReader<ReceiverStream<io::Result<Bytes>>, Bytes>;

/// Writable tap feeding the combined pipe
///
/// Writes wait for pipe capacity, so a stalled combined relay slows the
/// channel relays that feed it. Shutting a tap down releases its sender;
/// the reader sees end-of-stream once every tap is gone.
///
/// Once the combined relay has stopped reading, writes are accepted and
/// discarded so the channel relay feeding this tap keeps going.
pub(crate) struct CombinedTap {
    sender: PollSender<io::Result<Bytes>>,
    discarding: bool,
}

/// Create the reader and one tap per feeding channel
pub(crate) fn combined_pipe(taps: usize) -> (Vec<CombinedTap>, CombinedReader) {
    let (tx, rx) = mpsc::channel(PIPE_DEPTH);
    let taps = (0..taps)
        .map(|_| CombinedTap {
            sender: PollSender::new(tx.clone()),
            discarding: false,
        })
        .collect();
    (taps, StreamReader::new(ReceiverStream::new(rx)))
}

impl CombinedTap {
    fn start_discarding(&mut self) {
        if !self.discarding {
            self.discarding = true;
            warn!("Combined pipe closed, discarding further combined output");
        }
    }
}

impl AsyncWrite for CombinedTap {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if self.discarding {
            return Poll::Ready(Ok(buf.len()));
        }
        let sent = ready!(self.sender.poll_reserve(cx))
            .and_then(|()| self.sender.send_item(Ok(Bytes::copy_from_slice(buf))));
        if sent.is_err() {
            self.start_discarding();
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.sender.close();
        Poll::Ready(Ok(()))
    }
}
