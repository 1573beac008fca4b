//! Stream fan-out for tee'd ingestion.
//!
//! [`pausing_tee`] splits one byte stream into two branches so the cache
//! can buffer an object while the original consumer keeps streaming it.
//! Backpressure is synchronized through bounded channels: a chunk is not
//! pulled from the source until every open branch has accepted the previous
//! one.  A branch whose receiver is dropped stops gating the source instead
//! of stalling the remaining branch.

use std::io;
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// A fallible stream of byte chunks, the currency of every streaming path
/// in this crate.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Per-branch channel depth, in chunks.
const TEE_CHANNEL_DEPTH: usize = 32;

/// Split `source` into two synchronized branches.
///
/// Chunks are delivered to both branches in order; a source error is
/// surfaced on both and terminates the tee.  The pump task ends when the
/// source is exhausted or both receivers are gone.
pub fn pausing_tee(mut source: ByteStream) -> (ByteStream, ByteStream) {
    let (tx_a, rx_a) = mpsc::channel::<io::Result<Bytes>>(TEE_CHANNEL_DEPTH);
    let (tx_b, rx_b) = mpsc::channel::<io::Result<Bytes>>(TEE_CHANNEL_DEPTH);

    tokio::spawn(async move {
        let mut a_open = true;
        let mut b_open = true;

        while let Some(item) = source.next().await {
            match item {
                Ok(chunk) => {
                    if a_open && tx_a.send(Ok(chunk.clone())).await.is_err() {
                        a_open = false;
                    }
                    if b_open && tx_b.send(Ok(chunk)).await.is_err() {
                        b_open = false;
                    }
                    if !a_open && !b_open {
                        break;
                    }
                }
                Err(e) => {
                    let msg = e.to_string();
                    if a_open {
                        let _ = tx_a.send(Err(io::Error::other(msg.clone()))).await;
                    }
                    if b_open {
                        let _ = tx_b.send(Err(io::Error::other(msg))).await;
                    }
                    break;
                }
            }
        }
    });

    (
        Box::pin(ReceiverStream::new(rx_a)),
        Box::pin(ReceiverStream::new(rx_b)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked_stream(chunks: Vec<&'static [u8]>) -> ByteStream {
        Box::pin(futures::stream::iter(
            chunks.into_iter().map(|c| Ok(Bytes::from_static(c))),
        ))
    }

    async fn collect(mut stream: ByteStream) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn both_branches_see_all_chunks_in_order() {
        let source = chunked_stream(vec![&b"hello "[..], &b"tee "[..], &b"world"[..]]);
        let (a, b) = pausing_tee(source);

        let (a, b) = tokio::join!(collect(a), collect(b));
        assert_eq!(a.unwrap(), b"hello tee world");
        assert_eq!(b.unwrap(), b"hello tee world");
    }

    #[tokio::test]
    async fn dropped_branch_does_not_stall_the_other() {
        // More chunks than the channel depth so the pump would block
        // forever on a branch that still gated the source.
        let chunks: Vec<&'static [u8]> = (0..TEE_CHANNEL_DEPTH * 4).map(|_| &b"x"[..]).collect();
        let expected = chunks.len();

        let (a, b) = pausing_tee(chunked_stream(chunks));
        drop(b);

        let got = collect(a).await.unwrap();
        assert_eq!(got.len(), expected);
    }

    #[tokio::test]
    async fn source_error_reaches_both_branches() {
        let source: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::other("backing store hung up")),
        ]));
        let (a, b) = pausing_tee(source);

        let (a, b) = tokio::join!(collect(a), collect(b));
        assert!(a.is_err());
        assert!(b.is_err());
    }
}
