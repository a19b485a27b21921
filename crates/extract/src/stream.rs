//! The page→host audio byte channel.
//!
//! The in-page capture script talks to the host through one CDP binding,
//! posting tagged JSON messages. The host relays decoded chunks into a
//! bounded channel consumed by the playback engine as an `AudioStream`.

use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tubetap_core::{Error, Result};

/// Output channel depth. The relay awaits capacity, so a slow consumer
/// buffers here instead of inside the page.
pub(crate) const CHANNEL_CAPACITY: usize = 64;

/// Tagged message posted by the in-page capture script through the binding.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SinkMessage {
    /// One encoded audio chunk, base64 over the string-only binding.
    Chunk { data: String },
    /// Clean end of capture (recorder stopped).
    End,
    /// In-page capture failure.
    Error { message: String },
}

impl SinkMessage {
    pub fn parse(payload: &str) -> Result<SinkMessage> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Decode a chunk payload into bytes.
pub fn decode_chunk(data: &str) -> Result<Bytes> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| Error::Capture(format!("chunk decode: {}", e)))?;
    Ok(Bytes::from(bytes))
}

/// A sequential, single-consumer stream of encoded audio chunks.
///
/// Chunks arrive in production order. The stream terminates with a normal
/// end (the channel closes) or one final `Err` item. Closing or dropping it
/// cancels the capture that feeds it.
pub struct AudioStream {
    rx: mpsc::Receiver<Result<Bytes>>,
    cancel: CancellationToken,
}

impl AudioStream {
    /// Build the producer side (sender + cancellation token) and the
    /// consumer-facing stream.
    pub(crate) fn channel() -> (mpsc::Sender<Result<Bytes>>, CancellationToken, AudioStream) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let stream = AudioStream {
            rx,
            cancel: cancel.clone(),
        };
        (tx, cancel, stream)
    }

    /// Receive the next chunk. `None` means a clean end of stream.
    pub async fn recv(&mut self) -> Option<Result<Bytes>> {
        self.rx.recv().await
    }

    /// Close the stream, cancelling the capture feeding it.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.rx.close();
    }
}

impl futures::Stream for AudioStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn parses_chunk_message() {
        let msg = SinkMessage::parse(r#"{"type":"chunk","data":"AQID"}"#).unwrap();
        match msg {
            SinkMessage::Chunk { data } => assert_eq!(data, "AQID"),
            other => panic!("expected chunk, got {:?}", other),
        }
    }

    #[test]
    fn parses_end_and_error_messages() {
        assert!(matches!(
            SinkMessage::parse(r#"{"type":"end"}"#).unwrap(),
            SinkMessage::End
        ));
        match SinkMessage::parse(r#"{"type":"error","message":"boom"}"#).unwrap() {
            SinkMessage::Error { message } => assert_eq!(message, "boom"),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_message_shape() {
        assert!(SinkMessage::parse(r#"{"kind":"chunk"}"#).is_err());
        assert!(SinkMessage::parse("not json").is_err());
    }

    #[test]
    fn decodes_chunk_payload() {
        assert_eq!(decode_chunk("AQID").unwrap().as_ref(), &[1, 2, 3]);
        assert!(matches!(
            decode_chunk("not base64!!!"),
            Err(Error::Capture(_))
        ));
    }

    #[tokio::test]
    async fn delivers_chunks_in_order_then_ends() {
        let (tx, _cancel, mut stream) = AudioStream::channel();
        tx.send(Ok(Bytes::from_static(b"a"))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"b"))).await.unwrap();
        drop(tx);

        assert_eq!(stream.next().await.unwrap().unwrap().as_ref(), b"a");
        assert_eq!(stream.next().await.unwrap().unwrap().as_ref(), b"b");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn error_item_terminates_the_stream() {
        let (tx, _cancel, mut stream) = AudioStream::channel();
        tx.send(Err(Error::Capture("boom".into()))).await.unwrap();
        drop(tx);

        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_the_stream_fires_cancellation() {
        let (_tx, cancel, stream) = AudioStream::channel();
        assert!(!cancel.is_cancelled());
        drop(stream);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn close_fires_cancellation() {
        let (_tx, cancel, mut stream) = AudioStream::channel();
        stream.close();
        assert!(cancel.is_cancelled());
    }
}
