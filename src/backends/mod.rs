use crate::error::BackendError;
use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

pub mod gemini;
pub mod kimi;
pub mod sydney;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TextDelta,
    Error,
    Done,
    GenerativeImage,
    ConversationId,
}

impl MessageKind {
    /// Event name used by the raw per-backend stream endpoints.
    pub fn event_name(self) -> &'static str {
        match self {
            MessageKind::TextDelta => "message",
            MessageKind::Error => "error",
            MessageKind::Done => "done",
            MessageKind::GenerativeImage => "generative_image",
            MessageKind::ConversationId => "conv_id",
        }
    }
}

/// One backend-agnostic unit of streamed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedMessage {
    pub kind: MessageKind,
    pub payload: String,
}

impl NormalizedMessage {
    pub fn new(kind: MessageKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn text(payload: impl Into<String>) -> Self {
        Self::new(MessageKind::TextDelta, payload)
    }

    pub fn error(payload: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, payload)
    }

    pub fn done() -> Self {
        Self::new(MessageKind::Done, "")
    }
}

/// Producer half of a normalized message channel.
pub struct MessageSink {
    tx: mpsc::Sender<NormalizedMessage>,
    cancel: CancellationToken,
}

impl MessageSink {
    /// Blocks until the consumer takes the message. Returns `false` once the
    /// consumer is gone or the stream was cancelled.
    pub async fn send(&self, message: NormalizedMessage) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(message) => sent.is_ok(),
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Consumer half. Dropping it cancels the producer.
pub struct MessageStream {
    rx: mpsc::Receiver<NormalizedMessage>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl MessageStream {
    /// Stops the producer promptly; messages already queued may still be read.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn recv(&mut self) -> Option<NormalizedMessage> {
        self.rx.recv().await
    }
}

impl Stream for MessageStream {
    type Item = NormalizedMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Single-slot channel: the producer can run at most one message ahead.
pub fn message_channel() -> (MessageSink, MessageStream) {
    let (tx, rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let sink = MessageSink {
        tx,
        cancel: cancel.clone(),
    };
    let stream = MessageStream {
        rx,
        _guard: cancel.clone().drop_guard(),
        cancel,
    };
    (sink, stream)
}

#[derive(Debug, Clone)]
pub enum FrameError {
    /// The frame could not be decoded; the reader skips it.
    Malformed(String),
    /// The transport failed; the reader stops.
    Transport(String),
}

/// Translates raw upstream frames into the shared taxonomy.
pub trait StreamNormalizer: Send + 'static {
    fn normalize(&mut self, frame: &str) -> Result<Vec<NormalizedMessage>, BackendError>;

    /// Messages to emit after a clean upstream EOF.
    fn finish(&mut self) -> Vec<NormalizedMessage> {
        Vec::new()
    }
}

/// Adapts an SSE byte stream into `data:` payload frames.
pub fn sse_frames<S, B, E>(bytes: S) -> impl Stream<Item = Result<String, FrameError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    bytes.eventsource().map(|event| match event {
        Ok(event) => Ok(event.data),
        Err(EventStreamError::Transport(err)) => Err(FrameError::Transport(err.to_string())),
        Err(err) => Err(FrameError::Malformed(err.to_string())),
    })
}

/// Spawns the one reader task for a backend stream.
pub fn spawn_reader<S, N>(backend: &'static str, frames: S, normalizer: N) -> MessageStream
where
    S: Stream<Item = Result<String, FrameError>> + Send + 'static,
    N: StreamNormalizer,
{
    let (sink, stream) = message_channel();
    tokio::spawn(run_reader(backend, Box::pin(frames), normalizer, sink));
    stream
}

async fn run_reader<S, N>(
    backend: &'static str,
    mut frames: Pin<Box<S>>,
    mut normalizer: N,
    sink: MessageSink,
) where
    S: Stream<Item = Result<String, FrameError>> + Send,
    N: StreamNormalizer,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = sink.cancellation().cancelled() => {
                tracing::debug!(backend, "stream cancelled by consumer");
                return;
            }
            next = frames.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(FrameError::Malformed(err))) => {
                tracing::debug!(backend, "skipping undecodable frame: {err}");
                continue;
            }
            Some(Err(FrameError::Transport(err))) => {
                tracing::warn!(backend, "{}", BackendError::UpstreamRead(err));
                return;
            }
            None => {
                for message in normalizer.finish() {
                    if !forward(backend, &sink, message).await {
                        return;
                    }
                }
                return;
            }
        };

        match normalizer.normalize(&frame) {
            Ok(messages) => {
                for message in messages {
                    if !forward(backend, &sink, message).await {
                        tracing::debug!(backend, "consumer gone, stopping reader");
                        return;
                    }
                }
            }
            Err(err) => {
                tracing::debug!(backend, "{err}");
            }
        }
    }
}

async fn forward(backend: &'static str, sink: &MessageSink, message: NormalizedMessage) -> bool {
    metrics::counter!(
        "ollm_stream_messages_total",
        "backend" => backend,
        "kind" => message.kind.event_name()
    )
    .increment(1);
    sink.send(message).await
}

/// Per-request input to a backend, already flattened from the inbound body.
#[derive(Debug, Clone, Default)]
pub struct ChatTurn {
    pub prompt: String,
    /// Prior transcript passed alongside the prompt (Sydney webpage context).
    pub context: Option<String>,
    pub image_url: Option<String>,
    /// Existing backend conversation to continue.
    pub session_id: Option<String>,
    /// Refresh token, API key or cookie string overriding the configured default.
    pub credential: Option<String>,
    pub model: Option<String>,
    pub style: Option<String>,
    pub search: bool,
    pub gpt4_turbo: bool,
    pub use_classic: bool,
    pub plugins: Vec<String>,
}

#[async_trait]
pub trait StreamingChatBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Opens the upstream stream. Connection failures are returned here,
    /// before any message is produced.
    async fn start_chat(&self, turn: ChatTurn) -> Result<MessageStream, BackendError>;
}

/// Descriptor of an image the backend offered to create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerativeImage {
    pub text: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedImages {
    pub generative_image: GenerativeImage,
    pub image_urls: Vec<String>,
    pub duration_ms: u64,
}

/// Backend collaborator that can also upload and render images.
#[async_trait]
pub trait ImageBackend: StreamingChatBackend {
    async fn upload_image(
        &self,
        bytes: Vec<u8>,
        cookies: Option<&str>,
    ) -> Result<String, BackendError>;

    async fn generate_image(
        &self,
        image: &GenerativeImage,
        cookies: Option<&str>,
    ) -> Result<GeneratedImages, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    struct EchoNormalizer;

    impl StreamNormalizer for EchoNormalizer {
        fn normalize(&mut self, frame: &str) -> Result<Vec<NormalizedMessage>, BackendError> {
            if frame == "bad" {
                return Err(BackendError::Parse(frame.to_string()));
            }
            Ok(vec![NormalizedMessage::text(frame)])
        }

        fn finish(&mut self) -> Vec<NormalizedMessage> {
            vec![NormalizedMessage::done()]
        }
    }

    async fn collect(mut stream: MessageStream) -> Vec<NormalizedMessage> {
        let mut out = Vec::new();
        while let Some(m) = stream.recv().await {
            out.push(m);
        }
        out
    }

    #[tokio::test]
    async fn reader_preserves_order_and_skips_parse_failures() {
        let frames = futures_util::stream::iter(vec![
            Ok("a".to_string()),
            Ok("bad".to_string()),
            Err(FrameError::Malformed("utf8".to_string())),
            Ok("b".to_string()),
        ]);
        let out = collect(spawn_reader("test", frames, EchoNormalizer)).await;
        assert_eq!(
            out,
            vec![
                NormalizedMessage::text("a"),
                NormalizedMessage::text("b"),
                NormalizedMessage::done()
            ]
        );
    }

    #[tokio::test]
    async fn transport_error_truncates_without_epilogue() {
        let frames = futures_util::stream::iter(vec![
            Ok("a".to_string()),
            Err(FrameError::Transport("reset".to_string())),
            Ok("never".to_string()),
        ]);
        let out = collect(spawn_reader("test", frames, EchoNormalizer)).await;
        assert_eq!(out, vec![NormalizedMessage::text("a")]);
    }

    #[tokio::test]
    async fn sse_frames_strip_data_prefix() {
        let body = "data: {\"x\":1}\n\ndata: second\n\n";
        let chunks = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(body))]);
        let frames: Vec<_> = sse_frames(chunks).collect().await;
        let frames: Vec<String> = frames.into_iter().filter_map(Result::ok).collect();
        assert_eq!(frames, vec!["{\"x\":1}".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_reader() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let frames = futures_util::stream::unfold(Some(tx), |tx| async move {
            // Endless upstream; the token is the only way out.
            let _keep = &tx;
            tokio::time::sleep(Duration::from_millis(5)).await;
            Some((Ok::<_, FrameError>("tick".to_string()), tx))
        });
        let mut stream = spawn_reader("test", frames, EchoNormalizer);
        assert_eq!(stream.recv().await, Some(NormalizedMessage::text("tick")));
        drop(stream);
        // The reader drops its frame source (and the sender inside it) once it stops.
        let closed = tokio::time::timeout(Duration::from_secs(2), rx).await;
        assert!(matches!(closed, Ok(Err(_))));
    }

    #[tokio::test]
    async fn explicit_cancel_stops_producer() {
        let (sink, stream) = message_channel();
        assert!(sink.send(NormalizedMessage::text("one")).await);
        stream.cancel();
        assert!(stream.is_cancelled());
        assert!(!sink.send(NormalizedMessage::text("two")).await);
    }
}
