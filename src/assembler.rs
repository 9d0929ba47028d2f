use crate::backends::{GenerativeImage, MessageKind, MessageStream, NormalizedMessage};
use crate::error::{AppError, AppResult};
use crate::openai::{
    AssistantMessage, ChatCompletion, ChatCompletionChunk, ChunkChoice, ChunkDelta,
    CompletionChoice, FinishReason, error_marker,
};
use crate::usage::estimate_usage;
use axum::http::StatusCode;
use axum::response::sse::Event;
use futures_util::{Stream, StreamExt};

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// One SSE frame of an OpenAI-style stream.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    Chunk(ChatCompletionChunk),
    Done,
}

impl StreamFrame {
    pub fn into_event(self) -> Event {
        match self {
            StreamFrame::Chunk(chunk) => {
                Event::default().data(serde_json::to_string(&chunk).unwrap_or_default())
            }
            StreamFrame::Done => Event::default().data("[DONE]"),
        }
    }
}

/// Turns normalized backend output into OpenAI chat-completion shapes.
#[derive(Debug, Clone)]
pub struct CompletionAssembler {
    id: String,
    created: i64,
    model: String,
    prompt: String,
}

enum RelayPhase {
    Relaying,
    Closing,
    Closed,
}

struct RelayState<S> {
    assembler: CompletionAssembler,
    messages: S,
    errored: bool,
    role_sent: bool,
    phase: RelayPhase,
}

impl CompletionAssembler {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            created: now_ts(),
            model: model.into(),
            prompt: String::new(),
        }
    }

    /// Prompt text used only for usage estimation.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<FinishReason>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    /// Live relay: one chunk per text or error message, then a closing chunk
    /// and the `[DONE]` sentinel. Dropping the returned stream drops `messages`.
    pub fn relay<S>(self, messages: S) -> impl Stream<Item = StreamFrame> + Send
    where
        S: Stream<Item = NormalizedMessage> + Send + Unpin,
    {
        let state = RelayState {
            assembler: self,
            messages,
            errored: false,
            role_sent: false,
            phase: RelayPhase::Relaying,
        };
        futures_util::stream::unfold(state, |mut state| async move {
            match state.phase {
                RelayPhase::Relaying => loop {
                    let Some(message) = state.messages.next().await else {
                        let reason = FinishReason::for_outcome(state.errored);
                        let chunk = state.assembler.chunk(ChunkDelta::default(), Some(reason));
                        state.phase = RelayPhase::Closing;
                        return Some((StreamFrame::Chunk(chunk), state));
                    };
                    let content = match message.kind {
                        MessageKind::TextDelta => message.payload,
                        MessageKind::Error => {
                            state.errored = true;
                            error_marker(&message.payload)
                        }
                        MessageKind::Done
                        | MessageKind::GenerativeImage
                        | MessageKind::ConversationId => continue,
                    };
                    let role = if state.role_sent { None } else { Some("assistant") };
                    state.role_sent = true;
                    let delta = ChunkDelta {
                        role,
                        content: Some(content),
                    };
                    let chunk = state.assembler.chunk(delta, None);
                    return Some((StreamFrame::Chunk(chunk), state));
                },
                RelayPhase::Closing => {
                    state.phase = RelayPhase::Closed;
                    Some((StreamFrame::Done, state))
                }
                RelayPhase::Closed => None,
            }
        })
    }

    /// Drains `messages` into a single completion.
    pub async fn aggregate<S>(self, mut messages: S) -> ChatCompletion
    where
        S: Stream<Item = NormalizedMessage> + Unpin,
    {
        let mut content = String::new();
        let mut errored = false;
        while let Some(message) = messages.next().await {
            match message.kind {
                MessageKind::TextDelta => content.push_str(&message.payload),
                MessageKind::Error => {
                    errored = true;
                    content.push_str(&error_marker(&message.payload));
                }
                MessageKind::Done | MessageKind::GenerativeImage | MessageKind::ConversationId => {}
            }
        }

        let usage = estimate_usage(&self.prompt, &content);
        ChatCompletion {
            id: self.id,
            object: "chat.completion",
            created: self.created,
            model: self.model,
            system_fingerprint: None,
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant",
                    content,
                },
                finish_reason: FinishReason::for_outcome(errored),
            }],
            usage,
        }
    }
}

/// Backend-native relay: every message as `event: <kind>` with a JSON string payload.
pub fn relay_raw<S>(messages: S) -> impl Stream<Item = Event> + Send
where
    S: Stream<Item = NormalizedMessage> + Send,
{
    messages.map(|message| {
        Event::default()
            .event(message.kind.event_name())
            .data(serde_json::to_string(&message.payload).unwrap_or_default())
    })
}

/// Waits for the first usable image descriptor, then stops the upstream reader.
pub async fn await_generative_image(mut messages: MessageStream) -> AppResult<GenerativeImage> {
    let mut last_error = None;
    while let Some(message) = messages.recv().await {
        match message.kind {
            MessageKind::GenerativeImage => {
                match serde_json::from_str::<GenerativeImage>(&message.payload) {
                    Ok(image) => {
                        messages.cancel();
                        return Ok(image);
                    }
                    Err(err) => tracing::debug!("ignoring undecodable image descriptor: {err}"),
                }
            }
            MessageKind::Error => last_error = Some(message.payload),
            MessageKind::TextDelta | MessageKind::Done | MessageKind::ConversationId => {}
        }
    }

    let message = match last_error {
        Some(err) => format!("empty generative image: {err}"),
        None => "empty generative image".to_string(),
    };
    Err(AppError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "empty_generative_image",
        message,
    )
    .with_type("api_error"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::message_channel;
    use serde_json::{Value, json};

    fn source(
        messages: Vec<NormalizedMessage>,
    ) -> impl Stream<Item = NormalizedMessage> + Send + Unpin {
        futures_util::stream::iter(messages)
    }

    async fn relay_json(messages: Vec<NormalizedMessage>) -> (Vec<Value>, bool) {
        let frames: Vec<StreamFrame> = CompletionAssembler::new("KIMI")
            .relay(source(messages))
            .collect()
            .await;
        let mut chunks = Vec::new();
        let mut done_last = false;
        for (idx, frame) in frames.iter().enumerate() {
            match frame {
                StreamFrame::Chunk(chunk) => chunks.push(serde_json::to_value(chunk).unwrap()),
                StreamFrame::Done => done_last = idx == frames.len() - 1,
            }
        }
        (chunks, done_last)
    }

    #[tokio::test]
    async fn streaming_relays_each_delta_then_stop() {
        let (chunks, done_last) = relay_json(vec![
            NormalizedMessage::text("He"),
            NormalizedMessage::text("llo"),
            NormalizedMessage::done(),
            NormalizedMessage::new(MessageKind::ConversationId, "c1"),
        ])
        .await;
        assert!(done_last);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0]["object"], "chat.completion.chunk");
        assert_eq!(chunks[0]["model"], "KIMI");
        assert_eq!(chunks[0]["choices"][0]["delta"], json!({"role": "assistant", "content": "He"}));
        assert_eq!(chunks[1]["choices"][0]["delta"], json!({"content": "llo"}));
        assert_eq!(chunks[1]["choices"][0]["finish_reason"], Value::Null);
        assert_eq!(chunks[2]["choices"][0]["delta"], json!({}));
        assert_eq!(chunks[2]["choices"][0]["finish_reason"], "stop");
        assert_eq!(chunks[0]["id"], chunks[2]["id"]);
    }

    #[tokio::test]
    async fn streaming_error_is_visible_and_finishes_with_length() {
        let (chunks, done_last) = relay_json(vec![
            NormalizedMessage::text("par"),
            NormalizedMessage::error("quota"),
        ])
        .await;
        assert!(done_last);
        assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "`Error: quota`");
        assert_eq!(chunks[2]["choices"][0]["finish_reason"], "length");
    }

    #[tokio::test]
    async fn empty_source_still_closes_the_stream() {
        let (chunks, done_last) = relay_json(Vec::new()).await;
        assert!(done_last);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0]["choices"][0]["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn aggregate_concatenates_text_and_errors() {
        let completion = CompletionAssembler::new("gemini-pro")
            .with_prompt("user:hi\n")
            .aggregate(source(vec![
                NormalizedMessage::text("He"),
                NormalizedMessage::text("llo"),
                NormalizedMessage::done(),
            ]))
            .await;
        let body = serde_json::to_value(&completion).unwrap();
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"], json!({"role": "assistant", "content": "Hello"}));
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));

        let failed = CompletionAssembler::new("kimi")
            .aggregate(source(vec![
                NormalizedMessage::text("a"),
                NormalizedMessage::error("boom"),
            ]))
            .await;
        assert_eq!(failed.choices[0].message.content, "a`Error: boom`");
        assert_eq!(failed.choices[0].finish_reason, FinishReason::Length);
    }

    #[tokio::test]
    async fn raw_relay_names_events_by_kind() {
        let events: Vec<Event> = relay_raw(source(vec![
            NormalizedMessage::text("hi"),
            NormalizedMessage::new(MessageKind::ConversationId, "c1"),
        ]))
        .collect()
        .await;
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn await_one_returns_first_descriptor_and_cancels() {
        let (sink, stream) = message_channel();
        let producer = tokio::spawn(async move {
            sink.send(NormalizedMessage::text("thinking")).await;
            let image = json!({"text": "fox", "url": "https://bing/create"}).to_string();
            sink.send(NormalizedMessage::new(MessageKind::GenerativeImage, image)).await;
            // Blocks until the consumer cancels.
            sink.send(NormalizedMessage::text("more")).await;
            sink.send(NormalizedMessage::text("never")).await
        });
        let image = await_generative_image(stream).await.unwrap();
        assert_eq!(image.text, "fox");
        assert!(!producer.await.unwrap());
    }

    #[tokio::test]
    async fn await_one_fails_when_no_descriptor_arrives() {
        let (sink, stream) = message_channel();
        tokio::spawn(async move {
            sink.send(NormalizedMessage::new(MessageKind::GenerativeImage, "not json")).await;
            sink.send(NormalizedMessage::error("disengaged")).await;
        });
        let err = await_generative_image(stream).await.unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.message.contains("empty generative image"));
    }
}
