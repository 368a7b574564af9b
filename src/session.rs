use futures::Stream;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::chat::{ChatEntry, Message, NewMessage, Role, VisionAnalysis};
use crate::error::ApiError;
use crate::gateway::vision::VisionGateway;
use crate::gateway::GenerationGateway;
use crate::store::Store;
use crate::weather::WeatherService;

/// Wire payload for one server-sent event. Exactly one shape per event:
/// `{"status":"connected"}`, `{"chunk":...}`, `{"done":true,"messageId":...}`
/// or `{"error":...}` — clients parse these via EventSource.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum StreamEvent {
    Connected {
        status: &'static str,
    },
    Chunk {
        chunk: String,
    },
    Done {
        done: bool,
        #[serde(rename = "messageId")]
        message_id: String,
    },
    Error {
        error: String,
    },
}

impl StreamEvent {
    pub fn connected() -> Self {
        StreamEvent::Connected { status: "connected" }
    }

    pub fn done(message_id: String) -> Self {
        StreamEvent::Done { done: true, message_id }
    }
}

/// Lifecycle of one streaming session. Lives only for the duration of a
/// single client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Pending,
    Streaming,
    Completed,
    Errored,
    TimedOut,
    Aborted,
}

/// Logs abandonment when the client drops the SSE connection: the
/// generator is simply dropped mid-flight, so the guard is the only place
/// left to observe it.
struct StreamGuard {
    conversation_id: String,
    finished: bool,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if !self.finished {
            info!(
                conversation_id = %self.conversation_id,
                state = ?StreamState::Aborted,
                "stream cancelled by client; assistant turn discarded"
            );
        }
    }
}

pub const TIMEOUT_MESSAGE: &str = "Response timed out. Please try again.";
pub const GENERATION_ERROR_MESSAGE: &str = "Failed to generate response. Please try again.";
pub const SAVE_ERROR_MESSAGE: &str = "Failed to save response. Please try again.";

/// Orchestrates one conversation turn: persist user input, load history,
/// generate, persist the reply, refresh conversation metadata, deliver.
#[derive(Clone)]
pub struct ChatController {
    store: Store,
    generation: GenerationGateway,
    vision: VisionGateway,
    weather: Arc<WeatherService>,
    stream_timeout: Duration,
}

/// Result of a buffered turn: both persisted messages.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    pub user_message: Message,
    pub assistant_message: Message,
}

impl ChatController {
    pub fn new(
        store: Store,
        generation: GenerationGateway,
        vision: VisionGateway,
        weather: Arc<WeatherService>,
        stream_timeout: Duration,
    ) -> Self {
        Self {
            store,
            generation,
            vision,
            weather,
            stream_timeout,
        }
    }

    /// Resolve the reply text for a turn: the weather short-circuit when
    /// it applies, the generation gateway otherwise.
    async fn reply_for(&self, history: &[ChatEntry], content: &str, language: &str) -> String {
        if let Some(weather_reply) = self.weather.try_answer(content, language).await {
            debug!("weather interception answered the turn");
            return weather_reply;
        }
        self.generation.generate(history, language).await
    }

    /// Buffered turn. The user message is persisted before generation
    /// starts and survives any later failure — user input is never
    /// silently dropped.
    pub async fn buffered_turn(
        &self,
        conversation_id: &str,
        content: &str,
        language: &str,
    ) -> Result<TurnOutcome, ApiError> {
        let user_message = self
            .store
            .create_message(conversation_id, Role::User, NewMessage::text(content))
            .await?;

        let history = self.load_history(conversation_id).await?;
        let reply = self.reply_for(&history, content, language).await;

        let assistant_message = self
            .store
            .create_message(conversation_id, Role::Assistant, NewMessage::text(reply))
            .await?;
        self.store.touch_conversation(conversation_id).await?;

        Ok(TurnOutcome {
            user_message,
            assistant_message,
        })
    }

    /// Streaming turn. Yields `connected` first, then chunks in provider
    /// order; the assistant message is persisted only after the whole
    /// stream completed, from the accumulated buffer. Dropping the
    /// returned stream (client disconnect) stops generation and persists
    /// nothing.
    pub fn stream_turn(
        &self,
        conversation_id: String,
        content: String,
        language: String,
    ) -> impl Stream<Item = StreamEvent> {
        let controller = self.clone();

        async_stream::stream! {
            let mut guard = StreamGuard {
                conversation_id: conversation_id.clone(),
                finished: false,
            };

            yield StreamEvent::connected();

            // User message must be durable before the model sees it.
            if let Err(e) = controller
                .store
                .create_message(&conversation_id, Role::User, NewMessage::text(&content))
                .await
            {
                warn!(error = %e, "failed to persist user message");
                guard.finished = true;
                yield StreamEvent::Error { error: ApiError::from(e).to_string() };
                return;
            }

            let history = match controller.load_history(&conversation_id).await {
                Ok(history) => history,
                Err(e) => {
                    guard.finished = true;
                    yield StreamEvent::Error { error: e.to_string() };
                    return;
                }
            };

            // Weather interception: one chunk, then the normal completion
            // path.
            if let Some(weather_reply) = controller.weather.try_answer(&content, &language).await {
                yield StreamEvent::Chunk { chunk: weather_reply.clone() };
                guard.finished = true;
                match controller.persist_assistant(&conversation_id, weather_reply).await {
                    Ok(message) => yield StreamEvent::done(message.id),
                    Err(_) => yield StreamEvent::Error { error: SAVE_ERROR_MESSAGE.to_string() },
                }
                return;
            }

            let mut rx = controller.generation.generate_streaming(history, &language);
            let mut buffer = String::new();
            let mut state = StreamState::Pending;

            loop {
                match tokio::time::timeout(controller.stream_timeout, rx.recv()).await {
                    // Inactivity window elapsed with no fragment.
                    Err(_) => {
                        state = StreamState::TimedOut;
                        break;
                    }
                    Ok(None) => {
                        state = StreamState::Completed;
                        break;
                    }
                    Ok(Some(Ok(chunk))) => {
                        state = StreamState::Streaming;
                        buffer.push_str(&chunk);
                        yield StreamEvent::Chunk { chunk };
                    }
                    Ok(Some(Err(e))) => {
                        warn!(error = %e, "streaming generation failed");
                        state = StreamState::Errored;
                        break;
                    }
                }
            }

            guard.finished = true;
            debug!(conversation_id = %conversation_id, state = ?state, "stream finished");

            match state {
                StreamState::Completed if !buffer.is_empty() => {
                    match controller.persist_assistant(&conversation_id, buffer).await {
                        Ok(message) => yield StreamEvent::done(message.id),
                        Err(e) => {
                            warn!(error = %e, "failed to persist assistant message");
                            yield StreamEvent::Error { error: SAVE_ERROR_MESSAGE.to_string() };
                        }
                    }
                }
                StreamState::TimedOut => {
                    yield StreamEvent::Error { error: TIMEOUT_MESSAGE.to_string() };
                }
                _ => {
                    // Errored, or completed with nothing generated.
                    yield StreamEvent::Error { error: GENERATION_ERROR_MESSAGE.to_string() };
                }
            }
        }
    }

    /// Image-analysis turn: no text generation involved. The structured
    /// diagnosis becomes one composed assistant message with the image
    /// reference and the raw result attached as metadata.
    pub async fn image_turn(
        &self,
        conversation_id: &str,
        image: &[u8],
        mime_type: &str,
        image_url: String,
        context: &str,
        language: &str,
    ) -> Result<(Message, VisionAnalysis), ApiError> {
        // Fail fast on an unknown conversation before paying for analysis.
        self.store.get_conversation(conversation_id).await?;

        let analysis = self.vision.analyze(image, mime_type, context, language).await?;

        let metadata = serde_json::to_value(&analysis)
            .map_err(|e| ApiError::Internal(format!("Failed to encode analysis: {e}")))?;

        let message = self
            .store
            .create_message(
                conversation_id,
                Role::Assistant,
                NewMessage {
                    content: compose_vision_message(&analysis),
                    image_url: Some(image_url),
                    audio_url: None,
                    metadata: Some(metadata),
                },
            )
            .await?;
        self.store.touch_conversation(conversation_id).await?;

        Ok((message, analysis))
    }

    async fn load_history(&self, conversation_id: &str) -> Result<Vec<ChatEntry>, ApiError> {
        let messages = self.store.get_conversation_messages(conversation_id).await?;
        Ok(messages.iter().map(ChatEntry::from).collect())
    }

    async fn persist_assistant(
        &self,
        conversation_id: &str,
        content: String,
    ) -> Result<Message, ApiError> {
        let message = self
            .store
            .create_message(conversation_id, Role::Assistant, NewMessage::text(content))
            .await?;
        self.store.touch_conversation(conversation_id).await?;
        Ok(message)
    }
}

/// One markdown block per analysis: diagnosis, confidence, numbered
/// treatment and prevention steps, then the observation.
pub fn compose_vision_message(analysis: &VisionAnalysis) -> String {
    let numbered = |steps: &[String]| -> String {
        steps
            .iter()
            .enumerate()
            .map(|(i, step)| format!("{}. {}", i + 1, step))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "**AI Vision Analysis**\n\n**Diagnosis:** {}\n**Confidence:** {}%\n\n**Treatment:**\n{}\n\n**Prevention:**\n{}\n\n**Description:** {}",
        analysis.diagnosis,
        analysis.confidence,
        numbered(&analysis.treatment),
        numbered(&analysis.prevention),
        analysis.description
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_events_serialize_to_wire_shapes() {
        let connected = serde_json::to_string(&StreamEvent::connected()).unwrap();
        assert_eq!(connected, r#"{"status":"connected"}"#);

        let chunk = serde_json::to_string(&StreamEvent::Chunk { chunk: "hi".into() }).unwrap();
        assert_eq!(chunk, r#"{"chunk":"hi"}"#);

        let done = serde_json::to_string(&StreamEvent::done("m-1".into())).unwrap();
        assert_eq!(done, r#"{"done":true,"messageId":"m-1"}"#);

        let error = serde_json::to_string(&StreamEvent::Error { error: "boom".into() }).unwrap();
        assert_eq!(error, r#"{"error":"boom"}"#);
    }

    #[test]
    fn vision_message_numbers_steps() {
        let analysis = VisionAnalysis {
            diagnosis: "Leaf rust".into(),
            confidence: 90,
            treatment: vec!["Spray fungicide".into(), "Remove affected leaves".into()],
            prevention: vec!["Use resistant varieties".into()],
            description: "Orange pustules on leaves".into(),
        };

        let content = compose_vision_message(&analysis);
        assert!(content.contains("**Diagnosis:** Leaf rust"));
        assert!(content.contains("**Confidence:** 90%"));
        assert!(content.contains("1. Spray fungicide"));
        assert!(content.contains("2. Remove affected leaves"));
        assert!(content.contains("1. Use resistant varieties"));
        assert!(content.contains("**Description:** Orange pustules on leaves"));
    }
}
