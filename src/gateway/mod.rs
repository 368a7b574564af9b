pub mod gemini;
pub mod vision;

use crate::chat::ChatEntry;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Failure of a single provider call. The retryable/fatal split drives the
/// strategy loop: retryable errors move on to the next model, fatal ones
/// stop it.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited")]
    RateLimited,
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider rejected request: {0}")]
    Api(String),
    #[error("provider returned no content")]
    Empty,
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::Network(_)
                | BackendError::RateLimited
                | BackendError::Unavailable(_)
                | BackendError::Empty
        )
    }
}

/// Black-box text generation capability: given a system instruction and an
/// ordered history, produce text, either whole or as a fragment stream.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        system: &str,
        history: &[ChatEntry],
    ) -> Result<String, BackendError>;

    /// Forward fragments on `tx` in provider emission order. A failed send
    /// means the receiver is gone (client cancelled); implementations stop
    /// quietly in that case.
    async fn stream(
        &self,
        model: &str,
        system: &str,
        history: &[ChatEntry],
        tx: mpsc::Sender<String>,
    ) -> Result<(), BackendError>;
}

const PERSONA: &str = "You are an expert agricultural and livestock advisory AI assistant. You provide comprehensive guidance on:
- Crop management (planting, irrigation, fertilization, harvesting)
- Pest control and disease management
- Livestock care (cattle, buffalo, goats) - health, breeding, nutrition
- Weather-based farming advice
- Market prices and selling strategies
- Sustainable agricultural practices

You have knowledge of 4000+ agricultural topics and provide accurate, actionable advice to farmers.";

const PERSONA_CLOSING: &str = "Be concise, practical, and farmer-friendly in your responses.";

pub const FALLBACK_REPLY: &str =
    "I apologize, but I couldn't generate a response. Please try again.";

pub const STREAM_APOLOGY: &str =
    "I apologize, but I ran into a problem while responding. Please try again.";

/// Instruction prefix: domain persona plus a language directive for
/// non-English conversations.
pub fn system_prompt(language: &str) -> String {
    if language == "en" {
        format!("{PERSONA}\n{PERSONA_CLOSING}")
    } else {
        format!("{PERSONA}\nRespond in {language} language.\n{PERSONA_CLOSING}")
    }
}

/// Text generation with resilience: an ordered list of model strategies is
/// tried in sequence, and the buffered path degrades to an apology string
/// instead of failing — conversational continuity over hard failure.
#[derive(Clone)]
pub struct GenerationGateway {
    backend: Arc<dyn GenerationBackend>,
    models: Vec<String>,
    request_timeout: Duration,
}

impl GenerationGateway {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        models: Vec<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            models,
            request_timeout,
        }
    }

    /// Buffered generation. Never fails and never returns an empty string:
    /// each strategy is tried in order, and if all of them fail the caller
    /// gets the apologetic fallback text.
    pub async fn generate(&self, history: &[ChatEntry], language: &str) -> String {
        let system = system_prompt(language);

        for model in &self.models {
            let attempt =
                tokio::time::timeout(self.request_timeout, self.backend.complete(model, &system, history))
                    .await;

            match attempt {
                Ok(Ok(text)) if !text.trim().is_empty() => return text,
                Ok(Ok(_)) => {
                    warn!(model = %model, "provider returned empty text, trying next strategy");
                }
                Ok(Err(e)) if e.is_retryable() => {
                    warn!(model = %model, error = %e, "generation attempt failed, trying next strategy");
                }
                Ok(Err(e)) => {
                    warn!(model = %model, error = %e, "generation failed fatally");
                    break;
                }
                Err(_) => {
                    warn!(model = %model, "generation attempt timed out, trying next strategy");
                }
            }
        }

        FALLBACK_REPLY.to_string()
    }

    /// Streaming generation. Returns a channel of fragments in provider
    /// order. If a strategy fails before emitting anything, the next one is
    /// tried; a mid-stream failure delivers one final apology fragment and
    /// then the typed error, so consumers are never left without a terminal
    /// item. A dropped receiver stops the producer.
    pub fn generate_streaming(
        &self,
        history: Vec<ChatEntry>,
        language: &str,
    ) -> mpsc::Receiver<Result<String, BackendError>> {
        let (out_tx, out_rx) = mpsc::channel::<Result<String, BackendError>>(32);
        let backend = self.backend.clone();
        let models = self.models.clone();
        let system = system_prompt(language);

        tokio::spawn(async move {
            let mut last_err: Option<BackendError> = None;

            for model in &models {
                let (frag_tx, mut frag_rx) = mpsc::channel::<String>(32);
                let backend_call = backend.clone();
                let system_call = system.clone();
                let history_call = history.clone();
                let model_call = model.clone();

                let producer = tokio::spawn(async move {
                    backend_call
                        .stream(&model_call, &system_call, &history_call, frag_tx)
                        .await
                });

                let mut emitted = false;
                loop {
                    tokio::select! {
                        fragment = frag_rx.recv() => {
                            let Some(fragment) = fragment else { break };
                            emitted = true;
                            if out_tx.send(Ok(fragment)).await.is_err() {
                                producer.abort();
                                return;
                            }
                        }
                        // Consumer gone (disconnect or timeout): structured
                        // cancellation instead of waiting on a dead channel.
                        _ = out_tx.closed() => {
                            producer.abort();
                            return;
                        }
                    }
                }

                match producer.await {
                    Ok(Ok(())) if emitted => return,
                    Ok(Ok(())) => {
                        debug!(model = %model, "stream produced no fragments, trying next strategy");
                        last_err = Some(BackendError::Empty);
                    }
                    Ok(Err(e)) => {
                        if emitted || !e.is_retryable() {
                            // Mid-stream (or fatal) failure: apology fragment,
                            // then the typed error.
                            let _ = out_tx.send(Ok(STREAM_APOLOGY.to_string())).await;
                            let _ = out_tx.send(Err(e)).await;
                            return;
                        }
                        debug!(model = %model, error = %e, "stream attempt failed, trying next strategy");
                        last_err = Some(e);
                    }
                    Err(join_err) => {
                        let _ = out_tx.send(Ok(STREAM_APOLOGY.to_string())).await;
                        let _ = out_tx
                            .send(Err(BackendError::Unavailable(join_err.to_string())))
                            .await;
                        return;
                    }
                }
            }

            let err = last_err.unwrap_or(BackendError::Empty);
            let _ = out_tx.send(Ok(STREAM_APOLOGY.to_string())).await;
            let _ = out_tx.send(Err(err)).await;
        });

        out_rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Role;

    struct FailThenSucceed;

    #[async_trait]
    impl GenerationBackend for FailThenSucceed {
        async fn complete(
            &self,
            model: &str,
            _system: &str,
            _history: &[ChatEntry],
        ) -> Result<String, BackendError> {
            if model == "primary" {
                Err(BackendError::Unavailable("503".into()))
            } else {
                Ok("stale leaves often mean nitrogen deficiency".into())
            }
        }

        async fn stream(
            &self,
            model: &str,
            _system: &str,
            _history: &[ChatEntry],
            tx: mpsc::Sender<String>,
        ) -> Result<(), BackendError> {
            if model == "primary" {
                return Err(BackendError::Network("reset".into()));
            }
            tx.send("hello ".into()).await.ok();
            tx.send("farmer".into()).await.ok();
            Ok(())
        }
    }

    struct AlwaysFatal;

    #[async_trait]
    impl GenerationBackend for AlwaysFatal {
        async fn complete(
            &self,
            _model: &str,
            _system: &str,
            _history: &[ChatEntry],
        ) -> Result<String, BackendError> {
            Err(BackendError::Api("invalid key".into()))
        }

        async fn stream(
            &self,
            _model: &str,
            _system: &str,
            _history: &[ChatEntry],
            _tx: mpsc::Sender<String>,
        ) -> Result<(), BackendError> {
            Err(BackendError::Api("invalid key".into()))
        }
    }

    fn gateway(backend: Arc<dyn GenerationBackend>) -> GenerationGateway {
        GenerationGateway::new(
            backend,
            vec!["primary".into(), "fallback".into()],
            Duration::from_secs(5),
        )
    }

    fn history() -> Vec<ChatEntry> {
        vec![ChatEntry {
            role: Role::User,
            content: "my wheat has yellow spots".into(),
        }]
    }

    #[test]
    fn persona_includes_language_directive_for_hindi() {
        let prompt = system_prompt("hi");
        assert!(prompt.contains("Respond in hi language."));
        assert!(prompt.contains("agricultural and livestock advisory"));
    }

    #[test]
    fn persona_omits_directive_for_english() {
        assert!(!system_prompt("en").contains("Respond in"));
    }

    #[tokio::test]
    async fn buffered_falls_back_to_second_strategy() {
        let gw = gateway(Arc::new(FailThenSucceed));
        let reply = gw.generate(&history(), "en").await;
        assert_eq!(reply, "stale leaves often mean nitrogen deficiency");
    }

    #[tokio::test]
    async fn buffered_degrades_gracefully_on_fatal_error() {
        let gw = gateway(Arc::new(AlwaysFatal));
        let reply = gw.generate(&history(), "en").await;
        assert_eq!(reply, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn streaming_retries_next_strategy_before_first_fragment() {
        let gw = gateway(Arc::new(FailThenSucceed));
        let mut rx = gw.generate_streaming(history(), "en");

        let mut chunks = Vec::new();
        while let Some(item) = rx.recv().await {
            chunks.push(item.expect("fallback strategy should stream cleanly"));
        }
        assert_eq!(chunks.concat(), "hello farmer");
    }

    #[tokio::test]
    async fn streaming_fatal_error_ends_with_apology_then_error() {
        let gw = gateway(Arc::new(AlwaysFatal));
        let mut rx = gw.generate_streaming(history(), "en");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.unwrap(), STREAM_APOLOGY);
        let second = rx.recv().await.unwrap();
        assert!(second.is_err());
        assert!(rx.recv().await.is_none());
    }
}
