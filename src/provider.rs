//! completion provider seam.
//!
//! the reconciler only ever sees `CompletionProvider`: an ordered message
//! list plus the current directive in, a lazy single-pass fragment stream
//! out. `LlmCompletionProvider` adapts the `llm` crate's structured
//! streaming to that shape; tests script their own fragment sequences.

use std::pin::Pin;

use async_trait::async_trait;
use futures_lite::{Stream, StreamExt};
use thiserror::Error;

use llm::builder::{LLMBackend, LLMBuilder};
use llm::chat::{ChatMessage, ChatProvider, StreamChoice, StreamDelta, StreamResponse};

/// fixed sampling parameters for every completion request.
pub const TEMPERATURE: f32 = 0.6;
pub const TOP_P: f32 = 0.95;
pub const MAX_OUTPUT_TOKENS: u32 = 4096;

/// any failure reaching the reconciler while building or draining a
/// completion. never propagates past the reconciler boundary; it is always
/// converted into a visible assistant turn.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// the request could not be built or the stream could not be opened
    /// (transport, auth, quota, bad config).
    #[error("completion request failed: {0}")]
    Request(String),
    /// the stream broke after it had started yielding fragments.
    #[error("stream interrupted: {0}")]
    Stream(String),
}

/// finite, ordered, single-pass fragment sequence. errors arrive as
/// distinct items, never disguised as fragments; end-of-stream is plain
/// stream exhaustion.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// one operation: message list + directive -> token stream. not
/// restartable; a fresh call builds a fresh request.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
        directive: &str,
    ) -> Result<FragmentStream, ProviderError>;
}

/// static backend/model/credential settings for `LlmCompletionProvider`.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub backend: LLMBackend,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
}

/// `CompletionProvider` backed by the `llm` crate.
///
/// the underlying provider is rebuilt per request: the `llm` builder bakes
/// the system instruction in at build time, and the directive must be read
/// at request-construction time so edits apply to the next submission.
pub struct LlmCompletionProvider {
    config: ProviderConfig,
}

impl LlmCompletionProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CompletionProvider for LlmCompletionProvider {
    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
        directive: &str,
    ) -> Result<FragmentStream, ProviderError> {
        let mut b = LLMBuilder::new()
            .backend(self.config.backend.clone())
            .model(self.config.model.clone())
            .temperature(TEMPERATURE)
            .top_p(TOP_P)
            .max_tokens(MAX_OUTPUT_TOKENS)
            .stream(true);
        if let Some(url) = &self.config.base_url {
            b = b.base_url(url.clone());
        }
        if let Some(key) = &self.config.api_key {
            b = b.api_key(key.clone());
        }
        if !directive.is_empty() {
            b = b.system(directive.to_string());
        }

        let provider = b
            .build()
            .map_err(|err| ProviderError::Request(err.to_string()))?;
        let stream = provider
            .chat_stream_struct(messages)
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        // flatten structured deltas to plain text fragments. empty
        // fragments are fine downstream; the reconciler just concatenates.
        let fragments = stream.map(|item| match item {
            Ok(StreamResponse { choices, .. }) => Ok(choices
                .into_iter()
                .filter_map(|StreamChoice { delta: StreamDelta { content, .. } }| content)
                .collect::<String>()),
            Err(err) => Err(ProviderError::Stream(err.to_string())),
        });
        Ok(Box::pin(fragments))
    }
}

/// one request as seen by a test provider.
#[cfg(test)]
pub(crate) struct RecordedRequest {
    pub message_contents: Vec<String>,
    pub directive: String,
}

/// test double yielding a prearranged fragment sequence. records every
/// request it receives; an optional gate holds the stream-open call until
/// the test releases (or drops) the sender.
#[cfg(test)]
pub(crate) struct ScriptedProvider {
    pub connect_error: Option<ProviderError>,
    pub fragments: Vec<Result<String, ProviderError>>,
    pub calls: std::sync::Mutex<Vec<RecordedRequest>>,
    pub gate: Option<flume::Receiver<()>>,
}

#[cfg(test)]
impl ScriptedProvider {
    pub fn ok(fragments: &[&str]) -> Self {
        Self::with_script(fragments.iter().map(|f| Ok(f.to_string())).collect())
    }

    pub fn with_script(fragments: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            connect_error: None,
            fragments,
            calls: std::sync::Mutex::new(Vec::new()),
            gate: None,
        }
    }
}

#[cfg(test)]
#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
        directive: &str,
    ) -> Result<FragmentStream, ProviderError> {
        self.calls.lock().unwrap().push(RecordedRequest {
            message_contents: messages.iter().map(|m| m.content.clone()).collect(),
            directive: directive.to_string(),
        });
        if let Some(gate) = &self.gate {
            // blocks until the test sends or drops the sender
            let _ = gate.recv_async().await;
        }
        if let Some(err) = &self.connect_error {
            return Err(err.clone());
        }
        let items = self.fragments.clone();
        Ok(Box::pin(futures_lite::stream::iter(items)))
    }
}
