//! Model completion seam
//!
//! The wire format to any provider is out of scope here. A provider either
//! returns a whole completion or a channel of `StreamPart`s, and `reply`
//! turns either into a single assistant message body.

pub mod mock;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::message::Message;
use crate::tools::ToolRegistry;

const STREAM_TIMEOUT: Duration = Duration::from_secs(120);

/// One increment of a streamed completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPart {
    TextDelta { delta: String },
    Done,
    Error { message: String },
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whole completion for already-reduced `messages`
    async fn complete(&self, messages: &[Message], model: &str) -> anyhow::Result<String>;

    /// Incremental completion. The channel closes or yields `Done` at the end.
    async fn stream(
        &self,
        messages: &[Message],
        model: &str,
    ) -> anyhow::Result<mpsc::UnboundedReceiver<StreamPart>>;
}

/// How a reply ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Complete(String),
    /// The operator interrupted. Holds the text received so far.
    Interrupted(String),
}

/// Request a reply from the provider.
///
/// When streaming, receiving stops as soon as the accumulated text holds a
/// complete invocation of a registered capability, so at most one tool call
/// runs per model turn. `on_delta` sees every increment that was kept.
pub async fn reply(
    provider: &dyn CompletionProvider,
    messages: &[Message],
    model: &str,
    stream: bool,
    registry: &ToolRegistry,
    cancel: &CancellationToken,
    on_delta: &(dyn Fn(&str) + Send + Sync),
) -> anyhow::Result<ReplyOutcome> {
    tracing::debug!(provider = provider.name(), model, messages = messages.len(), stream, "Requesting reply");

    if !stream {
        return tokio::select! {
            result = provider.complete(messages, model) => Ok(ReplyOutcome::Complete(result?)),
            _ = cancel.cancelled() => Ok(ReplyOutcome::Interrupted(String::new())),
        };
    }

    let mut rx = tokio::select! {
        rx = provider.stream(messages, model) => rx?,
        _ = cancel.cancelled() => return Ok(ReplyOutcome::Interrupted(String::new())),
    };

    let mut text = String::new();
    loop {
        let part = tokio::select! {
            part = tokio::time::timeout(STREAM_TIMEOUT, rx.recv()) => part,
            _ = cancel.cancelled() => {
                tracing::info!(received = text.len(), "Reply interrupted");
                return Ok(ReplyOutcome::Interrupted(text));
            }
        };

        let part = match part {
            Ok(Some(part)) => part,
            Ok(None) => break,
            Err(_) => {
                tracing::warn!("Model stream timeout: no data received for {} seconds", STREAM_TIMEOUT.as_secs());
                break;
            }
        };

        match part {
            StreamPart::TextDelta { delta } => {
                text.push_str(&delta);
                on_delta(&delta);
                if registry.has_complete_invocation(&text) {
                    tracing::debug!("Complete invocation received, stopping stream");
                    break;
                }
            }
            StreamPart::Done => break,
            StreamPart::Error { message } => anyhow::bail!("Model stream failed: {}", message),
        }
    }

    Ok(ReplyOutcome::Complete(text))
}
