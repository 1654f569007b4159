//! Scripted completion provider for deterministic runs without a model

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{CompletionProvider, StreamPart};
use crate::message::Message;

/// Reply used once the script runs out
pub const DEFAULT_FALLBACK: &str = "Done.";

/// Pre-programmed reply
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Whole text, streamed as a single delta
    Text(String),
    /// Streamed as the given deltas
    Chunks(Vec<String>),
    /// Streamed deltas, then the stream stays open forever
    ChunksThenStall(Vec<String>),
    /// Fail the request
    Error(String),
    /// Wait, then reply with the inner value
    Delay(Duration, Box<ScriptedReply>),
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Chunks(chunks.into_iter().map(Into::into).collect())
    }

    pub fn chunks_then_stall<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::ChunksThenStall(chunks.into_iter().map(Into::into).collect())
    }

    /// Never produces anything
    pub fn stall() -> Self {
        Self::ChunksThenStall(Vec::new())
    }

    pub fn delayed(delay: Duration, inner: ScriptedReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Provider that answers from a FIFO of scripted replies
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    fallback: String,
    call_count: AtomicUsize,
    seen: Mutex<Vec<Vec<Message>>>,
    /// Senders of stalled streams, kept so the receivers stay open
    held: Mutex<Vec<mpsc::UnboundedSender<StreamPart>>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ScriptedProvider {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            fallback: DEFAULT_FALLBACK.to_string(),
            call_count: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = text.into();
        self
    }

    /// Queue another reply
    pub fn push(&self, reply: ScriptedReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Message lists received, one entry per call
    pub fn seen(&self) -> Vec<Vec<Message>> {
        self.seen.lock().clone()
    }

    fn next_reply(&self, messages: &[Message]) -> ScriptedReply {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.seen.lock().push(messages.to_vec());
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| ScriptedReply::Text(self.fallback.clone()))
    }
}

/// Unrolls nested delays
async fn settle(mut reply: ScriptedReply) -> ScriptedReply {
    while let ScriptedReply::Delay(delay, inner) = reply {
        tokio::time::sleep(delay).await;
        reply = *inner;
    }
    reply
}

fn send_chunks(tx: &mpsc::UnboundedSender<StreamPart>, chunks: Vec<String>) {
    for delta in chunks {
        let _ = tx.send(StreamPart::TextDelta { delta });
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, messages: &[Message], _model: &str) -> anyhow::Result<String> {
        match settle(self.next_reply(messages)).await {
            ScriptedReply::Text(text) => Ok(text),
            ScriptedReply::Chunks(chunks) => Ok(chunks.concat()),
            ScriptedReply::ChunksThenStall(_) => std::future::pending().await,
            ScriptedReply::Error(message) => anyhow::bail!("{}", message),
            ScriptedReply::Delay(..) => anyhow::bail!("scripted delay did not settle"),
        }
    }

    async fn stream(
        &self,
        messages: &[Message],
        _model: &str,
    ) -> anyhow::Result<mpsc::UnboundedReceiver<StreamPart>> {
        let reply = settle(self.next_reply(messages)).await;
        let (tx, rx) = mpsc::unbounded_channel();

        match reply {
            ScriptedReply::Text(text) => {
                send_chunks(&tx, vec![text]);
                let _ = tx.send(StreamPart::Done);
            }
            ScriptedReply::Chunks(chunks) => {
                send_chunks(&tx, chunks);
                let _ = tx.send(StreamPart::Done);
            }
            ScriptedReply::ChunksThenStall(chunks) => {
                send_chunks(&tx, chunks);
                self.held.lock().push(tx);
            }
            ScriptedReply::Error(message) => {
                let _ = tx.send(StreamPart::Error { message });
            }
            ScriptedReply::Delay(..) => anyhow::bail!("scripted delay did not settle"),
        }
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replies_in_order_then_fallback() {
        let provider = ScriptedProvider::new([ScriptedReply::text("one"), ScriptedReply::chunks(["t", "wo"])])
            .with_fallback("done");
        assert_eq!(provider.complete(&[], "m").await.unwrap(), "one");
        assert_eq!(provider.complete(&[], "m").await.unwrap(), "two");
        assert_eq!(provider.complete(&[], "m").await.unwrap(), "done");
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_stream_yields_deltas() {
        let provider = ScriptedProvider::new([ScriptedReply::chunks(["a", "b"])]);
        let mut rx = provider.stream(&[Message::user("x")], "m").await.unwrap();
        assert_eq!(rx.recv().await, Some(StreamPart::TextDelta { delta: "a".into() }));
        assert_eq!(rx.recv().await, Some(StreamPart::TextDelta { delta: "b".into() }));
        assert_eq!(rx.recv().await, Some(StreamPart::Done));
        assert_eq!(provider.seen()[0][0].content, "x");
    }
}
