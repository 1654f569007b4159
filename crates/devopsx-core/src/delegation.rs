//! Concurrent sub-conversations
//!
//! A delegation runs a full non-interactive conversation on its own tokio
//! task, in a transcript named `subthread-<id>`. The final message of that
//! transcript is expected to hold a JSON completion payload:
//!
//! ```json
//! {"status": "success", "result": "what happened"}
//! ```

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::chat::{initial_messages, ChatSession, Runtime};
use crate::constants::{files, MAIN_BRANCH};
use crate::error::{Error, Result};
use crate::transcript::jsonl::read_jsonl;
use crate::transcript::Transcript;

/// Appended after the delegated prompt so the sub-conversation ends with a
/// machine-readable outcome
pub const RETURN_PROMPT: &str = "Thank you for doing the task, please respond with a JSON response on the format:

```json
{
    \"result\": \"A description of the task result/outcome\",
    \"status\": \"success\" | \"failure\"
}
```";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegationState {
    Running,
    Success,
    Failure,
}

impl fmt::Display for DelegationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
        };
        f.write_str(label)
    }
}

/// Derived status of a delegation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationStatus {
    pub status: DelegationState,
    #[serde(default)]
    pub result: Option<String>,
}

impl DelegationStatus {
    fn running() -> Self {
        Self {
            status: DelegationState::Running,
            result: None,
        }
    }

    fn failure(reason: impl Into<String>) -> Self {
        Self {
            status: DelegationState::Failure,
            result: Some(reason.into()),
        }
    }
}

impl fmt::Display for DelegationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            Some(result) => write!(f, "{}: {}", self.status, result),
            None => write!(f, "{}", self.status),
        }
    }
}

struct Delegation {
    prompt: String,
    transcript: String,
    done: watch::Receiver<bool>,
    handle: JoinHandle<()>,
}

impl Delegation {
    fn is_running(&self) -> bool {
        !*self.done.borrow() && !self.handle.is_finished()
    }
}

/// Transcript name for a delegation id
pub fn transcript_name(id: &str) -> String {
    format!("subthread-{}", id)
}

/// The JSON object spanning the first `{` to the last `}`, if any
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

/// Status from the final message of a finished sub-conversation
pub fn parse_completion(content: &str) -> DelegationStatus {
    let Some(json) = extract_json(content.trim()) else {
        return DelegationStatus::failure("no completion payload in final message");
    };
    match serde_json::from_str::<DelegationStatus>(json) {
        Ok(status) if status.status == DelegationState::Running => {
            DelegationStatus::failure("sub-conversation ended while reporting running")
        }
        Ok(status) => status,
        Err(e) => DelegationStatus::failure(format!("unparseable completion payload: {}", e)),
    }
}

async fn run_delegation(
    runtime: Arc<Runtime>,
    name: &str,
    prompt: String,
    confirm: bool,
) -> anyhow::Result<()> {
    let transcript = Transcript::load(
        &runtime.paths,
        name,
        initial_messages(&runtime.registry),
        MAIN_BRANCH,
    )?;
    let mut session = ChatSession::new(runtime, transcript)
        .with_confirm(confirm)
        .with_stream(false);
    session.run(vec![prompt, RETURN_PROMPT.to_string()]).await
}

/// Tracks spawned delegations by id
#[derive(Default)]
pub struct Supervisor {
    delegations: DashMap<String, Delegation>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a sub-conversation and return immediately.
    ///
    /// `confirm` is the parent's setting: capabilities run by the
    /// sub-conversation ask the same operator before side effects.
    /// Reusing the id of a finished delegation replaces it. Reusing the id of
    /// a running one is refused.
    pub fn spawn(
        &self,
        runtime: Arc<Runtime>,
        id: &str,
        prompt: &str,
        confirm: bool,
    ) -> anyhow::Result<()> {
        if self.delegations.get(id).is_some_and(|d| d.is_running()) {
            anyhow::bail!("Delegation '{}' is still running", id);
        }

        let name = transcript_name(id);
        let (done_tx, done_rx) = watch::channel(false);
        let task_name = name.clone();
        let task_prompt = prompt.to_string();
        let task_id = id.to_string();

        let handle = tokio::spawn(async move {
            match run_delegation(runtime, &task_name, task_prompt, confirm).await {
                Ok(()) => tracing::info!(id = %task_id, "Delegation finished"),
                Err(e) => tracing::warn!(id = %task_id, error = %e, "Delegation failed"),
            }
            let _ = done_tx.send(true);
        });

        tracing::info!(id, transcript = %name, "Spawned delegation");
        self.delegations.insert(
            id.to_string(),
            Delegation {
                prompt: prompt.to_string(),
                transcript: name,
                done: done_rx,
                handle,
            },
        );
        Ok(())
    }

    /// Spawn several delegations, each on its own task
    pub fn spawn_batch(
        &self,
        runtime: &Arc<Runtime>,
        batch: &[(String, String)],
        confirm: bool,
    ) -> anyhow::Result<()> {
        for (id, prompt) in batch {
            self.spawn(Arc::clone(runtime), id, prompt, confirm)?;
        }
        Ok(())
    }

    /// `running` while the task is alive, otherwise the completion payload
    pub fn status(&self, runtime: &Runtime, id: &str) -> Result<DelegationStatus> {
        let (running, transcript) = {
            let delegation = self.delegations.get(id).ok_or_else(|| {
                Error::unregistered("delegation", id, "Start it with `spawn <id>` first.")
            })?;
            (delegation.is_running(), delegation.transcript.clone())
        };
        if running {
            return Ok(DelegationStatus::running());
        }

        let file = runtime
            .paths
            .conversation_dir(&transcript)
            .join(files::CONVERSATION_FILE);
        let status = match read_jsonl(&file) {
            Ok(messages) => match messages.last() {
                Some(last) => parse_completion(&last.content),
                None => DelegationStatus::failure("sub-conversation is empty"),
            },
            Err(e) => DelegationStatus::failure(format!("cannot read sub-conversation: {}", e)),
        };
        Ok(status)
    }

    /// Wait up to `timeout` for the delegation to finish, then report its
    /// status. A timeout leaves the delegation running.
    pub async fn wait(&self, runtime: &Runtime, id: &str, timeout: Duration) -> Result<DelegationStatus> {
        let mut done = self
            .delegations
            .get(id)
            .map(|d| d.done.clone())
            .ok_or_else(|| {
                Error::unregistered("delegation", id, "Start it with `spawn <id>` first.")
            })?;

        let timed_out = tokio::time::timeout(timeout, done.wait_for(|finished| *finished))
            .await
            .is_err();
        if timed_out {
            tracing::info!(id, timeout_secs = timeout.as_secs(), "Stopped waiting, delegation keeps running");
        }
        self.status(runtime, id)
    }

    /// Wait for every id concurrently, each bounded by `timeout`
    pub async fn wait_all(
        &self,
        runtime: &Runtime,
        ids: &[String],
        timeout: Duration,
    ) -> Vec<(String, Result<DelegationStatus>)> {
        let waits = ids.iter().map(|id| async move {
            (id.clone(), self.wait(runtime, id, timeout).await)
        });
        futures::future::join_all(waits).await
    }

    /// `(id, prompt)` of every known delegation, sorted by id
    pub fn list(&self) -> Vec<(String, String)> {
        let mut items: Vec<(String, String)> = self
            .delegations
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().prompt.clone()))
            .collect();
        items.sort();
        items
    }

    pub fn ids(&self) -> Vec<String> {
        self.list().into_iter().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::testing::test_runtime_with_provider;
    use crate::llm::mock::{ScriptedProvider, ScriptedReply};
    use tempfile::TempDir;

    #[test]
    fn test_parse_completion() {
        let status = parse_completion("Done!\n```json\n{\"status\": \"success\", \"result\": \"42\"}\n```");
        assert_eq!(status.status, DelegationState::Success);
        assert_eq!(status.result.as_deref(), Some("42"));

        assert_eq!(parse_completion("no payload").status, DelegationState::Failure);
        assert_eq!(parse_completion("{status: success}").status, DelegationState::Failure);
        assert_eq!(
            parse_completion("{\"status\": \"running\"}").status,
            DelegationState::Failure
        );
    }

    #[tokio::test]
    async fn test_spawn_and_wait_for_success() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new([
            ScriptedReply::text("Computed it."),
            ScriptedReply::text("{\"status\": \"success\", \"result\": \"fib(10) = 55\"}"),
        ]));
        let runtime = test_runtime_with_provider(dir.path(), provider.clone());

        runtime.supervisor.spawn(Arc::clone(&runtime), "fib", "compute fib 10", false).unwrap();
        let status = runtime
            .supervisor
            .wait(&runtime, "fib", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(status.status, DelegationState::Success);
        assert_eq!(status.result.as_deref(), Some("fib(10) = 55"));
        assert_eq!(provider.call_count(), 2);
        assert!(dir.path().join("logs/subthread-fib/conversation.jsonl").exists());
    }

    #[tokio::test]
    async fn test_wait_timeout_leaves_unit_running() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new([ScriptedReply::stall()]));
        let runtime = test_runtime_with_provider(dir.path(), provider);

        runtime.supervisor.spawn(Arc::clone(&runtime), "t1", "never ends", false).unwrap();
        let status = runtime
            .supervisor
            .wait(&runtime, "t1", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(status.status, DelegationState::Running);
        assert_eq!(
            runtime.supervisor.status(&runtime, "t1").unwrap().status,
            DelegationState::Running
        );
        assert!(runtime.supervisor.spawn(Arc::clone(&runtime), "t1", "again", false).is_err());
    }

    #[tokio::test]
    async fn test_missing_payload_is_failure() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::default().with_fallback("I forgot the format."));
        let runtime = test_runtime_with_provider(dir.path(), provider);

        runtime.supervisor.spawn(Arc::clone(&runtime), "x", "do it", false).unwrap();
        let status = runtime
            .supervisor
            .wait(&runtime, "x", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status.status, DelegationState::Failure);
    }

    #[tokio::test]
    async fn test_batch_runs_concurrently() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::default().with_fallback(
            "{\"status\": \"success\", \"result\": \"ok\"}",
        ));
        let runtime = test_runtime_with_provider(dir.path(), provider);

        let batch = vec![
            ("a".to_string(), "first".to_string()),
            ("b".to_string(), "second".to_string()),
        ];
        runtime.supervisor.spawn_batch(&runtime, &batch, false).unwrap();
        let results = runtime
            .supervisor
            .wait_all(&runtime, &runtime.supervisor.ids(), Duration::from_secs(5))
            .await;

        assert_eq!(results.len(), 2);
        for (_, status) in results {
            assert_eq!(status.unwrap().status, DelegationState::Success);
        }
    }

    #[tokio::test]
    async fn test_unknown_id_is_unregistered() {
        let dir = TempDir::new().unwrap();
        let runtime = test_runtime_with_provider(dir.path(), Arc::new(ScriptedProvider::default()));
        let err = runtime.supervisor.status(&runtime, "ghost").unwrap_err();
        assert!(matches!(err, Error::Unregistered { .. }));
        assert!(runtime
            .supervisor
            .wait(&runtime, "ghost", Duration::from_millis(10))
            .await
            .is_err());
    }
}
