//! Durable conversation storage
//!
//! - `store`: the branchable `Transcript`
//! - `jsonl`: one-message-per-line persistence

pub mod jsonl;
pub mod store;

pub use store::Transcript;

use chrono::{DateTime, Local, Utc};
use rand::seq::SliceRandom;
use std::path::PathBuf;

use crate::constants::files;
use crate::error::{Error, Result};
use crate::paths::Paths;

/// Summary of one stored conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub name: String,
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    pub messages: usize,
    pub branches: usize,
}

/// All conversations under the logs directory, newest first
pub fn list_conversations(paths: &Paths) -> Result<Vec<ConversationSummary>> {
    if !paths.logs_dir.is_dir() {
        return Ok(Vec::new());
    }

    let entries = std::fs::read_dir(&paths.logs_dir)
        .map_err(|source| Error::io("listing conversations", &paths.logs_dir, source))?;

    let mut conversations = Vec::new();
    for entry in entries.flatten() {
        let dir = entry.path();
        let main_file = dir.join(files::CONVERSATION_FILE);
        let Ok(metadata) = main_file.metadata() else {
            continue;
        };
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let branches = std::fs::read_dir(dir.join(files::BRANCHES_DIR))
            .map(|rd| rd.flatten().count())
            .unwrap_or(0);

        conversations.push(ConversationSummary {
            name: name.to_string(),
            messages: jsonl::count_records(&main_file)?,
            path: main_file,
            modified,
            branches: branches + 1,
        });
    }

    conversations.sort_by(|a, b| b.modified.cmp(&a.modified).then(a.name.cmp(&b.name)));
    Ok(conversations)
}

const ACTIONS: &[&str] = &[
    "running", "jumping", "walking", "skipping", "hopping", "flying", "swimming", "crawling",
    "sneaking", "sprinting",
];
const ADJECTIVES: &[&str] = &[
    "funny", "happy", "sad", "angry", "silly", "crazy", "sneaky", "sleepy", "hungry", "thirsty",
];
const NOUNS: &[&str] = &[
    "cat", "dog", "rat", "mouse", "fish", "elephant", "dinosaur", "monkey", "giraffe", "penguin",
];

/// Readable name for a new conversation, `YYYY-MM-DD-<action>-<adjective>-<noun>`
pub fn generate_name() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{}-{}-{}-{}",
        Local::now().format("%Y-%m-%d"),
        pick(ACTIONS, &mut rng),
        pick(ADJECTIVES, &mut rng),
        pick(NOUNS, &mut rng)
    )
}

fn pick(words: &[&'static str], rng: &mut impl rand::Rng) -> &'static str {
    words.choose(rng).copied().unwrap_or("unnamed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use tempfile::TempDir;

    #[test]
    fn test_generate_name_shape() {
        let name = generate_name();
        let parts: Vec<_> = name.split('-').collect();
        assert_eq!(parts.len(), 6);
        assert_eq!(parts[0].len(), 4);
        assert!(NOUNS.contains(&parts[5]));
    }

    #[test]
    fn test_list_conversations() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::rooted(dir.path());
        assert!(list_conversations(&paths).unwrap().is_empty());

        let mut log = Transcript::load(&paths, "one", vec![Message::system("s")], "main").unwrap();
        log.append(Message::user("hi")).unwrap();
        log.branch("alt").unwrap();
        Transcript::load(&paths, "two", vec![Message::system("s")], "main").unwrap();

        let listed = list_conversations(&paths).unwrap();
        assert_eq!(listed.len(), 2);
        let one = listed.iter().find(|c| c.name == "one").unwrap();
        assert_eq!(one.messages, 2);
        assert_eq!(one.branches, 2);
    }
}
