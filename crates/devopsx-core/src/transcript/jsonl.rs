//! JSON Lines persistence for message sequences
//!
//! One message per line. Writes replace the whole file via a temporary
//! sibling and a rename, so readers see either the old or the new sequence.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::message::Message;

/// Read every message from `path`. Blank lines are skipped.
pub fn read_jsonl(path: &Path) -> Result<Vec<Message>> {
    let file = File::open(path).map_err(|source| Error::io("opening transcript", path, source))?;
    let reader = BufReader::new(file);

    let mut messages = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line_number = index + 1;
        let line = line.map_err(|source| Error::io("reading transcript", path, source))?;
        if line.trim().is_empty() {
            continue;
        }
        let msg = serde_json::from_str::<Message>(&line).map_err(|e| Error::Corrupt {
            path: path.to_path_buf(),
            line: line_number,
            reason: e.to_string(),
        })?;
        messages.push(msg);
    }
    Ok(messages)
}

/// Count records without parsing them
pub fn count_records(path: &Path) -> Result<usize> {
    let content =
        fs::read_to_string(path).map_err(|source| Error::io("reading transcript", path, source))?;
    Ok(content.lines().filter(|l| !l.trim().is_empty()).count())
}

/// Replace the contents of `path` with `messages`
pub fn write_jsonl(path: &Path, messages: &[Message]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|source| Error::io("creating transcript directory", parent, source))?;
    }

    let tmp = temp_path(path);
    let file = File::create(&tmp).map_err(|source| Error::io("creating transcript", &tmp, source))?;
    let mut writer = BufWriter::new(file);
    for msg in messages {
        let line = serde_json::to_string(msg).map_err(|e| Error::Corrupt {
            path: path.to_path_buf(),
            line: 0,
            reason: format!("failed to serialize message: {}", e),
        })?;
        writeln!(writer, "{}", line).map_err(|source| Error::io("writing transcript", &tmp, source))?;
    }

    let file = writer
        .into_inner()
        .map_err(|e| Error::io("flushing transcript", &tmp, e.into_error()))?;
    file.sync_all()
        .map_err(|source| Error::io("syncing transcript", &tmp, source))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|source| Error::io("replacing transcript", path, source))
}

/// Unique sibling so concurrent writers never share a temporary file
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip_preserves_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conversation.jsonl");
        let messages = vec![
            Message::system("prompt").with_pinned(true),
            Message::user("hello").with_hidden(true),
            Message::assistant("hi there\nsecond line").with_quiet(true),
        ];
        write_jsonl(&path, &messages).unwrap();
        assert_eq!(read_jsonl(&path).unwrap(), messages);
        assert_eq!(count_records(&path).unwrap(), 3);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_overwrite_replaces_sequence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b.jsonl");
        write_jsonl(&path, &[Message::user("one"), Message::user("two")]).unwrap();
        write_jsonl(&path, &[Message::user("three")]).unwrap();
        let back = read_jsonl(&path).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].content, "three");
    }

    #[test]
    fn test_corrupt_line_reports_line_number() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.jsonl");
        let good = serde_json::to_string(&Message::user("ok")).unwrap();
        std::fs::write(&path, format!("{}\n{{\"role\":\"user\",\"cont", good)).unwrap();
        match read_jsonl(&path) {
            Err(Error::Corrupt { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected corrupt error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_timestamp_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("legacy.jsonl");
        std::fs::write(&path, "{\"role\":\"assistant\",\"content\":\"x\"}\n\n").unwrap();
        let back = read_jsonl(&path).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].content, "x");
    }
}
