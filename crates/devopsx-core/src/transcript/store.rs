//! Branchable conversation transcript
//!
//! Layout on disk:
//!
//! ```text
//! <logs_dir>/<name>/conversation.jsonl      main branch
//! <logs_dir>/<name>/branches/<branch>.jsonl every other branch
//! ```
//!
//! Every mutation rewrites the affected files in full. Destructive mutations
//! (undo, edit) first snapshot the active branch into `<branch>-<op>-<n>`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::{files, CMDFIX, MAIN_BRANCH};
use crate::error::{Error, Result};
use crate::message::{len_tokens, Message};
use crate::paths::Paths;
use crate::reduce::{limit_log, reduce_log, ReduceOptions};
use crate::transcript::jsonl::{read_jsonl, write_jsonl};

pub struct Transcript {
    logs_dir: PathBuf,
    name: String,
    current_branch: String,
    branches: BTreeMap<String, Vec<Message>>,
}

impl Transcript {
    /// Open `name`, creating it when absent.
    ///
    /// Every branch file found on disk is loaded. When the requested branch
    /// has no file (or an empty one) it is seeded from `initial`, as is `main`.
    pub fn load(paths: &Paths, name: &str, initial: Vec<Message>, branch: &str) -> Result<Self> {
        validate_name("conversation", name)?;
        validate_name("branch", branch)?;

        let dir = paths.conversation_dir(name);
        let mut branches = BTreeMap::new();

        let main_file = dir.join(files::CONVERSATION_FILE);
        if main_file.exists() {
            branches.insert(MAIN_BRANCH.to_string(), read_jsonl(&main_file)?);
        }

        let branches_dir = dir.join(files::BRANCHES_DIR);
        if branches_dir.is_dir() {
            let entries = fs::read_dir(&branches_dir)
                .map_err(|source| Error::io("listing branches", &branches_dir, source))?;
            for entry in entries {
                let path = entry
                    .map_err(|source| Error::io("listing branches", &branches_dir, source))?
                    .path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if stem == MAIN_BRANCH {
                    continue;
                }
                branches.insert(stem.to_string(), read_jsonl(&path)?);
            }
        }

        for seeded in [MAIN_BRANCH, branch] {
            let entry = branches.entry(seeded.to_string()).or_default();
            if entry.is_empty() {
                *entry = initial.clone();
            }
        }

        let transcript = Self {
            logs_dir: paths.logs_dir.clone(),
            name: name.to_string(),
            current_branch: branch.to_string(),
            branches,
        };
        transcript.write()?;
        tracing::debug!(
            name = %transcript.name,
            branch = %transcript.current_branch,
            messages = transcript.len(),
            "Loaded transcript"
        );
        Ok(transcript)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding this transcript's files
    pub fn dir(&self) -> PathBuf {
        self.logs_dir.join(&self.name)
    }

    pub fn current_branch(&self) -> &str {
        &self.current_branch
    }

    /// Branch names in sorted order
    pub fn branches(&self) -> Vec<&str> {
        self.branches.keys().map(String::as_str).collect()
    }

    pub fn branch_messages(&self, branch: &str) -> Option<&[Message]> {
        self.branches.get(branch).map(Vec::as_slice)
    }

    /// Messages on the active branch
    pub fn messages(&self) -> &[Message] {
        self.branches
            .get(&self.current_branch)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.messages().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages().is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages().last()
    }

    fn active_mut(&mut self) -> &mut Vec<Message> {
        self.branches
            .entry(self.current_branch.clone())
            .or_default()
    }

    fn branch_file(&self, branch: &str) -> PathBuf {
        let dir = self.dir();
        if branch == MAIN_BRANCH {
            dir.join(files::CONVERSATION_FILE)
        } else {
            dir.join(files::BRANCHES_DIR)
                .join(format!("{}.jsonl", branch))
        }
    }

    /// Persist every branch
    pub fn write(&self) -> Result<()> {
        for (branch, messages) in &self.branches {
            write_jsonl(&self.branch_file(branch), messages)?;
        }
        Ok(())
    }

    fn write_branch(&self, branch: &str) -> Result<()> {
        let messages = self.branch_messages(branch).unwrap_or_default();
        write_jsonl(&self.branch_file(branch), messages)
    }

    /// Add to the active branch and persist it
    pub fn append(&mut self, msg: Message) -> Result<()> {
        self.active_mut().push(msg);
        if let Err(e) = self.write_branch(&self.current_branch) {
            self.active_mut().pop();
            return Err(e);
        }
        Ok(())
    }

    /// Copy the active branch into `<branch>-<op>-<n>` and persist it
    fn save_backup_branch(&mut self, op: &str) -> Result<String> {
        let prefix = format!("{}-{}-", self.current_branch, op);
        let n = self
            .branches
            .keys()
            .filter(|b| b.starts_with(&prefix))
            .count();
        let backup = format!("{}{}", prefix, n);
        let snapshot = self.messages().to_vec();
        self.branches.insert(backup.clone(), snapshot);
        self.write_branch(&backup)?;
        tracing::debug!(backup = %backup, "Saved backup branch");
        Ok(backup)
    }

    /// Remove the last `n` messages from the active branch.
    ///
    /// A trailing `/undo` command is discarded first without a backup, so
    /// the command that triggered the undo never counts towards `n`. Returns
    /// the removed messages, oldest first.
    pub fn undo(&mut self, n: usize, quiet: bool) -> Result<Vec<Message>> {
        if self
            .last()
            .is_some_and(|m| m.content.starts_with(&format!("{}undo", CMDFIX)))
        {
            self.active_mut().pop();
        }

        if self.is_empty() {
            tracing::warn!(branch = %self.current_branch, "Nothing to undo");
            self.write_branch(&self.current_branch)?;
            return Ok(Vec::new());
        }

        self.save_backup_branch("undo")?;

        let keep = self.len().saturating_sub(n);
        let removed = self.active_mut().split_off(keep);
        self.write_branch(&self.current_branch)?;

        for msg in &removed {
            if quiet {
                tracing::debug!(message = %msg.format_line(Some(50)), "Undid message");
            } else {
                tracing::info!(message = %msg.format_line(Some(50)), "Undid message");
            }
        }
        Ok(removed)
    }

    /// Replace the active branch wholesale, after a backup
    pub fn edit(&mut self, messages: Vec<Message>) -> Result<()> {
        self.save_backup_branch("edit")?;
        *self.active_mut() = messages;
        self.write_branch(&self.current_branch)
    }

    /// Drop the trailing command message without a backup
    pub fn discard_last_command(&mut self) -> Result<Option<Message>> {
        if !self.last().is_some_and(Message::is_command) {
            return Ok(None);
        }
        let removed = self.active_mut().pop();
        self.write_branch(&self.current_branch)?;
        Ok(removed)
    }

    /// Switch to `name`, creating it as a copy of the active branch if new
    pub fn branch(&mut self, name: &str) -> Result<()> {
        validate_name("branch", name)?;
        self.write()?;
        if !self.branches.contains_key(name) {
            tracing::info!(branch = %name, from = %self.current_branch, "Creating branch");
            let copy = self.messages().to_vec();
            self.branches.insert(name.to_string(), copy);
            self.write_branch(name)?;
        }
        self.current_branch = name.to_string();
        Ok(())
    }

    /// Copy the whole transcript directory to a new name. Stays on this one.
    pub fn fork(&self, name: &str) -> Result<PathBuf> {
        validate_name("conversation", name)?;
        self.write()?;
        let target = self.logs_dir.join(name);
        if target.exists() {
            return Err(Error::AlreadyExists(target));
        }
        copy_dir(&self.dir(), &target)?;
        tracing::info!(from = %self.name, to = %name, "Forked conversation");
        Ok(target)
    }

    /// Move the transcript directory. With `keep_date`, the first ten
    /// characters of the current name (the date) prefix the new one.
    pub fn rename(&mut self, name: &str, keep_date: bool) -> Result<()> {
        let name = if keep_date {
            let date: String = self.name.chars().take(10).collect();
            format!("{}-{}", date, name)
        } else {
            name.to_string()
        };
        validate_name("conversation", &name)?;

        let target = self.logs_dir.join(&name);
        if target.exists() {
            return Err(Error::AlreadyExists(target));
        }
        let source = self.dir();
        fs::create_dir_all(&source)
            .map_err(|e| Error::io("creating conversation directory", &source, e))?;
        fs::rename(&source, &target).map_err(|e| Error::io("renaming conversation", &source, e))?;
        tracing::info!(from = %self.name, to = %name, "Renamed conversation");
        self.name = name;
        Ok(())
    }

    /// Compare the active branch against `other`.
    ///
    /// Returns `None` when both are identical; otherwise the diverging suffix
    /// of the active branch as `+` lines followed by the suffix of `other`
    /// as `-` lines.
    pub fn diff(&self, other: &str) -> Result<Option<String>> {
        let theirs = self.branch_messages(other).ok_or_else(|| {
            Error::unregistered("branch", other, "Use /branch <name> to create it.")
        })?;
        let ours = self.messages();

        let shared = ours
            .iter()
            .zip(theirs)
            .take_while(|(a, b)| a == b)
            .count();
        if shared == ours.len() && shared == theirs.len() {
            return Ok(None);
        }

        let lines: Vec<String> = ours[shared..]
            .iter()
            .map(|m| format!("+ {}", m.format_line(None)))
            .chain(
                theirs[shared..]
                    .iter()
                    .map(|m| format!("- {}", m.format_line(None))),
            )
            .collect();
        Ok(Some(lines.join("\n")))
    }

    /// Active branch without hidden messages, reduced to fit the budget
    pub fn prepare_messages(&self, options: &ReduceOptions) -> Vec<Message> {
        let visible: Vec<Message> = self
            .messages()
            .iter()
            .filter(|m| !m.hidden)
            .cloned()
            .collect();

        let reduced = reduce_log(&visible, options);
        let (before, after) = (len_tokens(&visible), len_tokens(&reduced));
        if before != after {
            tracing::info!(before, after, "Reduced log tokens");
        }

        let limited = limit_log(&reduced, options.budget_tokens);
        if limited.len() != reduced.len() {
            tracing::info!(
                before = reduced.len(),
                after = limited.len(),
                "Limited log messages"
            );
        }
        limited
    }
}

/// Names become directory and file names
fn validate_name(kind: &'static str, name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\');
    if invalid {
        return Err(Error::Parse(format!("invalid {} name '{}'", kind, name)));
    }
    Ok(())
}

fn copy_dir(source: &Path, target: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(source) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source).to_path_buf();
            Error::io("walking conversation", path, e.into())
        })?;
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let dest = target.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).map_err(|e| Error::io("creating directory", &dest, e))?;
        } else {
            fs::copy(entry.path(), &dest).map_err(|e| Error::io("copying file", &dest, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Paths) {
        let dir = TempDir::new().unwrap();
        let paths = Paths::rooted(dir.path());
        (dir, paths)
    }

    fn seeded(paths: &Paths, name: &str) -> Transcript {
        Transcript::load(paths, name, vec![Message::system("You are helpful.")], MAIN_BRANCH)
            .unwrap()
    }

    #[test]
    fn test_load_seeds_and_persists_main() {
        let (_dir, paths) = setup();
        let log = seeded(&paths, "chat");
        assert_eq!(log.len(), 1);
        assert_eq!(log.current_branch(), "main");
        assert!(paths.conversation_dir("chat").join("conversation.jsonl").exists());
    }

    #[test]
    fn test_append_round_trips_through_disk() {
        let (_dir, paths) = setup();
        let mut log = seeded(&paths, "chat");
        log.append(Message::user("hello").with_hidden(true)).unwrap();
        log.append(Message::assistant("hi").with_pinned(true)).unwrap();

        let reloaded = Transcript::load(&paths, "chat", Vec::new(), MAIN_BRANCH).unwrap();
        assert_eq!(reloaded.messages(), log.messages());
    }

    #[test]
    fn test_undo_removes_and_backs_up() {
        let (_dir, paths) = setup();
        let mut log = seeded(&paths, "chat");
        log.append(Message::user("a")).unwrap();
        log.append(Message::assistant("b")).unwrap();
        let before = log.messages().to_vec();

        let removed = log.undo(2, true).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(log.messages(), &before[..1]);
        assert_eq!(log.branch_messages("main-undo-0").unwrap(), &before[..]);
    }

    #[test]
    fn test_repeated_undo_commands() {
        let (_dir, paths) = setup();
        let mut log = seeded(&paths, "chat");
        log.append(Message::user("question")).unwrap();
        log.append(Message::assistant("answer")).unwrap();
        assert_eq!(log.len(), 3);

        log.append(Message::user("/undo")).unwrap();
        log.undo(1, false).unwrap();
        log.append(Message::user("/undo")).unwrap();
        log.undo(1, false).unwrap();

        assert_eq!(log.len(), 1);
        assert_eq!(log.messages()[0].content, "You are helpful.");
        let backups: Vec<_> = log
            .branches()
            .into_iter()
            .filter(|b| b.starts_with("main-undo-"))
            .collect();
        assert_eq!(backups, vec!["main-undo-0", "main-undo-1"]);
    }

    #[test]
    fn test_undo_of_other_command_still_backs_up() {
        let (_dir, paths) = setup();
        let mut log = seeded(&paths, "chat");
        log.append(Message::user("/log")).unwrap();
        let before = log.messages().to_vec();

        log.undo(1, true).unwrap();
        assert_eq!(log.messages(), &before[..1]);
        assert_eq!(log.branch_messages("main-undo-0").unwrap(), &before[..]);
    }

    #[test]
    fn test_undo_on_empty_branch_is_noop() {
        let (_dir, paths) = setup();
        let mut log = Transcript::load(&paths, "empty", Vec::new(), MAIN_BRANCH).unwrap();
        let removed = log.undo(1, true).unwrap();
        assert!(removed.is_empty());
        assert_eq!(log.branches(), vec!["main"]);
    }

    #[test]
    fn test_edit_backs_up_then_replaces() {
        let (_dir, paths) = setup();
        let mut log = seeded(&paths, "chat");
        log.append(Message::user("typo")).unwrap();
        let original = log.messages().to_vec();

        log.edit(vec![Message::user("fixed")]).unwrap();
        assert_eq!(log.messages()[0].content, "fixed");
        assert_eq!(log.branch_messages("main-edit-0").unwrap(), &original[..]);
    }

    #[test]
    fn test_branch_diverges_and_diff_shows_suffixes() {
        let (_dir, paths) = setup();
        let mut log = seeded(&paths, "chat");
        log.append(Message::user("shared")).unwrap();

        log.branch("x").unwrap();
        log.append(Message::user("on x")).unwrap();
        log.branch("main").unwrap();
        log.append(Message::user("on main")).unwrap();

        let diff = log.diff("x").unwrap().unwrap();
        assert_eq!(diff, "+ user: on main\n- user: on x");
        assert!(!diff.contains("shared"));
    }

    #[test]
    fn test_diff_identical_and_unknown() {
        let (_dir, paths) = setup();
        let mut log = seeded(&paths, "chat");
        log.branch("copy").unwrap();
        assert_eq!(log.diff("main").unwrap(), None);
        assert!(matches!(log.diff("nope"), Err(Error::Unregistered { .. })));
    }

    #[test]
    fn test_branch_files_reload() {
        let (_dir, paths) = setup();
        let mut log = seeded(&paths, "chat");
        log.branch("feature").unwrap();
        log.append(Message::user("only here")).unwrap();

        let reloaded = Transcript::load(&paths, "chat", Vec::new(), "feature").unwrap();
        assert_eq!(reloaded.current_branch(), "feature");
        assert_eq!(reloaded.last().unwrap().content, "only here");
        assert_eq!(reloaded.branch_messages("main").unwrap().len(), 1);
    }

    #[test]
    fn test_fork_copies_without_switching() {
        let (_dir, paths) = setup();
        let mut log = seeded(&paths, "chat");
        log.branch("side").unwrap();
        log.fork("chat-copy").unwrap();
        assert_eq!(log.name(), "chat");

        let copy = Transcript::load(&paths, "chat-copy", Vec::new(), MAIN_BRANCH).unwrap();
        assert!(copy.branches().contains(&"side"));
        assert!(matches!(log.fork("chat-copy"), Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_rename_keep_date_and_collision() {
        let (_dir, paths) = setup();
        let mut log = seeded(&paths, "2024-05-01-quick-brown-fox");
        log.rename("deploy", true).unwrap();
        assert_eq!(log.name(), "2024-05-01-deploy");
        assert!(paths.conversation_dir("2024-05-01-deploy").exists());
        assert!(!paths.conversation_dir("2024-05-01-quick-brown-fox").exists());

        seeded(&paths, "taken");
        assert!(matches!(log.rename("taken", false), Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_discard_last_command() {
        let (_dir, paths) = setup();
        let mut log = seeded(&paths, "chat");
        log.append(Message::user("/tokens")).unwrap();
        let removed = log.discard_last_command().unwrap();
        assert_eq!(removed.unwrap().content, "/tokens");
        assert_eq!(log.discard_last_command().unwrap(), None);
    }

    #[test]
    fn test_prepare_messages_drops_hidden() {
        let (_dir, paths) = setup();
        let mut log = seeded(&paths, "chat");
        log.append(Message::system("internal").with_hidden(true)).unwrap();
        log.append(Message::user("visible")).unwrap();
        let prepared = log.prepare_messages(&ReduceOptions::default());
        assert_eq!(prepared.len(), 2);
        assert!(prepared.iter().all(|m| !m.hidden));
    }

    #[test]
    fn test_invalid_branch_name_rejected() {
        let (_dir, paths) = setup();
        let mut log = seeded(&paths, "chat");
        assert!(matches!(log.branch("../escape"), Err(Error::Parse(_))));
    }
}
