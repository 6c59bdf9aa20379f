use crate::core::message::{Role, Turn};
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Plain-text transcript of finished exchanges.
///
/// User turns are written with a `You:` prefix, replies as-is and system
/// context as `## ` lines. Every turn is followed by a blank line. Empty
/// replies are skipped.
pub struct TranscriptLog {
    path: PathBuf,
}

impl TranscriptLog {
    /// Use `path` as the transcript, creating it if needed.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        // Fail up front rather than on the first exchange.
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, turns: &[Turn]) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = BufWriter::with_capacity(64 * 1024, file);
        for turn in turns {
            write_turn(&mut writer, turn)?;
        }
        writer.flush()
    }

    /// Replace the transcript with `turns`. The old file stays intact until
    /// the new one is completely written.
    pub fn rewrite(&self, turns: &[Turn]) -> io::Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut temp_file = NamedTempFile::new_in(parent)?;

        for turn in turns {
            write_turn(&mut temp_file, turn)?;
        }

        temp_file.flush()?;
        temp_file.as_file().sync_all()?;
        temp_file.persist(&self.path)?;
        Ok(())
    }
}

fn write_turn(writer: &mut impl Write, turn: &Turn) -> io::Result<()> {
    let text = match turn.role {
        Role::User => format!("You: {}", turn.content),
        Role::Assistant if turn.content.is_empty() => return Ok(()),
        Role::Assistant => turn.content.clone(),
        Role::System => format!("## {}", turn.content),
    };
    for line in text.lines() {
        writeln!(writer, "{line}")?;
    }
    writeln!(writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conversation::ConversationStore;
    use std::fs;
    use tempfile::TempDir;

    fn exchange(store: &ConversationStore, prompt: &str, reply: &str) -> Vec<Turn> {
        let user = store.append(prompt, Role::User);
        let assistant = store.append(reply, Role::Assistant);
        store
            .set_associated_id(user.id, assistant.id)
            .expect("pair");
        vec![
            store.find_by_id(user.id).expect("user"),
            store.find_by_id(assistant.id).expect("assistant"),
        ]
    }

    #[test]
    fn appends_exchanges_in_transcript_format() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let log = TranscriptLog::open(temp_dir.path().join("chat.log")).expect("open");
        let store = ConversationStore::new();

        log.append(&[store.append("notes.txt loaded", Role::System)])
            .expect("append system");
        log.append(&exchange(&store, "Hi", "Hello!\nHow can I help?"))
            .expect("append exchange");

        let contents = fs::read_to_string(log.path()).expect("read log");
        assert_eq!(
            contents,
            "## notes.txt loaded\n\nYou: Hi\n\nHello!\nHow can I help?\n\n"
        );
    }

    #[test]
    fn rewrite_replaces_contents_and_skips_empty_replies() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let log = TranscriptLog::open(temp_dir.path().join("chat.log")).expect("open");
        let store = ConversationStore::new();

        log.append(&exchange(&store, "Q", "old answer"))
            .expect("append");
        let mut turns = exchange(&store, "Q2", "");
        turns.insert(0, store.append("ctx", Role::System));
        log.rewrite(&turns).expect("rewrite");

        let contents = fs::read_to_string(log.path()).expect("read log");
        assert_eq!(contents, "## ctx\n\nYou: Q2\n\n");
    }

    #[test]
    fn open_fails_for_missing_directory() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("missing").join("chat.log");
        assert!(TranscriptLog::open(path).is_err());
    }
}
