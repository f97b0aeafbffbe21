// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use chrono::Local;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Append-only event log shared by every invocation of the runner.
///
/// The wrapper's own events are written as `[YYYY-MM-DD HH:MM:SS] <message>`
/// lines. The render process writes through duplicated handles of the same
/// append-mode file, so its raw output interleaves with the wrapper's lines
/// in kernel append order.
pub struct Journal {
    file: File,
}

impl Journal {
    /// Open (create-if-absent) the journal in append mode. The handle is held
    /// for the duration of the run.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("unable to open journal: {}", path.display()))?;

        Ok(Self { file })
    }

    /// Append one timestamped line.
    pub fn note(&mut self, message: &str) -> Result<()> {
        let line = format!("[{}] {}\n", Local::now().format(TIMESTAMP_FORMAT), message);
        self.file
            .write_all(line.as_bytes())
            .context("unable to append to journal")?;
        Ok(())
    }

    /// Duplicate the underlying handle for a child's stdout or stderr, the
    /// equivalent of `>> render.log 2>&1`. The child's output is opaque
    /// pass-through; it is never timestamped or parsed.
    pub fn child_stdio(&self) -> Result<Stdio> {
        let dup = self
            .file
            .try_clone()
            .context("unable to duplicate journal handle")?;
        Ok(Stdio::from(dup))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_note_appends_timestamped_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("render.log");

        let mut journal = Journal::open(&path).unwrap();
        journal.note("render start").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let line = content.lines().next().unwrap();

        // `[` + 19-char timestamp + `]`, then the message.
        assert_eq!(Some('['), line.chars().next());
        assert_eq!(b']', line.as_bytes()[20]);
        assert_eq!("render start", &line[22..]);
        assert!(content.ends_with('\n'));
    }

    #[test]
    fn test_reopen_appends_not_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("render.log");

        let mut journal = Journal::open(&path).unwrap();
        journal.note("first").unwrap();
        drop(journal);

        let mut journal = Journal::open(&path).unwrap();
        journal.note("second").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let messages: Vec<_> = content.lines().map(|line| &line[22..]).collect();
        assert_eq!(vec!["first", "second"], messages);
    }

    #[test]
    fn test_child_stdio_shares_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("render.log");

        let journal = Journal::open(&path).unwrap();
        // The duplicated handle must exist even before anything is written.
        let _stdio = journal.child_stdio().unwrap();

        assert!(path.is_file());
    }
}
