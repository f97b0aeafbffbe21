// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

#[cfg(target_family = "unix")]
const INTERPRETER: &str = "venv/bin/python";

#[cfg(target_family = "windows")]
const INTERPRETER: &str = "venv/Scripts/python.exe";

const SETTINGS_FILE: &str = "config.py";
const RENDER_SCRIPT: &str = "render_daily_photo.py";
const JOURNAL_FILE: &str = "render.log";
const LOCK_MARKER: &str = "render.lock";

/// Project layout, derived from a single project-root path.
///
/// The root is the only configured value; no environment variables are
/// consumed.
#[derive(Clone, Debug)]
pub struct Config {
    root: PathBuf,
}

impl Config {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.log_dir().join(JOURNAL_FILE)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.tmp_dir().join(LOCK_MARKER)
    }

    pub fn interpreter_path(&self) -> PathBuf {
        self.root.join(INTERPRETER)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    pub fn script_path(&self) -> PathBuf {
        self.root.join(RENDER_SCRIPT)
    }

    /// Create the log and tmp directories if absent and make the project root
    /// the working directory. Idempotent; failure is fatal to the run since
    /// nothing downstream is safe without the layout.
    pub async fn provision(&self) -> Result<()> {
        let log_dir = self.log_dir();
        fs::create_dir_all(&log_dir)
            .await
            .with_context(|| format!("unable to create log directory: {}", log_dir.display()))?;

        let tmp_dir = self.tmp_dir();
        fs::create_dir_all(&tmp_dir)
            .await
            .with_context(|| format!("unable to create tmp directory: {}", tmp_dir.display()))?;

        std::env::set_current_dir(&self.root).with_context(|| {
            format!("unable to change directory to root: {}", self.root.display())
        })?;

        Ok(())
    }
}
