// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::process::Stdio;

use anyhow::{bail, Context, Result};
use log::{error, info};
use tokio::process::Command;

use crate::config::Config;
use crate::journal::Journal;
use crate::lock::JobLock;

pub const RENDER_START: &str = "render start";
pub const RENDER_DONE: &str = "render done";
pub const SKIP_RUNNING: &str = "another render is running, skip.";

/// Non-error terminations of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The render process ran and exited zero.
    Completed,
    /// Another instance held the lock; nothing was rendered.
    Skipped,
}

/// Run the daily render once.
///
/// Provisions the layout, takes the single-instance lock (skipping when
/// contended), gates on the interpreter and settings preconditions, then
/// delegates to `render_daily_photo.py` with its output passed through into
/// the journal. The lock marker is removed on every exit path: the guard's
/// drop covers in-process returns and the registered releaser covers
/// signal-driven exits.
pub async fn run(config: &Config) -> Result<Outcome> {
    config.provision().await?;

    let mut journal = Journal::open(config.journal_path())?;

    let guard = match JobLock::acquire(config.lock_path())? {
        JobLock::Held => {
            info!(
                "lock marker held at {}, skipping",
                config.lock_path().display()
            );
            journal.note(SKIP_RUNNING)?;
            return Ok(Outcome::Skipped);
        }
        JobLock::Acquired(guard) => guard,
    };
    atexit::register(guard.releaser());

    journal.note(RENDER_START)?;

    check_preconditions(config, &mut journal)?;

    let interpreter = config.interpreter_path();

    info!("rendering via {}", interpreter.display());

    let status = Command::new(&interpreter)
        .arg(config.script_path())
        .current_dir(config.root())
        .stdin(Stdio::null())
        .stdout(journal.child_stdio()?)
        .stderr(journal.child_stdio()?)
        .status()
        .await
        .with_context(|| format!("render process failed to start: {}", interpreter.display()))?;

    if !status.success() {
        let message = format!("render failed: {status}");
        error!("{}", message);
        journal.note(&message)?;
        bail!(message);
    }

    journal.note(RENDER_DONE)?;

    info!("render done");

    Ok(Outcome::Completed)
}

/// Gate the run on its two external dependencies. Each unmet precondition is
/// journaled before the error propagates; the render process is never
/// spawned past a failure here.
fn check_preconditions(config: &Config, journal: &mut Journal) -> Result<()> {
    let interpreter = config.interpreter_path();
    let usable = match std::fs::metadata(&interpreter) {
        Ok(metadata) => is_executable(&metadata),
        Err(_) => false,
    };
    if !usable {
        let message = format!(
            "python interpreter not found or not executable: {}",
            interpreter.display()
        );
        error!("{}", message);
        journal.note(&message)?;
        bail!(message);
    }

    let settings = config.settings_path();
    if !settings.is_file() {
        let message = format!("config.py not found: {}", settings.display());
        error!("{}", message);
        journal.note(&message)?;
        bail!(message);
    }

    Ok(())
}

#[cfg(target_family = "unix")]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;

    metadata.is_file() && metadata.permissions().mode() & 0o111 != 0
}

#[cfg(target_family = "windows")]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    metadata.is_file()
}
