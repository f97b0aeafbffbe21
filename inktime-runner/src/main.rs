// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info};

use inktime_runner_lib::config::Config;
use inktime_runner_lib::lock::LockStatus;
use inktime_runner_lib::run::{run, Outcome};

#[derive(Parser, Debug)]
#[command(name = "inktime-runner", version, about = "single-instance wrapper for the InkTime daily render job")]
struct Opt {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the daily render once; a benign no-op when another instance holds the lock.
    Run(RootOpt),
    /// Report whether the render lock is held, by whom, and whether the owner is alive.
    Status(RootOpt),
    /// Remove a stale render lock. Refuses while the recorded owner is still running.
    Unlock(RootOpt),
}

#[derive(Args, Debug)]
struct RootOpt {
    /// Project root; every other path derives from it.
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();

    let opt = Opt::parse();

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(dispatch(opt));

    if let Err(err) = &result {
        error!("inktime-runner failed: {:?}", err);
    }

    atexit::execute();
    result
}

async fn dispatch(opt: Opt) -> Result<()> {
    match opt.command {
        Cmd::Run(opt) => {
            let config = Config::new(opt.root);
            match run(&config).await? {
                Outcome::Completed => info!("render completed"),
                Outcome::Skipped => info!("render skipped, another instance is running"),
            }
            Ok(())
        }
        Cmd::Status(opt) => status(&Config::new(opt.root)),
        Cmd::Unlock(opt) => unlock(&Config::new(opt.root)),
    }
}

fn status(config: &Config) -> Result<()> {
    let lock_path = config.lock_path();

    match LockStatus::probe(&lock_path)? {
        LockStatus::Free => {
            println!("lock free: {}", lock_path.display());
        }
        LockStatus::Held { owner, alive } => {
            println!("lock held: {}", lock_path.display());
            if let Some(owner) = owner {
                println!("owner pid: {}", owner.pid);
                println!("acquired at: {}", owner.acquired_at);
            } else {
                println!("owner: unknown (no owner record)");
            }
            match alive {
                Some(true) => println!("owner process: alive"),
                Some(false) => println!("owner process: gone (stale lock, run `unlock`)"),
                None => println!("owner process: unknown"),
            }
        }
    }

    Ok(())
}

fn unlock(config: &Config) -> Result<()> {
    let lock_path = config.lock_path();

    match LockStatus::probe(&lock_path)? {
        LockStatus::Free => {
            println!("no lock to remove: {}", lock_path.display());
        }
        LockStatus::Held { owner, alive } => {
            if alive == Some(true) {
                let pid = owner.map(|owner| owner.pid).unwrap_or_default();
                bail!("lock owner (pid {pid}) is still running, not removing");
            }

            std::fs::remove_dir_all(&lock_path).with_context(|| {
                format!("unable to remove lock marker: {}", lock_path.display())
            })?;
            println!("removed stale lock: {}", lock_path.display());
        }
    }

    Ok(())
}
