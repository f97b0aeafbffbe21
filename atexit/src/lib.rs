// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use lazy_static::lazy_static;
use log::warn;
use std::sync::{Arc, Mutex};

type Cleanup = Box<dyn FnMut() + Send>;

struct Registry {
    cleanups: Mutex<Vec<Cleanup>>,
}

lazy_static! {
    static ref REGISTRY: Arc<Registry> = Registry::install();
}

/// Register a cleanup to run at exit (when `execute` or `exit_process` is called,
/// or when the process receives an interrupt or termination signal).
pub fn register<F: FnMut() + 'static + Send>(cleanup: F) {
    REGISTRY.push(Box::new(cleanup))
}

/// Runs the registered cleanups, then terminates the process with `code`.
pub fn exit_process(code: i32) -> ! {
    REGISTRY.exit_process(code)
}

/// Runs the registered cleanups but does *not* terminate the process.
///
/// Not called automatically (e.g. via `drop`); `main` is expected to funnel
/// through here on its way out.
pub fn execute() {
    REGISTRY.execute()
}

impl Registry {
    fn install() -> Arc<Self> {
        let registry = Arc::new(Registry {
            cleanups: Mutex::new(vec![]),
        });
        {
            // With the `termination` feature, this covers SIGINT and SIGTERM on
            // unix (Ctrl+c and Ctrl+Break on Windows). The handler the `ctrlc`
            // crate installs signals a helper thread which then calls ours; an
            // OS-forced teardown (logoff, reboot) can still win that race and
            // skip the cleanups.
            let registry = registry.clone();
            ctrlc::set_handler(move || {
                warn!("interrupt or termination signal received, cleaning up");
                registry.exit_process(1);
            })
            .expect("More than one signal handler is not allowed");
        }
        registry
    }

    fn push(&self, cleanup: Cleanup) {
        self.cleanups.lock().unwrap().push(cleanup);
    }

    fn exit_process(&self, code: i32) -> ! {
        self.execute();
        std::process::exit(code);
    }

    fn execute(&self) {
        // Drain under the lock, run outside it. Each cleanup runs at most once
        // even if `execute` is reached from both `main` and the signal handler.
        let mut cleanups = std::mem::take(&mut *self.cleanups.lock().unwrap());
        for cleanup in cleanups.iter_mut() {
            cleanup();
        }
    }
}
