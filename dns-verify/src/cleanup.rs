// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Best-effort teardown of provisioned resources
//!
//! Resources are registered as they are created.  Teardown runs every step in
//! reverse registration order so dependents go before what they depend on.
//! A failing or panicking step is logged and recorded, and the remaining
//! steps still run.

use futures::future::BoxFuture;
use futures::FutureExt;
use slog::{debug, info, warn};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use thiserror::Error;

type CleanupFn =
    Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Teardown steps waiting to run
#[derive(Default)]
pub struct CleanupStack {
    steps: Vec<(String, CleanupFn)>,
}

/// A teardown step that failed
#[derive(Debug)]
pub struct CleanupFailure {
    pub step: String,
    pub error: anyhow::Error,
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.step, self.error)
    }
}

/// Every teardown step that failed, in the order they ran
#[derive(Debug, Error)]
#[error("{} cleanup step(s) failed: {}", .failures.len(), summarize(.failures))]
pub struct CleanupError {
    pub failures: Vec<CleanupFailure>,
}

fn summarize(failures: &[CleanupFailure]) -> String {
    failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; ")
}

impl CleanupStack {
    pub fn new() -> CleanupStack {
        CleanupStack::default()
    }

    /// Register a step that tears down something that was just created.
    pub fn push<F, Fut>(&mut self, step: impl Into<String>, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.steps.push((step.into(), Box::new(move || Box::pin(f()))));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every registered step, last registered first.
    pub async fn run(self, log: &slog::Logger) -> Result<(), CleanupError> {
        let mut failures = Vec::new();
        for (step, f) in self.steps.into_iter().rev() {
            debug!(log, "cleanup step starting"; "step" => &step);
            let outcome = AssertUnwindSafe(async move { f().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    let message = panic_message(&*payload);
                    Err(anyhow::anyhow!("panicked: {}", message))
                });
            match outcome {
                Ok(()) => info!(log, "cleaned up"; "step" => &step),
                Err(error) => {
                    warn!(log, "cleanup step failed";
                        "step" => &step,
                        "error" => format!("{:#}", error),
                    );
                    failures.push(CleanupFailure { step, error });
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupError { failures })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
