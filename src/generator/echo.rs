//! Deterministic generator that streams the prompt back.

use std::time::Duration;

use futures::{stream, StreamExt};

use crate::generator::{FragmentStream, GenerationError, Generator};

/// Echoes the prompt one character per fragment.
///
/// Prompts containing the configured failure marker fail after
/// `fail_after` fragments, which makes partial-failure batches easy to build.
#[derive(Debug, Clone, Default)]
pub struct EchoGenerator {
    delay: Duration,
    fail_marker: Option<String>,
    fail_after: usize,
}

impl EchoGenerator {
    /// Echo with no delay and no failures
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait this long before every fragment
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail prompts containing `marker` after `fail_after` fragments
    pub fn failing_on(mut self, marker: impl Into<String>, fail_after: usize) -> Self {
        self.fail_marker = Some(marker.into());
        self.fail_after = fail_after;
        self
    }

    fn should_fail(&self, prompt: &str) -> bool {
        self.fail_marker
            .as_deref()
            .is_some_and(|marker| prompt.contains(marker))
    }
}

impl Generator for EchoGenerator {
    fn generate(&self, prompt: &str) -> FragmentStream {
        let mut items: Vec<Result<String, GenerationError>> =
            prompt.chars().map(|c| Ok(c.to_string())).collect();

        if self.should_fail(prompt) {
            items.truncate(self.fail_after);
            items.push(Err(GenerationError::Failed(format!(
                "prompt rejected after {} fragments",
                self.fail_after
            ))));
        }

        let delay = self.delay;
        stream::iter(items)
            .then(move |item| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed()
    }
}
