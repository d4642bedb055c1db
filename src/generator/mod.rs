//! Producers of text fragments.
//!
//! A generator turns a prompt into a lazy, finite stream of fragments. The
//! stream is consumed at most once; emission order is the only ordering
//! guarantee.

pub mod echo;
pub mod text;

pub use echo::EchoGenerator;
pub use text::TextGenerator;

use futures::stream::BoxStream;
use thiserror::Error;

/// Errors raised while producing fragments
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// The producer gave up with a message
    #[error("Generation failed: {0}")]
    Failed(String),

    /// Consumption stopped by cancellation
    #[error("Generation interrupted")]
    Interrupted,
}

/// Stream of fragments for one prompt
pub type FragmentStream = BoxStream<'static, Result<String, GenerationError>>;

/// Something that can answer a prompt fragment by fragment
pub trait Generator: Send + Sync {
    /// Start a fresh fragment stream for `prompt`
    fn generate(&self, prompt: &str) -> FragmentStream;
}

impl<F> Generator for F
where
    F: Fn(&str) -> FragmentStream + Send + Sync,
{
    fn generate(&self, prompt: &str) -> FragmentStream {
        self(prompt)
    }
}
