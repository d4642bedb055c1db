//! Toy text generator that streams a made-up answer one character at a time.

use std::time::Duration;

use futures::{stream, StreamExt};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::generator::{FragmentStream, GenerationError, Generator};

const WORDS: &[&str] = &[
    "the", "a", "an", "in", "on", "with", "for", "to", "from",
    "text", "response", "generation", "process", "system", "model",
    "input", "output", "data", "information", "content",
    "analysis", "research", "development", "implementation", "solution",
    "approach", "methodology", "framework", "architecture", "design",
    "optimization", "performance", "efficiency", "reliability", "scalability",
    "integration", "deployment", "monitoring", "maintenance", "support",
];

const RESPONSE_LENGTH_FACTOR: usize = 3;
const MIN_RESPONSE_WORDS: usize = 5;
const PROMPT_QUOTE_CHARS: usize = 20;

/// Generates a response loosely based on the prompt's words
#[derive(Debug, Clone)]
pub struct TextGenerator {
    char_delay: Duration,
    max_word_pause: Duration,
    pause_probability: f64,
}

impl Default for TextGenerator {
    fn default() -> Self {
        Self {
            char_delay: Duration::from_millis(10),
            max_word_pause: Duration::from_millis(200),
            pause_probability: 0.3,
        }
    }
}

impl TextGenerator {
    /// Generator with the default delays
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before every character
    pub fn with_char_delay(mut self, delay: Duration) -> Self {
        self.char_delay = delay;
        self
    }

    /// Longest extra pause after a space, taken with `probability`
    pub fn with_word_pause(mut self, max_pause: Duration, probability: f64) -> Self {
        self.max_word_pause = max_pause;
        self.pause_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Build the full response text for a prompt
    pub fn compose<R: Rng + ?Sized>(prompt: &str, rng: &mut R) -> String {
        let words: Vec<&str> = prompt.split_whitespace().collect();
        let word_count = (words.len() * RESPONSE_LENGTH_FACTOR).max(MIN_RESPONSE_WORDS);

        let mut parts: Vec<String> = (0..word_count)
            .map(|_| match words.choose(&mut *rng) {
                Some(word) if rng.gen_bool(0.5) => {
                    if rng.gen_bool(0.3) {
                        word.to_uppercase()
                    } else {
                        word.to_string()
                    }
                }
                _ => WORDS.choose(&mut *rng).copied().unwrap_or("text").to_string(),
            })
            .collect();

        if let Some(first) = parts.first_mut() {
            *first = capitalize(first);
        }

        let mut response = parts.join(" ");
        response.push_str(&Self::conclusion(prompt, &words, rng));
        response
    }

    fn conclusion<R: Rng + ?Sized>(prompt: &str, words: &[&str], rng: &mut R) -> String {
        match rng.gen_range(0..3) {
            0 => {
                let quoted: String = prompt.chars().take(PROMPT_QUOTE_CHARS).collect();
                let ellipsis = if prompt.chars().count() > PROMPT_QUOTE_CHARS { "..." } else { "" };
                format!("\n\nBased on your prompt \"{quoted}{ellipsis}\", this is my response.")
            }
            1 => format!(
                "\n\nI hope this helps with your request about {}.",
                words.first().copied().unwrap_or("this topic")
            ),
            _ => "\n\nThank you for your prompt. This was my generated response.".to_string(),
        }
    }

    fn schedule<R: Rng + ?Sized>(&self, response: &str, rng: &mut R) -> Vec<(String, Duration)> {
        let mut previous = None;
        response
            .chars()
            .map(|c| {
                let mut delay = self.char_delay;
                if previous == Some(' ')
                    && !self.max_word_pause.is_zero()
                    && rng.gen_bool(self.pause_probability)
                {
                    delay += self.max_word_pause.mul_f64(rng.gen::<f64>());
                }
                previous = Some(c);
                (c.to_string(), delay)
            })
            .collect()
    }
}

impl Generator for TextGenerator {
    fn generate(&self, prompt: &str) -> FragmentStream {
        // ThreadRng is not Send, so every random choice is made up front.
        let mut rng = rand::thread_rng();
        let response = Self::compose(prompt, &mut rng);
        let schedule = self.schedule(&response, &mut rng);

        stream::iter(schedule)
            .then(|(fragment, delay)| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, GenerationError>(fragment)
            })
            .boxed()
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}
