//! Generation requests, stream chunks, and results.

use serde::{Deserialize, Serialize};

use edgerun_kernel::SamplingParams;

use crate::error::{EngineError, ErrorKind};

/// A single generation request.
///
/// Each request produces either one [`GenerateResult`] or a finite sequence
/// of [`StreamChunk`]s terminated by a chunk with `done == true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Prompt text.
    pub prompt: String,
    /// Maximum number of tokens to generate.
    #[serde(default = "GenerationRequest::default_max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature in `[0, 2]`; 0 is deterministic for a fixed seed.
    #[serde(default = "GenerationRequest::default_temperature")]
    pub temperature: f32,
    /// Nucleus sampling mass in `(0, 1]`.
    #[serde(default = "GenerationRequest::default_top_p")]
    pub top_p: f32,
    /// Top-k cutoff (>= 1).
    #[serde(default = "GenerationRequest::default_top_k")]
    pub top_k: u32,
    /// Repetition penalty (>= 1).
    #[serde(default = "GenerationRequest::default_repetition_penalty")]
    pub repetition_penalty: f32,
    /// Stop sequences, matched against the tail of the cumulative text in
    /// order. Generation stops at the first match.
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    /// Sampler seed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Running-average confidence below which `needs_cloud_handoff` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f32>,
    /// Constrain output to JSON.
    #[serde(default)]
    pub json_mode: bool,
    /// GBNF grammar source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grammar: Option<String>,
    /// Grammar root rule name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grammar_root: Option<String>,
}

impl GenerationRequest {
    fn default_max_tokens() -> u32 {
        100
    }

    fn default_temperature() -> f32 {
        0.7
    }

    fn default_top_p() -> f32 {
        0.95
    }

    fn default_top_k() -> u32 {
        40
    }

    fn default_repetition_penalty() -> f32 {
        1.1
    }

    /// Request for `prompt` with every sampling field at its default.
    pub fn for_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: Self::default_max_tokens(),
            temperature: Self::default_temperature(),
            top_p: Self::default_top_p(),
            top_k: Self::default_top_k(),
            repetition_penalty: Self::default_repetition_penalty(),
            stop_sequences: Vec::new(),
            seed: None,
            confidence_threshold: None,
            json_mode: false,
            grammar: None,
            grammar_root: None,
        }
    }

    /// Validate ranges before anything reaches the kernel.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(EngineError::new(
                ErrorKind::InvalidConfig,
                format!("temperature {} outside [0, 2]", self.temperature),
            ));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(EngineError::new(
                ErrorKind::InvalidConfig,
                format!("top_p {} outside (0, 1]", self.top_p),
            ));
        }
        if self.top_k == 0 {
            return Err(EngineError::new(ErrorKind::InvalidConfig, "top_k must be >= 1"));
        }
        if self.repetition_penalty < 1.0 {
            return Err(EngineError::new(
                ErrorKind::InvalidConfig,
                format!("repetition_penalty {} must be >= 1", self.repetition_penalty),
            ));
        }
        if self.stop_sequences.iter().any(String::is_empty) {
            return Err(EngineError::new(
                ErrorKind::InvalidConfig,
                "stop_sequences must not contain the empty string",
            ));
        }
        if let Some(threshold) = self.confidence_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(EngineError::new(
                    ErrorKind::InvalidConfig,
                    format!("confidence_threshold {threshold} outside [0, 1]"),
                ));
            }
        }
        Ok(())
    }

    /// Kernel-level sampling parameters for this request.
    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            repetition_penalty: self.repetition_penalty,
            seed: self.seed,
            json_mode: self.json_mode,
            grammar: self.grammar.clone(),
            grammar_root: self.grammar_root.clone(),
        }
    }
}

/// Why a stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The token budget was exhausted, or the model finished on its own.
    MaxTokens,
    /// A stop sequence appeared in the cumulative text.
    StopSequence,
    /// The caller cancelled the request.
    Cancelled,
    /// Generation failed; the stream's final chunk carries the error flag.
    Error,
}

/// Stats attached to the final chunk of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FinalStats {
    /// Wall time for the whole request in milliseconds.
    pub time_ms: u64,
    /// Generated tokens per second.
    pub tokens_per_second: f64,
    /// Why the stream stopped.
    pub stop_reason: StopReason,
}

/// One element of a token stream.
///
/// Invariants: `text` of chunk `i` is a prefix of chunk `i + 1`'s `text`;
/// exactly one chunk has `done == true` and it is the last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Text added by this chunk.
    pub token: String,
    /// Cumulative text so far.
    pub text: String,
    /// Tokens generated so far.
    pub tokens_generated: u32,
    /// Whether this is the terminal chunk.
    pub done: bool,
    /// Logit-derived confidence of this token, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// Running mean confidence across the stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_confidence: Option<f32>,
    /// True once the running mean first drops below the request's
    /// confidence threshold; sticky from then on.
    #[serde(default)]
    pub needs_cloud_handoff: bool,
    /// Zero-based token index.
    pub token_index: u32,
    /// Present on the final chunk only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<FinalStats>,
    /// Present on an error-terminal chunk only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineError>,
}

impl StreamChunk {
    /// A terminal chunk carrying final stats.
    pub fn terminal(
        text: String,
        tokens_generated: u32,
        stats: FinalStats,
        avg_confidence: Option<f32>,
        needs_cloud_handoff: bool,
    ) -> Self {
        Self {
            token: String::new(),
            text,
            tokens_generated,
            done: true,
            confidence: None,
            avg_confidence,
            needs_cloud_handoff,
            token_index: tokens_generated.saturating_sub(1),
            stats: Some(stats),
            error: None,
        }
    }
}

/// Result of a blocking `generate`, derivable by reducing the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResult {
    /// Full generated text.
    pub text: String,
    /// Number of generated tokens.
    pub tokens_generated: u32,
    /// Wall time in milliseconds.
    pub time_ms: u64,
    /// Generated tokens per second.
    pub tokens_per_second: f64,
    /// Whether generation stopped before the token budget.
    pub stopped: bool,
    /// Why the stream stopped.
    pub stop_reason: StopReason,
}

impl GenerateResult {
    /// Reduce a chunk sequence into a result. An error-terminal chunk
    /// becomes `Err`; a stream with no terminal chunk is a protocol bug and
    /// reduces to `GenerationFailed`.
    pub fn reduce<I: IntoIterator<Item = StreamChunk>>(chunks: I) -> Result<Self, EngineError> {
        let mut last: Option<StreamChunk> = None;
        for chunk in chunks {
            let done = chunk.done;
            last = Some(chunk);
            if done {
                break;
            }
        }

        let Some(chunk) = last else {
            return Err(EngineError::new(
                ErrorKind::GenerationFailed,
                "stream produced no chunks",
            ));
        };
        if let Some(error) = chunk.error {
            return Err(error);
        }
        let Some(stats) = chunk.stats else {
            return Err(EngineError::new(
                ErrorKind::GenerationFailed,
                "stream ended without final stats",
            ));
        };

        Ok(Self {
            text: chunk.text,
            tokens_generated: chunk.tokens_generated,
            time_ms: stats.time_ms,
            tokens_per_second: stats.tokens_per_second,
            stopped: stats.stop_reason != StopReason::MaxTokens,
            stop_reason: stats.stop_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stop_sequence_is_rejected() {
        let mut request = GenerationRequest::for_prompt("hi");
        request.stop_sequences = vec!["ok".to_string(), String::new()];
        let err = request.validate().expect_err("empty stop sequence");
        assert_eq!(err.kind, ErrorKind::InvalidConfig);
    }

    #[test]
    fn range_validation() {
        let mut request = GenerationRequest::for_prompt("hi");
        request.temperature = 2.5;
        assert!(request.validate().is_err());

        let mut request = GenerationRequest::for_prompt("hi");
        request.top_p = 0.0;
        assert!(request.validate().is_err());

        let mut request = GenerationRequest::for_prompt("hi");
        request.repetition_penalty = 0.5;
        assert!(request.validate().is_err());

        assert!(GenerationRequest::for_prompt("hi").validate().is_ok());
    }

    fn chunk(token: &str, text: &str, index: u32, done: bool) -> StreamChunk {
        StreamChunk {
            token: token.to_string(),
            text: text.to_string(),
            tokens_generated: index + 1,
            done,
            confidence: None,
            avg_confidence: None,
            needs_cloud_handoff: false,
            token_index: index,
            stats: done.then_some(FinalStats {
                time_ms: 120,
                tokens_per_second: 25.0,
                stop_reason: StopReason::StopSequence,
            }),
            error: None,
        }
    }

    #[test]
    fn reduce_takes_the_terminal_chunk() {
        let chunks = vec![
            chunk("he", "he", 0, false),
            chunk("llo", "hello", 1, false),
            chunk("", "hello", 2, true),
        ];
        let result = GenerateResult::reduce(chunks).expect("reduce");
        assert_eq!(result.text, "hello");
        assert_eq!(result.stop_reason, StopReason::StopSequence);
        assert!(result.stopped);
    }

    #[test]
    fn reduce_propagates_error_terminal() {
        let mut terminal = chunk("", "partial", 0, true);
        terminal.stats = Some(FinalStats {
            time_ms: 10,
            tokens_per_second: 0.0,
            stop_reason: StopReason::Error,
        });
        terminal.error = Some(EngineError::new(ErrorKind::OutOfMemory, "oom"));

        let err = GenerateResult::reduce(vec![terminal]).expect_err("error terminal");
        assert_eq!(err.kind, ErrorKind::OutOfMemory);
    }

    #[test]
    fn reduce_of_empty_stream_fails() {
        assert!(GenerateResult::reduce(Vec::new()).is_err());
    }
}
