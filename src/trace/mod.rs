//! Inference tracing for debugging translation pipelines
//!
//! Models one translation as a state machine:
//! 1. TOKENIZE: Text -> Token IDs
//! 2. EMBED: Token IDs -> Vectors
//! 3. ENCODE: Vectors -> Encoder outputs (×N layers)
//! 4. CROSS_PRIME: Encoder outputs -> Cross-attention caches
//! 5. DECODE: Previous token -> Decoder hidden state (×M layers)
//! 6. LM_HEAD: Hidden state -> Logits
//! 7. SAMPLE: Logits -> Token ID
//! 8. CLEAR: Session caches emptied
//! 9. DETOKENIZE: Token IDs -> Text
//!
//! Each traced step emits a `TaskStateEntered` / `TaskStateExited` pair with
//! shapes and tensor statistics. `NaN`/`Inf` values are flagged as warnings;
//! the forward pass is never stopped by the tracer.
//!
//! Example:
//! ```bash
//! traducir run ./model "Hello" --trace
//! traducir run ./model "Hi" --trace --trace-steps=sample,decode
//! traducir run ./model "Hi" --trace --trace-output trace.json
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

use serde::Serialize;

/// Trace configuration
#[derive(Debug, Clone, Default)]
pub struct TraceConfig {
    /// Whether tracing is enabled
    pub enabled: bool,
    /// Which steps to trace (empty = all)
    pub steps: HashSet<TraceStep>,
    /// Verbose output (every decode step instead of the first few)
    pub verbose: bool,
    /// Output file path for JSON trace (None = text on stderr)
    pub output: Option<PathBuf>,
}

impl TraceConfig {
    /// Create a new trace config with tracing enabled
    #[must_use]
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    /// Check if a specific step should be traced
    #[must_use]
    pub fn should_trace(&self, step: TraceStep) -> bool {
        self.enabled && (self.steps.is_empty() || self.steps.contains(&step))
    }

    /// Parse trace steps from comma-separated string
    #[must_use]
    pub fn parse_steps(s: &str) -> HashSet<TraceStep> {
        s.split(',')
            .filter_map(|part| TraceStep::parse(part.trim()))
            .collect()
    }
}

/// Translation pipeline steps
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceStep {
    /// Text -> token IDs
    Tokenize,
    /// Token + positional embedding with input normalization
    Embed,
    /// Encoder stack and final normalization
    Encode,
    /// Cross-attention cache priming
    CrossPrime,
    /// One decoder stack pass
    Decode,
    /// Hidden state -> vocabulary logits
    LmHead,
    /// Token selection
    Sample,
    /// Session cache cleanup
    Clear,
    /// Token IDs -> text
    Detokenize,
}

impl TraceStep {
    /// Parse step from string
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "tokenize" => Some(Self::Tokenize),
            "embed" | "embedding" => Some(Self::Embed),
            "encode" | "encoder" => Some(Self::Encode),
            "cross" | "cross_prime" | "crossprime" => Some(Self::CrossPrime),
            "decode" | "decoder" => Some(Self::Decode),
            "lmhead" | "lm_head" | "logits" => Some(Self::LmHead),
            "sample" | "sampling" => Some(Self::Sample),
            "clear" | "cleanup" => Some(Self::Clear),
            "detokenize" | "text" => Some(Self::Detokenize),
            _ => None,
        }
    }

    /// Display name (state name)
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tokenize => "TOKENIZE",
            Self::Embed => "EMBED",
            Self::Encode => "ENCODE",
            Self::CrossPrime => "CROSS_PRIME",
            Self::Decode => "DECODE",
            Self::LmHead => "LM_HEAD",
            Self::Sample => "SAMPLE",
            Self::Clear => "CLEAR",
            Self::Detokenize => "DETOKENIZE",
        }
    }

    /// Position in the 9-step pipeline
    #[must_use]
    pub fn step_number(&self) -> usize {
        match self {
            Self::Tokenize => 1,
            Self::Embed => 2,
            Self::Encode => 3,
            Self::CrossPrime => 4,
            Self::Decode => 5,
            Self::LmHead => 6,
            Self::Sample => 7,
            Self::Clear => 8,
            Self::Detokenize => 9,
        }
    }
}

/// Tensor statistics for tracing
#[derive(Debug, Clone, Default, Serialize)]
pub struct TensorStats {
    /// Minimum finite value
    pub min: f32,
    /// Maximum finite value
    pub max: f32,
    /// Mean of finite values over the full length
    pub mean: f32,
    /// Standard deviation
    pub std: f32,
    /// Whether NaN values were detected
    pub has_nan: bool,
    /// Whether Inf values were detected
    pub has_inf: bool,
}

impl TensorStats {
    /// Compute stats from tensor data
    #[must_use]
    pub fn from_slice(data: &[f32]) -> Self {
        if data.is_empty() {
            return Self::default();
        }

        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        let mut sum = 0.0f64;
        let mut has_nan = false;
        let mut has_inf = false;

        for &v in data {
            if v.is_nan() {
                has_nan = true;
            } else if v.is_infinite() {
                has_inf = true;
            } else {
                min = min.min(v);
                max = max.max(v);
                sum += f64::from(v);
            }
        }

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let mean = (sum / data.len() as f64) as f32;

        let var_sum: f64 = data
            .iter()
            .filter(|v| v.is_finite())
            .map(|&v| {
                let diff = f64::from(v) - f64::from(mean);
                diff * diff
            })
            .sum();
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let std = (var_sum / data.len() as f64).sqrt() as f32;

        Self {
            min,
            max,
            mean,
            std,
            has_nan,
            has_inf,
        }
    }

    /// Compute stats over a sequence of hidden states
    #[must_use]
    pub fn from_rows(rows: &[Vec<f32>]) -> Self {
        Self::from_slice(&rows.concat())
    }

    /// Whether any value is NaN or Inf
    #[must_use]
    pub fn has_non_finite(&self) -> bool {
        self.has_nan || self.has_inf
    }
}

/// Problems flagged on a trace event
#[derive(Debug, Clone, PartialEq)]
pub enum TraceIssue {
    /// Token ID exceeds vocabulary size
    VocabOverflow {
        /// The offending token ID
        token_id: u32,
        /// Size of the vocabulary
        vocab_size: usize,
    },
    /// NaN values detected in tensor
    NaNDetected {
        /// Layer index (None for stack-level tensors)
        layer: Option<usize>,
    },
    /// Inf values detected in tensor
    InfDetected {
        /// Layer index (None for stack-level tensors)
        layer: Option<usize>,
    },
    /// Replacement or private-use characters dominate decoded text
    GarbageOutput {
        /// Sample of garbage output
        sample: String,
    },
    /// Execution failed
    ExecutionFailed {
        /// Cause of failure
        cause: String,
    },
}

impl TraceIssue {
    /// Whether the issue counts as an error rather than a warning
    #[must_use]
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::NaNDetected { .. } | Self::InfDetected { .. })
    }

    /// Actionable hint for the text report
    #[must_use]
    pub fn hint(&self) -> &'static str {
        match self {
            Self::VocabOverflow { .. } => "Check vocab.json against token.count in the settings",
            Self::NaNDetected { .. } => {
                "Attention softmax is not max-stabilized; check for very large scores"
            },
            Self::InfDetected { .. } => "Check for very large activations or weights",
            Self::GarbageOutput { .. } => {
                "Multi-token characters render only after the full decode"
            },
            Self::ExecutionFailed { .. } => "Check the model directory and settings",
        }
    }

    fn non_finite(stats: &TensorStats, layer: Option<usize>) -> Option<Self> {
        if stats.has_nan {
            Some(Self::NaNDetected { layer })
        } else if stats.has_inf {
            Some(Self::InfDetected { layer })
        } else {
            None
        }
    }
}

impl std::fmt::Display for TraceIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VocabOverflow {
                token_id,
                vocab_size,
            } => write!(f, "Token ID {token_id} exceeds vocab size {vocab_size}"),
            Self::NaNDetected { layer: Some(l) } => write!(f, "NaN values detected in layer {l}"),
            Self::NaNDetected { layer: None } => write!(f, "NaN values detected"),
            Self::InfDetected { layer: Some(l) } => write!(f, "Inf values detected in layer {l}"),
            Self::InfDetected { layer: None } => write!(f, "Inf values detected"),
            Self::GarbageOutput { sample } => write!(f, "Garbage output detected: {sample:?}"),
            Self::ExecutionFailed { cause } => write!(f, "Execution failed: {cause}"),
        }
    }
}

impl Serialize for TraceIssue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Event type of a trace entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    /// State machine entered a state
    TaskStateEntered,
    /// State machine exited a state
    TaskStateExited,
    /// Execution failed with error
    ExecutionFailed,
}

impl EventType {
    /// Event type name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskStateEntered => "TaskStateEntered",
            Self::TaskStateExited => "TaskStateExited",
            Self::ExecutionFailed => "ExecutionFailed",
        }
    }
}

/// Trace event emitted during inference
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    /// Unique event ID, monotonically increasing from 1
    pub id: u64,
    /// RFC 3339 timestamp
    pub timestamp: String,
    /// Event type
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Link to the entry event (for `TaskStateExited`)
    pub previous_event_id: Option<u64>,
    /// Pipeline step (state name)
    pub step: TraceStep,
    /// Decode position (0 for encoder-side steps)
    pub iteration: usize,
    /// Layer count or index, where meaningful
    pub layer: Option<usize>,
    /// Input shape
    pub input_shape: Vec<usize>,
    /// Output shape
    pub output_shape: Vec<usize>,
    /// Tensor statistics
    pub stats: TensorStats,
    /// Duration in microseconds
    pub duration_us: u64,
    /// Flagged issue, if any
    pub issue: Option<TraceIssue>,
    /// Cause of failure (for `ExecutionFailed` events)
    pub cause: Option<String>,
    /// Additional details (step-specific)
    pub details: TraceDetails,
}

/// Step-specific trace details
#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceDetails {
    /// Input text (tokenize step)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_text: Option<String>,
    /// Token IDs (tokenize/detokenize steps)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<Vec<u32>>,
    /// Top-k logits with token IDs (lm_head/sample steps)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k_logits: Option<Vec<(u32, f32)>>,
    /// Sampled token ID (sample step)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampled_token: Option<u32>,
    /// Sampler policy name (sample step)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampler: Option<String>,
    /// Decoded text output (detokenize step)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoded_text: Option<String>,
}

/// Model information for trace header
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelInfo {
    /// Model name/path
    pub name: String,
    /// Number of encoder layers
    pub encoder_layers: usize,
    /// Number of decoder layers
    pub decoder_layers: usize,
    /// Hidden dimension
    pub hidden_dim: usize,
    /// Vocabulary size
    pub vocab_size: usize,
}

/// Full trace document written as JSON
#[derive(Serialize)]
struct TraceDocument<'a> {
    version: &'static str,
    timestamp: String,
    model: &'a ModelInfo,
    events: &'a [TraceEvent],
    error_count: usize,
    warning_count: usize,
}

/// Shape, statistics and details of an exit event
struct Exit {
    step: TraceStep,
    iteration: usize,
    layer: Option<usize>,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    stats: TensorStats,
    issue: Option<TraceIssue>,
    details: TraceDetails,
}

impl Exit {
    fn new(step: TraceStep, input_shape: Vec<usize>, output_shape: Vec<usize>) -> Self {
        Self {
            step,
            iteration: 0,
            layer: None,
            input_shape,
            output_shape,
            stats: TensorStats::default(),
            issue: None,
            details: TraceDetails::default(),
        }
    }
}

/// Inference tracer
///
/// A disabled tracer ignores every call.
#[derive(Debug)]
pub struct InferenceTracer {
    config: TraceConfig,
    events: Vec<TraceEvent>,
    model_info: ModelInfo,
    step_start: Option<Instant>,
    error_count: usize,
    warning_count: usize,
    next_event_id: u64,
    last_entered_id: Option<u64>,
}

impl Default for InferenceTracer {
    fn default() -> Self {
        Self::disabled()
    }
}

impl InferenceTracer {
    /// Create a new tracer with config
    #[must_use]
    pub fn new(config: TraceConfig) -> Self {
        Self {
            config,
            events: Vec::new(),
            model_info: ModelInfo::default(),
            step_start: None,
            error_count: 0,
            warning_count: 0,
            next_event_id: 1,
            last_entered_id: None,
        }
    }

    /// Create a disabled tracer (no-op)
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(TraceConfig::default())
    }

    /// Set model info
    pub fn set_model_info(&mut self, info: ModelInfo) {
        self.model_info = info;
    }

    /// Check if tracing is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Check if verbose tracing is enabled
    #[must_use]
    pub fn is_verbose(&self) -> bool {
        self.config.enabled && self.config.verbose
    }

    /// Check if a step is traced
    #[must_use]
    pub fn should_trace(&self, step: TraceStep) -> bool {
        self.config.should_trace(step)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    fn timestamp() -> String {
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }

    /// Start timing a step and emit its `TaskStateEntered` event
    pub fn start_step(&mut self, step: TraceStep) {
        if !self.config.should_trace(step) {
            return;
        }

        self.step_start = Some(Instant::now());
        let entry_id = self.next_id();
        self.events.push(TraceEvent {
            id: entry_id,
            timestamp: Self::timestamp(),
            event_type: EventType::TaskStateEntered,
            previous_event_id: None,
            step,
            iteration: 0,
            layer: None,
            input_shape: vec![],
            output_shape: vec![],
            stats: TensorStats::default(),
            duration_us: 0,
            issue: None,
            cause: None,
            details: TraceDetails::default(),
        });
        self.last_entered_id = Some(entry_id);
    }

    fn exit(&mut self, exit: Exit) {
        #[allow(clippy::cast_possible_truncation)]
        let duration_us = self
            .step_start
            .take()
            .map_or(0, |s| s.elapsed().as_micros() as u64);

        if let Some(issue) = &exit.issue {
            if issue.is_error() {
                self.error_count += 1;
            } else {
                self.warning_count += 1;
            }
        }

        let id = self.next_id();
        self.events.push(TraceEvent {
            id,
            timestamp: Self::timestamp(),
            event_type: EventType::TaskStateExited,
            previous_event_id: self.last_entered_id.take(),
            step: exit.step,
            iteration: exit.iteration,
            layer: exit.layer,
            input_shape: exit.input_shape,
            output_shape: exit.output_shape,
            stats: exit.stats,
            duration_us,
            issue: exit.issue,
            cause: None,
            details: exit.details,
        });
    }

    /// Trace tokenization
    pub fn trace_tokenize(&mut self, input_text: &str, tokens: &[u32], vocab_size: usize) {
        if !self.config.should_trace(TraceStep::Tokenize) {
            return;
        }

        let mut exit = Exit::new(TraceStep::Tokenize, vec![input_text.len()], vec![tokens.len()]);
        exit.issue = tokens
            .iter()
            .find(|&&t| t as usize >= vocab_size)
            .map(|&token_id| TraceIssue::VocabOverflow {
                token_id,
                vocab_size,
            });
        exit.details.input_text = Some(input_text.to_string());
        exit.details.tokens = Some(tokens.to_vec());
        self.exit(exit);
    }

    /// Trace the encoder input embeddings
    pub fn trace_embed(&mut self, embeddings: &[Vec<f32>], hidden_dim: usize) {
        if !self.config.should_trace(TraceStep::Embed) {
            return;
        }

        let mut exit = Exit::new(
            TraceStep::Embed,
            vec![embeddings.len()],
            vec![embeddings.len(), hidden_dim],
        );
        exit.stats = TensorStats::from_rows(embeddings);
        exit.issue = TraceIssue::non_finite(&exit.stats, None);
        self.exit(exit);
    }

    /// Trace the encoder stack output
    pub fn trace_encode(&mut self, layer_count: usize, outputs: &[Vec<f32>], hidden_dim: usize) {
        if !self.config.should_trace(TraceStep::Encode) {
            return;
        }

        let shape = vec![outputs.len(), hidden_dim];
        let mut exit = Exit::new(TraceStep::Encode, shape.clone(), shape);
        exit.layer = Some(layer_count);
        exit.stats = TensorStats::from_rows(outputs);
        exit.issue = TraceIssue::non_finite(&exit.stats, None);
        self.exit(exit);
    }

    /// Trace cross-attention priming
    pub fn trace_cross_prime(&mut self, layer_count: usize, entries: usize, hidden_dim: usize) {
        if !self.config.should_trace(TraceStep::CrossPrime) {
            return;
        }

        let mut exit = Exit::new(
            TraceStep::CrossPrime,
            vec![entries, hidden_dim],
            vec![layer_count, entries],
        );
        exit.layer = Some(layer_count);
        self.exit(exit);
    }

    /// Trace one decoder stack pass
    pub fn trace_decode(&mut self, position: usize, previous_token: u32, hidden: &[f32]) {
        if !self.config.should_trace(TraceStep::Decode) {
            return;
        }

        let mut exit = Exit::new(TraceStep::Decode, vec![1], vec![hidden.len()]);
        exit.iteration = position;
        exit.stats = TensorStats::from_slice(hidden);
        exit.issue = TraceIssue::non_finite(&exit.stats, None);
        exit.details.tokens = Some(vec![previous_token]);
        self.exit(exit);
    }

    /// Trace the logits projection
    pub fn trace_lm_head(&mut self, position: usize, logits: &[f32]) {
        if !self.config.should_trace(TraceStep::LmHead) {
            return;
        }

        let mut exit = Exit::new(
            TraceStep::LmHead,
            vec![self.model_info.hidden_dim],
            vec![logits.len()],
        );
        exit.iteration = position;
        exit.stats = TensorStats::from_slice(logits);
        exit.issue = TraceIssue::non_finite(&exit.stats, None);
        exit.details.top_k_logits = Some(top_k_indices(logits, 5));
        self.exit(exit);
    }

    /// Trace token selection
    pub fn trace_sample(&mut self, position: usize, logits: &[f32], token: u32, sampler: &str) {
        if !self.config.should_trace(TraceStep::Sample) {
            return;
        }

        let mut exit = Exit::new(TraceStep::Sample, vec![logits.len()], vec![1]);
        exit.iteration = position;
        exit.details.top_k_logits = Some(top_k_indices(logits, 5));
        exit.details.sampled_token = Some(token);
        exit.details.sampler = Some(sampler.to_string());
        self.exit(exit);
    }

    /// Trace session cleanup
    pub fn trace_clear(&mut self, encoder_layers: usize, decoder_layers: usize) {
        if !self.config.should_trace(TraceStep::Clear) {
            return;
        }

        let exit = Exit::new(TraceStep::Clear, vec![encoder_layers, decoder_layers], vec![0]);
        self.exit(exit);
    }

    /// Trace detokenization
    pub fn trace_detokenize(&mut self, tokens: &[u32], text: &str) {
        if !self.config.should_trace(TraceStep::Detokenize) {
            return;
        }

        let mut exit = Exit::new(TraceStep::Detokenize, vec![tokens.len()], vec![text.len()]);
        if is_garbage_output(text) {
            exit.issue = Some(TraceIssue::GarbageOutput {
                sample: text.chars().take(20).collect(),
            });
        }
        exit.details.tokens = Some(tokens.to_vec());
        exit.details.decoded_text = Some(text.to_string());
        self.exit(exit);
    }

    /// Get all collected events
    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Drop collected events and counts, keeping config and model info
    ///
    /// Event ids keep increasing across clears.
    pub fn clear_events(&mut self) {
        self.events.clear();
        self.error_count = 0;
        self.warning_count = 0;
        self.step_start = None;
        self.last_entered_id = None;
    }

    /// Get error count
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.error_count
    }

    /// Get warning count
    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.warning_count
    }

    /// Record an execution failure
    ///
    /// # Arguments
    /// * `error` - High-level error category (e.g., "Translation Failure")
    /// * `cause` - Specific cause of failure
    pub fn record_execution_failed(&mut self, error: &str, cause: &str) {
        if !self.config.enabled {
            return;
        }

        let id = self.next_id();
        self.events.push(TraceEvent {
            id,
            timestamp: Self::timestamp(),
            event_type: EventType::ExecutionFailed,
            previous_event_id: self.last_entered_id.take(),
            step: TraceStep::Clear,
            iteration: 0,
            layer: None,
            input_shape: vec![],
            output_shape: vec![],
            stats: TensorStats::default(),
            duration_us: 0,
            issue: Some(TraceIssue::ExecutionFailed {
                cause: error.to_string(),
            }),
            cause: Some(cause.to_string()),
            details: TraceDetails::default(),
        });
        self.step_start = None;
        self.error_count += 1;
    }

    /// Format trace output as text
    #[must_use]
    pub fn format_text(&self) -> String {
        let mut output = String::from("=== Traducir Inference Trace ===\n");
        if !self.model_info.name.is_empty() {
            output.push_str(&format!(
                "Model: {} ({}+{} layers, hidden={}, vocab={})\n",
                self.model_info.name,
                self.model_info.encoder_layers,
                self.model_info.decoder_layers,
                self.model_info.hidden_dim,
                self.model_info.vocab_size
            ));
        }
        output.push('\n');

        let mut decode_steps = 0;
        for event in self
            .events
            .iter()
            .filter(|e| e.event_type != EventType::TaskStateEntered)
        {
            if event.step == TraceStep::Decode {
                decode_steps += 1;
            }
            let elided = !self.config.verbose
                && decode_steps > 3
                && matches!(
                    event.step,
                    TraceStep::Decode | TraceStep::LmHead | TraceStep::Sample
                );
            if elided && event.issue.is_none() {
                continue;
            }

            output.push_str(&format!(
                "[{}/9] {}",
                event.step.step_number(),
                event.step.name()
            ));
            if matches!(
                event.step,
                TraceStep::Decode | TraceStep::LmHead | TraceStep::Sample
            ) {
                output.push_str(&format!(" (position {})", event.iteration));
            }
            output.push('\n');

            match event.step {
                TraceStep::Tokenize => {
                    if let Some(text) = &event.details.input_text {
                        let shown: String = text.chars().take(50).collect();
                        output.push_str(&format!("  Input:  {shown:?}\n"));
                    }
                    if let Some(tokens) = &event.details.tokens {
                        output.push_str(&format!(
                            "  Output: {:?}  ({} tokens)\n",
                            tokens.iter().take(10).collect::<Vec<_>>(),
                            tokens.len()
                        ));
                    }
                },
                TraceStep::Embed | TraceStep::Encode | TraceStep::Decode => {
                    output.push_str(&format!("  Output: {:?} float32\n", event.output_shape));
                    output.push_str(&format!(
                        "  Range:  min={:.2}, max={:.2}, mean={:.3}\n",
                        event.stats.min, event.stats.max, event.stats.mean
                    ));
                },
                TraceStep::CrossPrime => {
                    output.push_str(&format!(
                        "  Cached: {} entries in {} layers\n",
                        event.input_shape.first().unwrap_or(&0),
                        event.layer.unwrap_or(0)
                    ));
                },
                TraceStep::LmHead | TraceStep::Sample => {
                    if let Some(top_k) = &event.details.top_k_logits {
                        let shown: Vec<String> =
                            top_k.iter().map(|(t, l)| format!("{t}={l:.2}")).collect();
                        output.push_str(&format!("  Top 5:  {}\n", shown.join(", ")));
                    }
                    if let Some(token) = event.details.sampled_token {
                        output.push_str(&format!(
                            "  Sampled: token_id={token} ({})\n",
                            event.details.sampler.as_deref().unwrap_or("?")
                        ));
                    }
                },
                TraceStep::Clear => {
                    if let Some(cause) = &event.cause {
                        output.push_str(&format!("  Cause: {cause}\n"));
                    }
                },
                TraceStep::Detokenize => {
                    if let Some(text) = &event.details.decoded_text {
                        output.push_str(&format!("  Decoded: {text:?}\n"));
                    }
                },
            }

            match &event.issue {
                Some(issue) if issue.is_error() => {
                    output.push_str(&format!("  ERROR: {issue}\n  Hint: {}\n", issue.hint()));
                },
                Some(issue) => {
                    output.push_str(&format!("  WARNING: {issue}\n  Hint: {}\n", issue.hint()));
                },
                None => output.push_str("  OK\n"),
            }
            output.push('\n');
        }

        if self.error_count > 0 || self.warning_count > 0 {
            output.push_str(&format!(
                "=== TRACE SUMMARY: {} errors, {} warnings ===\n",
                self.error_count, self.warning_count
            ));
        } else {
            output.push_str("=== TRACE COMPLETE: No errors ===\n");
        }

        output
    }

    /// Format trace as JSON
    ///
    /// Non-finite statistics serialize as `null`.
    #[must_use]
    pub fn to_json(&self) -> String {
        let document = TraceDocument {
            version: "1.0",
            timestamp: chrono::Utc::now().to_rfc3339(),
            model: &self.model_info,
            events: &self.events,
            error_count: self.error_count,
            warning_count: self.warning_count,
        };
        serde_json::to_string_pretty(&document)
            .unwrap_or_else(|e| format!("{{\"error\": {:?}}}", e.to_string()))
    }

    /// Write trace to configured output
    ///
    /// # Errors
    ///
    /// Returns error if the output file can't be written
    pub fn write_output(&self) -> std::io::Result<()> {
        if let Some(path) = &self.config.output {
            std::fs::write(path, self.to_json())
        } else {
            eprint!("{}", self.format_text());
            Ok(())
        }
    }
}

/// Get top-k indices with values from logits
fn top_k_indices(logits: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = logits
        .iter()
        .enumerate()
        .filter_map(|(i, &v)| u32::try_from(i).ok().map(|i| (i, v)))
        .collect();
    indexed.sort_by(|(_, a), (_, b)| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    indexed.truncate(k);
    indexed
}

/// Check if decoded output is dominated by replacement or private-use characters
fn is_garbage_output(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }

    let suspicious = text
        .chars()
        .filter(|&c| c == '\u{FFFD}' || ('\u{E000}'..='\u{F8FF}').contains(&c))
        .count();

    suspicious * 3 > text.chars().count()
}
