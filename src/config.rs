//! Model settings
//!
//! Hyperparameters and feature flags for an encoder-decoder translation
//! model. Settings are read once, validated, and shared read-only by every
//! component afterwards.
//!
//! The primary source is a `model.properties` file in the model directory:
//!
//! ```text
//! # comment
//! token.count=58101
//! hidden.size=512
//! has.attention.key.bias=false
//! ```
//!
//! Keys are case-insensitive. A `model.json` with the serialized
//! [`ModelSettings`] is accepted as an alternative.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TraducirError};

/// File name of the properties settings file inside a model directory
pub const PROPERTIES_FILE: &str = "model.properties";

/// File name of the JSON settings file inside a model directory
pub const JSON_FILE: &str = "model.json";

/// Which transformer stack a setting applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stack {
    /// Bidirectional encoder stack
    Encoder,
    /// Causal decoder stack
    Decoder,
}

impl Stack {
    /// Lowercase name used in storage paths and messages
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Encoder => "encoder",
            Self::Decoder => "decoder",
        }
    }
}

/// Presence of the optional bias vectors
///
/// Every flag defaults to `true`. A `false` flag means the bias tensor is
/// never read and the corresponding projection adds nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct BiasFlags {
    /// Attention query projection bias
    pub query: bool,
    /// Attention key projection bias
    pub key: bool,
    /// Attention value projection bias
    pub value: bool,
    /// Attention output projection bias
    pub projection: bool,
    /// Feed-forward layer 1 bias
    pub mlp_layer1: bool,
    /// Feed-forward layer 2 bias
    pub mlp_layer2: bool,
}

impl Default for BiasFlags {
    fn default() -> Self {
        Self::all(true)
    }
}

impl BiasFlags {
    /// Set every flag to the same value
    #[must_use]
    pub fn all(present: bool) -> Self {
        Self {
            query: present,
            key: present,
            value: present,
            projection: present,
            mlp_layer1: present,
            mlp_layer2: present,
        }
    }
}

/// Hyperparameters of an encoder-decoder translation model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Vocabulary size (rows of the token embedding table)
    pub vocab_size: usize,
    /// Token prepended to every input sequence
    pub start_of_text_token: u32,
    /// Token appended to every input sequence; also the decode seed and stop token
    pub end_of_text_token: u32,
    /// Offset added to a position before positional-table lookup
    pub special_token_offset: usize,
    /// Maximum number of positions per stack
    pub context_size: usize,
    /// Width of every hidden state
    pub hidden_size: usize,
    /// Number of encoder layers
    pub encoder_count: usize,
    /// Attention heads per encoder layer
    pub encoder_head_count: usize,
    /// Integer divisor applied to encoder attention scores
    pub encoder_score_dividend: u32,
    /// Number of decoder layers
    pub decoder_count: usize,
    /// Attention heads per decoder layer
    pub decoder_head_count: usize,
    /// Integer divisor applied to decoder attention scores
    pub decoder_score_dividend: u32,
    /// Normalization epsilon
    pub epsilon: f32,
    /// Optional prompt shown by the interactive CLI
    #[serde(default)]
    pub prompt: Option<String>,
    /// Bias presence flags
    #[serde(default)]
    pub bias: BiasFlags,
}

impl ModelSettings {
    /// Load settings from a model directory
    ///
    /// Reads `model.properties` when present, otherwise `model.json`.
    ///
    /// # Errors
    ///
    /// Returns `IoError` when neither file can be read, and any parse or
    /// validation error otherwise.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let properties = dir.join(PROPERTIES_FILE);
        if properties.is_file() {
            return Self::from_properties_file(&properties);
        }

        let json = dir.join(JSON_FILE);
        if json.is_file() {
            return Self::from_json_file(&json);
        }

        Err(TraducirError::IoError {
            message: format!(
                "Cannot read settings: neither {} nor {} exists in {}",
                PROPERTIES_FILE,
                JSON_FILE,
                dir.display()
            ),
        })
    }

    /// Load settings from a `key=value` properties file
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file is unreadable, otherwise see
    /// [`ModelSettings::from_properties_str`].
    pub fn from_properties_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| TraducirError::IoError {
            message: format!("Cannot read settings file {}: {e}", path.display()),
        })?;
        Self::from_properties_str(&contents).map_err(|e| match e {
            TraducirError::InvalidConfiguration(msg) => {
                TraducirError::InvalidConfiguration(format!("{}: {msg}", path.display()))
            },
            other => other,
        })
    }

    /// Parse settings from properties text
    ///
    /// # Errors
    ///
    /// - `InvalidConfiguration` for a line that is not `key=value`, or a
    ///   value that does not parse as the required type
    /// - `MissingSetting` for an absent required key
    /// - any error from [`ModelSettings::validate`]
    pub fn from_properties_str(text: &str) -> Result<Self> {
        let props = Properties::parse(text)?;

        let settings = Self {
            vocab_size: props.usize("token.count")?,
            start_of_text_token: props.u32("start.of.text.token")?,
            end_of_text_token: props.u32("end.of.text.token")?,
            special_token_offset: props.usize("special.token.offset")?,
            context_size: props.usize("context.size")?,
            hidden_size: props.usize("hidden.size")?,
            encoder_count: props.usize("encoder.count")?,
            encoder_head_count: props.usize("encoder.attention.head.count")?,
            encoder_score_dividend: props.u32("encoder.attention.score.dividend")?,
            decoder_count: props.usize("decoder.count")?,
            decoder_head_count: props.usize("decoder.attention.head.count")?,
            decoder_score_dividend: props.u32("decoder.attention.score.dividend")?,
            epsilon: props.f32("epsilon")?,
            prompt: props.optional("prompt").map(str::to_string),
            bias: BiasFlags {
                query: props.bool_or("has.attention.query.bias", true)?,
                key: props.bool_or("has.attention.key.bias", true)?,
                value: props.bool_or("has.attention.value.bias", true)?,
                projection: props.bool_or("has.attention.projection.bias", true)?,
                mlp_layer1: props.bool_or("has.mlp.layer.1.bias", true)?,
                mlp_layer2: props.bool_or("has.mlp.layer.2.bias", true)?,
            },
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Render settings in the `key=value` properties format
    ///
    /// The output parses back with [`ModelSettings::from_properties_str`].
    #[must_use]
    pub fn to_properties(&self) -> String {
        let mut lines = vec![
            format!("token.count={}", self.vocab_size),
            format!("start.of.text.token={}", self.start_of_text_token),
            format!("end.of.text.token={}", self.end_of_text_token),
            format!("special.token.offset={}", self.special_token_offset),
            format!("context.size={}", self.context_size),
            format!("hidden.size={}", self.hidden_size),
            format!("encoder.count={}", self.encoder_count),
            format!("encoder.attention.head.count={}", self.encoder_head_count),
            format!(
                "encoder.attention.score.dividend={}",
                self.encoder_score_dividend
            ),
            format!("decoder.count={}", self.decoder_count),
            format!("decoder.attention.head.count={}", self.decoder_head_count),
            format!(
                "decoder.attention.score.dividend={}",
                self.decoder_score_dividend
            ),
            format!("epsilon={:e}", self.epsilon),
            format!("has.attention.query.bias={}", self.bias.query),
            format!("has.attention.key.bias={}", self.bias.key),
            format!("has.attention.value.bias={}", self.bias.value),
            format!("has.attention.projection.bias={}", self.bias.projection),
            format!("has.mlp.layer.1.bias={}", self.bias.mlp_layer1),
            format!("has.mlp.layer.2.bias={}", self.bias.mlp_layer2),
        ];
        if let Some(prompt) = &self.prompt {
            lines.push(format!("prompt={prompt}"));
        }
        lines.push(String::new());
        lines.join("\n")
    }

    /// Load settings from a JSON file
    ///
    /// # Errors
    ///
    /// Returns `IoError`, `FormatError` for malformed JSON, or a validation
    /// error.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| TraducirError::IoError {
            message: format!("Cannot read settings file {}: {e}", path.display()),
        })?;
        let settings: Self =
            serde_json::from_str(&contents).map_err(|e| TraducirError::FormatError {
                reason: format!("{}: {e}", path.display()),
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check the structural invariants the engine relies on
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` naming the offending setting.
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("token.count", self.vocab_size),
            ("context.size", self.context_size),
            ("hidden.size", self.hidden_size),
            ("encoder.count", self.encoder_count),
            ("encoder.attention.head.count", self.encoder_head_count),
            ("decoder.count", self.decoder_count),
            ("decoder.attention.head.count", self.decoder_head_count),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(TraducirError::InvalidConfiguration(format!(
                    "'{key}' must be > 0"
                )));
            }
        }

        for stack in [Stack::Encoder, Stack::Decoder] {
            let heads = self.head_count(stack);
            if self.hidden_size % heads != 0 {
                return Err(TraducirError::InvalidConfiguration(format!(
                    "hidden.size {} is not divisible by {}.attention.head.count {}",
                    self.hidden_size,
                    stack.name(),
                    heads
                )));
            }
            if self.score_dividend(stack) == 0 {
                return Err(TraducirError::InvalidConfiguration(format!(
                    "'{}.attention.score.dividend' must be > 0",
                    stack.name()
                )));
            }
        }

        if !self.epsilon.is_finite() || self.epsilon <= 0.0 {
            return Err(TraducirError::InvalidConfiguration(format!(
                "'epsilon' must be a positive finite number (got {})",
                self.epsilon
            )));
        }

        for (key, token) in [
            ("start.of.text.token", self.start_of_text_token),
            ("end.of.text.token", self.end_of_text_token),
        ] {
            if token as usize >= self.vocab_size {
                return Err(TraducirError::InvalidConfiguration(format!(
                    "'{key}' {token} is outside the vocabulary of {} tokens",
                    self.vocab_size
                )));
            }
        }

        Ok(())
    }

    /// Attention heads of a stack
    #[must_use]
    pub fn head_count(&self, stack: Stack) -> usize {
        match stack {
            Stack::Encoder => self.encoder_head_count,
            Stack::Decoder => self.decoder_head_count,
        }
    }

    /// Width of one attention head of a stack
    #[must_use]
    pub fn head_dim(&self, stack: Stack) -> usize {
        self.hidden_size / self.head_count(stack)
    }

    /// Attention score divisor of a stack
    #[must_use]
    pub fn score_dividend(&self, stack: Stack) -> u32 {
        match stack {
            Stack::Encoder => self.encoder_score_dividend,
            Stack::Decoder => self.decoder_score_dividend,
        }
    }

    /// Number of layers in a stack
    #[must_use]
    pub fn layer_count(&self, stack: Stack) -> usize {
        match stack {
            Stack::Encoder => self.encoder_count,
            Stack::Decoder => self.decoder_count,
        }
    }

    /// Width of the feed-forward hidden layer
    #[must_use]
    pub fn feed_forward_size(&self) -> usize {
        self.hidden_size * 4
    }

    /// Rows of each positional embedding table
    #[must_use]
    pub fn position_rows(&self) -> usize {
        self.context_size + self.special_token_offset
    }

    /// Total number of trained parameters
    #[must_use]
    pub fn parameter_count(&self) -> u64 {
        let hidden = self.hidden_size as u64;
        let token_embeddings = self.vocab_size as u64 * hidden;
        let positions = self.position_rows() as u64 * hidden;
        // weights + biases of one normalization
        let norm = hidden * 2;

        token_embeddings
            + 2 * (positions + norm + norm)
            + self.encoder_count as u64 * self.encoder_layer_parameters()
            + self.decoder_count as u64 * self.decoder_layer_parameters()
    }

    fn attention_parameters(&self) -> u64 {
        let hidden = self.hidden_size as u64;
        let square = hidden * hidden;
        let bias = |present: bool| if present { hidden } else { 0 };

        4 * square
            + bias(self.bias.query)
            + bias(self.bias.key)
            + bias(self.bias.value)
            + bias(self.bias.projection)
            + hidden * 2
    }

    fn feed_forward_parameters(&self) -> u64 {
        let hidden = self.hidden_size as u64;
        let wide = self.feed_forward_size() as u64;
        let layer1 = hidden * wide + if self.bias.mlp_layer1 { wide } else { 0 };
        let layer2 = wide * hidden + if self.bias.mlp_layer2 { hidden } else { 0 };
        layer1 + layer2 + hidden * 2
    }

    fn encoder_layer_parameters(&self) -> u64 {
        self.attention_parameters() + self.feed_forward_parameters()
    }

    fn decoder_layer_parameters(&self) -> u64 {
        2 * self.attention_parameters() + self.feed_forward_parameters()
    }
}

/// Parsed `key=value` pairs with typed accessors
struct Properties {
    values: HashMap<String, String>,
}

impl Properties {
    fn parse(text: &str) -> Result<Self> {
        let mut values = HashMap::new();

        for (line_no, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let parts: Vec<&str> = trimmed.split('=').collect();
            if parts.len() != 2 {
                return Err(TraducirError::InvalidConfiguration(format!(
                    "Unrecognizable properties line {}: {line}",
                    line_no + 1
                )));
            }

            values.insert(parts[0].trim().to_lowercase(), parts[1].trim().to_string());
        }

        Ok(Self { values })
    }

    fn optional(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn required(&self, key: &str) -> Result<&str> {
        self.optional(key)
            .ok_or_else(|| TraducirError::MissingSetting {
                key: key.to_string(),
            })
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str, kind: &str) -> Result<T> {
        let value = self.required(key)?;
        value.parse().map_err(|_| {
            TraducirError::InvalidConfiguration(format!(
                "The value of '{key}' can't be converted to {kind} ({value})"
            ))
        })
    }

    fn usize(&self, key: &str) -> Result<usize> {
        self.parsed(key, "integer")
    }

    fn u32(&self, key: &str) -> Result<u32> {
        self.parsed(key, "integer")
    }

    fn f32(&self, key: &str) -> Result<f32> {
        self.parsed(key, "float")
    }

    fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.optional(key) {
            None => Ok(default),
            Some(value) if value.eq_ignore_ascii_case("true") => Ok(true),
            Some(value) if value.eq_ignore_ascii_case("false") => Ok(false),
            Some(value) => Err(TraducirError::InvalidConfiguration(format!(
                "The value of '{key}' can't be converted to boolean ({value})"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Tiny test model
token.count=16
start.of.text.token=1
end.of.text.token=2
special.token.offset=2
context.size=5
hidden.size=4
encoder.count=1
encoder.attention.head.count=2
encoder.attention.score.dividend=1
decoder.count=1
decoder.attention.head.count=2
decoder.attention.score.dividend=1
epsilon=1e-5
";

    #[test]
    fn test_parse_minimal_properties() {
        let settings = ModelSettings::from_properties_str(SAMPLE).unwrap();
        assert_eq!(settings.vocab_size, 16);
        assert_eq!(settings.end_of_text_token, 2);
        assert_eq!(settings.position_rows(), 7);
        assert_eq!(settings.head_dim(Stack::Encoder), 2);
        assert_eq!(settings.bias, BiasFlags::all(true));
        assert!(settings.prompt.is_none());
    }

    #[test]
    fn test_keys_are_case_insensitive_and_trimmed() {
        let text = SAMPLE.replace("hidden.size=4", "  Hidden.Size =  4  ");
        let settings = ModelSettings::from_properties_str(&text).unwrap();
        assert_eq!(settings.hidden_size, 4);
    }

    #[test]
    fn test_bias_flags_override() {
        let text = format!("{SAMPLE}has.attention.key.bias=false\nhas.mlp.layer.2.bias=FALSE\n");
        let settings = ModelSettings::from_properties_str(&text).unwrap();
        assert!(!settings.bias.key);
        assert!(!settings.bias.mlp_layer2);
        assert!(settings.bias.query);
    }

    #[test]
    fn test_missing_key_error() {
        let text = SAMPLE.replace("epsilon=1e-5\n", "");
        let err = ModelSettings::from_properties_str(&text).unwrap_err();
        assert_eq!(
            err,
            TraducirError::MissingSetting {
                key: "epsilon".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_line_error() {
        let text = format!("{SAMPLE}this line is broken\n");
        let err = ModelSettings::from_properties_str(&text).unwrap_err();
        assert!(matches!(err, TraducirError::InvalidConfiguration(ref m) if m.contains("line 16")));
    }

    #[test]
    fn test_unparsable_integer_error() {
        let text = SAMPLE.replace("context.size=5", "context.size=five");
        let err = ModelSettings::from_properties_str(&text).unwrap_err();
        assert!(matches!(err, TraducirError::InvalidConfiguration(ref m) if m.contains("five")));
    }

    #[test]
    fn test_unparsable_boolean_error() {
        let text = format!("{SAMPLE}has.attention.query.bias=maybe\n");
        assert!(ModelSettings::from_properties_str(&text).is_err());
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        let text = SAMPLE.replace("decoder.attention.head.count=2", "decoder.attention.head.count=3");
        let err = ModelSettings::from_properties_str(&text).unwrap_err();
        assert!(matches!(err, TraducirError::InvalidConfiguration(ref m) if m.contains("decoder")));
    }

    #[test]
    fn test_zero_dividend_rejected() {
        let text = SAMPLE.replace(
            "encoder.attention.score.dividend=1",
            "encoder.attention.score.dividend=0",
        );
        assert!(ModelSettings::from_properties_str(&text).is_err());
    }

    #[test]
    fn test_special_token_outside_vocab_rejected() {
        let text = SAMPLE.replace("end.of.text.token=2", "end.of.text.token=16");
        assert!(ModelSettings::from_properties_str(&text).is_err());
    }

    #[test]
    fn test_parameter_count_small_model() {
        let settings = ModelSettings::from_properties_str(SAMPLE).unwrap();
        // wte 64, 2 * (wpe 28 + 2 norms 16), encoder 184, decoder 288
        assert_eq!(settings.parameter_count(), 64 + 2 * 44 + 184 + 288);
    }

    #[test]
    fn test_parameter_count_without_biases() {
        let with = ModelSettings::from_properties_str(SAMPLE).unwrap();
        let mut without = with.clone();
        without.bias = BiasFlags::all(false);
        // per attention: 4 * hidden; per feed-forward: 4 * hidden + hidden
        let removed = (16 + 20) + (2 * 16 + 20);
        assert_eq!(with.parameter_count() - without.parameter_count(), removed);
    }

    #[test]
    fn test_json_round_trip_through_file() {
        let settings = ModelSettings::from_properties_str(SAMPLE).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(JSON_FILE);
        std::fs::write(&path, serde_json::to_string(&settings).unwrap()).unwrap();

        let loaded = ModelSettings::from_dir(dir.path()).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_from_dir_prefers_properties() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PROPERTIES_FILE), SAMPLE).unwrap();
        std::fs::write(dir.path().join(JSON_FILE), "not json").unwrap();
        assert!(ModelSettings::from_dir(dir.path()).is_ok());
    }

    #[test]
    fn test_to_properties_parses_back() {
        let mut settings = ModelSettings::from_properties_str(SAMPLE).unwrap();
        settings.bias.value = false;
        settings.prompt = Some("Translate:".to_string());

        let reparsed = ModelSettings::from_properties_str(&settings.to_properties()).unwrap();
        assert_eq!(reparsed, settings);
    }

    #[test]
    fn test_from_dir_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelSettings::from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, TraducirError::IoError { .. }));
    }
}
