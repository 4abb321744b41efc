//! # Traducir
//!
//! Pure Rust inference for encoder-decoder transformer translation models.
//!
//! Traducir (Spanish: "to translate") loads a model directory with
//! settings and `f32` parameters, encodes a token sequence and decodes the
//! translation one token at a time with greedy or weighted-random selection.
//!
//! ## Example
//!
//! ```rust
//! use traducir::testing::SyntheticModel;
//! use traducir::{GenerationConfig, StopReason};
//!
//! let translator = SyntheticModel::tiny()
//!     .force_output_token(2)
//!     .unwrap()
//!     .build()
//!     .unwrap();
//!
//! let translation = translator
//!     .translate_with(&[3, 4], &GenerationConfig::greedy())
//!     .unwrap();
//! assert_eq!(translation.stop_reason, StopReason::EndOfText);
//! assert!(translation.display_tokens().is_empty());
//! ```
//!
//! ## Architecture
//!
//! ```text
//! text ─► tokenizer ─► Translator::translate_streaming(Session)
//!                        ├─ encode:      embed ─► encoder layers ─► norm
//!                        ├─ prime_cross: encoder outputs ─► cross caches
//!                        └─ decode_step: embed ─► decoder layers ─► norm ─► logits ─► sampler
//! ```
//!
//! - [`config`]: model settings (`model.properties` / `model.json`)
//! - [`store`]: named parameter sources (raw files, safetensors, memory)
//! - [`layers`]: attention, feed-forward, normalization and caches
//! - [`model`]: the translator and its per-request session
//! - [`generate`]: token selection policies
//! - [`trace`]: pipeline tracing for debugging

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // usize -> f32 precision loss is acceptable
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)] // Allow technical terms without backticks
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::float_cmp)] // Allow float comparisons in tests
#![allow(clippy::cast_lossless)]

/// CLI command implementations (extracted for testability)
pub mod cli;
pub mod config;
pub mod error;
pub mod generate;
pub mod layers;
pub mod model;
/// Safetensors container parsing
///
/// Header JSON plus a flat data section; F32, F16 and BF16 tensors are
/// widened to `f32` on load.
pub mod safetensors;
pub mod store;
pub mod tensor;
/// Synthetic models for tests and benchmarks
pub mod testing;
pub mod tokenizer;
/// Inference tracing
///
/// Records entry/exit events for each pipeline step with tensor
/// statistics, and reports NaN/Inf and vocabulary problems.
pub mod trace;

pub use config::{BiasFlags, ModelSettings, Stack};
pub use error::{Result, TraducirError};
pub use generate::{GenerationConfig, SamplerKind, TokenSampler};
pub use model::{Session, StopReason, Translation, TranslationState, Translator};
pub use tensor::Matrix;
pub use tokenizer::{BPETokenizer, TextCodec};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
