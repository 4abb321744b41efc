//! Encoder-decoder translation engine
//!
//! [`Translator`] holds the immutable weights of a model; every request runs
//! against a [`Session`] that owns the attention caches. One loaded
//! translator can serve any number of sessions, each from its own thread.
//!
//! ## Pipeline
//!
//! ```text
//! tokens ─► [SOT] tokens [EOT] ─► embed ─► encoder ×N ─► final norm
//!                                                           │
//!                                        prime cross caches ◄┘
//!                                                           │
//! EOT ─► embed(pos) ─► decoder ×M ─► final norm ─► logits ─► select ─┐
//!  ▲                                                                 │
//!  └──────────────────────── previous token ◄────────────────────────┘
//! ```
//!
//! Decoding stops when the end-of-text token is selected or the step limit
//! is reached. The session's caches are cleared before
//! [`Translator::translate_with_session`] returns, on success and on error.
//!
//! ## Example
//!
//! ```rust,ignore
//! use traducir::{GenerationConfig, Translator};
//!
//! let translator = Translator::from_dir("./opus-mt-en-de")?;
//! let translation = translator.translate_with(&[3140, 2], &GenerationConfig::greedy())?;
//! println!("{:?}", translation.display_tokens());
//! ```

use std::path::Path;

use crate::config::{ModelSettings, Stack};
use crate::error::{Result, TraducirError};
use crate::generate::GenerationConfig;
use crate::layers::{AttentionCache, DecoderCache, DecoderLayer, EncoderLayer, Embeddings, LayerNorm};
use crate::store::{names, open_store, ParameterStore};
use crate::trace::{InferenceTracer, ModelInfo, TraceStep};

/// Why decoding stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The end-of-text token was selected
    EndOfText,
    /// The step limit was reached
    MaxLength,
}

/// Lifecycle of one translation request
///
/// `Idle → Encoding → CrossPriming → Decoding(pos) → Stopped → Cleared →
/// Idle`. A failed request goes from the failing state straight to
/// `Cleared`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationState {
    /// No request in flight, caches empty
    Idle,
    /// Running the encoder stack
    Encoding,
    /// Filling the cross-attention caches
    CrossPriming,
    /// Running decode step at this position
    Decoding(usize),
    /// Decoding finished
    Stopped(StopReason),
    /// Caches emptied
    Cleared,
}

/// Output of one translation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    /// Every selected token, including the leading step's token and the
    /// end-of-text token when decoding terminated on it
    pub tokens: Vec<u32>,
    /// Why decoding stopped
    pub stop_reason: StopReason,
    /// Number of decode steps run
    pub steps: usize,
}

impl Translation {
    /// Tokens meant for display
    ///
    /// Drops the token of the leading decode step and a trailing
    /// end-of-text token.
    #[must_use]
    pub fn display_tokens(&self) -> &[u32] {
        let mut end = self.tokens.len();
        if self.stop_reason == StopReason::EndOfText {
            end = end.saturating_sub(1);
        }
        let start = 1.min(end);
        &self.tokens[start..end]
    }
}

/// Per-request state: attention caches, lifecycle and tracer
#[derive(Debug)]
pub struct Session {
    encoder_caches: Vec<AttentionCache>,
    decoder_caches: Vec<DecoderCache>,
    state: TranslationState,
    history: Vec<TranslationState>,
    tracer: InferenceTracer,
}

impl Session {
    /// Attach a tracer to this session
    #[must_use]
    pub fn with_tracer(mut self, tracer: InferenceTracer) -> Self {
        self.tracer = tracer;
        self
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> TranslationState {
        self.state
    }

    /// States entered by the most recent request, oldest first
    #[must_use]
    pub fn history(&self) -> &[TranslationState] {
        &self.history
    }

    /// Encoder caches, one per encoder layer
    #[must_use]
    pub fn encoder_caches(&self) -> &[AttentionCache] {
        &self.encoder_caches
    }

    /// Decoder caches, one per decoder layer
    #[must_use]
    pub fn decoder_caches(&self) -> &[DecoderCache] {
        &self.decoder_caches
    }

    /// Whether every cache is empty
    #[must_use]
    pub fn is_clear(&self) -> bool {
        self.encoder_caches.iter().all(AttentionCache::is_empty)
            && self.decoder_caches.iter().all(DecoderCache::is_empty)
    }

    /// The session's tracer
    #[must_use]
    pub fn tracer(&self) -> &InferenceTracer {
        &self.tracer
    }

    /// Mutable access to the session's tracer
    pub fn tracer_mut(&mut self) -> &mut InferenceTracer {
        &mut self.tracer
    }

    /// Empty every cache and return to `Idle`
    ///
    /// Needed only after driving the stepwise API by hand; the
    /// `translate*` methods reset the session themselves.
    pub fn reset(&mut self) {
        self.tracer.start_step(TraceStep::Clear);
        for cache in &mut self.encoder_caches {
            cache.clear();
        }
        for cache in &mut self.decoder_caches {
            cache.clear();
        }
        self.tracer
            .trace_clear(self.encoder_caches.len(), self.decoder_caches.len());

        if self.state != TranslationState::Idle {
            self.enter(TranslationState::Cleared);
            self.enter(TranslationState::Idle);
        }
    }

    fn enter(&mut self, state: TranslationState) {
        self.state = state;
        self.history.push(state);
    }
}

/// Encoder-decoder translation model
///
/// Weights are read-only after loading.
#[derive(Debug, Clone)]
pub struct Translator {
    settings: ModelSettings,
    embeddings: Embeddings,
    encoders: Vec<EncoderLayer>,
    encoder_norm: LayerNorm,
    decoders: Vec<DecoderLayer>,
    decoder_norm: LayerNorm,
}

impl Translator {
    /// Load a model from a parameter store
    ///
    /// # Errors
    ///
    /// Returns error if the settings are invalid or any required tensor is
    /// missing or misshapen
    pub fn load<S: ParameterStore + ?Sized>(settings: ModelSettings, store: &S) -> Result<Self> {
        settings.validate()?;

        let embeddings = Embeddings::load(store, &settings)?;
        let encoders = (0..settings.encoder_count)
            .map(|i| EncoderLayer::load(store, &settings, i))
            .collect::<Result<Vec<_>>>()?;
        let decoders = (0..settings.decoder_count)
            .map(|i| DecoderLayer::load(store, &settings, i))
            .collect::<Result<Vec<_>>>()?;
        let output_norm = |stack: Stack| {
            LayerNorm::load(
                store,
                &names::output_norm(stack, "w"),
                &names::output_norm(stack, "b"),
                settings.hidden_size,
                settings.epsilon,
            )
        };
        let encoder_norm = output_norm(Stack::Encoder)?;
        let decoder_norm = output_norm(Stack::Decoder)?;

        Ok(Self {
            settings,
            embeddings,
            encoders,
            encoder_norm,
            decoders,
            decoder_norm,
        })
    }

    /// Load settings and weights from a model directory
    ///
    /// # Errors
    ///
    /// Returns error if the settings or parameters can't be read
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let settings = ModelSettings::from_dir(dir)?;
        let store = open_store(dir)?;
        Self::load(settings, store.as_ref())
    }

    /// Model settings
    #[must_use]
    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    /// Shared embedding tables
    #[must_use]
    pub fn embeddings(&self) -> &Embeddings {
        &self.embeddings
    }

    /// Header information for a tracer
    #[must_use]
    pub fn model_info(&self, name: &str) -> ModelInfo {
        ModelInfo {
            name: name.to_string(),
            encoder_layers: self.encoders.len(),
            decoder_layers: self.decoders.len(),
            hidden_dim: self.settings.hidden_size,
            vocab_size: self.settings.vocab_size,
        }
    }

    /// Create an empty session sized for this model
    ///
    /// # Errors
    ///
    /// Returns error if the context size is zero
    pub fn new_session(&self) -> Result<Session> {
        let capacity = self.settings.context_size;
        let encoder_caches = self
            .encoders
            .iter()
            .map(|layer| layer.new_cache(capacity))
            .collect::<Result<Vec<_>>>()?;
        let decoder_caches = self
            .decoders
            .iter()
            .map(|layer| layer.new_cache(capacity))
            .collect::<Result<Vec<_>>>()?;

        Ok(Session {
            encoder_caches,
            decoder_caches,
            state: TranslationState::Idle,
            history: vec![TranslationState::Idle],
            tracer: InferenceTracer::disabled(),
        })
    }

    /// Translate with greedy decoding in a fresh session
    ///
    /// # Errors
    ///
    /// Returns `InvalidToken` or `ContextLimitExceeded` for bad input, or
    /// any numeric error raised by the layers
    pub fn translate(&self, tokens: &[u32]) -> Result<Translation> {
        self.translate_with(tokens, &GenerationConfig::greedy())
    }

    /// Translate with an explicit generation config in a fresh session
    ///
    /// # Errors
    ///
    /// Same as [`Translator::translate`]
    pub fn translate_with(&self, tokens: &[u32], config: &GenerationConfig) -> Result<Translation> {
        let mut session = self.new_session()?;
        self.translate_with_session(&mut session, tokens, config)
    }

    /// Translate in a caller-owned session
    ///
    /// The session is reset before returning, whether or not translation
    /// succeeded.
    ///
    /// # Errors
    ///
    /// Same as [`Translator::translate`]
    pub fn translate_with_session(
        &self,
        session: &mut Session,
        tokens: &[u32],
        config: &GenerationConfig,
    ) -> Result<Translation> {
        self.translate_streaming(session, tokens, config, |_| {})
    }

    /// Translate, reporting each display token as soon as it is selected
    ///
    /// `on_token` sees exactly [`Translation::display_tokens`], in order.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape`, leaving the session untouched, if it was
    /// created by a model of a different shape. Otherwise same as
    /// [`Translator::translate`]
    pub fn translate_streaming<F>(
        &self,
        session: &mut Session,
        tokens: &[u32],
        config: &GenerationConfig,
        mut on_token: F,
    ) -> Result<Translation>
    where
        F: FnMut(u32),
    {
        self.check_session(session)?;
        if session.state != TranslationState::Idle || !session.is_clear() {
            session.reset();
        }
        session.history.clear();
        session.history.push(TranslationState::Idle);

        let result = self.run(session, tokens, config, &mut on_token);
        if let Err(e) = &result {
            session
                .tracer
                .record_execution_failed("Translation Failure", &e.to_string());
        }
        session.reset();
        result
    }

    fn run(
        &self,
        session: &mut Session,
        tokens: &[u32],
        config: &GenerationConfig,
        on_token: &mut dyn FnMut(u32),
    ) -> Result<Translation> {
        session.enter(TranslationState::Encoding);
        let outputs = self.encode(session, tokens)?;

        session.enter(TranslationState::CrossPriming);
        self.prime_cross(session, &outputs)?;

        let eot = self.settings.end_of_text_token;
        let limit = config.step_limit(self.settings.context_size);
        let mut sampler = config.sampler.build();
        let mut generated = Vec::with_capacity(limit);
        let mut previous = eot;
        let mut stop_reason = StopReason::MaxLength;

        for position in 0..limit {
            session.enter(TranslationState::Decoding(position));
            let logits = self.decode_step(session, position, previous)?;

            session.tracer.start_step(TraceStep::Sample);
            let token = sampler.select(&logits)?;
            session
                .tracer
                .trace_sample(position, &logits, token, sampler.name());

            generated.push(token);
            if token == eot {
                stop_reason = StopReason::EndOfText;
                break;
            }
            // the leading step's token is returned but never displayed
            if position > 0 {
                on_token(token);
            }
            previous = token;
        }

        session.enter(TranslationState::Stopped(stop_reason));
        Ok(Translation {
            steps: generated.len(),
            tokens: generated,
            stop_reason,
        })
    }

    /// Run the encoder over `tokens` wrapped in start/end-of-text
    ///
    /// Each encoder layer primes, executes and clears its session cache.
    /// Returns one normalized hidden state per wrapped position.
    ///
    /// # Errors
    ///
    /// - `ContextLimitExceeded` if the wrapped input is longer than the
    ///   context size
    /// - `InvalidToken` for a token outside the vocabulary
    /// - `InvalidShape` if the session belongs to a differently shaped model
    pub fn encode(&self, session: &mut Session, tokens: &[u32]) -> Result<Vec<Vec<f32>>> {
        self.check_session(session)?;
        let wrapped: Vec<u32> = std::iter::once(self.settings.start_of_text_token)
            .chain(tokens.iter().copied())
            .chain(std::iter::once(self.settings.end_of_text_token))
            .collect();
        if wrapped.len() > self.settings.context_size {
            return Err(TraducirError::ContextLimitExceeded {
                provided: wrapped.len(),
                maximum: self.settings.context_size,
            });
        }

        session.tracer.start_step(TraceStep::Embed);
        let mut states = wrapped
            .iter()
            .enumerate()
            .map(|(position, &token)| self.embeddings.embed(Stack::Encoder, token, position))
            .collect::<Result<Vec<_>>>()?;
        session
            .tracer
            .trace_embed(&states, self.settings.hidden_size);

        session.tracer.start_step(TraceStep::Encode);
        for (layer, cache) in self.encoders.iter().zip(&mut session.encoder_caches) {
            states = layer.forward(cache, &states)?;
        }
        let outputs = states
            .iter()
            .map(|h| self.encoder_norm.forward(h))
            .collect::<Result<Vec<_>>>()?;
        session
            .tracer
            .trace_encode(self.encoders.len(), &outputs, self.settings.hidden_size);

        Ok(outputs)
    }

    /// Fill every decoder layer's cross-attention cache
    ///
    /// Must run once per request, before the first decode step.
    ///
    /// # Errors
    ///
    /// Returns error on width mismatch, if the caches are already primed
    /// to capacity, or if the session belongs to a differently shaped model
    pub fn prime_cross(&self, session: &mut Session, encoder_outputs: &[Vec<f32>]) -> Result<()> {
        self.check_session(session)?;
        session.tracer.start_step(TraceStep::CrossPrime);
        for (layer, cache) in self.decoders.iter().zip(&mut session.decoder_caches) {
            layer.prime_cross(cache, encoder_outputs)?;
        }
        session.tracer.trace_cross_prime(
            self.decoders.len(),
            encoder_outputs.len(),
            self.settings.hidden_size,
        );
        Ok(())
    }

    /// Run one decode step and return the vocabulary logits
    ///
    /// Appends one entry to every decoder self-attention cache.
    ///
    /// # Errors
    ///
    /// - `InvalidToken` if `previous` is outside the vocabulary
    /// - `ContextLimitExceeded` if `position` is past the positional table
    ///   or the self caches are full
    /// - `InvalidShape` if the session belongs to a differently shaped model
    pub fn decode_step(
        &self,
        session: &mut Session,
        position: usize,
        previous: u32,
    ) -> Result<Vec<f32>> {
        self.check_session(session)?;
        session.tracer.start_step(TraceStep::Decode);
        let mut hidden = self.embeddings.embed(Stack::Decoder, previous, position)?;
        for (layer, cache) in self.decoders.iter().zip(&mut session.decoder_caches) {
            hidden = layer.execute(cache, &hidden)?;
        }
        let hidden = self.decoder_norm.forward(&hidden)?;
        session.tracer.trace_decode(position, previous, &hidden);

        session.tracer.start_step(TraceStep::LmHead);
        let logits = self.embeddings.logits(&hidden)?;
        session.tracer.trace_lm_head(position, &logits);
        Ok(logits)
    }

    /// Reject a session whose caches were sized for another model
    fn check_session(&self, session: &Session) -> Result<()> {
        let settings = &self.settings;
        let fits = |cache: &AttentionCache, stack: Stack| {
            cache.head_count() == settings.head_count(stack)
                && cache.head_dim() == settings.head_dim(stack)
                && cache.capacity() == settings.context_size
        };
        let encoders_fit = session.encoder_caches.len() == self.encoders.len()
            && session
                .encoder_caches
                .iter()
                .all(|cache| fits(cache, Stack::Encoder));
        let decoders_fit = session.decoder_caches.len() == self.decoders.len()
            && session.decoder_caches.iter().all(|cache| {
                fits(&cache.self_attn, Stack::Decoder) && fits(&cache.cross_attn, Stack::Decoder)
            });

        if encoders_fit && decoders_fit {
            return Ok(());
        }
        Err(TraducirError::InvalidShape {
            reason: format!(
                "session with {} encoder and {} decoder caches doesn't fit a model with {} encoder \
                 and {} decoder layers ({} heads / {} heads, context {})",
                session.encoder_caches.len(),
                session.decoder_caches.len(),
                self.encoders.len(),
                self.decoders.len(),
                settings.encoder_head_count,
                settings.decoder_head_count,
                settings.context_size,
            ),
        })
    }
}
