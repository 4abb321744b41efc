//! Synthetic model fixtures
//!
//! Builds complete, deterministic parameter sets for small encoder-decoder
//! models so the engine can be exercised without trained weights.
//!
//! # Design
//!
//! ```text
//! ModelSettings + WeightInit → SyntheticModel → MemoryStore → Translator
//!                                     ↓
//!                               write_to_dir()
//!                                     ↓
//!                    model.properties + raw tensor files
//! ```
//!
//! The default fixture ([`tiny_settings`]) has hidden size 4, two heads,
//! one layer per stack and a context of 5 positions.

use std::path::Path;

use crate::config::{ModelSettings, Stack, PROPERTIES_FILE};
use crate::error::{Result, TraducirError};
use crate::model::Translator;
use crate::store::{names, MemoryStore, ParameterStore};

pub mod generators;

use generators::{identity_like, position_ramp, signed_one_hot, SyntheticWeightGenerator};

/// Settings of the smallest useful model
///
/// Vocabulary of 8, start-of-text `1`, end-of-text `2`, special-token
/// offset `1`, context 5, hidden 4, one layer with two heads per stack.
#[must_use]
pub fn tiny_settings() -> ModelSettings {
    ModelSettings {
        vocab_size: 8,
        start_of_text_token: 1,
        end_of_text_token: 2,
        special_token_offset: 1,
        context_size: 5,
        hidden_size: 4,
        encoder_count: 1,
        encoder_head_count: 2,
        encoder_score_dividend: 1,
        decoder_count: 1,
        decoder_head_count: 2,
        decoder_score_dividend: 1,
        epsilon: 1e-5,
        prompt: None,
        bias: Default::default(),
    }
}

/// How weight matrices are filled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightInit {
    /// Identity-like projections, signed one-hot token table, ramped positions
    IdentityLike,
    /// Seeded uniform values with Xavier scale
    Random {
        /// Base seed
        seed: u64,
    },
}

/// A complete synthetic parameter set
#[derive(Debug, Clone)]
pub struct SyntheticModel {
    settings: ModelSettings,
    store: MemoryStore,
}

impl SyntheticModel {
    /// Generate every tensor the settings call for
    ///
    /// Biases are zero and normalizations are `w = 1, b = 0` regardless of
    /// `init`. Absent biases (per [`crate::config::BiasFlags`]) are not stored.
    #[must_use]
    pub fn new(settings: ModelSettings, init: WeightInit) -> Self {
        let mut builder = Builder {
            settings: &settings,
            init,
            store: MemoryStore::new(),
            counter: 0,
        };
        builder.fill();
        let store = builder.store;
        Self { settings, store }
    }

    /// Identity-like model with [`tiny_settings`]
    #[must_use]
    pub fn tiny() -> Self {
        Self::new(tiny_settings(), WeightInit::IdentityLike)
    }

    /// Make every decode step select `token`
    ///
    /// Zeroes the final decoder normalization weight and sets its bias to
    /// the token's embedding row, so the logits are the token table's dot
    /// products with that row. With [`WeightInit::IdentityLike`] and
    /// `vocab_size <= 2 * hidden_size` the row is the unique arg-max.
    ///
    /// # Errors
    ///
    /// Returns `InvalidToken` if `token` is outside the vocabulary
    pub fn force_output_token(mut self, token: u32) -> Result<Self> {
        let hidden = self.settings.hidden_size;
        let table = self.store.load_matrix(
            names::TOKEN_EMBEDDINGS,
            self.settings.vocab_size,
            hidden,
        )?;
        let row = table
            .get_row(token as usize)
            .map(<[f32]>::to_vec)
            .ok_or(TraducirError::InvalidToken {
                token,
                vocab_size: self.settings.vocab_size,
            })?;

        self.store
            .insert(names::output_norm(Stack::Decoder, "w"), vec![0.0; hidden]);
        self.store
            .insert(names::output_norm(Stack::Decoder, "b"), row);
        Ok(self)
    }

    /// Model settings
    #[must_use]
    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    /// Generated tensors
    #[must_use]
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Mutable access to the generated tensors
    pub fn store_mut(&mut self) -> &mut MemoryStore {
        &mut self.store
    }

    /// Load a translator from the generated tensors
    ///
    /// # Errors
    ///
    /// Returns error if a tensor was removed or reshaped after generation
    pub fn build(&self) -> Result<Translator> {
        Translator::load(self.settings.clone(), &self.store)
    }

    /// Write the model as a directory: `model.properties` plus one raw
    /// little-endian `f32` file per tensor
    ///
    /// # Errors
    ///
    /// Returns `IoError` if any file can't be written
    pub fn write_to_dir(&self, dir: &Path) -> Result<()> {
        let io_error = |path: &Path, e: std::io::Error| TraducirError::IoError {
            message: format!("Cannot write {}: {e}", path.display()),
        };

        let properties = dir.join(PROPERTIES_FILE);
        std::fs::write(&properties, self.settings.to_properties())
            .map_err(|e| io_error(&properties, e))?;

        for (name, values) in self.store.iter() {
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
            }
            let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            std::fs::write(&path, bytes).map_err(|e| io_error(&path, e))?;
        }
        Ok(())
    }
}

struct Builder<'a> {
    settings: &'a ModelSettings,
    init: WeightInit,
    store: MemoryStore,
    counter: u64,
}

impl Builder<'_> {
    fn fill(&mut self) {
        let s = self.settings;
        let hidden = s.hidden_size;
        let rows = s.position_rows();

        let tokens = self.values(s.vocab_size, hidden, signed_one_hot);
        self.store.insert(names::TOKEN_EMBEDDINGS, tokens);

        for stack in [Stack::Encoder, Stack::Decoder] {
            let positions = self.values(rows, hidden, position_ramp);
            self.store
                .insert(names::position_embeddings(stack), positions);
            self.norm(&names::input_norm(stack, "w"), &names::input_norm(stack, "b"));
            self.norm(
                &names::output_norm(stack, "w"),
                &names::output_norm(stack, "b"),
            );

            for index in 0..s.layer_count(stack) {
                self.attention(stack, index, false);
                if stack == Stack::Decoder {
                    self.attention(stack, index, true);
                }
                self.feed_forward(stack, index);
            }
        }
    }

    fn values(&mut self, rows: usize, cols: usize, fixed: fn(usize, usize) -> Vec<f32>) -> Vec<f32> {
        match self.init {
            WeightInit::IdentityLike => fixed(rows, cols),
            WeightInit::Random { seed } => {
                self.counter += 1;
                SyntheticWeightGenerator::new(seed)
                    .derive(self.counter)
                    .generate_f32(&[rows, cols])
            },
        }
    }

    fn matrix(&mut self, name: String, rows: usize, cols: usize) {
        let values = self.values(rows, cols, identity_like);
        self.store.insert(name, values);
    }

    fn bias(&mut self, name: String, len: usize, present: bool) {
        if present {
            self.store.insert(name, vec![0.0; len]);
        }
    }

    fn norm(&mut self, weight: &str, bias: &str) {
        let hidden = self.settings.hidden_size;
        self.store.insert(weight, vec![1.0; hidden]);
        self.store.insert(bias, vec![0.0; hidden]);
    }

    fn attention(&mut self, stack: Stack, index: usize, cross: bool) {
        let hidden = self.settings.hidden_size;
        let flags = self.settings.bias;
        for (kind, present) in [
            ("query", flags.query),
            ("key", flags.key),
            ("value", flags.value),
            ("proj", flags.projection),
        ] {
            self.matrix(names::attention(stack, index, kind, cross, "w"), hidden, hidden);
            self.bias(names::attention(stack, index, kind, cross, "b"), hidden, present);
        }
        self.norm(
            &names::attention(stack, index, "norm", cross, "w"),
            &names::attention(stack, index, "norm", cross, "b"),
        );
    }

    fn feed_forward(&mut self, stack: Stack, index: usize) {
        let hidden = self.settings.hidden_size;
        let wide = self.settings.feed_forward_size();
        let flags = self.settings.bias;

        self.matrix(names::layer(stack, index, "mlp.layer1.w"), hidden, wide);
        self.bias(names::layer(stack, index, "mlp.layer1.b"), wide, flags.mlp_layer1);
        self.matrix(names::layer(stack, index, "mlp.layer2.w"), wide, hidden);
        self.bias(names::layer(stack, index, "mlp.layer2.b"), hidden, flags.mlp_layer2);
        self.norm(
            &names::layer(stack, index, "mlp.norm.w"),
            &names::layer(stack, index, "mlp.norm.b"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BiasFlags;

    #[test]
    fn test_tiny_settings_are_valid() {
        tiny_settings().validate().expect("valid settings");
    }

    #[test]
    fn test_store_matches_parameter_count() {
        let model = SyntheticModel::tiny();
        let stored: usize = model.store().iter().map(|(_, v)| v.len()).sum();
        assert_eq!(stored as u64, model.settings().parameter_count());
    }

    #[test]
    fn test_absent_biases_not_stored() {
        let mut settings = tiny_settings();
        settings.bias = BiasFlags::all(false);
        let model = SyntheticModel::new(settings, WeightInit::IdentityLike);

        assert!(!model.store().contains("encoders/encoder1/att.query.b"));
        assert!(model.store().contains("encoders/encoder1/att.query.w"));
        let stored: usize = model.store().iter().map(|(_, v)| v.len()).sum();
        assert_eq!(stored as u64, model.settings().parameter_count());
    }

    #[test]
    fn test_random_init_is_seeded() {
        let a = SyntheticModel::new(tiny_settings(), WeightInit::Random { seed: 3 });
        let b = SyntheticModel::new(tiny_settings(), WeightInit::Random { seed: 3 });
        let name = "decoders/decoder1/att.key.encoder.w";
        assert_eq!(
            a.store().load_vector(name, 16).expect("tensor"),
            b.store().load_vector(name, 16).expect("tensor")
        );
    }

    #[test]
    fn test_force_output_token_rejects_unknown() {
        assert!(SyntheticModel::tiny().force_output_token(8).is_err());
        assert!(SyntheticModel::tiny().force_output_token(7).is_ok());
    }

    #[test]
    fn test_write_to_dir_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        SyntheticModel::tiny()
            .write_to_dir(dir.path())
            .expect("write");

        assert!(dir.path().join(PROPERTIES_FILE).is_file());
        let wte = std::fs::metadata(dir.path().join("encoders/input/wte")).expect("wte");
        assert_eq!(wte.len(), 8 * 4 * 4);
        assert!(dir
            .path()
            .join("decoders/decoder1/att.norm.encoder.b")
            .is_file());
    }
}
