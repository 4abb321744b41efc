//! Token and positional embeddings
//!
//! One token table is shared by both stacks and doubles as the output
//! projection for logits. Each stack has its own positional table, looked
//! up at `position + special_token_offset`, and an input normalization
//! applied to the embedding sum.

use super::{add, project_transposed, LayerNorm};
use crate::config::{ModelSettings, Stack};
use crate::error::{Result, TraducirError};
use crate::store::{names, ParameterStore};
use crate::tensor::Matrix;

/// Embedding tables of an encoder-decoder model
#[derive(Debug, Clone)]
pub struct Embeddings {
    /// Token table `[vocab_size, hidden_size]`
    tokens: Matrix,
    /// Encoder positional table `[context_size + offset, hidden_size]`
    encoder_positions: Matrix,
    /// Decoder positional table, same shape as the encoder's
    decoder_positions: Matrix,
    encoder_input_norm: LayerNorm,
    decoder_input_norm: LayerNorm,
    special_token_offset: usize,
}

impl Embeddings {
    /// Assemble embeddings from loaded tables
    ///
    /// # Errors
    ///
    /// Returns error if the table widths or norm sizes disagree
    pub fn new(
        tokens: Matrix,
        positions: (Matrix, Matrix),
        input_norms: (LayerNorm, LayerNorm),
        special_token_offset: usize,
    ) -> Result<Self> {
        let hidden = tokens.cols();
        let widths = [
            positions.0.cols(),
            positions.1.cols(),
            input_norms.0.normalized_shape(),
            input_norms.1.normalized_shape(),
        ];
        if widths.iter().any(|&w| w != hidden) {
            return Err(TraducirError::InvalidShape {
                reason: format!("Embedding widths {widths:?} don't match token width {hidden}"),
            });
        }

        Ok(Self {
            tokens,
            encoder_positions: positions.0,
            decoder_positions: positions.1,
            encoder_input_norm: input_norms.0,
            decoder_input_norm: input_norms.1,
            special_token_offset,
        })
    }

    /// Load every embedding table from a store
    ///
    /// # Errors
    ///
    /// Returns error if a table is missing or has the wrong size
    pub fn load<S: ParameterStore + ?Sized>(store: &S, settings: &ModelSettings) -> Result<Self> {
        let hidden = settings.hidden_size;
        let rows = settings.position_rows();
        let norm = |stack: Stack| {
            LayerNorm::load(
                store,
                &names::input_norm(stack, "w"),
                &names::input_norm(stack, "b"),
                hidden,
                settings.epsilon,
            )
        };

        Self::new(
            store.load_matrix(names::TOKEN_EMBEDDINGS, settings.vocab_size, hidden)?,
            (
                store.load_matrix(&names::position_embeddings(Stack::Encoder), rows, hidden)?,
                store.load_matrix(&names::position_embeddings(Stack::Decoder), rows, hidden)?,
            ),
            (norm(Stack::Encoder)?, norm(Stack::Decoder)?),
            settings.special_token_offset,
        )
    }

    /// Number of tokens in the vocabulary
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.tokens.rows()
    }

    /// Width of every embedding
    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.tokens.cols()
    }

    /// Number of positions a stack can embed
    #[must_use]
    pub fn max_positions(&self, stack: Stack) -> usize {
        self.positions(stack)
            .rows()
            .saturating_sub(self.special_token_offset)
    }

    /// Embed a token at a position of a stack
    ///
    /// `token embedding + positional embedding[position + offset]`, passed
    /// through the stack's input normalization.
    ///
    /// # Errors
    ///
    /// - `InvalidToken` if the token is outside the vocabulary
    /// - `ContextLimitExceeded` if the position is past the positional table
    pub fn embed(&self, stack: Stack, token: u32, position: usize) -> Result<Vec<f32>> {
        let token_row = self
            .tokens
            .get_row(token as usize)
            .ok_or(TraducirError::InvalidToken {
                token,
                vocab_size: self.vocab_size(),
            })?;

        let table = self.positions(stack);
        let position_row = table
            .get_row(position + self.special_token_offset)
            .ok_or(TraducirError::ContextLimitExceeded {
                provided: position + 1,
                maximum: self.max_positions(stack),
            })?;

        let norm = match stack {
            Stack::Encoder => &self.encoder_input_norm,
            Stack::Decoder => &self.decoder_input_norm,
        };
        norm.forward(&add(token_row, position_row)?)
    }

    /// Similarity of a hidden state with every token embedding
    ///
    /// # Errors
    ///
    /// Returns error if the hidden width doesn't match
    pub fn logits(&self, hidden: &[f32]) -> Result<Vec<f32>> {
        project_transposed(hidden, &self.tokens)
    }

    fn positions(&self, stack: Stack) -> &Matrix {
        match stack {
            Stack::Encoder => &self.encoder_positions,
            Stack::Decoder => &self.decoder_positions,
        }
    }
}
