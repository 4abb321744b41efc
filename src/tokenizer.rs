//! Tokenizer for text encoding and decoding
//!
//! Implements byte-level BPE (Byte Pair Encoding) as used by GPT-2 style
//! vocabularies:
//! - Every input byte maps to one printable character, so no text is ever
//!   unrepresentable; a space becomes `Ġ`
//! - Adjacent pieces are merged by merge rank until no ranked pair remains
//! - Decoding maps characters back to bytes and repairs invalid UTF-8 with
//!   `U+FFFD`
//!
//! A single token may hold only part of a multi-byte character, so decoding
//! tokens one at a time can differ from decoding the whole sequence.
//!
//! ## Example
//!
//! ```rust,ignore
//! use traducir::tokenizer::{BPETokenizer, TextCodec};
//!
//! let tokenizer = BPETokenizer::from_dir("./opus-mt-en-de")?;
//! let token_ids = tokenizer.encode("Hello, world!");
//! let text = tokenizer.decode(&token_ids)?;
//! ```

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Result, TraducirError};

/// Vocabulary file inside a model directory (`{"token": id, ...}`)
pub const VOCAB_FILE: &str = "vocab.json";

/// Merge rules file inside a model directory (`first second` per line)
pub const MERGES_FILE: &str = "merges.txt";

/// Tokens tried, in order, as the unknown token when loading from files
const UNKNOWN_CANDIDATES: [&str; 3] = ["<unk>", "<|endoftext|>", "</s>"];

/// Text ⇄ token id conversion
pub trait TextCodec: Send + Sync {
    /// Encode text to token IDs
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Decode token IDs to text
    ///
    /// # Errors
    ///
    /// Returns error if any token ID is outside the vocabulary
    fn decode(&self, token_ids: &[u32]) -> Result<String>;

    /// Decode one token for incremental display
    ///
    /// # Errors
    ///
    /// Returns error if the token ID is outside the vocabulary
    fn decode_token(&self, token_id: u32) -> Result<String> {
        self.decode(&[token_id])
    }

    /// Number of tokens in the vocabulary
    fn vocab_size(&self) -> usize;
}

/// Byte-level BPE tokenizer
#[derive(Debug, Clone)]
pub struct BPETokenizer {
    /// Token to ID mapping
    token_to_id: HashMap<String, u32>,
    /// ID to token mapping (index = ID)
    id_to_token: Vec<String>,
    /// Merge rank of each mergeable pair, lower merges first
    merge_ranks: HashMap<(String, String), usize>,
    /// Unknown token ID
    unk_token_id: u32,
    /// Byte → printable character
    byte_encoder: [char; 256],
    /// Printable character → byte
    byte_decoder: HashMap<char, u8>,
}

impl BPETokenizer {
    /// Create a new BPE tokenizer
    ///
    /// # Arguments
    ///
    /// * `vocab` - List of tokens (index = token ID)
    /// * `merges` - List of merge pairs in priority order
    /// * `unk_token` - Unknown token string
    ///
    /// # Errors
    ///
    /// Returns error if vocabulary is empty or unknown token not found
    pub fn new(vocab: Vec<String>, merges: Vec<(String, String)>, unk_token: &str) -> Result<Self> {
        if vocab.is_empty() {
            return Err(TraducirError::UnsupportedOperation {
                operation: "create_bpe_tokenizer".to_string(),
                reason: "Vocabulary cannot be empty".to_string(),
            });
        }

        let mut token_to_id = HashMap::with_capacity(vocab.len());
        for (id, token) in vocab.iter().enumerate() {
            let id = u32::try_from(id).map_err(|_| TraducirError::UnsupportedOperation {
                operation: "convert_token_id".to_string(),
                reason: format!("Token ID {id} exceeds u32 limit"),
            })?;
            token_to_id.insert(token.clone(), id);
        }

        let unk_token_id =
            *token_to_id
                .get(unk_token)
                .ok_or_else(|| TraducirError::UnsupportedOperation {
                    operation: "create_bpe_tokenizer".to_string(),
                    reason: format!("Unknown token '{unk_token}' not in vocabulary"),
                })?;

        let merge_ranks = merges
            .into_iter()
            .enumerate()
            .map(|(rank, pair)| (pair, rank))
            .collect();

        let byte_encoder = byte_to_char_table();
        let byte_decoder = byte_encoder
            .iter()
            .enumerate()
            .filter_map(|(b, &c)| u8::try_from(b).ok().map(|b| (c, b)))
            .collect();

        Ok(Self {
            token_to_id,
            id_to_token: vocab,
            merge_ranks,
            unk_token_id,
            byte_encoder,
            byte_decoder,
        })
    }

    /// Load `vocab.json` and `merges.txt` from a model directory
    ///
    /// The unknown token is the first of `<unk>`, `<|endoftext|>`, `</s>`
    /// present in the vocabulary.
    ///
    /// # Errors
    ///
    /// Returns `IoError` for unreadable files and `FormatError` for malformed
    /// contents
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let vocab = parse_vocab(&read_file(&dir.join(VOCAB_FILE))?)?;
        let merges = parse_merges(&read_file(&dir.join(MERGES_FILE))?)?;

        let unk_token = UNKNOWN_CANDIDATES
            .iter()
            .find(|candidate| vocab.iter().any(|t| t == *candidate))
            .ok_or_else(|| TraducirError::FormatError {
                reason: format!(
                    "{}: no unknown token (tried {})",
                    VOCAB_FILE,
                    UNKNOWN_CANDIDATES.join(", ")
                ),
            })?;

        Self::new(vocab, merges, unk_token)
    }

    /// Encode text to token IDs using BPE
    ///
    /// Words are split on spaces; every word after the first keeps its
    /// leading space. Pieces missing from the vocabulary map to the unknown
    /// token.
    #[must_use]
    pub fn encode(&self, text: &str) -> Vec<u32> {
        if text.is_empty() {
            return Vec::new();
        }

        let mut result = Vec::new();
        for (i, word) in text.split(' ').enumerate() {
            if word.is_empty() {
                continue;
            }
            let mut pieces: Vec<String> = Vec::with_capacity(word.len() + 1);
            if i > 0 {
                pieces.push(self.byte_encoder[usize::from(b' ')].to_string());
            }
            pieces.extend(
                word.bytes()
                    .map(|b| self.byte_encoder[usize::from(b)].to_string()),
            );

            for piece in self.merge(pieces) {
                let id = self
                    .token_to_id
                    .get(&piece)
                    .copied()
                    .unwrap_or(self.unk_token_id);
                result.push(id);
            }
        }

        result
    }

    /// Merge adjacent pieces, lowest rank first, until no ranked pair remains
    fn merge(&self, mut pieces: Vec<String>) -> Vec<String> {
        while pieces.len() > 1 {
            let best = pieces
                .windows(2)
                .enumerate()
                .filter_map(|(i, pair)| {
                    self.merge_ranks
                        .get(&(pair[0].clone(), pair[1].clone()))
                        .map(|&rank| (rank, i))
                })
                .min();

            let Some((_, i)) = best else {
                break;
            };
            let second = pieces.remove(i + 1);
            pieces[i].push_str(&second);
        }
        pieces
    }

    /// Decode token IDs to text
    ///
    /// # Errors
    ///
    /// Returns error if any token ID is invalid
    pub fn decode(&self, token_ids: &[u32]) -> Result<String> {
        let mut bytes = Vec::new();

        for &id in token_ids {
            let token = self.get_token(id).ok_or_else(|| TraducirError::InvalidToken {
                token: id,
                vocab_size: self.vocab_size(),
            })?;
            for c in token.chars() {
                match self.byte_decoder.get(&c) {
                    Some(&b) => bytes.push(b),
                    None => {
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                    },
                }
            }
        }

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Get vocabulary size
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.id_to_token.len()
    }

    /// Get token ID for a token
    #[must_use]
    pub fn get_token_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    /// Get token for a token ID
    #[must_use]
    pub fn get_token(&self, id: u32) -> Option<&str> {
        self.id_to_token.get(id as usize).map(String::as_str)
    }
}

impl TextCodec for BPETokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        BPETokenizer::encode(self, text)
    }

    fn decode(&self, token_ids: &[u32]) -> Result<String> {
        BPETokenizer::decode(self, token_ids)
    }

    fn vocab_size(&self) -> usize {
        BPETokenizer::vocab_size(self)
    }
}

/// GPT-2 byte to printable character mapping
///
/// Printable Latin-1 bytes map to themselves; the rest map to `U+0100`
/// onwards in byte order.
fn byte_to_char_table() -> [char; 256] {
    let mut table = ['\0'; 256];
    let mut next = 256u32;
    for b in 0..=255u8 {
        let printable = matches!(b, b'!'..=b'~' | 0xA1..=0xAC | 0xAE..=0xFF);
        table[usize::from(b)] = if printable {
            char::from(b)
        } else {
            let c = char::from_u32(next).unwrap_or(char::REPLACEMENT_CHARACTER);
            next += 1;
            c
        };
    }
    table
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| TraducirError::IoError {
        message: format!("Cannot read {}: {e}", path.display()),
    })
}

/// Parse a `{"token": id}` map into an ID-indexed token list
fn parse_vocab(json: &str) -> Result<Vec<String>> {
    let map: HashMap<String, u32> =
        serde_json::from_str(json).map_err(|e| TraducirError::FormatError {
            reason: format!("{VOCAB_FILE}: {e}"),
        })?;

    let mut tokens = vec![None; map.len()];
    for (token, id) in map {
        let slot = tokens
            .get_mut(id as usize)
            .ok_or_else(|| TraducirError::FormatError {
                reason: format!("{VOCAB_FILE}: token id {id} leaves gaps in the vocabulary"),
            })?;
        if slot.is_some() {
            return Err(TraducirError::FormatError {
                reason: format!("{VOCAB_FILE}: token id {id} assigned twice"),
            });
        }
        *slot = Some(token);
    }

    Ok(tokens.into_iter().flatten().collect())
}

/// Parse `first second` merge lines, skipping blanks and `#` headers
fn parse_merges(text: &str) -> Result<Vec<(String, String)>> {
    let mut merges = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(first), Some(second), None) => {
                merges.push((first.to_string(), second.to_string()));
            },
            _ => {
                return Err(TraducirError::FormatError {
                    reason: format!("{MERGES_FILE} line {}: expected two tokens", line_no + 1),
                })
            },
        }
    }
    Ok(merges)
}
