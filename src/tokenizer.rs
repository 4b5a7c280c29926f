//! Word-level tokenizer for report text
//!
//! Maps lower-cased word tokens to dense integer ids and back. The first four
//! ids are always reserved for `<PAD>`, `<UNK>`, `<SOS>` and `<EOS>`. Text is
//! split with the `tokenizers` crate's `Whitespace` pre-tokenizer, so word
//! runs and punctuation runs become separate tokens.
//!
//! Hyphenated words are split too: `x-ray` encodes as `x`, `-`, `ray`. A
//! vocabulary with hyphenated entries never matches them; those words encode
//! to `<UNK>` unless their pieces are in the vocabulary.

use std::collections::HashMap;
use std::path::Path;

use tokenizers::pre_tokenizers::whitespace::Whitespace;
use tokenizers::{OffsetReferential, OffsetType, PreTokenizedString, PreTokenizer};
use tracing::{debug, info};

use crate::{ReportError, Result};

pub const PAD_TOKEN: &str = "<PAD>";
pub const UNK_TOKEN: &str = "<UNK>";
pub const SOS_TOKEN: &str = "<SOS>";
pub const EOS_TOKEN: &str = "<EOS>";

pub const PAD_ID: u32 = 0;
pub const UNK_ID: u32 = 1;
pub const SOS_ID: u32 = 2;
pub const EOS_ID: u32 = 3;

const RESERVED: [(&str, u32); 4] = [
    (PAD_TOKEN, PAD_ID),
    (UNK_TOKEN, UNK_ID),
    (SOS_TOKEN, SOS_ID),
    (EOS_TOKEN, EOS_ID),
];

/// Demo vocabulary served when no vocabulary file is supplied
const RADIOLOGY_WORDS: &[&str] = &[
    "no", "normal", "clear", "lung", "heart", "chest", "findings", "impression",
    "effusion", "pneumonia", "opacity", "consolidation", "atelectasis", "pleural",
    "cardiac", "mediastinal", "pulmonary", "bilateral", "right", "left", "lower",
    "upper", "middle", "lobe", "field", "border", "shadow", "density", "mass",
    "nodule", "lesion", "unchanged", "stable", "improved", "worsened", "acute",
    "chronic", "mild", "moderate", "severe", "markings", "vascular", "bronchial",
];

/// Immutable vocabulary with encode/decode
///
/// # Example
///
/// ```
/// use report_decoder::Tokenizer;
///
/// let tokenizer = Tokenizer::from_words(["normal", "lung", "field"]).unwrap();
/// let ids = tokenizer.encode("Normal lung field", true);
/// assert_eq!(ids, vec![2, 4, 5, 6, 3]);
/// assert_eq!(tokenizer.decode(&ids, true), "normal lung field");
/// ```
#[derive(Debug, Clone)]
pub struct Tokenizer {
    token_to_id: HashMap<String, u32>,
    id_to_token: Vec<String>,
}

impl Tokenizer {
    /// Build a tokenizer from a word -> id map
    ///
    /// # Errors
    ///
    /// Returns an error if a reserved token is missing or has the wrong id,
    /// or if the ids are not exactly `0..len`
    pub fn from_vocab(vocab: HashMap<String, u32>) -> Result<Self> {
        for (token, id) in RESERVED {
            match vocab.get(token) {
                Some(&found) if found == id => {}
                Some(&found) => {
                    return Err(ReportError::InvalidConfig(format!(
                        "reserved token {} must have id {}, found {}",
                        token, id, found
                    )))
                }
                None => {
                    return Err(ReportError::InvalidConfig(format!(
                        "vocabulary is missing reserved token {}",
                        token
                    )))
                }
            }
        }

        // Ids index the embedding table, so they must be dense
        let mut id_to_token = vec![None; vocab.len()];
        for (token, &id) in &vocab {
            let slot = id_to_token.get_mut(id as usize).ok_or_else(|| {
                ReportError::InvalidConfig(format!(
                    "token {:?} has id {} outside 0..{}",
                    token,
                    id,
                    vocab.len()
                ))
            })?;
            if slot.is_some() {
                return Err(ReportError::InvalidConfig(format!(
                    "id {} is assigned to more than one token",
                    id
                )));
            }
            *slot = Some(token.clone());
        }
        let id_to_token = id_to_token.into_iter().flatten().collect();

        Ok(Self {
            token_to_id: vocab,
            id_to_token,
        })
    }

    /// Build a tokenizer from reserved tokens followed by `words` (ids from 4)
    ///
    /// Duplicate words keep their first id.
    pub fn from_words<I, S>(words: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut vocab: HashMap<String, u32> = RESERVED
            .iter()
            .map(|&(token, id)| (token.to_string(), id))
            .collect();

        for word in words {
            let word = word.as_ref().to_lowercase();
            let next_id = vocab.len() as u32;
            vocab.entry(word).or_insert(next_id);
        }

        Self::from_vocab(vocab)
    }

    /// Load a JSON `{ "word": id }` vocabulary file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let vocab: HashMap<String, u32> = serde_json::from_str(&raw)?;
        let tokenizer = Self::from_vocab(vocab)?;
        info!(
            "Loaded vocabulary of {} tokens from {:?}",
            tokenizer.vocab_size(),
            path
        );
        Ok(tokenizer)
    }

    /// The chest X-ray demo vocabulary (47 tokens)
    pub fn default_radiology() -> Result<Self> {
        Self::from_words(RADIOLOGY_WORDS)
    }

    /// Split lower-cased text into word tokens
    fn split_words(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        let mut pretokenized = PreTokenizedString::from(lowered.as_str());

        match Whitespace::default().pre_tokenize(&mut pretokenized) {
            Ok(()) => pretokenized
                .get_splits(OffsetReferential::Original, OffsetType::Byte)
                .into_iter()
                .map(|(split, _, _)| split.to_string())
                .collect(),
            Err(e) => {
                debug!("Pre-tokenizer failed ({}), splitting on whitespace", e);
                lowered.split_whitespace().map(str::to_string).collect()
            }
        }
    }

    /// Encode text into token ids
    ///
    /// Unknown words map to the UNK id. With `add_special_tokens` the result
    /// is wrapped as `[SOS, ..., EOS]`. Never fails.
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Vec<u32> {
        let words = self.split_words(text);
        let mut ids = Vec::with_capacity(words.len() + 2);

        if add_special_tokens {
            ids.push(SOS_ID);
        }
        ids.extend(words.iter().map(|w| self.token_to_id(w).unwrap_or(UNK_ID)));
        if add_special_tokens {
            ids.push(EOS_ID);
        }

        ids
    }

    /// Decode token ids back into text
    ///
    /// Out-of-range ids render as `<UNK>`. With `skip_special_tokens` the PAD,
    /// SOS and EOS tokens are dropped; UNK is kept.
    pub fn decode(&self, token_ids: &[u32], skip_special_tokens: bool) -> String {
        token_ids
            .iter()
            .filter(|&&id| !(skip_special_tokens && matches!(id, PAD_ID | SOS_ID | EOS_ID)))
            .map(|&id| self.id_to_token(id).unwrap_or(UNK_TOKEN))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Look up the id of a token
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    /// Look up the token of an id
    pub fn id_to_token(&self, id: u32) -> Option<&str> {
        self.id_to_token.get(id as usize).map(String::as_str)
    }

    pub fn pad_id(&self) -> u32 {
        PAD_ID
    }

    pub fn unk_id(&self) -> u32 {
        UNK_ID
    }

    pub fn sos_id(&self) -> u32 {
        SOS_ID
    }

    pub fn eos_id(&self) -> u32 {
        EOS_ID
    }

    /// Get the vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.id_to_token.len()
    }
}
