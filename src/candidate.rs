//! Beam hypothesis state
//!
//! A `Candidate` is one partial report under consideration by the beam
//! search: its tokens so far, the cumulative log-probability of those
//! tokens, and whatever incremental state the scorer keeps for it (a KV
//! cache for the transformer decoder, nothing for test stubs).

/// Added to every probability before taking its logarithm so `p = 0` stays finite
pub const LOG_EPSILON: f64 = 1e-12;

/// Status of a candidate in the beam
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateStatus {
    /// Still growing; will be scored at the next step
    Active,

    /// Ends with EOS; carried forward unchanged
    Finished,
}

/// A single hypothesis in the beam
///
/// Candidates are never mutated in place once they are in the beam. Expanding
/// a candidate creates children via [`Candidate::extend`], each owning its own
/// copy of the token history and scorer state.
///
/// # Example
///
/// ```
/// use report_decoder::{Candidate, CandidateStatus};
///
/// // SOS = 2, EOS = 3
/// let root = Candidate::new(2, 3, ());
/// assert_eq!(root.tokens, vec![2]);
/// assert_eq!(root.log_prob, 0.0);
///
/// let child = root.extend(7, 0.5, ());
/// assert_eq!(child.tokens, vec![2, 7]);
/// assert_eq!(child.status, CandidateStatus::Active);
///
/// let done = child.extend(3, 0.9, ());
/// assert!(done.is_finished());
/// ```
#[derive(Debug, Clone)]
pub struct Candidate<S> {
    /// Token ids, starting with SOS
    pub tokens: Vec<u32>,

    /// Sum of `ln(p + LOG_EPSILON)` over every chosen token
    pub log_prob: f64,

    /// Whether this candidate ended with EOS
    pub status: CandidateStatus,

    /// Scorer-owned incremental state
    pub state: S,

    /// EOS (End of Sequence) token ID
    pub eos_token_id: u32,
}

impl<S> Candidate<S> {
    /// Create the initial `[SOS]` candidate with score 0
    pub fn new(sos_token_id: u32, eos_token_id: u32, state: S) -> Self {
        Self {
            tokens: vec![sos_token_id],
            log_prob: 0.0,
            status: CandidateStatus::Active,
            state,
            eos_token_id,
        }
    }

    /// Child candidate with `token` appended and its probability folded in
    ///
    /// # Arguments
    ///
    /// * `token` - The chosen token ID
    /// * `prob` - Probability the scorer assigned to `token`
    /// * `state` - Scorer state for the child
    ///
    /// # Returns
    ///
    /// A new candidate, marked finished if `token` is EOS
    pub fn extend(&self, token: u32, prob: f32, state: S) -> Self {
        let mut tokens = Vec::with_capacity(self.tokens.len() + 1);
        tokens.extend_from_slice(&self.tokens);
        tokens.push(token);

        let status = if token == self.eos_token_id {
            CandidateStatus::Finished
        } else {
            CandidateStatus::Active
        };

        Self {
            tokens,
            log_prob: self.log_prob + (prob as f64 + LOG_EPSILON).ln(),
            status,
            state,
            eos_token_id: self.eos_token_id,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status == CandidateStatus::Finished
    }

    /// Length-normalized score: `log_prob / len^p`
    ///
    /// With `length_penalty == 0` the divisor is 1 and the raw score is returned.
    pub fn normalized_score(&self, length_penalty: f32) -> f64 {
        if length_penalty == 0.0 {
            return self.log_prob;
        }
        self.log_prob / (self.tokens.len() as f64).powf(length_penalty as f64)
    }

    /// Number of tokens including SOS
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
