//! Beam search controller
//!
//! This module drives any [`StepScorer`] (the transformer decoder, or a stub
//! in tests) to turn per-step token distributions into one output sequence.
//!
//! # Algorithm
//!
//! ```text
//! beam = [ [SOS] with score 0 ]
//! repeat up to max_steps times, until every candidate ends in EOS:
//!     for each candidate (in beam order):
//!         ends in EOS  -> carry forward unchanged
//!         otherwise    -> score it, keep its top min(K, V) tokens as children
//!     stable-sort all candidates by log_prob / len^p, descending
//!     keep the first K
//! return the first candidate
//! ```
//!
//! Candidates of one step are independent, so they are scored on the rayon
//! pool. Results are collected in beam order, which keeps ranking identical
//! to a sequential run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::candidate::Candidate;
use crate::config::GenerationConfig;
use crate::encoder::EncoderOutput;
use crate::{ReportError, Result};

/// Anything that can produce a next-token distribution for a prefix
///
/// `State` is per-candidate incremental state. It is created once per
/// request by [`StepScorer::begin`], cloned into every child candidate, and
/// handed back to [`StepScorer::score`] together with the candidate's tokens.
pub trait StepScorer: Sync {
    type State: Clone + Send;

    /// State for the root `[SOS]` candidate of a new request
    fn begin(&self, encoder_out: &EncoderOutput) -> Result<Self::State>;

    /// Probability of every vocabulary id following `tokens`
    fn score(
        &self,
        tokens: &[u32],
        state: &mut Self::State,
        encoder_out: &EncoderOutput,
    ) -> Result<Vec<f32>>;

    /// Longest sequence the scorer accepts, if bounded
    fn max_sequence_len(&self) -> Option<usize> {
        None
    }
}

/// Cooperative cancellation flag shared between a request and its caller
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cancellation and deadline checked before every beam step
#[derive(Debug, Clone, Default)]
pub struct GenerationControl {
    pub cancel: Option<CancelToken>,
    pub deadline: Option<Instant>,
}

impl GenerationControl {
    /// No cancellation, no deadline
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// # Errors
    ///
    /// `Cancelled` if the token was triggered, `DeadlineExceeded` if the
    /// deadline has passed.
    pub fn check(&self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(ReportError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(ReportError::DeadlineExceeded);
        }
        Ok(())
    }
}

/// Candidates alive between steps
#[derive(Debug, Clone)]
pub struct BeamState<S> {
    /// Sorted best-first after every step
    pub candidates: Vec<Candidate<S>>,

    /// Number of steps executed
    pub steps: usize,
}

impl<S> BeamState<S> {
    /// True once every candidate ends in EOS
    pub fn is_done(&self) -> bool {
        self.candidates.iter().all(Candidate::is_finished)
    }

    pub fn best(&self) -> Option<&Candidate<S>> {
        self.candidates.first()
    }
}

/// Result of one generation call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeamOutput {
    /// Token ids of the best candidate, starting with SOS
    pub tokens: Vec<u32>,

    /// Cumulative log-probability
    pub log_prob: f64,

    /// Score used for ranking (`log_prob / len^p`)
    pub normalized_score: f64,

    /// Whether the best candidate ends with EOS
    pub finished: bool,

    /// Number of steps executed
    pub steps: usize,
}

/// Beam search over a fixed vocabulary
///
/// # Example
///
/// ```
/// use report_decoder::{BeamSearch, GenerationConfig};
///
/// let config = GenerationConfig { beam_width: 2, max_steps: 10, ..Default::default() };
/// let search = BeamSearch::new(config, 2, 3).unwrap();
/// let beam = search.init(());
/// assert_eq!(beam.candidates.len(), 1);
/// assert_eq!(beam.candidates[0].tokens, vec![2]);
/// ```
#[derive(Debug, Clone)]
pub struct BeamSearch {
    config: GenerationConfig,
    sos_token_id: u32,
    eos_token_id: u32,
}

impl BeamSearch {
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the generation parameters are invalid.
    pub fn new(config: GenerationConfig, sos_token_id: u32, eos_token_id: u32) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sos_token_id,
            eos_token_id,
        })
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Beam holding only the `[SOS]` candidate
    pub fn init<S>(&self, state: S) -> BeamState<S> {
        BeamState {
            candidates: vec![Candidate::new(self.sos_token_id, self.eos_token_id, state)],
            steps: 0,
        }
    }

    /// Run one expansion + pruning step
    ///
    /// Any scorer error aborts the step; the beam is left empty in that case.
    pub fn advance<T: StepScorer>(
        &self,
        beam: &mut BeamState<T::State>,
        scorer: &T,
        encoder_out: &EncoderOutput,
    ) -> Result<()> {
        let k = self.config.beam_width;
        let candidates = std::mem::take(&mut beam.candidates);
        let active = candidates.iter().filter(|c| !c.is_finished()).count();

        let expand = |mut cand: Candidate<T::State>| -> Result<Vec<Candidate<T::State>>> {
            if cand.is_finished() {
                return Ok(vec![cand]);
            }
            let probs = scorer.score(&cand.tokens, &mut cand.state, encoder_out)?;
            Ok(top_k(&probs, k)?
                .into_iter()
                .map(|(token, prob)| cand.extend(token, prob, cand.state.clone()))
                .collect())
        };

        // 1. Expand every candidate, keeping beam order
        let expanded = if self.config.parallel && active > 1 {
            candidates
                .into_par_iter()
                .map(expand)
                .collect::<Result<Vec<_>>>()?
        } else {
            candidates
                .into_iter()
                .map(expand)
                .collect::<Result<Vec<_>>>()?
        };

        // 2. Rank; sort_by is stable so ties keep generation order
        let p = self.config.length_penalty;
        let mut pool: Vec<_> = expanded.into_iter().flatten().collect();
        pool.sort_by(|a, b| b.normalized_score(p).total_cmp(&a.normalized_score(p)));

        // 3. Prune
        pool.truncate(k);
        beam.candidates = pool;
        beam.steps += 1;

        debug!(
            step = beam.steps,
            active,
            finished = beam.candidates.iter().filter(|c| c.is_finished()).count(),
            "Beam step"
        );
        Ok(())
    }

    /// Generate the best sequence for one encoder output
    ///
    /// # Errors
    ///
    /// - `InvalidConfig` if `max_steps + 1` exceeds the scorer's sequence limit
    /// - `Cancelled` / `DeadlineExceeded` from `control`
    /// - Any scorer error, which aborts the whole call
    pub fn run<T: StepScorer>(
        &self,
        scorer: &T,
        encoder_out: &EncoderOutput,
        control: &GenerationControl,
    ) -> Result<BeamOutput> {
        if let Some(max_len) = scorer.max_sequence_len() {
            self.config.validate_for_max_len(max_len)?;
        }

        let mut beam = self.init(scorer.begin(encoder_out)?);
        while beam.steps < self.config.max_steps && !beam.is_done() {
            control.check()?;
            self.advance(&mut beam, scorer, encoder_out)?;
        }

        let best = beam
            .best()
            .ok_or_else(|| ReportError::Model("Beam is empty".to_string()))?;

        Ok(BeamOutput {
            tokens: best.tokens.clone(),
            log_prob: best.log_prob,
            normalized_score: best.normalized_score(self.config.length_penalty),
            finished: best.is_finished(),
            steps: beam.steps,
        })
    }
}

/// Always take the most probable token (beam width 1)
///
/// `normalized_score` of the result equals its raw `log_prob`.
pub fn greedy_decode<T: StepScorer>(
    scorer: &T,
    encoder_out: &EncoderOutput,
    sos_token_id: u32,
    eos_token_id: u32,
    max_steps: usize,
) -> Result<BeamOutput> {
    if let Some(max_len) = scorer.max_sequence_len() {
        if max_steps + 1 > max_len {
            return Err(ReportError::InvalidConfig(format!(
                "max_steps ({}) + SOS exceeds the decoder's max_len ({})",
                max_steps, max_len
            )));
        }
    }

    let mut state = scorer.begin(encoder_out)?;
    let mut cand = Candidate::new(sos_token_id, eos_token_id, ());
    let mut steps = 0;
    while steps < max_steps && !cand.is_finished() {
        let probs = scorer.score(&cand.tokens, &mut state, encoder_out)?;
        let (token, prob) = top_k(&probs, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| ReportError::Model("Empty distribution".to_string()))?;
        cand = cand.extend(token, prob, ());
        steps += 1;
    }

    Ok(BeamOutput {
        log_prob: cand.log_prob,
        normalized_score: cand.log_prob,
        finished: cand.is_finished(),
        tokens: cand.tokens,
        steps,
    })
}

/// Highest `min(k, len)` probabilities, best first, lower id first on ties
fn top_k(probs: &[f32], k: usize) -> Result<Vec<(u32, f32)>> {
    if probs.is_empty() {
        return Err(ReportError::Model("Scorer returned an empty distribution".to_string()));
    }
    if probs.iter().any(|p| !p.is_finite()) {
        return Err(ReportError::Model("Scorer returned non-finite probabilities".to_string()));
    }

    let mut ids: Vec<usize> = (0..probs.len()).collect();
    ids.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]).then(a.cmp(&b)));
    Ok(ids
        .into_iter()
        .take(k.min(probs.len()))
        .map(|id| (id as u32, probs[id]))
        .collect())
}
