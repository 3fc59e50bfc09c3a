//! Encrypted deduplication and tally of ballots.
//!
//! [`EncryptedTallyEngine::tally`] groups "equal" ballots without decrypting
//! any of them. For each pair it computes the encrypted squared difference
//! `sum((b_i - b_j)^2)` and asks an [`EqualityOracle`] whether that score is
//! below the comparison tolerance.
//!
//! # Confidentiality trade-off
//!
//! The oracle holds the secret view and decrypts every pairwise score. Only
//! the resulting bit ("these two ballots are equal") is returned to the
//! compute party, but that bit is a genuine leak: after a tally the compute
//! party knows the partition of ballots into equal groups, though not the
//! values. A threshold or multi-party decryption of the comparison would
//! remove it. [`EncryptedTallyEngine::additive_tally`] avoids the leak
//! entirely for one-hot ballots, at the cost of fixing the candidate list in
//! advance.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::ciphertext::Ciphertext;
use crate::config::validate_tolerance;
use crate::keyring::{ContextView, Generation};
use crate::proto::{ComputeResult, ResultKind, TallyGroup};
use crate::{Error, Result};

/// Reveals whether an encrypted comparison score is below the tolerance.
///
/// Implementations hold decryption capability and live on the client side of
/// the trust boundary; the compute party only ever sees the boolean answer.
pub trait EqualityOracle: Sync {
    /// Whether the single-slot squared `score` decrypts below the tolerance.
    fn is_equal(&self, score: &Ciphertext) -> Result<bool>;
}

/// An [`EqualityOracle`] backed by a secret view.
#[derive(Debug)]
pub struct SecretEqualityOracle<'a> {
    view: &'a ContextView,
    tolerance: f64,
    revealed: AtomicUsize,
}

impl<'a> SecretEqualityOracle<'a> {
    /// Create an oracle; `tolerance` must lie in `(0, 1)`.
    pub fn new(view: &'a ContextView, tolerance: f64) -> Result<Self> {
        validate_tolerance(tolerance)?;
        view.secret_key()?;
        Ok(Self {
            view,
            tolerance,
            revealed: AtomicUsize::new(0),
        })
    }

    /// Number of equality bits revealed so far.
    pub fn revealed_bits(&self) -> usize {
        self.revealed.load(Ordering::Relaxed)
    }
}

impl EqualityOracle for SecretEqualityOracle<'_> {
    fn is_equal(&self, score: &Ciphertext) -> Result<bool> {
        if score.slots() != 1 {
            return Err(Error::DimensionMismatch(score.slots(), 1));
        }
        // A plain difference would reveal the order of two ballots.
        if score.scale_exponent() != 2 {
            return Err(Error::InvalidInput(
                "comparison score must be a squared difference".to_string(),
            ));
        }
        let value = score.decrypt(self.view)?[0];
        self.revealed.fetch_add(1, Ordering::Relaxed);
        Ok(value.abs() < self.tolerance)
    }
}

/// Shared flag for abandoning a tally between two pairwise comparisons.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Opaque identifier of a group of equal ballots.
///
/// Identifiers are ordinals in order of first appearance; they do not name a
/// candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u32);

/// One encrypted count per group of equal ballots.
#[derive(Debug)]
pub struct TallyResult {
    generation: Generation,
    groups: Vec<(GroupId, Ciphertext)>,
}

impl TallyResult {
    /// The generation the counts were produced under.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether no ballot was tallied.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Groups in order of first appearance.
    pub fn groups(&self) -> &[(GroupId, Ciphertext)] {
        &self.groups
    }

    /// Mutable access to the groups, for linking received counts.
    pub fn groups_mut(&mut self) -> &mut [(GroupId, Ciphertext)] {
        &mut self.groups
    }

    pub(crate) fn to_proto(&self) -> ComputeResult {
        ComputeResult {
            generation: self.generation.value(),
            kind: ResultKind::GroupCounts as i32,
            groups: self
                .groups
                .iter()
                .map(|(id, count)| TallyGroup {
                    id: id.0,
                    count: Some(count.to_envelope()),
                })
                .collect(),
            value: None,
        }
    }

    pub(crate) fn from_proto(proto: ComputeResult) -> Result<Self> {
        let generation = Generation::from(proto.generation);
        let groups = proto
            .groups
            .into_iter()
            .map(|group| {
                let count = group
                    .count
                    .ok_or_else(|| Error::malformed("tally group"))
                    .and_then(Ciphertext::from_envelope)?;
                if count.generation() != generation {
                    return Err(Error::generation_mismatch(generation, count.generation()));
                }
                Ok((GroupId(group.id), count))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { generation, groups })
    }
}

/// Encrypted tally over ballots linked to one evaluation view.
#[derive(Debug)]
pub struct EncryptedTallyEngine<'a> {
    view: &'a ContextView,
    cancellation: CancellationToken,
}

impl<'a> EncryptedTallyEngine<'a> {
    /// Create an engine evaluating under `view`.
    pub fn new(view: &'a ContextView) -> Self {
        Self {
            view,
            cancellation: CancellationToken::default(),
        }
    }

    /// Attach a cancellation token checked before every pairwise comparison.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    fn check_ballots(&self, ballots: &[Ciphertext]) -> Result<()> {
        for ballot in ballots {
            if !ballot.is_linked() {
                return Err(Error::UnlinkedContext);
            }
            if ballot.generation() != self.view.generation() {
                return Err(Error::generation_mismatch(
                    self.view.generation(),
                    ballot.generation(),
                ));
            }
        }
        Ok(())
    }

    /// Encrypted squared difference of two ballots.
    fn score(&self, lhs: &Ciphertext, rhs: &Ciphertext) -> Result<Ciphertext> {
        lhs.sub(rhs)?.square_sum()
    }

    /// Group equal ballots and count each group.
    ///
    /// Groups are opened at the smallest unvisited index; every later
    /// unvisited ballot is compared to the opening ballot, and those found
    /// equal join the group. Comparisons for one opening ballot run in
    /// parallel, and their outcomes are applied in ascending index order, so
    /// the grouping does not depend on scheduling.
    pub fn tally<O: EqualityOracle + ?Sized>(
        &self,
        ballots: &[Ciphertext],
        oracle: &O,
    ) -> Result<TallyResult> {
        self.check_ballots(ballots)?;
        info!(ballots = ballots.len(), "starting pairwise tally");

        let n = ballots.len();
        let mut visited = vec![false; n];
        let mut groups = Vec::new();
        let mut comparisons = 0usize;

        for i in 0..n {
            if visited[i] {
                continue;
            }
            visited[i] = true;

            let pending = (i + 1..n).filter(|&j| !visited[j]).collect::<Vec<_>>();
            let outcomes = pending
                .par_iter()
                .map(|&j| {
                    self.cancellation.check()?;
                    let score = self.score(&ballots[i], &ballots[j])?;
                    oracle.is_equal(&score)
                })
                .collect::<Result<Vec<bool>>>()?;
            comparisons += pending.len();

            let one = Ciphertext::encrypt_public(self.view, &[1.0])?;
            let mut count = Ciphertext::encrypt_public(self.view, &[1.0])?;
            for (&j, equal) in pending.iter().zip(outcomes) {
                if equal {
                    visited[j] = true;
                    count = count.add(&one)?;
                }
            }

            let id = GroupId(groups.len() as u32);
            debug!(group = id.0, opened_by = i, compared = pending.len(), "closed group");
            groups.push((id, count));
        }

        info!(groups = groups.len(), comparisons, "pairwise tally complete");
        Ok(TallyResult {
            generation: self.view.generation(),
            groups,
        })
    }

    /// Sum one-hot ballots slot-wise: slot `k` of the result counts the
    /// ballots cast for candidate `k + 1`. No comparison is decrypted.
    pub fn additive_tally(&self, ballots: &[Ciphertext], candidates: usize) -> Result<Ciphertext> {
        self.check_ballots(ballots)?;
        if candidates == 0 {
            return Err(Error::InvalidInput("no candidates".to_string()));
        }
        info!(ballots = ballots.len(), candidates, "starting additive tally");

        let mut sum = Ciphertext::encrypt_public(self.view, &vec![0.0; candidates])?;
        for ballot in ballots {
            self.cancellation.check()?;
            if ballot.slots() != candidates {
                return Err(Error::DimensionMismatch(ballot.slots(), candidates));
            }
            sum = sum.add(ballot)?;
        }
        Ok(sum)
    }
}
