use tracing::info;

use super::{ComputeOutcome, Submission, Workload};
use crate::ciphertext::Ciphertext;
use crate::distance::EncryptedDistanceEngine;
use crate::keyring::{ContextView, Generation};
use crate::tally::{CancellationToken, EncryptedTallyEngine, EqualityOracle};
use crate::{Error, Result};

/// The compute side of a session. Only ever holds an evaluation-only view.
#[derive(Debug)]
pub struct ComputeParty {
    view: ContextView,
    cancellation: CancellationToken,
}

impl ComputeParty {
    /// Create a compute party over a public view. Secret views are refused.
    pub fn new(view: ContextView) -> Result<Self> {
        if !view.is_public() {
            return Err(Error::TrustBoundary(
                "the compute party cannot hold a secret view".to_string(),
            ));
        }
        info!(generation = %view.generation(), "compute party ready");
        Ok(Self {
            view,
            cancellation: CancellationToken::default(),
        })
    }

    /// Create a compute party from a serialized public context.
    pub fn from_public_context(bytes: &[u8]) -> Result<Self> {
        Self::new(ContextView::deserialize(bytes)?)
    }

    /// Generation of the held view.
    pub fn generation(&self) -> Generation {
        self.view.generation()
    }

    /// The held public view.
    pub fn view(&self) -> &ContextView {
        &self.view
    }

    /// Token cancelling the tally in progress, if any.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Decode a submission and link every ciphertext to the public view.
    fn receive(&self, bytes: &[u8], expected: Workload) -> Result<Vec<Ciphertext>> {
        let submission = Submission::from_bytes(bytes)?;
        if submission.generation != self.view.generation() {
            return Err(Error::generation_mismatch(
                self.view.generation(),
                submission.generation,
            ));
        }
        if submission.workload != expected {
            return Err(Error::InvalidInput(format!(
                "expected a {expected:?} submission, got {:?}",
                submission.workload
            )));
        }
        let mut ciphertexts = submission.ciphertexts;
        for ct in &mut ciphertexts {
            ct.link(&self.view)?;
        }
        Ok(ciphertexts)
    }

    /// Pairwise tally of submitted ballots, using the client's oracle for the
    /// per-pair equality bits. Returns the serialized encrypted group counts.
    pub fn tally<O: EqualityOracle + ?Sized>(&self, submission: &[u8], oracle: &O) -> Result<Vec<u8>> {
        let ballots = self.receive(submission, Workload::Ballots)?;
        let result = EncryptedTallyEngine::new(&self.view)
            .with_cancellation(self.cancellation.clone())
            .tally(&ballots, oracle)?;
        Ok(ComputeOutcome::GroupCounts(result).to_bytes())
    }

    /// Additive tally of one-hot ballots. Returns the serialized encrypted
    /// per-candidate counts.
    pub fn tally_additive(&self, submission: &[u8], candidates: usize) -> Result<Vec<u8>> {
        let ballots = self.receive(submission, Workload::Ballots)?;
        let counts = EncryptedTallyEngine::new(&self.view)
            .with_cancellation(self.cancellation.clone())
            .additive_tally(&ballots, candidates)?;
        Ok(ComputeOutcome::CandidateCounts(counts).to_bytes())
    }

    /// Squared distance between the two submitted feature vectors. Returns the
    /// serialized encrypted result.
    pub fn squared_distance(&self, submission: &[u8]) -> Result<Vec<u8>> {
        let vectors = self.receive(submission, Workload::Vectors)?;
        let [a, b] = vectors.as_slice() else {
            return Err(Error::InvalidInput(format!(
                "expected two feature vectors, got {}",
                vectors.len()
            )));
        };
        let distance = EncryptedDistanceEngine::new(&self.view).squared_distance(a, b)?;
        Ok(ComputeOutcome::SquaredDistance(distance).to_bytes())
    }
}
