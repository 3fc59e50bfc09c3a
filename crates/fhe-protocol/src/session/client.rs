use std::time::Instant;

use itertools::Itertools;
use tracing::{info, warn};
use zeroize::Zeroizing;

use super::{ComputeOutcome, SessionState, Submission, Workload};
use crate::ciphertext::Ciphertext;
use crate::config::SessionConfig;
use crate::distance::{check_distance_capacity, MatchDecision, MatchPolicy};
use crate::features::validate_feature_vector;
use crate::keyring::{ContextView, EvaluationContext, Generation};
use crate::tally::SecretEqualityOracle;
use crate::votes::{Roster, VoteSource};
use crate::{Error, Result};

/// Outcome of ballot ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BallotReceipt {
    /// Ballots encrypted.
    pub accepted: usize,
    /// Vote events rejected as invalid.
    pub rejected: usize,
}

/// One decrypted count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TallyEntry {
    /// Candidate name, or an opaque group label for pairwise tallies.
    pub label: String,
    /// Number of ballots.
    pub count: u64,
}

/// Decrypted tally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TallyReport {
    /// Counts in group or roster order.
    pub entries: Vec<TallyEntry>,
}

impl TallyReport {
    /// Total number of ballots counted.
    pub fn total(&self) -> u64 {
        self.entries.iter().map(|e| e.count).sum()
    }

    /// Entries by decreasing count; equal counts keep their original order.
    pub fn ranking(&self) -> Vec<&TallyEntry> {
        self.entries
            .iter()
            .sorted_by(|a, b| b.count.cmp(&a.count))
            .collect()
    }

    /// The entry with the highest count, the earliest one on ties.
    pub fn winner(&self) -> Option<&TallyEntry> {
        self.ranking().into_iter().next()
    }

    /// Counts sorted in increasing order.
    pub fn count_multiset(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.count).sorted().collect()
    }
}

/// The client side of a session. Holds the secret view exclusively.
#[derive(Debug)]
pub struct ClientSession {
    config: SessionConfig,
    roster: Roster,
    state: SessionState,
    secret: Option<ContextView>,
    workload: Option<Workload>,
    encrypted: Vec<Ciphertext>,
    outcome: Option<ComputeOutcome>,
}

impl ClientSession {
    /// Create a session from a validated configuration.
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let roster = Roster::new(config.candidates.clone())?;
        Ok(Self {
            config,
            roster,
            state: SessionState::Created,
            secret: None,
            workload: None,
            encrypted: Vec::new(),
            outcome: None,
        })
    }

    /// Resume a session from a stored secret context, in the
    /// `KeyMaterialIssued` state.
    pub fn resume(config: SessionConfig, secret_context: &[u8]) -> Result<Self> {
        let mut session = Self::new(config)?;
        let view = ContextView::deserialize(secret_context)?;
        if view.is_public() {
            return Err(Error::NoSecretKey);
        }
        if view.parameters() != &session.config.parameters {
            return Err(Error::ContextMismatch(
                "stored context was created with different parameters".to_string(),
            ));
        }
        info!(generation = %view.generation(), "resumed client session");
        session.secret = Some(view);
        session.state = SessionState::KeyMaterialIssued;
        Ok(session)
    }

    /// The current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The candidate roster.
    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Generation of the session context, once issued.
    pub fn generation(&self) -> Option<Generation> {
        self.secret.as_ref().map(ContextView::generation)
    }

    fn require(&self, allowed: &[SessionState], expected: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                expected,
                found: self.state.name(),
            })
        }
    }

    fn transition(&mut self, next: SessionState) {
        info!(from = self.state.name(), to = next.name(), "session transition");
        self.state = next;
    }

    fn secret_view(&self) -> Result<&ContextView> {
        self.secret.as_ref().ok_or(Error::NoSecretKey)
    }

    /// Generate the context and return the serialized public view for the
    /// compute party.
    pub fn issue_key_material(&mut self) -> Result<Vec<u8>> {
        self.require(&[SessionState::Created], "Created")?;
        let context = EvaluationContext::create(&self.config.parameters)?;
        let public = context.derive_public_view().serialize(false);
        self.secret = Some(context.derive_secret_view());
        self.transition(SessionState::KeyMaterialIssued);
        Ok(public)
    }

    /// The serialized public view.
    pub fn public_context(&self) -> Result<Vec<u8>> {
        Ok(self.secret_view()?.to_public().serialize(false))
    }

    /// The serialized secret view, for storage at rest by this client only.
    pub fn secret_context(&self) -> Result<Vec<u8>> {
        Ok(self.secret_view()?.serialize(true))
    }

    /// Encrypt every valid vote produced by `source`.
    ///
    /// Invalid votes are reported to the source and skipped; the source may
    /// then yield a replacement. Any other error aborts ingestion.
    pub fn encrypt_ballots<S: VoteSource + ?Sized>(
        &mut self,
        source: &mut S,
    ) -> Result<BallotReceipt> {
        self.require(&[SessionState::KeyMaterialIssued], "KeyMaterialIssued")?;
        let view = self.secret_view()?;
        let candidates = self.roster.len();

        let mut ballots = Vec::new();
        let mut rejected = 0;
        while let Some(event) = source.next_vote() {
            let choice = match self.roster.validate(&event) {
                Ok(choice) => choice,
                Err(e) => {
                    warn!(ballot = ballots.len(), "rejected vote: {e}");
                    source.rejected(&event, &e);
                    rejected += 1;
                    continue;
                }
            };
            let plaintext = Zeroizing::new(self.config.encoding.encode(choice, candidates));
            ballots.push(Ciphertext::encrypt(view, &plaintext)?);
        }

        let receipt = BallotReceipt {
            accepted: ballots.len(),
            rejected,
        };
        info!(accepted = receipt.accepted, rejected, "encrypted ballots");
        self.encrypted = ballots;
        self.workload = Some(Workload::Ballots);
        self.transition(SessionState::BallotsEncrypted);
        Ok(receipt)
    }

    /// Encrypt a probe and a reference feature vector of equal length.
    pub fn encrypt_vectors(&mut self, probe: &[f64], reference: &[f64]) -> Result<()> {
        self.require(&[SessionState::KeyMaterialIssued], "KeyMaterialIssued")?;
        validate_feature_vector(probe)?;
        validate_feature_vector(reference)?;
        if probe.len() != reference.len() {
            return Err(Error::DimensionMismatch(probe.len(), reference.len()));
        }
        let view = self.secret_view()?;
        check_distance_capacity(view, probe, reference)?;
        self.encrypted = vec![
            Ciphertext::encrypt(view, probe)?,
            Ciphertext::encrypt(view, reference)?,
        ];
        info!(dimension = probe.len(), "encrypted feature vectors");
        self.workload = Some(Workload::Vectors);
        self.transition(SessionState::VectorsEncrypted);
        Ok(())
    }

    /// Encrypted ballots or vectors awaiting submission.
    pub fn encrypted_inputs(&self) -> &[Ciphertext] {
        &self.encrypted
    }

    /// Serialize the encrypted inputs for the compute party holding the public
    /// view of generation `recipient`.
    pub fn submit(&mut self, recipient: Generation) -> Result<Vec<u8>> {
        self.require(
            &[SessionState::BallotsEncrypted, SessionState::VectorsEncrypted],
            "BallotsEncrypted or VectorsEncrypted",
        )?;
        let generation = self.secret_view()?.generation();
        if recipient != generation {
            return Err(Error::generation_mismatch(generation, recipient));
        }
        let workload = self.workload.ok_or(Error::InvalidState {
            expected: "BallotsEncrypted or VectorsEncrypted",
            found: self.state.name(),
        })?;
        let bytes = Submission {
            generation,
            workload,
            ciphertexts: std::mem::take(&mut self.encrypted),
        }
        .to_bytes();
        self.transition(SessionState::Submitted);
        Ok(bytes)
    }

    /// The equality oracle lent to the compute party during a pairwise tally.
    ///
    /// Every call reveals to the compute party whether two ballots are equal;
    /// see the [`tally`](crate::tally) module for the trade-off.
    pub fn comparison_oracle(&self) -> Result<SecretEqualityOracle<'_>> {
        self.require(&[SessionState::Submitted], "Submitted")?;
        SecretEqualityOracle::new(self.secret_view()?, self.config.tolerance)
    }

    /// Accept the serialized result of the compute party.
    pub fn receive_result(&mut self, bytes: &[u8]) -> Result<()> {
        self.require(&[SessionState::Submitted], "Submitted")?;
        let mut outcome = ComputeOutcome::from_bytes(bytes)?;
        if Some(outcome.workload()) != self.workload {
            return Err(Error::malformed("result for a different workload"));
        }
        outcome.link(self.secret_view()?)?;
        self.outcome = Some(outcome);
        self.transition(SessionState::ResultReceived);
        Ok(())
    }

    /// The received outcome, checked to hold a distance or a tally.
    fn outcome(&self, distance: bool) -> Result<&ComputeOutcome> {
        self.require(&[SessionState::ResultReceived], "ResultReceived")?;
        match &self.outcome {
            Some(ComputeOutcome::SquaredDistance(_)) if !distance => Err(Error::InvalidInput(
                "the result holds a distance, not a tally".to_string(),
            )),
            Some(ComputeOutcome::GroupCounts(_) | ComputeOutcome::CandidateCounts(_))
                if distance =>
            {
                Err(Error::InvalidInput(
                    "the result holds a tally, not a distance".to_string(),
                ))
            }
            Some(outcome) => Ok(outcome),
            None => Err(Error::InvalidState {
                expected: "ResultReceived",
                found: self.state.name(),
            }),
        }
    }

    /// Decrypt a tally result into counts.
    ///
    /// Pairwise tallies yield one entry per group of equal ballots, labelled
    /// `group-<id>`; additive tallies yield one entry per candidate. The
    /// result is kept for another attempt if decryption fails.
    pub fn decrypt_tally(&mut self) -> Result<TallyReport> {
        let view = self.secret_view()?;
        let entries = match self.outcome(false)? {
            ComputeOutcome::GroupCounts(result) => result
                .groups()
                .iter()
                .map(|(id, count)| {
                    Ok(TallyEntry {
                        label: format!("group-{}", id.0),
                        count: to_count(count.decrypt(view)?[0]),
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            ComputeOutcome::CandidateCounts(counts) => {
                if counts.slots() != self.roster.len() {
                    return Err(Error::DimensionMismatch(counts.slots(), self.roster.len()));
                }
                counts
                    .decrypt(view)?
                    .into_iter()
                    .zip(self.roster.names())
                    .map(|(count, name)| TallyEntry {
                        label: name.clone(),
                        count: to_count(count),
                    })
                    .collect()
            }
            ComputeOutcome::SquaredDistance(_) => {
                return Err(Error::InvalidInput(
                    "the result holds a distance, not a tally".to_string(),
                ))
            }
        };
        let report = TallyReport { entries };
        info!(entries = report.entries.len(), total = report.total(), "decrypted tally");
        self.outcome = None;
        self.transition(SessionState::Decrypted);
        Ok(report)
    }

    /// Decrypt a squared distance and apply the session's match policy.
    pub fn decrypt_distance(&mut self) -> Result<MatchDecision> {
        let start = Instant::now();
        let squared = match self.outcome(true)? {
            ComputeOutcome::SquaredDistance(ct) => ct.decrypt(self.secret_view()?)?[0],
            _ => {
                return Err(Error::InvalidInput(
                    "the result holds a tally, not a distance".to_string(),
                ))
            }
        };
        let mut decision = MatchPolicy::new(self.config.distance_threshold)?.decide(squared)?;
        decision.elapsed = start.elapsed();
        info!(same_subject = decision.same_subject, "decrypted distance");
        self.outcome = None;
        self.transition(SessionState::Decrypted);
        Ok(decision)
    }

    /// Release all key and ciphertext material. Allowed from any state.
    pub fn close(&mut self) {
        self.encrypted.clear();
        self.outcome = None;
        self.workload = None;
        self.secret = None;
        if self.state != SessionState::Closed {
            self.transition(SessionState::Closed);
        }
    }
}

fn to_count(value: f64) -> u64 {
    value.round().max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::{ClientSession, TallyEntry, TallyReport};
    use crate::ciphertext::Ciphertext;
    use crate::config::{HeParameters, SessionConfig};
    use crate::proto::ComputeResult;
    use crate::session::{ComputeOutcome, ComputeParty, SessionState};
    use crate::votes::VoteQueue;
    use crate::Error;
    use prost::Message;
    use std::error::Error as StdError;

    fn config() -> SessionConfig {
        SessionConfig {
            parameters: HeParameters::for_tests(),
            candidates: vec!["A".into(), "B".into(), "C".into()],
            ..SessionConfig::default()
        }
    }

    #[test]
    fn report_ranking() {
        let entry = |label: &str, count| TallyEntry {
            label: label.to_string(),
            count,
        };
        let report = TallyReport {
            entries: vec![entry("A", 2), entry("B", 5), entry("C", 5), entry("D", 0)],
        };
        assert_eq!(report.total(), 12);
        assert_eq!(report.winner().map(|e| e.label.as_str()), Some("B"));
        assert_eq!(report.count_multiset(), vec![0, 2, 5, 5]);
        assert!(TallyReport::default().winner().is_none());
    }

    #[test]
    fn transitions_are_enforced() -> Result<(), Box<dyn StdError>> {
        let mut session = ClientSession::new(config())?;
        assert_eq!(session.state(), SessionState::Created);
        assert!(matches!(
            session.encrypt_ballots(&mut VoteQueue::new([1])),
            Err(Error::InvalidState { found: "Created", .. })
        ));
        assert!(matches!(session.secret_context(), Err(Error::NoSecretKey)));

        session.issue_key_material()?;
        assert!(matches!(
            session.issue_key_material(),
            Err(Error::InvalidState { .. })
        ));
        assert!(matches!(session.decrypt_tally(), Err(Error::InvalidState { .. })));

        let receipt = session.encrypt_ballots(&mut VoteQueue::new([1, 0, 3, 4]))?;
        assert_eq!(receipt.accepted, 2);
        assert_eq!(receipt.rejected, 2);
        assert_eq!(session.state(), SessionState::BallotsEncrypted);
        assert!(matches!(
            session.encrypt_vectors(&[1.0], &[1.0]),
            Err(Error::InvalidState { .. })
        ));

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.generation().is_none());
        Ok(())
    }

    #[test]
    fn submit_checks_recipient_generation() -> Result<(), Box<dyn StdError>> {
        let mut session = ClientSession::new(config())?;
        session.issue_key_material()?;
        session.encrypt_ballots(&mut VoteQueue::new([2]))?;
        let generation = session.generation().ok_or("no generation")?;
        let other = crate::keyring::Generation::from(generation.value() ^ 1);
        assert!(matches!(
            session.submit(other),
            Err(Error::ContextMismatch(_))
        ));
        assert_eq!(session.state(), SessionState::BallotsEncrypted);
        session.submit(generation)?;
        assert_eq!(session.state(), SessionState::Submitted);
        Ok(())
    }

    #[test]
    fn vectors_are_validated() -> Result<(), Box<dyn StdError>> {
        let mut session = ClientSession::new(config())?;
        session.issue_key_material()?;
        assert!(matches!(
            session.encrypt_vectors(&[1.0, 2.0], &[1.0]),
            Err(Error::DimensionMismatch(2, 1))
        ));
        assert!(matches!(
            session.encrypt_vectors(&[], &[]),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(session.state(), SessionState::KeyMaterialIssued);
        session.encrypt_vectors(&[1.0, 2.0], &[1.5, 2.0])?;
        assert_eq!(session.state(), SessionState::VectorsEncrypted);
        Ok(())
    }

    #[test]
    fn distances_beyond_capacity_are_refused() -> Result<(), Box<dyn StdError>> {
        let mut session = ClientSession::new(config())?;
        session.issue_key_material()?;
        // 128 * 40^2 is far beyond what a 36-bit modulus holds at scale 2^24.
        assert!(matches!(
            session.encrypt_vectors(&[40.0; 128], &[0.0; 128]),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(session.state(), SessionState::KeyMaterialIssued);
        assert!(session.encrypted_inputs().is_empty());

        let party = ComputeParty::from_public_context(&session.public_context()?)?;
        session.encrypt_vectors(&[3.0; 128], &[0.0; 128])?;
        let submission = session.submit(party.generation())?;
        session.receive_result(&party.squared_distance(&submission)?)?;
        let decision = session.decrypt_distance()?;
        assert!((decision.distance - 1152f64.sqrt()).abs() < 1e-6);
        assert!(!decision.same_subject);
        Ok(())
    }

    #[test]
    fn tampered_scale_exponent_is_rejected() -> Result<(), Box<dyn StdError>> {
        let mut session = ClientSession::new(config())?;
        let party = ComputeParty::from_public_context(&session.issue_key_material()?)?;
        session.encrypt_vectors(&[1.0, 2.0], &[2.0, 2.0])?;
        let submission = session.submit(party.generation())?;
        let honest = party.squared_distance(&submission)?;

        let mut result = ComputeResult::decode(honest.as_slice())?;
        for exponent in [u32::MAX / 4, 3] {
            result.value.as_mut().ok_or("no value")?.scale_exponent = exponent;
            assert!(matches!(
                session.receive_result(&result.encode_to_vec()),
                Err(Error::Serialization(_))
            ));
            assert_eq!(session.state(), SessionState::Submitted);
        }

        session.receive_result(&honest)?;
        assert_eq!(session.decrypt_distance()?.distance, 1.0);
        Ok(())
    }

    #[test]
    fn failed_decryption_keeps_the_result() -> Result<(), Box<dyn StdError>> {
        let mut session = ClientSession::new(config())?;
        session.issue_key_material()?;
        session.encrypt_ballots(&mut VoteQueue::new([1, 2]))?;
        let generation = session.generation().ok_or("no generation")?;
        session.submit(generation)?;

        // Two counts for a roster of three candidates.
        let counts = Ciphertext::encrypt(session.secret_view()?, &[1.0, 1.0])?;
        session.receive_result(&ComputeOutcome::CandidateCounts(counts).to_bytes())?;
        for _ in 0..2 {
            assert!(matches!(
                session.decrypt_tally(),
                Err(Error::DimensionMismatch(2, 3))
            ));
            assert_eq!(session.state(), SessionState::ResultReceived);
            assert!(session.outcome.is_some());
        }
        Ok(())
    }

    #[test]
    fn resume_from_secret_context() -> Result<(), Box<dyn StdError>> {
        let mut session = ClientSession::new(config())?;
        let public = session.issue_key_material()?;
        let stored = session.secret_context()?;

        let resumed = ClientSession::resume(config(), &stored)?;
        assert_eq!(resumed.state(), SessionState::KeyMaterialIssued);
        assert_eq!(resumed.generation(), session.generation());

        assert!(matches!(
            ClientSession::resume(config(), &public),
            Err(Error::NoSecretKey)
        ));
        let other = SessionConfig {
            parameters: HeParameters {
                scale_bits: 10,
                ..HeParameters::for_tests()
            },
            ..config()
        };
        assert!(matches!(
            ClientSession::resume(other, &stored),
            Err(Error::ContextMismatch(_))
        ));
        Ok(())
    }
}
