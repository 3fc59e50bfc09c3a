//! Client and compute-party sessions.
//!
//! A [`ClientSession`] walks through
//! `Created → KeyMaterialIssued → BallotsEncrypted | VectorsEncrypted →
//! Submitted → ResultReceived → Decrypted → Closed`, one direction only. The
//! [`ComputeParty`] is stateless between requests and only ever holds a
//! public view.

mod client;
mod compute;

pub use client::{BallotReceipt, ClientSession, TallyEntry, TallyReport};
pub use compute::ComputeParty;

use prost::Message;

use crate::ciphertext::Ciphertext;
use crate::keyring::{ContextView, Generation};
use crate::proto::{
    ComputeResult, ResultKind, Submission as SubmissionProto, WorkloadKind,
};
use crate::tally::TallyResult;
use crate::{Error, Result};

/// States of a [`ClientSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No context generated yet.
    Created,
    /// The secret view is held by the client; the public view was exported.
    KeyMaterialIssued,
    /// Ballots were encrypted and their plaintexts released.
    BallotsEncrypted,
    /// Feature vectors were encrypted and their plaintexts released.
    VectorsEncrypted,
    /// Ciphertexts were handed to the compute party.
    Submitted,
    /// An encrypted result came back.
    ResultReceived,
    /// The result was decrypted.
    Decrypted,
    /// Terminal; all key and ciphertext material was released.
    Closed,
}

impl SessionState {
    /// Name of the state, for errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::KeyMaterialIssued => "KeyMaterialIssued",
            Self::BallotsEncrypted => "BallotsEncrypted",
            Self::VectorsEncrypted => "VectorsEncrypted",
            Self::Submitted => "Submitted",
            Self::ResultReceived => "ResultReceived",
            Self::Decrypted => "Decrypted",
            Self::Closed => "Closed",
        }
    }
}

/// What a submission carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    /// Encrypted ballots to tally.
    Ballots,
    /// Two encrypted feature vectors to compare.
    Vectors,
}

impl From<Workload> for WorkloadKind {
    fn from(workload: Workload) -> Self {
        match workload {
            Workload::Ballots => WorkloadKind::Ballots,
            Workload::Vectors => WorkloadKind::Vectors,
        }
    }
}

impl From<WorkloadKind> for Workload {
    fn from(kind: WorkloadKind) -> Self {
        match kind {
            WorkloadKind::Ballots => Workload::Ballots,
            WorkloadKind::Vectors => Workload::Vectors,
        }
    }
}

/// Ciphertexts crossing from the client to the compute party.
pub(crate) struct Submission {
    pub(crate) generation: Generation,
    pub(crate) workload: Workload,
    pub(crate) ciphertexts: Vec<Ciphertext>,
}

impl Submission {
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        SubmissionProto {
            generation: self.generation.value(),
            kind: WorkloadKind::from(self.workload) as i32,
            ciphertexts: self.ciphertexts.iter().map(Ciphertext::to_envelope).collect(),
        }
        .encode_to_vec()
    }

    /// Decode a submission. Every ciphertext is left lazy.
    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let proto = SubmissionProto::decode(bytes).map_err(|_| Error::malformed("submission"))?;
        let generation = Generation::from(proto.generation);
        let workload = WorkloadKind::try_from(proto.kind)
            .map_err(|_| Error::malformed("submission workload"))?
            .into();
        let ciphertexts = proto
            .ciphertexts
            .into_iter()
            .map(|envelope| {
                let ct = Ciphertext::from_envelope(envelope)?;
                if ct.generation() != generation {
                    return Err(Error::generation_mismatch(generation, ct.generation()));
                }
                Ok(ct)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            generation,
            workload,
            ciphertexts,
        })
    }
}

/// Encrypted result returned by the compute party.
#[derive(Debug)]
pub(crate) enum ComputeOutcome {
    GroupCounts(TallyResult),
    CandidateCounts(Ciphertext),
    SquaredDistance(Ciphertext),
}

impl ComputeOutcome {
    pub(crate) fn generation(&self) -> Generation {
        match self {
            Self::GroupCounts(result) => result.generation(),
            Self::CandidateCounts(ct) | Self::SquaredDistance(ct) => ct.generation(),
        }
    }

    pub(crate) fn workload(&self) -> Workload {
        match self {
            Self::GroupCounts(_) | Self::CandidateCounts(_) => Workload::Ballots,
            Self::SquaredDistance(_) => Workload::Vectors,
        }
    }

    pub(crate) fn link(&mut self, view: &ContextView) -> Result<()> {
        match self {
            Self::GroupCounts(result) => result
                .groups_mut()
                .iter_mut()
                .try_for_each(|(_, count)| count.link(view)),
            Self::CandidateCounts(ct) | Self::SquaredDistance(ct) => ct.link(view),
        }
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let single = |kind: ResultKind, ct: &Ciphertext| ComputeResult {
            generation: ct.generation().value(),
            kind: kind as i32,
            groups: vec![],
            value: Some(ct.to_envelope()),
        };
        let proto = match self {
            Self::GroupCounts(result) => result.to_proto(),
            Self::CandidateCounts(ct) => single(ResultKind::CandidateCounts, ct),
            Self::SquaredDistance(ct) => single(ResultKind::SquaredDistance, ct),
        };
        proto.encode_to_vec()
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let proto = ComputeResult::decode(bytes).map_err(|_| Error::malformed("result"))?;
        let kind = ResultKind::try_from(proto.kind).map_err(|_| Error::malformed("result kind"))?;
        if kind == ResultKind::GroupCounts {
            return Ok(Self::GroupCounts(TallyResult::from_proto(proto)?));
        }

        let generation = Generation::from(proto.generation);
        let ct = proto
            .value
            .ok_or_else(|| Error::malformed("result value"))
            .and_then(Ciphertext::from_envelope)?;
        if ct.generation() != generation {
            return Err(Error::generation_mismatch(generation, ct.generation()));
        }
        Ok(match kind {
            ResultKind::CandidateCounts => Self::CandidateCounts(ct),
            _ => Self::SquaredDistance(ct),
        })
    }
}
