//! Encrypted voting and encrypted biometric matching between a client and a
//! compute party, run in one process and exchanging serialized artifacts.

mod util;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;
use fhe_protocol::artifact::{ArtifactKind, ArtifactStore};
use fhe_protocol::features::{EmbeddingFileExtractor, FeatureExtractor};
use fhe_protocol::votes::{VoteQueue, VoteSource};
use fhe_protocol::{BallotEncoding, ClientSession, ComputeParty, SessionConfig};
use rand::{distributions::Uniform, prelude::Distribution, thread_rng};
use tracing::info;
use tracing_subscriber::EnvFilter;
use util::{timeit, PromptVoteSource};

#[derive(Parser, Debug)]
#[command(author, version, about = "Privacy-preserving computation over BFV ciphertexts")]
struct Cli {
    /// Session configuration (JSON); flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory receiving the base64-armored artifacts of the session.
    #[arg(long, global = true)]
    artifacts: Option<PathBuf>,

    #[command(flatten)]
    parameters: ParameterArgs,

    /// Print the effective configuration as JSON before running.
    #[arg(long, global = true)]
    print_config: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Args, Debug)]
struct ParameterArgs {
    /// Ring degree (number of slots).
    #[arg(long, global = true)]
    degree: Option<usize>,

    /// Ciphertext modulus sizes in bits, comma-separated.
    #[arg(long, global = true, value_delimiter = ',')]
    moduli: Option<Vec<usize>>,

    /// Plaintext modulus size in bits.
    #[arg(long, global = true)]
    plaintext_bits: Option<usize>,

    /// Fixed-point scale, in bits.
    #[arg(long, global = true)]
    scale_bits: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Encrypt ballots, tally them on the compute party and announce the winner.
    Vote {
        /// Candidate names, comma-separated.
        #[arg(long, value_delimiter = ',', conflicts_with = "candidate_count")]
        candidates: Option<Vec<String>>,

        /// Number of anonymous candidates.
        #[arg(long)]
        candidate_count: Option<usize>,

        /// Votes as 1-based candidate indices, comma-separated. Prompts on
        /// standard input when omitted.
        #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
        votes: Option<Vec<i64>>,

        /// Number of voters to prompt for, or to draw at random with `--random`.
        #[arg(long, default_value_t = 5)]
        voters: usize,

        /// Draw random votes instead of prompting.
        #[arg(long, conflicts_with = "votes")]
        random: bool,

        /// Tally strategy.
        #[arg(long, value_enum, default_value_t = Mode::Pairwise)]
        mode: Mode,

        /// Squared-difference tolerance for pairwise equality, in (0, 1).
        #[arg(long)]
        tolerance: Option<f64>,
    },

    /// Compare two embeddings under encryption.
    Match {
        /// Embedding file of the probe image.
        #[arg(long)]
        probe: PathBuf,

        /// Embedding file of the reference image.
        #[arg(long)]
        reference: PathBuf,

        /// Distance under which both embeddings are the same subject.
        #[arg(long)]
        threshold: Option<f64>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Group equal scalar ballots; reveals equality bits to the compute party.
    Pairwise,
    /// Sum one-hot ballots per candidate; reveals nothing to the compute party.
    Additive,
}

fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_json_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => SessionConfig::default(),
    };
    let p = &cli.parameters;
    if let Some(degree) = p.degree {
        config.parameters.degree = degree;
    }
    if let Some(moduli) = &p.moduli {
        config.parameters.moduli_sizes = moduli.clone();
    }
    if let Some(bits) = p.plaintext_bits {
        config.parameters.plaintext_bits = bits;
    }
    if let Some(bits) = p.scale_bits {
        config.parameters.scale_bits = bits;
    }

    match &cli.cmd {
        Cmd::Vote {
            candidates,
            candidate_count,
            mode,
            tolerance,
            ..
        } => {
            if let Some(names) = candidates {
                config.candidates = names.clone();
            } else if let Some(count) = candidate_count {
                config.candidates = (1..=*count).map(|i| format!("Candidate{i}")).collect();
            }
            if let Some(tolerance) = tolerance {
                config.tolerance = *tolerance;
            }
            if *mode == Mode::Additive {
                config.encoding = BallotEncoding::OneHot;
            }
        }
        Cmd::Match { threshold, .. } => {
            if let Some(threshold) = threshold {
                config.distance_threshold = *threshold;
            }
        }
    }
    config.validate().context("invalid session configuration")?;
    Ok(config)
}

fn store(cli: &Cli) -> Result<Option<ArtifactStore>> {
    cli.artifacts
        .as_ref()
        .map(|dir| {
            info!(directory = %dir.display(), "writing session artifacts");
            ArtifactStore::open(dir)
                .with_context(|| format!("opening artifact directory {}", dir.display()))
        })
        .transpose()
}

fn save(store: &Option<ArtifactStore>, kind: ArtifactKind, bytes: &[u8]) -> Result<()> {
    if let Some(store) = store {
        let path = store
            .write(kind, bytes)
            .with_context(|| format!("writing artifact {kind}"))?;
        println!("\t{} {}", style("wrote").dim(), path.display());
    }
    Ok(())
}

/// Creates the session and the compute party, exporting both contexts.
fn setup(
    config: SessionConfig,
    store: &Option<ArtifactStore>,
) -> Result<(ClientSession, ComputeParty)> {
    let p = &config.parameters;
    println!("# Parameters");
    println!("\tdegree = {}", p.degree);
    println!("\tmoduli_sizes = {:?}", p.moduli_sizes);
    println!("\tplaintext_bits = {}", p.plaintext_bits);
    println!("\tscale = 2^{}", p.scale_bits);

    let mut client = ClientSession::new(config)?;
    let public = timeit!("Context generation", client.issue_key_material()?);
    save(store, ArtifactKind::PublicContext, &public)?;
    save(store, ArtifactKind::SecretContext, &client.secret_context()?)?;

    let party = timeit!(
        "Compute party setup",
        ComputeParty::from_public_context(&public)?
    );
    Ok((client, party))
}

fn run_vote(
    config: SessionConfig,
    store: &Option<ArtifactStore>,
    votes: Option<Vec<i64>>,
    voters: usize,
    random: bool,
    mode: Mode,
) -> Result<()> {
    let (mut client, party) = setup(config, store)?;
    let candidates = client.roster().len();

    println!("\n# Vote casting");
    let receipt = if let Some(votes) = votes {
        let mut source = VoteQueue::new(votes);
        let receipt = encrypt(&mut client, &mut source)?;
        for event in source.rejected_events() {
            println!("\t{} vote {} ignored", style("warning:").yellow().bold(), event.choice);
        }
        receipt
    } else if random {
        let dist = Uniform::new_inclusive(1i64, candidates as i64);
        let votes = dist.sample_iter(thread_rng()).take(voters);
        encrypt(&mut client, &mut VoteQueue::new(votes))?
    } else {
        let roster = client.roster().clone();
        encrypt(&mut client, &mut PromptVoteSource::stdin(&roster, voters))?
    };
    println!(
        "\t{} ballots encrypted, {} rejected",
        receipt.accepted, receipt.rejected
    );
    for (n, ballot) in client.encrypted_inputs().iter().enumerate() {
        save(store, ArtifactKind::Ballot(n), &ballot.serialize())?;
    }

    println!("\n# Tally");
    let submission = client.submit(party.generation())?;
    save(store, ArtifactKind::Submission, &submission)?;
    let result = match mode {
        Mode::Pairwise => {
            let oracle = client.comparison_oracle()?;
            let result = timeit!("Pairwise tally", party.tally(&submission, &oracle)?);
            println!(
                "\t{} the compute party learned {} equality bits",
                style("note:").cyan().bold(),
                oracle.revealed_bits()
            );
            result
        }
        Mode::Additive => timeit!(
            "Additive tally",
            party.tally_additive(&submission, candidates)?
        ),
    };
    save(store, ArtifactKind::Result, &result)?;
    client.receive_result(&result)?;

    println!("\n# Results");
    let report = timeit!("Decryption", client.decrypt_tally()?);
    for entry in &report.entries {
        println!("\t{}: {} votes", entry.label, entry.count);
    }
    match report.winner() {
        Some(winner) => println!(
            "\n{} {} with {} votes",
            style("Winner:").green().bold(),
            winner.label,
            winner.count
        ),
        None => println!("\n{}", style("No votes received").yellow()),
    }
    client.close();
    Ok(())
}

fn encrypt<S: VoteSource>(
    client: &mut ClientSession,
    source: &mut S,
) -> Result<fhe_protocol::session::BallotReceipt> {
    Ok(timeit!(
        "Ballot encryption",
        client.encrypt_ballots(source)?
    ))
}

fn run_match(
    config: SessionConfig,
    store: &Option<ArtifactStore>,
    probe: PathBuf,
    reference: PathBuf,
) -> Result<()> {
    let extractor = EmbeddingFileExtractor::new();
    let probe_vector = extractor
        .extract(&probe)
        .with_context(|| format!("reading embedding {}", probe.display()))?;
    let reference_vector = extractor
        .extract(&reference)
        .with_context(|| format!("reading embedding {}", reference.display()))?;
    if probe_vector.len() != reference_vector.len() {
        bail!(
            "embeddings have different dimensions ({} and {})",
            probe_vector.len(),
            reference_vector.len()
        );
    }

    let (mut client, party) = setup(config, store)?;
    println!("\n# Encryption");
    timeit!(
        "Embedding encryption",
        client.encrypt_vectors(&probe_vector, &reference_vector)?
    );
    for (n, vector) in client.encrypted_inputs().iter().enumerate() {
        save(store, ArtifactKind::Vector(n), &vector.serialize())?;
    }

    println!("\n# Encrypted distance");
    let submission = client.submit(party.generation())?;
    save(store, ArtifactKind::Submission, &submission)?;
    let result = timeit!("Squared distance", party.squared_distance(&submission)?);
    save(store, ArtifactKind::Result, &result)?;
    client.receive_result(&result)?;

    let threshold = client.config().distance_threshold;
    let decision = client.decrypt_distance()?;
    println!("\n# Decision");
    println!("\tdistance = {:.4} (threshold {threshold})", decision.distance);
    println!("\tdecrypted in {:?}", decision.elapsed);
    if decision.same_subject {
        println!("{}", style("Same subject").green().bold());
    } else {
        println!("{}", style("Different subjects").red().bold());
    }
    client.close();
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
    }
    let store = store(&cli)?;

    match cli.cmd {
        Cmd::Vote {
            votes,
            voters,
            random,
            mode,
            ..
        } => run_vote(config, &store, votes, voters, random, mode),
        Cmd::Match {
            probe, reference, ..
        } => run_match(config, &store, probe, reference),
    }
}
