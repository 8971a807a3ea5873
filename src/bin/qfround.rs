//! Command-line driver for quadratic-funding rounds.
//!
//! Computes tallies, claim proofs and allocations from files, and walks a
//! persisted round state file through its lifecycle one command at a time.

use num_bigint::BigUint;
use qf_round::arith::parse_uint;
use qf_round::claim::{tally_results_batch, upload_ranges};
use qf_round::{
    compute_allocations, compute_claim_data, compute_tally, derive_alpha, DeploymentRegistry,
    FinalizeRequest, FundingRound, KeccakFieldCommitment, MessageLog, RoundConfig,
    TallyCommitments, TallyData, TallyParams,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

const SCHEME: KeccakFieldCommitment = KeccakFieldCommitment;

fn fatal(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

fn init_logging() {
    let filter = env::var("QF_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn,qf_round=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_logging();
    let mut args = env::args().skip(1);
    let command = args.next();
    match command.as_deref() {
        Some("tally") => cmd_tally(args.collect()),
        Some("claim-data") => cmd_claim_data(args.collect()),
        Some("allocate") => cmd_allocate(args.collect()),
        Some("alpha") => cmd_alpha(args.collect()),
        Some("upload-plan") => cmd_upload_plan(args.collect()),
        Some("round") => {
            let sub = args.next().unwrap_or_else(|| {
                print_round_help();
                std::process::exit(1);
            });
            handle_round(&sub, args.collect());
        }
        _ => {
            eprintln!("Usage: qfround <tally|claim-data|allocate|alpha|upload-plan|round> ...");
            std::process::exit(1);
        }
    }
}

fn print_round_help() {
    println!("Usage: qfround round <init|contribute|close|submit-tally|upload|finalize|claim|cancel|withdraw|show> ...");
    println!("  init --config <file> --state <file>");
    println!("  contribute --state <file> --contributor <addr> --amount <N>");
    println!("  close --state <file> --deadline <unix_secs> [--now <unix_secs>]");
    println!("  submit-tally --state <file> --tally <file> (--commitments <file> | --trust-recorded)");
    println!("  upload --state <file> --tally <file> [--batch-size <N>]");
    println!("  finalize --state <file> --tally <file> [--alpha <N> | --config <file>]");
    println!("  claim --state <file> --recipient <N>");
    println!("  cancel --state <file>");
    println!("  withdraw --state <file> --contributor <addr>");
    println!("  show --state <file>");
}

/// `--name value` options plus bare `--switch` flags.
struct Flags {
    values: BTreeMap<String, String>,
    switches: Vec<String>,
}

impl Flags {
    fn parse(args: Vec<String>, valued: &[&str], switches: &[&str]) -> Self {
        let mut values = BTreeMap::new();
        let mut set = Vec::new();
        let mut iter = args.into_iter();
        while let Some(arg) = iter.next() {
            if valued.contains(&arg.as_str()) {
                let value = iter
                    .next()
                    .unwrap_or_else(|| fatal(&format!("{arg} expects a value")));
                values.insert(arg, value);
            } else if switches.contains(&arg.as_str()) {
                set.push(arg);
            } else {
                fatal(&format!("unknown argument: {arg}"));
            }
        }
        Self {
            values,
            switches: set,
        }
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    fn required(&self, name: &str) -> &str {
        self.get(name)
            .unwrap_or_else(|| fatal(&format!("{name} is required")))
    }

    fn path(&self, name: &str) -> PathBuf {
        PathBuf::from(self.required(name))
    }

    fn uint(&self, name: &str) -> Option<BigUint> {
        self.get(name).map(|raw| {
            parse_uint(raw).unwrap_or_else(|err| fatal(&format!("invalid {name}: {err}")))
        })
    }

    fn usize(&self, name: &str) -> Option<usize> {
        self.get(name).map(|raw| {
            raw.parse()
                .unwrap_or_else(|_| fatal(&format!("invalid {name}: {raw}")))
        })
    }

    fn switch(&self, name: &str) -> bool {
        self.switches.iter().any(|s| s == name)
    }
}

fn wants_help(args: &[String]) -> bool {
    args.iter().any(|a| a == "-h" || a == "--help")
}

fn print_json<T: Serialize>(value: &T) {
    let pretty = serde_json::to_string_pretty(value)
        .unwrap_or_else(|err| fatal(&format!("failed to encode output: {err}")));
    println!("{pretty}");
}

fn emit_json<T: Serialize>(value: &T, output: Option<&str>) {
    match output {
        Some(path) => qf_round::io::write_json(Path::new(path), value)
            .unwrap_or_else(|err| fatal(&err.to_string())),
        None => print_json(value),
    }
}

fn load_tally(path: &Path) -> TallyData {
    let data = TallyData::load(path).unwrap_or_else(|err| fatal(&err.to_string()));
    data.validate()
        .unwrap_or_else(|err| fatal(&format!("bad tally file {}: {err}", path.display())));
    data
}

fn load_round(path: &Path) -> FundingRound {
    FundingRound::load(path).unwrap_or_else(|err| {
        fatal(&format!("failed to load round state {}: {err}", path.display()))
    })
}

fn save_round(path: &Path, round: &FundingRound) {
    round.save(path).unwrap_or_else(|err| {
        fatal(&format!("failed to save round state {}: {err}", path.display()))
    });
}

fn cmd_tally(args: Vec<String>) {
    if wants_help(&args) {
        println!("Usage: qfround tally --log <file> --config <file> --output <file>");
        println!("  [--seed <hex>] [--deployments <file> --network <name>] [--report <file>]");
        return;
    }
    let flags = Flags::parse(
        args,
        &["--log", "--config", "--output", "--seed", "--deployments", "--network", "--report"],
        &[],
    );
    let mut config = RoundConfig::load(&flags.path("--config"))
        .unwrap_or_else(|err| fatal(&format!("bad config: {err}")));
    if let Some(seed) = flags.get("--seed") {
        config.salt_seed = Some(seed.to_string());
    }
    if let Some(deployments) = flags.get("--deployments") {
        let registry = DeploymentRegistry::load(Path::new(deployments))
            .unwrap_or_else(|err| fatal(&err.to_string()));
        config
            .resolve_maci(&registry, flags.required("--network"))
            .unwrap_or_else(|err| fatal(&err.to_string()));
    }
    if config.maci.trim().is_empty() {
        fatal("maci address missing: set it in the config or pass --deployments");
    }
    let salts = config
        .salt_source()
        .unwrap_or_else(|err| fatal(&err.to_string()));
    if config.salt_seed.is_none() {
        println!("salt seed: {}", salts.to_hex());
    }
    let log = MessageLog::load(&flags.path("--log")).unwrap_or_else(|err| fatal(&err.to_string()));
    let params = TallyParams::from_config(&config).unwrap_or_else(|err| fatal(&err.to_string()));
    let outcome = compute_tally(&log, &params, &salts, &SCHEME)
        .unwrap_or_else(|err| fatal(&format!("tally failed: {err}")));
    let output = flags.path("--output");
    outcome
        .data
        .save(&output)
        .unwrap_or_else(|err| fatal(&err.to_string()));
    if let Some(report) = flags.get("--report") {
        emit_json(&outcome.report, Some(report));
    }
    println!("recipients: {}", outcome.tally.recipient_count());
    println!("total spent: {}", outcome.tally.total_spent);
    println!("excluded messages: {}", outcome.report.excluded.len());
    println!("over-budget contributors: {}", outcome.report.over_budget.len());
    println!("tally: {}", output.display());
}

fn cmd_claim_data(args: Vec<String>) {
    if wants_help(&args) {
        println!("Usage: qfround claim-data --tally <file> --recipient <N> [--output <file>]");
        return;
    }
    let flags = Flags::parse(args, &["--tally", "--recipient", "--output"], &[]);
    let data = load_tally(&flags.path("--tally"));
    let recipient = flags
        .usize("--recipient")
        .unwrap_or_else(|| fatal("--recipient is required"));
    let claim = compute_claim_data(&data, recipient, &SCHEME)
        .unwrap_or_else(|err| fatal(&format!("claim data failed: {err}")));
    emit_json(&claim, flags.get("--output"));
}

fn cmd_allocate(args: Vec<String>) {
    if wants_help(&args) {
        println!("Usage: qfround allocate --tally <file> --factor <N> (--alpha <N> | --budget <N>) [--output <file>]");
        return;
    }
    let flags = Flags::parse(
        args,
        &["--tally", "--factor", "--alpha", "--budget", "--output"],
        &[],
    );
    let data = load_tally(&flags.path("--tally"));
    let factor = flags
        .uint("--factor")
        .unwrap_or_else(|| fatal("--factor is required"));
    let alpha = match (flags.uint("--alpha"), flags.uint("--budget")) {
        (Some(alpha), None) => alpha,
        (None, Some(budget)) => alpha_for(&data, &budget, &factor),
        _ => fatal("pass exactly one of --alpha or --budget"),
    };
    let allocations = compute_allocations(&data, &alpha, &factor)
        .unwrap_or_else(|err| fatal(&format!("allocation failed: {err}")));
    eprintln!("alpha: {alpha}");
    emit_json(&allocations, flags.get("--output"));
}

fn alpha_for(data: &TallyData, budget: &BigUint, factor: &BigUint) -> BigUint {
    derive_alpha(
        budget,
        &data.quadratic_weight_total(),
        &data.total_spent_voice_credits.spent,
        factor,
    )
    .unwrap_or_else(|err| fatal(&format!("alpha derivation failed: {err}")))
}

fn cmd_alpha(args: Vec<String>) {
    if wants_help(&args) {
        println!("Usage: qfround alpha --tally <file> --budget <N> --factor <N>");
        return;
    }
    let flags = Flags::parse(args, &["--tally", "--budget", "--factor"], &[]);
    let data = load_tally(&flags.path("--tally"));
    let budget = flags
        .uint("--budget")
        .unwrap_or_else(|| fatal("--budget is required"));
    let factor = flags
        .uint("--factor")
        .unwrap_or_else(|| fatal("--factor is required"));
    println!("{}", alpha_for(&data, &budget, &factor));
}

fn cmd_upload_plan(args: Vec<String>) {
    if wants_help(&args) {
        println!("Usage: qfround upload-plan --tally <file> [--uploaded <N>] [--batch-size <N>]");
        return;
    }
    let flags = Flags::parse(args, &["--tally", "--uploaded", "--batch-size"], &[]);
    let data = load_tally(&flags.path("--tally"));
    let uploaded = flags.usize("--uploaded").unwrap_or(0);
    let batch_size = flags
        .usize("--batch-size")
        .unwrap_or(qf_round::config::DEFAULT_BATCH_SIZE);
    let ranges = upload_ranges(data.recipient_count(), uploaded, batch_size)
        .unwrap_or_else(|err| fatal(&err.to_string()));
    print_json(&ranges);
}

fn handle_round(sub: &str, tail: Vec<String>) {
    match sub {
        "init" => cmd_round_init(tail),
        "contribute" => cmd_round_contribute(tail),
        "close" => cmd_round_close(tail),
        "submit-tally" => cmd_round_submit_tally(tail),
        "upload" => cmd_round_upload(tail),
        "finalize" => cmd_round_finalize(tail),
        "claim" => cmd_round_claim(tail),
        "cancel" => cmd_round_cancel(tail),
        "withdraw" => cmd_round_withdraw(tail),
        "show" => cmd_round_show(tail),
        "-h" | "--help" => print_round_help(),
        other => fatal(&format!("unknown round command: {other}")),
    }
}

fn cmd_round_init(args: Vec<String>) {
    let flags = Flags::parse(args, &["--config", "--state"], &["--force"]);
    let state = flags.path("--state");
    if state.exists() && !flags.switch("--force") {
        fatal(&format!(
            "{} already exists (pass --force to overwrite)",
            state.display()
        ));
    }
    let config = RoundConfig::load(&flags.path("--config"))
        .unwrap_or_else(|err| fatal(&format!("bad config: {err}")));
    let round = config
        .open_round()
        .unwrap_or_else(|err| fatal(&err.to_string()));
    save_round(&state, &round);
    println!(
        "round opened: recipients={} registry={} state={}",
        round.recipient_count(),
        config.recipient_registry.label(),
        state.display()
    );
}

fn cmd_round_contribute(args: Vec<String>) {
    let flags = Flags::parse(args, &["--state", "--contributor", "--amount"], &[]);
    let state = flags.path("--state");
    let mut round = load_round(&state);
    let amount = flags
        .uint("--amount")
        .unwrap_or_else(|| fatal("--amount is required"));
    round
        .contribute(flags.required("--contributor"), amount)
        .unwrap_or_else(|err| fatal(&err.to_string()));
    save_round(&state, &round);
    println!("total contributions: {}", round.total_contributions());
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_else(|err| fatal(&format!("system clock before epoch: {err}")))
}

fn cmd_round_close(args: Vec<String>) {
    let flags = Flags::parse(args, &["--state", "--deadline", "--now"], &[]);
    let state = flags.path("--state");
    let mut round = load_round(&state);
    let parse_secs = |name: &str| {
        flags.get(name).map(|raw| {
            raw.parse::<u64>()
                .unwrap_or_else(|_| fatal(&format!("invalid {name}: {raw}")))
        })
    };
    let deadline = parse_secs("--deadline").unwrap_or_else(|| fatal("--deadline is required"));
    let now = parse_secs("--now").unwrap_or_else(unix_now);
    round
        .close_voting(now >= deadline)
        .unwrap_or_else(|err| fatal(&err.to_string()));
    save_round(&state, &round);
    println!("phase: {}", round.phase());
}

fn cmd_round_submit_tally(args: Vec<String>) {
    let flags = Flags::parse(
        args,
        &["--state", "--tally", "--commitments"],
        &["--trust-recorded"],
    );
    let state = flags.path("--state");
    let mut round = load_round(&state);
    let data = load_tally(&flags.path("--tally"));
    let committed: TallyCommitments = match flags.get("--commitments") {
        Some(path) => {
            qf_round::io::read_json(Path::new(path)).unwrap_or_else(|err| fatal(&err.to_string()))
        }
        None if flags.switch("--trust-recorded") => {
            tracing::warn!("accepting the commitments recorded in the tally file itself");
            data.recorded_commitments()
                .unwrap_or_else(|err| fatal(&err.to_string()))
        }
        None => fatal(
            "pass --commitments with the published commitments, or --trust-recorded to accept the tally file's own",
        ),
    };
    round
        .submit_tally(&committed, &data, &SCHEME)
        .unwrap_or_else(|err| fatal(&format!("tally rejected: {err}")));
    save_round(&state, &round);
    println!("phase: {}", round.phase());
    if let Some(checksum) = round.tally_checksum() {
        println!("tally checksum: {checksum}");
    }
}

fn cmd_round_upload(args: Vec<String>) {
    let flags = Flags::parse(args, &["--state", "--tally", "--batch-size"], &[]);
    let state = flags.path("--state");
    let mut round = load_round(&state);
    let data = load_tally(&flags.path("--tally"));
    round
        .verify_tally_checksum(&data)
        .unwrap_or_else(|err| fatal(&err.to_string()));
    let batch_size = flags
        .usize("--batch-size")
        .unwrap_or(qf_round::config::DEFAULT_BATCH_SIZE);
    let ranges = upload_ranges(round.recipient_count(), round.uploaded_count(), batch_size)
        .unwrap_or_else(|err| fatal(&err.to_string()));
    for range in ranges {
        let batch = tally_results_batch(&data, range.start, range.end - range.start, &SCHEME)
            .unwrap_or_else(|err| fatal(&err.to_string()));
        let uploaded = round
            .upload_tally_batch(range.start, &batch, &SCHEME)
            .unwrap_or_else(|err| fatal(&format!("upload failed at {}: {err}", range.start)));
        // persist after each batch so an interrupted upload resumes here
        save_round(&state, &round);
        println!("uploaded {uploaded}/{}", round.recipient_count());
    }
}

fn cmd_round_finalize(args: Vec<String>) {
    let flags = Flags::parse(args, &["--state", "--tally", "--alpha", "--config"], &[]);
    let state = flags.path("--state");
    let mut round = load_round(&state);
    let data = load_tally(&flags.path("--tally"));
    let configured = flags.get("--config").and_then(|path| {
        RoundConfig::load(Path::new(path))
            .unwrap_or_else(|err| fatal(&format!("bad config: {err}")))
            .alpha
    });
    round
        .verify_tally_checksum(&data)
        .unwrap_or_else(|err| fatal(&err.to_string()));
    let request = FinalizeRequest {
        total_spent: data.total_spent_voice_credits.spent.clone(),
        total_spent_salt: data.total_spent_voice_credits.salt.clone(),
        alpha: flags.uint("--alpha").or(configured),
    };
    let alpha = round
        .finalize(request, &SCHEME)
        .unwrap_or_else(|err| fatal(&format!("finalization failed: {err}")));
    save_round(&state, &round);
    println!("alpha: {alpha}");
}

fn cmd_round_claim(args: Vec<String>) {
    let flags = Flags::parse(args, &["--state", "--recipient"], &[]);
    let state = flags.path("--state");
    let mut round = load_round(&state);
    let recipient = flags
        .usize("--recipient")
        .unwrap_or_else(|| fatal("--recipient is required"));
    let amount = round
        .claim(recipient)
        .unwrap_or_else(|err| fatal(&err.to_string()));
    save_round(&state, &round);
    println!("recipient {recipient} claimed {amount}");
}

fn cmd_round_cancel(args: Vec<String>) {
    let flags = Flags::parse(args, &["--state"], &[]);
    let state = flags.path("--state");
    let mut round = load_round(&state);
    round.cancel().unwrap_or_else(|err| fatal(&err.to_string()));
    save_round(&state, &round);
    println!("phase: {}", round.phase());
}

fn cmd_round_withdraw(args: Vec<String>) {
    let flags = Flags::parse(args, &["--state", "--contributor"], &[]);
    let state = flags.path("--state");
    let mut round = load_round(&state);
    let contributor = flags.required("--contributor");
    let amount = round
        .withdraw(contributor)
        .unwrap_or_else(|err| fatal(&err.to_string()));
    save_round(&state, &round);
    println!("refunded {amount} to {contributor}");
}

fn cmd_round_show(args: Vec<String>) {
    let flags = Flags::parse(args, &["--state"], &[]);
    print_json(&load_round(&flags.path("--state")));
}
