use std::fs;
use std::io::{self, BufRead};
use std::path::Path;
use std::process;

use clap::{Parser, Subcommand};

use sylva_core::compose::LmComposerIncremental;
use sylva_core::decoder::{CfgLmDecoder, DecoderConfig};
use sylva_core::features::parse_weights;
use sylva_core::grammar::{parse_rule_table, trie::RuleFsm};
use sylva_core::lm::{load_arpa, LmData};
use sylva_core::{SparseVector, Vocab};

#[derive(Parser)]
#[command(name = "sylvad", about = "Syntax-based statistical MT decoder")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode stdin sentences with LM-integrated chart search
    Decode {
        /// Path to the rule table
        grammar: String,
        /// Path to an ARPA language model (repeatable)
        #[arg(long)]
        lm: Vec<String>,
        /// Path to the weights file
        #[arg(long)]
        weight_in: Option<String>,
        /// Number of translations to print per sentence
        #[arg(short, long, default_value = "1")]
        nbest: usize,
        /// Cube-pruning pop limit per span
        #[arg(long)]
        pop_limit: Option<usize>,
        /// Maximum recombined nodes per span
        #[arg(long)]
        chart_limit: Option<usize>,
        /// Root symbol for complete parses
        #[arg(long, default_value = "S")]
        root: String,
        /// Verbose logging to stderr
        #[arg(long)]
        debug: bool,
    },

    /// Decode without an LM, then rescore through the incremental composer
    Rescore {
        /// Path to the rule table
        grammar: String,
        /// Path to the ARPA language model
        #[arg(long)]
        lm: String,
        /// Path to the weights file
        #[arg(long)]
        weight_in: Option<String>,
        /// Number of translations to print per sentence
        #[arg(short, long, default_value = "1")]
        nbest: usize,
        /// Root symbol for complete parses
        #[arg(long, default_value = "S")]
        root: String,
        /// Verbose logging to stderr
        #[arg(long)]
        debug: bool,
    },
}

fn init_logging(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_writer(io::stderr)
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sylva_core=debug")),
            )
            .init();
    }
}

fn load_weights(vocab: &Vocab, path: &Option<String>) -> Result<SparseVector, String> {
    match path {
        Some(p) => {
            let text = fs::read_to_string(p).map_err(|e| format!("read {p}: {e}"))?;
            parse_weights(vocab, &text).map_err(|e| format!("parse {p}: {e}"))
        }
        None => Ok(SparseVector::new()),
    }
}

fn lm_data(vocab: &Vocab, path: &str, weights: &SparseVector) -> Result<LmData, String> {
    let lm = load_arpa(Path::new(path)).map_err(|e| format!("load LM {path}: {e}"))?;
    let mut data = LmData::new(lm, vocab, 1.0, 1.0);
    let w = weights.get(data.feature);
    let unk_w = weights.get(data.unk_feature);
    if w != 0.0 {
        data.weight = w;
    }
    if unk_w != 0.0 {
        data.unk_weight = unk_w;
    }
    Ok(data)
}

fn load_grammar(vocab: &Vocab, path: &str) -> Result<RuleFsm, String> {
    let text = fs::read_to_string(path).map_err(|e| format!("read {path}: {e}"))?;
    let rules = parse_rule_table(vocab, &text).map_err(|e| format!("parse {path}: {e}"))?;
    Ok(RuleFsm::from_rules(rules))
}

fn print_nbest(vocab: &Vocab, hg: &sylva_core::HyperGraph, nbest: usize) {
    let entries = hg.nbest(nbest);
    if entries.is_empty() {
        println!();
        return;
    }
    for entry in entries {
        println!("{} ||| {}", vocab.print_words(&entry.words), entry.score);
    }
}

fn run() -> Result<(), String> {
    let cli = Cli::parse();
    match cli.command {
        Command::Decode {
            grammar,
            lm,
            weight_in,
            nbest,
            pop_limit,
            chart_limit,
            root,
            debug,
        } => {
            init_logging(debug);
            let vocab = Vocab::new();
            let fsm = load_grammar(&vocab, &grammar)?;
            let weights = load_weights(&vocab, &weight_in)?;
            let lms = lm
                .iter()
                .map(|p| lm_data(&vocab, p, &weights))
                .collect::<Result<Vec<_>, _>>()?;
            let config = DecoderConfig {
                pop_limit,
                chart_limit,
                root_symbol: root,
            };
            let decoder = CfgLmDecoder::new(&vocab, &[&fsm], lms, weights, &config)
                .map_err(|e| e.to_string())?;
            for line in io::stdin().lock().lines() {
                let line = line.map_err(|e| e.to_string())?;
                let sent = vocab.parse_words(&line).map_err(|e| e.to_string())?;
                let hg = decoder.decode(&sent).map_err(|e| e.to_string())?;
                print_nbest(&vocab, &hg, nbest);
            }
            Ok(())
        }
        Command::Rescore {
            grammar,
            lm,
            weight_in,
            nbest,
            root,
            debug,
        } => {
            init_logging(debug);
            let vocab = Vocab::new();
            let fsm = load_grammar(&vocab, &grammar)?;
            let weights = load_weights(&vocab, &weight_in)?;
            let data = lm_data(&vocab, &lm, &weights)?;
            let config = DecoderConfig {
                root_symbol: root,
                ..Default::default()
            };
            let decoder =
                CfgLmDecoder::new(&vocab, &[&fsm], Vec::new(), weights, &config)
                    .map_err(|e| e.to_string())?;
            let composer =
                LmComposerIncremental::new(&vocab, vec![data]).map_err(|e| e.to_string())?;
            for line in io::stdin().lock().lines() {
                let line = line.map_err(|e| e.to_string())?;
                let sent = vocab.parse_words(&line).map_err(|e| e.to_string())?;
                let parse = decoder.decode(&sent).map_err(|e| e.to_string())?;
                let rescored = composer.transform(&parse);
                print_nbest(&vocab, &rescored, nbest);
            }
            Ok(())
        }
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("sylvad: {e}");
        process::exit(1);
    }
}
