//! # Survey QA CLI (`survey-qa`)
//!
//! Ask natural-language questions about a survey spreadsheet.
//!
//! ## Usage
//!
//! ```bash
//! survey-qa --config ./config/survey-qa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `survey-qa ask <FILE> "<QUESTION>"` | Answer a question from a spreadsheet |
//! | `survey-qa chunks <FILE>` | Print the chunks extracted from a spreadsheet |
//! | `survey-qa serve` | Start the HTTP upload page and JSON API |
//!
//! ## Examples
//!
//! ```bash
//! # Ask with the default retrieval depth (k = 16)
//! survey-qa ask ./survey.xlsx "Which brand has the most sustainable packaging?"
//!
//! # Fewer evidence rows, and show which rows were used
//! survey-qa ask ./survey.xlsx "Do shoppers pay more for refills?" --k 4 --evidence
//!
//! # Serve the upload page on [server].bind
//! survey-qa serve --config ./config/survey-qa.toml
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use survey_qa::config;
use survey_qa::loader::{self, DocumentSource};
use survey_qa::pipeline::Pipeline;
use survey_qa::{server, telemetry};

/// Survey QA: question answering over survey spreadsheets.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/survey-qa.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "survey-qa",
    about = "Survey QA: ask questions about a survey spreadsheet",
    version,
    long_about = "Survey QA loads a spreadsheet, embeds its rows, retrieves the most relevant \
    and mutually diverse rows for a question, and asks a local language model to answer \
    from that evidence only."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/survey-qa.toml`. Built-in defaults are used when
    /// the file does not exist.
    #[arg(long, global = true, default_value = "./config/survey-qa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Answer a question from a spreadsheet.
    ///
    /// Runs the full pipeline: load, embed, index, retrieve, compose, generate.
    /// The answer is printed to stdout; progress logs go to stderr.
    Ask {
        /// Spreadsheet file (.xlsx, .xlsm, .xls, .csv).
        file: PathBuf,

        /// The question to ask.
        question: String,

        /// Number of evidence chunks to retrieve (default: `retrieval.k`).
        #[arg(long)]
        k: Option<usize>,

        /// Also print the evidence chunks the answer was generated from.
        #[arg(long)]
        evidence: bool,
    },

    /// Print the chunks extracted from a spreadsheet, with provenance.
    Chunks {
        /// Spreadsheet file (.xlsx, .xlsm, .xls, .csv).
        file: PathBuf,
    },

    /// Start the HTTP server (upload page and `POST /answer`).
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    let cli = Cli::parse();
    let cfg = config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Ask {
            file,
            question,
            k,
            evidence,
        } => {
            let pipeline = Pipeline::from_config(&cfg)?;
            let source = DocumentSource::from_path(&file);
            let answer = pipeline
                .answer(&source, &question, k)
                .await
                .with_context(|| format!("failed to answer from {}", file.display()))?;

            println!("{}", answer.text);
            if evidence {
                println!();
                if answer.evidence.is_empty() {
                    println!("No evidence.");
                }
                for (i, chunk) in answer.evidence.iter().enumerate() {
                    println!("{}. {}", i + 1, chunk.origin());
                    for line in chunk.text.lines() {
                        println!("    {}", line);
                    }
                }
            }
        }
        Commands::Chunks { file } => {
            let chunks = loader::load(&DocumentSource::from_path(&file), &cfg.loader)
                .with_context(|| format!("failed to load {}", file.display()))?;

            if chunks.is_empty() {
                println!("No chunks.");
            }
            for chunk in &chunks {
                println!("{}", chunk.origin());
                if let Some(cells) = chunk.provenance.get("cells") {
                    println!("    cells: {}", cells);
                }
                for line in chunk.text.lines() {
                    println!("    {}", line);
                }
                println!();
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
