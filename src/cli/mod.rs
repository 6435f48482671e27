//! Command-line interface for intake-relay.
//!
//! Provides commands for running an intake session, draining the
//! dead-letter queue, and inspecting stored and queued submissions.

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};

use crate::config::{self, ResolvedConfig};
use crate::core::{transform, IntakePipeline, PayloadFormat};
use crate::domain::Submission;

pub mod session;

/// intake-relay - durable capture and delivery of intake submissions
#[derive(Parser, Debug)]
#[command(name = "intake-relay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an intake session, reading data packets (one JSON body per line) from stdin
    Session {
        /// Session id of the sending participant
        #[arg(long)]
        participant_id: Option<String>,

        /// Identity of the sending participant
        #[arg(long)]
        identity: Option<String>,
    },

    /// Retry every submission in the dead-letter queue once
    Flush,

    /// Show the dead-letter queue
    Queue,

    /// List stored submissions (newest first)
    Submissions {
        /// Maximum number of submissions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Print the wire payload for a submission JSON file
    Preview {
        /// Submission file ("-" reads stdin)
        input: PathBuf,

        /// Payload format (defaults to the configured one)
        #[arg(short, long, value_enum)]
        format: Option<FormatArg>,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Payload format for CLI (maps to PayloadFormat)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FormatArg {
    /// FHIR-style collection bundle
    Fhir,

    /// Submission as stored
    Raw,
}

impl From<FormatArg> for PayloadFormat {
    fn from(f: FormatArg) -> Self {
        match f {
            FormatArg::Fhir => PayloadFormat::Fhir,
            FormatArg::Raw => PayloadFormat::Raw,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::config()?;

        match self.command {
            Commands::Session {
                participant_id,
                identity,
            } => session::run_session(cfg, participant_id, identity).await,
            Commands::Flush => flush_queue(cfg).await,
            Commands::Queue => show_queue(cfg).await,
            Commands::Submissions { limit } => list_submissions(cfg, limit).await,
            Commands::Preview { input, format } => {
                preview_payload(cfg, &input, format.map(Into::into))
            }
            Commands::Config => show_config(cfg),
        }
    }
}

/// Drain the dead-letter queue once
async fn flush_queue(cfg: &ResolvedConfig) -> Result<()> {
    let pipeline = IntakePipeline::from_config(cfg);

    if cfg.ehr.endpoint.is_none() {
        eprintln!("No EHR endpoint configured; queued submissions count as delivered and leave the queue.");
    }

    let report = pipeline
        .dead_letters()
        .flush(pipeline.retry())
        .await
        .with_context(|| format!("Failed to flush {}", cfg.queue_path.display()))?;

    println!("Delivered:   {}", report.delivered);
    println!("Remaining:   {}", report.remaining);
    if report.appended > 0 {
        println!("Appended:    {}", report.appended);
    }
    println!("Unparseable: {}", report.unparseable());

    for failure in &report.failures {
        println!("  {}", failure);
    }

    Ok(())
}

/// Show queued records
async fn show_queue(cfg: &ResolvedConfig) -> Result<()> {
    let pipeline = IntakePipeline::from_config(cfg);
    let pending = pipeline
        .dead_letters()
        .pending()
        .await
        .with_context(|| format!("Failed to read {}", cfg.queue_path.display()))?;

    println!();
    println!("Dead-Letter Queue");
    println!("══════════════════════════════════════════════════════════════");
    println!("Queue file:  {}", cfg.queue_path.display());
    println!("Queued:      {}", pending.len());
    println!();

    for record in &pending {
        match &record.submission {
            Some(submission) => println!(
                "  {:>4}  {}  {:<20}  {} field(s)",
                record.line,
                format_timestamp(submission.created_at()),
                submission.participant_identity().unwrap_or("-"),
                submission.fields().len()
            ),
            None => println!(
                "  {:>4}  (unparseable) {}",
                record.line,
                truncate(&record.raw_lossy(), 60)
            ),
        }
    }

    Ok(())
}

/// List stored submissions
async fn list_submissions(cfg: &ResolvedConfig, limit: usize) -> Result<()> {
    let pipeline = IntakePipeline::from_config(cfg);
    let submissions = pipeline
        .store()
        .read_all()
        .await
        .with_context(|| format!("Failed to read {}", cfg.storage_path.display()))?;

    if submissions.is_empty() {
        println!("No submissions stored in {}", cfg.storage_path.display());
        return Ok(());
    }

    println!(
        "{} submission(s) in {} (showing up to {})",
        submissions.len(),
        cfg.storage_path.display(),
        limit
    );
    println!();

    for submission in submissions.iter().rev().take(limit) {
        let keys: Vec<&str> = submission.fields().keys().map(String::as_str).collect();
        println!(
            "{}  {:<20}  {}",
            format_timestamp(submission.created_at()),
            submission.participant_identity().unwrap_or("-"),
            keys.join(", ")
        );
    }

    Ok(())
}

/// Print the payload a submission would be sent as
fn preview_payload(
    cfg: &ResolvedConfig,
    input: &Path,
    format: Option<PayloadFormat>,
) -> Result<()> {
    let content = if input.as_os_str() == "-" {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        std::fs::read_to_string(input)
            .with_context(|| format!("Failed to read input file: {}", input.display()))?
    };

    let submission: Submission =
        serde_json::from_str(&content).context("Input is not a submission record")?;

    let payload = transform(&submission, format.unwrap_or(cfg.ehr.format));
    println!("{}", serde_json::to_string_pretty(&payload)?);

    Ok(())
}

/// Show resolved configuration
fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("  Intake Relay Configuration");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Durable store:     {}", cfg.storage_path.display());
    println!("  Dead-letter queue: {}", cfg.queue_path.display());
    println!();
    println!("EHR endpoint:");
    println!(
        "  URL:     {}",
        cfg.ehr.endpoint.as_deref().unwrap_or("(none - offline)")
    );
    println!(
        "  Token:   {}",
        if cfg.ehr.token.is_some() { "(set)" } else { "(none)" }
    );
    println!("  Format:  {}", cfg.ehr.format);
    println!("  Timeout: {}s", cfg.ehr.timeout_seconds);
    println!();
    println!("Delivery:");
    println!("  Max attempts:  {}", cfg.retry.max_attempts);
    println!("  Backoff step:  {}ms", cfg.retry.backoff_step_ms);
    println!();
    println!("Session:");
    println!("  Flush interval:  {}s", cfg.session.flush_interval_seconds);
    println!("  Shutdown grace:  {}s", cfg.session.shutdown_grace_seconds);

    let missing = config::missing_required_env();
    if !missing.is_empty() {
        println!();
        println!("Missing session credentials: {}", missing.join(", "));
    }

    Ok(())
}

fn format_timestamp(epoch_seconds: f64) -> String {
    let secs = epoch_seconds.trunc() as i64;
    let nanos = (epoch_seconds.fract() * 1e9) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| format!("{:.3}", epoch_seconds))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_session_args() {
        let cli = Cli::try_parse_from([
            "intake-relay",
            "session",
            "--participant-id",
            "PA_1",
            "--identity",
            "jane",
        ])
        .unwrap();

        match cli.command {
            Commands::Session {
                participant_id,
                identity,
            } => {
                assert_eq!(participant_id.as_deref(), Some("PA_1"));
                assert_eq!(identity.as_deref(), Some("jane"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_preview_format_arg() {
        let cli = Cli::try_parse_from(["intake-relay", "preview", "sub.json", "--format", "raw"])
            .unwrap();
        match cli.command {
            Commands::Preview { format, .. } => {
                assert_eq!(format.map(PayloadFormat::from), Some(PayloadFormat::Raw));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0.0), "1970-01-01 00:00:00");
        assert_eq!(format_timestamp(1_700_000_000.25), "2023-11-14 22:13:20");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("abcdef", 3), "abc…");
    }
}
