//! Main entry point for the geoextract CLI application.
//!
//! `extract` runs the full pipeline against a local or HTTP blob store and
//! supervises a copy of this binary, started with the hidden `worker`
//! subcommand, for the decode itself.

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use tokio::io::AsyncWriteExt;
use tracing::error;

use geoextract::cli::{Command, ExtractArgs, WorkerArgs};
use geoextract::{
    BlobStore, Cli, ErrorKind, ExtractError, Extractor, HttpBlobStore, LocalBlobStore, ParseJob, ProcessWorker,
    init_logging, run_job,
};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.quiet);

    match cli.command {
        Command::Worker(args) => worker(args).await,
        Command::Extract(args) => {
            if args.is_http_source() {
                let store = HttpBlobStore::new(&args.source)?;
                extract(store, &args).await
            } else {
                extract(LocalBlobStore::new(&args.source), &args).await
            }
        }
    }
}

/// Decode one file and print exactly one message line. Failures travel in
/// the message, so the exit status is zero whenever a message was written.
async fn worker(args: WorkerArgs) -> Result<ExitCode> {
    let job = ParseJob {
        file_path: args.file,
        kind: args.kind,
        options: args.decode.options(),
    };
    let message = run_job(&job).await;

    let mut line = serde_json::to_vec(&message).context("encoding worker message")?;
    line.push(b'\n');
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&line).await?;
    stdout.flush().await?;
    Ok(ExitCode::SUCCESS)
}

async fn extract<S: BlobStore>(store: S, args: &ExtractArgs) -> Result<ExitCode> {
    let worker = ProcessWorker::current_exe()?;
    let extractor = Extractor::new(store, worker, args.config());
    let collection = match extractor.extract_request(&args.request()).await {
        Ok(collection) => collection,
        Err(e) => {
            error!(error = %e, "extraction failed");
            eprintln!("geoextract: {e}");
            return Ok(exit_code(&e));
        }
    };

    let mut body = serde_json::to_vec(&collection).context("encoding GeoJSON")?;
    body.push(b'\n');
    match &args.output {
        Some(path) => tokio::fs::write(path, &body)
            .await
            .with_context(|| format!("writing {}", path.display()))?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&body).await?;
            stdout.flush().await?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Distinct status per error category so scripts can branch on it.
fn exit_code(err: &ExtractError) -> ExitCode {
    ExitCode::from(match err.kind() {
        ErrorKind::BadRequest => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::EntityTooLarge => 4,
        ErrorKind::ClientTimeout => 5,
        ErrorKind::Internal => 1,
    })
}
