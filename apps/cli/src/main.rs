use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{LocalFile, PipelineEvent, SolutionPipeline};
use shared::domain::{SolutionKind, SubmissionStatus, UserId};
use tracing::debug;

/// Upload solution files, submit them, and follow the evaluation live.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    assignment_id: i64,
    #[arg(long, default_value = "")]
    note: String,
    /// Evaluate as a reference solution instead of a regular submission.
    #[arg(long)]
    reference: bool,
    /// Solution files to upload.
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let kind = if args.reference {
        SolutionKind::Reference
    } else {
        SolutionKind::Assignment
    };

    let pipeline = SolutionPipeline::new(args.server_url.clone());
    let mut events = pipeline.subscribe_events();
    pipeline
        .begin_submission(UserId(args.user_id), args.assignment_id, kind)
        .await;

    let mut staged = Vec::new();
    for path in &args.files {
        let blob = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .with_context(|| format!("path has no usable file name: {}", path.display()))?;
        staged.push(LocalFile { name, blob });
    }
    pipeline.uploads().add_files(staged).await;

    while !pipeline.uploads().is_settled().await {
        let _ = events.recv().await;
    }
    for entry in pipeline.uploads().entries().await {
        println!("{:<10} {}", format!("{:?}", entry.status), entry.name);
    }
    if !pipeline.uploads().has_ready_files().await {
        bail!("no file finished uploading; nothing to submit");
    }

    let descriptor = pipeline.submit(&args.note).await?;
    println!(
        "Submitted; following evaluation channel {}",
        descriptor.channel_id
    );

    loop {
        match events.recv().await {
            Ok(PipelineEvent::ProgressUpdated(progress)) => {
                if let Some(message) = progress.messages.last() {
                    let mark = if message.was_successful { "ok" } else { "!!" };
                    println!("[{mark}] {}", message.text);
                }
                if progress.total > 0 {
                    println!(
                        "     {} tasks so far (completed {}, skipped {}, failed {})",
                        progress.total, progress.completed, progress.skipped, progress.failed
                    );
                }
            }
            Ok(PipelineEvent::EvaluationFinished) => break,
            Ok(event) => debug!(?event, "pipeline event"),
            Err(err) => bail!("event stream closed: {err}"),
        }
    }

    let progress = pipeline.monitor().progress().await;
    if progress.untracked {
        println!("Evaluation runs without live tracking; check the results page later.");
    } else if progress.is_finished {
        let verdict = if progress.so_far_so_good {
            "all tasks passed"
        } else {
            "some tasks did not pass"
        };
        println!("Evaluation finished: {verdict}.");
    } else {
        println!("Lost the evaluation channel; the server keeps evaluating.");
    }

    // The finish hook settles the submission record on another task.
    tokio::time::sleep(Duration::from_millis(50)).await;
    if pipeline.submission().status().await == SubmissionStatus::Finished {
        println!("Submission recorded as finished.");
    }
    Ok(())
}
