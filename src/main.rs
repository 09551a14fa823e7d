mod checkpoint;
mod config;
mod controller;
mod driver;
mod events;
mod expand;
mod merge;
mod parser;
mod record;
mod retry;
mod runner;
mod session;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::warn;

use config::Settings;
use driver::webdriver::WebDriver;
use events::HarvestEvent;
use runner::{RunReport, RunRequest};

#[derive(Parser)]
#[command(name = "fanpage_harvester", about = "Incremental fan page post harvester over WebDriver")]
struct Cli {
    /// Config file (default: ./harvester.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest posts from one or more fan pages
    Run {
        #[arg(required = true)]
        urls: Vec<String>,
        /// Complete posts wanted per page
        #[arg(short = 'n', long)]
        target: Option<usize>,
        /// Complete posts per checkpoint batch
        #[arg(long)]
        batch_size: Option<usize>,
        /// Output directory for batches and the merged file
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Wait for a manual login in the browser if no saved session works
        #[arg(long)]
        interactive_login: bool,
        /// Delete batch files once they are merged
        #[arg(long)]
        delete_batches: bool,
        #[arg(long)]
        headless: bool,
    },
    /// Merge leftover batch files into one de-duplicated file
    Merge {
        #[arg(required = true)]
        batches: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        delete_batches: bool,
    },
    /// Print the normalized form of post time texts
    Normalize {
        #[arg(required = true)]
        texts: Vec<String>,
    },
    /// Log in through the browser and save the session
    Login,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Run {
            urls,
            target,
            batch_size,
            out,
            max_iterations,
            interactive_login,
            delete_batches,
            headless,
        } => {
            let h = &mut settings.harvest;
            h.target = target.unwrap_or(h.target);
            h.batch_size = batch_size.unwrap_or(h.batch_size);
            h.max_iterations = max_iterations.unwrap_or(h.max_iterations);
            if let Some(dir) = out {
                settings.output.directory = dir;
            }
            if delete_batches {
                settings.output.keep_batches = false;
            }
            settings.driver.headless |= headless;

            let report = harvest(settings, urls, interactive_login).await?;
            print_summary(&report);
            Ok(())
        }
        Commands::Merge {
            batches,
            output,
            delete_batches,
        } => {
            let summary = checkpoint::merge_all(&batches, &output)?;
            println!(
                "Merged {}/{} files: {} rows, {} unique posts -> {}",
                summary.files,
                batches.len(),
                summary.read,
                summary.records.len(),
                summary.path.display()
            );
            if delete_batches {
                let removed = checkpoint::remove_batches(&batches);
                println!("Deleted {} batch files", removed);
            }
            Ok(())
        }
        Commands::Normalize { texts } => {
            let now = Local::now().naive_local();
            for text in &texts {
                println!("{:<30} => {}", text, parser::time::normalize(text, now));
            }
            Ok(())
        }
        Commands::Login => {
            let mut driver = WebDriver::connect(&settings.driver)
                .await
                .context("Could not start a browser session")?;
            let result = session::Authenticator::new(&settings.session, settings.driver.wait_timeout())
                .authenticate(&mut driver, true)
                .await;
            if let Err(e) = driver.quit().await {
                warn!("Could not close the browser: {}", e);
            }
            result?;
            println!("Session saved to {}", settings.session.path.display());
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// Run the harvest on a worker task and render its events until it ends.
async fn harvest(settings: Settings, urls: Vec<String>, interactive_login: bool) -> Result<RunReport> {
    let driver = WebDriver::connect(&settings.driver)
        .await
        .context("Could not start a browser session")?;
    let target = settings.harvest.target;
    let handle = runner::spawn(
        driver,
        settings,
        RunRequest {
            pages: urls,
            interactive_login,
        },
    );

    let cancel = handle.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping after the current step");
            cancel.cancel();
        }
    });

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );

    let mut events = handle.events;
    while let Some(event) = events.recv().await {
        match event {
            HarvestEvent::Progress { percent, complete } => {
                pb.set_position(percent as u64);
                pb.set_message(format!("{}/{} complete", complete, target));
            }
            HarvestEvent::Status(message) => pb.println(message),
            HarvestEvent::BatchSaved(message) => pb.println(message),
            HarvestEvent::Finished { success } => {
                if success {
                    pb.finish_and_clear();
                } else {
                    pb.abandon_with_message("no posts collected");
                }
            }
        }
    }

    let (result, driver) = handle.task.await?;
    if let Err(e) = driver.quit().await {
        warn!("Could not close the browser: {}", e);
    }
    result
}

fn print_summary(report: &RunReport) {
    if report.cancelled {
        println!("Stopped early; results are partial.");
    }
    println!("Complete posts:   {}", report.records.len());
    println!("Pages harvested:  {}", report.pages_done);
    println!("Expansion clicks: {}", report.clicks);
    println!("Iterations:       {}", report.iterations);
    println!("Left truncated:   {}", report.dropped_truncated);
    println!("Batches written:  {}", report.batches.len());
    match &report.consolidated {
        Some(path) => println!("Output:           {}", path.display()),
        None => println!("Output:           (nothing written)"),
    }

    if report.records.is_empty() {
        return;
    }
    println!("\n--- Preview ---");
    for (i, r) in report.records.iter().take(3).enumerate() {
        println!(
            "{}. [{}] {}  (likes {}, comments {}, shares {})",
            i + 1,
            r.timestamp,
            truncate(r.content.trim(), 60),
            r.engagement.likes,
            r.engagement.comments,
            r.engagement.shares
        );
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
