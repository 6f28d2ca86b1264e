//! services/api/src/bin/storybook.rs
//!
//! Command-line client for the storybook API. `generate` records a recovery
//! marker around a paid generation; `recover` reconciles a marker left behind by
//! an interrupted run without ever resubmitting it.

use api_lib::client::{FileMarkerStore, HttpStudioClient};
use api_lib::web::books::GenerateBookRequest;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use storybook_core::ports::{PortError, PortResult};
use storybook_core::recovery::{
    begin_generation, check_pending_generation, finish_generation, RecoveryGuard, RecoveryOutcome,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "storybook", version, about = "Generate picture books from the command line")]
struct Cli {
    /// Base URL of the storybook API
    #[arg(long, env = "STORYBOOK_SERVER", default_value = "http://localhost:3000")]
    server: String,

    /// Account email
    #[arg(long, env = "STORYBOOK_EMAIL")]
    email: String,

    /// Account password
    #[arg(long, env = "STORYBOOK_PASSWORD", hide_env_values = true)]
    password: String,

    /// File holding the pending-generation marker
    #[arg(long, env = "STORYBOOK_MARKER", default_value = ".storybook/generation.json")]
    marker: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate and pay for a new book
    Generate(GenerateArgs),
    /// Check on a generation that was interrupted
    Recover,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[arg(long)]
    theme: String,
    #[arg(long)]
    genre: String,
    /// Character key, e.g. fox, rabbit, child
    #[arg(long)]
    character: String,
    /// Art style key, e.g. watercolor, crayon, anime
    #[arg(long)]
    art_style: String,
    #[arg(long, default_value = "3-5")]
    target_age: String,
    #[arg(long, default_value_t = 5)]
    page_count: u32,
    #[arg(long, default_value = "en")]
    language: String,
}

fn describe(outcome: RecoveryOutcome) -> String {
    match outcome {
        RecoveryOutcome::Idle => "No generation was pending.".to_string(),
        RecoveryOutcome::StillGenerating => {
            "The generation is still running; check again shortly.".to_string()
        }
        RecoveryOutcome::OpenBook(id) => format!("The generation finished: book {}", id),
        RecoveryOutcome::Landing => {
            "The earlier generation could not be confirmed; nothing is pending anymore.".to_string()
        }
        RecoveryOutcome::AlreadyChecking => "A recovery check is already running.".to_string(),
    }
}

async fn recover(client: &HttpStudioClient, store: &FileMarkerStore) -> RecoveryOutcome {
    let guard = RecoveryGuard::new();
    check_pending_generation(store, client, &guard, Utc::now()).await
}

async fn generate(
    client: &HttpStudioClient,
    store: &FileMarkerStore,
    args: GenerateArgs,
    shutdown: CancellationToken,
) -> PortResult<()> {
    // A previous run may still be billing; never start a second one on top of it.
    let pending = recover(client, store).await;
    match pending {
        RecoveryOutcome::StillGenerating => {
            return Err(PortError::Conflict(describe(pending)));
        }
        RecoveryOutcome::OpenBook(_) | RecoveryOutcome::Landing => println!("{}", describe(pending)),
        RecoveryOutcome::Idle | RecoveryOutcome::AlreadyChecking => {}
    }

    let job = client.open_job().await?;
    begin_generation(store, Utc::now(), Some(job.job_id)).await?;
    info!(job_id = %job.job_id, "Generation submitted");

    let request = GenerateBookRequest {
        theme: args.theme,
        genre: args.genre,
        character: args.character,
        art_style: args.art_style,
        target_age: args.target_age,
        page_count: args.page_count,
        language: Some(args.language),
        job_id: Some(job.job_id),
    };

    let result = tokio::select! {
        result = client.generate(&request) => result,
        _ = shutdown.cancelled() => {
            // The marker stays so that `recover` can pick the run up later.
            println!("Interrupted. Run `storybook recover` to find out how the generation ended.");
            return Ok(());
        }
    };

    if let Err(e) = finish_generation(store).await {
        warn!(error = %e, "Could not clear generation marker");
    }
    let book = result?;
    println!("Generated \"{}\" (book {})", book.title, book.book_id);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let store = FileMarkerStore::new(&cli.marker);

    let mut client = match HttpStudioClient::new(&cli.server) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = client.login(&cli.email, &cli.password).await {
        eprintln!("error: login failed: {}", e);
        return ExitCode::FAILURE;
    }

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let result = match cli.command {
        Command::Generate(args) => generate(&client, &store, args, shutdown).await,
        Command::Recover => {
            println!("{}", describe(recover(&client, &store).await));
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(PortError::InsufficientCredits { required, current }) => {
            eprintln!(
                "error: not enough credits (required {}, current {})",
                required, current
            );
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
