//! Main Entrypoint for the Fourth Wall Terminal
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and the command line.
//! 2. Opening the audio devices and the voice agent.
//! 3. Starting the conversation controller.
//! 4. Running the command loop until `quit`, end of input or `Ctrl+C`.

use anyhow::Context;
use clap::Parser;
use elevenlabs_realtime::{AudioOutput, ElevenLabsAgent, NullOutput};
use fourthwall_core::{
    card::InMemoryCardRegistry,
    controller::{ControllerConfig, ConversationController},
    library_client::{AccessToken, HttpLibraryClient},
};
use fourthwall_service::{
    app::{App, Command, Flow, HELP},
    audio::{CpalMicrophone, CpalOutput},
    config::Config,
    console,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

#[derive(Parser, Debug)]
#[command(version, about = "Talk to the characters of your books.")]
struct Args {
    /// Backend access token. Overrides FOURTHWALL_ACCESS_TOKEN.
    #[arg(long)]
    token: Option<String>,
    /// Book to open on startup, by id.
    #[arg(long)]
    book: Option<String>,
    /// Backend base URL. Overrides FOURTHWALL_BACKEND_URL.
    #[arg(long)]
    backend_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let args = Args::parse();
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(url) = args.backend_url {
        config.backend_url = url;
    }
    if args.token.is_some() {
        config.access_token = args.token;
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::default().add_directive(LevelFilter::from_level(config.log_level).into()),
        )
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!(backend = %config.backend_url, "Configuration loaded.");

    // --- 3. Initialize Services ---
    let library = Arc::new(
        HttpLibraryClient::new(
            &config.backend_url,
            AccessToken::from_optional(config.access_token.clone()),
        )
        .context("Failed to create library client")?,
    );

    let output: Arc<dyn AudioOutput> = match tokio::task::spawn_blocking(CpalOutput::open).await? {
        Ok(output) => Arc::new(output),
        Err(e) => {
            warn!(error = %e, "No speaker available; agent audio will be discarded.");
            Arc::new(NullOutput)
        }
    };
    let agent = Arc::new(ElevenLabsAgent::new(config.elevenlabs_api_key.clone(), output));

    let registry = Arc::new(InMemoryCardRegistry::new());
    let mut controller_config = ControllerConfig::new(config.agent_id.clone());
    controller_config.first_message = config.first_message.clone();
    controller_config.failure_display = config.failure_display;
    let (conversation, controller_task) = ConversationController::spawn(
        controller_config,
        agent,
        Arc::new(CpalMicrophone),
        registry.clone(),
    );
    let printer = console::spawn_update_printer(registry.subscribe(), registry.clone());

    let mut app = App::new(library, registry, conversation.clone());

    // --- 4. Command Loop ---
    println!("{HELP}");
    if let Some(book) = args.book {
        println!("{}", app.open_book(&book).await);
    } else {
        println!("{}", app.refresh_library().await);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal.");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read from stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(command) => {
                        let (flow, output) = app.execute(command).await;
                        if !output.is_empty() {
                            println!("{output}");
                        }
                        if flow == Flow::Quit {
                            break;
                        }
                    }
                    Err(e) => println!("{e}"),
                }
            }
        }
    }

    // --- 5. Shutdown ---
    conversation.shutdown();
    controller_task.await.context("Conversation controller panicked")?;
    printer.abort();
    info!("Goodbye.");
    Ok(())
}
