use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use chat_relay::chat::prompt::{builtin_profile_ids, PromptHandler};
use chat_relay::config::load_config;
use chat_relay::engine::mock::MockEngine;
use chat_relay::engine::process::ProcessEngine;
use chat_relay::server::ChatServer;

/// Single-connection TCP chat relay over a streaming dialog engine.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the relay configuration file.
    #[arg(long, default_value = "config/relay.json")]
    config: String,

    /// Base directory to set as the working directory.
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Override the configured port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging().context("Failed to initialize logging")?;

    if let Some(dir) = &args.base_dir {
        std::env::set_current_dir(dir).with_context(|| {
            format!("Failed to change working directory to {}", dir.display())
        })?;
    }

    let mut config = load_config(&args.config);
    if let Some(port) = args.port {
        config.port = port;
    }

    let profile = config.resolve_template().with_context(|| {
        format!(
            "Unknown template profile {:?} (built-ins: {})",
            config.template_profile,
            builtin_profile_ids().join(", ")
        )
    })?;
    let prompt_handler = PromptHandler::new(profile);

    // Engine construction failures are fatal: no session without an engine.
    if config.engine.command.is_some() {
        let engine = ProcessEngine::spawn(&config.engine)
            .context("Failed to create the dialog engine. Please check config.")?;
        info!("Dialog engine process started");
        ChatServer::new(engine, prompt_handler, config)
            .run()
            .context("Server error")?;
    } else {
        warn!("No engine command configured, falling back to the built-in mock engine");
        ChatServer::new(MockEngine::canned(), prompt_handler, config)
            .run()
            .context("Server error")?;
    }

    Ok(())
}

fn init_logging() -> Result<()> {
    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d(%H:%M:%S)} [{l}] {m}{n}")))
        .build();
    let file = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {m}{n}",
        )))
        .build("logs/chat_relay.log")?;

    let log_config = Config::builder()
        .appender(Appender::builder().build("console", Box::new(console)))
        .appender(Appender::builder().build("file", Box::new(file)))
        .build(
            Root::builder()
                .appender("console")
                .appender("file")
                .build(LevelFilter::Info),
        )?;

    log4rs::init_config(log_config)?;
    Ok(())
}
