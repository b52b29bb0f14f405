use clap::{Parser, ValueEnum};
use labyrinth_server::console::ConsoleSink;
use labyrinth_server::supervisor;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The authoritative server for the multi-layer labyrinth game.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// HTTP port; the game socket listens one above it.
    #[arg(short = 'p', long, default_value_t = 8080)]
    port: u16,

    /// Directory for persisted state.
    #[arg(short = 'd', long, default_value = "./Data")]
    data: PathBuf,

    /// Web root served over HTTP.
    #[arg(short = 'w', long, default_value = "./web")]
    web: PathBuf,

    /// Keep the console free of log lines.
    #[arg(long)]
    no_console_log: bool,

    /// Skip the log file under the data directory.
    #[arg(long)]
    no_file_log: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[derive(ValueEnum, Clone, Copy)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[tokio::main]
/// Parses the command line, wires the log sinks and hands over to the
/// supervisor. Any initialization failure exits with code 1.
async fn main() {
    let cli = Cli::parse();
    let sink = ConsoleSink::new();

    if let Err(err) = init_logging(&cli, sink.clone()) {
        eprintln!("Could not initialize logging: {err}");
        std::process::exit(1);
    }

    let options = supervisor::Options {
        http_port: cli.port,
        data_dir: cli.data,
        web_dir: cli.web,
    };
    if let Err(err) = supervisor::run(options, sink).await {
        tracing::error!(?err, "Server failed.");
        std::process::exit(1);
    }
}

/// Console layer through the prompt-aware sink, file layer into the data
/// directory, both behind one env-filter that the CLI level seeds.
fn init_logging(cli: &Cli, sink: ConsoleSink) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.as_filter()));

    let console_layer = (!cli.no_console_log).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(sink)
    });

    let file_layer = if cli.no_file_log {
        None
    } else {
        std::fs::create_dir_all(&cli.data)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(cli.data.join("server.log"))?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file)),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();
    Ok(())
}
