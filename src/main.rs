use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use netcap::capture::{self, CaptureRegistry, CaptureRequest};
use netcap::config::Settings;
use netcap::decode::decode_file;
use netcap::report;
use netcap::server::{self, AppState};

#[derive(Parser)]
#[command(name = "netcap", version, about = "Capture, analyze and correlate network traffic")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API
    Serve {
        #[arg(long, env = "NETCAP_BIND", default_value = "0.0.0.0")]
        bind: String,
        #[arg(short, long, env = "NETCAP_PORT", default_value_t = 5000)]
        port: u16,
    },
    /// Write the analysis report of one capture file
    Analyze {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Merge several capture files into one timeline report
    Timeline {
        #[arg(short, long = "input", required = true)]
        inputs: Vec<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Capture from a live interface into the store directory
    Capture {
        #[arg(short, long, default_value = "any")]
        interface: String,
        #[arg(short, long)]
        count: Option<u64>,
        #[arg(short, long, default_value = "")]
        filter: String,
        /// Seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// List capture-capable interfaces
    Interfaces,
}

fn emit(text: &str, output: Option<&Path>) -> std::io::Result<()> {
    match output {
        Some(path) => {
            fs::write(path, text)?;
            info!("Report written to {}", path.display());
        }
        None => print!("{}", text),
    }
    Ok(())
}

#[actix_web::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let Cli { settings, command } = Cli::parse();

    match command {
        Command::Serve { bind, port } => {
            let state = AppState::new(settings)?;
            server::run(&bind, port, state).await?;
        }
        Command::Analyze { input, output } => {
            let decoded = decode_file(&input)?;
            if let Some(err) = &decoded.truncation {
                warn!("{} decoded partially: {}", decoded.name(), err);
            }
            emit(report::generate(&decoded).text(), output.as_deref())?;
        }
        Command::Timeline { inputs, output } => {
            let captures = inputs
                .iter()
                .map(|path| decode_file(path))
                .collect::<Result<Vec<_>, _>>()?;
            let timeline = report::correlate_with(&captures, &settings.timeline_options())?;
            emit(timeline.text(), output.as_deref())?;
        }
        Command::Capture {
            interface,
            count,
            filter,
            duration,
        } => {
            fs::create_dir_all(&settings.store_dir)?;
            let registry = CaptureRegistry::new();
            let handler_registry = registry.clone();
            ctrlc::set_handler(move || {
                info!("Received Ctrl+C, stopping capture");
                handler_registry.cancel_all();
            })?;

            let request = CaptureRequest {
                interface,
                filter,
                packet_limit: count,
                duration_limit: duration.map(Duration::from_secs),
            };
            let outcome = capture::start_capture(
                request,
                &registry,
                &settings.store_dir,
                &settings.capture_options(),
            )?;
            println!(
                "Captured {} packets to {} ({:?})",
                outcome.packets,
                outcome.path.display(),
                outcome.state
            );
        }
        Command::Interfaces => {
            for name in capture::list_interfaces()? {
                println!("{}", name);
            }
        }
    }

    Ok(())
}
