//! CLI entry point.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use shunt::{App, Config, Error, VERSION};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: u8 = 1;
const EXIT_BIND: u8 = 2;
const EXIT_RUNTIME: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "shunt")]
#[command(version = VERSION)]
#[command(about = "Rule-based traffic classification and dispatch gateway")]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', short_alias = 'f', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Home directory (geo databases, cache.db, provider files)
    #[arg(short = 'd', long = "directory")]
    directory: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("shunt={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn exit_code_for(err: &Error) -> u8 {
    match err {
        Error::Config(_) | Error::Parse(_) | Error::Rule(_) | Error::Script(_) | Error::Cycle(_) => {
            EXIT_CONFIG
        }
        Error::Connection(msg) if msg.starts_with("bind ") => EXIT_BIND,
        _ => EXIT_RUNTIME,
    }
}

fn main() -> ExitCode {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let args = Args::parse();

    let config = match Config::load(&args.config.to_string_lossy()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if args.test {
        println!("configuration ok: {}", args.config.display());
        return ExitCode::SUCCESS;
    }

    init_logging(&config.log_level);

    let home = args
        .directory
        .clone()
        .or_else(|| args.config.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("shunt-worker")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("runtime: {}", e);
            return ExitCode::from(EXIT_RUNTIME);
        }
    };

    let result = runtime.block_on(async {
        let app = App::new(config, home).await?;
        app.run().await
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}
