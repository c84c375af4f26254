use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use logship::{config::Config, supervisor};

/// Tail configured log files and ship their lines to Kafka.
#[derive(Debug, Parser)]
#[command(name = "logship", version, about)]
struct Cli {
    /// Configuration directory holding main.json and *.spec.json.
    confdir: PathBuf,

    /// Stay in the foreground instead of daemonising.
    #[arg(long, env = "DAEMON_OFF")]
    foreground: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.confdir) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("logship: configuration error: {error}");
            return ExitCode::FAILURE;
        }
    };

    let close_stdio = std::env::var_os("LOGSHIP_NOSTDIO").is_some();
    init_tracing(&config, close_stdio);

    if !cli.foreground {
        if let Err(error) = nix::unistd::daemon(true, !close_stdio) {
            eprintln!("logship: daemonise failed: {error}");
            return ExitCode::FAILURE;
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("logship: runtime start failed: {error}");
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(supervisor::run(&cli.confdir, config));
    if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Structured logs to stderr, or to `<logdir>/logship.log` when stdio is
/// being closed for daemon mode.
fn init_tracing(config: &Config, to_file: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if to_file {
        std::fs::create_dir_all(&config.main.logdir).ok();
        let path = config.main.logdir.join("logship.log");
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                builder
                    .with_ansi(false)
                    .with_writer(std::sync::Arc::new(file))
                    .init();
                return;
            }
            Err(error) => {
                eprintln!("logship: log file {} unavailable ({error}), using stderr",
                          path.display());
            }
        }
    }
    builder.init();
}
