use std::{
    path::PathBuf,
    process::ExitCode,
    sync::atomic::{AtomicBool, Ordering},
};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use logship::{
    notify_cmd::CmdNotify,
    receiver::{
        self,
        bucket::{BucketWriter, InputFormat, Schema},
        mirror::MirrorWriter,
        PartitionWriter, ReceiverOpts,
    },
    script::ScriptHost,
};

/// Reassemble a logship partition back into files on disk.
#[derive(Debug, Parser)]
#[command(name = "logship-receive", version, about)]
struct Cli {
    /// Kafka bootstrap brokers.
    brokers: String,
    topic: String,
    partition: i32,
    /// Start policy when no offset file exists:
    /// offset-beginning or offset-end.
    offset_policy: String,
    /// Output directory; also holds the offset, lock and notify logs.
    datadir: PathBuf,
    /// Command to run when an output file is finalised.
    notify: Option<PathBuf>,
    /// Output selection: `raw::raw` (mirror, the default) or
    /// `<informat>:<script>:json:<interval>:<delay>` (bucket).
    output: Option<String>,
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: i32) {
    STOP.store(true, Ordering::SeqCst);
}

fn install_signals() -> nix::Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGTERM, &action)?;
        sigaction(Signal::SIGINT, &action)?;
    }
    Ok(())
}

/// The output selector, `informat:script:outformat:interval:delay`.
#[derive(Debug, PartialEq, Eq)]
enum OutputMode {
    Mirror,
    Bucket {
        input: InputFormat,
        script: PathBuf,
        interval: i64,
        delay: i64,
    },
}

fn parse_output(raw: &str) -> Result<OutputMode, String> {
    let mut tokens = raw.split(':');
    let informat = tokens.next().unwrap_or_default();
    let script = tokens.next().unwrap_or_default();
    let outformat = tokens.next().unwrap_or_default();
    let interval = tokens.next().unwrap_or_default();
    let delay = tokens.next().unwrap_or_default();
    if tokens.next().is_some() {
        return Err(format!("too many fields in {raw}"));
    }

    match (informat, outformat) {
        ("raw", "raw") if script.is_empty() => Ok(OutputMode::Mirror),
        ("nginx" | "tsv", "json") => {
            if script.is_empty() {
                return Err("bucket output needs a script".to_string());
            }
            let input = if informat == "nginx" {
                InputFormat::Nginx
            } else {
                InputFormat::Tsv
            };
            Ok(OutputMode::Bucket {
                input,
                script: PathBuf::from(script),
                interval: interval.parse().map_err(|_| format!("bad interval {interval}"))?,
                delay: if delay.is_empty() {
                    0
                } else {
                    delay.parse().map_err(|_| format!("bad delay {delay}"))?
                },
            })
        }
        _ => Err(format!("unknown output format {raw}")),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let from_beginning = match cli.offset_policy.as_str() {
        // The historical spelling is accepted as an alias.
        "offset-beginning" | "offset-begining" => true,
        "offset-end" => false,
        other => {
            eprintln!("logship-receive: unknown offset policy {other}");
            return ExitCode::FAILURE;
        }
    };

    let mode = match parse_output(cli.output.as_deref().unwrap_or("raw::raw")) {
        Ok(mode) => mode,
        Err(detail) => {
            eprintln!("logship-receive: {detail}");
            return ExitCode::FAILURE;
        }
    };

    let opts = ReceiverOpts {
        brokers: cli.brokers,
        topic: cli.topic,
        partition: cli.partition,
        from_beginning,
        datadir: cli.datadir,
    };

    if std::fs::create_dir_all(&opts.datadir).is_err() {
        eprintln!("logship-receive: datadir {} unavailable", opts.datadir.display());
        return ExitCode::FAILURE;
    }
    let _lock = match receiver::acquire_lock(&opts) {
        Ok(lock) => lock,
        Err(error) => {
            error!(message = "startup failed", %error);
            return ExitCode::FAILURE;
        }
    };
    if let Err(error) = install_signals() {
        error!(message = "signal install failed", %error);
        return ExitCode::FAILURE;
    }

    let notify = CmdNotify::new(cli.notify, &opts.datadir, &opts.topic, opts.partition);
    let mut writer: Box<dyn PartitionWriter> = match mode {
        OutputMode::Mirror => match MirrorWriter::new(&opts.datadir, &opts.topic, notify) {
            Ok(writer) => Box::new(writer),
            Err(error) => {
                error!(message = "mirror init failed", %error);
                return ExitCode::FAILURE;
            }
        },
        OutputMode::Bucket {
            input,
            script,
            interval,
            delay,
        } => {
            let schema = ScriptHost::load(&script)
                .map_err(|source| receiver::ReceiveError::Script { source })
                .and_then(|host| Schema::from_script(&host, input));
            let schema = match schema {
                Ok(schema) => schema,
                Err(error) => {
                    error!(message = "bucket schema invalid", %error);
                    return ExitCode::FAILURE;
                }
            };
            match BucketWriter::new(
                &opts.datadir,
                &opts.topic,
                opts.partition,
                input,
                schema,
                interval,
                delay,
                notify,
            ) {
                Ok(writer) => Box::new(writer),
                Err(error) => {
                    error!(message = "bucket init failed", %error);
                    return ExitCode::FAILURE;
                }
            }
        }
    };

    info!(message = "receiver starting", topic = %opts.topic, partition = opts.partition);
    let result = receiver::run(&opts, writer.as_mut(), &STOP);
    drop(writer);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(message = "receiver failed", %error);
            ExitCode::FAILURE
        }
    }
}
