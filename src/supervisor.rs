//! Process lifecycle for the sender: single-instance pidfile, the
//! worker (watch thread + producer task) and the signal loop with hot
//! reload by worker replacement.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write as _},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    sync::{mpsc as std_mpsc, Arc},
};

use snafu::{ResultExt, Snafu};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::{mpsc, watch},
};
use tracing::{error, info};

use crate::{
    checkpoints::{self, OffsetError, OffsetTable},
    config::{Config, ConfigError},
    pingback::Pingback,
    producer::{KafkaSink, ProducerError},
    shared::{RunStatus, Shared},
    watcher::{WatchError, WatchLoop},
};

/// Batches in flight between the watch thread and the producer.
const QUEUE_DEPTH: usize = 128;

#[derive(Debug, Snafu)]
pub enum SupervisorError {
    #[snafu(display("another instance holds {}: {detail}", path.display()))]
    AlreadyRunning { path: PathBuf, detail: String },

    #[snafu(display("unable to create pidfile {}: {source}", path.display()))]
    Pidfile { path: PathBuf, source: io::Error },

    #[snafu(display("{source}"))]
    Config { source: ConfigError },

    #[snafu(display("offset table: {source}"))]
    Offsets { source: OffsetError },

    #[snafu(display("offset table: {source}"))]
    OffsetsRead { source: io::Error },

    #[snafu(display("watch loop: {source}"))]
    Watch { source: WatchError },

    #[snafu(display("producer: {source}"))]
    Producer { source: ProducerError },

    #[snafu(display("watch thread failed before reporting readiness"))]
    WatchThreadDied,

    #[snafu(display("unable to spawn watch thread: {source}"))]
    ThreadSpawn { source: io::Error },
}

/// Exclusive pidfile: a write lock on byte 0 plus the ASCII pid. The
/// lock dies with the process, so a stale file never blocks a restart.
#[derive(Debug)]
pub struct PidFile {
    _file: File,
    path: PathBuf,
}

impl PidFile {
    pub fn acquire(path: &Path) -> Result<PidFile, SupervisorError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .context(PidfileSnafu { path })?;

        let mut lock: libc::flock = unsafe { std::mem::zeroed() };
        lock.l_type = libc::F_WRLCK as _;
        lock.l_whence = libc::SEEK_SET as _;
        lock.l_start = 0;
        lock.l_len = 0;
        if let Err(errno) = nix::fcntl::fcntl(file.as_raw_fd(), nix::fcntl::FcntlArg::F_SETLK(&lock))
        {
            return AlreadyRunningSnafu {
                path,
                detail: errno.to_string(),
            }
            .fail();
        }

        file.set_len(0).context(PidfileSnafu { path })?;
        write!(file, "{}", std::process::id()).context(PidfileSnafu { path })?;
        Ok(PidFile {
            _file: file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// One data plane: the watch thread owning all reader state and the
/// producer task owning the broker client.
pub struct Worker {
    pub shared: Arc<Shared>,
    watch_thread: Option<std::thread::JoinHandle<()>>,
    producer_task: Option<tokio::task::JoinHandle<()>>,
    finished: watch::Receiver<bool>,
}

impl Worker {
    /// Bring a full data plane up. Any failure leaves no running pieces
    /// behind, so a failed reload keeps the old worker intact.
    pub async fn spawn(config: Arc<Config>, pingback: Pingback) -> Result<Worker, SupervisorError> {
        let shared = Arc::new(Shared::new());
        let saved = checkpoints::read_saved(&config.main.libdir).context(OffsetsReadSnafu)?;

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let (init_tx, init_rx) = std_mpsc::channel();

        let thread_config = Arc::clone(&config);
        let thread_shared = Arc::clone(&shared);
        let watch_thread = std::thread::Builder::new()
            .name("watch-loop".to_string())
            .spawn(move || {
                match WatchLoop::build(&thread_config, thread_shared, tx, &saved, pingback) {
                    Ok((watch_loop, handles)) => {
                        if init_tx.send(Ok(handles)).is_ok() {
                            watch_loop.run();
                        }
                    }
                    Err(error) => {
                        let _ = init_tx.send(Err(error));
                    }
                }
            })
            .context(ThreadSpawnSnafu)?;

        let handles = match tokio::task::spawn_blocking(move || init_rx.recv()).await {
            Ok(Ok(Ok(handles))) => handles,
            Ok(Ok(Err(error))) => {
                let _ = watch_thread.join();
                return Err(SupervisorError::Watch { source: error });
            }
            _ => {
                let _ = watch_thread.join();
                return Err(SupervisorError::WatchThreadDied);
            }
        };

        let offsets = Arc::new(
            OffsetTable::create(&config.main.libdir, &handles.initial_offsets)
                .context(OffsetsSnafu)
                .inspect_err(|_| shared.set_run_status(RunStatus::Stop))?,
        );

        // The client build talks to the broker for metadata; keep it off
        // the runtime threads.
        let sink = {
            let config = Arc::clone(&config);
            let shared_for_sink = Arc::clone(&shared);
            let counters = handles.counters;
            tokio::task::spawn_blocking(move || {
                KafkaSink::build(&config, offsets, counters, shared_for_sink, rx)
            })
            .await
        };
        let sink = match sink {
            Ok(Ok(sink)) => sink,
            Ok(Err(error)) => {
                shared.set_run_status(RunStatus::Stop);
                let _ = watch_thread.join();
                return Err(SupervisorError::Producer { source: error });
            }
            Err(_) => {
                shared.set_run_status(RunStatus::Stop);
                let _ = watch_thread.join();
                return Err(SupervisorError::WatchThreadDied);
            }
        };

        let (finished_tx, finished) = watch::channel(false);
        let producer_task = tokio::spawn(async move {
            sink.run().await;
            let _ = finished_tx.send(true);
        });

        shared.set_run_status(RunStatus::Start);
        Ok(Worker {
            shared,
            watch_thread: Some(watch_thread),
            producer_task: Some(producer_task),
            finished,
        })
    }

    /// Resolves when the producer task ends, which happens only on
    /// shutdown or after the watch thread died and closed the queue.
    pub fn finished_signal(&self) -> watch::Receiver<bool> {
        self.finished.clone()
    }

    pub async fn stop(mut self) {
        self.shared.set_run_status(RunStatus::Stop);
        if let Some(thread) = self.watch_thread.take() {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
        if let Some(task) = self.producer_task.take() {
            let _ = task.await;
        }
        info!(message = "worker stopped");
    }
}

/// Supervisor loop: owns the pidfile and reacts to signals until STOP.
pub async fn run(confdir: &Path, config: Config) -> i32 {
    let config = Arc::new(config);
    let _pidfile = match PidFile::acquire(&config.main.pidfile) {
        Ok(pidfile) => pidfile,
        Err(error) => {
            error!(message = "startup failed", %error);
            return 1;
        }
    };

    let pingback = Pingback::spawn(config.main.pingbackurl.clone());
    pingback.send("START", &[("host", config.host.clone())]);

    let mut worker = match Worker::spawn(Arc::clone(&config), pingback.clone()).await {
        Ok(worker) => worker,
        Err(error) => {
            error!(message = "worker start failed", %error);
            return 1;
        }
    };
    let mut config = config;

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(error) => {
            error!(message = "signal handler install failed", %error);
            return 1;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(error) => {
            error!(message = "signal handler install failed", %error);
            return 1;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(error) => {
            error!(message = "signal handler install failed", %error);
            return 1;
        }
    };

    let exit_code = loop {
        let mut finished = worker.finished_signal();
        tokio::select! {
            _ = sigterm.recv() => {
                info!(message = "termination signal, stopping");
                break 0;
            }
            _ = sigint.recv() => {
                info!(message = "interrupt, stopping");
                break 0;
            }
            _ = sighup.recv() => {
                info!(message = "hangup, reloading configuration");
                match Config::load(confdir) {
                    Ok(new_config) => {
                        let new_config = Arc::new(new_config);
                        match Worker::spawn(Arc::clone(&new_config), pingback.clone()).await {
                            Ok(new_worker) => {
                                let old = std::mem::replace(&mut worker, new_worker);
                                old.stop().await;
                                config = new_config;
                                info!(message = "configuration reloaded");
                            }
                            Err(error) => {
                                error!(message = "reload failed, keeping old worker", %error);
                            }
                        }
                    }
                    Err(error) => {
                        error!(message = "reload failed, keeping old configuration", %error);
                    }
                }
            }
            _ = finished.changed() => {
                if worker.shared.stop_requested() {
                    break 0;
                }
                error!(message = "worker died, respawning");
                let dead = std::mem::replace(
                    &mut worker,
                    match Worker::spawn(Arc::clone(&config), pingback.clone()).await {
                        Ok(new_worker) => new_worker,
                        Err(error) => {
                            error!(message = "respawn failed", %error);
                            break 1;
                        }
                    },
                );
                dead.stop().await;
            }
        }
    };

    worker.stop().await;
    pingback.send("EXIT", &[("host", config.host.clone())]);
    exit_code
}
