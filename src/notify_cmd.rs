//! External notify hook fired by the receiver when an output file is
//! finalised. The command runs detached with the context passed through
//! the environment; its output lands in a per-partition log.

use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct CmdNotify {
    cmd: Option<PathBuf>,
    datadir: PathBuf,
    topic: String,
    partition: i32,
}

impl CmdNotify {
    pub fn new(cmd: Option<PathBuf>, datadir: &Path, topic: &str, partition: i32) -> CmdNotify {
        CmdNotify {
            cmd,
            datadir: datadir.to_path_buf(),
            topic: topic.to_string(),
            partition,
        }
    }

    /// A mirror rotation finished: `file` is the renamed output,
    /// `orig_file` the sender-side path from the END marker.
    pub fn file_done(&self, file: &Path, orig_file: &str, size: Option<u64>, md5: Option<&str>) {
        let mut extra = vec![("NOTIFY_ORIFILE".to_string(), orig_file.to_string())];
        if let Some(size) = size {
            extra.push(("NOTIFY_SIZE".to_string(), size.to_string()));
        }
        if let Some(md5) = md5 {
            extra.push(("NOTIFY_MD5".to_string(), md5.to_string()));
        }
        self.exec(file, extra);
    }

    /// A bucket file was finalised; `bucket_start` is its interval start.
    pub fn bucket_done(&self, file: &Path, bucket_start: i64) {
        self.exec(
            file,
            vec![("NOTIFY_TIMESTAMP".to_string(), bucket_start.to_string())],
        );
    }

    fn exec(&self, file: &Path, extra: Vec<(String, String)>) {
        let Some(cmd) = &self.cmd else { return };

        let log_path = self
            .datadir
            .join(format!("{}.{}.notify.log", self.topic, self.partition));
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path);

        let mut command = Command::new(cmd);
        command
            .env("NOTIFY_TOPIC", &self.topic)
            .env("NOTIFY_PARTITION", self.partition.to_string())
            .env("NOTIFY_FILE", file)
            .envs(extra)
            .stdin(Stdio::null());
        match log {
            Ok(log) => {
                let err = log.try_clone().ok();
                command.stdout(log);
                if let Some(err) = err {
                    command.stderr(err);
                }
            }
            Err(_) => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        match command.spawn() {
            Ok(mut child) => {
                info!(message = "notify command spawned", cmd = %cmd.display(),
                      file = %file.display(), pid = child.id());
                // Reap off-thread; the exit status only matters to the
                // notify log.
                std::thread::spawn(move || {
                    let _ = child.wait();
                });
            }
            Err(error) => {
                error!(message = "notify command failed to spawn", cmd = %cmd.display(), %error);
            }
        }
    }
}
