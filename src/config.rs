use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    process::Command,
};

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

/// Capacity of a reader's line buffer. A line longer than this is dropped.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// A single tail pass reads at most this many bytes before yielding and
/// raising the tail-limit flag.
pub const MAX_TAIL_BYTES: u64 = 50 * MAX_LINE_BYTES as u64;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("unable to read {}: {source}", path.display()))]
    Read { path: PathBuf, source: io::Error },

    #[snafu(display("unable to parse {}: {source}", path.display()))]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("hostshell `{cmd}` failed: {detail}"))]
    HostShell { cmd: String, detail: String },

    #[snafu(display("{}: {detail}", path.display()))]
    InvalidSpec { path: PathBuf, detail: String },

    #[snafu(display("no *.spec.json found in {}", dir.display()))]
    NoSpecs { dir: PathBuf },
}

/// Where a reader positions itself when it first opens a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartFrom {
    /// Resume from the offset store, falling back to the beginning.
    LogStart,
    /// Always the beginning.
    Start,
    /// Resume from the offset store, falling back to the end.
    LogEnd,
    /// The end, aligned back to the previous newline.
    End,
}

/// Which transform a spec runs. Exactly one may be configured; none at
/// all means a plain copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformKind {
    Copy,
    Filter(Vec<i32>),
    Grep(String),
    Map(String),
    Aggregate(String),
}

fn default_true() -> bool {
    true
}

fn default_startpos() -> StartFrom {
    StartFrom::LogStart
}

/// Declarative description of one tailed file. Supplied by an external
/// collaborator as validated JSON; immutable for the life of a worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSpec {
    /// Source path. With `file_with_time_format` it may carry strftime
    /// placeholders which are re-resolved every housekeeping pass.
    pub file: PathBuf,
    pub topic: String,
    #[serde(default = "default_startpos")]
    pub startpos: StartFrom,
    /// Fixed partition; `None` defers to `autoparti` or the process default.
    #[serde(default)]
    pub partition: Option<i32>,
    #[serde(default)]
    pub autoparti: bool,
    /// Fast path: ship everything up to the last newline as one record.
    #[serde(default)]
    pub rawcopy: bool,
    #[serde(default)]
    pub autocreat: bool,
    #[serde(default)]
    pub file_with_time_format: bool,
    /// 1-based timestamp column; negatives index from the end.
    #[serde(default)]
    pub timeidx: Option<i32>,
    #[serde(default = "default_true")]
    pub withhost: bool,
    #[serde(default = "default_true")]
    pub withtime: bool,
    #[serde(default = "default_true")]
    pub autonl: bool,
    /// Extra accumulation key for aggregate output.
    #[serde(default)]
    pub pkey: Option<String>,
    #[serde(default)]
    pub md5sum: bool,
    #[serde(default)]
    pub filter: Option<Vec<i32>>,
    #[serde(default)]
    pub grep: Option<String>,
    #[serde(default)]
    pub transform: Option<String>,
    #[serde(default)]
    pub aggregate: Option<String>,
    /// Lua file (relative to the confdir) holding the grep / transform /
    /// aggregate functions.
    #[serde(default)]
    pub script: Option<PathBuf>,
}

impl FileSpec {
    pub fn transform_kind(&self) -> TransformKind {
        if let Some(indexes) = &self.filter {
            TransformKind::Filter(indexes.clone())
        } else if let Some(name) = &self.grep {
            TransformKind::Grep(name.clone())
        } else if let Some(name) = &self.transform {
            TransformKind::Map(name.clone())
        } else if let Some(name) = &self.aggregate {
            TransformKind::Aggregate(name.clone())
        } else {
            TransformKind::Copy
        }
    }

    pub fn needs_script(&self) -> bool {
        self.grep.is_some() || self.transform.is_some() || self.aggregate.is_some()
    }

    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let selectors = [
            self.filter.is_some(),
            self.grep.is_some(),
            self.transform.is_some(),
            self.aggregate.is_some(),
        ]
        .iter()
        .filter(|s| **s)
        .count();
        if selectors > 1 {
            return InvalidSpecSnafu {
                path,
                detail: "at most one of filter/grep/transform/aggregate",
            }
            .fail();
        }
        if self.aggregate.is_some() && self.timeidx.is_none() {
            return InvalidSpecSnafu {
                path,
                detail: "aggregate requires timeidx",
            }
            .fail();
        }
        if self.needs_script() && self.script.is_none() {
            return InvalidSpecSnafu {
                path,
                detail: "grep/transform/aggregate require a script",
            }
            .fail();
        }
        if self.rawcopy && self.transform_kind() != TransformKind::Copy {
            return InvalidSpecSnafu {
                path,
                detail: "rawcopy excludes transforms",
            }
            .fail();
        }
        if let Some(indexes) = &self.filter {
            if indexes.is_empty() || indexes.contains(&0) {
                return InvalidSpecSnafu {
                    path,
                    detail: "filter indexes are 1-based and non-empty",
                }
                .fail();
            }
        }
        Ok(())
    }
}

/// Process-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MainConfig {
    /// Shell command producing the host tag. `host` wins when both are set.
    #[serde(default)]
    pub hostshell: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    pub pidfile: PathBuf,
    pub brokers: String,
    /// Process-wide default partition for specs without one.
    #[serde(default)]
    pub partition: Option<i32>,
    /// Rate cap applied after every watch-loop iteration, in milliseconds.
    #[serde(default)]
    pub polllimit: u64,
    /// Quiet period required after a rename before the rotation commits.
    #[serde(default = "default_rotate_delay")]
    pub rotatedelay: u64,
    #[serde(default)]
    pub pingbackurl: Option<String>,
    /// Home of the offset table.
    pub libdir: PathBuf,
    pub logdir: PathBuf,
    #[serde(default)]
    pub kafka_global: BTreeMap<String, String>,
    #[serde(default)]
    pub kafka_topic: BTreeMap<String, String>,
}

fn default_rotate_delay() -> u64 {
    5
}

/// A loaded configuration: main settings, the ordered spec set and the
/// resolved host tag.
#[derive(Debug, Clone)]
pub struct Config {
    pub dir: PathBuf,
    pub main: MainConfig,
    pub specs: Vec<FileSpec>,
    pub host: String,
}

impl Config {
    /// Load `<dir>/main.json` plus every `<dir>/*.spec.json`, sorted by
    /// file name so spec indexes are stable across reloads.
    pub fn load(dir: &Path) -> Result<Config, ConfigError> {
        let main_path = dir.join("main.json");
        let raw = fs::read_to_string(&main_path).context(ReadSnafu { path: &main_path })?;
        let main: MainConfig =
            serde_json::from_str(&raw).context(ParseSnafu { path: &main_path })?;

        let mut spec_paths = Vec::new();
        let entries = fs::read_dir(dir).context(ReadSnafu { path: dir })?;
        for entry in entries {
            let entry = entry.context(ReadSnafu { path: dir })?;
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".spec.json"))
            {
                spec_paths.push(path);
            }
        }
        spec_paths.sort();
        if spec_paths.is_empty() {
            return NoSpecsSnafu { dir }.fail();
        }

        let mut specs = Vec::with_capacity(spec_paths.len());
        for path in &spec_paths {
            let raw = fs::read_to_string(path).context(ReadSnafu { path })?;
            let mut spec: FileSpec =
                serde_json::from_str(&raw).context(ParseSnafu { path })?;
            spec.validate(path)?;
            if let Some(script) = &spec.script {
                if script.is_relative() {
                    spec.script = Some(dir.join(script));
                }
            }
            specs.push(spec);
        }

        let host = match (&main.host, &main.hostshell) {
            (Some(host), _) => host.clone(),
            (None, Some(cmd)) => run_hostshell(cmd)?,
            (None, None) => HostShellSnafu {
                cmd: "<unset>",
                detail: "either host or hostshell is required",
            }
            .fail()?,
        };

        Ok(Config {
            dir: dir.to_path_buf(),
            main,
            specs,
            host,
        })
    }

    /// Low byte of the host's IPv4 address in network order, for the
    /// auto partitioner. `None` when the host does not resolve.
    pub fn host_addr_byte(&self) -> Option<u8> {
        use std::net::ToSocketAddrs;
        (self.host.as_str(), 0u16)
            .to_socket_addrs()
            .ok()?
            .find_map(|addr| match addr.ip() {
                std::net::IpAddr::V4(v4) => Some(v4.octets()[3]),
                std::net::IpAddr::V6(_) => None,
            })
    }
}

fn run_hostshell(cmd: &str) -> Result<String, ConfigError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .map_err(|e| ConfigError::HostShell {
            cmd: cmd.to_string(),
            detail: e.to_string(),
        })?;
    if !output.status.success() {
        return HostShellSnafu {
            cmd,
            detail: format!("exit {:?}", output.status.code()),
        }
        .fail();
    }
    let host = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if host.is_empty() {
        return HostShellSnafu {
            cmd,
            detail: "empty output",
        }
        .fail();
    }
    Ok(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_json(extra: &str) -> String {
        format!(
            r#"{{"file": "/var/log/app.log", "topic": "app"{}{extra}}}"#,
            if extra.is_empty() { "" } else { ", " }
        )
    }

    #[test]
    fn spec_defaults() {
        let spec: FileSpec = serde_json::from_str(&spec_json("")).unwrap();
        assert_eq!(spec.startpos, StartFrom::LogStart);
        assert!(spec.withhost && spec.withtime && spec.autonl);
        assert!(!spec.rawcopy && !spec.md5sum);
        assert_eq!(spec.transform_kind(), TransformKind::Copy);
    }

    #[test]
    fn spec_transform_selection() {
        let spec: FileSpec =
            serde_json::from_str(&spec_json(r#""filter": [4, 5, -1], "timeidx": 4"#)).unwrap();
        assert_eq!(spec.transform_kind(), TransformKind::Filter(vec![4, 5, -1]));
    }

    #[test]
    fn aggregate_requires_timeidx() {
        let spec: FileSpec = serde_json::from_str(&spec_json(
            r#""aggregate": "aggregate", "script": "app.lua""#,
        ))
        .unwrap();
        assert!(spec.validate(Path::new("app.spec.json")).is_err());
    }

    #[test]
    fn conflicting_selectors_rejected() {
        let spec: FileSpec = serde_json::from_str(&spec_json(
            r#""filter": [1], "grep": "grep", "script": "app.lua""#,
        ))
        .unwrap();
        assert!(spec.validate(Path::new("app.spec.json")).is_err());
    }

    #[test]
    fn load_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("main.json"),
            r#"{"host": "testhost", "pidfile": "/tmp/logship.pid",
                "brokers": "127.0.0.1:9092", "libdir": "/tmp/lib",
                "logdir": "/tmp/log"}"#,
        )
        .unwrap();
        fs::write(dir.path().join("app.spec.json"), spec_json("")).unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.host, "testhost");
        assert_eq!(config.specs.len(), 1);
        assert_eq!(config.main.rotatedelay, 5);
    }
}
