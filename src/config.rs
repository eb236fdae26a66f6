//! Worker configuration loading.
//!
//! Options are name-typed and come from three layers, later wins:
//! in-code defaults, a text config file, command-line flags.  Both file and
//! flags use the same `key=val` syntax (flags carry a `--` prefix, the file
//! may; `#` starts a comment).  Only the fixed whitelist below is accepted;
//! unknown flags are fatal when the loader is strict.
//!
//! # File format
//! ```text
//! # one option per line
//! worker_name = sorter
//! worker-listen-port = 8700
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::http::HttpLimits;
use crate::value::{Map, Value};

// ---------------------------------------------------------------------------
// Config record
// ---------------------------------------------------------------------------

/// The full option record for one worker.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: String,
    /// Resolved by `set_defaults` when left empty.
    pub app_data_dir: PathBuf,
    /// Resolved by `set_defaults` when left empty.
    pub app_state_dir: PathBuf,
    pub worker_name: String,
    /// Path of a config file to load (consumed during `configure`).
    pub worker_config: String,
    pub worker_nice: i32,
    /// Mode for created state/data directories.
    pub worker_umask: u32,
    /// Fixed access secret; empty means generate one per start.
    pub worker_secret: String,
    pub worker_listen_queue: u32,
    /// Accept-loop wake interval, seconds.
    pub worker_accept_timeout: f64,
    pub worker_listen_host: String,
    /// 0 lets the kernel choose.
    pub worker_listen_port: u16,
    /// Optional static URL path prefix, stripped before authentication.
    pub worker_url_path: String,
    pub worker_use_tcp: bool,
    pub worker_use_unixdomain: bool,
    /// Prefer binary-pack bodies on calls (JSON otherwise).
    pub worker_prefer_msgpack: bool,
    /// An `EnvFilter` directive; empty defers to the environment.
    pub worker_log_level: String,
    pub worker_http_request_timeout1: f64,
    pub worker_http_request_timeout2: f64,
    pub worker_http_request_max_size: usize,
}

impl Config {
    pub fn new(app_name: &str) -> Config {
        Config {
            app_name: app_name.to_owned(),
            app_data_dir: PathBuf::new(),
            app_state_dir: PathBuf::new(),
            worker_name: "worker".to_owned(),
            worker_config: String::new(),
            worker_nice: 0,
            worker_umask: 0o770,
            worker_secret: String::new(),
            worker_listen_queue: 5,
            worker_accept_timeout: 1.0,
            worker_listen_host: "127.0.0.1".to_owned(),
            worker_listen_port: 0,
            worker_url_path: String::new(),
            worker_use_tcp: true,
            worker_use_unixdomain: true,
            worker_prefer_msgpack: true,
            worker_log_level: String::new(),
            worker_http_request_timeout1: 1.0,
            worker_http_request_timeout2: 15.0,
            worker_http_request_max_size: 1024 * 1024,
        }
    }

    /// Apply `--key=val` arguments.  Returns the arguments that were not
    /// consumed; in strict mode any leftover `--key=val` is an error.
    /// A `--worker-config=<path>` argument loads that file in-place.
    pub fn configure(&mut self, args: &[String], strict: bool) -> Result<Vec<String>, ConfigError> {
        let mut unconsumed = Vec::new();
        for arg in args {
            let Some(kv) = arg.strip_prefix("--") else {
                unconsumed.push(arg.clone());
                continue;
            };
            let Some((key, val)) = kv.split_once('=') else {
                unconsumed.push(arg.clone());
                continue;
            };
            let key = key.replace('-', "_");
            match self.set(&key, val) {
                Ok(()) => {
                    if key == "worker_config" && !val.is_empty() {
                        self.load_file(Path::new(val))?;
                    }
                }
                Err(ConfigError::UnknownOption(_)) if !strict => unconsumed.push(arg.clone()),
                Err(e) => return Err(e),
            }
        }
        if strict {
            if let Some(bad) = unconsumed.iter().find(|a| a.starts_with("--")) {
                return Err(ConfigError::UnknownOption(bad.clone()));
            }
        }
        self.set_defaults()?;
        Ok(unconsumed)
    }

    /// Load options from a config file (same syntax as the flags, `#` for
    /// comments, the `--` prefix optional).
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("reading config file '{}': {e}", path.display())))?;
        for raw_line in text.lines() {
            let mut line = raw_line.strip_prefix("--").unwrap_or(raw_line);
            if let Some(at) = line.find('#') {
                line = &line[..at];
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, val) = line
                .split_once('=')
                .ok_or_else(|| ConfigError::Parse(format!("not a key=val line: {raw_line:?}")))?;
            self.set(&key.trim().replace('-', "_"), val.trim())?;
        }
        Ok(())
    }

    /// Set one option from its string form.  An empty value restores the
    /// built-in default.
    pub fn set(&mut self, key: &str, val: &str) -> Result<(), ConfigError> {
        let dflt = Config::new(&self.app_name);
        macro_rules! parse {
            ($field:ident, $kind:literal) => {
                if val.is_empty() {
                    dflt.$field
                } else {
                    val.parse().map_err(|_| {
                        ConfigError::InvalidValue(format!("{key}: not {} ({val:?})", $kind))
                    })?
                }
            };
        }
        match key {
            "app_name" => self.app_name = val.to_owned(),
            "app_data_dir" => self.app_data_dir = PathBuf::from(val),
            "app_state_dir" => self.app_state_dir = PathBuf::from(val),
            "worker_name" => self.worker_name = parse!(worker_name, "a name"),
            "worker_config" => self.worker_config = val.to_owned(),
            "worker_nice" => self.worker_nice = parse!(worker_nice, "an integer"),
            "worker_umask" => {
                self.worker_umask = if val.is_empty() {
                    dflt.worker_umask
                } else {
                    u32::from_str_radix(val.trim_start_matches("0o"), 8).map_err(|_| {
                        ConfigError::InvalidValue(format!("{key}: not an octal mode ({val:?})"))
                    })?
                }
            }
            "worker_secret" => self.worker_secret = val.to_owned(),
            "worker_listen_queue" => {
                self.worker_listen_queue = parse!(worker_listen_queue, "an integer");
            }
            "worker_accept_timeout" => {
                self.worker_accept_timeout = parse!(worker_accept_timeout, "a number");
            }
            "worker_listen_host" => self.worker_listen_host = parse!(worker_listen_host, "a host"),
            "worker_listen_port" => self.worker_listen_port = parse!(worker_listen_port, "a port"),
            "worker_url_path" => self.worker_url_path = val.to_owned(),
            "worker_use_tcp" => self.worker_use_tcp = parse_bool(val, dflt.worker_use_tcp),
            "worker_use_unixdomain" => {
                self.worker_use_unixdomain = parse_bool(val, dflt.worker_use_unixdomain);
            }
            "worker_prefer_msgpack" => {
                self.worker_prefer_msgpack = parse_bool(val, dflt.worker_prefer_msgpack);
            }
            "worker_log_level" => self.worker_log_level = val.to_owned(),
            "worker_http_request_timeout1" => {
                self.worker_http_request_timeout1 =
                    parse!(worker_http_request_timeout1, "a number");
            }
            "worker_http_request_timeout2" => {
                self.worker_http_request_timeout2 =
                    parse!(worker_http_request_timeout2, "a number");
            }
            "worker_http_request_max_size" => {
                self.worker_http_request_max_size =
                    parse!(worker_http_request_max_size, "an integer");
            }
            other => return Err(ConfigError::UnknownOption(format!("--{other}"))),
        }
        Ok(())
    }

    /// Resolve the state/data dirs from the platform defaults and create
    /// them (with the configured mode) when missing.
    pub fn set_defaults(&mut self) -> Result<(), ConfigError> {
        if self.app_state_dir.as_os_str().is_empty() {
            let base = dirs::state_dir()
                .or_else(dirs::data_local_dir)
                .unwrap_or_else(|| PathBuf::from("."));
            self.app_state_dir = base.join(&self.app_name);
        }
        if self.app_data_dir.as_os_str().is_empty() {
            let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
            self.app_data_dir = base.join(&self.app_name);
        }
        for dir in [&self.app_state_dir, &self.app_data_dir] {
            if !dir.exists() {
                use std::os::unix::fs::DirBuilderExt;
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(self.worker_umask)
                    .create(dir)
                    .map_err(|e| {
                        ConfigError::Io(format!("creating '{}': {e}", dir.display()))
                    })?;
            }
        }
        Ok(())
    }

    /// Where the worker advertises its TCP address and secret.
    pub fn url_file(&self) -> PathBuf {
        self.app_state_dir.join(format!("{}.url", self.worker_name))
    }

    /// Where the worker binds its local-domain listener.
    pub fn sock_file(&self) -> PathBuf {
        self.app_state_dir.join(format!("{}.sock", self.worker_name))
    }

    pub fn http_limits(&self) -> HttpLimits {
        HttpLimits {
            max_size: self.worker_http_request_max_size,
            timeout1: Duration::from_secs_f64(self.worker_http_request_timeout1),
            timeout2: Duration::from_secs_f64(self.worker_http_request_timeout2),
        }
    }

    /// The full option set as a value map (the `config` handler's payload).
    pub fn as_value(&self) -> Value {
        let mut map = Map::new();
        for (key, val) in self.entries() {
            map.insert(key.to_owned(), Value::Str(val));
        }
        Value::Map(map)
    }

    /// All options as `--key=val` argument strings (also the `config`
    /// handler's text rendering, and what a spawned child is handed).
    pub fn to_args(&self) -> Vec<String> {
        self.entries().into_iter().map(|(k, v)| format!("--{k}={v}")).collect()
    }

    fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("app_name", self.app_name.clone()),
            ("app_data_dir", self.app_data_dir.display().to_string()),
            ("app_state_dir", self.app_state_dir.display().to_string()),
            ("worker_name", self.worker_name.clone()),
            ("worker_config", self.worker_config.clone()),
            ("worker_nice", self.worker_nice.to_string()),
            ("worker_umask", format!("0o{:o}", self.worker_umask)),
            ("worker_secret", self.worker_secret.clone()),
            ("worker_listen_queue", self.worker_listen_queue.to_string()),
            ("worker_accept_timeout", self.worker_accept_timeout.to_string()),
            ("worker_listen_host", self.worker_listen_host.clone()),
            ("worker_listen_port", self.worker_listen_port.to_string()),
            ("worker_url_path", self.worker_url_path.clone()),
            ("worker_use_tcp", self.worker_use_tcp.to_string()),
            ("worker_use_unixdomain", self.worker_use_unixdomain.to_string()),
            ("worker_prefer_msgpack", self.worker_prefer_msgpack.to_string()),
            ("worker_log_level", self.worker_log_level.clone()),
            (
                "worker_http_request_timeout1",
                self.worker_http_request_timeout1.to_string(),
            ),
            (
                "worker_http_request_timeout2",
                self.worker_http_request_timeout2.to_string(),
            ),
            (
                "worker_http_request_max_size",
                self.worker_http_request_max_size.to_string(),
            ),
        ]
    }
}

fn parse_bool(val: &str, dflt: bool) -> bool {
    if val.is_empty() { dflt } else { Value::Str(val.to_owned()).truthy() }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    UnknownOption(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::UnknownOption(s) => write!(f, "Unrecognized option: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for crate::error::RpcError {
    fn from(e: ConfigError) -> Self {
        crate::error::RpcError::BadValue(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::new("whisker-test");
        config.app_state_dir = dir.to_path_buf();
        config.app_data_dir = dir.to_path_buf();
        config
    }

    #[test]
    fn flags_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config
            .configure(
                &args(&["--worker-name=sorter", "--worker-listen-port=8700", "--worker-use-tcp=n"]),
                true,
            )
            .unwrap();
        assert_eq!(config.worker_name, "sorter");
        assert_eq!(config.worker_listen_port, 8700);
        assert!(!config.worker_use_tcp);
    }

    #[test]
    fn unknown_flags_are_fatal_only_in_strict_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        assert!(config.configure(&args(&["--no-such-option=1"]), true).is_err());

        let mut config = test_config(dir.path());
        let rest = config.configure(&args(&["--no-such-option=1", "ping"]), false).unwrap();
        assert_eq!(rest, args(&["--no-such-option=1", "ping"]));
    }

    #[test]
    fn config_file_applies_with_comments() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("worker.conf");
        std::fs::write(
            &file,
            "# comment\nworker_name = filed\n--worker-listen-port=9900  # inline\n\n",
        )
        .unwrap();
        let mut config = test_config(dir.path());
        config
            .configure(&args(&[&format!("--worker-config={}", file.display())]), true)
            .unwrap();
        assert_eq!(config.worker_name, "filed");
        assert_eq!(config.worker_listen_port, 9900);
    }

    #[test]
    fn empty_value_restores_the_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.set("worker_listen_port", "1234").unwrap();
        config.set("worker_listen_port", "").unwrap();
        assert_eq!(config.worker_listen_port, 0);
    }

    #[test]
    fn bad_typed_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        assert!(config.set("worker_listen_port", "meow").is_err());
        assert!(config.set("worker_nice", "soft").is_err());
    }

    #[test]
    fn url_and_sock_files_derive_from_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.worker_name = "kitty".to_owned();
        assert!(config.url_file().ends_with("kitty.url"));
        assert!(config.sock_file().ends_with("kitty.sock"));
    }

    #[test]
    fn to_args_round_trips_through_configure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.worker_name = "echoed".to_owned();
        config.worker_listen_port = 4242;
        let rendered = config.to_args();

        let mut reloaded = Config::new("other");
        reloaded.configure(&rendered, true).unwrap();
        assert_eq!(reloaded.worker_name, "echoed");
        assert_eq!(reloaded.worker_listen_port, 4242);
        assert_eq!(reloaded.app_state_dir, config.app_state_dir);
    }
}
