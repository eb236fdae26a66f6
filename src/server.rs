//! The worker service: listeners, accept loop, lifecycle.
//!
//! # Startup order
//! 1. Logging and nice value.
//! 2. Bind the TCP listener (SO_REUSEADDR, port 0 lets the kernel pick)
//!    and the local-domain listener; either may be disabled.
//! 3. Generate or accept the access secret; write the url-file (0600).
//! 4. Install the SIGUSR2 handler (reserved for log-level toggling).
//! 5. Accept until shut down by `quitquitquit` or a signal.
//! 6. Await the user cleanup hook, close listeners, unlink the url- and
//!    sock-files, log a stop line.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use rand::RngCore;
use tokio::net::{TcpListener, TcpSocket, UnixListener};

use crate::builtins;
use crate::config::Config;
use crate::dispatch::{WorkerShared, serve_connection};
use crate::error::{Result, RpcError};
use crate::registry::{Capability, MethodTable, RpcService};
use crate::request::Conn;

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// A worker process: a service, its configuration, and any capability
/// modules composed in.
pub struct Worker<S: RpcService> {
    service: Arc<S>,
    config: Config,
    capabilities: Vec<Box<dyn Capability>>,
}

impl<S: RpcService> Worker<S> {
    pub fn new(service: S, config: Config) -> Worker<S> {
        Worker { service: Arc::new(service), config, capabilities: Vec::new() }
    }

    /// Compose a capability module in (its handlers join the table).
    pub fn with_capability(mut self, capability: impl Capability + 'static) -> Self {
        self.capabilities.push(Box::new(capability));
        self
    }

    /// Run the service until shutdown.  Consumes the worker.
    pub async fn serve(self) -> Result<()> {
        let config = self.config;
        init_logging(&config);

        if config.worker_nice != 0 {
            // Only ever lowers priority; failure is not actionable.
            unsafe {
                libc::nice(config.worker_nice);
            }
        }

        // Listeners
        let mut tcp_listener = None;
        let sock_desc = if config.worker_use_tcp {
            let listener = bind_tcp(&config).await?;
            let desc = listener.local_addr()?.to_string();
            tcp_listener = Some(listener);
            desc
        } else {
            "unix-domain:0".to_owned()
        };

        let mut unix_listener = None;
        if config.worker_use_unixdomain {
            let sock_path = config.sock_file();
            let _ = std::fs::remove_file(&sock_path);
            let listener = UnixListener::bind(&sock_path)?;
            std::fs::set_permissions(&sock_path, std::fs::Permissions::from_mode(0o600))?;
            unix_listener = Some(listener);
        }

        // Identity
        let secret = make_secret(&config);
        let url = make_url(&config, &sock_desc, &secret);
        write_url_file(&config, &url)?;

        let shared =
            build_shared_with(self.service, config.clone(), secret, url.clone(), &self.capabilities);

        tracing::info!(
            worker = %config.worker_name,
            url = %url,
            pid = std::process::id(),
            "worker started"
        );

        // Reserved: log-level toggling.
        let usr2_task = tokio::spawn(async {
            let Ok(mut usr2) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined2())
            else {
                return;
            };
            while usr2.recv().await.is_some() {
                tracing::info!("SIGUSR2: log level toggle requested");
            }
        });

        // Accept loops
        let wake = std::time::Duration::from_secs_f64(config.worker_accept_timeout.max(0.05));
        let mut accept_tasks = Vec::new();
        if let Some(listener) = tcp_listener {
            let shared = shared.clone();
            accept_tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(wake) => {}
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _peer)) => {
                                tokio::spawn(serve_connection(shared.clone(), Conn::Tcp(stream)));
                            }
                            Err(e) => tracing::warn!(error = %e, "tcp accept error"),
                        }
                    }
                }
            }));
        }
        if let Some(listener) = unix_listener {
            let shared = shared.clone();
            accept_tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(wake) => {}
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _peer)) => {
                                tokio::spawn(serve_connection(shared.clone(), Conn::Unix(stream)));
                            }
                            Err(e) => tracing::warn!(error = %e, "unix accept error"),
                        }
                    }
                }
            }));
        }

        wait_for_shutdown(&shared).await;

        // Cleanup: user hook first, then listeners and state files.
        (shared.shutdown_hook)().await;
        for task in &accept_tasks {
            task.abort();
        }
        usr2_task.abort();
        let _ = std::fs::remove_file(config.url_file());
        if config.worker_use_unixdomain {
            let _ = std::fs::remove_file(config.sock_file());
        }
        tracing::info!(
            worker = %config.worker_name,
            pid = std::process::id(),
            "worker stopped"
        );
        Ok(())
    }
}

async fn wait_for_shutdown(shared: &Arc<WorkerShared>) {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();

    let term = async {
        match &mut sigterm {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending().await,
        }
    };
    let int = async {
        match &mut sigint {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = shared.shutdown.notified() => {}
        _ = term => tracing::info!("SIGTERM received"),
        _ = int => tracing::info!("SIGINT received"),
    }
}

async fn bind_tcp(config: &Config) -> Result<TcpListener> {
    let host = config.worker_listen_host.as_str();
    let addr = tokio::net::lookup_host((host, config.worker_listen_port))
        .await?
        .next()
        .ok_or_else(|| RpcError::BadValue(format!("cannot resolve listen host: {host}")))?;
    let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(config.worker_listen_queue)?)
}

// ---------------------------------------------------------------------------
// Identity helpers
// ---------------------------------------------------------------------------

/// The configured fixed secret, or a fresh URL-safe token (18 random
/// bytes, 144 bits).
pub(crate) fn make_secret(config: &Config) -> String {
    if !config.worker_secret.is_empty() {
        return config.worker_secret.clone();
    }
    let mut bytes = [0u8; 18];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE.encode(bytes)
}

fn make_url(config: &Config, sock_desc: &str, secret: &str) -> String {
    if config.worker_url_path.is_empty() {
        format!("http://{sock_desc}/{secret}")
    } else {
        format!("http://{sock_desc}/{}/{secret}", config.worker_url_path.trim_matches('/'))
    }
}

fn write_url_file(config: &Config, url: &str) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(config.url_file())?;
    // An existing file keeps its old mode; pin it down.
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(url.as_bytes())?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared-state construction (also used by the loopback client)
// ---------------------------------------------------------------------------

pub(crate) fn build_shared<S: RpcService>(
    service: Arc<S>,
    config: Config,
    url: &str,
) -> Arc<WorkerShared> {
    let secret = make_secret(&config);
    build_shared_with(service, config, secret, url.to_owned(), &[])
}

fn build_shared_with<S: RpcService>(
    service: Arc<S>,
    config: Config,
    secret: String,
    url: String,
    capabilities: &[Box<dyn Capability>],
) -> Arc<WorkerShared> {
    let fallback_service = service.clone();
    let hook_service = service.clone();
    let shared = Arc::new(WorkerShared {
        config: std::sync::RwLock::new(config),
        methods: std::sync::OnceLock::new(),
        secret,
        url,
        start_time: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
        shutdown: tokio::sync::Notify::new(),
        fallback: Box::new(move |req| fallback_service.fallback(req)),
        shutdown_hook: Box::new(move || hook_service.shutdown()),
    });

    let mut table = MethodTable::new();
    service.register(&mut table);
    for capability in capabilities {
        capability.register(&mut table);
    }
    builtins::register(&mut table, &shared);
    let _ = shared.methods.set(table);
    shared
}

/// Initialise the tracing subscriber; the config's log level wins over the
/// environment when set.  Safe to call more than once.
pub fn init_logging(config: &Config) {
    use tracing_subscriber::EnvFilter;
    let filter = if config.worker_log_level.is_empty() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::new(&config.worker_log_level)
    };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secrets_are_urlsafe_and_long_enough() {
        let mut config = Config::new("t");
        config.worker_secret = String::new();
        let secret = make_secret(&config);
        // 18 bytes of entropy encode to 24 base64 characters.
        assert_eq!(secret.len(), 24);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(secret, make_secret(&config));
    }

    #[test]
    fn fixed_secret_is_used_verbatim() {
        let mut config = Config::new("t");
        config.worker_secret = "SECRET".to_owned();
        assert_eq!(make_secret(&config), "SECRET");
    }

    #[test]
    fn url_embeds_prefix_and_secret() {
        let mut config = Config::new("t");
        assert_eq!(make_url(&config, "127.0.0.1:80", "s3cr3t"), "http://127.0.0.1:80/s3cr3t");
        config.worker_url_path = "api/".to_owned();
        assert_eq!(
            make_url(&config, "127.0.0.1:80", "s3cr3t"),
            "http://127.0.0.1:80/api/s3cr3t"
        );
    }

    #[test]
    fn url_file_is_mode_0600() {
        use std::os::unix::fs::MetadataExt;
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new("t");
        config.app_state_dir = dir.path().to_path_buf();
        config.worker_name = "perms".to_owned();
        write_url_file(&config, "http://127.0.0.1:1/x").unwrap();
        let mode = std::fs::metadata(config.url_file()).unwrap().mode() & 0o777;
        assert!(mode <= 0o600, "url file mode {mode:o}");
    }
}
