//! Server management - serving the app's static files and health checking them

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{E2eError, E2eResult};

/// Placeholder in server arguments replaced with the chosen port
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Handle to a running static server process
pub struct ServerHandle {
    child: Child,
    pub base_url: String,
    pub port: u16,
}

impl ServerHandle {
    /// Spawn the configured server in `static_dir` and wait until it answers
    pub async fn spawn(config: ServerConfig) -> E2eResult<Self> {
        let port = match config.port {
            Some(port) => port,
            None => find_free_port()?,
        };
        let base_url = format!("http://127.0.0.1:{}", port);

        if !config.static_dir.is_dir() {
            return Err(E2eError::ServerStartup(format!(
                "static directory {} does not exist",
                config.static_dir.display()
            )));
        }

        info!(
            "Serving {} on port {} with {}",
            config.static_dir.display(),
            port,
            config.program
        );

        let mut cmd = Command::new(&config.program);
        cmd.args(config.args_for(port))
            .current_dir(&config.static_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd.spawn().map_err(|e| {
            E2eError::ServerStartup(format!("Failed to spawn {}: {}", config.program, e))
        })?;

        let mut handle = ServerHandle {
            child,
            base_url: base_url.clone(),
            port,
        };

        if let Err(e) = handle.wait_for_healthy(&config.health_path, config.startup_timeout).await {
            let _ = handle.stop();
            return Err(e);
        }

        info!("Server is healthy at {}", base_url);
        Ok(handle)
    }

    /// Wait for the server to answer `health_path` with a success status
    async fn wait_for_healthy(&mut self, health_path: &str, timeout_duration: Duration) -> E2eResult<()> {
        let health_url = format!("{}{}", self.base_url, health_path);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        let start = std::time::Instant::now();
        let mut attempts = 0;

        while start.elapsed() < timeout_duration {
            attempts += 1;

            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(E2eError::ServerStartup(format!(
                    "server exited before becoming healthy ({})",
                    status
                )));
            }

            match client.get(&health_url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(());
                }
                Ok(resp) => {
                    warn!("Health check returned {}", resp.status());
                }
                Err(e) => {
                    if attempts == 1 {
                        info!("Waiting for server to start...");
                    }
                    // Connection refused is expected while server is starting
                    if !e.is_connect() {
                        warn!("Health check error: {}", e);
                    }
                }
            }

            sleep(Duration::from_millis(100)).await;
        }

        Err(E2eError::ServerHealthCheck(attempts))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Stop the server
    pub fn stop(&mut self) -> E2eResult<()> {
        if let Ok(Some(_)) = self.child.try_wait() {
            return Ok(());
        }
        info!("Stopping server (pid: {})", self.child.id());

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(self.child.id() as i32);
            if kill(pid, Signal::SIGTERM).is_ok() {
                std::thread::sleep(Duration::from_millis(200));
            }
        }

        let _ = self.child.kill();
        let _ = self.child.wait();

        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Configuration for spawning the static server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server executable
    pub program: String,

    /// Arguments; `{port}` is replaced with the listening port
    pub args: Vec<String>,

    /// Directory holding index.html, used as the working directory
    pub static_dir: PathBuf,

    /// Port to listen on (None = find free port)
    pub port: Option<u16>,

    /// Path polled until it answers 2xx
    pub health_path: String,

    pub startup_timeout: Duration,
}

impl ServerConfig {
    pub fn new(static_dir: impl Into<PathBuf>) -> Self {
        Self {
            static_dir: static_dir.into(),
            ..Self::default()
        }
    }

    fn args_for(&self, port: u16) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port.to_string()))
            .collect()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec![
                "-m".to_string(),
                "http.server".to_string(),
                PORT_PLACEHOLDER.to_string(),
                "--bind".to_string(),
                "127.0.0.1".to_string(),
            ],
            static_dir: PathBuf::from("."),
            port: None,
            health_path: "/".to_string(),
            startup_timeout: Duration::from_secs(30),
        }
    }
}

/// Find a free port to use
fn find_free_port() -> E2eResult<u16> {
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0")
        .map_err(|e| E2eError::ServerStartup(format!("no free port: {}", e)))?;
    Ok(listener.local_addr()?.port())
}
