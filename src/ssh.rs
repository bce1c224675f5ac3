//! Shared SSH plumbing for remote schedulers and filesystems.
//!
//! A [`SshPool`] holds one lazily-opened [`ssh2::Session`] per configured
//! remote. libssh2 sessions are not thread-safe, so every operation runs
//! on the blocking thread pool while holding the session mutex. The pool
//! is shared across jobs within one `SftpFs`/`SlurmScheduler` instance.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use ssh2::Session;

use crate::error::FsError;

fn default_port() -> u16 {
    22
}

/// Configuration for an SSH connection.
///
/// When `username` is absent the name of the user running the service is
/// used. When `password` is absent, agent authentication is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConnectConfig {
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl SshConnectConfig {
    fn effective_username(&self) -> String {
        self.username
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string())
    }
}

/// A shared, lazily-connected SSH session.
#[derive(Clone)]
pub struct SshPool {
    config: SshConnectConfig,
    session: Arc<Mutex<Option<Session>>>,
}

impl SshPool {
    pub fn new(config: SshConnectConfig) -> Self {
        Self {
            config,
            session: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &SshConnectConfig {
        &self.config
    }

    /// Run `f` against the live session on the blocking pool, connecting
    /// first if needed.
    pub async fn with_session<F, T>(&self, f: F) -> Result<T, FsError>
    where
        F: FnOnce(&Session) -> Result<T, FsError> + Send + 'static,
        T: Send + 'static,
    {
        let config = self.config.clone();
        let slot = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| FsError::Permanent("ssh session mutex poisoned".into()))?;
            if guard.is_none() {
                *guard = Some(connect(&config)?);
            }
            let session = guard.as_ref().expect("session just connected");
            let result = f(session);
            if let Err(FsError::Transient(_)) = &result {
                // drop a possibly broken connection so the next attempt
                // starts fresh
                *guard = None;
            }
            result
        })
        .await
        .map_err(|join_err| FsError::Permanent(format!("ssh task panicked: {join_err}")))?
    }

    /// Execute a command line on the remote host.
    ///
    /// Returns `(exit_status, stdout, stderr)`.
    pub async fn run(
        &self,
        command: String,
        stdin: Option<String>,
    ) -> Result<(i32, String, String), FsError> {
        self.with_session(move |session| {
            let mut channel = session
                .channel_session()
                .map_err(|e| FsError::Transient(format!("ssh channel: {e}")))?;
            channel
                .exec(&command)
                .map_err(|e| FsError::Transient(format!("ssh exec: {e}")))?;
            if let Some(input) = stdin {
                channel
                    .write_all(input.as_bytes())
                    .map_err(|e| FsError::Transient(format!("ssh stdin: {e}")))?;
                channel
                    .send_eof()
                    .map_err(|e| FsError::Transient(format!("ssh stdin eof: {e}")))?;
            }
            let mut stdout = String::new();
            channel
                .read_to_string(&mut stdout)
                .map_err(|e| FsError::Transient(format!("ssh stdout: {e}")))?;
            let mut stderr = String::new();
            channel
                .stderr()
                .read_to_string(&mut stderr)
                .map_err(|e| FsError::Transient(format!("ssh stderr: {e}")))?;
            channel
                .wait_close()
                .map_err(|e| FsError::Transient(format!("ssh close: {e}")))?;
            let status = channel
                .exit_status()
                .map_err(|e| FsError::Transient(format!("ssh exit status: {e}")))?;
            Ok((status, stdout, stderr))
        })
        .await
    }

    /// Drop the pooled connection.
    pub fn close(&self) {
        if let Ok(mut guard) = self.session.lock() {
            *guard = None;
        }
    }
}

fn connect(config: &SshConnectConfig) -> Result<Session, FsError> {
    let addr = (config.hostname.as_str(), config.port);
    let stream = TcpStream::connect(addr)
        .map_err(|e| FsError::Transient(format!("connect {}:{}: {e}", config.hostname, config.port)))?;
    let mut session =
        Session::new().map_err(|e| FsError::Permanent(format!("ssh session init: {e}")))?;
    session.set_tcp_stream(stream);
    session
        .handshake()
        .map_err(|e| FsError::Transient(format!("ssh handshake: {e}")))?;

    let username = config.effective_username();
    let auth = match &config.password {
        Some(password) => session.userauth_password(&username, password),
        None => session.userauth_agent(&username),
    };
    // failed authentication will not get better by retrying
    auth.map_err(|e| FsError::Permanent(format!("ssh authentication for {username}: {e}")))?;
    if !session.authenticated() {
        return Err(FsError::Permanent(format!(
            "ssh authentication for {username} was rejected"
        )));
    }
    Ok(session)
}

impl std::fmt::Debug for SshPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshPool")
            .field("hostname", &self.config.hostname)
            .field("port", &self.config.port)
            .finish()
    }
}
