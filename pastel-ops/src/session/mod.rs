//! Remote sessions over SSH
//!
//! A session owns one live `ssh2` connection to a [`NodeEndpoint`]. Commands
//! run in one of three modes: wait and return output, wait and discard
//! output, or fire-and-forget for daemons that detach themselves. The
//! blocking libssh2 calls are moved to the blocking thread pool so the
//! orchestrator's runtime keeps ticking (signal handling, timers).

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use ssh2::Session;
use std::fmt;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::errors::OpsError;
use crate::execution::combine_output;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// How long `close` waits for an in-flight command before giving up on a clean disconnect
const CLOSE_WAIT: Duration = Duration::from_secs(2);
const DRAIN_BACKOFF: Duration = Duration::from_millis(10);

/// How a session authenticates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Credential {
    KeyFile(PathBuf),
    Password(String),
    /// Keys offered by a running ssh-agent
    Agent,
}

/// Machine reachable over a remote session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credential: Credential,
}

impl fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// One open connection to a remote host
#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn endpoint(&self) -> &NodeEndpoint;

    /// Run and wait, returning trimmed stdout
    async fn run(&self, command: &str) -> Result<String, OpsError>;

    /// Run and wait, ignoring output
    async fn run_discard(&self, command: &str) -> Result<(), OpsError> {
        self.run(command).await.map(|_| ())
    }

    /// Launch and return immediately; the command keeps running after the
    /// channel is gone
    async fn spawn_detached(&self, command: &str) -> Result<(), OpsError>;

    /// Release the connection. Calling it more than once is a no-op.
    fn close(&mut self) -> Result<(), OpsError>;
}

/// Opens sessions; retry policy stays with the caller
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &NodeEndpoint) -> Result<Box<dyn RemoteSession>, OpsError>;
}

/// `ssh2` backed connector
pub struct SshConnector {
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshConnector {
    /// `command_timeout` bounds every remote command, like the local runner's timeout
    pub fn new(connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            command_timeout,
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, endpoint: &NodeEndpoint) -> Result<Box<dyn RemoteSession>, OpsError> {
        let target = endpoint.clone();
        let (connect_timeout, command_timeout) = (self.connect_timeout, self.command_timeout);
        let session =
            tokio::task::spawn_blocking(move || establish_ssh_connection(&target, connect_timeout, command_timeout))
            .await
            .map_err(|e| connection_error(endpoint, e))??;

        info!(endpoint = %endpoint, "SSH session established");
        Ok(Box::new(SshSession {
            endpoint: endpoint.clone(),
            inner: Some(Arc::new(Mutex::new(session))),
            command_timeout: self.command_timeout,
        }))
    }
}

fn connection_error(endpoint: &NodeEndpoint, reason: impl fmt::Display) -> OpsError {
    OpsError::Connection {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    }
}

fn millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

fn establish_ssh_connection(
    endpoint: &NodeEndpoint,
    connect_timeout: Duration,
    command_timeout: Duration,
) -> Result<Session, OpsError> {
    let fail = |reason: &dyn fmt::Display| connection_error(endpoint, reason);

    let addr = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .map_err(|e| fail(&e))?
        .next()
        .ok_or_else(|| fail(&"host did not resolve to any address"))?;
    let tcp = TcpStream::connect_timeout(&addr, connect_timeout).map_err(|e| fail(&e))?;

    let mut sess = Session::new().map_err(|e| fail(&e))?;
    sess.set_timeout(millis(connect_timeout));
    sess.set_tcp_stream(tcp);
    sess.handshake().map_err(|e| fail(&e))?;

    let auth = match &endpoint.credential {
        Credential::KeyFile(path) => sess.userauth_pubkey_file(&endpoint.user, None, path, None),
        Credential::Password(password) => sess.userauth_password(&endpoint.user, password),
        Credential::Agent => sess.userauth_agent(&endpoint.user),
    };
    auth.map_err(|e| fail(&format!("auth failed: {}", e)))?;
    if !sess.authenticated() {
        return Err(fail(&"session not authenticated"));
    }

    // every blocking libssh2 call from here on is bounded
    sess.set_timeout(millis(command_timeout));
    Ok(sess)
}

/// Live `ssh2` session; closes itself on drop if `close` was never called
pub struct SshSession {
    endpoint: NodeEndpoint,
    inner: Option<Arc<Mutex<Session>>>,
    command_timeout: Duration,
}

enum ExecMode {
    Wait,
    Detached,
}

impl SshSession {
    async fn exec(&self, command: &str, mode: ExecMode) -> Result<String, OpsError> {
        let inner = self
            .inner
            .clone()
            .ok_or_else(|| connection_error(&self.endpoint, "session already closed"))?;
        let endpoint = self.endpoint.clone();
        let command = command.to_string();
        let timeout = self.command_timeout;

        tokio::task::spawn_blocking(move || {
            let session = inner.lock();
            exec_blocking(&session, &endpoint, &command, mode, timeout)
        })
        .await
        .map_err(|e| connection_error(&self.endpoint, e))?
    }
}

fn exec_blocking(
    session: &Session,
    endpoint: &NodeEndpoint,
    command: &str,
    mode: ExecMode,
    timeout: Duration,
) -> Result<String, OpsError> {
    let fail = |e: ssh2::Error| exec_failure(endpoint, command, timeout, e.into());

    debug!(endpoint = %endpoint, "Remote exec: {}", command);
    let mut channel = session.channel_session().map_err(fail)?;
    channel.exec(command).map_err(fail)?;

    if let ExecMode::Detached = mode {
        return Ok(String::new());
    }

    // Both streams are drained together: a command that fills the stderr
    // window while stdout is still open would otherwise never finish.
    session.set_blocking(false);
    let drained = drain_streams(channel.stream(0), channel.stderr(), || channel.eof(), timeout);
    session.set_blocking(true);
    let (out, err) = drained.map_err(|e| exec_failure(endpoint, command, timeout, e))?;
    channel.wait_close().map_err(fail)?;

    let code = channel.exit_status().map_err(fail)?;
    if code != 0 {
        return Err(OpsError::Command {
            command: command.to_string(),
            code: Some(code),
            output: combine_output(&out, &err),
        });
    }

    Ok(out.trim().to_string())
}

/// A timed-out remote command reads like a timed-out local one; anything
/// else means the connection itself is in trouble
fn exec_failure(endpoint: &NodeEndpoint, command: &str, timeout: Duration, e: io::Error) -> OpsError {
    if e.kind() == io::ErrorKind::TimedOut {
        OpsError::Command {
            command: command.to_string(),
            code: None,
            output: format!("timed out after {:?}", timeout),
        }
    } else {
        connection_error(endpoint, e)
    }
}

/// Reads whatever is available on either stream until the channel reports
/// EOF with nothing left, or the deadline passes. Both readers must be
/// non-blocking.
fn drain_streams<O: Read, E: Read>(
    mut out: O,
    mut err: E,
    eof: impl Fn() -> bool,
    timeout: Duration,
) -> io::Result<(String, String)> {
    let deadline = Instant::now() + timeout;
    let (mut stdout, mut stderr) = (Vec::new(), Vec::new());
    let mut buf = [0u8; 8192];

    loop {
        let got_out = read_available(&mut out, &mut buf, &mut stdout)?;
        let got_err = read_available(&mut err, &mut buf, &mut stderr)?;
        let progressed = got_out || got_err;

        if !progressed && eof() {
            break;
        }
        if Instant::now() >= deadline {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "remote command did not finish"));
        }
        if !progressed {
            std::thread::sleep(DRAIN_BACKOFF);
        }
    }

    Ok((
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    ))
}

fn read_available(reader: &mut impl Read, buf: &mut [u8], sink: &mut Vec<u8>) -> io::Result<bool> {
    match reader.read(buf) {
        Ok(0) => Ok(false),
        Ok(n) => {
            sink.extend_from_slice(&buf[..n]);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    async fn run(&self, command: &str) -> Result<String, OpsError> {
        self.exec(command, ExecMode::Wait).await
    }

    async fn spawn_detached(&self, command: &str) -> Result<(), OpsError> {
        let detached = format!("nohup {} > /dev/null 2>&1 &", command);
        self.exec(&detached, ExecMode::Detached).await.map(|_| ())
    }

    fn close(&mut self) -> Result<(), OpsError> {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };
        // A command still holding the session is bounded by the session
        // timeout; the connection goes away when its thread lets go.
        let Some(session) = inner.try_lock_for(CLOSE_WAIT) else {
            warn!(endpoint = %self.endpoint, "Remote command still running, dropping SSH session without disconnect");
            return Ok(());
        };
        session
            .disconnect(None, "pastel-ops session closed", None)
            .map_err(|e| connection_error(&self.endpoint, e))?;
        info!(endpoint = %self.endpoint, "SSH session closed");
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(endpoint = %self.endpoint, "Failed to close SSH session: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        let endpoint = NodeEndpoint {
            host: "10.0.0.7".to_string(),
            port: DEFAULT_SSH_PORT,
            user: "ubuntu".to_string(),
            credential: Credential::Agent,
        };
        assert_eq!(endpoint.to_string(), "ubuntu@10.0.0.7:22");
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_is_connection_failure() {
        let endpoint = NodeEndpoint {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: "nobody".to_string(),
            credential: Credential::Agent,
        };
        let connector = SshConnector::new(Duration::from_secs(2), Duration::from_secs(5));
        match connector.connect(&endpoint).await {
            Err(OpsError::Connection { endpoint: shown, .. }) => assert_eq!(shown, "nobody@127.0.0.1:1"),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("connected to a closed port"),
        }
    }

    /// Replays canned reads; an empty queue reads as end of stream
    struct Chunks(std::collections::VecDeque<io::Result<Vec<u8>>>);

    impl Chunks {
        fn new(items: impl IntoIterator<Item = io::Result<Vec<u8>>>) -> Self {
            Self(items.into_iter().collect())
        }
    }

    impl Read for Chunks {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                None => Ok(0),
                Some(Ok(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Err(e)) => Err(e),
            }
        }
    }

    fn would_block() -> io::Result<Vec<u8>> {
        Err(io::ErrorKind::WouldBlock.into())
    }

    #[test]
    fn test_stderr_is_drained_while_stdout_is_pending() {
        let stdout = Chunks::new((0..10).map(|_| would_block()).chain([Ok(b"ok\n".to_vec())]));
        let stderr = Chunks::new((0..64).map(|_| Ok(vec![b'w'; 4096])));

        let (out, err) = drain_streams(stdout, stderr, || true, Duration::from_secs(5)).unwrap();

        assert_eq!(out, "ok\n");
        assert_eq!(err.len(), 64 * 4096);
    }

    #[test]
    fn test_drain_waits_for_eof() {
        let checks = std::cell::Cell::new(0);
        let stdout = Chunks::new([would_block(), would_block(), Ok(b"late".to_vec())]);
        let stderr = Chunks::new((0..3).map(|_| would_block()));

        let (out, _) = drain_streams(
            stdout,
            stderr,
            || {
                checks.set(checks.get() + 1);
                checks.get() > 3
            },
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(out, "late");
    }

    #[test]
    fn test_stalled_command_times_out_as_command_failure() {
        let stalled = || Chunks::new((0..1000).map(|_| would_block()));
        let err = drain_streams(stalled(), stalled(), || false, Duration::from_millis(50)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        let endpoint = NodeEndpoint {
            host: "hot".to_string(),
            port: DEFAULT_SSH_PORT,
            user: "pastel".to_string(),
            credential: Credential::Agent,
        };
        match exec_failure(&endpoint, "pastel-cli getinfo", Duration::from_secs(120), err) {
            OpsError::Command { command, code, output } => {
                assert_eq!(command, "pastel-cli getinfo");
                assert_eq!(code, None);
                assert!(output.contains("timed out"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_close_gives_up_on_busy_session() {
        let inner = Arc::new(Mutex::new(Session::new().unwrap()));
        let mut session = SshSession {
            endpoint: NodeEndpoint {
                host: "hot".to_string(),
                port: DEFAULT_SSH_PORT,
                user: "pastel".to_string(),
                credential: Credential::Agent,
            },
            inner: Some(inner.clone()),
            command_timeout: Duration::from_secs(120),
        };

        let busy = inner.lock();
        let started = Instant::now();
        session.close().unwrap();
        assert!(started.elapsed() >= CLOSE_WAIT);
        assert!(session.inner.is_none());
        drop(busy);

        // second close is a no-op
        session.close().unwrap();
        assert_eq!(Arc::strong_count(&inner), 1);
    }
}
