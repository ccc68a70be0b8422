//! One live provider subprocess, driven by a single actor task.
//!
//! The actor owns the child process, its stdio and the pending-response
//! map. Callers reach it only through [`ProtocolSession`], which sends
//! commands over an mpsc channel and awaits a oneshot reply. When the
//! child exits every pending request resolves as `ProcessExited`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use weave_core::config::McpServerConfig;
use weave_core::error::{Result, WeaveError};

use crate::protocol::{self, Incoming, InitializeResult, RpcError};

/// Longest line accepted from a provider.
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// How long to wait for the child to exit after it closed stdout.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

const CLIENT_NAME: &str = "weave";

type Reply = oneshot::Sender<Result<Value>>;

enum SessionCommand {
    Request {
        id: u64,
        method: String,
        params: Value,
        reply: Reply,
    },
    Notify {
        method: String,
        params: Value,
    },
    Cancel {
        id: u64,
    },
    Shutdown {
        grace: Duration,
        reply: oneshot::Sender<String>,
    },
}

/// Handle to a running provider session.
pub struct ProtocolSession {
    server: String,
    tx: mpsc::Sender<SessionCommand>,
    next_id: AtomicU64,
    exit: watch::Receiver<Option<String>>,
    shutdown_grace: Duration,
    server_info: Option<String>,
}

impl ProtocolSession {
    /// Spawn the provider and complete the `initialize` handshake within
    /// the configured startup timeout.
    pub async fn start(server: &str, config: &McpServerConfig) -> Result<Self> {
        let startup = config.startup_timeout_duration();
        let mut session = Self::spawn(server, config)?;

        match tokio::time::timeout(startup, session.initialize()).await {
            Ok(Ok(())) => Ok(session),
            Ok(Err(e)) => {
                session.shutdown_now().await;
                Err(match e {
                    e @ WeaveError::Protocol { .. } => e,
                    other => WeaveError::protocol(server, format!("handshake failed: {}", other)),
                })
            }
            Err(_) => {
                session.shutdown_now().await;
                Err(WeaveError::protocol(
                    server,
                    format!(
                        "no initialize response within {:.1}s",
                        startup.as_secs_f64()
                    ),
                ))
            }
        }
    }

    fn spawn(server: &str, config: &McpServerConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            WeaveError::protocol(server, format!("failed to spawn '{}': {}", config.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WeaveError::protocol(server, "child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WeaveError::protocol(server, "child stdout unavailable"))?;

        if let Some(stderr) = child.stderr.take() {
            let name = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %name, "{}", line);
                }
            });
        }

        let (tx, rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = watch::channel(None);

        let actor = SessionActor {
            server: server.to_string(),
            child,
            stdin: Some(stdin),
            pending: HashMap::new(),
            exit_tx,
            default_grace: config.shutdown_grace_duration(),
        };
        let lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        tokio::spawn(actor.run(rx, lines));

        info!(server = %server, command = %config.command, "Tool provider spawned");

        Ok(Self {
            server: server.to_string(),
            tx,
            next_id: AtomicU64::new(1),
            exit: exit_rx,
            shutdown_grace: config.shutdown_grace_duration(),
            server_info: None,
        })
    }

    async fn initialize(&mut self) -> Result<()> {
        let params = protocol::initialize_params(CLIENT_NAME, env!("CARGO_PKG_VERSION"));
        let result = self
            .request(protocol::METHOD_INITIALIZE, params)
            .await
            .map_err(|e| match e {
                WeaveError::Remote { message, code, .. } => WeaveError::protocol(
                    &self.server,
                    format!("initialize rejected ({}): {}", code, message),
                ),
                other => other,
            })?;

        if !result.is_object() {
            return Err(WeaveError::protocol(
                &self.server,
                format!("malformed initialize response: {}", result),
            ));
        }
        let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
            WeaveError::protocol(&self.server, format!("malformed initialize response: {}", e))
        })?;

        self.server_info = init
            .server_info
            .as_ref()
            .map(|i| format!("{} {}", i.name, i.version.as_deref().unwrap_or("")).trim().to_string());
        debug!(
            server = %self.server,
            protocol_version = init.protocol_version.as_deref().unwrap_or("unspecified"),
            server_info = self.server_info.as_deref().unwrap_or("unknown"),
            "Handshake complete"
        );

        self.notify(protocol::METHOD_INITIALIZED, serde_json::json!({}))
            .await
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Name/version the provider reported during the handshake.
    pub fn server_info(&self) -> Option<&str> {
        self.server_info.as_deref()
    }

    /// False once the provider process has exited.
    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    fn exited(&self) -> WeaveError {
        WeaveError::ProcessExited {
            server: self.server.clone(),
            status: self
                .exit
                .borrow()
                .clone()
                .unwrap_or_else(|| "session closed".to_string()),
        }
    }

    /// Send a request and wait for the response with the matching id.
    ///
    /// Dropping the returned future before it completes cancels the
    /// request on the provider side.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();

        self.tx
            .send(SessionCommand::Request {
                id,
                method: method.to_string(),
                params,
                reply,
            })
            .await
            .map_err(|_| self.exited())?;

        let mut guard = CancelOnDrop {
            tx: self.tx.clone(),
            id,
            armed: true,
        };
        let result = rx.await;
        guard.armed = false;

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(self.exited()),
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.tx
            .send(SessionCommand::Notify {
                method: method.to_string(),
                params,
            })
            .await
            .map_err(|_| self.exited())
    }

    /// Close stdin, wait up to the grace period, then kill.
    /// Returns the exit status description.
    pub async fn shutdown(&self) -> String {
        self.shutdown_with(self.shutdown_grace).await
    }

    async fn shutdown_now(&self) {
        self.shutdown_with(Duration::ZERO).await;
    }

    async fn shutdown_with(&self, grace: Duration) -> String {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(SessionCommand::Shutdown { grace, reply })
            .await
            .is_err()
        {
            return self
                .exit
                .borrow()
                .clone()
                .unwrap_or_else(|| "already stopped".to_string());
        }
        rx.await.unwrap_or_else(|_| "already stopped".to_string())
    }
}

/// Tells the actor to forget a pending request whose caller went away.
struct CancelOnDrop {
    tx: mpsc::Sender<SessionCommand>,
    id: u64,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.tx.try_send(SessionCommand::Cancel { id: self.id });
        }
    }
}

struct SessionActor {
    server: String,
    child: Child,
    stdin: Option<ChildStdin>,
    pending: HashMap<u64, Reply>,
    exit_tx: watch::Sender<Option<String>>,
    default_grace: Duration,
}

enum Step {
    Continue,
    Exit(String),
}

impl SessionActor {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<SessionCommand>,
        mut lines: FramedRead<ChildStdout, LinesCodec>,
    ) {
        let status = loop {
            let step = tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => Step::Exit(self.terminate(self.default_grace).await),
                },
                line = lines.next() => match line {
                    Some(Ok(line)) => {
                        self.handle_line(&line).await;
                        Step::Continue
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!(server = %self.server, "Discarding oversized line from provider");
                        Step::Continue
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        warn!(server = %self.server, error = %e, "Provider stdout failed");
                        Step::Exit(self.reap().await)
                    }
                    None => Step::Exit(self.reap().await),
                },
            };
            if let Step::Exit(status) = step {
                break status;
            }
        };

        let abandoned = self.pending.len();
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(WeaveError::ProcessExited {
                server: self.server.clone(),
                status: status.clone(),
            }));
        }
        if abandoned > 0 {
            warn!(server = %self.server, abandoned, status = %status, "Provider exited with requests in flight");
        } else {
            info!(server = %self.server, status = %status, "Provider stopped");
        }
        let _ = self.exit_tx.send(Some(status));
    }

    async fn handle_command(&mut self, cmd: SessionCommand) -> Step {
        match cmd {
            SessionCommand::Request {
                id,
                method,
                params,
                reply,
            } => {
                let line = match protocol::encode_request(id, &method, &params) {
                    Ok(line) => line,
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                        return Step::Continue;
                    }
                };
                match self.write_line(&line).await {
                    Ok(()) => {
                        debug!(server = %self.server, id, method = %method, "Request sent");
                        self.pending.insert(id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(WeaveError::ProcessExited {
                            server: self.server.clone(),
                            status: format!("write failed: {}", e),
                        }));
                    }
                }
                Step::Continue
            }
            SessionCommand::Notify { method, params } => {
                if let Ok(line) = protocol::encode_notification(&method, &params) {
                    if let Err(e) = self.write_line(&line).await {
                        warn!(server = %self.server, method = %method, error = %e, "Notification not delivered");
                    }
                }
                Step::Continue
            }
            SessionCommand::Cancel { id } => {
                if self.pending.remove(&id).is_some() {
                    debug!(server = %self.server, id, "Cancelling request");
                    let params = serde_json::json!({
                        "requestId": id,
                        "reason": "cancelled by client",
                    });
                    if let Ok(line) =
                        protocol::encode_notification(protocol::METHOD_CANCELLED, &params)
                    {
                        let _ = self.write_line(&line).await;
                    }
                }
                Step::Continue
            }
            SessionCommand::Shutdown { grace, reply } => {
                let status = self.terminate(grace).await;
                let _ = reply.send(status.clone());
                Step::Exit(status)
            }
        }
    }

    async fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let msg = match protocol::parse_line(line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(server = %self.server, error = %e, "Ignoring malformed line from provider");
                return;
            }
        };

        match msg {
            Incoming::Response { id, outcome } => {
                let outcome = outcome.map_err(|e: RpcError| WeaveError::Remote {
                    server: self.server.clone(),
                    code: e.code,
                    message: e.message,
                });
                self.resolve(&id, outcome);
            }
            Incoming::MalformedResponse { id, reason } => {
                warn!(server = %self.server, id = %id, reason = %reason, "Malformed response from provider");
                let err = WeaveError::protocol(&self.server, reason);
                self.resolve(&id, Err(err));
            }
            Incoming::Request { id, method, .. } => {
                let outcome = if method == protocol::METHOD_PING {
                    Ok(serde_json::json!({}))
                } else {
                    debug!(server = %self.server, method = %method, "Rejecting provider request");
                    Err(RpcError {
                        code: protocol::METHOD_NOT_FOUND,
                        message: format!("method not supported: {}", method),
                        data: None,
                    })
                };
                if let Ok(line) = protocol::encode_response(&id, outcome) {
                    let _ = self.write_line(&line).await;
                }
            }
            Incoming::Notification { method, .. } => {
                debug!(server = %self.server, method = %method, "Provider notification");
            }
        }
    }

    fn resolve(&mut self, id: &Value, outcome: Result<Value>) {
        let slot = protocol::id_as_u64(id).and_then(|id| self.pending.remove(&id));
        match slot {
            Some(reply) => {
                if reply.send(outcome).is_err() {
                    debug!(server = %self.server, id = %id, "Response arrived after caller left");
                }
            }
            None => {
                warn!(server = %self.server, id = %id, "Discarding response with unmatched id");
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin closed"))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    /// Graceful stop: close stdin, wait `grace`, kill if still running.
    async fn terminate(&mut self, grace: Duration) -> String {
        self.stdin.take();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => status.to_string(),
            Ok(Err(e)) => format!("wait failed: {}", e),
            Err(_) => {
                warn!(server = %self.server, grace_ms = grace.as_millis() as u64, "Provider ignored shutdown, killing");
                self.kill().await
            }
        }
    }

    /// The provider closed stdout on its own.
    async fn reap(&mut self) -> String {
        match tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => status.to_string(),
            Ok(Err(e)) => format!("wait failed: {}", e),
            Err(_) => self.kill().await,
        }
    }

    async fn kill(&mut self) -> String {
        match self.child.kill().await {
            Ok(()) => "killed".to_string(),
            Err(e) => format!("kill failed: {}", e),
        }
    }
}
