use std::{
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use portal_process::{ServerState, ServerStatus, SessionId};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::{Mutex, mpsc, oneshot, watch},
};

use crate::{
    error::{PortalError, Result},
    settings::Settings,
    supervisor_support::{is_text_file_busy, kill_stale_instances},
};

pub const STOP_COMMAND: &str = "stop";

const SPAWN_ATTEMPTS: u32 = 3;
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(50);
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub server_dir: PathBuf,
    pub executable: PathBuf,
    pub loader_path_var: Option<String>,
    /// Upper bound for the cumulative output text; `None` keeps everything.
    pub output_limit: Option<usize>,
}

impl SupervisorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            server_dir: settings.server_dir.clone(),
            executable: settings.executable_path(),
            loader_path_var: settings.loader_path_var.clone(),
            output_limit: settings.output_limit(),
        }
    }
}

/// One appended output line. `seq` increases by one per line for the lifetime
/// of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub seq: u64,
    pub line: String,
}

/// Receives every output line appended after [`ServerSupervisor::subscribe`]
/// returned. Dropping it unsubscribes.
#[derive(Debug)]
pub struct OutputSubscription {
    rx: mpsc::UnboundedReceiver<OutputEvent>,
}

impl OutputSubscription {
    /// `None` once the supervisor is gone.
    pub async fn recv(&mut self) -> Option<OutputEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<OutputEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, Default)]
struct OutputLog {
    text: String,
    next_seq: u64,
    limit: Option<usize>,
    subscribers: Vec<mpsc::UnboundedSender<OutputEvent>>,
}

impl OutputLog {
    fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    fn push_line(&mut self, line: String) {
        self.text.push_str(&line);
        self.text.push('\n');
        self.trim();

        let event = OutputEvent {
            seq: self.next_seq,
            line,
        };
        self.next_seq += 1;
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Drops whole lines from the front until the text fits the limit. The
    /// newest line is always kept, even when it alone exceeds the limit.
    fn trim(&mut self) {
        let Some(limit) = self.limit else {
            return;
        };
        if self.text.len() <= limit {
            return;
        }
        let body = &self.text[..self.text.len() - 1];
        let last_start = body.rfind('\n').map_or(0, |i| i + 1);
        let excess = self.text.len() - limit;
        let cut = match self.text.as_bytes()[excess..].iter().position(|b| *b == b'\n') {
            Some(i) => excess + i + 1,
            None => last_start,
        };
        self.text.drain(..cut.min(last_start));
    }
}

type SharedLog = Arc<StdMutex<OutputLog>>;

fn append(log: &SharedLog, line: String) {
    log.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push_line(line);
}

#[derive(Debug, Default)]
struct Inner {
    state: ServerState,
    session_id: Option<SessionId>,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    exit_code: Option<i32>,
    message: Option<String>,
}

/// Owns at most one running server process.
///
/// Lifecycle mutations go through `inner`. Output lives behind its own
/// synchronous lock so reader tasks never wait on a command write.
pub struct ServerSupervisor {
    config: SupervisorConfig,
    inner: Arc<Mutex<Inner>>,
    output: SharedLog,
    state_tx: Arc<watch::Sender<ServerState>>,
    kill_tx: StdMutex<Option<oneshot::Sender<()>>>,
}

impl std::fmt::Debug for ServerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSupervisor")
            .field("executable", &self.config.executable)
            .field("state", &self.state())
            .finish()
    }
}

impl ServerSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let output = Arc::new(StdMutex::new(OutputLog::new(config.output_limit)));
        let (state_tx, _) = watch::channel(ServerState::Stopped);
        Self {
            config,
            inner: Arc::new(Mutex::new(Inner::default())),
            output,
            state_tx: Arc::new(state_tx),
            kill_tx: StdMutex::new(None),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        *self.state_tx.borrow()
    }

    pub async fn status(&self) -> ServerStatus {
        let inner = self.inner.lock().await;
        ServerStatus {
            state: inner.state,
            session_id: inner.session_id.clone(),
            pid: inner.pid,
            exit_code: inner.exit_code,
            message: inner.message.clone(),
        }
    }

    /// Snapshot of the cumulative output text.
    pub fn output(&self) -> String {
        self.output
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .text
            .clone()
    }

    pub fn subscribe(&self) -> OutputSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.output
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .subscribers
            .push(tx);
        OutputSubscription { rx }
    }

    pub async fn start(&self) -> Result<SessionId> {
        let mut inner = self.inner.lock().await;
        if inner.state.is_running() {
            return Err(PortalError::State("server is already running".to_string()));
        }

        let exe = self.config.executable.clone();
        if !exe.is_file() {
            return Err(PortalError::Start(format!(
                "server executable not found: {}",
                exe.display()
            )));
        }

        let stale_exe = exe.clone();
        let killed = tokio::task::spawn_blocking(move || kill_stale_instances(&stale_exe))
            .await
            .map_err(|e| PortalError::Start(format!("stale instance cleanup failed: {e}")))?;
        if !killed.is_empty() {
            append(
                &self.output,
                format!("[portal-agent] killed stale server instances: {killed:?}"),
            );
        }

        let mut child = self.spawn_child().await?;
        let pid = child.id();
        let session_id = SessionId::new();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PortalError::Start("server stdin was not captured".to_string()))?;
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, self.output.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, self.output.clone()));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        *self
            .kill_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(kill_tx);

        inner.state = ServerState::Running;
        inner.session_id = Some(session_id.clone());
        inner.pid = pid;
        inner.stdin = Some(stdin);
        inner.exit_code = None;
        inner.message = Some("running".to_string());
        self.state_tx.send_replace(ServerState::Running);

        tracing::info!(
            session_id = %session_id,
            pid = ?pid,
            exe = %exe.display(),
            "server started"
        );
        append(
            &self.output,
            format!(
                "[portal-agent] server started: pid={} session={session_id}",
                pid.map_or_else(|| "?".to_string(), |p| p.to_string())
            ),
        );

        tokio::spawn(wait_for_child(
            child,
            kill_rx,
            readers,
            self.inner.clone(),
            self.output.clone(),
            self.state_tx.clone(),
            session_id.clone(),
        ));

        Ok(session_id)
    }

    async fn spawn_child(&self) -> Result<Child> {
        let mut attempt = 1;
        loop {
            let mut cmd = self.command();
            match cmd.spawn() {
                Ok(child) => return Ok(child),
                Err(e) if is_text_file_busy(&e) && attempt < SPAWN_ATTEMPTS => {
                    tracing::debug!(attempt, "server executable busy, retrying spawn");
                    attempt += 1;
                    tokio::time::sleep(SPAWN_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(PortalError::Start(format!(
                        "spawn {}: {e}",
                        self.config.executable.display()
                    )));
                }
            }
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.executable);
        cmd.current_dir(&self.config.server_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(var) = &self.config.loader_path_var {
            cmd.env(var, &self.config.server_dir);
        }

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    crate::supervisor_support::set_parent_death_signal()?;
                    // Own session, so a ctrl-c at the console does not reach the server.
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        cmd
    }

    /// Writes `command` plus a newline to the server's stdin.
    pub async fn send_command(&self, command: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(stdin) = inner.stdin.as_mut() else {
            return Err(PortalError::State("server is not running".to_string()));
        };

        let mut line = String::with_capacity(command.len() + 1);
        line.push_str(command);
        line.push('\n');
        let res = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        match res {
            Ok(()) => {
                tracing::debug!(command, "command sent");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Err(PortalError::State(
                "server is shutting down (stdin closed)".to_string(),
            )),
            Err(e) => Err(PortalError::State(format!("write server stdin: {e}"))),
        }
    }

    /// Asks the server to stop on its own. Never forces termination.
    pub async fn stop(&self) -> Result<()> {
        self.send_command(STOP_COMMAND).await
    }

    /// Returns `true` when the server was `Stopped` within `timeout`.
    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| !s.is_running())).await,
            Ok(Ok(_))
        )
    }

    /// [`stop`](Self::stop), then kill if the server is still up after
    /// `grace`. `Ok(true)` means it exited on its own.
    pub async fn stop_and_wait(&self, grace: Duration) -> Result<bool> {
        self.stop().await?;
        if self.wait_for_exit(grace).await {
            return Ok(true);
        }
        tracing::warn!(grace_ms = grace.as_millis() as u64, "server ignored stop, killing");
        self.shutdown().await;
        Ok(false)
    }

    /// Kills the server if one is running and waits until it has been reaped.
    pub async fn shutdown(&self) {
        let kill = self
            .kill_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(tx) = kill {
            let _ = tx.send(());
        }
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| !s.is_running()).await;
    }
}

impl Drop for ServerSupervisor {
    fn drop(&mut self) {
        let kill = match self.kill_tx.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = kill {
            let _ = tx.send(());
        }
    }
}

fn spawn_reader<R>(stream: R, output: SharedLog) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                    }
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                    append(&output, String::from_utf8_lossy(&buf).into_owned());
                }
                Err(e) => {
                    tracing::debug!(error = %e, "server output stream closed");
                    break;
                }
            }
        }
    })
}

async fn wait_for_child(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    readers: Vec<tokio::task::JoinHandle<()>>,
    inner: Arc<Mutex<Inner>>,
    output: SharedLog,
    state_tx: Arc<watch::Sender<ServerState>>,
    session_id: SessionId,
) {
    let (res, killed) = tokio::select! {
        res = child.wait() => (res, false),
        // A dropped sender means the supervisor is gone: kill as well.
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(error = %e, "failed to kill server");
            }
            (child.wait().await, true)
        }
    };

    // Let the readers flush what the server printed last.
    for reader in readers {
        let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await;
    }

    let exit_code = res.as_ref().ok().and_then(|s| s.code());
    let message = match &res {
        Ok(_) if killed => "killed".to_string(),
        Ok(status) if status.success() => "exited".to_string(),
        Ok(status) => match status.code() {
            Some(code) => format!("exited with code {code}"),
            None => "terminated by signal".to_string(),
        },
        Err(e) => format!("wait failed: {e}"),
    };

    {
        let mut inner = inner.lock().await;
        inner.state = ServerState::Stopped;
        inner.stdin = None;
        inner.pid = None;
        inner.exit_code = exit_code;
        inner.message = Some(message.clone());
    }

    tracing::info!(session_id = %session_id, exit_code = ?exit_code, killed, "server exited");
    append(
        &output,
        format!("[portal-agent] server exited: {message} (exit_code={exit_code:?})"),
    );
    state_tx.send_replace(ServerState::Stopped);
}
