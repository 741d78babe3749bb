use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use russh::client::{self, AuthResult, KeyboardInteractiveAuthResponse};
use russh::keys::{self, load_secret_key, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect, MethodKind, MethodSet};
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::transfer::TransferReporter;
use super::{ConnectRequest, EventSink, OutputChunk, OutputLog, RemoteState, StatusReport};
use crate::model::{ConnectionSettings, SessionId, TaskId, TermSize};

const KEYBOARD_INTERACTIVE_MAX_ROUNDS: usize = 4;

#[derive(Clone, Copy, Debug)]
pub struct SshOptions {
    pub keepalive_interval: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(20),
        }
    }
}

#[derive(Debug)]
enum WorkerCommand {
    Input(Vec<u8>),
    Resize(TermSize),
    Disconnect,
}

/// One interactive shell over SSH.
///
/// The channel is owned by a worker task; the rest of the backend talks to it
/// through commands so input never waits on channel reads.
pub struct SshShell {
    session_id: SessionId,
    handle: Arc<client::Handle<TrustingClient>>,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    output: Arc<Mutex<OutputLog>>,
    worker: JoinHandle<()>,
}

impl SshShell {
    pub async fn open(request: ConnectRequest, options: SshOptions, sink: EventSink) -> Result<Self> {
        let ConnectRequest {
            session_id,
            settings,
            size,
            ..
        } = request;

        if settings.host.trim().is_empty() {
            return Err(anyhow!("Host is required"));
        }
        if settings.username.trim().is_empty() {
            return Err(anyhow!("Username is required"));
        }

        let addr = format!("{}:{}", settings.host.trim(), settings.port);
        tracing::info!(session = %session_id, %addr, "connecting");
        let tcp = tokio::net::TcpStream::connect(&addr)
            .await
            .with_context(|| format!("Failed to connect to {addr}"))?;
        let _ = tcp.set_nodelay(true);

        let mut config = client::Config::default();
        // Keep sessions alive indefinitely while idle.
        config.inactivity_timeout = None;
        config.keepalive_interval = Some(options.keepalive_interval);
        // 0 means "do not auto-close after missed keepalive replies".
        config.keepalive_max = 0;
        let config = Arc::new(config);

        let mut handle = client::connect_stream(config, tcp, TrustingClient)
            .await
            .context("SSH handshake failed")?;

        authenticate(&mut handle, &settings, &session_id).await?;

        let mut channel = handle
            .channel_open_session()
            .await
            .context("Failed to open SSH channel")?;
        channel
            .request_pty(
                false,
                "xterm-256color",
                u32::from(size.cols),
                u32::from(size.rows),
                0,
                0,
                &[],
            )
            .await
            .context("Failed to request PTY")?;
        // Some servers ignore the pty type for TERM; set it explicitly as well.
        let _ = channel.set_env(false, "TERM", "xterm-256color").await;
        channel
            .request_shell(true)
            .await
            .context("Failed to start shell")?;
        tracing::info!(session = %session_id, "shell started");

        let handle = Arc::new(handle);
        let output = Arc::new(Mutex::new(OutputLog::default()));
        let (commands, command_rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(run_channel(
            session_id.clone(),
            channel,
            Arc::clone(&handle),
            command_rx,
            Arc::clone(&output),
            sink.clone(),
        ));

        tokio::spawn(report_home_dir(
            session_id.clone(),
            Arc::clone(&handle),
            sink,
        ));

        Ok(Self {
            session_id,
            handle,
            commands,
            output,
            worker,
        })
    }

    pub fn send_input(&self, data: Vec<u8>) -> Result<()> {
        self.commands
            .send(WorkerCommand::Input(data))
            .map_err(|_| anyhow!("SSH worker for {} has stopped", self.session_id))
    }

    pub fn resize(&self, size: TermSize) -> Result<()> {
        self.commands
            .send(WorkerCommand::Resize(size))
            .map_err(|_| anyhow!("SSH worker for {} has stopped", self.session_id))
    }

    pub fn take_buffered_output(&self) -> Vec<OutputChunk> {
        self.output.lock().drain()
    }

    pub fn disconnect(&self) {
        if self.commands.send(WorkerCommand::Disconnect).is_err() {
            // Worker already gone (remote closed); make sure nothing lingers.
            self.worker.abort();
        }
    }

    /// Streams a local file to `remote_path` over a fresh SFTP channel.
    pub fn start_upload(
        &self,
        task: TaskId,
        local_path: PathBuf,
        remote_path: String,
        sink: EventSink,
    ) {
        let handle = Arc::clone(&self.handle);
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            let total = tokio::fs::metadata(&local_path).await.ok().map(|m| m.len());
            let reporter = TransferReporter::new(session_id, task, sink, total);
            reporter.started();
            let result = upload_over_sftp(&handle, &reporter, &local_path, &remote_path).await;
            reporter.finish(result);
        });
    }
}

async fn upload_over_sftp(
    handle: &client::Handle<TrustingClient>,
    reporter: &TransferReporter,
    local_path: &Path,
    remote_path: &str,
) -> Result<u64> {
    let local = tokio::fs::File::open(local_path)
        .await
        .with_context(|| format!("Unable to open {}", local_path.display()))?;
    let sftp = open_sftp(handle).await?;
    let remote = sftp
        .create(remote_path)
        .await
        .with_context(|| format!("Unable to create remote file {remote_path}"))?;
    let written = reporter.pump(local, remote).await?;
    let _ = sftp.close().await;
    Ok(written)
}

async fn open_sftp(handle: &client::Handle<TrustingClient>) -> Result<SftpSession> {
    let channel = handle
        .channel_open_session()
        .await
        .context("Failed to open SFTP channel")?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .context("Failed to request SFTP subsystem")?;
    SftpSession::new(channel.into_stream())
        .await
        .context("Failed to start SFTP session")
}

/// The login directory seeds home-relative path resolution in the UI.
async fn report_home_dir(
    session_id: SessionId,
    handle: Arc<client::Handle<TrustingClient>>,
    sink: EventSink,
) {
    let home = async {
        let sftp = open_sftp(&handle).await?;
        let home = sftp
            .canonicalize(".")
            .await
            .context("Failed to resolve login directory")?;
        let _ = sftp.close().await;
        anyhow::Ok(home)
    }
    .await;

    match home {
        Ok(home) => {
            tracing::debug!(session = %session_id, %home, "resolved remote home");
            sink.status(
                &session_id,
                &StatusReport {
                    state: Some(RemoteState::Connected),
                    home_dir: Some(home),
                    ..Default::default()
                },
            );
        }
        Err(err) => {
            tracing::debug!(session = %session_id, "home directory lookup failed: {err:#}");
        }
    }
}

async fn run_channel(
    session_id: SessionId,
    mut channel: russh::Channel<client::Msg>,
    handle: Arc<client::Handle<TrustingClient>>,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    output: Arc<Mutex<OutputLog>>,
    sink: EventSink,
) {
    let mut writer = channel.make_writer();
    let mut bytes_in = 0u64;
    let mut bytes_out = 0u64;

    let result: Result<()> = async {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(WorkerCommand::Input(data)) => {
                        writer.write_all(&data).await.context("Channel write failed")?;
                        writer.flush().await.context("Channel flush failed")?;
                        bytes_out += data.len() as u64;
                    }
                    Some(WorkerCommand::Resize(size)) => {
                        // Keep the remote PTY in sync with the surface.
                        channel
                            .window_change(u32::from(size.cols), u32::from(size.rows), 0, 0)
                            .await
                            .map_err(|err| anyhow!("Failed to resize PTY: {err}"))?;
                    }
                    Some(WorkerCommand::Disconnect) | None => {
                        let _ = channel.eof().await;
                        let _ = channel.close().await;
                        let _ = handle
                            .disconnect(Disconnect::ByApplication, "", "English")
                            .await;
                        tracing::info!(session = %session_id, "disconnected on request");
                        return Ok(());
                    }
                },
                message = channel.wait() => match message {
                    Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                        bytes_in += data.len() as u64;
                        let chunk = output.lock().record(data.as_ref());
                        sink.output(&session_id, &chunk);
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        tracing::info!(session = %session_id, "channel closed by remote");
                        return Ok(());
                    }
                    Some(_) => {
                        // Ignore other channel events for interactive shell mode.
                    }
                },
            }
        }
    }
    .await;

    let message = match result {
        Ok(()) => None,
        Err(err) => {
            tracing::warn!(session = %session_id, "worker error: {err:#}");
            Some(format!("{err:#}"))
        }
    };
    sink.status(
        &session_id,
        &StatusReport {
            state: Some(RemoteState::Closed),
            bytes_in: Some(bytes_in),
            bytes_out: Some(bytes_out),
            message,
            ..Default::default()
        },
    );
}

fn method_kind_name(method: MethodKind) -> &'static str {
    match method {
        MethodKind::None => "none",
        MethodKind::Password => "password",
        MethodKind::PublicKey => "publickey",
        MethodKind::HostBased => "hostbased",
        MethodKind::KeyboardInteractive => "keyboard-interactive",
    }
}

fn method_set_to_csv(methods: &MethodSet) -> String {
    if methods.is_empty() {
        "none".to_string()
    } else {
        methods
            .iter()
            .map(|m| method_kind_name(*m))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn supports_method(methods: &MethodSet, target: MethodKind) -> bool {
    methods.iter().any(|m| *m == target)
}

/// Returns true once the server has accepted us.
fn apply_auth_result(result: AuthResult, remaining_methods: &mut MethodSet) -> bool {
    match result {
        AuthResult::Success => true,
        AuthResult::Failure {
            remaining_methods: methods,
            ..
        } => {
            *remaining_methods = methods;
            false
        }
    }
}

async fn authenticate(
    session: &mut client::Handle<TrustingClient>,
    settings: &ConnectionSettings,
    session_id: &SessionId,
) -> Result<()> {
    let username = settings.username.trim();
    let mut remaining = MethodSet::empty();

    let offered = session
        .authenticate_none(username)
        .await
        .context("Failed to query server auth methods")?;
    if apply_auth_result(offered, &mut remaining) {
        return Ok(());
    }
    tracing::debug!(
        session = %session_id,
        methods = %method_set_to_csv(&remaining),
        "server auth methods"
    );

    let best_rsa_hash = if supports_method(&remaining, MethodKind::PublicKey) {
        match session.best_supported_rsa_hash().await {
            Ok(v) => v.flatten(),
            Err(err) => {
                tracing::debug!(session = %session_id, "unable to query best RSA hash: {err}");
                None
            }
        }
    } else {
        None
    };

    let key_path = settings.private_key_path.trim();
    if supports_method(&remaining, MethodKind::PublicKey) && !key_path.is_empty() {
        let passphrase = Some(settings.key_passphrase.as_str()).filter(|p| !p.trim().is_empty());
        match authenticate_with_private_key(session, username, Path::new(key_path), passphrase, best_rsa_hash)
            .await
        {
            Ok(result) => {
                if apply_auth_result(result, &mut remaining) {
                    tracing::info!(session = %session_id, "private key authentication succeeded");
                    return Ok(());
                }
            }
            Err(err) => tracing::warn!(session = %session_id, "private key auth failed: {err:#}"),
        }
    }

    #[cfg(unix)]
    if supports_method(&remaining, MethodKind::PublicKey) {
        match authenticate_via_agent(session, username, best_rsa_hash).await {
            Ok(result) => {
                if apply_auth_result(result, &mut remaining) {
                    tracing::info!(session = %session_id, "ssh-agent authentication succeeded");
                    return Ok(());
                }
            }
            Err(err) => tracing::debug!(session = %session_id, "ssh-agent auth failed: {err:#}"),
        }
    }

    let password = settings.password.as_str();
    if supports_method(&remaining, MethodKind::KeyboardInteractive) && !password.is_empty() {
        match authenticate_keyboard_interactive(session, username, password).await {
            Ok(result) => {
                if apply_auth_result(result, &mut remaining) {
                    return Ok(());
                }
            }
            Err(err) => {
                tracing::debug!(session = %session_id, "keyboard-interactive auth failed: {err:#}")
            }
        }
    }

    if supports_method(&remaining, MethodKind::Password) && !password.is_empty() {
        let result = session
            .authenticate_password(username, password.to_string())
            .await
            .context("SSH password authentication failed")?;
        if apply_auth_result(result, &mut remaining) {
            return Ok(());
        }
    }

    Err(anyhow!("SSH authentication failed"))
}

async fn authenticate_with_private_key(
    session: &mut client::Handle<TrustingClient>,
    username: &str,
    private_key: &Path,
    passphrase: Option<&str>,
    best_rsa_hash: Option<keys::HashAlg>,
) -> Result<AuthResult> {
    let key_pair = load_secret_key(private_key, passphrase)
        .with_context(|| format!("Unable to load private key {}", private_key.display()))?;
    let key = PrivateKeyWithHashAlg::new(Arc::new(key_pair), best_rsa_hash);

    session
        .authenticate_publickey(username, key)
        .await
        .context("SSH public key authentication request failed")
}

#[cfg(unix)]
async fn authenticate_via_agent(
    session: &mut client::Handle<TrustingClient>,
    username: &str,
    best_rsa_hash: Option<keys::HashAlg>,
) -> Result<AuthResult> {
    let mut agent = keys::agent::client::AgentClient::connect_env().await?;
    let identities = agent
        .request_identities()
        .await
        .context("Failed to list identities from ssh-agent")?;
    if identities.is_empty() {
        return Err(anyhow!("ssh-agent has no identities"));
    }

    let mut last_failure = AuthResult::Failure {
        remaining_methods: MethodSet::empty(),
        partial_success: false,
    };
    for key in identities {
        let hash_alg = match key.algorithm() {
            keys::Algorithm::Rsa { .. } => best_rsa_hash,
            _ => None,
        };
        let result = session
            .authenticate_publickey_with(username, key, hash_alg, &mut agent)
            .await
            .context("ssh-agent signing/authentication failed")?;
        match result {
            AuthResult::Success => return Ok(AuthResult::Success),
            failure @ AuthResult::Failure { .. } => last_failure = failure,
        }
    }
    Ok(last_failure)
}

/// Answers hidden prompts with the saved password; anything else fails.
async fn authenticate_keyboard_interactive(
    session: &mut client::Handle<TrustingClient>,
    username: &str,
    password: &str,
) -> Result<AuthResult> {
    let mut reply = session
        .authenticate_keyboard_interactive_start(username, None::<String>)
        .await
        .context("SSH keyboard-interactive request failed")?;

    for _ in 0..KEYBOARD_INTERACTIVE_MAX_ROUNDS {
        match reply {
            KeyboardInteractiveAuthResponse::Success => return Ok(AuthResult::Success),
            KeyboardInteractiveAuthResponse::Failure {
                remaining_methods,
                partial_success,
            } => {
                return Ok(AuthResult::Failure {
                    remaining_methods,
                    partial_success,
                });
            }
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                if prompts.iter().any(|p| p.echo) {
                    return Err(anyhow!("Server asked for interactive input"));
                }
                let responses = prompts.iter().map(|_| password.to_string()).collect();
                reply = session
                    .authenticate_keyboard_interactive_respond(responses)
                    .await
                    .context("SSH keyboard-interactive response failed")?;
            }
        }
    }
    Err(anyhow!("Too many keyboard-interactive rounds"))
}

pub(crate) struct TrustingClient;

impl client::Handler for TrustingClient {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        async { Ok(true) }
    }
}
