//! SSH command execution using russh crate

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, KeyboardInteractiveAuthResponse};
use russh::keys::{PrivateKeyWithHashAlg, ssh_key};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ExecConfig;
use crate::credential::{Auth, Credential};
use crate::error::ExecError;
use crate::executor::{Channels, ExecOptions, drive};
use crate::result::Completion;
use crate::stream::{Framing, StreamKind, pipe_open_error};
use crate::traits::{BackendKind, PipeReader, PipeWriter, Session, Terminate};

/// Buffer size of the in-memory pipes between the channel and stream tasks
const PIPE_CAPACITY: usize = 64 * 1024;

/// SSH extended data type code for stderr
const EXTENDED_DATA_STDERR: u32 = 1;

type SshHandle = client::Handle<SshClientHandler>;

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all server keys (like StrictHostKeyChecking=no)
        Ok(true)
    }
}

/// Connect to `address` and authenticate with `credential`
#[instrument(skip(credential), fields(user = %credential.user()))]
async fn dial(address: &str, credential: &Credential) -> Result<SshHandle, ExecError> {
    info!(address, "connecting to SSH");

    let config = Arc::new(client::Config::default());
    let mut session = client::connect(config, address, SshClientHandler)
        .await
        .map_err(|e| ExecError::Dial(e.to_string()))?;

    let authenticated = match credential.auth() {
        Auth::Password(password) => {
            authenticate_password(&mut session, credential.user(), password).await?
        }
        Auth::Key(key) => {
            let hash_alg = session
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();
            session
                .authenticate_publickey(
                    credential.user(),
                    PrivateKeyWithHashAlg::new(key.clone(), hash_alg),
                )
                .await
                .map_err(|e| ExecError::Authentication(e.to_string()))?
                .success()
        }
    };

    if !authenticated {
        return Err(ExecError::Authentication(format!(
            "server rejected credentials for {}",
            credential.user()
        )));
    }

    info!(address, "SSH connected and authenticated");
    Ok(session)
}

/// Keyboard-interactive auth answering password prompts, then plain
/// password auth if the server does not offer the former
async fn authenticate_password(
    session: &mut SshHandle,
    user: &str,
    password: &str,
) -> Result<bool, ExecError> {
    let auth_err = |e: russh::Error| ExecError::Authentication(e.to_string());

    let mut response = session
        .authenticate_keyboard_interactive_start(user, None::<String>)
        .await
        .map_err(auth_err)?;

    loop {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::Failure { .. } => break,
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                let answers = prompts
                    .iter()
                    .map(|p| {
                        if p.prompt.to_ascii_lowercase().contains("password") {
                            password.to_string()
                        } else {
                            String::new()
                        }
                    })
                    .collect();
                response = session
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(auth_err)?;
            }
        }
    }

    debug!("keyboard-interactive rejected, trying password auth");
    let result = session
        .authenticate_password(user, password)
        .await
        .map_err(auth_err)?;
    Ok(result.success())
}

/// Forward bytes to an output pipe, dropping it once nobody reads it
async fn forward(pipe: &mut Option<DuplexStream>, data: &[u8]) {
    let failed = match pipe.as_mut() {
        Some(writer) => writer.write_all(data).await.is_err(),
        None => false,
    };
    if failed {
        *pipe = None;
    }
}

/// Pump channel messages into the output pipes until the channel closes
///
/// Returns the exit status the server reported, if any.
async fn pump_channel(
    mut channel: Channel<client::Msg>,
    mut stdout: Option<DuplexStream>,
    mut stderr: Option<DuplexStream>,
    kill: Arc<Notify>,
) -> Option<i32> {
    let mut code = None;

    loop {
        let msg = tokio::select! {
            msg = channel.wait() => msg,
            () = kill.notified() => {
                debug!("channel terminated");
                break;
            }
        };

        match msg {
            Some(ChannelMsg::Data { data }) => forward(&mut stdout, &data).await,
            Some(ChannelMsg::ExtendedData { data, ext }) if ext == EXTENDED_DATA_STDERR => {
                forward(&mut stderr, &data).await;
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                code = Some(exit_status.cast_signed());
            }
            Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                debug!(signal = ?signal_name, "remote command killed by signal");
            }
            Some(ChannelMsg::Eof) => {
                // close the pipes so stream tasks see end of data
                stdout = None;
                stderr = None;
            }
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }

    code
}

/// A session channel on a dialed connection
///
/// Channel data is forwarded to in-memory pipes by a pump task started with
/// the command. Closing the session disconnects its connection.
pub struct RemoteSession {
    handle: Arc<SshHandle>,
    channel: Option<Channel<client::Msg>>,
    stdin: Option<DuplexStream>,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    kill: Arc<Notify>,
    disconnected: Arc<AtomicBool>,
    pump: Option<JoinHandle<Option<i32>>>,
}

impl RemoteSession {
    /// Open a session channel on an authenticated connection
    async fn open(handle: SshHandle) -> Result<Self, ExecError> {
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ExecError::SessionOpen(e.to_string()))?;

        Ok(Self {
            handle: Arc::new(handle),
            channel: Some(channel),
            stdin: None,
            stdout: None,
            stderr: None,
            kill: Arc::new(Notify::new()),
            disconnected: Arc::new(AtomicBool::new(false)),
            pump: None,
        })
    }

    fn ensure_unstarted(&self, stream: StreamKind) -> Result<(), ExecError> {
        if self.channel.is_none() {
            return Err(pipe_open_error(stream, "session already started"));
        }
        Ok(())
    }

    /// Disconnect the session and its connection
    ///
    /// # Errors
    /// Returns `ExecError::Dial` if the disconnect message cannot be sent
    pub async fn close(self) -> Result<(), ExecError> {
        self.kill.notify_one();
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| ExecError::Dial(e.to_string()))?;
        info!("SSH disconnected");
        Ok(())
    }
}

#[async_trait]
impl Session for RemoteSession {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn open_stdin(&mut self) -> Result<PipeWriter, ExecError> {
        self.ensure_unstarted(StreamKind::Stdin)?;
        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        self.stdin = Some(reader);
        Ok(Box::new(writer))
    }

    fn open_stdout(&mut self) -> Result<PipeReader, ExecError> {
        self.ensure_unstarted(StreamKind::Stdout)?;
        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        self.stdout = Some(writer);
        Ok(Box::new(reader))
    }

    fn open_stderr(&mut self) -> Result<PipeReader, ExecError> {
        self.ensure_unstarted(StreamKind::Stderr)?;
        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        self.stderr = Some(writer);
        Ok(Box::new(reader))
    }

    async fn start(&mut self, command: Option<&str>) -> Result<(), ExecError> {
        let command =
            command.ok_or_else(|| ExecError::Start("remote sessions need a command".to_string()))?;
        let channel = self
            .channel
            .take()
            .ok_or_else(|| ExecError::Start("session already started".to_string()))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| ExecError::Start(e.to_string()))?;
        debug!(command, "remote command started");

        if let Some(mut input) = self.stdin.take() {
            let mut writer = channel.make_writer();
            tokio::spawn(async move {
                if let Err(e) = tokio::io::copy(&mut input, &mut writer).await {
                    debug!(error = %e, "remote stdin forwarding stopped");
                }
                // sends EOF on the channel
                let _ = writer.shutdown().await;
            });
        }

        self.pump = Some(tokio::spawn(pump_channel(
            channel,
            self.stdout.take(),
            self.stderr.take(),
            self.kill.clone(),
        )));
        Ok(())
    }

    async fn wait(&mut self) -> Result<Option<i32>, ExecError> {
        let pump = self
            .pump
            .take()
            .ok_or_else(|| ExecError::Wait("session was never started".to_string()))?;
        pump.await.map_err(|e| ExecError::Wait(e.to_string()))
    }

    fn terminator(&self) -> Arc<dyn Terminate> {
        Arc::new(ConnectionKiller {
            handle: self.handle.clone(),
            kill: self.kill.clone(),
            disconnected: self.disconnected.clone(),
        })
    }
}

/// Severs a remote session by closing its connection
struct ConnectionKiller {
    handle: Arc<SshHandle>,
    kill: Arc<Notify>,
    disconnected: Arc<AtomicBool>,
}

#[async_trait]
impl Terminate for ConnectionKiller {
    async fn terminate(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "command timed out", "English")
            .await
        {
            warn!(error = %e, "failed to disconnect timed out session");
        }
        self.kill.notify_one();
    }
}

/// SSH command executor
///
/// Dials a fresh connection for every execution; the connection is single
/// use. One executor drives one execution at a time; `execute` takes
/// `&mut self`, so callers serialize calls on an instance.
pub struct RemoteExecutor {
    credential: Credential,
    address: String,
    channels: Channels,
    options: ExecOptions,
    session: Option<RemoteSession>,
}

impl std::fmt::Debug for RemoteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteExecutor")
            .field("credential", &self.credential)
            .field("address", &self.address)
            .field("options", &self.options)
            .field("connected", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl RemoteExecutor {
    /// Create a new SSH executor
    ///
    /// # Arguments
    /// * `credential` - Authentication material
    /// * `address` - `host:port` to dial
    /// * `stdin`, `stdout`, `stderr` - Channels; `None` leaves a stream unconnected
    #[must_use]
    pub fn new(
        credential: Credential,
        address: impl Into<String>,
        stdin: Option<mpsc::Receiver<String>>,
        stdout: Option<mpsc::Sender<String>>,
        stderr: Option<mpsc::Sender<String>>,
    ) -> Self {
        Self {
            credential,
            address: address.into(),
            channels: Channels::new(stdin, stdout, stderr),
            options: ExecOptions::default(),
            session: None,
        }
    }

    /// Address this executor dials
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Set the wall-clock timeout; zero disables it
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.options.timeout = timeout;
    }

    pub fn set_stdout_framing(&mut self, framing: Framing) {
        self.options.stdout = framing;
    }

    pub fn set_stderr_framing(&mut self, framing: Framing) {
        self.options.stderr = framing;
    }

    /// Install channels for the next execution
    pub fn set_channels(&mut self, channels: Channels) {
        self.channels = channels;
    }

    /// Apply timeout and framing settings
    ///
    /// # Errors
    /// Returns `ExecError::Config` if the settings are invalid
    pub fn apply_config(&mut self, config: &ExecConfig) -> Result<(), ExecError> {
        self.options = config.options()?;
        Ok(())
    }

    #[must_use]
    pub fn options(&self) -> ExecOptions {
        self.options
    }

    /// Run `command` on the remote host to completion
    ///
    /// Closes the previous session, dials, opens a session and streams the
    /// command's stdio through the channels, which are consumed by this call.
    ///
    /// # Errors
    /// Returns `ExecError::Dial`, `ExecError::Authentication` or
    /// `ExecError::SessionOpen` before anything runs, `ExecError::Streams`
    /// if stdio failed and `ExecError::Timeout` if the command outlived the
    /// timeout and the connection was closed
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn execute(&mut self, command: &str) -> Result<Completion, ExecError> {
        if let Err(e) = self.close().await {
            warn!(error = %e, "failed to close previous session");
        }

        debug!(command = %command, timeout = ?self.options.timeout, "executing remote command");

        let handle = dial(&self.address, &self.credential).await?;
        let mut session = RemoteSession::open(handle).await?;
        let channels = std::mem::take(&mut self.channels);
        let result = drive(&mut session, channels, Some(command), self.options).await;
        self.session = Some(session);

        match &result {
            Ok(completion) => debug!(
                command = %command,
                status = ?completion.code,
                duration = ?completion.duration,
                "remote command completed"
            ),
            Err(e) => error!(command = %command, error = %e, "remote command failed"),
        }
        result
    }

    /// Release the last session and its connection
    ///
    /// # Errors
    /// Returns `ExecError::Dial` if disconnection fails
    pub async fn close(&mut self) -> Result<(), ExecError> {
        if let Some(session) = self.session.take() {
            session.close().await?;
        }
        Ok(())
    }
}
