//! Remote executor tests against an in-process SSH server on 127.0.0.1
//!
//! The server runs scripted commands: `greet` writes to stdout and stderr
//! and exits 3, `cat` echoes stdin until EOF and exits 0, anything else
//! never answers.

use std::borrow::Cow;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::{Algorithm, PrivateKey, ssh_key};
use russh::server::{self, Auth, Msg, Response, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use cmdr_exec::{BackendKind, Credential, ExecError, KeySource, RemoteExecutor};

const USER: &str = "runner";
const INTERACTIVE_USER: &str = "kbd";
const PASSWORD: &str = "hunter2";

#[derive(Default)]
struct ScriptedHandler {
    echo: Option<ChannelId>,
}

fn finish(session: &mut Session, channel: ChannelId, code: u32) -> Result<(), russh::Error> {
    session.exit_status_request(channel, code)?;
    session.eof(channel)?;
    session.close(channel)
}

impl server::Handler for ScriptedHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == USER && password == PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn auth_keyboard_interactive<'a>(
        &'a mut self,
        user: &str,
        _submethods: &str,
        response: Option<Response<'a>>,
    ) -> Result<Auth, Self::Error> {
        if user != INTERACTIVE_USER {
            return Ok(Auth::reject());
        }
        match response {
            None => Ok(Auth::Partial {
                name: Cow::Borrowed(""),
                instructions: Cow::Borrowed(""),
                prompts: Cow::Owned(vec![(Cow::Borrowed("Password: "), false)]),
            }),
            Some(mut answers) => {
                let answer = answers.next();
                if answer.as_deref() == Some(PASSWORD.as_bytes()) {
                    Ok(Auth::Accept)
                } else {
                    Ok(Auth::reject())
                }
            }
        }
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        match data {
            b"greet" => {
                session.data(channel, CryptoVec::from_slice(b"hello\nworld\n"))?;
                session.extended_data(channel, 1, CryptoVec::from_slice(b"oops\n"))?;
                finish(session, channel, 3)?;
            }
            b"cat" => self.echo = Some(channel),
            _ => {}
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.echo == Some(channel) {
            session.data(channel, CryptoVec::from_slice(data))?;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.echo == Some(channel) {
            finish(session, channel, 0)?;
        }
        Ok(())
    }
}

/// A server accepting a single connection
struct TestServer {
    address: String,
    /// Fires once the connection is gone
    ended: oneshot::Receiver<()>,
}

impl TestServer {
    async fn start() -> Self {
        let mut config = server::Config::default();
        config.auth_rejection_time = Duration::from_millis(10);
        config.auth_rejection_time_initial = Some(Duration::ZERO);
        config.inactivity_timeout = None;
        config
            .keys
            .push(PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap());
        let config = Arc::new(config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (ended_tx, ended_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            if let Ok(running) =
                server::run_stream(config, socket, ScriptedHandler::default()).await
            {
                let _ = running.await;
            }
            let _ = ended_tx.send(());
        });

        Self {
            address,
            ended: ended_rx,
        }
    }

    async fn assert_disconnected(self) {
        tokio::time::timeout(Duration::from_secs(5), self.ended)
            .await
            .expect("connection should be torn down")
            .unwrap();
    }
}

/// Drain a channel in the background, returning everything it carried
fn drain(mut rx: mpsc::Receiver<String>) -> tokio::task::JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    })
}

#[tokio::test]
async fn test_remote_streams_and_exit_code() {
    let server = TestServer::start().await;
    let (out_tx, out_rx) = mpsc::channel(8);
    let (err_tx, err_rx) = mpsc::channel(8);
    let stdout = drain(out_rx);
    let stderr = drain(err_rx);

    let credential = Credential::password(USER, PASSWORD).unwrap();
    let mut executor =
        RemoteExecutor::new(credential, &server.address, None, Some(out_tx), Some(err_tx));
    executor.set_timeout(Duration::from_secs(10));

    let completion = executor.execute("greet").await.unwrap();

    assert_eq!(completion.code, Some(3));
    assert_eq!(stdout.await.unwrap(), vec!["hello\n", "world\n"]);
    assert_eq!(stderr.await.unwrap(), vec!["oops\n"]);

    executor.close().await.unwrap();
    server.assert_disconnected().await;
}

#[tokio::test]
async fn test_remote_keyboard_interactive_auth() {
    let server = TestServer::start().await;
    let (out_tx, out_rx) = mpsc::channel(8);
    let stdout = drain(out_rx);

    let credential = Credential::password(INTERACTIVE_USER, PASSWORD).unwrap();
    let mut executor = RemoteExecutor::new(credential, &server.address, None, Some(out_tx), None);

    let completion = executor.execute("greet").await.unwrap();

    assert_eq!(completion.code, Some(3));
    assert_eq!(stdout.await.unwrap(), vec!["hello\n", "world\n"]);
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_remote_key_auth() {
    let server = TestServer::start().await;
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    // NamedTempFile is created with mode 0600
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(key.to_openssh(ssh_key::LineEnding::LF).unwrap().as_bytes())
        .unwrap();

    let source = KeySource::Path(file.path().to_path_buf());
    let credential = Credential::key(USER, &source).unwrap();
    let mut executor = RemoteExecutor::new(credential, &server.address, None, None, None);

    let completion = executor.execute("greet").await.unwrap();

    assert_eq!(completion.code, Some(3));
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_remote_stdin_round_trip() {
    let server = TestServer::start().await;
    let (in_tx, in_rx) = mpsc::channel(8);
    let (out_tx, out_rx) = mpsc::channel(8);
    let stdout = drain(out_rx);

    let credential = Credential::password(USER, PASSWORD).unwrap();
    let mut executor =
        RemoteExecutor::new(credential, &server.address, Some(in_rx), Some(out_tx), None);
    executor.set_timeout(Duration::from_secs(10));

    let feeder = tokio::spawn(async move {
        for line in ["one\n", "two\n"] {
            in_tx.send(line.to_string()).await.unwrap();
        }
    });

    let completion = executor.execute("cat").await.unwrap();
    feeder.await.unwrap();

    assert!(completion.success());
    assert_eq!(stdout.await.unwrap().concat(), "one\ntwo\n");
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_remote_timeout_disconnects() {
    let server = TestServer::start().await;
    let (out_tx, out_rx) = mpsc::channel(8);
    let stdout = drain(out_rx);

    let credential = Credential::password(USER, PASSWORD).unwrap();
    let mut executor = RemoteExecutor::new(credential, &server.address, None, Some(out_tx), None);
    executor.set_timeout(Duration::from_secs(1));

    let result = tokio::time::timeout(Duration::from_secs(8), executor.execute("hang"))
        .await
        .expect("execute must return after the timeout");

    assert!(matches!(
        result,
        Err(ExecError::Timeout {
            backend: BackendKind::Remote,
            timeout,
        }) if timeout == Duration::from_secs(1)
    ));
    assert!(stdout.await.unwrap().is_empty());
    server.assert_disconnected().await;
    // the session is already gone; closing again is harmless
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_remote_wrong_password() {
    let server = TestServer::start().await;

    let credential = Credential::password(USER, "wrong").unwrap();
    let mut executor = RemoteExecutor::new(credential, &server.address, None, None, None);

    let err = executor.execute("greet").await.unwrap_err();

    assert!(matches!(err, ExecError::Authentication(_)), "{err:?}");
    assert!(!err.is_retryable());
}
