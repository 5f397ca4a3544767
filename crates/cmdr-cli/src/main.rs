//! cmdr CLI
//!
//! Runs a command locally or over SSH, printing its output as it arrives

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use cmdr_exec::{Completion, ConnectionInfo, ExecConfig, LocalExecutor, RemoteExecutor};
use color_eyre::Result;
use eyre::{WrapErr, eyre};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

mod config;

use config::{Config, LogConfig};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Parser)]
#[command(name = "cmdr", version)]
#[command(about = "Run a command locally or over SSH with streamed output", long_about = None)]
struct Cli {
    /// Config file (defaults to $CMDR_CONFIG, ./cmdr.toml, /etc/cmdr/cmdr.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Kill the command after this many seconds (0 disables the timeout)
    #[arg(short, long, global = true)]
    timeout: Option<u64>,

    /// Emit output in chunks of at most this many bytes instead of records
    #[arg(long, global = true)]
    max_bytes: Option<usize>,

    /// Record delimiter for output (default newline)
    #[arg(long, global = true)]
    delimiter: Option<char>,

    /// Forward our own stdin to the command
    #[arg(long, global = true)]
    stdin: bool,

    /// Print the completion summary as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a local program
    Local {
        /// Program to run
        program: String,
        /// Arguments passed to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run a command line on a remote host over SSH
    Remote(RemoteArgs),
}

#[derive(Args)]
struct RemoteArgs {
    /// Remote host (overrides [remote].host)
    #[arg(long)]
    host: Option<String>,

    /// SSH port
    #[arg(short, long)]
    port: Option<u16>,

    /// Login user
    #[arg(short, long)]
    user: Option<String>,

    /// Password for password or keyboard-interactive auth
    #[arg(long, conflicts_with_all = ["key_file", "key_env"])]
    password: Option<String>,

    /// Private key file
    #[arg(long, conflicts_with = "key_env")]
    key_file: Option<PathBuf>,

    /// Environment variable holding a base64 encoded private key
    #[arg(long)]
    key_env: Option<String>,

    /// Command line to run
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl RemoteArgs {
    /// Merge the flags over the configured remote, if any
    fn connection(&self, base: Option<ConnectionInfo>) -> Result<ConnectionInfo> {
        let mut info = base.unwrap_or_else(|| ConnectionInfo::new("", ""));

        if let Some(host) = &self.host {
            info.host.clone_from(host);
        }
        if let Some(port) = self.port {
            info.port = port;
        }
        if let Some(user) = &self.user {
            info.user.clone_from(user);
        }
        // an explicit secret on the command line replaces the configured one
        if self.password.is_some() || self.key_file.is_some() || self.key_env.is_some() {
            info.password.clone_from(&self.password);
            info.ssh_key.clone_from(&self.key_file);
            info.ssh_key_env.clone_from(&self.key_env);
        }

        if info.host.is_empty() {
            return Err(eyre!(
                "no remote host given; pass --host or add a [remote] section to the config"
            ));
        }
        Ok(info)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // Exit explicitly: a blocked stdin reader would otherwise hold the
    // runtime open on shutdown
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:?}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = Config::load_default(cli.config.as_deref()).wrap_err("loading config")?;
    init_tracing(&config.log);
    apply_overrides(&mut config.exec, &cli);

    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (err_tx, err_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let stdin = cli.stdin.then(spawn_stdin_reader);
    let printers = [
        spawn_printer(out_rx, tokio::io::stdout()),
        spawn_printer(err_rx, tokio::io::stderr()),
    ];

    // executors are dropped at the end of each arm, closing the output channels
    let result = match cli.command {
        Commands::Local { program, args } => {
            let mut executor = LocalExecutor::new(stdin, Some(out_tx), Some(err_tx));
            executor.apply_config(&config.exec)?;
            executor.execute(&program, &args).await
        }
        Commands::Remote(remote) => {
            let info = remote.connection(config.remote.take())?;
            let credential = info.credential()?;
            let mut executor =
                RemoteExecutor::new(credential, info.address(), stdin, Some(out_tx), Some(err_tx));
            executor.apply_config(&config.exec)?;

            let result = executor.execute(&remote.command.join(" ")).await;
            if let Err(e) = executor.close().await {
                tracing::warn!(error = %e, "failed to close SSH session");
            }
            result
        }
    };

    for printer in printers {
        printer.await??;
    }

    let completion = match result {
        Ok(completion) => completion,
        Err(e) if e.is_timeout() => return Err(eyre!(e)),
        Err(e) if e.is_retryable() => {
            return Err(eyre!(e).wrap_err("command did not run; retrying may succeed"));
        }
        Err(e) => return Err(e.into()),
    };

    if cli.json {
        println!("{}", serde_json::to_string(&completion)?);
    }
    Ok(exit_code(&completion))
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Command-line flags win over the config file
fn apply_overrides(exec: &mut ExecConfig, cli: &Cli) {
    if let Some(timeout) = cli.timeout {
        exec.timeout_secs = timeout;
    }
    for stream in [&mut exec.stdout, &mut exec.stderr] {
        if let Some(max_bytes) = cli.max_bytes {
            stream.max_bytes = max_bytes;
        }
        if let Some(delimiter) = cli.delimiter {
            stream.delimiter = Some(delimiter);
        }
    }
}

/// Forward stdin lines to the command until EOF or the command stops reading
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(format!("{line}\n")).await.is_err() {
                break;
            }
        }
    });
    rx
}

fn spawn_printer<W>(rx: mpsc::Receiver<String>, out: W) -> JoinHandle<std::io::Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(print_items(rx, out))
}

async fn print_items<W>(mut rx: mpsc::Receiver<String>, mut out: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = rx.recv().await {
        out.write_all(item.as_bytes()).await?;
        out.flush().await?;
    }
    Ok(())
}

/// Mirror the command's exit code; a missing code (signal) maps to 1
fn exit_code(completion: &Completion) -> i32 {
    completion.code.unwrap_or(1)
}
