//! crucible CLI - submit code to a crucible server and stream the results

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use crucible_core::invocation::RawInvocation;
use crucible_core::protocol::{self, ControlMessage, ServerMessage};
use crucible_core::report::{ExecutionReport, StatusType};
use futures_util::{SinkExt, StreamExt};
use serde_bytes::ByteBuf;
use std::io::{Read, Write};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "crucible")]
#[command(author, version, about = "Client for the crucible remote execution service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a program and stream its output
    Run {
        /// Language runner to execute with
        language: String,

        /// File containing the program, or - for stdin
        #[arg(short, long, default_value = "-")]
        file: String,

        /// Text fed to the program's standard input
        #[arg(short, long, default_value = "")]
        input: String,

        /// Argument passed to the program (repeatable)
        #[arg(short, long = "arg")]
        arguments: Vec<String>,

        /// Option passed to the runner (repeatable)
        #[arg(short, long = "option")]
        options: Vec<String>,

        /// Timeout in seconds, 1-60
        #[arg(short, long, default_value_t = 60)]
        timeout: i64,

        /// WebSocket endpoint of the server
        #[arg(long, default_value = "ws://127.0.0.1:8500/api/v1/ws/execute")]
        url: String,
    },

    /// List the languages a server knows
    Languages {
        /// Metadata endpoint of the server
        #[arg(long, default_value = "http://127.0.0.1:8500/api/v1/metadata")]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            language,
            file,
            input,
            arguments,
            options,
            timeout,
            url,
        } => {
            let code = read_code(&file)?;
            let request = RawInvocation {
                language,
                code: ByteBuf::from(code),
                input: ByteBuf::from(input.into_bytes()),
                arguments: arguments.into_iter().map(|a| ByteBuf::from(a.into_bytes())).collect(),
                options: options.into_iter().map(|o| ByteBuf::from(o.into_bytes())).collect(),
                timeout,
            };
            let report = run(&url, &request).await?;
            summarize(&report);
            std::process::exit(exit_code(&report));
        }

        Commands::Languages { url } => {
            let bytes = reqwest::get(url.as_str())
                .await
                .with_context(|| format!("cannot reach {url}"))?
                .bytes()
                .await?;
            let names: Vec<String> =
                protocol::decode_exact(&bytes).context("malformed metadata response")?;
            for name in names {
                println!("{name}");
            }
            Ok(())
        }
    }
}

fn read_code(file: &str) -> Result<Vec<u8>> {
    if file == "-" {
        let mut code = Vec::new();
        std::io::stdin()
            .read_to_end(&mut code)
            .context("cannot read program from stdin")?;
        Ok(code)
    } else {
        std::fs::read(file).with_context(|| format!("cannot read {file}"))
    }
}

/// Submit the invocation and stream responses until the terminal report.
/// Ctrl-C cancels the remote program instead of the client.
async fn run(url: &str, request: &RawInvocation) -> Result<ExecutionReport> {
    let (mut socket, _) = connect_async(url)
        .await
        .with_context(|| format!("cannot connect to {url}"))?;
    socket
        .send(Message::Binary(protocol::encode(request)?))
        .await?;

    let mut cancelled = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                cancelled = true;
                eprintln!("cancelling...");
                socket
                    .send(Message::Binary(protocol::encode(&ControlMessage::Kill)?))
                    .await?;
            }
            message = socket.next() => match message {
                Some(Ok(Message::Binary(bytes))) => match protocol::decode_exact(&bytes)? {
                    ServerMessage::Stdout(chunk) => {
                        let mut stdout = std::io::stdout();
                        stdout.write_all(&chunk)?;
                        stdout.flush()?;
                    }
                    ServerMessage::Stderr(chunk) => {
                        let mut stderr = std::io::stderr();
                        stderr.write_all(&chunk)?;
                        stderr.flush()?;
                    }
                    ServerMessage::Done(report) => {
                        socket.close(None).await.ok();
                        return Ok(report);
                    }
                },
                Some(Ok(Message::Close(frame))) => match frame {
                    Some(frame) => bail!("server closed connection: {} ({})", frame.reason, frame.code),
                    None => bail!("server closed connection"),
                },
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("connection failed"),
                None => bail!("connection ended before the report arrived"),
            }
        }
    }
}

fn summarize(report: &ExecutionReport) {
    let disposition = match report.status_type {
        StatusType::Exited => format!("exited with code {}", report.status_value),
        StatusType::Killed => format!("killed by signal {}", report.status_value),
    };
    eprintln!();
    eprintln!(
        "{disposition}{}",
        if report.timed_out { " (timed out)" } else { "" }
    );
    if report.stdout_truncated {
        eprintln!("warning: stdout was truncated");
    }
    if report.stderr_truncated {
        eprintln!("warning: stderr was truncated");
    }
    eprintln!(
        "real {}us / user {}us / kernel {}us, peak memory {} KiB",
        report.real, report.user, report.kernel, report.max_mem
    );
}

fn exit_code(report: &ExecutionReport) -> i32 {
    match report.status_type {
        StatusType::Exited => report.status_value.clamp(0, 255),
        // shell convention for death by signal
        StatusType::Killed => 128 + report.status_value.clamp(0, 64),
    }
}
