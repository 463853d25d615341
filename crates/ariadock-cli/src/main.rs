mod render;

use anyhow::{Context, Result, bail};
use ariadock::client::{NodeClient, default_socket_path};
use ariadock::protocol::{ConfigPatch, Request, WorkerOpResult};
use base64::Engine;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ariadock", version, about = "ariadock CLI")]
struct Cli {
    /// Path to the daemon's Unix socket.
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon.
    Up {
        /// Run in the foreground (default: background).
        #[arg(long)]
        foreground: bool,
        /// State directory.
        #[arg(long)]
        state_dir: Option<PathBuf>,
        /// Worker executable.
        #[arg(long)]
        executable: Option<PathBuf>,
        /// Do not start the worker automatically.
        #[arg(long)]
        no_auto_start: bool,
    },
    /// Stop the daemon and its worker.
    Down,
    /// Daemon health.
    Health,
    /// Control the download worker process.
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },
    /// List tasks.
    Tasks {
        /// Print the raw JSON view.
        #[arg(long)]
        json: bool,
    },
    /// Add a download by URI, or from a .torrent file.
    Add {
        /// URIs (mirrors of the same file), or web seeds with --torrent.
        uris: Vec<String>,
        /// Path to a .torrent file.
        #[arg(long)]
        torrent: Option<PathBuf>,
        /// Download directory for this task.
        #[arg(long)]
        dir: Option<String>,
        /// Extra worker option as key=value (can be repeated).
        #[arg(long = "option", short = 'o')]
        options: Vec<String>,
    },
    /// Pause a task, or every task with --all.
    Pause {
        gid: Option<String>,
        #[arg(long)]
        all: bool,
        /// Skip the graceful pause.
        #[arg(long)]
        force: bool,
    },
    /// Resume a task, or every task with --all.
    Resume {
        gid: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Remove a task.
    Remove {
        gid: String,
        #[arg(long)]
        force: bool,
        /// Also delete the downloaded files.
        #[arg(long)]
        delete_files: bool,
    },
    /// Re-submit a failed task as a new task.
    Retry { gid: String },
    /// Flush the worker session to disk now.
    Save,
    /// Worker transfer statistics.
    Stats,
    /// Worker version.
    Version,
    /// Clear finished tasks from the worker's history (archived copies stay).
    Purge,
    /// Show worker global options, or change them with --set.
    Options {
        /// Option to change as key=value (can be repeated).
        #[arg(long = "set", short = 's')]
        set: Vec<String>,
    },
    /// Stream daemon events until interrupted.
    Events,
}

#[derive(Subcommand)]
enum WorkerAction {
    Start,
    Stop,
    Restart,
    Status,
    /// Change worker settings; restarts the worker when required.
    Config {
        #[arg(long)]
        port: Option<u16>,
        /// RPC secret; pass an empty string to disable.
        #[arg(long)]
        secret: Option<String>,
        #[arg(long)]
        download_dir: Option<String>,
        #[arg(long)]
        enable_rpc: Option<bool>,
        #[arg(long)]
        allow_origin_all: Option<bool>,
        #[arg(long)]
        auto_start: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let socket_path = cli.socket.unwrap_or_else(default_socket_path);

    match cli.command {
        Command::Up {
            foreground,
            state_dir,
            executable,
            no_auto_start,
        } => cmd_up(&socket_path, foreground, state_dir, executable, no_auto_start),
        Command::Down => {
            let mut client = connect(&socket_path).await?;
            client.request(Request::Shutdown).await?;
            println!("Daemon shutting down.");
            Ok(())
        }
        Command::Health => {
            let mut client = connect(&socket_path).await?;
            let data = client.request(Request::Health).await?;
            print_json(&data);
            Ok(())
        }
        Command::Worker { action } => cmd_worker(&socket_path, action).await,
        Command::Tasks { json } => {
            let mut client = connect(&socket_path).await?;
            let data = client.request(Request::Tasks).await?;
            match data.as_ref().and_then(render::task_table) {
                Some(table) if !json => print!("{table}"),
                _ => print_json(&data),
            }
            Ok(())
        }
        Command::Add {
            uris,
            torrent,
            dir,
            options,
        } => {
            let mut options = parse_options(&options)?;
            if let Some(dir) = dir {
                options.insert("dir".to_string(), dir);
            }
            let req = match torrent {
                Some(path) => {
                    let bytes = std::fs::read(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    Request::AddTorrent {
                        torrent_b64: base64::engine::general_purpose::STANDARD.encode(bytes),
                        uris,
                        options,
                    }
                }
                None if uris.is_empty() => bail!("give at least one URI or --torrent"),
                None => Request::AddUri { uris, options },
            };
            let mut client = connect(&socket_path).await?;
            let data = client.request(req).await?;
            print_json(&data);
            Ok(())
        }
        Command::Pause { gid, all, force } => {
            let req = match (gid, all) {
                (_, true) => Request::PauseAll { force },
                (Some(gid), false) => Request::Pause { gid, force },
                (None, false) => bail!("give a GID or --all"),
            };
            let mut client = connect(&socket_path).await?;
            client.request(req).await?;
            println!("Paused.");
            Ok(())
        }
        Command::Resume { gid, all } => {
            let req = match (gid, all) {
                (_, true) => Request::UnpauseAll,
                (Some(gid), false) => Request::Unpause { gid },
                (None, false) => bail!("give a GID or --all"),
            };
            let mut client = connect(&socket_path).await?;
            client.request(req).await?;
            println!("Resumed.");
            Ok(())
        }
        Command::Remove {
            gid,
            force,
            delete_files,
        } => {
            let mut client = connect(&socket_path).await?;
            let data = client
                .request(Request::Remove {
                    gid,
                    force,
                    delete_files,
                })
                .await?;
            print_json(&data);
            Ok(())
        }
        Command::Retry { gid } => {
            let mut client = connect(&socket_path).await?;
            let data = client.request(Request::Retry { gid }).await?;
            print_json(&data);
            Ok(())
        }
        Command::Save => {
            let mut client = connect(&socket_path).await?;
            let data = client.request(Request::SaveSession).await?;
            print_json(&data);
            Ok(())
        }
        Command::Stats => {
            let mut client = connect(&socket_path).await?;
            let data = client.request(Request::GlobalStat).await?;
            print_json(&data);
            Ok(())
        }
        Command::Version => {
            let mut client = connect(&socket_path).await?;
            println!("daemon {}", client.daemon_version());
            let data = client.request(Request::Version).await?;
            print_json(&data);
            Ok(())
        }
        Command::Purge => {
            let mut client = connect(&socket_path).await?;
            client.request(Request::PurgeResults).await?;
            println!("Worker history purged.");
            Ok(())
        }
        Command::Options { set } => {
            let options = parse_options(&set)?;
            let mut client = connect(&socket_path).await?;
            if options.is_empty() {
                let data = client.request(Request::GlobalOptions).await?;
                print_json(&data);
            } else {
                client
                    .request(Request::ChangeGlobalOptions { options })
                    .await?;
                println!("Options changed.");
            }
            Ok(())
        }
        Command::Events => {
            let mut client = connect(&socket_path).await?;
            while let Some(event) = client.next_event().await {
                let event = event?;
                println!("{}", serde_json::to_string(&event)?);
            }
            Ok(())
        }
    }
}

async fn cmd_worker(socket_path: &std::path::Path, action: WorkerAction) -> Result<()> {
    let mut client = connect(socket_path).await?;
    let (req, verb) = match action {
        WorkerAction::Start => (Request::WorkerStart, "started"),
        WorkerAction::Stop => (Request::WorkerStop, "stopped"),
        WorkerAction::Restart => (Request::WorkerRestart, "restarted"),
        WorkerAction::Status => {
            let data = client.request(Request::WorkerStatus).await?;
            print_json(&data);
            return Ok(());
        }
        WorkerAction::Config {
            port,
            secret,
            download_dir,
            enable_rpc,
            allow_origin_all,
            auto_start,
        } => {
            let patch = ConfigPatch {
                port,
                secret,
                download_dir,
                enable_rpc,
                rpc_allow_origin_all: allow_origin_all,
                auto_start,
            };
            let data = client.request(Request::UpdateConfig { patch }).await?;
            let scheduled = data
                .as_ref()
                .and_then(|d| d["restart_scheduled"].as_bool())
                .unwrap_or(false);
            if scheduled {
                println!("Config saved; worker restart scheduled.");
            } else {
                println!("Config saved.");
            }
            return Ok(());
        }
    };

    let data = client.request(req).await?;
    let result: WorkerOpResult = serde_json::from_value(data.unwrap_or_default())
        .context("unexpected worker response")?;
    if result.success {
        println!("Worker {verb}.");
        return Ok(());
    }
    let message = result.message.unwrap_or_else(|| "unknown error".to_string());
    let code = result.code.unwrap_or_default();
    if result.retryable {
        bail!("{message} ({code}); retrying may succeed");
    }
    bail!("{message} ({code})")
}

async fn connect(socket_path: &std::path::Path) -> Result<NodeClient> {
    NodeClient::connect(socket_path).await.with_context(|| {
        format!(
            "failed to connect to daemon at {}. Is it running? Try: ariadock up",
            socket_path.display()
        )
    })
}

fn cmd_up(
    socket_path: &std::path::Path,
    foreground: bool,
    state_dir: Option<PathBuf>,
    executable: Option<PathBuf>,
    no_auto_start: bool,
) -> Result<()> {
    let node_bin = find_node_binary();

    let mut cmd = std::process::Command::new(&node_bin);
    cmd.arg("--socket").arg(socket_path);
    if let Some(ref dir) = state_dir {
        cmd.arg("--state-dir").arg(dir);
    }
    if let Some(ref exe) = executable {
        cmd.arg("--executable").arg(exe);
    }
    if no_auto_start {
        cmd.arg("--no-auto-start");
    }

    if foreground {
        let status = cmd
            .status()
            .with_context(|| format!("failed to run {}", node_bin.display()))?;
        if !status.success() {
            bail!("daemon exited with status {status}");
        }
    } else {
        cmd.stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", node_bin.display()))?;
        println!("Daemon started (pid {}).", child.id());
    }
    Ok(())
}

fn find_node_binary() -> PathBuf {
    // Check next to this binary
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let candidate = dir.join("ariadock-node");
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from("ariadock-node")
}

/// Parse repeated `key=value` worker options.
fn parse_options(raw: &[String]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|kv| {
            let Some((k, v)) = kv.split_once('=') else {
                bail!("option must be key=value: {kv}");
            };
            let k = k.trim();
            if k.is_empty() {
                bail!("option key is empty: {kv}");
            }
            Ok((k.to_string(), v.trim().to_string()))
        })
        .collect()
}

fn print_json(data: &Option<serde_json::Value>) {
    if let Some(v) = data
        && let Ok(s) = serde_json::to_string_pretty(v)
    {
        println!("{s}");
    }
}
