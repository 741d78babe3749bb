use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};

use rusty_session::backend::RemoteState;
use rusty_session::config::{self, AppConfig};
use rusty_session::router::SessionEvent;
use rusty_session::surface::VtSurface;
use rusty_session::uploads::UploadState;
use rusty_session::{
    logger, ConnectionSettings, Coordinator, NativeBackend, SessionId, SessionKind, TabId,
    TermSize,
};

/// Headless driver: one session, output on stdout, commands on stdin.
#[derive(Parser, Debug)]
#[command(name = "rusty-session", version, about)]
struct Cli {
    /// Config file (TOML, or JSON from older builds).
    #[arg(long, env = config::CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Saved profile to connect with; defaults to the configured default.
    #[arg(long, short)]
    profile: Option<String>,

    /// Open a local shell instead of an SSH session.
    #[arg(long, conflicts_with_all = ["profile", "host"])]
    local: bool,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, default_value_t = 22)]
    port: u16,

    #[arg(long, short)]
    user: Option<String>,

    #[arg(long, env = "RUSTY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Private key file for public key authentication.
    #[arg(long)]
    key: Option<PathBuf>,

    /// Print saved profiles and exit.
    #[arg(long)]
    list_profiles: bool,
}

enum Command {
    Upload(PathBuf),
    Uploads,
    Clear,
    Status,
    Quit,
    Input(String),
}

fn parse_command(line: &str) -> Command {
    let trimmed = line.trim();
    match trimmed.split_once(' ') {
        Some((":upload", path)) if !path.trim().is_empty() => {
            Command::Upload(PathBuf::from(path.trim()))
        }
        _ => match trimmed {
            ":uploads" => Command::Uploads,
            ":clear" => Command::Clear,
            ":status" => Command::Status,
            ":quit" | ":q" => Command::Quit,
            _ => Command::Input(line.to_string()),
        },
    }
}

fn terminal_size() -> TermSize {
    let read = |name: &str| std::env::var(name).ok().and_then(|v| v.parse::<u16>().ok());
    let default = TermSize::default();
    TermSize {
        cols: read("COLUMNS").unwrap_or(default.cols),
        rows: read("LINES").unwrap_or(default.rows),
    }
}

fn connection_for(cli: &Cli, cfg: &AppConfig) -> Result<(SessionKind, ConnectionSettings)> {
    if cli.local {
        return Ok((SessionKind::Local, ConnectionSettings::default()));
    }

    let mut settings = match (&cli.profile, &cli.host) {
        (Some(name), _) => config::write_profile_settings(
            cfg.profile(name)
                .ok_or_else(|| anyhow!("No saved profile named {name:?}"))?,
        ),
        (None, Some(host)) => ConnectionSettings {
            host: host.clone(),
            port: cli.port,
            ..Default::default()
        },
        (None, None) => match cfg.default_profile() {
            Some(profile) => config::write_profile_settings(profile),
            None => bail!("Nothing to connect to: pass --host, --profile or --local"),
        },
    };

    if let Some(user) = &cli.user {
        settings.username = user.clone();
    }
    if let Some(password) = &cli.password {
        settings.password = password.clone();
    }
    if let Some(key) = &cli.key {
        settings.private_key_path = key.display().to_string();
    }
    Ok((SessionKind::Ssh, settings))
}

/// Renders session output on a blocking thread until the session ends.
fn spawn_output_pump(
    coordinator: &Coordinator,
    session: &SessionId,
    surface: Arc<Mutex<VtSurface>>,
) -> std::thread::JoinHandle<()> {
    let mut stream = coordinator.subscribe_output(session);
    std::thread::spawn(move || {
        let mut stdout = std::io::stdout();
        loop {
            let event = match stream.recv_timeout(Duration::from_millis(250)) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    eprintln!("\r\n[session closed]");
                    return;
                }
            };
            match event {
                SessionEvent::Output(chunk) => {
                    surface.lock().process(&chunk.bytes);
                    let _ = stdout.write_all(&chunk.bytes);
                    let _ = stdout.flush();
                }
                SessionEvent::Status(report) if report.state == Some(RemoteState::Closed) => {
                    let reason = report.message.unwrap_or_else(|| "closed".to_string());
                    eprintln!("\r\n[session ended: {reason}]");
                    return;
                }
                SessionEvent::Status(_) => {}
            }
        }
    })
}

fn print_uploads(coordinator: &Coordinator) {
    let tasks = coordinator.list_upload_tasks();
    if tasks.is_empty() {
        eprintln!("[no uploads]");
    }
    for task in tasks {
        let eta = task
            .eta
            .map(|eta| format!(" eta {}s", eta.as_secs()))
            .unwrap_or_default();
        let state = match task.status {
            UploadState::Pending => "pending",
            UploadState::Uploading => "uploading",
            UploadState::Success => "done",
            UploadState::Error => "failed",
        };
        eprintln!(
            "[{}] {} {state} {:.0}%{eta} - {}",
            task.id, task.file_name, task.progress, task.message
        );
    }
}

async fn upload(
    coordinator: &Coordinator,
    session: &SessionId,
    surface: &Mutex<VtSurface>,
    scan_limit: usize,
    path: &Path,
) {
    let lines = surface.lock().snapshot(scan_limit);
    let target = coordinator.resolve_upload_target(session, &lines);
    if target.is_relative {
        eprintln!("[upload target is relative: {} ({})]", target.path, target.source);
    }
    let issued = match coordinator.create_upload(session, path) {
        Ok(task) => coordinator
            .issue_upload(&task, path, &target.path)
            .await
            .map(|remote| (task, remote)),
        Err(err) => Err(err),
    };
    match issued {
        Ok((task, remote)) => eprintln!("[{task}] uploading {} -> {remote}", path.display()),
        Err(err) => eprintln!("[upload failed: {err}]"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => config::load_from(path),
        None => config::load(),
    };
    let _log_guard = logger::init(&cfg.log_dir())?;

    if cli.list_profiles {
        for profile in &cfg.profiles {
            println!("{}", config::profile_display_name(profile, &cfg));
        }
        return Ok(());
    }

    let (kind, settings) = connection_for(&cli, &cfg)?;
    let size = terminal_size();
    let settings_for_coordinator = cfg.coordinator_settings();
    let scan_limit = settings_for_coordinator.scan_line_limit;

    let (backend, events) = NativeBackend::with_stream(cfg.ssh_options());
    let coordinator = Coordinator::new(Arc::new(backend), events, settings_for_coordinator);

    let session = SessionId::generate();
    let tab = TabId::from("1");
    let surface = Arc::new(Mutex::new(VtSurface::new(size, cfg.tuning.scrollback_lines)));
    let pump = spawn_output_pump(&coordinator, &session, Arc::clone(&surface));

    coordinator
        .open_session(session.clone(), tab, kind, settings, size)
        .await
        .context("Unable to open session")?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = stdin.next_line().await? {
        if pump.is_finished() {
            break;
        }
        match parse_command(&line) {
            Command::Upload(path) => {
                upload(&coordinator, &session, &surface, scan_limit, &path).await;
            }
            Command::Uploads => print_uploads(&coordinator),
            Command::Clear => {
                let removed = coordinator.clear_finished_uploads();
                eprintln!("[cleared {removed} finished uploads]");
            }
            Command::Status => {
                let stats = coordinator.stats();
                eprintln!(
                    "[{:?}; {} connected of {}]",
                    coordinator.session_status(&session),
                    stats.connected,
                    stats.total
                );
            }
            Command::Quit => break,
            Command::Input(text) => {
                coordinator.send_keystrokes(&session, &text);
                coordinator.send_keystrokes(&session, "\r");
            }
        }
    }

    coordinator.shutdown().await;
    Ok(())
}
