use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use peerdrop_client::{
    ClientError,
    config::{self, ResolvedConfig, SavedConfig},
    runtime::{self, ReceiveOptions, SendOptions, TransferObserver},
};
use peerdrop_core::{CallRequest, Role, SessionEvent, format_file_size};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Parser, Debug)]
#[command(name = "peerdrop", version, about = "Send a file straight to another peer")]
struct Cli {
    /// Signaling server WebSocket URL.
    #[arg(long, global = true, env = "PEERDROP_SIGNAL_URL")]
    signal_url: Option<String>,

    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wait for calls and save incoming files.
    Receive(ReceiveArgs),
    /// Call a peer and send it one file.
    Send(SendArgs),
    /// Validate and save defaults.
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
struct ReceiveArgs {
    /// Identity to register instead of a random PIN.
    #[arg(long)]
    id: Option<String>,
    /// Accept every call without prompting.
    #[arg(long, default_value_t = false)]
    yes: bool,
    /// Exit after the first call ends.
    #[arg(long, default_value_t = false)]
    once: bool,
    #[arg(long)]
    download_dir: Option<PathBuf>,
    /// Local address to accept peer connections on.
    #[arg(long, default_value = "0.0.0.0:0")]
    listen: String,
    /// Address peers should dial, when it differs from the listen address.
    #[arg(long)]
    advertise: Option<String>,
}

#[derive(Args, Debug)]
struct SendArgs {
    /// Identity of the receiving peer.
    #[arg(long)]
    to: String,
    file: PathBuf,
    #[arg(long)]
    id: Option<String>,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[arg(long)]
    download_dir: Option<PathBuf>,
}

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

fn init_logging(log_file: Option<&Path>) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
        return;
    };

    let file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(io::stderr)
                .init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .init();
}

/// Terminal presentation: one progress bar per transfer plus the accept prompt.
struct Terminal {
    auto_accept: bool,
    bar: Option<ProgressBar>,
}

impl Terminal {
    fn new(auto_accept: bool) -> Self {
        Self {
            auto_accept,
            bar: None,
        }
    }

    fn start_bar(&mut self, label: String) {
        let bar = ProgressBar::new(1000);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}%")
        {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_message(label);
        bar.enable_steady_tick(Duration::from_millis(200));
        self.bar = Some(bar);
    }

    fn finish_bar(&mut self, message: &str) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(message.to_owned());
        }
    }

    fn abandon_bar(&mut self, message: &str) {
        if let Some(bar) = self.bar.take() {
            bar.abandon_with_message(message.to_owned());
        }
    }
}

impl TransferObserver for Terminal {
    fn registered(&mut self, identity: &str) {
        println!("Your PeerDrop ID: {identity}");
    }

    fn confirm_call(&mut self, request: &CallRequest) -> bool {
        if self.auto_accept {
            println!("Accepting call from {}", request.remote_identity);
            return true;
        }
        let prompt = format!("Accept call from {}? [y/N] ", request.remote_identity);
        tokio::task::block_in_place(|| ask_yes_no(&prompt))
    }

    fn session_event(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::PeerAccepted => println!("Call accepted"),
            SessionEvent::TransferStarted { role, metadata } => {
                let verb = match role {
                    Role::Initiator => "Sending",
                    Role::Responder => "Receiving",
                };
                self.start_bar(format!(
                    "{verb} {} ({})",
                    metadata.file_name,
                    format_file_size(metadata.total_size)
                ));
            }
            SessionEvent::Progress { fraction, .. } => {
                if let Some(bar) = &self.bar {
                    bar.set_position((fraction * 1000.0).round() as u64);
                }
            }
            SessionEvent::DownloadReady { file_name, .. } => {
                self.finish_bar(&format!("Received {file_name}"));
            }
            SessionEvent::TransferDiscarded { file_name } => {
                self.abandon_bar(&format!("Discarded {file_name}"));
            }
            SessionEvent::Stalled { received, expected } => {
                self.abandon_bar(&format!("Stalled after {received} of {expected} chunks"));
            }
            SessionEvent::TransportFailed { reason } => {
                self.abandon_bar("Connection failed");
                eprintln!("Connection failed: {reason}");
            }
            SessionEvent::StateChanged { .. }
            | SessionEvent::IncomingCall(_)
            | SessionEvent::TransferVerified { .. }
            | SessionEvent::FrameDropped { .. } => {}
        }
    }

    fn download_saved(&mut self, _file_name: &str, path: &Path) {
        println!("Saved {}", path.display());
    }
}

fn ask_yes_no(prompt: &str) -> bool {
    print!("{prompt}");
    let _ = io::stdout().flush();
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(_) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        Err(err) => {
            warn!("failed to read answer: {}", err);
            false
        }
    }
}

fn load_saved() -> Option<SavedConfig> {
    match config::load_config_from_path(&config::config_path()) {
        Ok(saved) => saved,
        Err(err) => {
            warn!("saved config ignored: {}", err);
            None
        }
    }
}

fn resolve(cli: &Cli, download_dir: Option<&Path>) -> Result<ResolvedConfig, ClientError> {
    config::resolve(cli.signal_url.as_deref(), download_dir, load_saved().as_ref())
}

async fn run_receive(cli: &Cli, args: &ReceiveArgs) -> Result<(), ClientError> {
    let resolved = resolve(cli, args.download_dir.as_deref())?;
    let options = ReceiveOptions {
        signal_url: resolved.signal_url,
        identity: args.id.clone(),
        listen: args.listen.clone(),
        advertise: args.advertise.clone(),
        download_dir: resolved.download_dir,
        once: args.once,
    };
    println!("Saving files to {}", options.download_dir.display());

    let mut terminal = Terminal::new(args.yes);
    let summary = tokio::select! {
        result = runtime::receive(&options, &mut terminal) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            return Ok(());
        }
    };
    println!(
        "Handled {} call(s), saved {} file(s)",
        summary.calls,
        summary.saved.len()
    );
    Ok(())
}

async fn run_send(cli: &Cli, args: &SendArgs) -> Result<(), ClientError> {
    let resolved = resolve(cli, None)?;
    let options = SendOptions {
        signal_url: resolved.signal_url,
        identity: args.id.clone(),
        remote: args.to.clone(),
        path: args.file.clone(),
    };

    let mut terminal = Terminal::new(false);
    println!("Calling {}...", options.remote);
    let summary = tokio::select! {
        result = runtime::send_file(&options, &mut terminal) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            return Ok(());
        }
    };
    terminal.finish_bar("Sent");
    println!(
        "Sent {} ({}, {} chunks) to {}",
        summary.file_name,
        format_file_size(summary.size),
        summary.chunks,
        summary.remote
    );
    Ok(())
}

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), ClientError> {
    let path = config::config_path();
    let mut saved = config::load_config_from_path(&path)?.unwrap_or_default();
    if let Some(signal_url) = cli.signal_url.as_deref() {
        saved.signal_url = Some(signal_url.trim().to_owned());
    }
    if let Some(download_dir) = args.download_dir.as_deref() {
        saved.download_dir = Some(download_dir.to_path_buf());
    }
    config::save_config_to_path(&path, &saved)?;

    let resolved = config::resolve(None, None, Some(&saved))?;
    println!("Config saved to {}", path.display());
    println!("  signal url:   {}", resolved.signal_url);
    println!("  download dir: {}", resolved.download_dir.display());
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref());

    let result = match &cli.command {
        Command::Receive(args) => run_receive(&cli, args).await,
        Command::Send(args) => run_send(&cli, args).await,
        Command::Config(args) => run_config(&cli, args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
