pub mod agent_core;
pub mod commands;
pub mod config;
pub mod inference;
pub mod mcp_client;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use agent_core::{AgentLoop, SessionTracker};
use commands::chat::{tools_loaded_line, ChatRepl, ConsoleObserver};
use inference::InferenceClient;
use mcp_client::McpClient;

// ─── CLI ─────────────────────────────────────────────────────────────────────

/// One reasoning loop over many MCP tool servers.
#[derive(Debug, Parser)]
#[command(name = "mcp-agent", version, about)]
pub struct Cli {
    /// Path to mcp-agent.yaml. Defaults to $MCP_AGENT_CONFIG or an upward search.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override agent.max_steps.
    #[arg(long)]
    pub max_steps: Option<u32>,

    /// User id used to derive the conversation id.
    #[arg(long, env = "USER_ID", default_value = "guest")]
    pub user_id: String,

    /// Log to stderr instead of the log file.
    #[arg(long)]
    pub log_stderr: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,

    /// Print server status and the tool catalog, then exit.
    #[arg(long)]
    pub list_tools: bool,

    /// Ask a single question and exit instead of starting the prompt loop.
    pub prompt: Vec<String>,
}

/// Entry point shared by the binary.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing(cli.log_stderr, cli.log_json);

    let (mut config, path) =
        config::resolve_config(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(max_steps) = cli.max_steps {
        anyhow::ensure!(max_steps >= 1, "--max-steps must be at least 1");
        config.agent.max_steps = max_steps;
    }
    tracing::info!(
        config = %path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "<defaults>".into()),
        servers = config.servers.len(),
        model = %config.model.model_name,
        max_steps = config.agent.max_steps,
        "configuration resolved"
    );

    let client = Arc::new(
        McpClient::new(config.servers.clone(), config.client_settings())
            .context("failed to create MCP client")?,
    );
    let failures = client.start_all().await.context("failed to build tool catalog")?;
    for (server, err) in &failures {
        eprintln!("[Warning] server '{server}' unavailable: {err}");
    }

    let catalog = client.catalog();
    if cli.list_tools {
        print!("{}", commands::status::render_status(&client.server_statuses(), &catalog));
        client.shutdown_all().await;
        return Ok(());
    }
    println!("{}", tools_loaded_line(catalog.len()));

    let engine = InferenceClient::from_config(
        config.model.clone(),
        config.agent.system_prompt.clone(),
        config.agent.max_observation_chars,
    )
    .context("failed to create inference client")?;
    tracing::info!(base_url = %engine.base_url(), model = %engine.current_model_name(), "reasoning engine ready");

    let agent = AgentLoop::new(Arc::new(engine), config.dispatcher(), config.loop_settings())
        .with_observer(Arc::new(ConsoleObserver::stdout()));
    let tracker = SessionTracker::new(&cli.user_id, config.agent.max_steps);
    let repl = ChatRepl::new(Arc::clone(&client), agent, tracker);

    let supervisor = config
        .reconnect_interval()
        .map(|interval| client.spawn_supervisor(interval));

    let result = if cli.prompt.is_empty() {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        repl.run(stdin, &mut stdout).await.context("console I/O failed")
    } else {
        let outcome = repl.ask(&cli.prompt.join(" ")).await;
        println!("{}", outcome.user_message());
        Ok(())
    };

    if let Some(handle) = supervisor {
        handle.abort();
    }
    repl.tracker().cancel_all();
    client.shutdown_all().await;
    tracing::info!("=== mcp-agent stopped ===");
    result
}

// ─── Logging ─────────────────────────────────────────────────────────────────

/// Return the platform-standard data directory for mcp-agent.
///
/// - macOS: `~/Library/Application Support/mcp-agent/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-agent\`
/// - Linux: `$XDG_DATA_HOME/mcp-agent/` (fallback `~/.local/share/mcp-agent/`)
///
/// Falls back to `~/.mcp-agent/` only if none of the above can be resolved.
pub(crate) fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-agent");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-agent")
}

/// Initialize the tracing subscriber.
///
/// Logs go to `{data_dir}/agent.log` so they never interleave with the
/// prompt, unless `to_stderr` is set or the file cannot be opened.
/// On each startup existing logs are rotated (keeps the last 3).
fn init_tracing(to_stderr: bool, json: bool) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_agent=info,warn"));

    let log_dir = data_dir();
    let log_path = log_dir.join("agent.log");
    let log_file = if to_stderr {
        None
    } else {
        let _ = std::fs::create_dir_all(&log_dir);
        rotate_log_file(&log_path, 3);
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .ok()
    };

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    let log_target = match log_file {
        Some(file) => {
            let writer = FlushingWriter::new(file);
            if json {
                builder.json().with_writer(writer).init();
            } else {
                builder.with_ansi(false).with_writer(writer).init();
            }
            log_path.display().to_string()
        }
        None => {
            if json {
                builder.json().with_writer(std::io::stderr).init();
            } else {
                builder.with_writer(std::io::stderr).init();
            }
            "stderr".to_string()
        }
    };

    // Startup banner with the log location
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log = %log_target,
        pid = std::process::id(),
        "=== mcp-agent starting ==="
    );
}

/// Rotate log files: `agent.log` → `agent.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &std::path::Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Without explicit flushing, log entries may sit in OS buffers and be
/// lost if the process is killed mid-session.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_log_file_keeps_three() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("agent.log");
        for generation in 0..5 {
            std::fs::write(&base, format!("run {generation}")).unwrap();
            rotate_log_file(&base, 3);
        }

        assert!(!base.exists());
        let read = |suffix: u32| std::fs::read_to_string(format!("{}.{suffix}", base.display())).unwrap();
        assert_eq!(read(1), "run 4");
        assert_eq!(read(2), "run 3");
        assert_eq!(read(3), "run 2");
        assert!(!std::path::Path::new(&format!("{}.4", base.display())).exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line one\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::parse_from([
            "mcp-agent",
            "--config",
            "/tmp/mcp-agent.yaml",
            "--max-steps",
            "8",
            "--user-id",
            "alice",
            "--list-tools",
        ]);
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/tmp/mcp-agent.yaml")));
        assert_eq!(cli.max_steps, Some(8));
        assert_eq!(cli.user_id, "alice");
        assert!(cli.list_tools);
        assert!(cli.prompt.is_empty());

        let one_shot = Cli::parse_from(["mcp-agent", "--user-id", "bob", "what", "time", "is", "it"]);
        assert_eq!(one_shot.prompt.join(" "), "what time is it");
    }
}
