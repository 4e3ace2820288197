//! Interactive chat surface.
//!
//! A line-oriented prompt loop over stdin/stdout. Each non-empty line starts
//! a session that runs to a terminal outcome; Ctrl-C while a session is
//! running cancels that session, Ctrl-C at the prompt ends the process.

use std::io::Write as _;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::agent_core::{AgentLoop, AgentOutcome, LoopObserver, SessionTracker};
use crate::mcp_client::{McpClient, ToolCallRequest, ToolCallResult};

/// Inputs that end the chat, compared case-insensitively.
const EXIT_WORDS: [&str; 3] = ["exit", "quit", "q"];

pub fn is_exit_command(input: &str) -> bool {
    let lowered = input.trim().to_lowercase();
    EXIT_WORDS.contains(&lowered.as_str())
}

pub fn tools_loaded_line(count: usize) -> String {
    format!("[Tools] -> Loaded {count} tools from MCP servers")
}

pub fn tool_call_line(request: &ToolCallRequest) -> String {
    format!("[Tool Call] -> {}({})", request.name, request.arguments)
}

pub fn tool_result_line(observation: &str) -> String {
    format!("[Tool Result] <- {observation}")
}

// ─── ConsoleObserver ─────────────────────────────────────────────────────────

/// Prints tool traffic as it happens.
pub struct ConsoleObserver {
    sink: Arc<Mutex<dyn std::io::Write + Send>>,
}

impl ConsoleObserver {
    pub fn stdout() -> Self {
        Self::new(Arc::new(Mutex::new(std::io::stdout())))
    }

    pub fn new(sink: Arc<Mutex<dyn std::io::Write + Send>>) -> Self {
        Self { sink }
    }

    fn emit(&self, line: &str) {
        if let Ok(mut out) = self.sink.lock() {
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
    }
}

impl LoopObserver for ConsoleObserver {
    fn on_tool_call(&self, request: &ToolCallRequest) {
        self.emit(&tool_call_line(request));
    }

    fn on_tool_result(&self, _result: &ToolCallResult, observation: &str) {
        self.emit(&tool_result_line(observation));
    }
}

// ─── ChatRepl ────────────────────────────────────────────────────────────────

enum LoopControl {
    Continue,
    Exit,
}

/// The prompt loop: one session per question, shared connections.
pub struct ChatRepl {
    client: Arc<McpClient>,
    agent: AgentLoop,
    tracker: SessionTracker,
}

impl ChatRepl {
    pub fn new(client: Arc<McpClient>, agent: AgentLoop, tracker: SessionTracker) -> Self {
        Self {
            client,
            agent,
            tracker,
        }
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    /// Run one question to a terminal outcome.
    ///
    /// Ctrl-C during the run cancels this session only.
    pub async fn ask(&self, prompt: &str) -> AgentOutcome {
        let mut session = self.tracker.start_session(prompt);
        let handle = session.handle();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!(session_id = %handle.session_id(), "interrupted by user");
                handle.cancel();
            }
        });

        let catalog = self.client.catalog();
        let outcome = self.agent.run(&mut session, &catalog).await;
        interrupt.abort();

        self.tracker.end_session(session, &outcome);
        outcome
    }

    /// Read questions from `input` until EOF, an exit word or Ctrl-C.
    pub async fn run<R, W>(&self, input: R, out: &mut W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();

        write_line(out, &format!("MCP Agent Session: {}", self.tracker.conversation_id())).await?;
        write_line(out, "Type 'exit' to quit.").await?;

        loop {
            out.write_all(b"\nQuestion: ").await?;
            out.flush().await?;

            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => {
                    write_line(out, "\nInterrupted.").await?;
                    break;
                }
            };

            let Some(line) = line else {
                write_line(out, "").await?;
                break;
            };

            match self.handle_line(line.trim(), out).await? {
                LoopControl::Continue => continue,
                LoopControl::Exit => break,
            }
        }

        write_line(out, "Session ended.").await?;
        out.flush().await
    }

    async fn handle_line<W>(&self, input: &str, out: &mut W) -> std::io::Result<LoopControl>
    where
        W: AsyncWrite + Unpin,
    {
        if input.is_empty() {
            return Ok(LoopControl::Continue);
        }
        if is_exit_command(input) {
            return Ok(LoopControl::Exit);
        }

        let outcome = self.ask(input).await;
        match &outcome {
            AgentOutcome::Completed { answer } => write_line(out, &format!("Answer: {answer}")).await?,
            other => write_line(out, &other.user_message()).await?,
        }
        Ok(LoopControl::Continue)
    }
}

async fn write_line<W: AsyncWrite + Unpin>(out: &mut W, text: &str) -> std::io::Result<()> {
    out.write_all(text.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}

// ─── Tests ───────────────────────────────────────────────────────────────────
