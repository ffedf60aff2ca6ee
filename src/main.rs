//! # Vault Assist CLI (`vassist`)
//!
//! ## Usage
//!
//! ```bash
//! vassist --config ./vassist.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vassist index rebuild` | Re-chunk every document and write the snapshot |
//! | `vassist index status` | Show index counts and last save time |
//! | `vassist context "<query>"` | Print the retrieval context a message would get |
//! | `vassist ask "<message>"` | Run one assistant turn |
//! | `vassist chat` | Interactive conversation (Ctrl-C cancels the current turn) |
//! | `vassist tools` | List registered tools with risk and consent mode |
//! | `vassist undo [<id>]` | Revert an `apply_patch`, or list undoable patches |
//! | `vassist audit` | Show recent tool executions |
//! | `vassist watch` | Keep the index in sync with filesystem changes |
//! | `vassist completions <shell>` | Print shell completions |

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use vault_assist::app::Assistant;
use vault_assist::config::load_config;
use vault_assist::consent::TerminalPrompter;
use vault_assist::model::ToolCall;
use vault_assist::orchestrator::{
    gather_context, ActiveInput, Orchestrator, TurnObserver, TurnOutcome, TurnRequest, TurnStatus,
};
use vault_assist::tools::ToolResult;
use vault_assist::watch::VaultWatcher;
use vault_assist_core::models::RagContext;

/// Vault Assist: an AI assistant for a folder of markdown notes.
#[derive(Parser)]
#[command(name = "vassist", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./vassist.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the chunk index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Print the retrieval context for a query without calling a model.
    Context {
        query: String,
        #[command(flatten)]
        inputs: TurnInputs,
    },

    /// Run a single assistant turn and print the answer.
    Ask {
        message: String,
        #[command(flatten)]
        inputs: TurnInputs,
    },

    /// Interactive conversation. Mention notes inline as `@name` or `@[[Long Name]]`.
    Chat,

    /// List registered tools.
    Tools,

    /// Revert an applied patch by execution id, or list undoable patches.
    Undo { id: Option<String> },

    /// Show recent audit log entries.
    Audit {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Watch the vault and keep the index current until Ctrl-C.
    Watch,

    /// Print shell completions.
    Completions { shell: clap_complete::Shell },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Rebuild the index from scratch.
    Rebuild,
    /// Show index statistics.
    Status,
}

#[derive(clap::Args)]
struct TurnInputs {
    /// Vault-relative path of the document treated as open in the editor.
    #[arg(long)]
    active: Option<String>,

    /// Cursor byte offset inside the active document.
    #[arg(long, requires = "active")]
    cursor: Option<usize>,

    /// Explicitly mentioned document (repeatable).
    #[arg(long = "mention")]
    mentions: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "vassist", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = load_config(&cli.config)?;
    let assistant = Assistant::open(cfg, Arc::new(TerminalPrompter))?;

    match cli.command {
        Commands::Index { action } => match action {
            IndexAction::Rebuild => {
                let stats = assistant.indexer.rebuild().await?;
                println!(
                    "Indexed {} documents into {} chunks ({} skipped).",
                    stats.documents, stats.chunks, stats.skipped
                );
            }
            IndexAction::Status => {
                assistant.indexer.load_or_rebuild().await?;
                print_status(&assistant);
            }
        },
        Commands::Context { query, inputs } => {
            assistant.indexer.load_or_rebuild().await?;
            let request = build_request(&assistant, query, inputs).await?;
            let (context, missing) = gather_context(
                assistant.vault.as_ref(),
                &assistant.indexer,
                &request,
                assistant.config.retrieval.max_context,
                assistant.config.index.chunk_size,
            )
            .await;
            print_context(&context, &missing);
            if context.has_context() {
                println!("{}", context.prompt);
            }
        }
        Commands::Ask { message, inputs } => {
            assistant.indexer.load_or_rebuild().await?;
            let mut orchestrator = assistant.orchestrator()?;
            let request = build_request(&assistant, message, inputs).await?;
            run_interruptible(&mut orchestrator, request).await;
        }
        Commands::Chat => {
            assistant.indexer.load_or_rebuild().await?;
            run_chat(&assistant).await?;
        }
        Commands::Tools => {
            let enabled = &assistant.config.tools.enabled;
            for tool in assistant.dispatcher.all_tools() {
                let name = tool.name().to_string();
                println!(
                    "{:<14} {:<7} {:<8} {:<12} {}",
                    name,
                    tool.risk().as_str(),
                    if enabled.contains(&name) { "enabled" } else { "disabled" },
                    format!("{:?}", assistant.dispatcher.consent().mode_for(&name)),
                    tool.description()
                );
            }
        }
        Commands::Undo { id: Some(id) } => {
            let result = assistant.dispatcher.undo(&id).await;
            match result.error {
                None => println!("Reverted {}.", id),
                Some(error) => eprintln!("Undo failed: {}", error),
            }
        }
        Commands::Undo { id: None } => {
            let records = assistant.dispatcher.journal().list();
            if records.is_empty() {
                println!("Nothing to undo.");
            }
            for record in records {
                println!(
                    "{}  {}  {}",
                    record.execution_id,
                    record.applied_at.format("%Y-%m-%d %H:%M:%S"),
                    record.path
                );
            }
        }
        Commands::Audit { limit } => {
            for entry in assistant.dispatcher.audit().recent(limit)? {
                println!(
                    "{}  {:<8} {:<12} {:<5} {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    format!("{:?}", entry.kind).to_lowercase(),
                    entry.tool,
                    if entry.success { "ok" } else { "fail" },
                    entry.error.unwrap_or_else(|| entry.params.to_string())
                );
            }
        }
        Commands::Watch => {
            assistant.indexer.load_or_rebuild().await?;
            print_status(&assistant);
            let watcher = VaultWatcher::start(&assistant.config.vault.root)?;
            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                ctrl_c.cancel();
            });
            eprintln!("Watching {} (Ctrl-C to stop)", assistant.config.vault.root.display());
            watcher.run(assistant.indexer.clone(), cancel).await?;
        }
        Commands::Completions { .. } => {}
    }

    assistant.shutdown()
}

fn print_status(assistant: &Assistant) {
    let status = assistant.indexer.status();
    println!("Indexing:  {}", if status.enabled { "enabled" } else { "disabled" });
    println!("Documents: {}", status.documents);
    println!("Chunks:    {}", status.chunks);
    println!("Snapshot:  {}", status.snapshot_path.display());
    match status.last_saved {
        Some(at) => println!("Saved:     {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("Saved:     never (this session)"),
    }
}

async fn build_request(assistant: &Assistant, message: String, inputs: TurnInputs) -> Result<TurnRequest> {
    let active = match inputs.active {
        Some(path) => {
            let text = assistant.vault.read(&path).await?;
            Some(ActiveInput {
                path,
                text,
                cursor: inputs.cursor,
            })
        }
        None => None,
    };
    Ok(TurnRequest {
        message,
        mentions: inputs.mentions,
        active,
    })
}

fn print_context(context: &RagContext, missing: &[String]) {
    for chunk in context.chunks() {
        eprintln!(
            "  [{}] {} (score {})",
            chunk.source,
            chunk.chunk.location(),
            chunk.score
        );
    }
    if !missing.is_empty() {
        eprintln!("  not found: {}", missing.join(", "));
    }
}

async fn run_chat(assistant: &Assistant) -> Result<()> {
    let mut orchestrator = assistant.orchestrator()?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprintln!("Type a message. /clear resets the conversation, /quit exits.");
    loop {
        eprint!("> ");
        let _ = std::io::stderr().flush();
        let Some(line) = lines.next_line().await? else { break };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                orchestrator.clear_history();
                assistant.dispatcher.consent().clear_session();
                continue;
            }
            _ => {}
        }
        let request = TurnRequest {
            message: line.to_string(),
            mentions: parse_mentions(line),
            active: None,
        };
        run_interruptible(&mut orchestrator, request).await;
    }
    Ok(())
}

/// Run one turn with Ctrl-C bound to its cancellation token.
async fn run_interruptible(orchestrator: &mut Orchestrator, request: TurnRequest) -> TurnOutcome {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    let observer = TerminalObserver::default();
    let outcome = orchestrator.run_turn(request, cancel, &observer).await;
    ctrl_c.abort();

    // Streamed text was printed as it arrived; placeholders were not.
    if observer.streamed.load(Ordering::Relaxed) && outcome.status != TurnStatus::NoResponse {
        println!();
    } else {
        println!("{}", outcome.text);
    }
    outcome
}

/// `@word` and `@[[Long Name]]` mentions inside a chat line.
fn parse_mentions(line: &str) -> Vec<String> {
    let mut mentions = Vec::new();
    let mut rest = line;
    while let Some(at) = rest.find('@') {
        rest = &rest[at + 1..];
        if let Some(inner) = rest.strip_prefix("[[") {
            if let Some(end) = inner.find("]]") {
                mentions.push(inner[..end].to_string());
                rest = &inner[end + 2..];
                continue;
            }
        }
        let end = rest
            .find(|c: char| c.is_whitespace() || matches!(c, ',' | '?' | '!'))
            .unwrap_or(rest.len());
        let name = rest[..end].trim_end_matches('.');
        if !name.is_empty() {
            mentions.push(name.to_string());
        }
        rest = &rest[end..];
    }
    mentions
}

#[derive(Default)]
struct TerminalObserver {
    streamed: AtomicBool,
}

impl TurnObserver for TerminalObserver {
    fn on_context(&self, context: &RagContext, missing: &[String]) {
        print_context(context, missing);
    }

    fn on_delta(&self, text: &str) {
        self.streamed.store(true, Ordering::Relaxed);
        print!("{}", text);
        let _ = std::io::stdout().flush();
    }

    fn on_tool_call(&self, call: &ToolCall) {
        eprintln!("\n  → {} {}", call.name, call.arguments.to_json_string());
    }

    fn on_tool_result(&self, call: &ToolCall, result: &ToolResult) {
        let id = result.execution_id.as_deref().unwrap_or("-");
        if result.success {
            eprintln!("  ✓ {} ({})", call.name, id);
        } else {
            eprintln!("  ✗ {} failed", call.name);
        }
    }

    fn on_notice(&self, notice: &str) {
        eprintln!("  ! {}", notice);
    }
}
