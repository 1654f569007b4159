//! devopsx - a terminal agent for shells, remote hosts and delegated sub-tasks
//!
//! Without a subcommand, runs the given prompts through a conversation (or an
//! interactive prompt loop when none are given on a terminal). Subcommands
//! inspect stored conversations and manage remote targets.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use devopsx_core::chat::{initial_messages, ChatSession, Runtime, RuntimeBuilder};
use devopsx_core::config::Config;
use devopsx_core::constants::{files, MAIN_BRANCH};
use devopsx_core::message::{Message, Role};
use devopsx_core::paths::Paths;
use devopsx_core::remote::RemoteTarget;
use devopsx_core::transcript::{generate_name, list_conversations, Transcript};

mod terminal;

use terminal::{read_line, TerminalOperator};

/// devopsx - drive shells, remote hosts and sub-tasks from a language model
#[derive(Parser)]
#[command(name = "devopsx")]
#[command(about = "Terminal agent for shells, remote hosts and delegated sub-tasks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Conversation to continue or create
    #[arg(long)]
    name: Option<String>,

    /// Model identifier passed to the completion provider
    #[arg(long)]
    model: Option<String>,

    /// Run tools without asking first
    #[arg(long)]
    no_confirm: bool,

    /// Debug-level diagnostics in the log file
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Prompts to run, in order
    prompts: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a conversation
    Log {
        name: String,
        /// Include hidden messages
        #[arg(long)]
        hidden: bool,
        #[arg(long, default_value = MAIN_BRANCH)]
        branch: String,
    },
    /// List stored conversations, newest first
    Conversations,
    /// List the branches of a conversation
    Branches { name: String },
    /// Compare the main branch of a conversation with another branch
    Diff { name: String, branch: String },
    /// Copy a conversation to a new name
    Fork { name: String, new_name: String },
    /// Rename a conversation
    Rename {
        name: String,
        new_name: String,
        /// Keep the date prefix of the current name
        #[arg(long)]
        keep_date: bool,
    },
    /// Manage remote targets
    #[command(subcommand)]
    Agents(AgentCommands),
}

#[derive(Subcommand)]
enum AgentCommands {
    /// List registered targets
    List,
    /// Verify and register a target
    Add(AddArgs),
    /// Forget a target
    Rm { id: String },
    /// Run a command on a target
    Run {
        id: String,
        /// Run through sudo
        #[arg(long)]
        sudo: bool,
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
}

#[derive(Args)]
struct AddArgs {
    id: String,
    /// `user@host`
    destination: String,
    /// Private key; without it the password is asked for
    #[arg(short, long)]
    identity: Option<PathBuf>,
    #[arg(short, long, default_value_t = 22)]
    port: u16,
}

fn init_logging(paths: &Paths, verbose: bool) -> Result<()> {
    let log_dir = paths.diagnostics_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let log_file = std::fs::File::create(log_dir.join("devopsx.log"))
        .context("Failed to create log file")?;

    let default = if verbose {
        "devopsx=debug,devopsx_core=debug"
    } else {
        "devopsx=info,devopsx_core=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(log_file))
        .with_ansi(false)
        .init();
    Ok(())
}

/// Conversation that must already exist on disk
fn open_existing(paths: &Paths, name: &str, branch: &str) -> Result<Transcript> {
    let dir = paths.conversation_dir(name);
    if !dir.join(files::CONVERSATION_FILE).exists() {
        anyhow::bail!("No conversation named '{}'", name);
    }
    let branch_file = dir.join(files::BRANCHES_DIR).join(format!("{}.jsonl", branch));
    if branch != MAIN_BRANCH && !branch_file.exists() {
        anyhow::bail!("Conversation '{}' has no branch '{}'", name, branch);
    }
    Transcript::load(paths, name, Vec::new(), branch)
        .with_context(|| format!("Failed to load conversation '{}'", name))
}

fn build_runtime(paths: Paths, cli: &Cli) -> Result<Arc<Runtime>> {
    let mut config = Config::load(&paths).context("Failed to load config")?;
    if let Some(model) = &cli.model {
        config.model = model.clone();
    }
    if cli.no_confirm {
        config.tools.confirm = false;
    }
    RuntimeBuilder::new(paths.clone())
        .with_config(config)
        .with_operator(Arc::new(TerminalOperator::new(paths.diagnostics_dir())))
        .build()
}

/// Cancel the running step on every Ctrl-C
fn spawn_interrupt_watcher(session: &ChatSession) -> tokio::task::JoinHandle<()> {
    let handle = session.interrupt_handle();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt requested");
            handle.interrupt();
        }
    })
}

async fn interactive(session: &mut ChatSession) -> Result<()> {
    println!("devopsx: conversation {} (/help for commands, Ctrl-D to quit)", session.transcript().name());
    loop {
        let Some(line) = tokio::task::spawn_blocking(|| read_line("User: ")).await?? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        let result = match session.append(Message::user(line)) {
            Ok(()) => session.drive().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), "Turn aborted");
                eprintln!("Error: {:#}", e);
            }
        }
    }
    Ok(())
}

async fn chat(cli: Cli, paths: Paths) -> Result<()> {
    let runtime = build_runtime(paths.clone(), &cli)?;
    let name = cli.name.clone().unwrap_or_else(generate_name);
    let transcript = Transcript::load(&paths, &name, initial_messages(&runtime.registry), MAIN_BRANCH)
        .with_context(|| format!("Failed to open conversation '{}'", name))?;
    tracing::info!(name = %name, "Starting conversation");

    let mut session = ChatSession::new(runtime, transcript);
    let watcher = spawn_interrupt_watcher(&session);

    let result = if !cli.prompts.is_empty() {
        session.run(cli.prompts).await
    } else if std::io::stdin().is_terminal() {
        interactive(&mut session).await
    } else {
        // Resume a conversation whose last message still needs an answer
        let pending = session.transcript().last().is_some_and(|m| m.role == Role::User);
        if pending {
            session.drive().await.map(|_| ())
        } else {
            Ok(())
        }
    };
    watcher.abort();
    result?;

    println!("Conversation saved as {}", session.transcript().name());
    Ok(())
}

async fn agents(command: AgentCommands, cli: &Cli, paths: Paths) -> Result<()> {
    let runtime = build_runtime(paths, cli)?;
    let pool = &runtime.remote;
    match command {
        AgentCommands::List => {
            let targets = pool.targets();
            if targets.is_empty() {
                println!("No remote targets registered.");
            }
            for (key, target) in targets {
                println!("{}\t{}\t{}", key, target, pool.status(&key).await);
            }
        }
        AgentCommands::Add(args) => {
            let (user, host) = RemoteTarget::parse_destination(&args.destination)
                .with_context(|| format!("Expected <user>@<host>, got '{}'", args.destination))?;
            let target = match args.identity {
                Some(identity) => RemoteTarget::with_identity(&user, &host, args.port, identity),
                None => RemoteTarget::with_password(&user, &host, args.port),
            };
            pool.register(&args.id, target, runtime.operator.as_ref())
                .await
                .with_context(|| format!("Failed to register {}", args.id))?;
            println!("Registered {}", args.id.to_uppercase());
        }
        AgentCommands::Rm { id } => {
            pool.deregister(&id).await?;
            println!("Removed {}", id.to_uppercase());
        }
        AgentCommands::Run { id, sudo, command } => {
            let command = command.join(" ");
            let output = pool
                .run(&id, &command, sudo, runtime.operator.as_ref())
                .await
                .with_context(|| format!("Failed to run on {}", id))?;
            print!("{}", output.render(&command));
            if !output.success() {
                std::process::exit(output.status.clamp(1, 255));
            }
        }
    }
    Ok(())
}

fn inspect(command: Commands, paths: &Paths) -> Result<()> {
    match command {
        Commands::Log { name, hidden, branch } => {
            let transcript = open_existing(paths, &name, &branch)?;
            for msg in transcript.messages().iter().filter(|m| hidden || !m.hidden) {
                println!("{}", msg.format_line(None));
            }
        }
        Commands::Conversations => {
            for conv in list_conversations(paths)? {
                println!(
                    "{}\t{} messages\t{} branches\t{}",
                    conv.name,
                    conv.messages,
                    conv.branches,
                    conv.modified.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Commands::Branches { name } => {
            let transcript = open_existing(paths, &name, MAIN_BRANCH)?;
            for branch in transcript.branches() {
                let len = transcript.branch_messages(branch).map_or(0, <[Message]>::len);
                println!("{}\t{} messages", branch, len);
            }
        }
        Commands::Diff { name, branch } => {
            let transcript = open_existing(paths, &name, MAIN_BRANCH)?;
            match transcript.diff(&branch)? {
                Some(diff) => println!("{}", diff),
                None => println!("No difference from {}", branch),
            }
        }
        Commands::Fork { name, new_name } => {
            let transcript = open_existing(paths, &name, MAIN_BRANCH)?;
            let target = transcript.fork(&new_name)?;
            println!("Forked {} to {}", name, target.display());
        }
        Commands::Rename { name, new_name, keep_date } => {
            let mut transcript = open_existing(paths, &name, MAIN_BRANCH)?;
            transcript.rename(&new_name, keep_date)?;
            println!("Renamed {} to {}", name, transcript.name());
        }
        Commands::Agents(_) => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    let paths = Paths::from_env();
    init_logging(&paths, cli.verbose)?;
    tracing::debug!(config_dir = %paths.config_dir.display(), "devopsx starting");

    match cli.command.take() {
        Some(Commands::Agents(command)) => agents(command, &cli, paths).await,
        Some(command) => inspect(command, &paths),
        None => chat(cli, paths).await,
    }
}
