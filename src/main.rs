use bedside::api::{ApiConfig, ApiError, ChatBackend, ReqwestChatBackend};
use bedside::config::Config;
use bedside::model::{Conversation, ConversationId, Message, Role};
use bedside::session::{self, ChatSession, ChatSnapshot, SessionConfig, SessionError};
use bedside::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

const DEFAULT_DOCTOR_LANGUAGE: &str = "en";
const DEFAULT_PATIENT_LANGUAGE: &str = "es";

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");
    let config = Config::from_env().with_backend_url(cli.backend);

    match cli.command {
        Some(Command::New(args)) => handle_new(&config, args).await,
        Some(Command::Join(args)) => handle_join(&config, args).await,
        Some(Command::Languages) => handle_languages(&config).await,
        Some(Command::Users(args)) => handle_users(&config, args).await,
        Some(Command::Search(args)) => handle_search(&config, args).await,
        Some(Command::Summary(args)) => handle_summary(&config, args).await,
        Some(Command::Health) => handle_health(&config).await,
        None => handle_new(&config, NewArgs::default()).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "bedside",
    about = "🩺  Bilingual doctor/patient chat over a translating backend",
    author,
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "URL",
        help = "Base URL of the translation backend (overrides BEDSIDE_BACKEND_URL)"
    )]
    backend: Option<String>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "BEDSIDE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "BEDSIDE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new conversation (default when no subcommand given)
    New(NewArgs),
    /// Join an existing conversation using its id or share URL
    Join(JoinArgs),
    /// List the languages the backend can translate between
    Languages,
    /// List or register participant profiles
    Users(UsersArgs),
    /// Search across stored messages
    Search(SearchArgs),
    /// Generate a summary of a conversation
    Summary(SummaryArgs),
    /// Check that the backend is reachable
    Health,
}

#[derive(Args, Debug)]
struct NewArgs {
    #[arg(
        long,
        value_name = "CODE",
        default_value = DEFAULT_DOCTOR_LANGUAGE,
        help = "Language the doctor writes in"
    )]
    doctor_language: String,

    #[arg(
        long,
        value_name = "CODE",
        default_value = DEFAULT_PATIENT_LANGUAGE,
        help = "Language the patient writes in"
    )]
    patient_language: String,

    #[arg(long, value_enum, default_value_t = Role::Doctor, help = "Side you type as")]
    role: Role,
}

impl Default for NewArgs {
    fn default() -> Self {
        Self {
            doctor_language: DEFAULT_DOCTOR_LANGUAGE.to_string(),
            patient_language: DEFAULT_PATIENT_LANGUAGE.to_string(),
            role: Role::Doctor,
        }
    }
}

#[derive(Args, Debug)]
struct JoinArgs {
    #[arg(value_name = "CONVERSATION", help = "Conversation id or share URL")]
    target: String,

    #[arg(long, value_enum, help = "Side you type as")]
    role: Role,
}

#[derive(Args, Debug)]
struct UsersArgs {
    #[command(subcommand)]
    command: Option<UsersCommand>,
}

#[derive(Subcommand, Debug)]
enum UsersCommand {
    /// List registered users, optionally filtered by role
    List {
        #[arg(long, value_enum)]
        role: Option<Role>,
    },
    /// Register a new user profile
    Add {
        #[arg(value_name = "NAME")]
        name: String,
        #[arg(long, value_enum)]
        role: Role,
        #[arg(long, value_name = "CODE", default_value = DEFAULT_DOCTOR_LANGUAGE)]
        language: String,
    },
}

#[derive(Args, Debug)]
struct SearchArgs {
    #[arg(value_name = "QUERY")]
    query: String,

    #[arg(long, value_name = "ID", help = "Restrict the search to one conversation")]
    conversation: Option<String>,
}

#[derive(Args, Debug)]
struct SummaryArgs {
    #[arg(value_name = "CONVERSATION", help = "Conversation id to summarize")]
    conversation: String,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Api(#[from] ApiError),
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
}

fn build_backend(config: &Config) -> Result<Arc<ReqwestChatBackend>, CliError> {
    let api = ApiConfig::new(&config.backend_url)?;
    Ok(Arc::new(ReqwestChatBackend::new(api)?))
}

async fn handle_new(config: &Config, args: NewArgs) -> Result<(), CliError> {
    let backend = build_backend(config)?;
    let conversation = backend
        .create_conversation(&args.doctor_language, &args.patient_language)
        .await?;
    info!(conversation = %conversation.id, "conversation created");
    run_chat(backend, conversation, args.role, config.poll_interval).await
}

async fn handle_join(config: &Config, args: JoinArgs) -> Result<(), CliError> {
    let backend = build_backend(config)?;
    let conversation = match session::resolve_share_target(backend.as_ref(), &args.target).await {
        Ok(conversation) => conversation,
        Err(SessionError::Api(err)) if err.is_not_found() => {
            // Stale share links should never strand the user in a broken
            // chat; drop them into a fresh conversation instead.
            warn!(error = %err, "share target rejected, starting fresh");
            eprintln!("⚠️  {err}; starting a fresh conversation instead");
            backend
                .create_conversation(DEFAULT_DOCTOR_LANGUAGE, DEFAULT_PATIENT_LANGUAGE)
                .await?
        }
        Err(err) => return Err(err.into()),
    };
    run_chat(backend, conversation, args.role, config.poll_interval).await
}

async fn handle_languages(config: &Config) -> Result<(), CliError> {
    let backend = build_backend(config)?;
    let languages = backend.list_languages().await?;
    for language in languages {
        println!("{:>6}  {}", language.code, language.name);
    }
    Ok(())
}

async fn handle_users(config: &Config, args: UsersArgs) -> Result<(), CliError> {
    let backend = build_backend(config)?;
    let command = args.command.unwrap_or(UsersCommand::List { role: None });
    match command {
        UsersCommand::Add { name, role, language } => {
            let user = backend.create_user(&name, role, &language).await?;
            println!("registered {} ({}) with id {}", user.name, user.role, user.unique_id);
        }
        UsersCommand::List { role } => {
            let users = backend.list_users(role).await?;
            if users.is_empty() {
                println!("no registered users");
            }
            for user in users {
                println!("{:>7}  {:<12}  {}", user.role, user.unique_id, user.name);
            }
        }
    }
    Ok(())
}

async fn handle_search(config: &Config, args: SearchArgs) -> Result<(), CliError> {
    let backend = build_backend(config)?;
    let conversation = args.conversation.map(ConversationId::from);
    let response = backend
        .search_messages(&args.query, conversation.as_ref())
        .await?;
    println!(
        "{} match(es) for \"{}\"",
        response.total_count, response.query
    );
    for hit in &response.results {
        let time = hit.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M");
        println!("[{time}] {:>7} in {}", hit.role, hit.conversation_id);
        println!("          {}", hit.original_text);
        println!("          {}", hit.translated_text);
    }
    Ok(())
}

async fn handle_summary(config: &Config, args: SummaryArgs) -> Result<(), CliError> {
    let backend = build_backend(config)?;
    let summary = backend
        .summarize(&ConversationId::from(args.conversation))
        .await?;
    let generated = summary
        .generated_at
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M");
    println!("summary for {} (generated {generated})", summary.conversation_id);
    println!();
    println!("{}", summary.summary);
    Ok(())
}

async fn handle_health(config: &Config) -> Result<(), CliError> {
    let backend = build_backend(config)?;
    let health = backend.health().await?;
    println!("backend {} reports: {}", config.backend_url, health.status);
    Ok(())
}

async fn run_chat(
    backend: Arc<ReqwestChatBackend>,
    conversation: Conversation,
    role: Role,
    poll_interval: Duration,
) -> Result<(), CliError> {
    let share = session::share_url(backend.config().base_url(), &conversation.id);
    print_banner(&conversation, role, &share);

    let engine_backend: Arc<dyn ChatBackend> = backend.clone();
    let session = ChatSession::spawn(
        engine_backend,
        conversation.id.clone(),
        SessionConfig { poll_interval },
    );
    let mut snapshots = session.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printed = 0usize;
    let mut last_error: Option<String> = None;

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                render_snapshot(&snapshot, role, &mut printed, &mut last_error);
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        let text = line.trim();
                        if text.is_empty() {
                            continue;
                        }
                        if text == "/quit" || text == "/q" {
                            break;
                        }
                        if text == "/refresh" || text == "/r" {
                            if session.refresh().is_err() {
                                break;
                            }
                            continue;
                        }
                        match session.send(role, text).await {
                            Ok(_) => {}
                            Err(SessionError::Api(ApiError::EmptyMessage)) => {
                                println!("(nothing to send)");
                            }
                            Err(err) => eprintln!("⚠️  send failed: {err}"),
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.shutdown().await;
    Ok(())
}

fn print_banner(conversation: &Conversation, role: Role, share: &url::Url) {
    println!("🩺  conversation {}", conversation.id);
    println!(
        "    you write as the {} in {}; replies arrive translated from {}",
        role,
        conversation.language_for(role),
        conversation.language_for(role.counterpart()),
    );
    println!("    share link: {share}");
    println!("    type to send; /refresh reloads the transcript, /quit leaves");
}

fn render_snapshot(
    snapshot: &ChatSnapshot,
    viewer: Role,
    printed: &mut usize,
    last_error: &mut Option<String>,
) {
    if snapshot.messages.len() < *printed {
        println!("    (transcript reloaded)");
        *printed = 0;
    }
    for message in &snapshot.messages[*printed..] {
        print_message(message, viewer);
    }
    *printed = snapshot.messages.len();

    if snapshot.error != *last_error {
        match &snapshot.error {
            Some(error) => eprintln!("⚠️  sync error: {error} (will keep retrying)"),
            None => {
                if last_error.is_some() {
                    eprintln!("    sync restored");
                }
            }
        }
        *last_error = snapshot.error.clone();
    }
}

fn print_message(message: &Message, viewer: Role) {
    // Own messages show what was typed; the counterpart's show the
    // translation into the viewer's language.
    let time = message.created_at.with_timezone(&Local).format("%H:%M");
    if message.role == viewer {
        println!("[{time}] {:>7}: {}", message.role, message.original_text);
        println!("{:17}({})", "", message.translated_text);
    } else {
        println!("[{time}] {:>7}: {}", message.role, message.translated_text);
    }
}
