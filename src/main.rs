use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use hyper_shell::client::run_client;
use hyper_shell::cluster::{self, run_cluster};
use hyper_shell::config::{self, ClientConfig, ClusterConfig, Launcher, ServerConfig};
use hyper_shell::error::{HyperError, Result};
use hyper_shell::server::run_server;
use hyper_shell::shutdown::install_shutdown_handler;
use hyper_shell::store::{SqliteStore, TaskState, TaskStore};
use hyper_shell::submit::submit_to_store;
use hyper_shell::task_cli::{self, SearchFormat};

#[derive(Parser, Debug)]
#[command(name = "hyper-shell")]
#[command(about = "Distributed shell-command execution across local and remote workers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Log at debug level
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Log at trace level
    #[arg(short = 'd', long, global = true)]
    debug: bool,

    /// Detailed log format (targets and thread ids)
    #[arg(short = 'l', long, global = true)]
    logging: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the task queue server
    Server(ServerArgs),
    /// Run a client executor
    Client(ClientArgs),
    /// Run server plus N clients in one invocation
    Cluster(ClusterArgs),
    /// Submit tasks to the durable store
    Submit(SubmitArgs),
    /// Inspect tasks
    #[command(subcommand)]
    Task(TaskCmd),
    /// Read or write configuration
    #[command(subcommand)]
    Config(ConfigCmd),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Input task file ("-" for stdin, omit to serve forever)
    filepath: Option<String>,

    /// Bind address
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port number
    #[arg(short = 'p', long, default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Pre-shared authentication key
    #[arg(short = 'k', long)]
    authkey: Option<String>,

    /// Ready-queue capacity
    #[arg(short = 's', long, default_value_t = config::DEFAULT_MAXSIZE)]
    maxsize: usize,

    /// Attempts per task before abandonment (default 1, or 3 with a database)
    #[arg(short = 'r', long)]
    max_attempts: Option<u32>,

    /// File path for failed task args
    #[arg(short = 'f', long)]
    failed: Option<PathBuf>,

    /// File path for captured task output
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Database location (path or sqlite: URL)
    #[arg(long)]
    database: Option<String>,

    /// Run without the durable store
    #[arg(long)]
    no_db: bool,
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Server hostname
    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(short = 'p', long, default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Pre-shared authentication key
    #[arg(short = 'k', long, default_value = config::BADKEY)]
    authkey: String,

    /// Tasks to keep outstanding
    #[arg(short = 'N', long, default_value_t = 1)]
    num_tasks: usize,

    /// Command template applied to each task
    #[arg(short = 't', long, default_value = hyper_shell::template::DEFAULT_TEMPLATE)]
    template: String,

    /// Capture task stdout/stderr into the result
    #[arg(long)]
    capture: bool,

    /// Exit after this many seconds without work (0 = never)
    #[arg(short = 'x', long, default_value_t = 0)]
    timeout: u64,

    /// Redirect task output to a file
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Redirect task errors to a file
    #[arg(short = 'e', long)]
    errors: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ClusterArgs {
    /// Input task file ("-" for stdin)
    filepath: Option<String>,

    /// Number of local clients (0 = core count)
    #[arg(short = 'N', long = "num-cores", default_value_t = 0)]
    num_cores: usize,

    /// Tasks each client keeps outstanding
    #[arg(long, default_value_t = 1)]
    num_tasks: usize,

    /// Command template applied to each task
    #[arg(short = 't', long, default_value = hyper_shell::template::DEFAULT_TEMPLATE)]
    template: String,

    /// Port number
    #[arg(short = 'p', long, default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Pre-shared authentication key (autogenerated when omitted)
    #[arg(short = 'k', long)]
    authkey: Option<String>,

    /// Ready-queue capacity
    #[arg(short = 's', long, default_value_t = config::DEFAULT_MAXSIZE)]
    maxsize: usize,

    /// Attempts per task before abandonment (default 1, or 3 with a database)
    #[arg(short = 'r', long)]
    max_attempts: Option<u32>,

    /// File path for failed task args
    #[arg(short = 'f', long)]
    failed: Option<PathBuf>,

    /// File path for captured task output
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Capture task stdout/stderr instead of joining client streams
    #[arg(long)]
    capture: bool,

    /// Seconds allowed for in-flight tasks at shutdown
    #[arg(short = 'x', long, default_value_t = 30)]
    timeout: u64,

    /// Database location (path or sqlite: URL)
    #[arg(long)]
    database: Option<String>,

    /// Run without the durable store
    #[arg(long)]
    no_db: bool,

    /// Launch one SSH client per line of this node file
    #[arg(long, conflicts_with = "mpi")]
    ssh: Option<PathBuf>,

    /// Launch clients through mpiexec with this machine file
    #[arg(long)]
    mpi: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// Input task file ("-" for stdin)
    filepath: Option<String>,

    /// Database location (path or sqlite: URL)
    #[arg(long)]
    database: Option<String>,
}

#[derive(Subcommand, Debug)]
enum TaskCmd {
    /// Print one task record
    Show { id: i64, #[command(flatten)] db: DbArg },
    /// Per-state counts
    Status { #[command(flatten)] db: DbArg },
    /// List tasks
    Search {
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        /// Maximum rows
        #[arg(long)]
        limit: Option<u32>,
        /// JSON output
        #[arg(long)]
        json: bool,
        /// CSV output
        #[arg(long)]
        csv: bool,
        /// Raw args column only
        #[arg(short = 'x')]
        raw: bool,
        /// Count only
        #[arg(short = 'c')]
        count: bool,
        #[command(flatten)]
        db: DbArg,
    },
    /// Block until a task reaches a terminal state
    Wait { id: i64, #[command(flatten)] db: DbArg },
}

#[derive(Args, Debug)]
struct DbArg {
    /// Database location (path or sqlite: URL)
    #[arg(long)]
    database: Option<String>,
}

#[derive(Subcommand, Debug)]
enum ConfigCmd {
    /// Print one configuration value
    Get { key: String },
    /// Write one configuration value
    Set { key: String, value: String },
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.debug {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            std::env::var("HYPERSHELL_LOGGING_LEVEL")
                .map_err(|_| ())
                .and_then(|level| EnvFilter::try_new(level).map_err(|_| ()))
        })
        .unwrap_or_else(|_: ()| EnvFilter::new(default_level));
    let to_stdout = matches!(
        std::env::var("HYPERSHELL_LOGGING_HANDLER").as_deref(),
        Ok("stdout")
    );
    match (to_stdout, cli.logging) {
        (true, true) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stdout)
            .with_target(true)
            .with_thread_ids(true)
            .init(),
        (true, false) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stdout)
            .with_target(false)
            .init(),
        (false, true) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(true)
            .init(),
        (false, false) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init(),
    }
}

/// Resolve FILE / "-" / None into a buffered reader; None means stdin for
/// subcommands that always take input.
async fn open_source(
    filepath: &Option<String>,
) -> Result<Box<dyn tokio::io::AsyncBufRead + Unpin + Send>> {
    match filepath.as_deref() {
        None | Some("-") => Ok(Box::new(BufReader::new(tokio::io::stdin()))),
        Some(path) => {
            let file = tokio::fs::File::open(path).await.map_err(|err| {
                HyperError::Fatal(format!("cannot open task file {path}: {err}"))
            })?;
            Ok(Box::new(BufReader::new(file)))
        }
    }
}

fn resolve_bind(host: &str, port: u16) -> Result<std::net::SocketAddr> {
    use std::net::ToSocketAddrs;
    (host, port)
        .to_socket_addrs()
        .map_err(|err| HyperError::Parse(format!("bad bind address {host}:{port}: {err}")))?
        .next()
        .ok_or_else(|| HyperError::Parse(format!("bind address {host}:{port} does not resolve")))
}

fn database_location(flag: Option<String>, no_db: bool) -> Result<Option<String>> {
    if no_db {
        if flag.is_some() {
            return Err(HyperError::Parse(
                "--no-db and --database are mutually exclusive".to_string(),
            ));
        }
        return Ok(None);
    }
    match flag {
        Some(location) => Ok(Some(location)),
        None => Ok(Some(config::load_settings()?.database.path)),
    }
}

async fn open_store(database: Option<String>) -> Result<Arc<dyn TaskStore>> {
    let location = database
        .map(Ok)
        .unwrap_or_else(|| config::load_settings().map(|s| s.database.path))?;
    Ok(Arc::new(SqliteStore::open(&location).await?))
}

/// Default retry budget: no retries without the durable store, 3 with it.
fn default_attempts(database: &Option<String>) -> u32 {
    if database.is_some() {
        3
    } else {
        1
    }
}

async fn run(cli: Cli) -> Result<u8> {
    match cli.command {
        Cmd::Server(args) => {
            let database = database_location(args.database, args.no_db)?;
            let config = ServerConfig {
                bind: resolve_bind(&args.host, args.port)?,
                authkey: args.authkey.unwrap_or_else(|| config::BADKEY.to_string()),
                maxsize: args.maxsize,
                max_attempts: args.max_attempts.unwrap_or_else(|| default_attempts(&database)),
                database,
                failure_path: args.failed,
                output_path: args.output,
                ..Default::default()
            };
            let shutdown = install_shutdown_handler();
            let source = match args.filepath {
                Some(ref path) => Some(open_source(&Some(path.clone())).await?),
                None => None,
            };
            run_server(config, source, shutdown).await
        }
        Cmd::Client(args) => {
            let config = ClientConfig {
                host: args.host,
                port: args.port,
                authkey: args.authkey,
                num_tasks: args.num_tasks,
                template: args.template,
                capture: args.capture,
                timeout: Duration::from_secs(args.timeout),
                output_path: args.output,
                errors_path: args.errors,
            };
            run_client(config).await.map(|_| 0)
        }
        Cmd::Cluster(args) => {
            let database = database_location(args.database.clone(), args.no_db)?;
            let launcher = if let Some(nodefile) = args.ssh {
                Launcher::Ssh { nodefile }
            } else if let Some(machinefile) = args.mpi {
                Launcher::Mpi { machinefile }
            } else {
                Launcher::Local {
                    num_clients: args.num_cores,
                }
            };
            let config = ClusterConfig {
                server: ServerConfig {
                    bind: resolve_bind("0.0.0.0", args.port)?,
                    authkey: args.authkey.unwrap_or_else(|| config::BADKEY.to_string()),
                    maxsize: args.maxsize,
                    max_attempts: args
                        .max_attempts
                        .unwrap_or_else(|| default_attempts(&database)),
                    drain_deadline: Duration::from_secs(args.timeout),
                    database,
                    failure_path: args.failed,
                    output_path: args.output,
                    ..Default::default()
                },
                launcher,
                num_tasks: args.num_tasks,
                template: args.template,
                capture: args.capture,
                stagger: cluster::DEFAULT_STAGGER,
            };
            let shutdown = install_shutdown_handler();
            let source = open_source(&args.filepath).await?;
            run_cluster(config, source, shutdown).await
        }
        Cmd::Submit(args) => {
            let store = open_store(args.database).await?;
            let source = open_source(&args.filepath).await?;
            let submitted = submit_to_store(&store, source).await?;
            println!("{submitted}");
            Ok(0)
        }
        Cmd::Task(command) => match command {
            TaskCmd::Show { id, db } => {
                let store = open_store(db.database).await?;
                println!("{}", task_cli::show(&store, id).await?);
                Ok(0)
            }
            TaskCmd::Status { db } => {
                let store = open_store(db.database).await?;
                println!("{}", task_cli::status(&store).await?);
                Ok(0)
            }
            TaskCmd::Search {
                state,
                limit,
                json,
                csv,
                raw,
                count,
                db,
            } => {
                let state = state
                    .map(|text| {
                        TaskState::parse(&text).ok_or_else(|| {
                            HyperError::Parse(format!("unknown state '{text}'"))
                        })
                    })
                    .transpose()?;
                let format = if count {
                    SearchFormat::Count
                } else if raw {
                    SearchFormat::Raw
                } else if json {
                    SearchFormat::Json
                } else if csv {
                    SearchFormat::Csv
                } else {
                    SearchFormat::Table
                };
                let store = open_store(db.database).await?;
                println!("{}", task_cli::search(&store, state, limit, format).await?);
                Ok(0)
            }
            TaskCmd::Wait { id, db } => {
                let store = open_store(db.database).await?;
                let task = task_cli::wait(&store, id, Duration::from_millis(500)).await?;
                println!("{}", task.state);
                Ok(if task.state == TaskState::Done { 0 } else { 4 })
            }
        },
        Cmd::Config(command) => match command {
            ConfigCmd::Get { key } => {
                let settings = config::load_settings()?;
                println!("{}", config::settings_get(&settings, &key)?);
                Ok(0)
            }
            ConfigCmd::Set { key, value } => {
                let mut settings = config::load_settings()?;
                config::settings_set(&mut settings, &key, &value)?;
                config::store_settings(&settings)?;
                Ok(0)
            }
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::from(err.exit_code())
        }
    }
}
