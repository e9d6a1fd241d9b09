/*!
 * Tether CLI
 *
 * `tether worker` serves one build session, `tether orchestrate` drives a set
 * of workers through Attach, optional pips and Exit, and `tether vm` reads
 * and writes VM command files.
 */

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tether::{
    check_outcomes,
    config::{LogLevel, TetherConfig},
    error::{TetherError, EXIT_FATAL, EXIT_SUCCESS},
    logging::{self, LoggingHandle},
    remoting::ProcessInfo,
    vm::{InitializeVmRequest, RunRequest, VmCommandProxy},
    worker_host::{WorkerHost, EXIT_LINGER},
    Orchestrator, PipResponse,
};
use tether_connect::Endpoint;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tether")]
#[command(version, about = "Session layer between a build orchestrator and its workers", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[arg(long = "log-level", value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Write JSON logs to this file instead of stdout
    #[arg(long = "log", value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Append catalog events to this file as JSON Lines
    #[arg(long = "events-file", value_name = "FILE", global = true)]
    events_file: Option<PathBuf>,

    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve one build session until the orchestrator sends Exit
    Worker(WorkerArgs),

    /// Attach a set of workers, optionally run a pip on each, then exit them
    Orchestrate(OrchestrateArgs),

    /// VM command files
    #[command(subcommand)]
    Vm(VmCommand),
}

#[derive(Args)]
struct SessionArgs {
    /// Session id shared by the orchestrator and its workers
    #[arg(long = "session", env = "TETHER_SESSION")]
    session: Option<String>,

    /// Environment label
    #[arg(long = "environment", env = "TETHER_ENVIRONMENT")]
    environment: Option<String>,
}

#[derive(Args)]
struct WorkerArgs {
    #[arg(long = "listen", value_name = "ADDR")]
    listen: Option<String>,

    /// Offload pips through remote execution
    #[arg(long = "remoting")]
    remoting: bool,

    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Args)]
struct OrchestrateArgs {
    /// Worker address (host:port); repeat for several workers
    #[arg(long = "worker", value_name = "ADDR", required = true)]
    workers: Vec<String>,

    #[arg(long = "connect-timeout-ms")]
    connect_timeout_ms: Option<u64>,

    #[arg(long = "call-timeout-ms")]
    call_timeout_ms: Option<u64>,

    #[arg(long = "max-attempts")]
    max_attempts: Option<u32>,

    /// Program and arguments to run once on every attached worker
    #[arg(long = "run", value_name = "PROGRAM", num_args = 1.., allow_hyphen_values = true)]
    run: Vec<String>,

    /// Working directory for --run
    #[arg(long = "cwd", value_name = "DIR")]
    cwd: Option<PathBuf>,

    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Subcommand)]
enum VmCommand {
    /// Write an InitializeVm request
    WriteInit {
        #[arg(long = "file")]
        file: PathBuf,
        #[arg(long = "subst-drive")]
        subst_drive: String,
        #[arg(long = "subst-path")]
        subst_path: String,
    },

    /// Write a Run request
    WriteRun {
        #[arg(long = "file")]
        file: PathBuf,
        #[arg(long = "executable")]
        executable: String,
        #[arg(long = "working-directory")]
        working_directory: String,
        #[arg(long = "arguments", default_value = "", allow_hyphen_values = true)]
        arguments: String,
    },

    /// Print a Run result
    ReadResult {
        #[arg(long = "file")]
        file: PathBuf,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<TetherError>()
                .map_or(EXIT_FATAL, TetherError::exit_code)
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = TetherConfig::load(cli.config.as_deref())
        .with_context(|| "Failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level.into();
    }
    if cli.log.is_some() {
        config.logging.file = cli.log.clone();
    }
    if cli.events_file.is_some() {
        config.logging.events_file = cli.events_file.clone();
    }
    config.logging.verbose |= cli.verbose;

    let logging = logging::init_logging(&config.logging)?;
    let result = match cli.command {
        Commands::Worker(args) => run_worker(config, args, &logging).await,
        Commands::Orchestrate(args) => run_orchestrate(config, args, &logging).await,
        Commands::Vm(command) => run_vm(command, &logging),
    };
    logging.shutdown();
    result
}

fn apply_session(config: &mut TetherConfig, args: &SessionArgs) {
    if let Some(ref session) = args.session {
        config.session.session_id = Some(session.clone());
    }
    if let Some(ref environment) = args.environment {
        config.session.environment = environment.clone();
    }
}

async fn run_worker(
    mut config: TetherConfig,
    args: WorkerArgs,
    logging: &LoggingHandle,
) -> anyhow::Result<()> {
    apply_session(&mut config, &args.session);
    if config.session.session_id.is_none() {
        anyhow::bail!(TetherError::Config(
            "a worker needs --session (or session.session_id) to know which build it serves"
                .to_string()
        ));
    }
    if let Some(listen) = args.listen {
        config.worker.listen = listen;
    }
    config.remoting.enabled |= args.remoting;
    config.validate()?;

    let identity = config.session.identity();
    let host = WorkerHost::start(&config, identity, logging.events()).await?;
    println!("listening on {}", host.local_addr());

    host.run_until_exit(EXIT_LINGER).await?;
    info!("Session complete");
    Ok(())
}

async fn run_orchestrate(
    mut config: TetherConfig,
    args: OrchestrateArgs,
    logging: &LoggingHandle,
) -> anyhow::Result<()> {
    apply_session(&mut config, &args.session);
    if let Some(ms) = args.connect_timeout_ms {
        config.connection.connect_timeout_ms = ms;
    }
    if let Some(ms) = args.call_timeout_ms {
        config.connection.call_timeout_ms = ms;
    }
    if let Some(attempts) = args.max_attempts {
        config.retry.max_attempts = attempts;
    }

    let orchestrator = Orchestrator::from_config(&config, logging.events())?;
    println!("session {}", orchestrator.identity().session_id);

    let mut worker_ids = Vec::new();
    for (index, address) in args.workers.iter().enumerate() {
        let endpoint: Endpoint = address
            .parse()
            .map_err(TetherError::from)
            .with_context(|| format!("Invalid worker address {}", address))?;
        let worker_id = format!("w{}", index + 1);
        orchestrator.register(&worker_id, endpoint).await?;
        worker_ids.push(worker_id);
    }

    let attached = orchestrator.attach_all().await;
    for (worker, outcome) in &attached {
        println!("{}: {}", worker, outcome);
    }

    if let Some((program, arguments)) = args.run.split_first() {
        let cwd = args.cwd.clone().unwrap_or_else(std::env::temp_dir);
        for (worker, _) in attached.iter().filter(|(_, o)| o.succeeded) {
            let process = ProcessInfo::new(format!("pip-{}", worker), program.as_str())
                .with_args(arguments.iter().cloned())
                .with_working_directory(&cwd);
            let outcome = orchestrator.execute_pip(worker, &process).await?;
            match outcome.response_as::<PipResponse>() {
                Some(Ok(response)) => {
                    print!("{}", response.result.stdout);
                    println!(
                        "{}: {} exited with {:?}",
                        worker, program, response.result.exit_code
                    );
                }
                Some(Err(e)) => warn!("Unreadable pip response from {}: {}", worker, e),
                None => println!("{}: {}", worker, outcome),
            }
        }
    }

    let exited = orchestrator.exit_all().await;
    orchestrator.shutdown().await;

    for failure in orchestrator.failures() {
        warn!(
            "Worker {} failed ({}): {}",
            failure.worker_id, failure.kind, failure.detail
        );
    }
    check_outcomes(&attached)?;
    check_outcomes(&exited)?;
    println!("{} worker(s) completed the session", worker_ids.len());
    Ok(())
}

fn run_vm(command: VmCommand, logging: &LoggingHandle) -> anyhow::Result<()> {
    let proxy = VmCommandProxy::new(logging.events());
    match command {
        VmCommand::WriteInit {
            file,
            subst_drive,
            subst_path,
        } => {
            proxy.write_initialize(
                &file,
                &InitializeVmRequest {
                    subst_drive,
                    subst_path,
                },
            )?;
        }
        VmCommand::WriteRun {
            file,
            executable,
            working_directory,
            arguments,
        } => {
            proxy.write_run(&file, &RunRequest::new(executable, working_directory, arguments))?;
        }
        VmCommand::ReadResult { file } => {
            let result = proxy.read_run_result(&file)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}
