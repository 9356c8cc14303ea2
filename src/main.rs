use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use schedarray::config::{self, Config};
use schedarray::error::{Result, SchedError};
use schedarray::scheduler::{Job, JobSpec, JobState, Scheduler};
use schedarray::service::Service;

#[derive(Parser, Debug)]
#[command(name = "schedarray")]
#[command(about = "Single-host job scheduler with a persistent queue and worker pool")]
struct Cli {
    /// Path to the scheduler database (default: $SCHEDARRAY_DB or ~/.schedarray/db)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a job to the queue
    Submit(SubmitArgs),
    /// Show the full record of one job
    Status {
        job_id: String,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// List jobs, newest first
    List(ListArgs),
    /// Cancel a pending or running job
    Cancel { job_id: String },
    /// Delete a finished job
    Delete { job_id: String },
    /// Bulk-delete finished jobs
    Cleanup(CleanupArgs),
    /// Show job counts by state
    Counts {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Manage the scheduler service
    Service {
        #[command(subcommand)]
        command: ServiceCommand,
    },
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// Command line to execute
    #[arg(short, long, conflicts_with = "script")]
    command: Option<String>,
    /// Script file whose contents become the command
    #[arg(short, long)]
    script: Option<PathBuf>,
    /// Job name
    #[arg(short = 'J', long)]
    job_name: Option<String>,
    /// Working directory (default: current directory)
    #[arg(short = 'd', long)]
    working_dir: Option<String>,
    /// CPUs requested (advisory)
    #[arg(short = 'n', long, default_value_t = 1)]
    cpus: u32,
    /// Memory requested, e.g. 4G (advisory)
    #[arg(short, long)]
    memory: Option<String>,
    /// Wall-clock timeout in seconds
    #[arg(short, long)]
    timeout: Option<i64>,
    /// Priority; higher dequeues first
    #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
    priority: i64,
    /// Stdout file
    #[arg(short, long)]
    output: Option<String>,
    /// Stderr file
    #[arg(short = 'e', long)]
    error: Option<String>,
    /// Output in JSON format
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ListArgs {
    /// Filter by state (pending, running, completed, failed, cancelled, timeout)
    #[arg(long)]
    state: Option<String>,
    /// Filter by user
    #[arg(long)]
    user: Option<String>,
    /// Maximum number of jobs to show
    #[arg(long)]
    limit: Option<usize>,
    /// Output in JSON format
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct CleanupArgs {
    /// Delete completed jobs
    #[arg(long)]
    completed: bool,
    /// Delete failed jobs
    #[arg(long)]
    failed: bool,
    /// Delete cancelled jobs
    #[arg(long)]
    cancelled: bool,
    /// Delete timed-out jobs
    #[arg(long)]
    timeout: bool,
    /// Only delete jobs that ended more than N days ago
    #[arg(long, value_name = "N")]
    older_than_days: Option<i64>,
    /// Output in JSON format
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum ServiceCommand {
    /// Run the scheduler service in the foreground
    Start {
        /// Number of workers (default: CPU count)
        #[arg(long)]
        max_workers: Option<usize>,
        /// Polling interval in seconds
        #[arg(long)]
        poll_interval: Option<f64>,
    },
    /// Stop a running service
    Stop,
    /// Show service status
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::new(config::resolve_db_path(cli.db_path));
    match cli.command {
        Commands::Submit(args) => submit(&config, args),
        Commands::Status { job_id, json } => status(&config, &job_id, json),
        Commands::List(args) => list(&config, args),
        Commands::Cancel { job_id } => cancel(&config, &job_id),
        Commands::Delete { job_id } => delete(&config, &job_id),
        Commands::Cleanup(args) => cleanup(&config, args),
        Commands::Counts { json } => counts(&config, json),
        Commands::Service { command } => service(config, command).await,
    }
}

fn submit(config: &Config, args: SubmitArgs) -> Result<ExitCode> {
    let command = match (args.command, &args.script) {
        (Some(command), _) => command,
        (None, Some(script)) => std::fs::read_to_string(script)?,
        (None, None) => {
            return Err(SchedError::InvalidArgument(
                "either --command or --script is required".to_string(),
            ))
        }
    };

    let spec = JobSpec {
        job_name: args.job_name,
        working_dir: args.working_dir,
        cpus: args.cpus,
        memory: args.memory,
        timeout_seconds: args.timeout,
        priority: args.priority,
        stdout_path: args.output,
        stderr_path: args.error,
        ..JobSpec::new(command)
    };

    let mut scheduler = Scheduler::open(&config.db_path)?;
    let job_id = scheduler.submit_job(spec)?;

    if args.json {
        println!("{}", serde_json::json!({ "job_id": job_id }));
    } else {
        println!("Submitted job {job_id}");
    }
    Ok(ExitCode::SUCCESS)
}

fn status(config: &Config, job_id: &str, json: bool) -> Result<ExitCode> {
    let scheduler = Scheduler::open(&config.db_path)?;
    let Some(job) = scheduler.get_job_status(job_id)? else {
        eprintln!("error: job {job_id} not found");
        return Ok(ExitCode::FAILURE);
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        print_job(&job);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_job(job: &Job) {
    println!("Job ID: {}", job.job_id);
    if let Some(name) = &job.job_name {
        println!("Name: {name}");
    }
    println!("State: {}", job.state);
    println!("Command: {}", job.command);
    if let Some(dir) = &job.working_dir {
        println!("Working directory: {dir}");
    }
    println!("Priority: {}", job.priority);
    println!("User: {}", job.user);
    println!("Submitted: {}", job.submit_time.format("%Y-%m-%d %H:%M:%S"));
    if let Some(ts) = job.start_time {
        println!("Started: {}", ts.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(ts) = job.end_time {
        println!("Finished: {}", ts.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(code) = job.return_code {
        println!("Return code: {code}");
    }
    if let Some(path) = &job.stdout_path {
        println!("Stdout: {path}");
    }
    if let Some(path) = &job.stderr_path {
        println!("Stderr: {path}");
    }
    if let Some(message) = &job.error_message {
        println!("Error: {message}");
    }
}

fn list(config: &Config, args: ListArgs) -> Result<ExitCode> {
    let state = args
        .state
        .as_deref()
        .map(|raw| raw.parse::<JobState>())
        .transpose()?;
    let scheduler = Scheduler::open(&config.db_path)?;
    let jobs = scheduler.list_jobs(state, args.user.as_deref(), args.limit)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(ExitCode::SUCCESS);
    }
    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{:<14} {:<20} {:<10} {:>8}  {:<19}",
        "JOB ID", "NAME", "STATE", "PRIORITY", "SUBMITTED"
    );
    for job in &jobs {
        let name = job.job_name.as_deref().unwrap_or("-");
        println!(
            "{:<14} {:<20} {:<10} {:>8}  {:<19}",
            job.job_id,
            truncate(name, 20),
            job.state,
            job.priority,
            job.submit_time.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let head: String = text.chars().take(max.saturating_sub(2)).collect();
        format!("{head}..")
    }
}

fn cancel(config: &Config, job_id: &str) -> Result<ExitCode> {
    let mut scheduler = Scheduler::open(&config.db_path)?;
    if scheduler.cancel_job(job_id)? {
        println!("Cancelled job {job_id}");
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("error: job {job_id} cannot be cancelled");
        Ok(ExitCode::FAILURE)
    }
}

fn delete(config: &Config, job_id: &str) -> Result<ExitCode> {
    let mut scheduler = Scheduler::open(&config.db_path)?;
    if scheduler.delete_job(job_id)? {
        println!("Deleted job {job_id}");
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("error: job {job_id} not found");
        Ok(ExitCode::FAILURE)
    }
}

fn cleanup(config: &Config, args: CleanupArgs) -> Result<ExitCode> {
    let mut states = Vec::new();
    if args.completed {
        states.push(JobState::Completed);
    }
    if args.failed {
        states.push(JobState::Failed);
    }
    if args.cancelled {
        states.push(JobState::Cancelled);
    }
    if args.timeout {
        states.push(JobState::Timeout);
    }
    if states.is_empty() {
        states = vec![JobState::Completed, JobState::Failed, JobState::Cancelled];
    }

    let mut scheduler = Scheduler::open(&config.db_path)?;
    let removed = scheduler.cleanup(&states, args.older_than_days)?;

    if args.json {
        println!("{}", serde_json::json!({ "deleted": removed }));
    } else {
        println!("Deleted {removed} job(s)");
    }
    Ok(ExitCode::SUCCESS)
}

fn counts(config: &Config, json: bool) -> Result<ExitCode> {
    let scheduler = Scheduler::open(&config.db_path)?;
    let counts = scheduler.count_by_state()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
    } else {
        println!("Job counts by state:");
        for (state, count) in &counts {
            println!("  {state}: {count}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn service(mut config: Config, command: ServiceCommand) -> Result<ExitCode> {
    match command {
        ServiceCommand::Start {
            max_workers,
            poll_interval,
        } => {
            if let Some(workers) = max_workers {
                config.max_workers = workers.max(1);
            }
            if let Some(secs) = poll_interval {
                config.poll_interval = Duration::from_secs_f64(secs.max(0.05));
            }
            Service::new(config).run().await?;
            Ok(ExitCode::SUCCESS)
        }
        ServiceCommand::Stop => {
            if Service::signal_stop(&config)? {
                println!("Stop signal sent");
            } else {
                println!("Service is not running");
            }
            Ok(ExitCode::SUCCESS)
        }
        ServiceCommand::Status { json } => {
            let status = Service::probe(&config)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("Service running: {}", status.running);
                if let Some(pid) = status.pid {
                    println!("Pid: {pid}");
                }
                println!("Jobs by state:");
                for (state, count) in &status.jobs {
                    println!("  {state}: {count}");
                }
            }
            Ok(if status.running {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
