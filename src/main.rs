use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use scanflow::api::{ErrorResponse, SubmitScanBody, SubmitScanResponse};
use scanflow::config::EngineConfig;
use scanflow::engine::Engine;
use scanflow::scheduler::job::{FailurePolicy, JobStatus, JobSummary, Priority};
use scanflow::shutdown::install_shutdown_handler;
use scanflow::worker::SimulatedConnector;

#[derive(Parser, Debug)]
#[command(name = "scanflow")]
#[command(version)]
#[command(about = "Scan orchestration and execution engine")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a scanflow engine node
    Server(ServerArgs),

    /// Scan job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Coordinator replica id
    #[arg(long, default_value = "1")]
    replica_id: u64,

    /// HTTP listen address for the scan API
    #[arg(long, default_value = "127.0.0.1:7070")]
    listen: SocketAddr,

    /// Workers spawned at startup
    #[arg(long, default_value = "2")]
    workers: u32,

    /// Execution slots per worker
    #[arg(long, default_value = "4")]
    slots: u32,

    /// Task lease TTL in milliseconds
    #[arg(long, default_value = "5000")]
    lease_ttl_ms: u64,

    /// Worker heartbeat interval in milliseconds
    #[arg(long, default_value = "500")]
    heartbeat_ms: u64,

    /// Maximum execution attempts per task
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Minimum worker count the auto-scaler may reach
    #[arg(long, default_value = "1")]
    min_workers: u32,

    /// Maximum worker count the auto-scaler may reach
    #[arg(long, default_value = "8")]
    max_workers: u32,

    /// Simulated connector throughput in bytes per millisecond
    #[arg(long, default_value = "10485760")]
    connector_throughput: u64,
}

// =============================================================================
// Client Arguments (shared by job subcommands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:7070")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a new scan job
    Submit {
        /// Source to scan (e.g. "s3://bucket/dataset")
        source: String,

        /// Scannable size of the source in bytes
        #[arg(long)]
        bytes: Option<u64>,

        /// Priority: low, normal, high, urgent
        #[arg(long, default_value = "normal")]
        priority: String,

        /// Job deadline in seconds from now
        #[arg(long)]
        deadline_secs: Option<i64>,

        /// Let independent branches finish after one fails
        #[arg(long)]
        best_effort: bool,

        /// Add a merge task fanning in from all scan partitions
        #[arg(long)]
        merge: bool,
    },
    /// Get status of a scan job
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// Cancel a scan job
    Cancel {
        /// The job ID (UUID)
        job_id: String,
    },
    /// List scan jobs
    List,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Server(server) => run_server(server).await,
        Commands::Job { client, command } => run_job_command(client, command).await,
    }
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = EngineConfig::new(args.replica_id, args.listen)
        .with_workers(args.workers, args.slots)
        .with_lease_ttl_ms(args.lease_ttl_ms)
        .with_max_attempts(args.max_attempts);
    config.health.heartbeat_interval_ms = args.heartbeat_ms;
    config.scaling.min_workers = args.min_workers;
    config.scaling.max_workers = args.max_workers;

    let connector = Arc::new(SimulatedConnector {
        bytes_per_ms: args.connector_throughput.max(1),
    });
    let engine = Engine::start(config, connector).await?;

    let shutdown = install_shutdown_handler();
    let engine_shutdown = engine.shutdown_token();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        engine_shutdown.cancel();
    });

    engine.serve().await?;
    Ok(())
}

// =============================================================================
// HTTP client for job subcommands
// =============================================================================

async fn fail_from_response(response: reqwest::Response) -> Box<dyn std::error::Error> {
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(body) => format!("{status}: {}", body.error).into(),
        Err(_) => format!("request failed with status {status}").into(),
    }
}

async fn run_job_command(
    client_args: ClientArgs,
    command: JobCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();
    let base = client_args.addr.trim_end_matches('/');

    match command {
        JobCommands::Submit {
            source,
            bytes,
            priority,
            deadline_secs,
            best_effort,
            merge,
        } => {
            let priority: Priority = priority.parse()?;
            let body = SubmitScanBody {
                source,
                source_bytes: bytes,
                rule_set_ref: None,
                priority: Some(priority),
                deadline_secs,
                failure_policy: best_effort.then_some(FailurePolicy::BestEffort),
                max_concurrency: None,
                merge_results: Some(merge),
            };
            let response = client
                .post(format!("{base}/scans"))
                .json(&body)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(fail_from_response(response).await);
            }
            let submitted: SubmitScanResponse = response.json().await?;
            match client_args.output {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&submitted)?)
                }
                OutputFormat::Table => println!("Submitted job {}", submitted.job_id),
            }
        }
        JobCommands::Status { job_id } => {
            let job_id: Uuid = job_id.parse()?;
            let response = client.get(format!("{base}/scans/{job_id}")).send().await?;
            if !response.status().is_success() {
                return Err(fail_from_response(response).await);
            }
            let status: JobStatus = response.json().await?;
            match client_args.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
                OutputFormat::Table => print_status(&status),
            }
        }
        JobCommands::Cancel { job_id } => {
            let job_id: Uuid = job_id.parse()?;
            let response = client
                .delete(format!("{base}/scans/{job_id}"))
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(fail_from_response(response).await);
            }
            println!("Cancellation initiated for job {job_id}");
        }
        JobCommands::List => {
            let response = client.get(format!("{base}/scans")).send().await?;
            if !response.status().is_success() {
                return Err(fail_from_response(response).await);
            }
            let jobs: Vec<JobSummary> = response.json().await?;
            match client_args.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
                OutputFormat::Table => print_job_table(&jobs),
            }
        }
    }
    Ok(())
}

fn print_status(status: &JobStatus) {
    println!("Job:       {}", status.job_id);
    println!("Source:    {}", status.source);
    println!("State:     {}", status.state);
    println!("Priority:  {}", status.priority);
    println!("Submitted: {}", status.submitted_at);
    if let Some(completed) = status.completed_at {
        println!("Completed: {completed}");
    }
    println!("Tasks:");
    for task in &status.task_summaries {
        let note = if task.blocked {
            " (blocked)".to_string()
        } else if let Some(error) = &task.error {
            format!(" error={error}")
        } else {
            String::new()
        };
        println!(
            "  {}  {:<9} attempts={}{}",
            task.id, task.state, task.attempts, note
        );
    }
    if !status.fault_records.is_empty() {
        println!("Faults:");
        for fault in &status.fault_records {
            println!(
                "  {} {} attempt={} {:?}",
                fault.recorded_at, fault.kind, fault.attempt, fault.recovery
            );
        }
    }
}

fn print_job_table(jobs: &[JobSummary]) {
    if jobs.is_empty() {
        println!("No scan jobs");
        return;
    }
    println!(
        "{:<38} {:<10} {:<8} {:>5}/{:<5} SOURCE",
        "JOB", "STATE", "PRIORITY", "OK", "TOTAL"
    );
    for job in jobs {
        println!(
            "{:<38} {:<10} {:<8} {:>5}/{:<5} {}",
            job.job_id, job.state, job.priority, job.tasks_succeeded, job.tasks_total, job.source
        );
    }
}
