//! `drover` — queue administration and daemons for the drover harness.

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use drover_driver::agent::Agent;
use drover_driver::context::DriverContext;
use drover_driver::driver_api::{Driver, DriverRegistry, OperationError};
use drover_driver::rpc::{self, RemoteMaster};
use drover_error::Result;
use drover_harness::{LocalRunExecutor, QueueStore, RunQueue, DEFAULT_STARTUP_SLACK_MS};
use drover_types::{BenchmarkDesc, RunId};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// File name under which every benchmark's parameter repository is
/// stored in its run directory.
const PARAMS_FILE: &str = "run.params.json";

#[derive(Parser)]
#[command(name = "drover", about = "Distributed load-generation harness", version)]
struct Cli {
    /// Harness root directory (queue, sequence file, run output).
    #[arg(long, default_value = "./drover-home", global = true)]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue a benchmark run.
    Submit {
        /// Benchmark short name.
        bench: String,
        /// Parameter repository to snapshot into the run directory.
        params: PathBuf,
        /// Submitting user recorded with the run.
        #[arg(long, default_value = "anonymous")]
        user: String,
    },
    /// List pending runs in pick order.
    List,
    /// Remove a not-yet-started run from the queue.
    Delete {
        /// Run id, `<bench>.<num><letter>`.
        run_id: String,
    },
    /// Show queue and daemon status.
    Status,
    /// Abort the currently executing run.
    Kill {
        /// Run id the kill is intended for.
        run_id: String,
    },
    /// Run the queue daemon in the foreground, executing runs with
    /// in-process agents.
    Daemon {
        /// Benchmarks this daemon accepts.
        #[arg(long = "bench", default_value = "sleeper")]
        benches: Vec<String>,
        /// Agents per run.
        #[arg(long, default_value_t = 1)]
        agents: usize,
    },
    /// Host an agent service for a remote master.
    Agentd {
        /// Master wire address, `host:port`.
        #[arg(long)]
        master: String,
        /// Listen address for master calls.
        #[arg(long, default_value = "0.0.0.0:9981")]
        listen: String,
        /// Agent label used in worker names.
        #[arg(long, default_value = "0")]
        label: String,
    },
}

/// Built-in demonstration driver: each operation sleeps briefly around
/// an explicitly timed critical section.
struct SleeperDriver;

impl Driver for SleeperDriver {
    fn operate(&mut self, op: usize, cx: &mut DriverContext) -> std::result::Result<(), OperationError> {
        cx.record_time();
        std::thread::sleep(Duration::from_millis(2 + op as u64));
        cx.record_time();
        Ok(())
    }
}

fn builtin_registry() -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    registry.register("sleeper", || Box::new(SleeperDriver));
    registry
}

fn bench_desc(name: &str) -> BenchmarkDesc {
    BenchmarkDesc {
        short_name: name.to_owned(),
        config_file_name: PARAMS_FILE.to_owned(),
        description: String::new(),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    if let Err(error) = run(cli) {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let store = Arc::new(QueueStore::open(&cli.dir)?);
    match cli.command {
        Command::Submit {
            bench,
            params,
            user,
        } => {
            let queue = RunQueue::new(store);
            queue.register_benchmark(bench_desc(&bench));
            let run_id = queue.add(&user, &bench, &params)?;
            println!("{run_id}");
        }
        Command::List => {
            let queue = RunQueue::new(store);
            for entry in queue.list()? {
                println!("{}\t{}\t{}", entry.run_id, entry.bench, entry.description);
            }
        }
        Command::Delete { run_id } => {
            let run_id: RunId = run_id.parse()?;
            let queue = RunQueue::new(store);
            if queue.delete(&run_id)? {
                println!("deleted {run_id}");
            } else {
                println!("{run_id} is not in the queue");
            }
        }
        Command::Status => {
            let queue = RunQueue::new(store);
            let pending = queue.list()?;
            println!("{}", queue.daemon_status());
            println!("{} run(s) pending", pending.len());
            for entry in pending {
                println!("  {}", entry.run_id);
            }
        }
        Command::Kill { run_id } => {
            let run_id: RunId = run_id.parse()?;
            let queue = RunQueue::new(store);
            let killed = queue.kill_current_run(&run_id)?;
            println!("killed {killed}");
        }
        Command::Daemon { benches, agents } => {
            let executor = Arc::new(LocalRunExecutor::new(
                builtin_registry(),
                agents,
                DEFAULT_STARTUP_SLACK_MS,
            ));
            let queue = RunQueue::with_daemon(store, executor)?;
            for bench in &benches {
                queue.register_benchmark(bench_desc(bench));
            }
            info!(benches = ?benches, agents, "daemon running; ctrl-c to stop");
            loop {
                std::thread::sleep(Duration::from_secs(60));
            }
        }
        Command::Agentd {
            master,
            listen,
            label,
        } => {
            let master = Arc::new(RemoteMaster::new(master));
            let agent = Agent::new(label, master, builtin_registry())?;
            let listener = TcpListener::bind(&listen)?;
            let server = rpc::serve_agent(listener, agent)?;
            info!(addr = server.addr(), "agent service running; ctrl-c to stop");
            loop {
                std::thread::sleep(Duration::from_secs(60));
            }
        }
    }
    Ok(())
}
