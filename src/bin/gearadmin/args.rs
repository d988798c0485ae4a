use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Gearman server host.
    #[arg(short = 'H', long, default_value = "localhost")]
    pub host: String,
    /// Gearman server port.
    #[arg(short, long, default_value_t = 4730)]
    pub port: u16,
    /// Seconds to wait for each reply.
    #[arg(short, long, default_value_t = 5.0)]
    pub timeout: f64,
    /// Print replies as YAML instead of tab-separated lines.
    #[arg(short, long, default_value_t)]
    pub yaml: bool,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub debug: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Per-function queue and worker counts.
    Status,
    /// Connected workers and their registered functions.
    Workers,
    /// Server version string.
    Version,
    /// Round-trip an echo and print the latency.
    Ping,
    /// Cap a function's queue length.
    Maxqueue { task: String, size: u32 },
    /// Ask the server to shut down.
    Shutdown {
        /// Let outstanding jobs finish first.
        #[arg(long, default_value_t)]
        graceful: bool,
    },
    /// Ask for the server's pid (fire and forget).
    Getpid,
    /// Cancel a queued job by handle.
    Cancel { job_handle: String },
    /// List the jobs the server holds.
    ShowJobs,
    /// List the unique keys of held jobs.
    ShowUniqueJobs,
}
