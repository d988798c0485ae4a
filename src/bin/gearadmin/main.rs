mod args;

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, Level};

use crate::args::{Args, Command};
use gearman_rs::{AdminClient, ServerSpec};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "admin command failed");
            ExitCode::FAILURE
        },
    }
}

async fn run(args: Args) -> Result<()> {
    let spec = ServerSpec::new(args.host.as_str()).port(args.port);
    let mut admin = AdminClient::new(spec)?
        .with_poll_timeout(Duration::from_secs_f64(args.timeout));

    match args.command {
        Command::Status => {
            let entries = admin.get_status().await?;
            if args.yaml {
                print!("{}", serde_yaml::to_string(&entries)?);
            } else {
                for entry in entries {
                    println!(
                        "{}\t{}\t{}\t{}",
                        entry.task, entry.queued, entry.running, entry.workers
                    );
                }
            }
        },
        Command::Workers => {
            let entries = admin.get_workers().await?;
            if args.yaml {
                print!("{}", serde_yaml::to_string(&entries)?);
            } else {
                for entry in entries {
                    println!(
                        "{} {} {} : {}",
                        entry.file_descriptor,
                        entry.ip,
                        entry.client_id,
                        entry.tasks.join(" ")
                    );
                }
            }
        },
        Command::Version => println!("{}", admin.get_version().await?),
        Command::Ping => {
            let elapsed = admin.ping_server().await?;
            println!("OK {:.3} ms", elapsed.as_secs_f64() * 1e3);
        },
        Command::Maxqueue { task, size } => {
            admin.send_maxqueue(&task, size).await?;
        },
        Command::Shutdown { graceful } => {
            admin.send_shutdown(graceful).await?;
        },
        Command::Getpid => admin.get_pid().await?,
        Command::Cancel { job_handle } => {
            admin.cancel_job(&job_handle).await?;
        },
        Command::ShowJobs => {
            let entries = admin.get_jobs().await?;
            if args.yaml {
                print!("{}", serde_yaml::to_string(&entries)?);
            } else {
                for entry in entries {
                    println!(
                        "{}\t{}\t{}\t{}",
                        entry.handle,
                        entry.queued,
                        entry.canceled,
                        entry.enabled
                    );
                }
            }
        },
        Command::ShowUniqueJobs => {
            for unique in admin.get_unique_jobs().await? {
                println!("{unique}");
            }
        },
    }

    Ok(())
}
