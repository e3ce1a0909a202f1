use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use shm_map::{Mode, Options, Session, Value};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Inspect and edit a shared memory-mapped map")]
struct AdminCommand {
    #[arg(help = "The arena file")]
    file: PathBuf,

    /// How to open the file: `rw`, `ro` or `wo`.
    #[arg(long, default_value = "rw")]
    mode: Mode,

    /// Size of the file if it has to be created, in KiB.
    #[arg(long)]
    initial_size_kb: Option<u64>,

    /// The file never grows beyond this, in KiB.
    #[arg(long)]
    max_size_kb: Option<u64>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Print the size of the file and statistics of its table.
    Stat,
    /// Print every key, one per line.
    Keys,
    /// Print the value of a key.
    Get { key: String },
    /// Set a key to a string, or a number with `--number`.
    Set {
        key: String,
        value: String,
        #[arg(long)]
        number: bool,
    },
    /// Remove a key.
    Delete { key: String },
    /// Reset all lock state of the file, for recovery after a crash.
    RemoveLock,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let command = AdminCommand::parse();
    match run(command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: AdminCommand) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let AdminCommand {
        file,
        mode,
        initial_size_kb,
        max_size_kb,
        action,
    } = command;

    if let Action::RemoveLock = action {
        shm_map::remove_lock_block(&file)?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut options = Options::new();
    if let Some(kb) = initial_size_kb {
        options = options.initial_size_kb(kb);
    }
    if let Some(kb) = max_size_kb {
        options = options.max_size_kb(kb);
    }

    let mut session = Session::open(&file, mode, options)?;
    let code = match action {
        Action::Stat => {
            println!("size: {}", session.size()?);
            println!("free: {}", session.free_memory()?);
            println!("keys: {}", session.len()?);
            println!("buckets: {}", session.bucket_count()?);
            println!("max buckets: {}", session.max_bucket_count()?);
            println!("load factor: {:.3}", session.load_factor()?);
            println!("max load factor: {:.3}", session.max_load_factor()?);
            ExitCode::SUCCESS
        }
        Action::Keys => {
            for key in session.keys()? {
                println!("{key}");
            }
            ExitCode::SUCCESS
        }
        Action::Get { key } => session.get_with(&key, |cell| match cell {
            Some(value) => {
                println!("{value}");
                ExitCode::SUCCESS
            }
            None => {
                eprintln!("{key}: not found");
                ExitCode::FAILURE
            }
        })?,
        Action::Set { key, value, number } => {
            let value = if number {
                Value::Number(value.parse()?)
            } else {
                Value::String(value)
            };

            session.set(&key, value)?;
            ExitCode::SUCCESS
        }
        Action::Delete { key } => {
            session.delete(&key)?;
            ExitCode::SUCCESS
        }
        Action::RemoveLock => unreachable!("handled before opening"),
    };

    session.close()?;
    Ok(code)
}
