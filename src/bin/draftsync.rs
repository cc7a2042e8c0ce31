//! Line-driven student editor
//!
//! Runs one or more editing contexts on a shared local bus, each backed by
//! its own controller, and reads commands from stdin:
//!
//! ```text
//! edit <name>;<age>;<class>   replace the student record
//! show                        print the current record
//! history                     list labelled changes
//! resync                      merge the remote copy
//! switch <n>                  make context n the active one
//! quit
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use draftsync::sync::{ResyncOutcome, SyncController, SyncHandle};
use draftsync::{ConvergentEngine, HttpRemote, LocalBus, Student, SyncConfig};

#[derive(Parser)]
#[command(name = "draftsync", version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    config: Option<PathBuf>,

    /// Document to edit, overriding the configuration
    #[arg(long)]
    doc_id: Option<String>,

    /// Number of sibling contexts sharing the local bus
    #[arg(long, default_value = "1")]
    contexts: usize,

    /// Never contact the remote relay
    #[arg(long)]
    offline: bool,
}

#[derive(Debug, PartialEq)]
enum Command {
    Edit(Student),
    Show,
    History,
    Resync,
    Switch(usize),
    Quit,
}

fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim();
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    match verb {
        "edit" => {
            let fields: Vec<&str> = rest.split(';').map(str::trim).collect();
            let [name, age, class] = fields.as_slice() else {
                bail!("usage: edit <name>;<age>;<class>");
            };
            let age = age
                .parse::<i64>()
                .with_context(|| format!("age must be a number, got '{}'", age))?;
            Ok(Command::Edit(Student::new(*name, age, *class)))
        }
        "show" => Ok(Command::Show),
        "history" => Ok(Command::History),
        "resync" => Ok(Command::Resync),
        "switch" => Ok(Command::Switch(
            rest.trim().parse().context("usage: switch <n>")?,
        )),
        "quit" | "exit" => Ok(Command::Quit),
        other => bail!("unknown command '{}'", other),
    }
}

fn describe(student: &Student) -> String {
    format!(
        "name: {}, age: {}, class: {}",
        student.student_name, student.age, student.class
    )
}

async fn start_context(
    index: usize,
    config: &SyncConfig,
    bus: &LocalBus,
    remote: Option<Arc<HttpRemote>>,
) -> Result<SyncHandle<ConvergentEngine>> {
    let mut controller = SyncController::new(config.clone(), ConvergentEngine::new())
        .with_broadcaster(Arc::new(bus.attach()))
        .with_observer(Arc::new(move |student: &Student| {
            println!("[{}] {}", index, describe(student));
        }));
    if let Some(remote) = remote {
        controller = controller.with_remote(remote);
    }
    Ok(controller.start().await?)
}

async fn execute(handle: &SyncHandle<ConvergentEngine>, command: Command) -> Result<()> {
    match command {
        Command::Edit(student) => {
            handle.edit_student(student).await?;
        }
        Command::Show => {
            println!("{}", describe(&handle.projection().await?));
        }
        Command::History => {
            let log = handle.history().await?;
            for record in log.labelled() {
                println!(
                    "{:>3}  {}  {}",
                    record.index,
                    record.time.format("%H:%M:%S"),
                    record.message.as_deref().unwrap_or_default()
                );
            }
        }
        Command::Resync => match handle.resync().await? {
            ResyncOutcome::Merged { projection, .. } => {
                println!("merged remote copy: {}", describe(&projection))
            }
            ResyncOutcome::NotFound => println!("remote has no copy yet"),
            ResyncOutcome::Unreachable(reason) => println!("remote unreachable: {}", reason),
            ResyncOutcome::Rejected(e) => println!("remote copy rejected: {}", e),
            ResyncOutcome::Disabled => println!("remote disabled"),
        },
        Command::Switch(_) | Command::Quit => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = SyncConfig::load(cli.config.as_deref())?;
    if let Some(doc_id) = cli.doc_id {
        config.doc_id = doc_id.into();
    }
    if cli.offline {
        config.remote.enabled = false;
    }

    let remote = if config.remote.enabled {
        Some(Arc::new(HttpRemote::from_config(&config.remote)?))
    } else {
        None
    };

    let bus = LocalBus::new(config.broadcast_capacity);
    let mut contexts = Vec::new();
    for index in 0..cli.contexts.max(1) {
        contexts.push(start_context(index, &config, &bus, remote.clone()).await?);
    }
    let mut active = 0;
    log::info!("editing '{}' with {} context(s)", config.doc_id, contexts.len());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };
        match command {
            Command::Quit => break,
            Command::Switch(index) if index < contexts.len() => active = index,
            Command::Switch(index) => eprintln!("no context {}", index),
            command => {
                if let Err(e) = execute(&contexts[active], command).await {
                    eprintln!("{}", e);
                }
            }
        }
    }

    for handle in &contexts {
        handle.shutdown().await?;
    }
    Ok(())
}
