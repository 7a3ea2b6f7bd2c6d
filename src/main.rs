use serde::Serialize;
use session_sentinel::{
    ActivityEmitter, ActivityEvent, Config, LockoutStatus, SessionCoordinator, SessionError, init_tracing, open_coordinator,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Login { identity: String, remember: bool },
    Fail { identity: String },
    Activity,
    Extend,
    Logout,
    Status,
    Clear { identity: String },
    Quit,
}

impl Command {
    fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err("empty command".to_string());
        };
        let args: Vec<&str> = words.collect();

        let identity = |args: &[&str]| -> Result<String, String> {
            args.first()
                .filter(|identity| !identity.starts_with("--"))
                .map(|identity| identity.to_string())
                .ok_or_else(|| format!("{verb} requires an identity"))
        };

        match verb {
            "login" => Ok(Command::Login {
                identity: identity(&args)?,
                remember: args.iter().skip(1).any(|arg| *arg == "--remember"),
            }),
            "fail" => Ok(Command::Fail { identity: identity(&args)? }),
            "clear" => Ok(Command::Clear { identity: identity(&args)? }),
            "activity" => Ok(Command::Activity),
            "extend" => Ok(Command::Extend),
            "logout" => Ok(Command::Logout),
            "status" => Ok(Command::Status),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(format!("unknown command: {other}")),
        }
    }
}

fn print_usage() {
    eprintln!("Commands:");
    eprintln!("  login <identity> [--remember]");
    eprintln!("  fail <identity>");
    eprintln!("  activity | extend | logout | status");
    eprintln!("  clear <identity>");
    eprintln!("  quit");
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(err) => eprintln!("Failed to render output: {err}"),
    }
}

async fn run(coordinator: &SessionCoordinator, command: Command) -> Result<(), SessionError> {
    match command {
        Command::Login { identity, remember } => match coordinator.lockout_status(&identity).await {
            locked @ LockoutStatus::Locked { .. } => print_json(&locked),
            LockoutStatus::Allowed { .. } => {
                let session = coordinator.start_session(&identity, remember).await?;
                print_json(&session);
            }
        },
        Command::Fail { identity } => {
            coordinator.record_attempt(&identity, false).await;
            print_json(&coordinator.lockout_status(&identity).await);
        }
        Command::Clear { identity } => {
            coordinator.clear_attempts(&identity).await;
            print_json(&coordinator.lockout_status(&identity).await);
        }
        Command::Activity => {
            coordinator.update_activity().await;
        }
        Command::Extend => {
            coordinator.extend_session().await;
            print_json(&coordinator.snapshot().await);
        }
        Command::Logout => {
            coordinator.end_session().await;
            print_json(&coordinator.snapshot().await);
        }
        Command::Status => print_json(&coordinator.snapshot().await),
        Command::Quit => {}
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    init_tracing(&config.logging.level, config.logging.json_format);

    let coordinator = match open_coordinator(&config).await {
        Ok(coordinator) => coordinator,
        Err(err) => {
            eprintln!("Failed to open session store: {err}");
            std::process::exit(1);
        }
    };

    let emitter = Arc::new(ActivityEmitter::new());
    coordinator.attach_activity_source(emitter.clone()).await;

    let mut events = coordinator.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_json(&event),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event printer fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                eprintln!("Failed to read stdin: {err}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        emitter.emit(ActivityEvent::KeyPress);

        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                eprintln!("{err}");
                print_usage();
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }

        if let Err(err) = run(&coordinator, command).await {
            eprintln!("{err}");
        }
    }

    coordinator.detach_activity_source().await;
}
