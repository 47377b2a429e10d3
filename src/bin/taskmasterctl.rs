//! The interactive control REPL (spec §4.5, §6).
//!
//! This binary co-hosts a `Registry` in-process and drives it from operator
//! keystrokes; the spec's Non-goals rule out a remote RPC surface, so a
//! standalone `taskmasterctl` talks to its own daemon rather than to one
//! running elsewhere.

use std::path::PathBuf;

use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use taskmasterd::registry::Registry;
use taskmasterd::supervisor::StatusSnapshot;

#[derive(Parser, Debug)]
#[command(name = "taskmasterctl")]
struct Args {
    #[arg(short = 'c', long = "config", default_value = "/etc/taskmasterd.conf")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    env_logger::init();
    let args = Args::parse();

    let mut registry = match Registry::load(args.config).await {
        Ok(registry) => registry,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return std::process::ExitCode::from(2);
        }
    };

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("failed to start control session: {err}");
            return std::process::ExitCode::from(1);
        }
    };

    loop {
        match editor.readline("taskmaster> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                if !dispatch(&mut registry, line.trim()).await {
                    break;
                }
            }
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => break,
            Err(err) => {
                eprintln!("readline error: {err}");
                break;
            }
        }
    }

    registry.shutdown().await;
    std::process::ExitCode::from(0)
}

/// Handles one REPL line. Returns `false` to end the session.
async fn dispatch(registry: &mut Registry, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return true;
    };
    let arg = parts.next();

    match command {
        "quit" | "exit" => return false,
        "help" => print_help(),
        "list" => {
            for name in registry.program_names() {
                println!("{name}");
            }
        }
        "status" => match arg {
            None | Some("all") => print_status(&registry.status().await),
            Some(name) => match registry.status_one(name).await {
                Ok(snapshot) => print_status(&[snapshot]),
                Err(err) => println!("{err}"),
            },
        },
        "start" => run_broadcastable(registry, arg, "start", |r| Box::pin(r.start_all())).await,
        "stop" => run_broadcastable(registry, arg, "stop", |r| Box::pin(r.stop_all())).await,
        "restart" => {
            match arg {
                None => println!("restart expects a program name or 'all'"),
                Some("all") => {
                    registry.stop_all().await;
                    registry.start_all().await;
                }
                Some(name) => {
                    if let Err(err) = registry.restart(name).await {
                        println!("{err}");
                    }
                }
            }
        }
        "reload" => {
            if let Err(err) = registry.reload().await {
                println!("reload failed: {err}");
            }
        }
        other => println!("unknown command: {other} (try 'help')"),
    }

    true
}

async fn run_broadcastable<'a, F>(
    registry: &'a Registry,
    arg: Option<&str>,
    verb: &'static str,
    all: F,
) where
    F: FnOnce(&'a Registry) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + 'a>>,
{
    match arg {
        None => println!("{verb} expects a program name or 'all'"),
        Some("all") => all(registry).await,
        Some(name) => {
            let result = match verb {
                "start" => registry.start(name).await,
                "stop" => registry.stop(name).await,
                _ => unreachable!(),
            };
            if let Err(err) = result {
                println!("{err}");
            }
        }
    }
}

fn print_status(snapshots: &[StatusSnapshot]) {
    for s in snapshots {
        println!(
            "{:<16} {:<10} failed_starts={} since_transition={}s",
            s.name,
            format!("{:?}", s.state),
            s.failed_starts,
            s.since_last_transition.as_secs()
        );
        for i in &s.instances {
            println!(
                "  [{}] pid={} uptime={}s",
                i.index,
                i.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                i.uptime.as_secs()
            );
        }
    }
}

fn print_help() {
    println!("commands: status [NAME|all], start NAME|all, stop NAME|all, restart NAME|all,");
    println!("          reload, list, help, quit/exit");
}
