//! PoolWarden Agent - reconciliation client for the kernel
//!
//! - `watch`  : polls `/status`, reads commands from stdin, one request at a time
//! - `status` : single poll, prints every visible VM with its allowed actions
//! - `act`    : one action; two-phase actions prepare, then confirm when `--target` is given

mod client;
mod config;
mod reconcile;
mod scheduler;
mod snapshot;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::client::{HttpKernel, KernelApi};
use crate::config::AgentConfig;
use crate::reconcile::{EffectiveState, Reconciler, VmView};
use crate::scheduler::{Command, Event, Scheduler};
use crate::snapshot::{split_fullname, Action, Prepared};

#[derive(Parser, Debug)]
#[command(name = "poolwarden-agent", version)]
struct Cli {
    /// Config file (defaults to the OS config directory)
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, env = "POOLWARDEN_KERNEL_URL")]
    kernel_url: Option<String>,
    #[arg(long, env = "POOLWARDEN_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    #[arg(long, env = "POOLWARDEN_PRINCIPAL")]
    principal: Option<String>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    Watch {
        /// Seconds between polls
        #[arg(long)]
        interval: Option<u64>,
    },
    Status,
    Act {
        action: Action,
        /// pool:vm
        vm: String,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        recovery: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("poolwarden_agent=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = AgentConfig::load(cli.config.as_deref()).await.context("Failed to load config")?;
    if let Some(url) = cli.kernel_url {
        cfg.kernel_url = url;
    }
    if let Some(key) = cli.api_key {
        cfg.api_key = key;
    }
    if let Some(p) = cli.principal {
        cfg.principal = p;
    }
    if cfg.principal.is_empty() {
        bail!("no principal configured (--principal or POOLWARDEN_PRINCIPAL)");
    }

    let kernel = Arc::new(HttpKernel::new(&cfg)?);
    match cli.cmd {
        Cmd::Watch { interval } => watch(kernel, interval.unwrap_or(cfg.poll_interval_secs)).await,
        Cmd::Status => status(kernel.as_ref()).await,
        Cmd::Act { action, vm, target, recovery } => act(kernel.as_ref(), action, &vm, target.as_deref(), recovery).await,
    }
}

async fn watch(kernel: Arc<HttpKernel>, interval_secs: u64) -> Result<()> {
    info!(interval_secs, "[agent] watching kernel");
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(Scheduler::new(kernel, Duration::from_secs(interval_secs.max(1)), cmd_rx, ev_tx).run());

    tokio::spawn(async move {
        while let Some(event) = ev_rx.recv().await {
            print_event(&event);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match Command::parse(&line) {
            Ok(cmd) => {
                let quit = cmd == Command::Quit;
                if cmd_tx.send(cmd).await.is_err() || quit {
                    break;
                }
            }
            Err(e) => eprintln!("{e}"),
        }
    }
    drop(cmd_tx);
    if let Ok(sched) = task.await {
        info!(vms = sched.view().resources().count(), "[agent] stopped");
    }
    Ok(())
}

fn print_event(event: &Event) {
    match event {
        Event::Polled { vms } => {
            println!("refreshed: {} vm(s)", vms.len());
            for vm in vms {
                print_view(vm);
            }
        }
        Event::Submitted { vm } => print_view(vm),
        Event::PollFailed => println!("refresh failed, retrying on next tick"),
        Event::Prepared { fullname, action, prepared } => print_prepared(fullname, *action, prepared),
        Event::Done { fullname, action, ok } => println!("{action} {fullname}: {}", if *ok { "ok" } else { "failed" }),
        Event::Rejected { fullname, reason } => println!("{fullname}: {reason}"),
    }
}

fn print_view(vm: &VmView) {
    let state = match vm.state {
        EffectiveState::Running => "running",
        EffectiveState::Halted => "halted",
        EffectiveState::Suspended => "suspended",
        EffectiveState::Busy => "busy",
        EffectiveState::Other => "-",
    };
    println!("  {:<24} {:<10} [{}]", vm.fullname, state, action_list(&vm.allowed, vm.primary));
}

/// The primary action is marked with `*`.
fn action_list(allowed: &[Action], primary: Option<Action>) -> String {
    allowed
        .iter()
        .map(|a| if Some(*a) == primary { format!("*{a}") } else { a.to_string() })
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_prepared(fullname: &str, action: Action, prepared: &Prepared) {
    match prepared {
        Prepared::Ready { label, home, candidates, recovery_allowed, .. } => {
            println!("{action} {label} ({fullname}): choose a host");
            if let Some(home) = home {
                println!("  home host: {home}");
            }
            for c in candidates {
                println!("  {}{}", c.name, if c.home { " (home)" } else { "" });
            }
            if *recovery_allowed {
                println!("  recovery boot allowed");
            }
        }
        Prepared::NoTargets { label } => println!("{action} {label}: no eligible host"),
        Prepared::Unavailable => println!("{action} {fullname}: unavailable"),
    }
}

async fn status(kernel: &dyn KernelApi) -> Result<()> {
    let snap = kernel.status().await?;
    let at = DateTime::<Utc>::from_timestamp(snap.timestamp, 0).unwrap_or_default();
    println!("status at {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    for pool in &snap.pools {
        println!("[{}]", pool.name);
        for h in &pool.hosts {
            println!("  host {:<24} {:<8} {:<8} {}", h.fullname, h.role, h.state, h.memfree);
        }
    }

    let mut view = Reconciler::new();
    view.merge(snap);
    for res in view.resources() {
        let name = &res.status.fullname;
        let allowed = action_list(&view.allowed_actions(name), view.primary_action(name));
        println!(
            "  vm   {:<24} {:<16} {:<10} {:<10} {:<8} {:<14} [{}]",
            res.status.fullname,
            res.status.label,
            res.status.state.as_deref().unwrap_or("-"),
            res.status.platform,
            res.status.memtotal,
            res.status.uptime,
            allowed
        );
    }
    Ok(())
}

async fn act(kernel: &dyn KernelApi, action: Action, fullname: &str, target: Option<&str>, recovery: bool) -> Result<()> {
    let Some((pool, vm)) = split_fullname(fullname) else {
        bail!("expected pool:vm, got `{fullname}`");
    };

    let ok = if action.is_two_phase() {
        let prepared = kernel.prepare(action, pool, vm).await?;
        match (&prepared, target) {
            (Prepared::Ready { token, .. }, Some(target)) => kernel.confirm(token, target, recovery).await?,
            _ => {
                print_prepared(fullname, action, &prepared);
                return Ok(());
            }
        }
    } else {
        kernel.act(action, pool, vm, recovery).await?
    };

    if !ok {
        bail!("{action} {fullname} failed");
    }
    println!("{action} {fullname}: ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeKernel;

    #[tokio::test]
    async fn refused_action_is_an_error() {
        let kernel = FakeKernel::with_vm("p1:v1", "Halted");
        act(&kernel, Action::Boot, "p1:v1", None, false).await.unwrap();

        *kernel.refuse_actions.lock().unwrap() = true;
        let err = act(&kernel, Action::Shutdown, "p1:v1", None, false).await.unwrap_err();
        assert_eq!(err.to_string(), "shutdown p1:v1 failed");
        assert!(act(&kernel, Action::Boot, "v1", None, false).await.is_err());
    }

    #[test]
    fn primary_action_is_starred() {
        assert_eq!(action_list(&[Action::Boot, Action::Properties], Some(Action::Boot)), "*boot properties");
        assert_eq!(action_list(&[Action::Console], None), "console");
    }
}
