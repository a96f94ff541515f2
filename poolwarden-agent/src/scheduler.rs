//! Single task owning the poll deadline, the command queue and the local view.
//!
//! At most one kernel request is in flight. The deadline is reset after every
//! poll and every action, and a finished action is followed by an immediate poll.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::client::KernelApi;
use crate::reconcile::{Reconciler, VmView};
use crate::snapshot::{split_fullname, Action, Prepared};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Single-phase action.
    Act { fullname: String, action: Action, recovery: bool },
    /// Discovery phase; the token is kept until `Choose`.
    Prepare { fullname: String, action: Action },
    /// Execution phase on a host returned by `Prepare`.
    Choose { fullname: String, action: Action, target: String, recovery: bool },
    Refresh,
    Quit,
}

impl Command {
    /// `<action> <pool:vm>`, `prepare <action> <pool:vm>`,
    /// `choose <action> <pool:vm> <host> [recovery]`, `refresh`, `quit`.
    pub fn parse(line: &str) -> Result<Command, String> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let fullname = |w: &str| -> Result<String, String> {
            split_fullname(w).map(|_| w.to_string()).ok_or_else(|| format!("expected pool:vm, got `{w}`"))
        };
        match words.as_slice() {
            ["refresh"] => Ok(Command::Refresh),
            ["quit"] | ["exit"] => Ok(Command::Quit),
            ["prepare", action, vm] => Ok(Command::Prepare { fullname: fullname(vm)?, action: action.parse()? }),
            ["choose", action, vm, target, rest @ ..] => Ok(Command::Choose {
                fullname: fullname(vm)?,
                action: action.parse()?,
                target: target.to_string(),
                recovery: rest == ["recovery"],
            }),
            [action, vm, rest @ ..] => {
                let action: Action = action.parse()?;
                if action.is_two_phase() {
                    return Err(format!("{action} needs `prepare` then `choose`"));
                }
                Ok(Command::Act { fullname: fullname(vm)?, action, recovery: rest == ["recovery"] })
            }
            _ => Err(format!("cannot parse `{}`", line.trim())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Every visible VM after a merged poll.
    Polled { vms: Vec<VmView> },
    /// The VM just went busy.
    Submitted { vm: VmView },
    PollFailed,
    Prepared { fullname: String, action: Action, prepared: Prepared },
    Done { fullname: String, action: Action, ok: bool },
    Rejected { fullname: String, reason: String },
}

pub struct Scheduler<K: KernelApi> {
    kernel: Arc<K>,
    interval: Duration,
    view: Reconciler,
    tokens: HashMap<(String, Action), String>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<Event>,
}

impl<K: KernelApi> Scheduler<K> {
    pub fn new(
        kernel: Arc<K>,
        interval: Duration,
        commands: mpsc::Receiver<Command>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self { kernel, interval, view: Reconciler::new(), tokens: HashMap::new(), commands, events }
    }

    pub fn view(&self) -> &Reconciler {
        &self.view
    }

    pub async fn run(mut self) -> Self {
        self.poll().await;
        let mut deadline = Instant::now() + self.interval;

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    self.poll().await;
                    deadline = Instant::now() + self.interval;
                }
                cmd = self.commands.recv() => {
                    match cmd {
                        None | Some(Command::Quit) => break,
                        Some(cmd) => {
                            if self.handle(cmd).await {
                                self.poll().await;
                                deadline = Instant::now() + self.interval;
                            }
                        }
                    }
                }
            }
        }
        self
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    async fn poll(&mut self) {
        match self.kernel.status().await {
            Ok(snapshot) => {
                self.view.merge(snapshot);
                let vms = self.view.views();
                debug!(vms = vms.len(), "[scheduler] status merged");
                self.emit(Event::Polled { vms });
            }
            Err(e) => {
                // retried on the next tick
                warn!(error = %e, "[scheduler] poll failed");
                self.emit(Event::PollFailed);
            }
        }
    }

    /// Returns true when something was submitted and a fresh poll is due.
    async fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Refresh => true,
            Command::Quit => false,
            Command::Act { fullname, action, recovery } => {
                let Some((pool, vm)) = self.begin(&fullname, action) else { return false };
                let ok = self.kernel.act(action, &pool, &vm, recovery).await.unwrap_or_else(|e| {
                    warn!(%fullname, %action, error = %e, "[scheduler] action request failed");
                    false
                });
                self.finish(fullname, action, ok);
                true
            }
            Command::Prepare { fullname, action } => {
                let Some((pool, vm)) = split_fullname(&fullname).map(|(p, v)| (p.to_string(), v.to_string())) else {
                    return false;
                };
                let prepared = self.kernel.prepare(action, &pool, &vm).await.unwrap_or_else(|e| {
                    warn!(%fullname, %action, error = %e, "[scheduler] prepare failed");
                    Prepared::Unavailable
                });
                if let Prepared::Ready { token, .. } = &prepared {
                    self.tokens.insert((fullname.clone(), action), token.clone());
                }
                self.emit(Event::Prepared { fullname, action, prepared });
                false
            }
            Command::Choose { fullname, action, target, recovery } => {
                let Some(token) = self.tokens.remove(&(fullname.clone(), action)) else {
                    self.emit(Event::Rejected { fullname, reason: format!("no prepared {action}") });
                    return false;
                };
                if self.begin(&fullname, action).is_none() {
                    // keep the token for a retry once the VM is free
                    self.tokens.insert((fullname, action), token);
                    return false;
                }
                let ok = self.kernel.confirm(&token, &target, recovery).await.unwrap_or_else(|e| {
                    warn!(%fullname, %action, error = %e, "[scheduler] confirm failed");
                    false
                });
                self.finish(fullname, action, ok);
                true
            }
        }
    }

    fn begin(&mut self, fullname: &str, action: Action) -> Option<(String, String)> {
        let Some((pool, vm)) = split_fullname(fullname) else {
            self.emit(Event::Rejected { fullname: fullname.to_string(), reason: "bad name".into() });
            return None;
        };
        let (pool, vm) = (pool.to_string(), vm.to_string());
        if self.view.is_busy(fullname) {
            self.emit(Event::Rejected { fullname: fullname.to_string(), reason: "busy".into() });
            return None;
        }
        if !self.view.submit(fullname) {
            self.emit(Event::Rejected { fullname: fullname.to_string(), reason: "unknown vm".into() });
            return None;
        }
        info!(%fullname, %action, "[scheduler] submitted");
        if let Some(view) = self.view.view_of(fullname) {
            self.emit(Event::Submitted { vm: view });
        }
        Some((pool, vm))
    }

    fn finish(&mut self, fullname: String, action: Action, ok: bool) {
        self.view.complete(&fullname);
        info!(%fullname, %action, ok, "[scheduler] completed");
        self.emit(Event::Done { fullname, action, ok });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::{Call, FakeKernel};
    use crate::reconcile::{EffectiveState, Phase};

    struct Harness {
        kernel: Arc<FakeKernel>,
        commands: mpsc::Sender<Command>,
        events: mpsc::UnboundedReceiver<Event>,
        task: tokio::task::JoinHandle<Scheduler<FakeKernel>>,
    }

    fn start(kernel: FakeKernel) -> Harness {
        let kernel = Arc::new(kernel);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let sched = Scheduler::new(kernel.clone(), Duration::from_secs(60), cmd_rx, ev_tx);
        Harness { kernel, commands: cmd_tx, events: ev_rx, task: tokio::spawn(sched.run()) }
    }

    fn polled(event: Option<Event>) -> Vec<VmView> {
        match event {
            Some(Event::Polled { vms }) => vms,
            other => panic!("expected a poll, got {other:?}"),
        }
    }

    fn polls(k: &FakeKernel) -> usize {
        k.calls().iter().filter(|c| **c == Call::Status).count()
    }

    #[test]
    fn parses_commands() {
        assert_eq!(
            Command::parse("boot p1:v1"),
            Ok(Command::Act { fullname: "p1:v1".into(), action: Action::Boot, recovery: false })
        );
        assert_eq!(
            Command::parse("choose booton p1:v1 H2 recovery"),
            Ok(Command::Choose { fullname: "p1:v1".into(), action: Action::BootOn, target: "H2".into(), recovery: true })
        );
        assert_eq!(Command::parse(" refresh "), Ok(Command::Refresh));
        assert!(Command::parse("migrate p1:v3").is_err());
        assert!(Command::parse("boot v1").is_err());
        assert!(Command::parse("dance p1:v1").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn polls_on_a_fixed_interval() {
        let mut h = start(FakeKernel::with_vm("p1:v1", "Halted"));
        assert_eq!(polled(h.events.recv().await).len(), 1);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(polls(&h.kernel), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(polls(&h.kernel), 2);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(polls(&h.kernel), 3);

        h.commands.send(Command::Quit).await.unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn action_completion_polls_and_resets_the_deadline() {
        let mut h = start(FakeKernel::with_vm("p1:v1", "Halted"));
        h.events.recv().await;

        tokio::time::sleep(Duration::from_secs(40)).await;
        h.commands
            .send(Command::Act { fullname: "p1:v1".into(), action: Action::Boot, recovery: false })
            .await
            .unwrap();
        assert!(matches!(h.events.recv().await, Some(Event::Submitted { .. })));
        assert_eq!(h.events.recv().await, Some(Event::Done { fullname: "p1:v1".into(), action: Action::Boot, ok: true }));
        let vms = polled(h.events.recv().await);
        assert_eq!(vms[0].state, EffectiveState::Running);
        assert_eq!(polls(&h.kernel), 2);

        // the old deadline (t=60) is gone, the next poll is due at t=100
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(polls(&h.kernel), 2);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(polls(&h.kernel), 3);

        h.commands.send(Command::Quit).await.unwrap();
        let sched = h.task.await.unwrap();
        let res = sched.view().get("p1:v1").unwrap();
        assert_eq!(res.phase, Phase::Idle);
        assert_eq!(res.effective_state(), EffectiveState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn choose_uses_the_prepared_token() {
        let mut h = start(FakeKernel::with_vm("p1:v3", "Running"));
        h.events.recv().await;

        h.commands
            .send(Command::Choose { fullname: "p1:v3".into(), action: Action::Migrate, target: "H2".into(), recovery: false })
            .await
            .unwrap();
        assert!(matches!(h.events.recv().await, Some(Event::Rejected { .. })));

        h.commands.send(Command::Prepare { fullname: "p1:v3".into(), action: Action::Migrate }).await.unwrap();
        assert!(matches!(h.events.recv().await, Some(Event::Prepared { .. })));
        h.commands
            .send(Command::Choose { fullname: "p1:v3".into(), action: Action::Migrate, target: "H2".into(), recovery: false })
            .await
            .unwrap();
        assert!(matches!(h.events.recv().await, Some(Event::Submitted { .. })));
        assert_eq!(h.events.recv().await, Some(Event::Done { fullname: "p1:v3".into(), action: Action::Migrate, ok: true }));

        h.commands.send(Command::Quit).await.unwrap();
        h.task.await.unwrap();
        assert!(h.kernel.calls().contains(&Call::Confirm("tok-migrate-v3".into(), "H2".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_is_retried_next_tick() {
        let kernel = FakeKernel::with_vm("p1:v1", "Halted");
        *kernel.fail_status.lock().unwrap() = true;
        let mut h = start(kernel);
        assert_eq!(h.events.recv().await, Some(Event::PollFailed));

        *h.kernel.fail_status.lock().unwrap() = false;
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(polled(h.events.recv().await).len(), 1);

        h.commands.send(Command::Quit).await.unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pending_vm_is_reported_busy_with_console_only() {
        let mut h = start(FakeKernel::with_vm("p1:v2", "Running"));
        let vms = polled(h.events.recv().await);
        assert_eq!(vms[0].state, EffectiveState::Running);
        assert_eq!(vms[0].allowed, vec![Action::Console, Action::Migrate]);
        assert_eq!(vms[0].primary, Some(Action::Console));

        h.commands
            .send(Command::Act { fullname: "p1:v2".into(), action: Action::Reboot, recovery: false })
            .await
            .unwrap();
        let Some(Event::Submitted { vm }) = h.events.recv().await else {
            panic!("expected the submit to be reported");
        };
        assert_eq!(vm.fullname, "p1:v2");
        assert_eq!(vm.state, EffectiveState::Busy);
        assert_eq!(vm.allowed, vec![Action::Console]);
        assert_eq!(vm.primary, None);

        assert!(matches!(h.events.recv().await, Some(Event::Done { ok: true, .. })));
        let vms = polled(h.events.recv().await);
        assert_eq!(vms[0].state, EffectiveState::Running);

        h.commands.send(Command::Quit).await.unwrap();
        h.task.await.unwrap();
    }
}
