//! Program Supervisor: the state machine governing one program's instances
//! (spec §4.2).

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;

use crate::descriptor::{AutoRestart, ProgramDescriptor};
use crate::instance::{Instance, PollResult};

const TICK: Duration = Duration::from_millis(200);

/// The finite set of states a Program Runtime can be in (spec §3/§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramState {
    Stopped,
    Starting,
    Running,
    Backoff,
    Stopping,
    Exited,
    Fatal,
}

impl ProgramState {
    fn is_live(self) -> bool {
        matches!(
            self,
            ProgramState::Starting | ProgramState::Running | ProgramState::Backoff
        )
    }
}

/// Point-in-time view of one instance, for `status`.
#[derive(Debug, Clone)]
pub struct InstanceStatus {
    pub index: u32,
    pub pid: Option<i32>,
    pub uptime: Duration,
    pub last_exit_code: Option<i32>,
}

/// Point-in-time view of a whole program, for `status`.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub name: String,
    pub state: ProgramState,
    pub instances: Vec<InstanceStatus>,
    pub failed_starts: u32,
    pub since_last_transition: Duration,
}

enum SupervisorCommand {
    Start,
    Stop,
    Restart,
    Status(oneshot::Sender<StatusSnapshot>),
    Shutdown,
}

/// A handle to a running Program Supervisor's monitor task.
///
/// Every operation is delivered through the mailbox; the monitor task
/// processes at most one command between ticks (spec §5).
pub struct SupervisorHandle {
    pub descriptor: ProgramDescriptor,
    tx: mpsc::Sender<SupervisorCommand>,
    task: tokio::task::JoinHandle<()>,
}

impl SupervisorHandle {
    /// Spawns the monitor task for `descriptor`. The program starts in
    /// STOPPED; call `start()` to spawn instances (the registry does this
    /// for `autostart` programs at load time, spec §4.3).
    pub fn spawn(descriptor: ProgramDescriptor) -> Self {
        let (tx, rx) = mpsc::channel(8);
        let runtime = ProgramRuntime::new(descriptor.clone());
        let task = tokio::spawn(runtime.run(rx));
        SupervisorHandle {
            descriptor,
            tx,
            task,
        }
    }

    pub async fn start(&self) {
        let _ = self.tx.send(SupervisorCommand::Start).await;
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(SupervisorCommand::Stop).await;
    }

    pub async fn restart(&self) {
        let _ = self.tx.send(SupervisorCommand::Restart).await;
    }

    pub async fn status(&self) -> Option<StatusSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(SupervisorCommand::Status(reply_tx)).await.ok()?;
        reply_rx.await.ok()
    }

    /// Stops the program and waits for its monitor task to exit.
    pub async fn shutdown(self) {
        let _ = self.tx.send(SupervisorCommand::Shutdown).await;
        let _ = self.task.await;
    }

    /// True once the monitor task has stopped all instances (used by
    /// `stop_all`'s "await every STOPPED transition" guarantee).
    pub async fn wait_stopped(&self) {
        loop {
            match self.status().await {
                Some(snapshot) if !snapshot.state.is_live() => return,
                Some(_) => tokio::time::sleep(TICK).await,
                None => return,
            }
        }
    }
}

/// The mutable runtime owned by one monitor task: current state,
/// per-instance records, failed-start counter, last transition timestamp.
struct ProgramRuntime {
    descriptor: ProgramDescriptor,
    state: ProgramState,
    instances: Vec<Instance>,
    failed_starts: u32,
    last_transition: Instant,
    backoff_until: Option<Instant>,
}

impl ProgramRuntime {
    fn new(descriptor: ProgramDescriptor) -> Self {
        ProgramRuntime {
            descriptor,
            state: ProgramState::Stopped,
            instances: Vec::new(),
            failed_starts: 0,
            last_transition: Instant::now(),
            backoff_until: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SupervisorCommand>) {
        let mut ticker = interval(TICK);
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(SupervisorCommand::Shutdown) => {
                            self.do_stop().await;
                            return;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            self.do_stop().await;
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.monitor_tick().await;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: SupervisorCommand) {
        match cmd {
            SupervisorCommand::Start => self.do_start(),
            SupervisorCommand::Stop => self.do_stop().await,
            SupervisorCommand::Restart => {
                // happens-before: the replacement spawn must not observe any
                // live instance from the prior generation.
                self.do_stop().await;
                self.do_start();
            }
            SupervisorCommand::Status(reply) => {
                let _ = reply.send(self.snapshot());
            }
            SupervisorCommand::Shutdown => unreachable!("handled in run()"),
        }
    }

    fn do_start(&mut self) {
        if matches!(
            self.state,
            ProgramState::Running | ProgramState::Starting | ProgramState::Stopping
        ) {
            return; // idempotent: L1
        }
        // STOPPED, EXITED, FATAL and BACKOFF all accept start(): in
        // particular an operator start during BACKOFF resets the retry
        // counter and spawns right away instead of waiting out the delay.
        self.failed_starts = 0;
        self.backoff_until = None;
        if self.spawn_generation() {
            self.transition(ProgramState::Starting);
        }
        // else: spawn_generation already drove us to BACKOFF or FATAL.
    }

    async fn do_stop(&mut self) {
        if !self.state.is_live() {
            return; // idempotent: L2
        }
        self.transition(ProgramState::Stopping);
        self.terminate_all().await;
        self.transition(ProgramState::Stopped);
    }

    /// Spawns a fresh generation of instances. Returns `false` if any
    /// instance failed to spawn (in which case a failed start was already
    /// registered and the state already moved to BACKOFF/FATAL).
    fn spawn_generation(&mut self) -> bool {
        self.instances.clear();
        let mut spawn_failed = false;
        for index in 0..self.descriptor.numprocs {
            match Instance::spawn(&self.descriptor, index) {
                Ok(instance) => self.instances.push(instance),
                Err(err) => {
                    log::error!(program = self.descriptor.name.as_str(), index; "spawn failed: {err}");
                    spawn_failed = true;
                }
            }
        }
        if spawn_failed {
            self.instances.clear();
            self.register_failed_start();
            false
        } else {
            true
        }
    }

    async fn terminate_all(&mut self) {
        let stopsignal = self.descriptor.stopsignal;
        let grace = Duration::from_secs(self.descriptor.stoptime);
        for instance in &mut self.instances {
            instance.terminate(stopsignal, grace).await;
        }
        self.instances.clear();
    }

    /// Periodic tick: poll instances, classify exits, drive transitions.
    async fn monitor_tick(&mut self) {
        match self.state {
            ProgramState::Starting | ProgramState::Running => self.poll_instances().await,
            ProgramState::Backoff => self.maybe_retry_after_backoff(),
            _ => {}
        }

        if self.state == ProgramState::Starting && self.all_instances_promoted() {
            self.failed_starts = 0;
            self.transition(ProgramState::Running);
        }
    }

    fn all_instances_promoted(&self) -> bool {
        !self.instances.is_empty()
            && self
                .instances
                .iter()
                .all(|i| i.is_alive() && i.uptime() >= Duration::from_secs(self.descriptor.starttime))
    }

    async fn poll_instances(&mut self) {
        let starttime = Duration::from_secs(self.descriptor.starttime);
        let mut exited = Vec::new();
        for instance in &mut self.instances {
            if let PollResult::Exited(code) = instance.poll() {
                exited.push((instance.index, instance.uptime(), code));
            }
        }
        if exited.is_empty() {
            return;
        }
        self.instances.retain(|i| i.is_alive());

        for (index, uptime, code) in exited {
            self.on_instance_exit(index, uptime, code, starttime).await;
            if matches!(self.state, ProgramState::Backoff | ProgramState::Fatal) {
                // The whole generation was torn down by register_failed_start;
                // remaining exits in this batch refer to an already-dead generation.
                break;
            }
        }

        if matches!(self.state, ProgramState::Running | ProgramState::Starting)
            && self.instances.is_empty()
        {
            self.transition(ProgramState::Exited);
        }
    }

    async fn on_instance_exit(
        &mut self,
        index: u32,
        uptime: Duration,
        code: Option<i32>,
        starttime: Duration,
    ) {
        let respawn = self.should_respawn(code);

        if !respawn {
            // Instance is retired; state resolves once all exits in this
            // batch are processed (see poll_instances).
            return;
        }

        if uptime < starttime {
            log::warn!(
                program = self.descriptor.name.as_str(), index, uptime_ms = uptime.as_millis() as u64;
                "instance exited before starttime elapsed"
            );
            self.terminate_all().await;
            self.register_failed_start();
            return;
        }

        // Normal respawn: uptime was sufficient, just replace this slot.
        match Instance::spawn(&self.descriptor, index) {
            Ok(instance) => {
                self.instances.push(instance);
                self.transition(ProgramState::Starting);
            }
            Err(err) => {
                log::error!(program = self.descriptor.name.as_str(), index; "respawn failed: {err}");
                self.register_failed_start();
            }
        }
    }

    fn should_respawn(&self, code: Option<i32>) -> bool {
        match self.descriptor.autorestart {
            AutoRestart::Always => true,
            AutoRestart::Never => false,
            AutoRestart::Unexpected => match code {
                Some(code) => !self.descriptor.exitcodes.contains(&code),
                None => true, // killed by signal: always unexpected
            },
        }
    }

    /// Counts a failed start and decides BACKOFF vs FATAL (spec P4).
    fn register_failed_start(&mut self) {
        self.failed_starts += 1;
        if self.failed_starts > self.descriptor.startretries {
            self.transition(ProgramState::Fatal);
        } else {
            self.backoff_until =
                Some(Instant::now() + Duration::from_secs(self.descriptor.starttime));
            self.transition(ProgramState::Backoff);
        }
    }

    fn maybe_retry_after_backoff(&mut self) {
        let Some(until) = self.backoff_until else {
            return;
        };
        if Instant::now() < until {
            return;
        }
        self.backoff_until = None;
        if self.spawn_generation() {
            self.transition(ProgramState::Starting);
        }
    }

    fn transition(&mut self, next: ProgramState) {
        log::info!(
            program = self.descriptor.name.as_str(),
            from = format!("{:?}", self.state),
            to = format!("{:?}", next);
            "state transition"
        );
        self.state = next;
        self.last_transition = Instant::now();
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            name: self.descriptor.name.clone(),
            state: self.state,
            instances: self
                .instances
                .iter()
                .map(|i| InstanceStatus {
                    index: i.index,
                    pid: i.pid(),
                    uptime: i.uptime(),
                    last_exit_code: i.last_exit_code,
                })
                .collect(),
            failed_starts: self.failed_starts,
            since_last_transition: self.last_transition.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::StopSignal;
    use std::collections::{BTreeSet, HashMap};
    use std::path::PathBuf;

    fn descriptor(autorestart: AutoRestart, exitcodes: BTreeSet<i32>) -> ProgramDescriptor {
        ProgramDescriptor {
            name: "a".into(),
            cmd: "true".into(),
            numprocs: 1,
            umask: 0o022,
            workingdir: PathBuf::from("/tmp"),
            autostart: true,
            autorestart,
            exitcodes,
            startretries: 3,
            starttime: 5,
            stopsignal: StopSignal::default(),
            stoptime: 10,
            stdout: None,
            stderr: None,
            env: HashMap::new(),
        }
    }

    #[test]
    fn never_does_not_respawn_regardless_of_code() {
        let rt = ProgramRuntime::new(descriptor(AutoRestart::Never, BTreeSet::from([0])));
        assert!(!rt.should_respawn(Some(0)));
        assert!(!rt.should_respawn(Some(1)));
    }

    #[test]
    fn always_respawns_regardless_of_code() {
        let rt = ProgramRuntime::new(descriptor(AutoRestart::Always, BTreeSet::from([0])));
        assert!(rt.should_respawn(Some(0)));
        assert!(rt.should_respawn(Some(1)));
    }

    #[test]
    fn unexpected_respawns_only_outside_exitcodes() {
        let rt = ProgramRuntime::new(descriptor(AutoRestart::Unexpected, BTreeSet::from([0, 2])));
        assert!(!rt.should_respawn(Some(0)));
        assert!(!rt.should_respawn(Some(2)));
        assert!(rt.should_respawn(Some(1)));
    }

    #[test]
    fn unexpected_with_empty_exitcodes_treats_every_exit_as_unexpected() {
        let rt = ProgramRuntime::new(descriptor(AutoRestart::Unexpected, BTreeSet::new()));
        assert!(rt.should_respawn(Some(0)));
    }

    #[test]
    fn signal_kills_are_always_unexpected() {
        let rt = ProgramRuntime::new(descriptor(AutoRestart::Unexpected, BTreeSet::from([0])));
        assert!(rt.should_respawn(None));
    }

    #[test]
    fn fresh_runtime_starts_stopped() {
        let rt = ProgramRuntime::new(descriptor(AutoRestart::Unexpected, BTreeSet::from([0])));
        assert_eq!(rt.state, ProgramState::Stopped);
        assert_eq!(rt.failed_starts, 0);
    }

    #[tokio::test]
    async fn start_during_backoff_resets_counter_and_respawns() {
        let mut desc = descriptor(AutoRestart::Unexpected, BTreeSet::from([0]));
        desc.cmd = "sleep 60".into();
        let mut rt = ProgramRuntime::new(desc);

        rt.state = ProgramState::Backoff;
        rt.failed_starts = 2;
        rt.backoff_until = Some(Instant::now() + Duration::from_secs(60));

        rt.do_start();

        assert_eq!(rt.state, ProgramState::Starting);
        assert_eq!(rt.failed_starts, 0);
        assert!(rt.backoff_until.is_none());
        assert_eq!(rt.instances.len(), 1);
    }

    #[test]
    fn start_is_a_no_op_while_running_starting_or_stopping() {
        for live in [ProgramState::Running, ProgramState::Starting, ProgramState::Stopping] {
            let mut rt = ProgramRuntime::new(descriptor(AutoRestart::Unexpected, BTreeSet::from([0])));
            rt.state = live;
            rt.failed_starts = 1;
            rt.do_start();
            assert_eq!(rt.state, live);
            assert_eq!(rt.failed_starts, 1);
        }
    }
}
