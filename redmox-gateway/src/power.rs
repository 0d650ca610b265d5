//! Redfish `ComputerSystem.Reset` on top of the hypervisor's start/stop/shutdown.
//!
//! Restarts are composed: power down, poll the status until the VM is no
//! longer running, then start it again. Polling is bounded and cancellable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PowerConf;
use crate::error::{GatewayError, GatewayResult};
use crate::hypervisor::Hypervisor;
use crate::models::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetType {
    On,
    ForceOn,
    ForceOff,
    PushPowerButton,
    GracefulShutdown,
    GracefulRestart,
    ForceRestart,
}

impl ResetType {
    pub const ALL: [ResetType; 7] = [
        ResetType::On,
        ResetType::ForceOn,
        ResetType::ForceOff,
        ResetType::PushPowerButton,
        ResetType::GracefulShutdown,
        ResetType::GracefulRestart,
        ResetType::ForceRestart,
    ];

    pub fn plan(self) -> Plan {
        match self {
            ResetType::On | ResetType::ForceOn => Plan::Single(Action::Start),
            ResetType::ForceOff | ResetType::PushPowerButton => Plan::Single(Action::Stop),
            ResetType::GracefulShutdown => Plan::Single(Action::Shutdown),
            ResetType::GracefulRestart => Plan::Restart(Action::Shutdown),
            ResetType::ForceRestart => Plan::Restart(Action::Stop),
        }
    }
}

impl fmt::Display for ResetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for ResetType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResetType::ALL
            .into_iter()
            .find(|r| r.to_string() == s)
            .ok_or_else(|| GatewayError::Unsupported(format!("ResetType {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Action {
    Start,
    Stop,
    Shutdown,
}

/// What a reset type turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Single(Action),
    /// Power down with the action, wait for the VM to stop, then start.
    Restart(Action),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PowerPhase {
    Idle,
    Acting,
    Polling,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PowerOutcome {
    pub reset_type: ResetType,
    pub phase: PowerPhase,
    pub tasks: Vec<TaskId>,
    pub polls: u32,
}

/// Sleep primitive, injectable so tests do not wait.
#[async_trait]
pub trait Pause: Send + Sync {
    async fn pause(&self, duration: Duration);
}

pub struct TokioPause;

#[async_trait]
impl Pause for TokioPause {
    async fn pause(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub struct PowerActionController {
    interval: Duration,
    max_polls: u32,
    pause: Arc<dyn Pause>,
}

impl PowerActionController {
    pub fn new(conf: &PowerConf, pause: Arc<dyn Pause>) -> Self {
        Self {
            interval: Duration::from_secs(conf.poll_interval_secs),
            max_polls: conf.max_polls.max(1),
            pause,
        }
    }

    pub async fn execute(
        &self,
        hv: &dyn Hypervisor,
        node: &str,
        vmid: u32,
        reset_type: ResetType,
        cancel: &CancellationToken,
    ) -> GatewayResult<PowerOutcome> {
        let mut run = Run { vmid, phase: PowerPhase::Idle, tasks: Vec::new(), polls: 0 };
        info!("VM {}: {} requested", vmid, reset_type);
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        run.enter(PowerPhase::Acting);
        match reset_type.plan() {
            Plan::Single(action) => {
                run.act(hv, node, action).await?;
            }
            Plan::Restart(action) => {
                run.act(hv, node, action).await?;
                run.enter(PowerPhase::Polling);
                self.wait_until_down(hv, node, &mut run, cancel).await?;
                run.enter(PowerPhase::Acting);
                run.act(hv, node, Action::Start).await?;
            }
        }
        run.enter(PowerPhase::Done);

        Ok(PowerOutcome { reset_type, phase: run.phase, tasks: run.tasks, polls: run.polls })
    }

    async fn wait_until_down(
        &self,
        hv: &dyn Hypervisor,
        node: &str,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> GatewayResult<()> {
        for attempt in 1..=self.max_polls {
            if cancel.is_cancelled() {
                warn!("VM {}: reset cancelled after {} polls", run.vmid, run.polls);
                run.enter(PowerPhase::Failed);
                return Err(GatewayError::Cancelled);
            }
            let status = match hv.vm_status(node, run.vmid).await {
                Ok(status) => status,
                Err(e) => return Err(run.fail(e.into())),
            };
            run.polls = attempt;
            debug!("VM {}: poll {}/{} status {}", run.vmid, attempt, self.max_polls, status.power_status());
            if status.power_status() != "running" {
                return Ok(());
            }
            if attempt < self.max_polls {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        run.enter(PowerPhase::Failed);
                        return Err(GatewayError::Cancelled);
                    }
                    _ = self.pause.pause(self.interval) => {}
                }
            }
        }
        Err(run.fail(GatewayError::PowerActionTimeout { vmid: run.vmid, attempts: self.max_polls }))
    }
}

struct Run {
    vmid: u32,
    phase: PowerPhase,
    tasks: Vec<TaskId>,
    polls: u32,
}

impl Run {
    fn enter(&mut self, phase: PowerPhase) {
        debug!("VM {}: {:?} -> {:?}", self.vmid, self.phase, phase);
        self.phase = phase;
    }

    fn fail(&mut self, err: GatewayError) -> GatewayError {
        error!("VM {}: power action failed: {}", self.vmid, err);
        self.enter(PowerPhase::Failed);
        err
    }

    async fn act(&mut self, hv: &dyn Hypervisor, node: &str, action: Action) -> GatewayResult<()> {
        let result = match action {
            Action::Start => hv.start(node, self.vmid).await,
            Action::Stop => hv.stop(node, self.vmid).await,
            Action::Shutdown => hv.shutdown(node, self.vmid).await,
        };
        match result {
            Ok(task) => {
                info!("VM {}: {:?} issued ({})", self.vmid, action, task);
                self.tasks.push(task);
                Ok(())
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }
}
