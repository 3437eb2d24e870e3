//! Container lifecycle collaborator
//!
//! The quota manager only ever needs to stop an owner's workload when the
//! `stop` overage policy fires.

use crate::error::{NetplaneError, Result};
use crate::exec::CommandRunner;
use crate::store::OwnerId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::info;

/// Stops tenant workloads
pub trait ContainerLifecycle: Send + Sync {
    /// Called again for an owner that is already stopped while it stays
    /// over its traffic limit; stopping a stopped workload must succeed.
    fn stop(&self, owner: OwnerId) -> Result<()>;
}

/// Stops workloads by running a configured command (`lxc stop {owner}` by default)
pub struct CommandLifecycle {
    runner: CommandRunner,
    command: Vec<String>,
}

impl CommandLifecycle {
    pub fn new(runner: CommandRunner, command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(NetplaneError::Config("stop command must not be empty".to_string()));
        }
        Ok(Self { runner, command })
    }

    /// Command line for one owner
    pub fn command_for(&self, owner: OwnerId) -> Vec<String> {
        let owner = owner.to_string();
        self.command.iter().map(|part| part.replace("{owner}", &owner)).collect()
    }
}

impl ContainerLifecycle for CommandLifecycle {
    fn stop(&self, owner: OwnerId) -> Result<()> {
        let command = self.command_for(owner);
        let (program, args) = command
            .split_first()
            .ok_or_else(|| NetplaneError::Lifecycle("empty stop command".to_string()))?;

        self.runner
            .run(program, args)
            .map_err(|e| NetplaneError::Lifecycle(format!("stopping owner {}: {}", owner, e)))?;

        info!("Stopped workload of owner {}", owner);
        Ok(())
    }
}

/// Records stop requests instead of acting on them
#[derive(Default)]
pub struct RecordingLifecycle {
    stopped: Mutex<Vec<OwnerId>>,
    fail: AtomicBool,
}

impl RecordingLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent stop requests fail (after recording them)
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Owners a stop was requested for, in order
    pub fn stopped(&self) -> Vec<OwnerId> {
        self.stopped.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl ContainerLifecycle for RecordingLifecycle {
    fn stop(&self, owner: OwnerId) -> Result<()> {
        self.stopped
            .lock()
            .map_err(|_| NetplaneError::Lock("Failed to acquire lifecycle lock".to_string()))?
            .push(owner);

        if self.fail.load(Ordering::SeqCst) {
            return Err(NetplaneError::Lifecycle(format!("stop of owner {} rejected", owner)));
        }

        info!("[dry-run] stop workload of owner {}", owner);
        Ok(())
    }
}
