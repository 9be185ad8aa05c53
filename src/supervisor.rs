use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::SupervisorError;
use crate::models::ContractDescriptor;
use crate::monitor::{ContractMonitor, MonitorSettings, MonitorState};
use crate::rpc::ChainReader;
use crate::store::{EventStore, ProgressStore};

struct RunningMonitor {
    contract: ContractDescriptor,
    cancel: CancellationToken,
    state: watch::Receiver<MonitorState>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub name: String,
    pub address: String,
    pub start_block: u64,
    pub state: String,
}

/// Owns one monitor task per contract. Every monitor gets a child of the
/// supervisor's token, so `shutdown` stops them all and `deactivate` stops
/// one.
pub struct Supervisor {
    chain: Arc<dyn ChainReader>,
    progress: Arc<dyn ProgressStore>,
    events: Arc<dyn EventStore>,
    settings: MonitorSettings,
    stop_signal: CancellationToken,
    monitors: Mutex<HashMap<String, RunningMonitor>>,
}

impl Supervisor {
    pub fn new(
        chain: Arc<dyn ChainReader>,
        progress: Arc<dyn ProgressStore>,
        events: Arc<dyn EventStore>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            chain,
            progress,
            events,
            settings,
            stop_signal: CancellationToken::new(),
            monitors: Mutex::new(HashMap::new()),
        }
    }

    fn lock_monitors(&self) -> MutexGuard<'_, HashMap<String, RunningMonitor>> {
        // a panic while holding this lock cannot leave the map half-updated
        self.monitors.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a monitor for every descriptor. A rejected contract is logged
    /// and does not affect the others.
    pub fn start(&self, contracts: impl IntoIterator<Item = ContractDescriptor>) -> usize {
        let mut started = 0;
        for contract in contracts {
            let address = contract.address.clone();
            match self.register(contract) {
                Ok(()) => started += 1,
                Err(e) => warn!(%address, error = %e, "not starting monitor"),
            }
        }
        started
    }

    /// Start monitoring a contract without touching running monitors. Must be
    /// called from within a tokio runtime.
    pub fn register(&self, contract: ContractDescriptor) -> Result<(), SupervisorError> {
        if self.stop_signal.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }

        let mut monitors = self.lock_monitors();
        if let Some(existing) = monitors.get(&contract.address) {
            if !existing.handle.is_finished() {
                return Err(SupervisorError::AlreadyRegistered(contract.address));
            }
        }

        let monitor = ContractMonitor::new(
            contract.clone(),
            Arc::clone(&self.chain),
            Arc::clone(&self.progress),
            Arc::clone(&self.events),
            self.settings,
        );
        let state = monitor.subscribe();
        let cancel = self.stop_signal.child_token();
        let handle = tokio::spawn(monitor.run(cancel.clone()));

        info!(contract = %contract.name, address = %contract.address, "monitor registered");
        monitors.insert(
            contract.address.clone(),
            RunningMonitor {
                contract,
                cancel,
                state,
                handle,
            },
        );
        Ok(())
    }

    /// Stop one contract's monitor and wait for it to drain.
    pub async fn deactivate(&self, address: &str) -> Result<(), SupervisorError> {
        let running = self
            .lock_monitors()
            .remove(address)
            .ok_or_else(|| SupervisorError::NotRegistered(address.to_string()))?;

        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            error!(%address, error = %e, "monitor task failed");
        }
        info!(contract = %running.contract.name, %address, "monitor deactivated");
        Ok(())
    }

    pub fn is_running(&self, address: &str) -> bool {
        self.lock_monitors()
            .get(address)
            .is_some_and(|m| !m.handle.is_finished())
    }

    pub fn statuses(&self) -> Vec<MonitorStatus> {
        let mut statuses: Vec<_> = self
            .lock_monitors()
            .values()
            .map(|m| MonitorStatus {
                name: m.contract.name.clone(),
                address: m.contract.address.clone(),
                start_block: m.contract.start_block,
                state: m.state.borrow().to_string(),
            })
            .collect();
        statuses.sort_by(|a, b| a.address.cmp(&b.address));
        statuses
    }

    pub fn is_shutting_down(&self) -> bool {
        self.stop_signal.is_cancelled()
    }

    /// Signal every monitor to stop and wait until all of them have exited.
    /// In-flight chunks finish their persist and checkpoint step first.
    pub async fn shutdown(&self) {
        self.stop_signal.cancel();
        let running: Vec<RunningMonitor> = self.lock_monitors().drain().map(|(_, m)| m).collect();
        info!(monitors = running.len(), "waiting for monitors to drain");

        let results = join_all(running.into_iter().map(|m| async move {
            (m.contract, m.handle.await)
        }))
        .await;

        for (contract, result) in results {
            if let Err(e) = result {
                error!(contract = %contract.name, error = %e, "monitor task failed");
            }
        }
        info!("all monitors stopped");
    }
}
