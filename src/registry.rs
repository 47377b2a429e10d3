//! Supervisor Registry: the name→supervisor map and top-level coordination
//! (spec §4.3).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::signal::unix::{signal, SignalKind};

use crate::config::load_config;
use crate::error::{ConfigError, UnknownProgram};
use crate::supervisor::{StatusSnapshot, SupervisorHandle};

/// Owns every `ProgramSupervisor` for the lifetime of the daemon.
pub struct Registry {
    supervisors: HashMap<String, SupervisorHandle>,
    order: Vec<String>,
    config_path: PathBuf,
    closed: bool,
}

impl Registry {
    /// Loads `config_path` and starts every `autostart` program. This is the
    /// only constructor; there is no empty registry.
    pub async fn load(config_path: PathBuf) -> Result<Self, ConfigError> {
        let descriptors = load_config(&config_path)?;
        let mut registry = Registry {
            supervisors: HashMap::new(),
            order: Vec::new(),
            config_path,
            closed: false,
        };
        for (name, descriptor) in descriptors {
            let autostart = descriptor.autostart;
            registry.insert(name.clone(), descriptor);
            if autostart {
                registry.supervisors[&name].start().await;
            }
        }
        Ok(registry)
    }

    fn insert(&mut self, name: String, descriptor: crate::descriptor::ProgramDescriptor) {
        self.order.push(name.clone());
        self.supervisors
            .insert(name, SupervisorHandle::spawn(descriptor));
    }

    /// Re-reads the config file and diff-applies it against the live set
    /// (spec §4.3): removed programs stop and drop, added programs start,
    /// unchanged descriptors are left alone, changed descriptors are
    /// stopped, replaced and restarted. Removed/changed programs reach
    /// STOPPED before any replacement starts.
    pub async fn reload(&mut self) -> Result<(), ConfigError> {
        let new_descriptors = load_config(&self.config_path)?;

        let removed: Vec<String> = self
            .order
            .iter()
            .filter(|name| !new_descriptors.contains_key(*name))
            .cloned()
            .collect();
        for name in &removed {
            if let Some(handle) = self.supervisors.remove(name) {
                handle.shutdown().await;
            }
            self.order.retain(|n| n != name);
        }

        let mut changed = Vec::new();
        for (name, new_desc) in &new_descriptors {
            if let Some(handle) = self.supervisors.get(name) {
                if &handle.descriptor != new_desc {
                    changed.push(name.clone());
                }
            }
        }
        for name in &changed {
            if let Some(handle) = self.supervisors.remove(name) {
                handle.shutdown().await;
            }
            self.order.retain(|n| n != name);
        }

        for (name, descriptor) in new_descriptors {
            if !self.supervisors.contains_key(&name) {
                let autostart = descriptor.autostart;
                self.insert(name.clone(), descriptor);
                if autostart {
                    self.supervisors[&name].start().await;
                }
            }
        }

        Ok(())
    }

    pub async fn start_all(&self) {
        for name in &self.order {
            self.supervisors[name].start().await;
        }
    }

    /// Returns only after every supervisor has reached a non-live state
    /// (spec P3).
    pub async fn stop_all(&self) {
        for name in &self.order {
            self.supervisors[name].stop().await;
        }
        for name in &self.order {
            self.supervisors[name].wait_stopped().await;
        }
    }

    pub async fn start(&self, name: &str) -> Result<(), UnknownProgram> {
        self.dispatch(name, |h| h.start()).await
    }

    pub async fn stop(&self, name: &str) -> Result<(), UnknownProgram> {
        self.dispatch(name, |h| h.stop()).await
    }

    pub async fn restart(&self, name: &str) -> Result<(), UnknownProgram> {
        self.dispatch(name, |h| h.restart()).await
    }

    async fn dispatch<'a, F, Fut>(&'a self, name: &str, f: F) -> Result<(), UnknownProgram>
    where
        F: FnOnce(&'a SupervisorHandle) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let handle = self
            .supervisors
            .get(name)
            .ok_or_else(|| UnknownProgram(name.to_string()))?;
        f(handle).await;
        Ok(())
    }

    /// Concatenated per-supervisor snapshots, in insertion order.
    pub async fn status(&self) -> Vec<StatusSnapshot> {
        let mut snapshots = Vec::with_capacity(self.order.len());
        for name in &self.order {
            if let Some(snapshot) = self.supervisors[name].status().await {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }

    pub async fn status_one(&self, name: &str) -> Result<StatusSnapshot, UnknownProgram> {
        let handle = self
            .supervisors
            .get(name)
            .ok_or_else(|| UnknownProgram(name.to_string()))?;
        handle
            .status()
            .await
            .ok_or_else(|| UnknownProgram(name.to_string()))
    }

    pub fn program_names(&self) -> &[String] {
        &self.order
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// `stop_all`, then marks the registry closed to further commands.
    pub async fn shutdown(&mut self) {
        self.stop_all().await;
        self.closed = true;
    }
}

/// The three signals the daemon reacts to (spec §4.3, §6).
pub enum ControlSignal {
    Shutdown,
    Reload,
}

/// Installs SIGINT/SIGTERM/SIGHUP handlers once, forwarding them as tokens
/// on `tx`. Handlers do no work beyond enqueueing (spec §9).
pub fn install_signal_handlers(
    tx: tokio::sync::mpsc::Sender<ControlSignal>,
) -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                sig = sigint.recv() => if sig.is_none() { return },
                sig = sigterm.recv() => if sig.is_none() { return },
            }
            if shutdown_tx.send(ControlSignal::Shutdown).await.is_err() {
                return;
            }
        }
    });

    tokio::spawn(async move {
        loop {
            if sighup.recv().await.is_none() {
                return;
            }
            if tx.send(ControlSignal::Reload).await.is_err() {
                return;
            }
        }
    });

    Ok(())
}

/// The path a reload should re-read, tracked by the daemon (not the
/// registry itself, to keep the registry free of filesystem concerns
/// beyond the one load/reload call).
pub fn current_config_path(registry: &Registry) -> &Path {
    &registry.config_path
}
