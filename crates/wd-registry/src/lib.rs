//! Ordered module lifecycle.
//!
//! Modules register into an explicit [`Registry`] value passed through
//! initialization instead of process-wide singletons. Init runs in
//! insertion order and stops at the first failure; shutdown runs in
//! reverse and keeps going, returning the first error encountered.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("module '{module}' failed to initialize: {reason}")]
    Init { module: String, reason: String },

    #[error("module '{module}' failed to shut down: {reason}")]
    Shutdown { module: String, reason: String },
}

/// Capability set every registered module implements.
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&self) -> Result<(), String>;

    async fn shutdown(&self) -> Result<(), String>;

    /// `Ok` when healthy, `Err` with a reason otherwise.
    fn health(&self) -> Result<(), String>;
}

/// Ordered module registry. Registration is complete before `init_all`;
/// reads after that point take no locks.
#[derive(Default)]
pub struct Registry {
    modules: Vec<Arc<dyn Module>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module. Re-registering a name replaces the module in
    /// place, keeping its original position.
    pub fn register(&mut self, module: Arc<dyn Module>) {
        let name = module.name().to_string();
        if let Some(slot) = self.modules.iter_mut().find(|m| m.name() == name) {
            *slot = module;
        } else {
            self.modules.push(module);
        }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    /// Initialize every module in insertion order, stopping at the first
    /// failure.
    pub async fn init_all(&self) -> Result<(), RegistryError> {
        for module in &self.modules {
            info!(module = module.name(), "initializing");
            module.init().await.map_err(|reason| RegistryError::Init {
                module: module.name().to_string(),
                reason,
            })?;
        }
        Ok(())
    }

    /// Shut every module down in reverse order. Later failures do not stop
    /// earlier modules from shutting down; the first error is returned.
    pub async fn shutdown_all(&self) -> Result<(), RegistryError> {
        let mut first_error = None;
        for module in self.modules.iter().rev() {
            info!(module = module.name(), "shutting down");
            if let Err(reason) = module.shutdown().await {
                error!(module = module.name(), %reason, "shutdown failed");
                if first_error.is_none() {
                    first_error = Some(RegistryError::Shutdown {
                        module: module.name().to_string(),
                        reason,
                    });
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Health of every module, keyed by name. `None` means healthy.
    pub fn health_all(&self) -> HashMap<String, Option<String>> {
        self.modules
            .iter()
            .map(|m| (m.name().to_string(), m.health().err()))
            .collect()
    }
}
