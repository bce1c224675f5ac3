//! Destination selection.
//!
//! A picker maps a job's context to the name of a configured
//! destination. Pickers are a registry of named implementations
//! populated at startup; deployments add their own through
//! [`PickerRegistry::register`] instead of loading code dynamically.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::ConfigError;
use crate::job::Principal;

/// What a picker is allowed to see beyond the job's own attributes.
pub struct PickContext<'a> {
    /// Configured destination names, in deterministic (name) order.
    pub destination_names: &'a [String],
    /// Configured application names, in deterministic (name) order.
    pub application_names: &'a [String],
}

/// Selects a destination for a job. Called exactly once per job.
pub trait DestinationPicker: Send + Sync + std::fmt::Debug {
    fn pick(
        &self,
        job_dir: &Path,
        application: &str,
        principal: &Principal,
        ctx: &PickContext<'_>,
    ) -> Result<String, ConfigError>;
}

/// Always the first configured destination.
#[derive(Debug)]
pub struct PickFirst;

impl DestinationPicker for PickFirst {
    fn pick(
        &self,
        _job_dir: &Path,
        _application: &str,
        _principal: &Principal,
        ctx: &PickContext<'_>,
    ) -> Result<String, ConfigError> {
        ctx.destination_names
            .first()
            .cloned()
            .ok_or_else(|| ConfigError::Invalid("no destinations configured".into()))
    }
}

/// Round-robins across all configured destinations.
#[derive(Debug, Default)]
pub struct PickRound {
    next: AtomicUsize,
}

impl DestinationPicker for PickRound {
    fn pick(
        &self,
        _job_dir: &Path,
        _application: &str,
        _principal: &Principal,
        ctx: &PickContext<'_>,
    ) -> Result<String, ConfigError> {
        if ctx.destination_names.is_empty() {
            return Err(ConfigError::Invalid("no destinations configured".into()));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % ctx.destination_names.len();
        Ok(ctx.destination_names[index].clone())
    }
}

/// The destination named like the application.
#[derive(Debug)]
pub struct PickByName;

impl DestinationPicker for PickByName {
    fn pick(
        &self,
        _job_dir: &Path,
        application: &str,
        _principal: &Principal,
        ctx: &PickContext<'_>,
    ) -> Result<String, ConfigError> {
        if ctx.destination_names.iter().any(|name| name == application) {
            Ok(application.to_string())
        } else {
            Err(ConfigError::UnknownDestination(application.to_string()))
        }
    }
}

/// The n-th destination for the n-th application.
#[derive(Debug)]
pub struct PickByIndex;

impl DestinationPicker for PickByIndex {
    fn pick(
        &self,
        _job_dir: &Path,
        application: &str,
        _principal: &Principal,
        ctx: &PickContext<'_>,
    ) -> Result<String, ConfigError> {
        let app_index = ctx
            .application_names
            .iter()
            .position(|name| name == application)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown application {application}")))?;
        ctx.destination_names
            .get(app_index)
            .cloned()
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "application index {app_index} has no matching destination"
                ))
            })
    }
}

type PickerFactory = Arc<dyn Fn() -> Arc<dyn DestinationPicker> + Send + Sync>;

/// Named picker implementations available to the configuration.
pub struct PickerRegistry {
    factories: HashMap<String, PickerFactory>,
}

impl Default for PickerRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("first", || Arc::new(PickFirst));
        registry.register("round", || Arc::new(PickRound::default()));
        registry.register("byname", || Arc::new(PickByName));
        registry.register("byindex", || Arc::new(PickByIndex));
        registry
    }
}

impl PickerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a picker available under `name`. Build-time extension point
    /// for deployment-specific pickers.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn DestinationPicker> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Instantiate the picker configured under `name`.
    pub fn build(&self, name: &str) -> Result<Arc<dyn DestinationPicker>, ConfigError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| ConfigError::UnknownPicker(name.to_string()))
    }
}
