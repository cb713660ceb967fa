//! The pipeline registry: an in-memory catalog of registered pipelines.
//!
//! Definitions are immutable once registered except for the run-tracking
//! fields, which only the executor updates. The registry shares admission
//! control with the executor so a pipeline can never be removed while its
//! id is in the running set.

use crate::errors::EtlError;
use crate::executor::admission::AdmissionControl;
use crate::schedule::Schedule;
use crate::stages::{Extractor, Loader, PipelineConfig, Transformer};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// An unvalidated pipeline registration request.
///
/// Completeness is checked by [`PipelineRegistry::register`]; a spec with
/// a missing stage is rejected there with
/// [`EtlError::InvalidDefinition`].
#[derive(Debug, Clone, Default)]
pub struct PipelineSpec {
    id: String,
    extractor: Option<Arc<dyn Extractor>>,
    transformer: Option<Arc<dyn Transformer>>,
    loader: Option<Arc<dyn Loader>>,
    schedule: Option<String>,
    dependencies: Vec<String>,
    config: PipelineConfig,
}

impl PipelineSpec {
    /// Starts a spec for the given pipeline id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Sets the extractor.
    #[must_use]
    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Sets the transformer.
    #[must_use]
    pub fn with_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    /// Sets the loader.
    #[must_use]
    pub fn with_loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Sets a cron-like schedule expression, parsed at registration.
    #[must_use]
    pub fn with_schedule(mut self, expression: impl Into<String>) -> Self {
        self.schedule = Some(expression.into());
        self
    }

    /// Adds one dependency pipeline id.
    #[must_use]
    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Replaces the dependency list.
    #[must_use]
    pub fn with_dependencies(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.dependencies = ids.into_iter().collect();
        self
    }

    /// Sets the pipeline configuration.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }
}

/// A validated, registered pipeline.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    /// Unique pipeline id.
    pub id: String,
    /// Source stage.
    pub extractor: Arc<dyn Extractor>,
    /// Transformation stage.
    pub transformer: Arc<dyn Transformer>,
    /// Destination stage.
    pub loader: Arc<dyn Loader>,
    /// Optional schedule.
    pub schedule: Option<Schedule>,
    /// Pipelines that must complete before this one starts.
    pub dependencies: Vec<String>,
    /// Effective configuration.
    pub config: PipelineConfig,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Start time of the most recent run.
    pub last_run: Option<DateTime<Utc>>,
    /// Number of runs started.
    pub run_count: u64,
}

/// In-memory catalog mapping pipeline ids to their definitions.
#[derive(Debug)]
pub struct PipelineRegistry {
    pipelines: RwLock<HashMap<String, PipelineDefinition>>,
    admission: Arc<AdmissionControl>,
}

impl PipelineRegistry {
    /// Creates an empty registry sharing the executor's admission
    /// control.
    #[must_use]
    pub fn new(admission: Arc<AdmissionControl>) -> Self {
        Self {
            pipelines: RwLock::new(HashMap::new()),
            admission,
        }
    }

    /// Registers a pipeline.
    ///
    /// Fails with [`EtlError::Duplicate`] when the id exists and with
    /// [`EtlError::InvalidDefinition`] when the spec is structurally
    /// incomplete; on either failure nothing is stored and any original
    /// definition is unchanged.
    pub fn register(&self, spec: PipelineSpec) -> Result<(), EtlError> {
        let definition = Self::validate(spec)?;

        let mut pipelines = self.pipelines.write();
        if pipelines.contains_key(&definition.id) {
            return Err(EtlError::Duplicate(definition.id));
        }
        tracing::info!(pipeline_id = %definition.id, "pipeline registered");
        pipelines.insert(definition.id.clone(), definition);
        Ok(())
    }

    fn validate(spec: PipelineSpec) -> Result<PipelineDefinition, EtlError> {
        if spec.id.trim().is_empty() {
            return Err(EtlError::InvalidDefinition(
                "pipeline id must be non-empty".to_string(),
            ));
        }
        let Some(extractor) = spec.extractor else {
            return Err(EtlError::InvalidDefinition(format!(
                "pipeline '{}' has no extractor",
                spec.id
            )));
        };
        let Some(transformer) = spec.transformer else {
            return Err(EtlError::InvalidDefinition(format!(
                "pipeline '{}' has no transformer",
                spec.id
            )));
        };
        let Some(loader) = spec.loader else {
            return Err(EtlError::InvalidDefinition(format!(
                "pipeline '{}' has no loader",
                spec.id
            )));
        };

        let mut seen = HashSet::new();
        for dependency in &spec.dependencies {
            if dependency == &spec.id {
                return Err(EtlError::InvalidDefinition(format!(
                    "pipeline '{}' depends on itself",
                    spec.id
                )));
            }
            if !seen.insert(dependency.clone()) {
                return Err(EtlError::InvalidDefinition(format!(
                    "pipeline '{}' lists dependency '{dependency}' twice",
                    spec.id
                )));
            }
        }

        spec.config.validate()?;

        let schedule = spec
            .schedule
            .as_deref()
            .map(Schedule::parse)
            .transpose()?;

        Ok(PipelineDefinition {
            id: spec.id,
            extractor,
            transformer,
            loader,
            schedule,
            dependencies: spec.dependencies,
            config: spec.config,
            created_at: Utc::now(),
            last_run: None,
            run_count: 0,
        })
    }

    /// Looks up a definition snapshot. Absence is not an error; callers
    /// decide fatality.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<PipelineDefinition> {
        self.pipelines.read().get(id).cloned()
    }

    /// True when the id is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.pipelines.read().contains_key(id)
    }

    /// All definitions, sorted by id.
    #[must_use]
    pub fn list(&self) -> Vec<PipelineDefinition> {
        let mut definitions: Vec<_> = self.pipelines.read().values().cloned().collect();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        definitions
    }

    /// Removes a pipeline.
    ///
    /// Fails with [`EtlError::PipelineRunning`] while the id holds a
    /// running-set token; otherwise deletes unconditionally and returns
    /// whether it existed. The check and the removal happen under the
    /// admission lock, so a concurrent admit cannot interleave.
    pub fn remove(&self, id: &str) -> Result<bool, EtlError> {
        self.admission
            .while_not_running(id, || self.pipelines.write().remove(id).is_some())
    }

    /// Updates the run-tracking fields. Executor-only.
    pub(crate) fn record_run(&self, id: &str, started_at: DateTime<Utc>) {
        if let Some(definition) = self.pipelines.write().get_mut(id) {
            definition.run_count += 1;
            definition.last_run = Some(started_at);
        }
    }

    /// Number of registered pipelines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pipelines.read().len()
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pipelines.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{IdentityTransformer, RecordingLoader, StaticExtractor};

    fn complete_spec(id: &str) -> PipelineSpec {
        PipelineSpec::new(id)
            .with_extractor(Arc::new(StaticExtractor::new(vec![])))
            .with_transformer(Arc::new(IdentityTransformer::new()))
            .with_loader(Arc::new(RecordingLoader::new()))
    }

    fn registry() -> PipelineRegistry {
        PipelineRegistry::new(AdmissionControl::new(4))
    }

    #[test]
    fn test_register_and_get() {
        let registry = registry();
        registry.register(complete_spec("orders")).unwrap();

        let definition = registry.get("orders").unwrap();
        assert_eq!(definition.id, "orders");
        assert_eq!(definition.run_count, 0);
        assert!(definition.last_run.is_none());

        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_id_rejected_and_original_unchanged() {
        let registry = registry();
        registry.register(complete_spec("orders")).unwrap();
        let original_created = registry.get("orders").unwrap().created_at;

        let result = registry.register(complete_spec("orders").with_dependency("other"));
        assert!(matches!(result, Err(EtlError::Duplicate(_))));

        let definition = registry.get("orders").unwrap();
        assert_eq!(definition.created_at, original_created);
        assert!(definition.dependencies.is_empty());
    }

    #[test]
    fn test_missing_stage_rejected() {
        let registry = registry();

        let no_loader = PipelineSpec::new("p")
            .with_extractor(Arc::new(StaticExtractor::new(vec![])))
            .with_transformer(Arc::new(IdentityTransformer::new()));
        let err = registry.register(no_loader).unwrap_err();
        assert!(matches!(err, EtlError::InvalidDefinition(_)));
        assert!(err.to_string().contains("loader"));

        let no_extractor = PipelineSpec::new("p")
            .with_transformer(Arc::new(IdentityTransformer::new()))
            .with_loader(Arc::new(RecordingLoader::new()));
        assert!(registry.register(no_extractor).is_err());

        assert!(registry.is_empty());
    }

    #[test]
    fn test_empty_id_and_self_dependency_rejected() {
        let registry = registry();

        assert!(registry.register(complete_spec("  ")).is_err());
        assert!(registry
            .register(complete_spec("p").with_dependency("p"))
            .is_err());
        assert!(registry
            .register(
                complete_spec("p")
                    .with_dependencies(vec!["d".to_string(), "d".to_string()])
            )
            .is_err());
    }

    #[test]
    fn test_invalid_schedule_rejected_at_registration() {
        let registry = registry();
        let result = registry.register(complete_spec("p").with_schedule("whenever"));
        assert!(matches!(result, Err(EtlError::InvalidDefinition(_))));
    }

    #[test]
    fn test_remove_refused_while_running() {
        let admission = AdmissionControl::new(4);
        let registry = PipelineRegistry::new(admission.clone());
        registry.register(complete_spec("p")).unwrap();

        let token = admission.admit("p").unwrap();
        assert!(matches!(
            registry.remove("p"),
            Err(EtlError::PipelineRunning(_))
        ));
        assert!(registry.contains("p"));

        drop(token);
        assert!(registry.remove("p").unwrap());
        assert!(!registry.remove("p").unwrap());
    }

    #[test]
    fn test_list_sorted_by_id() {
        let registry = registry();
        registry.register(complete_spec("zeta")).unwrap();
        registry.register(complete_spec("alpha")).unwrap();

        let ids: Vec<_> = registry.list().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn test_record_run_updates_tracking_fields() {
        let registry = registry();
        registry.register(complete_spec("p")).unwrap();

        let at = Utc::now();
        registry.record_run("p", at);

        let definition = registry.get("p").unwrap();
        assert_eq!(definition.run_count, 1);
        assert_eq!(definition.last_run, Some(at));
    }
}
