//! Task and parameter-object registries.
//!
//! Tasks and parameter-object classes are looked up by dotted key. User code
//! registers everything up front, config `tasks:` selectors then match
//! against the registry, a trailing `.*` selecting every concrete spec under
//! the prefix.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::ChainError;
use crate::param::ParameterObject;
use crate::task::TaskSpec;

/// Factory instantiating a parameter object from the `args` and `kwargs` of
/// its config spec.
pub type ObjectFactory =
    Arc<dyn Fn(&[Value], &serde_json::Map<String, Value>) -> anyhow::Result<Arc<dyn ParameterObject>> + Send + Sync>;

/// The registry all chains of a project draw from.
#[derive(Default)]
pub struct Registry {
    tasks: BTreeMap<String, Arc<TaskSpec>>,
    objects: BTreeMap<String, ObjectFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task spec under its dotted key. A later registration under
    /// the same key replaces the earlier one.
    pub fn register_task(&mut self, spec: TaskSpec) -> &mut Self {
        self.tasks.insert(spec.key().to_string(), Arc::new(spec));
        self
    }

    /// Register a parameter-object class under its dotted key.
    pub fn register_object<F>(&mut self, class: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&[Value], &serde_json::Map<String, Value>) -> anyhow::Result<Arc<dyn ParameterObject>>
            + Send
            + Sync
            + 'static,
    {
        self.objects.insert(class.into(), Arc::new(factory));
        self
    }

    /// Finish registration, chains share the registry from here on.
    pub fn finish(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn task(&self, key: &str) -> Option<&Arc<TaskSpec>> {
        self.tasks.get(key)
    }

    pub(crate) fn object_factory(&self, class: &str) -> Option<&ObjectFactory> {
        self.objects.get(class)
    }

    /// Expand one `tasks:` selector. `prefix.*` matches every concrete spec
    /// whose key continues the prefix after a dot, an exact key matches one
    /// spec. A selector matching nothing is an error.
    pub(crate) fn select(
        &self,
        config: &str,
        selector: &str,
    ) -> Result<Vec<Arc<TaskSpec>>, ChainError> {
        if let Some(prefix) = selector.strip_suffix(".*") {
            let needle = format!("{prefix}.");
            let matched: Vec<_> = self
                .tasks
                .range(needle.clone()..)
                .take_while(|(key, _)| key.starts_with(&needle))
                .filter(|(_, spec)| !spec.is_abstract())
                .map(|(_, spec)| spec.clone())
                .collect();
            if matched.is_empty() {
                return Err(ChainError::UnknownTask {
                    config: config.to_string(),
                    selector: selector.to_string(),
                });
            }
            return Ok(matched);
        }

        let spec = self.tasks.get(selector).ok_or_else(|| ChainError::UnknownTask {
            config: config.to_string(),
            selector: selector.to_string(),
        })?;
        if spec.is_abstract() {
            return Err(ChainError::AbstractTask(selector.to_string()));
        }
        Ok(vec![spec.clone()])
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .field("objects", &self.objects.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::RunOutput;

    fn noop(key: &str) -> TaskSpec {
        TaskSpec::new(key, |_| Ok(RunOutput::Value(Value::Null)))
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register_task(noop("movies.AllMoviesTask"))
            .register_task(noop("movies.RatingsTask"))
            .register_task(noop("movies.BaseTask").abstract_task())
            .register_task(noop("features.VectorsTask"));
        registry
    }

    #[test]
    fn test_select_exact() {
        let registry = registry();
        let specs = registry.select("cfg", "movies.AllMoviesTask").unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name(), "all_movies");
    }

    #[test]
    fn test_select_wildcard_skips_abstract() {
        let registry = registry();
        let specs = registry.select("cfg", "movies.*").unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.key().to_string()).collect();
        assert_eq!(names, vec!["movies.AllMoviesTask", "movies.RatingsTask"]);
    }

    #[test]
    fn test_select_abstract_exact_fails() {
        let registry = registry();
        assert!(matches!(
            registry.select("cfg", "movies.BaseTask"),
            Err(ChainError::AbstractTask(_))
        ));
    }

    #[test]
    fn test_select_unknown_fails() {
        let registry = registry();
        assert!(matches!(
            registry.select("cfg", "movies.MissingTask"),
            Err(ChainError::UnknownTask { .. })
        ));
        assert!(matches!(
            registry.select("cfg", "missing.*"),
            Err(ChainError::UnknownTask { .. })
        ));
    }
}
