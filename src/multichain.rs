//! The multichain coordinator.
//!
//! A multichain builds several chains and collapses task instances that
//! compute the same fingerprint into one shared object, so a value computed
//! for one chain serves every other chain in the same process.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::Arc;

use camino::Utf8Path;

use crate::chain::Chain;
use crate::config::Config;
use crate::error::{ChainError, ConfigError};
use crate::registry::Registry;
use crate::task::TaskInstance;

/// Several chains sharing task instances by fingerprint. Member chains are
/// indexed by their root config's name.
pub struct MultiChain {
    chains: BTreeMap<String, Chain>,
}

impl MultiChain {
    /// Build a chain per config and merge equal-fingerprint instances.
    pub fn new(configs: &[Config]) -> Result<Self, ChainError> {
        Self::with_mode(configs, true)
    }

    /// Build a multichain from every config file in a directory, in name
    /// order.
    pub fn from_dir(
        base_dir: impl Into<camino::Utf8PathBuf>,
        registry: &Arc<Registry>,
        dir: impl AsRef<Utf8Path>,
    ) -> Result<Self, ChainError> {
        let dir = dir.as_ref();
        let base_dir = base_dir.into();
        let entries = fs::read_dir(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter_map(|path| camino::Utf8PathBuf::from_path_buf(path).ok())
            .collect();
        paths.sort();

        let mut configs = Vec::with_capacity(paths.len());
        for path in paths {
            configs.push(Config::from_file(base_dir.clone(), registry, path)?);
        }
        Self::new(&configs)
    }

    /// As [`new`](MultiChain::new), with parameter mode set explicitly for
    /// every member. Mixing modes is not representable, artifact sharing
    /// would be undefined across them.
    pub fn with_mode(configs: &[Config], parameter_mode: bool) -> Result<Self, ChainError> {
        let mut chains = BTreeMap::new();
        let mut shared: BTreeMap<(String, String), Arc<TaskInstance>> = BTreeMap::new();

        for config in configs {
            if chains.contains_key(config.name()) {
                return Err(ChainError::DuplicateChainName(config.name().to_string()));
            }
            let mut chain = Chain::build(config, parameter_mode)?;
            merge_shared(&mut chain, &mut shared)?;
            chains.insert(config.name().to_string(), chain);
        }

        Ok(Self { chains })
    }

    /// A member chain by its config name.
    pub fn get(&self, name: &str) -> Result<&Chain, ChainError> {
        self.chains
            .get(name)
            .ok_or_else(|| ChainError::TaskNotFound(name.to_string()))
    }

    /// The alphabetically last chain whose name contains the filter. With no
    /// filter, simply the last chain. Useful when config names embed dates.
    pub fn latest(&self, filter: Option<&str>) -> Option<&Chain> {
        self.chains
            .iter()
            .rev()
            .find(|(name, _)| filter.map_or(true, |f| name.contains(f)))
            .map(|(_, chain)| chain)
    }

    /// Pass a force to every member chain. Chains without a matching task
    /// are skipped.
    pub fn force<'a>(
        &self,
        tasks: impl IntoIterator<Item = &'a str>,
        recompute: bool,
        delete_data: bool,
    ) -> Result<(), ChainError> {
        let tasks: Vec<&str> = tasks.into_iter().collect();
        for chain in self.chains.values() {
            let present: Vec<&str> = tasks
                .iter()
                .copied()
                .filter(|task| chain.get(task).is_ok())
                .collect();
            chain.force(present, recompute, delete_data)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Member chains in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Chain)> {
        self.chains.iter().map(|(name, chain)| (name.as_str(), chain))
    }
}

impl std::fmt::Debug for MultiChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "multichain:")?;
        for name in self.chains.keys() {
            write!(f, "\n - {name}")?;
        }
        Ok(())
    }
}

/// Replace instances of `chain` that compute an already known fingerprint
/// with the shared instance, then refresh the chain's input links.
///
/// The walk is topological, an instance's fingerprint only depends on
/// instances already visited. Replaced instances keep the wiring of the chain
/// they came from, which stays alive inside the same multichain.
fn merge_shared(
    chain: &mut Chain,
    shared: &mut BTreeMap<(String, String), Arc<TaskInstance>>,
) -> Result<(), ChainError> {
    let mut replaced = BTreeSet::new();

    for name in chain.topological_order() {
        let instance = chain.tasks()[&name].clone();
        let key = (instance.slugname(), instance.persist_name()?);
        match shared.get(&key) {
            Some(existing) => {
                if !Arc::ptr_eq(existing, &instance) {
                    chain.replace_task(&name, existing.clone());
                    replaced.insert(name);
                }
            }
            None => {
                shared.insert(key, instance);
            }
        }
    }

    chain.relink(&replaced);
    Ok(())
}
