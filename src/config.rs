//! Config loading.
//!
//! A config is a small YAML or JSON document binding parameter values and
//! selecting tasks. Configs compose through `uses` references (optionally
//! namespaced with `as <ns>`), may live as parts of one multi-part file, and
//! can be amended by context overlays at load time. The loader resolves all
//! of this eagerly into an immutable [`ConfigNode`] tree, so every load-time
//! error surfaces before a chain is ever built.

use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, LazyLock};

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde_json::Value;

use crate::chain::Chain;
use crate::error::{ChainError, ConfigError};
use crate::param::ParameterObject;
use crate::registry::Registry;

/// Keys with structural meaning, rejected as task parameter names.
pub const RESERVED_PARAMETER_NAMES: &[&str] = &[
    "tasks",
    "uses",
    "excluded_tasks",
    "configs",
    "for_namespaces",
    "human_readable_data_name",
    "main_part",
];

/// Placeholder values substituted into every string of a config document.
pub type GlobalVars = BTreeMap<String, String>;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{([^{}]+)\}").unwrap());
static USE_AS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(.*) as (.*)$").unwrap());

/// One resolved config entry.
#[derive(Clone)]
pub enum ConfigValue {
    Json(Value),
    Object(Arc<dyn ParameterObject>),
}

impl std::fmt::Debug for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValue::Json(value) => write!(f, "{value}"),
            ConfigValue::Object(object) => write!(f, "{}", object.repr()),
        }
    }
}

/// Where a config document comes from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// A `.yaml` or `.json` file, optionally with a `#part` suffix.
    File(Utf8PathBuf),
    /// An in-memory mapping with an explicit name.
    Data { name: String, value: Value },
}

/// Where a context overlay comes from.
#[derive(Debug, Clone)]
pub enum ContextSource {
    /// A config-format file applied as an overlay.
    File(Utf8PathBuf),
    /// An in-memory mapping applied as an overlay.
    Data(Value),
}

impl From<&str> for ContextSource {
    fn from(path: &str) -> Self {
        ContextSource::File(path.into())
    }
}

impl From<Value> for ContextSource {
    fn from(value: Value) -> Self {
        ContextSource::Data(value)
    }
}

/// One node of the loaded config tree. Immutable after load.
pub struct ConfigNode {
    name: String,
    namespace: Option<String>,
    data: BTreeMap<String, ConfigValue>,
    uses: Vec<Arc<ConfigNode>>,
    filepath: Option<Utf8PathBuf>,
    repr_name: String,
}

impl ConfigNode {
    /// Name of this config, `<stem>#<part>` for parts of multi-part files.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace assigned through the `as` clauses on the `uses` path that
    /// reached this node.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Name with namespace, `<namespace>::<name>`.
    pub fn fullname(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}::{}", self.name),
            None => self.name.clone(),
        }
    }

    /// Unique identity of this node within one load, used to deduplicate
    /// diamond-shaped `uses` graphs.
    pub(crate) fn repr_name(&self) -> &str {
        &self.repr_name
    }

    /// The file this node was loaded from, if any.
    pub fn filepath(&self) -> Option<&Utf8Path> {
        self.filepath.as_deref()
    }

    /// Direct children declared through `uses`, in declaration order.
    pub fn uses(&self) -> &[Arc<ConfigNode>] {
        &self.uses
    }

    /// Look up a key in this node only.
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.data.get(key)
    }

    /// Look up a key in this node and then breadth-first through every node
    /// reachable via `uses`. The nearest definition wins.
    pub fn resolve(&self, key: &str) -> Option<&ConfigValue> {
        let mut queue: std::collections::VecDeque<&ConfigNode> = std::collections::VecDeque::new();
        queue.push_back(self);
        while let Some(node) = queue.pop_front() {
            if let Some(value) = node.data.get(key) {
                return Some(value);
            }
            for child in &node.uses {
                queue.push_back(child);
            }
        }
        None
    }

    /// The `human_readable_data_name` binding, if declared.
    pub fn human_readable_data_name(&self) -> Option<&str> {
        match self.data.get("human_readable_data_name") {
            Some(ConfigValue::Json(Value::String(name))) => Some(name),
            _ => None,
        }
    }

    pub(crate) fn selectors(&self, field: &str) -> Result<Vec<String>, ConfigError> {
        match self.data.get(field) {
            None => Ok(vec![]),
            Some(ConfigValue::Json(value)) => {
                string_or_list(value).ok_or_else(|| ConfigError::MalformedField {
                    config: self.fullname(),
                    field: field.to_string(),
                })
            }
            Some(ConfigValue::Object(_)) => Err(ConfigError::MalformedField {
                config: self.fullname(),
                field: field.to_string(),
            }),
        }
    }

    /// Parameter keys bound by this node, reserved keys excluded.
    pub fn parameter_keys(&self) -> impl Iterator<Item = &str> {
        self.data
            .keys()
            .map(String::as_str)
            .filter(|key| !RESERVED_PARAMETER_NAMES.contains(key))
    }
}

impl std::fmt::Debug for ConfigNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<config: {}>", self.fullname())
    }
}

/// A fully loaded config, the entry point for building a [`Chain`].
///
/// Holds the root [`ConfigNode`], the flattened set of every node reachable
/// through `uses`, the artifact root and the registry the chain will draw
/// task specs from.
pub struct Config {
    base_dir: Utf8PathBuf,
    registry: Arc<Registry>,
    root: Arc<ConfigNode>,
    nodes: Vec<Arc<ConfigNode>>,
    context_name: Option<String>,
}

impl Config {
    /// Start building a config against an artifact root and a registry.
    pub fn builder(base_dir: impl Into<Utf8PathBuf>, registry: &Arc<Registry>) -> ConfigBuilder {
        ConfigBuilder {
            base_dir: base_dir.into(),
            registry: registry.clone(),
            global_vars: GlobalVars::new(),
            context: Vec::new(),
            namespace: None,
            part: None,
        }
    }

    /// Load a config file with no global vars and no context.
    pub fn from_file(
        base_dir: impl Into<Utf8PathBuf>,
        registry: &Arc<Registry>,
        path: impl AsRef<Utf8Path>,
    ) -> Result<Self, ConfigError> {
        Self::builder(base_dir, registry).load_file(path)
    }

    /// Name of the root config.
    pub fn name(&self) -> &str {
        self.root.name()
    }

    /// Name of the active context overlay, if any.
    pub fn context_name(&self) -> Option<&str> {
        self.context_name.as_deref()
    }

    /// The artifact root all task data lives under.
    pub fn base_dir(&self) -> &Utf8Path {
        &self.base_dir
    }

    pub fn root(&self) -> &Arc<ConfigNode> {
        &self.root
    }

    /// Every node of the tree in discovery order, deduplicated.
    pub fn nodes(&self) -> &[Arc<ConfigNode>] {
        &self.nodes
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Assemble a chain from this config.
    pub fn chain(&self) -> Result<Chain, ChainError> {
        Chain::build(self, true)
    }

    /// Assemble a chain, artifact names taken from config names instead of
    /// fingerprints when `parameter_mode` is off.
    pub fn chain_with_mode(&self, parameter_mode: bool) -> Result<Chain, ChainError> {
        Chain::build(self, parameter_mode)
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<config: {}>", self.root.fullname())
    }
}

/// Builder for [`Config`], collecting global vars, context overlays, an
/// optional namespace and an optional multi-part selector before loading.
pub struct ConfigBuilder {
    base_dir: Utf8PathBuf,
    registry: Arc<Registry>,
    global_vars: GlobalVars,
    context: Vec<ContextSource>,
    namespace: Option<String>,
    part: Option<String>,
}

impl ConfigBuilder {
    /// Replace the whole placeholder map.
    pub fn global_vars(mut self, vars: GlobalVars) -> Self {
        self.global_vars = vars;
        self
    }

    /// Add one placeholder binding.
    pub fn global_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.global_vars.insert(key.into(), value.into());
        self
    }

    /// Add a context overlay. Later overlays win on conflicting keys.
    pub fn context(mut self, source: impl Into<ContextSource>) -> Self {
        self.context.push(source.into());
        self
    }

    /// Namespace assigned to the root config.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Part selector for multi-part files.
    pub fn part(mut self, part: impl Into<String>) -> Self {
        self.part = Some(part.into());
        self
    }

    /// Load from a file path, `.yaml` or `.json`, optionally `path#part`.
    pub fn load_file(self, path: impl AsRef<Utf8Path>) -> Result<Config, ConfigError> {
        let source = ConfigSource::File(path.as_ref().to_path_buf());
        self.load(source)
    }

    /// Load from an in-memory mapping under an explicit name.
    pub fn load_data(self, name: impl Into<String>, value: Value) -> Result<Config, ConfigError> {
        let source = ConfigSource::Data {
            name: name.into(),
            value,
        };
        self.load(source)
    }

    /// Load from any [`ConfigSource`].
    pub fn load(self, source: ConfigSource) -> Result<Config, ConfigError> {
        let overlay = Overlay::prepare(&self.context, &self.global_vars)?;
        let mut loader = Loader {
            registry: &self.registry.clone(),
            global_vars: &self.global_vars,
            overlay: overlay.as_ref(),
            visiting: Vec::new(),
            loaded: BTreeMap::new(),
            order: Vec::new(),
        };
        let root = loader.load_source(&source, self.namespace.clone(), self.part.clone())?;
        Ok(Config {
            base_dir: self.base_dir,
            registry: self.registry,
            root,
            nodes: loader.order,
            context_name: overlay.map(|o| o.name),
        })
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

struct Loader<'a> {
    registry: &'a Arc<Registry>,
    global_vars: &'a GlobalVars,
    overlay: Option<&'a Overlay>,
    /// repr names on the current `uses` path, for cycle detection
    visiting: Vec<String>,
    loaded: BTreeMap<String, Arc<ConfigNode>>,
    order: Vec<Arc<ConfigNode>>,
}

impl Loader<'_> {
    fn load_source(
        &mut self,
        source: &ConfigSource,
        namespace: Option<String>,
        part: Option<String>,
    ) -> Result<Arc<ConfigNode>, ConfigError> {
        match source {
            ConfigSource::File(path) => self.load_file(path, namespace, part),
            ConfigSource::Data { name, value } => {
                let repr_name = qualified(&namespace, name);
                self.build_node(value.clone(), name.clone(), None, part, namespace, repr_name)
            }
        }
    }

    fn load_file(
        &mut self,
        path: &Utf8Path,
        namespace: Option<String>,
        part: Option<String>,
    ) -> Result<Arc<ConfigNode>, ConfigError> {
        // A `#part` suffix on the path wins over the separately passed part.
        let (path, part) = match path.as_str().split_once('#') {
            Some((file, part)) => (Utf8PathBuf::from(file), Some(part.to_string())),
            None => (path.to_path_buf(), part),
        };

        let mut repr_name = qualified(&namespace, path.as_str());
        if let Some(part) = &part {
            repr_name = format!("{repr_name}#{part}");
        }
        if let Some(node) = self.loaded.get(&repr_name) {
            return Ok(node.clone());
        }
        if self.visiting.contains(&repr_name) {
            let mut cycle = self.visiting.clone();
            cycle.push(repr_name);
            return Err(ConfigError::UseCycle(cycle));
        }

        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let raw: Value = match path.extension() {
            Some("json") => {
                serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
                    path: path.clone(),
                    message: e.to_string(),
                })?
            }
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
                    path: path.clone(),
                    message: e.to_string(),
                })?
            }
            _ => return Err(ConfigError::UnknownExtension(path)),
        };

        let name = path
            .file_stem()
            .map(str::to_string)
            .ok_or_else(|| ConfigError::MissingName {
                config: path.to_string(),
            })?;

        self.build_node(raw, name, Some(path), part, namespace, repr_name)
    }

    fn build_node(
        &mut self,
        raw: Value,
        mut name: String,
        filepath: Option<Utf8PathBuf>,
        part: Option<String>,
        namespace: Option<String>,
        repr_name: String,
    ) -> Result<Arc<ConfigNode>, ConfigError> {
        if let Some(node) = self.loaded.get(&repr_name) {
            return Ok(node.clone());
        }

        let mut map = match raw {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            _ => {
                return Err(ConfigError::Parse {
                    path: filepath.unwrap_or_else(|| name.clone().into()),
                    message: "config root has to be a mapping".to_string(),
                })
            }
        };

        // Multi-part files keep every part under `configs`, one part may be
        // marked `main_part` to serve as the default.
        if map.contains_key("configs") {
            let (part, part_map) = self.select_part(map, &name, part.as_deref())?;
            map = part_map;
            name = format!("{name}#{part}");
            if let Some(filepath) = &filepath {
                rewrite_part_uses(&mut map, filepath);
            }
        }

        if let Some(overlay) = self.overlay {
            overlay.apply(&mut map, namespace.as_deref());
        }

        let mut value = Value::Object(map);
        substitute(&name, self.global_vars, &mut value)?;
        let map = match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        };

        let node_label = qualified(&namespace, &name);
        for field in ["uses", "tasks", "excluded_tasks"] {
            if let Some(value) = map.get(field) {
                if string_or_list(value).is_none() {
                    return Err(ConfigError::MalformedField {
                        config: node_label.clone(),
                        field: field.to_string(),
                    });
                }
            }
        }

        // Children first, the node is immutable once assembled.
        self.visiting.push(repr_name.clone());
        let mut uses = Vec::new();
        for entry in map
            .get("uses")
            .and_then(string_or_list)
            .unwrap_or_default()
        {
            let (reference, as_ns) = parse_use(&entry);
            let child_namespace = match (&namespace, as_ns) {
                (Some(ns), Some(sub)) => Some(format!("{ns}::{sub}")),
                (Some(ns), None) => Some(ns.clone()),
                (None, sub) => sub,
            };
            let reference = resolve_relative(&reference, filepath.as_deref());
            uses.push(self.load_file(&reference, child_namespace, None)?);
        }
        self.visiting.pop();

        let mut data = BTreeMap::new();
        for (key, value) in map {
            if key == "uses" {
                continue;
            }
            let value = self.instantiate_objects(&node_label, &key, value)?;
            data.insert(key, value);
        }

        let node = Arc::new(ConfigNode {
            name,
            namespace,
            data,
            uses,
            filepath,
            repr_name: repr_name.clone(),
        });
        self.loaded.insert(repr_name, node.clone());
        self.order.push(node.clone());
        Ok(node)
    }

    fn select_part(
        &self,
        map: serde_json::Map<String, Value>,
        name: &str,
        part: Option<&str>,
    ) -> Result<(String, serde_json::Map<String, Value>), ConfigError> {
        if map.len() != 1 {
            return Err(ConfigError::MalformedMultiPart {
                config: name.to_string(),
            });
        }
        let parts = match &map["configs"] {
            Value::Object(parts) => parts,
            _ => {
                return Err(ConfigError::MalformedMultiPart {
                    config: name.to_string(),
                })
            }
        };

        let selected = match part {
            Some(part) => parts.get_key_value(part).ok_or_else(|| ConfigError::MissingPart {
                config: name.to_string(),
                part: part.to_string(),
            })?,
            None => {
                let mut main = None;
                for (part_name, part_data) in parts {
                    if part_data.get("main_part") == Some(&Value::Bool(true)) {
                        if main.is_some() {
                            return Err(ConfigError::MultipleMainParts {
                                config: name.to_string(),
                            });
                        }
                        main = Some((part_name, part_data));
                    }
                }
                main.ok_or_else(|| ConfigError::NoMainPart {
                    config: name.to_string(),
                })?
            }
        };

        let mut part_map = match selected.1 {
            Value::Object(map) => map.clone(),
            _ => {
                return Err(ConfigError::MalformedMultiPart {
                    config: name.to_string(),
                })
            }
        };
        part_map.remove("main_part");
        Ok((selected.0.clone(), part_map))
    }

    fn instantiate_objects(
        &self,
        config: &str,
        key: &str,
        value: Value,
    ) -> Result<ConfigValue, ConfigError> {
        let spec = match &value {
            Value::Object(map) if map.contains_key("class") => map,
            _ => return Ok(ConfigValue::Json(value)),
        };

        let class = spec["class"]
            .as_str()
            .ok_or_else(|| ConfigError::BadObjectSpec {
                config: config.to_string(),
                key: key.to_string(),
                message: "`class` has to be a string".to_string(),
            })?;
        let args = match spec.get("args") {
            None => Vec::new(),
            Some(Value::Array(args)) => args.clone(),
            Some(_) => {
                return Err(ConfigError::BadObjectSpec {
                    config: config.to_string(),
                    key: key.to_string(),
                    message: "`args` has to be a list".to_string(),
                })
            }
        };
        let kwargs = match spec.get("kwargs") {
            None => serde_json::Map::new(),
            Some(Value::Object(kwargs)) => kwargs.clone(),
            Some(_) => {
                return Err(ConfigError::BadObjectSpec {
                    config: config.to_string(),
                    key: key.to_string(),
                    message: "`kwargs` has to be a mapping".to_string(),
                })
            }
        };

        let factory =
            self.registry
                .object_factory(class)
                .ok_or_else(|| ConfigError::UnknownObjectClass {
                    config: config.to_string(),
                    class: class.to_string(),
                })?;
        let object = factory(&args, &kwargs).map_err(|error| ConfigError::ObjectInit {
            config: config.to_string(),
            class: class.to_string(),
            error,
        })?;
        Ok(ConfigValue::Object(object))
    }
}

// ---------------------------------------------------------------------------
// Context overlays
// ---------------------------------------------------------------------------

/// A prepared context overlay: plain overrides applied to every node plus
/// per-namespace overrides applied only where the namespace matches.
pub(crate) struct Overlay {
    name: String,
    data: BTreeMap<String, Value>,
    for_namespaces: BTreeMap<String, BTreeMap<String, Value>>,
}

impl Overlay {
    /// Compose overlays from the given sources, later sources win.
    pub(crate) fn prepare(
        sources: &[ContextSource],
        global_vars: &GlobalVars,
    ) -> Result<Option<Overlay>, ConfigError> {
        if sources.is_empty() {
            return Ok(None);
        }
        let mut merged = Overlay {
            name: String::new(),
            data: BTreeMap::new(),
            for_namespaces: BTreeMap::new(),
        };
        let mut names = Vec::new();
        for source in sources {
            let overlay = Self::load_one(source, None, global_vars)?;
            names.push(overlay.name.clone());
            merged.merge(overlay);
        }
        merged.name = names.join(";");
        Ok(Some(merged))
    }

    fn load_one(
        source: &ContextSource,
        namespace: Option<&str>,
        global_vars: &GlobalVars,
    ) -> Result<Overlay, ConfigError> {
        let (name, raw) = match source {
            ContextSource::File(path) => {
                let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                let raw: Value = match path.extension() {
                    Some("json") => serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
                        path: path.clone(),
                        message: e.to_string(),
                    })?,
                    Some("yaml") | Some("yml") => {
                        serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
                            path: path.clone(),
                            message: e.to_string(),
                        })?
                    }
                    _ => return Err(ConfigError::UnknownExtension(path.clone())),
                };
                let name = path.file_stem().unwrap_or(path.as_str()).to_string();
                (name, raw)
            }
            ContextSource::Data(value) => {
                let name = match value {
                    Value::Object(map) => {
                        let pairs: Vec<_> = map.iter().map(|(k, v)| format!("{k}:{v}")).collect();
                        format!("dict_context({})", pairs.join(","))
                    }
                    _ => "dict_context".to_string(),
                };
                (name, value.clone())
            }
        };

        let map = match raw {
            Value::Object(map) => map,
            _ => {
                return Err(ConfigError::MalformedOverlay {
                    context: name,
                    message: "overlay root has to be a mapping".to_string(),
                })
            }
        };

        let mut overlay = Overlay {
            name: name.clone(),
            data: BTreeMap::new(),
            for_namespaces: BTreeMap::new(),
        };
        let mut nested_uses = Vec::new();

        for (key, value) in map {
            match key.as_str() {
                "uses" => {
                    let entries =
                        string_or_list(&value).ok_or_else(|| ConfigError::MalformedOverlay {
                            context: name.clone(),
                            message: "`uses` has to be a string or a list of strings".to_string(),
                        })?;
                    nested_uses.extend(entries);
                }
                "for_namespaces" => {
                    let Value::Object(spaces) = value else {
                        return Err(ConfigError::MalformedOverlay {
                            context: name.clone(),
                            message: "`for_namespaces` has to be a mapping".to_string(),
                        });
                    };
                    for (space, data) in spaces {
                        let Value::Object(data) = data else {
                            return Err(ConfigError::MalformedOverlay {
                                context: name.clone(),
                                message: format!("namespace overlay '{space}' has to be a mapping"),
                            });
                        };
                        let space = match namespace {
                            Some(ns) => format!("{ns}::{space}"),
                            None => space,
                        };
                        overlay
                            .for_namespaces
                            .entry(space)
                            .or_default()
                            .extend(data);
                    }
                }
                key if RESERVED_PARAMETER_NAMES.contains(&key) => {
                    return Err(ConfigError::ReservedKey {
                        key: key.to_string(),
                    })
                }
                _ => {
                    overlay.data.insert(key, value);
                }
            }
        }

        // A namespaced overlay scopes its own plain keys to that namespace.
        if let Some(ns) = namespace {
            let scoped = std::mem::take(&mut overlay.data);
            overlay
                .for_namespaces
                .entry(ns.to_string())
                .or_default()
                .extend(scoped);
        }

        // Overlays referenced through `uses` are loaded on top, later wins.
        for entry in nested_uses {
            let mut entry = entry;
            let mut value = Value::String(entry);
            substitute(&name, global_vars, &mut value)?;
            entry = match value {
                Value::String(s) => s,
                _ => unreachable!(),
            };
            let (reference, as_ns) = parse_use(&entry);
            let sub_namespace = match (namespace, as_ns) {
                (Some(ns), Some(sub)) => Some(format!("{ns}::{sub}")),
                (Some(ns), None) => Some(ns.to_string()),
                (None, sub) => sub,
            };
            let child = Self::load_one(
                &ContextSource::File(reference),
                sub_namespace.as_deref(),
                global_vars,
            )?;
            overlay.merge(child);
        }

        Ok(overlay)
    }

    fn merge(&mut self, other: Overlay) {
        self.data.extend(other.data);
        for (space, values) in other.for_namespaces {
            self.for_namespaces.entry(space).or_default().extend(values);
        }
        if self.name.is_empty() {
            self.name = other.name;
        }
    }

    fn apply(&self, map: &mut serde_json::Map<String, Value>, namespace: Option<&str>) {
        for (key, value) in &self.data {
            map.insert(key.clone(), value.clone());
        }
        if let Some(namespace) = namespace {
            if let Some(values) = self.for_namespaces.get(namespace) {
                for (key, value) in values {
                    map.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn qualified(namespace: &Option<String>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}::{name}"),
        None => name.to_string(),
    }
}

/// Split a `uses` entry into its reference and the optional `as` namespace.
fn parse_use(entry: &str) -> (Utf8PathBuf, Option<String>) {
    match USE_AS.captures(entry) {
        Some(captures) => (
            Utf8PathBuf::from(captures[1].trim()),
            Some(captures[2].trim().to_string()),
        ),
        None => (Utf8PathBuf::from(entry.trim()), None),
    }
}

/// Relative `uses` references resolve against the directory of the file that
/// declares them.
fn resolve_relative(reference: &Utf8Path, parent: Option<&Utf8Path>) -> Utf8PathBuf {
    if reference.is_absolute() || reference.as_str().starts_with('#') {
        return reference.to_path_buf();
    }
    match parent.and_then(Utf8Path::parent) {
        Some(dir) => dir.join(reference),
        None => reference.to_path_buf(),
    }
}

/// Rewrite `#part`-only `uses` entries to `<filepath>#part`, valid only
/// inside multi-part files where the sibling part is unambiguous.
fn rewrite_part_uses(map: &mut serde_json::Map<String, Value>, filepath: &Utf8Path) {
    let Some(Value::Array(uses)) = map.get_mut("uses") else {
        if let Some(Value::String(entry)) = map.get_mut("uses") {
            if entry.starts_with('#') {
                *entry = format!("{filepath}{entry}");
            }
        }
        return;
    };
    for entry in uses {
        if let Value::String(entry) = entry {
            if entry.starts_with('#') {
                *entry = format!("{filepath}{entry}");
            }
        }
    }
}

fn string_or_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(entry) => Some(vec![entry.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => None,
    }
}

/// Replace every `{NAME}` token in every string of the tree. An unresolved
/// token fails the load.
fn substitute(config: &str, vars: &GlobalVars, value: &mut Value) -> Result<(), ConfigError> {
    match value {
        Value::String(text) => {
            if PLACEHOLDER.is_match(text) {
                let mut out = String::with_capacity(text.len());
                let mut last = 0;
                for captures in PLACEHOLDER.captures_iter(text) {
                    let whole = captures.get(0).unwrap();
                    let token = &captures[1];
                    let replacement =
                        vars.get(token)
                            .ok_or_else(|| ConfigError::UnresolvedPlaceholder {
                                config: config.to_string(),
                                token: token.to_string(),
                            })?;
                    out.push_str(&text[last..whole.start()]);
                    out.push_str(replacement);
                    last = whole.end();
                }
                out.push_str(&text[last..]);
                *text = out;
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute(config, vars, item)?;
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute(config, vars, item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_use() {
        let (path, ns) = parse_use("configs/foo.yaml as train");
        assert_eq!(path, Utf8PathBuf::from("configs/foo.yaml"));
        assert_eq!(ns.as_deref(), Some("train"));

        let (path, ns) = parse_use("configs/foo.yaml");
        assert_eq!(path, Utf8PathBuf::from("configs/foo.yaml"));
        assert_eq!(ns, None);
    }

    #[test]
    fn test_substitute() {
        let vars = GlobalVars::from([("DATA_DIR".to_string(), "/data".to_string())]);
        let mut value = json!({"path": "{DATA_DIR}/raw", "n": 3, "nested": ["{DATA_DIR}"]});
        substitute("test", &vars, &mut value).unwrap();
        assert_eq!(value["path"], json!("/data/raw"));
        assert_eq!(value["nested"][0], json!("/data"));
    }

    #[test]
    fn test_substitute_unresolved() {
        let vars = GlobalVars::new();
        let mut value = json!({"path": "{MISSING}/raw"});
        let err = substitute("test", &vars, &mut value).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnresolvedPlaceholder { token, .. } if token == "MISSING"
        ));
    }

    #[test]
    fn test_string_or_list() {
        assert_eq!(string_or_list(&json!("a")), Some(vec!["a".to_string()]));
        assert_eq!(
            string_or_list(&json!(["a", "b"])),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(string_or_list(&json!(5)), None);
        assert_eq!(string_or_list(&json!(["a", 5])), None);
    }
}
