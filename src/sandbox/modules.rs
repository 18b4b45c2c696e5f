//! Which modules a script may `require`, and where their sources come from.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::config::types::ModulesConfig;
use crate::error::Result;

const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuiltinPolicy {
    All,
    Only(BTreeSet<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalPolicy {
    Disabled,
    Allowed {
        modules: BTreeSet<String>,
        transitive: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Builtin,
    External,
}

/// Who is asking for a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequireOrigin {
    /// The user's script
    Script,
    /// A module the script loaded
    Module,
}

/// Allow-lists for built-in and external modules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleResolverPolicy {
    pub builtins: BuiltinPolicy,
    pub externals: ExternalPolicy,
}

impl Default for ModuleResolverPolicy {
    fn default() -> Self {
        Self {
            builtins: BuiltinPolicy::Only(BTreeSet::new()),
            externals: ExternalPolicy::Disabled,
        }
    }
}

impl ModuleResolverPolicy {
    pub fn from_config(config: &ModulesConfig) -> Self {
        let builtins = if config.builtins.iter().any(|name| name == WILDCARD) {
            BuiltinPolicy::All
        } else {
            BuiltinPolicy::Only(config.builtins.iter().map(|n| normalize_name(n)).collect())
        };

        let externals = match &config.externals {
            Some(modules) if !modules.is_empty() => ExternalPolicy::Allowed {
                modules: modules.iter().map(|n| normalize_name(n)).collect(),
                transitive: config.transitive,
            },
            _ => ExternalPolicy::Disabled,
        };

        Self {
            builtins,
            externals,
        }
    }

    pub fn permits(&self, name: &str, kind: ModuleKind, origin: RequireOrigin) -> bool {
        let name = normalize_name(name);
        match kind {
            ModuleKind::Builtin => match &self.builtins {
                BuiltinPolicy::All => true,
                BuiltinPolicy::Only(allowed) => allowed.contains(&name),
            },
            ModuleKind::External => match &self.externals {
                ExternalPolicy::Disabled => false,
                ExternalPolicy::Allowed {
                    modules,
                    transitive,
                } => {
                    modules.contains(WILDCARD)
                        || modules.contains(&name)
                        || (*transitive && origin == RequireOrigin::Module)
                }
            },
        }
    }
}

fn normalize_name(name: &str) -> String {
    let name = name.trim();
    name.strip_prefix("node:").unwrap_or(name).to_string()
}

/// A loadable CommonJS module.
#[derive(Debug, Clone)]
pub struct ModuleSource {
    pub kind: ModuleKind,
    pub source: Arc<str>,
}

/// Module sources known to the process.
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, ModuleSource>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the bundled built-in modules.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.insert("assert", ModuleKind::Builtin, include_str!("js/assert.js"));
        registry.insert("util", ModuleKind::Builtin, include_str!("js/util.js"));
        registry
    }

    pub fn insert(&mut self, name: &str, kind: ModuleKind, source: impl Into<Arc<str>>) {
        self.modules.insert(
            normalize_name(name),
            ModuleSource {
                kind,
                source: source.into(),
            },
        );
    }

    /// Register every `<name>.js` file in `dir` as an external module.
    pub fn load_externals(&mut self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("js") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let source = std::fs::read_to_string(&path)?;
            self.insert(name, ModuleKind::External, source);
            loaded += 1;
        }
        debug!(dir = %dir.display(), loaded, "Loaded external modules");
        Ok(loaded)
    }

    pub fn get(&self, name: &str) -> Option<&ModuleSource> {
        self.modules.get(&normalize_name(name))
    }
}

/// What a script may load, in the form the bootstrap consumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequirableModules {
    /// Modules the script itself may require
    pub direct: Vec<String>,
    /// Modules a loaded module may require
    pub nested: Vec<String>,
    pub sources: BTreeMap<String, String>,
}

/// Policy plus registry, shared by every sandbox of a process.
#[derive(Debug, Clone)]
pub struct ModuleResolver {
    policy: Arc<ModuleResolverPolicy>,
    registry: Arc<ModuleRegistry>,
}

impl Default for ModuleResolver {
    fn default() -> Self {
        Self::new(ModuleResolverPolicy::default(), ModuleRegistry::with_builtins())
    }
}

impl ModuleResolver {
    pub fn new(policy: ModuleResolverPolicy, registry: ModuleRegistry) -> Self {
        Self {
            policy: Arc::new(policy),
            registry: Arc::new(registry),
        }
    }

    /// Build from configuration: bundled built-ins plus the configured module directory.
    pub fn from_config(config: &ModulesConfig) -> Result<Self> {
        let mut registry = ModuleRegistry::with_builtins();
        if let Some(dir) = &config.directory {
            registry.load_externals(dir)?;
        }
        Ok(Self::new(ModuleResolverPolicy::from_config(config), registry))
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// The permitted subset of the registry. Denied modules are not shipped
    /// into the engine at all.
    pub fn requirable(&self) -> RequirableModules {
        let mut requirable = RequirableModules::default();

        for (name, module) in &self.registry.modules {
            let direct = self.policy.permits(name, module.kind, RequireOrigin::Script);
            let nested = self.policy.permits(name, module.kind, RequireOrigin::Module);
            if direct {
                requirable.direct.push(name.clone());
            }
            if nested {
                requirable.nested.push(name.clone());
            }
            if direct || nested {
                requirable
                    .sources
                    .insert(name.clone(), module.source.to_string());
            }
        }

        requirable
    }
}
