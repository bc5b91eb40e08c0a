//! Startup-time construction of extensions from `[[extensions]]` entries.
//!
//! Each module reference in configuration names a factory in a
//! [`FactoryTable`]. Factories receive their collaborators explicitly through
//! [`Services`]; nothing is resolved from global state.

use std::collections::HashMap;
use std::sync::Arc;

use palaver_channels::PlatformDispatcher;
use palaver_context::ConversationContextStore;
use palaver_core::config::ExtensionConfig;
use palaver_core::{CommandSink, InboundSink, KnowledgeBackend, PalaverConfig, PalaverError, Result};
use serde_json::Value;
use tracing::info;

use crate::builtin;
use crate::registry::{ExtensionDescriptor, ExtensionRegistry};
use crate::stage::Extension;

/// Collaborators an extension factory may capture.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<PalaverConfig>,
    pub store: Arc<ConversationContextStore>,
    pub dispatcher: Arc<PlatformDispatcher>,
    pub knowledge: Option<Arc<dyn KnowledgeBackend>>,
    pub commands: CommandSink,
    pub inbound: InboundSink,
}

/// What a factory sees for one `[[extensions]]` entry.
pub struct FactoryContext<'a> {
    pub module: &'a str,
    pub options: &'a Value,
    pub services: &'a Services,
}

impl FactoryContext<'_> {
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(Value::as_u64)
    }

    pub fn option_bool(&self, key: &str) -> bool {
        self.options.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn option_strings(&self, key: &str) -> Vec<String> {
        self.options
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A required string option, or a `ConfigurationError` naming it.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.option_str(key).ok_or_else(|| {
            PalaverError::config(format!("module {} requires option '{key}'", self.module))
        })
    }
}

pub type ExtensionFactory = Box<dyn Fn(&FactoryContext<'_>) -> Result<Extension> + Send + Sync>;

/// Module reference → constructor.
#[derive(Default)]
pub struct FactoryTable {
    factories: HashMap<String, ExtensionFactory>,
}

impl FactoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table pre-loaded with every `builtin.*` module.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        builtin::register_all(&mut table);
        table
    }

    pub fn register<F>(&mut self, module: impl Into<String>, factory: F)
    where
        F: Fn(&FactoryContext<'_>) -> Result<Extension> + Send + Sync + 'static,
    {
        self.factories.insert(module.into(), Box::new(factory));
    }

    pub fn contains(&self, module: &str) -> bool {
        self.factories.contains_key(module)
    }

    /// Instantiate one configured extension into a descriptor.
    pub fn instantiate(&self, cfg: &ExtensionConfig, services: &Services) -> Result<ExtensionDescriptor> {
        let kind = cfg.parsed_kind()?;
        let factory = self.factories.get(&cfg.module).ok_or_else(|| {
            PalaverError::config(format!("unknown extension module '{}'", cfg.module))
        })?;
        let ctx = FactoryContext {
            module: &cfg.module,
            options: &cfg.options,
            services,
        };
        let extension = factory(&ctx)?;
        Ok(ExtensionDescriptor::new(kind, cfg.module.clone(), extension)
            .for_platforms(cfg.platforms.iter().map(String::as_str)))
    }

    /// Build the registry from `services.config.extensions`, in file order.
    pub fn build_registry(&self, services: &Services) -> Result<ExtensionRegistry> {
        let mut builder = ExtensionRegistry::builder();
        for cfg in &services.config.extensions {
            builder.register(self.instantiate(cfg, services)?)?;
            info!(kind = %cfg.kind, module = %cfg.module, platforms = ?cfg.platforms, "extension loaded");
        }
        Ok(builder.build())
    }
}
