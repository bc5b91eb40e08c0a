use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use palaver_core::{ExtensionKind, PalaverError, Platform, Result};
use tracing::{debug, info};

use crate::stage::{
    CpExtension, CtExtension, CtxExtension, Extension, FwExtension, IpcExtension, MhExtension,
    RagExtension, RppExtension,
};

/// One registered extension.
#[derive(Debug, Clone)]
pub struct ExtensionDescriptor {
    pub kind: ExtensionKind,
    /// Factory key the extension was built from.
    pub module: String,
    /// Target platforms; empty means every platform.
    pub platforms: Vec<Platform>,
    /// Position in configuration. Assigned by the builder.
    pub order: usize,
    pub extension: Extension,
}

impl ExtensionDescriptor {
    pub fn new(kind: ExtensionKind, module: impl Into<String>, extension: Extension) -> Self {
        Self {
            kind,
            module: module.into(),
            platforms: Vec::new(),
            order: 0,
            extension,
        }
    }

    pub fn for_platforms(mut self, platforms: impl IntoIterator<Item = impl Into<Platform>>) -> Self {
        self.platforms = platforms.into_iter().map(Into::into).collect();
        self
    }

    pub fn applies_to(&self, platform: &Platform) -> bool {
        self.platforms.is_empty() || self.platforms.contains(platform)
    }

    pub fn name(&self) -> &str {
        self.extension.name()
    }
}

/// Collects descriptors during startup. Consumed by [`build`](Self::build).
#[derive(Default)]
pub struct ExtensionRegistryBuilder {
    descriptors: Vec<ExtensionDescriptor>,
    seen: HashSet<(ExtensionKind, String)>,
    rag_keys: HashMap<String, (String, bool)>,
}

impl ExtensionRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a descriptor at the next position.
    ///
    /// Rejects a descriptor whose declared kind does not match its handle, a
    /// second descriptor for the same `(kind, module)`, and a RAG cache key
    /// already owned by another extension unless both opted into sharing.
    pub fn register(&mut self, mut descriptor: ExtensionDescriptor) -> Result<()> {
        let actual = descriptor.extension.kind();
        if descriptor.kind != actual {
            return Err(PalaverError::config(format!(
                "module {} is declared as {} but implements {}",
                descriptor.module, descriptor.kind, actual
            )));
        }

        if !self.seen.insert((descriptor.kind, descriptor.module.clone())) {
            return Err(PalaverError::config(format!(
                "duplicate {} extension {}",
                descriptor.kind, descriptor.module
            )));
        }

        if let Extension::Rag(rag) = &descriptor.extension {
            let key = rag.cache_key().to_string();
            let shared = rag.shared_cache();
            if let Some((owner, owner_shared)) = self.rag_keys.get(&key) {
                if !(shared && *owner_shared) {
                    return Err(PalaverError::config(format!(
                        "RAG cache key '{key}' of {} collides with {owner}",
                        descriptor.module
                    )));
                }
            } else {
                self.rag_keys.insert(key, (descriptor.module.clone(), shared));
            }
        }

        descriptor.order = self.descriptors.len();
        debug!(
            kind = %descriptor.kind,
            module = %descriptor.module,
            order = descriptor.order,
            "extension registered"
        );
        self.descriptors.push(descriptor);
        Ok(())
    }

    pub fn build(self) -> ExtensionRegistry {
        let mut stages: HashMap<ExtensionKind, Vec<ExtensionDescriptor>> = HashMap::new();
        for d in self.descriptors {
            stages.entry(d.kind).or_default().push(d);
        }
        let registry = ExtensionRegistry { stages };
        info!(total = registry.len(), "extension registry built");
        registry
    }
}

/// Immutable map from stage kind to descriptors in configuration order.
///
/// Built once at startup; every method takes `&self`, so it is shared across
/// pipelines as `Arc<ExtensionRegistry>` without locking.
#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    stages: HashMap<ExtensionKind, Vec<ExtensionDescriptor>>,
}

impl ExtensionRegistry {
    pub fn builder() -> ExtensionRegistryBuilder {
        ExtensionRegistryBuilder::new()
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stages.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every descriptor of `kind`, regardless of platform.
    pub fn all(&self, kind: ExtensionKind) -> &[ExtensionDescriptor] {
        self.stages.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Descriptors of `kind` that apply to `platform`, in registration order.
    /// An empty result means the stage is a no-op.
    pub fn select<'a>(
        &'a self,
        kind: ExtensionKind,
        platform: &'a Platform,
    ) -> impl Iterator<Item = &'a ExtensionDescriptor> + 'a {
        self.all(kind).iter().filter(move |d| d.applies_to(platform))
    }

    pub fn fw(&self) -> Vec<Arc<dyn FwExtension>> {
        self.all(ExtensionKind::Fw)
            .iter()
            .filter_map(|d| match &d.extension {
                Extension::Fw(e) => Some(Arc::clone(e)),
                _ => None,
            })
            .collect()
    }

    pub fn ipc(&self) -> Vec<Arc<dyn IpcExtension>> {
        self.all(ExtensionKind::Ipc)
            .iter()
            .filter_map(|d| match &d.extension {
                Extension::Ipc(e) => Some(Arc::clone(e)),
                _ => None,
            })
            .collect()
    }

    pub fn cp(&self, platform: &Platform) -> Vec<Arc<dyn CpExtension>> {
        self.select(ExtensionKind::Cp, platform)
            .filter_map(|d| match &d.extension {
                Extension::Cp(e) => Some(Arc::clone(e)),
                _ => None,
            })
            .collect()
    }

    pub fn mh(&self, platform: &Platform) -> Vec<Arc<dyn MhExtension>> {
        self.select(ExtensionKind::Mh, platform)
            .filter_map(|d| match &d.extension {
                Extension::Mh(e) => Some(Arc::clone(e)),
                _ => None,
            })
            .collect()
    }

    pub fn ctx(&self, platform: &Platform) -> Vec<Arc<dyn CtxExtension>> {
        self.select(ExtensionKind::Ctx, platform)
            .filter_map(|d| match &d.extension {
                Extension::Ctx(e) => Some(Arc::clone(e)),
                _ => None,
            })
            .collect()
    }

    pub fn rag(&self, platform: &Platform) -> Vec<Arc<dyn RagExtension>> {
        self.select(ExtensionKind::Rag, platform)
            .filter_map(|d| match &d.extension {
                Extension::Rag(e) => Some(Arc::clone(e)),
                _ => None,
            })
            .collect()
    }

    pub fn rpp(&self, platform: &Platform) -> Vec<Arc<dyn RppExtension>> {
        self.select(ExtensionKind::Rpp, platform)
            .filter_map(|d| match &d.extension {
                Extension::Rpp(e) => Some(Arc::clone(e)),
                _ => None,
            })
            .collect()
    }

    pub fn ct(&self, platform: &Platform) -> Vec<Arc<dyn CtExtension>> {
        self.select(ExtensionKind::Ct, platform)
            .filter_map(|d| match &d.extension {
                Extension::Ct(e) => Some(Arc::clone(e)),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as ExtResult;
    use crate::stage::TurnContext;
    use async_trait::async_trait;
    use palaver_core::ContextEntry;

    struct Named(&'static str);

    #[async_trait]
    impl CtxExtension for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn context_for(&self, _turn: &TurnContext<'_>) -> ExtResult<Vec<ContextEntry>> {
            Ok(vec![])
        }
    }

    struct Rag {
        key: &'static str,
        shared: bool,
    }

    #[async_trait]
    impl RagExtension for Rag {
        fn name(&self) -> &str {
            "rag"
        }

        fn cache_key(&self) -> &str {
            self.key
        }

        fn shared_cache(&self) -> bool {
            self.shared
        }

        async fn retrieve(&self, _sender: &str, _text: &str) -> ExtResult<Vec<ContextEntry>> {
            Ok(vec![])
        }
    }

    fn ctx(module: &'static str) -> ExtensionDescriptor {
        ExtensionDescriptor::new(ExtensionKind::Ctx, module, Extension::Ctx(Arc::new(Named(module))))
    }

    fn rag(module: &str, key: &'static str, shared: bool) -> ExtensionDescriptor {
        ExtensionDescriptor::new(
            ExtensionKind::Rag,
            module,
            Extension::Rag(Arc::new(Rag { key, shared })),
        )
    }

    fn names(registry: &ExtensionRegistry, platform: &str) -> Vec<String> {
        let platform = Platform::from(platform);
        registry
            .select(ExtensionKind::Ctx, &platform)
            .map(|d| d.name().to_string())
            .collect()
    }

    #[test]
    fn selection_preserves_registration_order() {
        let mut b = ExtensionRegistry::builder();
        b.register(ctx("c")).unwrap();
        b.register(ctx("a")).unwrap();
        b.register(ctx("b")).unwrap();
        let r = b.build();
        assert_eq!(names(&r, "telnet"), vec!["c", "a", "b"]);
        let orders: Vec<usize> = r.all(ExtensionKind::Ctx).iter().map(|d| d.order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
    }

    #[test]
    fn platform_filter_applies_at_selection() {
        let mut b = ExtensionRegistry::builder();
        b.register(ctx("everywhere")).unwrap();
        b.register(ctx("wa_only").for_platforms(["whatsapp"])).unwrap();
        let r = b.build();
        assert_eq!(names(&r, "telnet"), vec!["everywhere"]);
        assert_eq!(names(&r, "whatsapp"), vec!["everywhere", "wa_only"]);
        // Registry itself is untouched by filtering.
        assert_eq!(r.all(ExtensionKind::Ctx).len(), 2);
    }

    #[test]
    fn empty_stage_selects_nothing() {
        let r = ExtensionRegistry::empty();
        assert!(r.is_empty());
        assert!(r.rpp(&Platform::from("telnet")).is_empty());
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let mut b = ExtensionRegistry::builder();
        let d = ExtensionDescriptor::new(ExtensionKind::Rpp, "x", Extension::Ctx(Arc::new(Named("x"))));
        let err = b.register(d).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn duplicate_module_is_rejected() {
        let mut b = ExtensionRegistry::builder();
        b.register(ctx("persona")).unwrap();
        assert!(b.register(ctx("persona")).is_err());
    }

    #[test]
    fn rag_cache_key_collision_is_rejected() {
        let mut b = ExtensionRegistry::builder();
        b.register(rag("docs", "kb", false)).unwrap();
        assert!(b.register(rag("faq", "kb", true)).is_err());
        b.register(rag("faq", "faq", false)).unwrap();
    }

    #[test]
    fn rag_cache_key_may_be_shared_by_consent() {
        let mut b = ExtensionRegistry::builder();
        b.register(rag("docs", "kb", true)).unwrap();
        b.register(rag("faq", "kb", true)).unwrap();
        assert_eq!(b.build().rag(&Platform::from("telnet")).len(), 2);
    }
}
