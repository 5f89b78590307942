//! Language to backend mapping.

use std::collections::HashMap;
use std::sync::Arc;

use kiln_core::Language;

use crate::{BackendContext, BuildBackend, DockerfileBackend, RuntimeBackend, SlugBackend};

/// Maps a language to the backend that builds it. Languages without an entry
/// use the fallback.
pub struct BackendRegistry {
    backends: HashMap<Language, Arc<dyn BuildBackend>>,
    fallback: Arc<dyn BuildBackend>,
}

impl BackendRegistry {
    pub fn new(fallback: Arc<dyn BuildBackend>) -> Self {
        Self {
            backends: HashMap::new(),
            fallback,
        }
    }

    /// The platform's standard backend set.
    pub fn standard(ctx: BackendContext) -> Self {
        let dockerfile: Arc<dyn BuildBackend> = Arc::new(DockerfileBackend::new(ctx.clone()));
        let runtime: Arc<dyn BuildBackend> = Arc::new(RuntimeBackend::netcore(ctx.clone()));
        let slug: Arc<dyn BuildBackend> = Arc::new(SlugBackend::new(ctx));

        let mut registry = Self::new(slug.clone());
        registry.register(Language::Dockerfile, dockerfile.clone());
        registry.register(Language::Docker, dockerfile);
        registry.register(Language::NetCore, runtime);
        for lang in [
            Language::JavaMaven,
            Language::JavaJar,
            Language::JavaWar,
            Language::Gradle,
            Language::Python,
            Language::Php,
            Language::Golang,
            Language::NodeJs,
            Language::NodeJsStatic,
            Language::Static,
        ] {
            registry.register(lang, slug.clone());
        }
        registry
    }

    pub fn register(&mut self, lang: Language, backend: Arc<dyn BuildBackend>) {
        self.backends.insert(lang, backend);
    }

    pub fn lookup(&self, lang: &Language) -> Arc<dyn BuildBackend> {
        self.backends
            .get(lang)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn fallback(&self) -> Arc<dyn BuildBackend> {
        self.fallback.clone()
    }
}
