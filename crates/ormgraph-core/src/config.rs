//! Context and environment configuration.

/// Default maximum number of statements sent in one backend batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Default namespace used when callers do not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Per-context settings.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Whether unreferenced, clean entities may be evicted by `sweep`.
    /// When false the context pins everything it has issued.
    pub allow_garbage_collection: bool,

    /// Maximum statements per backend batch.
    pub max_batch_size: usize,

    /// Mark eagerly joined to-many collections as fetched even when the join
    /// carried conditions (and may therefore be partial).
    pub fetch_filtered_collections: bool,
}

impl ContextConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self {
            allow_garbage_collection: false,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            fetch_filtered_collections: false,
        }
    }

    /// Allow or forbid eviction of unreferenced entities.
    pub fn with_garbage_collection(mut self, allow: bool) -> Self {
        self.allow_garbage_collection = allow;
        self
    }

    /// Set the maximum batch size.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    /// Treat filtered eager joins as complete collections.
    pub fn with_fetch_filtered_collections(mut self, fetch: bool) -> Self {
        self.fetch_filtered_collections = fetch;
        self
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Settings of an [`Environment`](crate::env::Environment).
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Namespace used by [`Environment::lookup`](crate::env::Environment::lookup)
    /// shorthands.
    pub namespace: String,

    /// Template for new contexts.
    pub context: ContextConfig,
}

impl EnvironmentConfig {
    /// Create a configuration for the given default namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            context: ContextConfig::default(),
        }
    }

    /// Set the context template.
    pub fn with_context(mut self, context: ContextConfig) -> Self {
        self.context = context;
        self
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}
