pub mod settings;

pub use settings::{
    BreakerConfig, CacheConfig, ChunkingConfig, DatabaseConfig, EmbeddingConfig,
    GenerationConfig, RagConfig, RateLimitsConfig, RepositoryConfig, ResilienceConfig,
    RetryConfig, ServerConfig, Settings, SyncConfig, TimeoutConfig, ToolLimitConfig,
    WatcherConfig,
};
