use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    pub rag: RagConfig,
    pub chunking: ChunkingConfig,
    pub cache: CacheConfig,
    pub resilience: ResilienceConfig,
    pub rate_limits: RateLimitsConfig,
    pub sync: SyncConfig,
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
    pub pool_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    pub api_key: Option<String>,
    pub batch_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GenerationConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: usize,
    pub temperature: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RagConfig {
    pub max_chunks: usize,
    pub graph_hops: usize,
    pub min_score: f32,
    /// Blend weights for rescoring retrieved chunks. Vector similarity and
    /// graph proximity are combined as
    /// `vector_weight * score + graph_weight * 1/(1+hops)`.
    pub vector_weight: f32,
    pub graph_weight: f32,
    pub max_context_tokens: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChunkingConfig {
    pub size: usize,
    pub overlap: usize,
    pub respect_paragraphs: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_items: usize,
    pub ttl_hours: u64,
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub timeout: TimeoutConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetryConfig {
    pub attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BreakerConfig {
    pub failure_ratio: f64,
    pub min_throughput: usize,
    pub sampling_s: u64,
    pub break_s: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TimeoutConfig {
    pub default_s: u64,
    pub embedding_s: u64,
    pub storage_s: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RateLimitsConfig {
    /// Per-tool limits keyed by tool name; `default` applies to tools
    /// without an explicit entry.
    pub per_tool: HashMap<String, ToolLimitConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct ToolLimitConfig {
    pub rpm: u32,
    pub rph: u32,
    pub burst: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// Where cloned repositories live on disk.
    pub workdir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatcherConfig {
    pub enabled: bool,
    pub debounce_ms: u64,
    pub reconcile_interval_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RepositoryConfig {
    pub name: String,
    pub url: String,
    pub branch: Option<String>,
    #[serde(default)]
    pub monitored_paths: Vec<String>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(true))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }

    /// Repository lookup is case-insensitive by name.
    pub fn find_repository(&self, name: &str) -> Option<&RepositoryConfig> {
        self.repositories
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
    }

    pub fn tool_limit(&self, tool: &str) -> Option<ToolLimitConfig> {
        self.rate_limits
            .per_tool
            .get(tool)
            .or_else(|| self.rate_limits.per_tool.get("default"))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_repos() -> Settings {
        Settings {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "postgres://localhost/knowledge".into(),
                pool_max_size: 5,
                pool_timeout_seconds: 30,
            },
            embedding: EmbeddingConfig {
                base_url: "http://localhost:8081".into(),
                model: "bge-m3".into(),
                dimension: 1024,
                api_key: None,
                batch_size: 8,
            },
            generation: GenerationConfig {
                base_url: "http://localhost:8082".into(),
                model: "chat".into(),
                api_key: None,
                max_tokens: 1024,
                temperature: 0.2,
            },
            rag: RagConfig {
                max_chunks: 10,
                graph_hops: 1,
                min_score: 0.0,
                vector_weight: 0.7,
                graph_weight: 0.3,
                max_context_tokens: 4000,
            },
            chunking: ChunkingConfig {
                size: 1000,
                overlap: 200,
                respect_paragraphs: true,
            },
            cache: CacheConfig {
                enabled: true,
                max_items: 1000,
                ttl_hours: 24,
                sweep_interval_seconds: 300,
            },
            resilience: ResilienceConfig {
                retry: RetryConfig {
                    attempts: 3,
                    initial_delay_ms: 100,
                    max_delay_ms: 2000,
                    jitter: true,
                },
                breaker: BreakerConfig {
                    failure_ratio: 0.5,
                    min_throughput: 5,
                    sampling_s: 30,
                    break_s: 15,
                },
                timeout: TimeoutConfig {
                    default_s: 30,
                    embedding_s: 15,
                    storage_s: 20,
                },
            },
            rate_limits: RateLimitsConfig {
                per_tool: HashMap::from([
                    (
                        "rag_query".to_string(),
                        ToolLimitConfig {
                            rpm: 30,
                            rph: 300,
                            burst: 5,
                        },
                    ),
                    (
                        "default".to_string(),
                        ToolLimitConfig {
                            rpm: 60,
                            rph: 600,
                            burst: 10,
                        },
                    ),
                ]),
            },
            sync: SyncConfig {
                enabled: false,
                interval_seconds: 300,
                workdir: "/tmp/repos".into(),
            },
            watcher: WatcherConfig {
                enabled: false,
                debounce_ms: 500,
                reconcile_interval_seconds: 600,
            },
            repositories: vec![RepositoryConfig {
                name: "Docs-Repo".into(),
                url: "https://example.com/docs.git".into(),
                branch: Some("main".into()),
                monitored_paths: vec!["docs/".into()],
            }],
        }
    }

    #[test]
    fn repository_lookup_is_case_insensitive() {
        let settings = settings_with_repos();
        assert!(settings.find_repository("docs-repo").is_some());
        assert!(settings.find_repository("DOCS-REPO").is_some());
        assert!(settings.find_repository("unknown").is_none());
    }

    #[test]
    fn tool_limit_falls_back_to_default() {
        let settings = settings_with_repos();
        assert_eq!(settings.tool_limit("rag_query").map(|l| l.rpm), Some(30));
        assert_eq!(
            settings.tool_limit("semantic_search").map(|l| l.rpm),
            Some(60)
        );
    }
}
