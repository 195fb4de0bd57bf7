pub mod embedding_cache;
pub mod embedding_service;
pub mod entity_extractor;
pub mod event_bus;
pub mod indexer;
pub mod llm_service;
pub mod rag_service;
pub mod session;

pub use embedding_cache::EmbeddingCache;
pub use embedding_service::{EmbeddingProvider, EmbeddingService, HttpEmbeddingProvider};
pub use entity_extractor::EntityExtractor;
pub use event_bus::{DocumentEvent, DocumentEventType, EventBus, EventFilter, EventHandler};
pub use indexer::{DocumentIndexer, IndexResult};
pub use llm_service::{ChatMessage, GenerationProvider, HttpGenerationProvider};
pub use rag_service::{QueryOptions, RagAnswer, RagService};
pub use session::{DocTypeSummary, SessionService};
