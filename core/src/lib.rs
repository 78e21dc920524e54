pub mod builder;
pub mod cache;
pub mod error;
pub mod index;
pub mod loader;
pub mod persist;
pub mod search;
pub mod source;
pub mod tokenizer;
pub mod transcript;

pub use builder::{BuildOutput, IndexBuilder};
pub use error::{CacheError, FetchError, LoadError, MalformedDocument, NotReady, PayloadError};
pub use index::{Corpus, IndexMetadata, InvertedIndex};
pub use loader::{ArchiveService, LoadPath, LoadReport, LoadStatus, LoaderConfig};
pub use search::{MatchMode, ScoringWeights, SearchOptions, SearchResult};
pub use transcript::{DateKey, Panel, TranscriptDocument, TranscriptStore};

/// Build version the payload format and tokenizer settings correspond to.
pub const INDEX_FORMAT_VERSION: &str = "2.0";
