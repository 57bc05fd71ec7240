pub mod card;
pub mod config;
pub mod identifier;
pub mod normalize;
pub mod source;

pub use card::{CardFetcher, FetchError, ProviderAttempt};
pub use config::{FetchConfig, ProviderKind};
pub use identifier::ProductReference;
pub use source::{ContentSource, HttpContentSource, ProviderError, SourceReply};
