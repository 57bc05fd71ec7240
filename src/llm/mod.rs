pub mod client;
pub mod decode;
pub mod openai;
pub mod protocol;

pub use client::{GenerationClient, GenerationError, GenerationSuccess, LlmConfig};
pub use decode::Decoded;
pub use openai::{GenerationTransport, OpenAiTransport, ResponseBody, TransportError};
pub use protocol::{CallShape, ResponseFormat};
