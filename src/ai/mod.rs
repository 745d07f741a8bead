//! AI response generation: provider abstraction, stages and the generator.

pub mod generator;
pub mod provider;
pub mod stage;

pub use generator::{Generation, GenerationInput, GenerationOutcome, ResponseGenerator};
pub use provider::{LlmConfig, LlmProvider, OpenAiCompatibleProvider};
pub use stage::{Stage, StageAction};
