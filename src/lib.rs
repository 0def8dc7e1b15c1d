//! Recursive language models: answer questions about documents too large for
//! a prompt by letting the model explore them from a Python sandbox.
//!
//! ```ignore
//! use rlm::{Rlm, RlmConfig};
//!
//! let rlm = Rlm::with_http_client(RlmConfig::new("gpt-4o-mini"))?;
//! let answer = rlm.completion("Which years are mentioned?", &document).await?;
//! println!("{answer} ({:?})", rlm.stats());
//! ```

pub mod config;
pub mod error;
pub mod llm;
pub mod logging;
pub mod rlm;

pub use config::RlmConfig;
pub use error::{ReplError, RlmError};
pub use llm::{LlmClient, Message, ModelClient, ModelParams, ModelRequest, Role};
pub use rlm::parser::{is_terminal, parse as parse_terminal, resolve as resolve_terminal, Terminal};
pub use rlm::prompts::PromptLanguage;
pub use rlm::{CallOptions, Rlm, Stats};
