pub mod browser;
pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod extract;
pub mod llm;
pub mod minter;
pub mod profiles;
pub mod service;
pub mod session;

pub use browser::BrowserManager;
pub use config::Config;
pub use error::{LinkBotError, Result};
pub use extract::{ExtractionPipeline, ProductRecord};
pub use minter::{AffiliateLinkRequest, LinkMinter};
pub use service::{LinkReply, LinkService};
pub use session::SessionManager;
