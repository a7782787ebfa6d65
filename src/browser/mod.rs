pub mod manager;
pub mod stealth;


pub use manager::{BrowserManager, PageRenderer, RenderedPage, ScopedPage};
pub use stealth::{BrowserFingerprint, FingerprintRandomizer, HeaderProfile, UserAgentGenerator};
