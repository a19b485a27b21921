//! Shared headless-browser session and CDP plumbing.
//!
//! One Chromium process and one browsing context are lazily launched and
//! shared by every operation; each operation opens its own ephemeral page
//! (CDP target) inside that context. Pages come with network-level
//! ad-domain blocking installed before they ever navigate.

pub mod cdp;
pub mod page;
pub mod session;

pub use cdp::CdpClient;
pub use page::Page;
pub use session::{find_browser_binary, BrowserManager, BrowserSession};
