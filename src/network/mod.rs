/// Network layer: telnet filtering, the listener, and the built-in handler
///
/// - Telnet IAC stripping for inbound bytes
/// - TCP accept loop with orderly shutdown
/// - `Lobby`, the default per-connection handler

pub mod lobby;
pub mod server;
pub mod telnet;

// Re-export commonly used types
pub use lobby::Lobby;
pub use server::{Server, SessionHandler};
pub use telnet::{TelnetFilter, TelnetReader};
