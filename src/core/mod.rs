/// Core domain logic for mushd
///
/// World data, the world store actor that owns it, and the live sessions
/// attached to it.

pub mod connection;
pub mod entities;
pub mod ids;
pub mod session;
pub mod world;

// Re-export commonly used types
pub use connection::Connection;
pub use entities::{Entity, EntityKind, Exit, Item, Location, Player, Room, WorldDatabase};
pub use ids::{ConnectionId, IdType};
pub use session::{Session, SessionRegistry};
pub use world::{FindQuery, NewEntity, WorldHandle, WorldShutdown, WorldStore};
