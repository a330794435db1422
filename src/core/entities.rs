/// World entity data model
///
/// Rooms, exits, items and players, plus the `WorldDatabase` aggregate that
/// the world store owns. Cross references (exit destinations, locations,
/// owners, keys) are stored as IDs and resolved through store lookups.

use crate::core::ids::IdType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Free-form string attributes attached to rooms, exits and items
pub type Attributes = BTreeMap<String, String>;

/// ID of the seed room; never destroyed
pub const HOME_ROOM: IdType = IdType(1);

/// ID reserved for the first account; never destroyed
pub const ROOT_PLAYER: IdType = IdType(1);

/// Kind of container a `Location` points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocationKind {
    Room,
    Player,
    Item,
}

/// Container currently holding a player or item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub kind: LocationKind,
    pub id: IdType,
}

impl Location {
    pub fn room(id: IdType) -> Self {
        Self { kind: LocationKind::Room, id }
    }

    pub fn player(id: IdType) -> Self {
        Self { kind: LocationKind::Player, id }
    }

    pub fn item(id: IdType) -> Self {
        Self { kind: LocationKind::Item, id }
    }
}

/// A player character
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: IdType,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub location: Location,
    #[serde(default)]
    pub admin: bool,
    pub last_acted: DateTime<Utc>,
}

/// A room; exits are owned by the room they leave from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: IdType,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub exits: Vec<Exit>,
    #[serde(default)]
    pub owner: IdType,
    #[serde(default)]
    pub attributes: Attributes,
}

/// A one-way passage from its room to `destination`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exit {
    pub id: IdType,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub long_description: String,
    pub destination: IdType,
    /// Shown in the destination room; `{name}` is replaced by the traveller
    #[serde(default)]
    pub arrive_message: String,
    /// Shown in the source room; `{name}` is replaced by the traveller
    #[serde(default)]
    pub leave_message: String,
    #[serde(default)]
    pub owner: IdType,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub lockable: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub key: IdType,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Exit {
    /// An exit with only its ID set; destination defaults to the home room
    pub fn blank(id: IdType) -> Self {
        Self {
            id,
            name: String::new(),
            description: String::new(),
            long_description: String::new(),
            destination: HOME_ROOM,
            arrive_message: String::new(),
            leave_message: String::new(),
            owner: IdType::default(),
            hidden: false,
            lockable: false,
            locked: false,
            key: IdType::default(),
            attributes: Attributes::new(),
        }
    }

    pub fn arrive_text(&self, traveller: &str) -> String {
        self.arrive_message.replace("{name}", traveller)
    }

    pub fn leave_text(&self, traveller: &str) -> String {
        self.leave_message.replace("{name}", traveller)
    }
}

/// A portable (or attached) object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: IdType,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owner: IdType,
    pub location: Location,
    /// Attached items cannot be picked up
    #[serde(default)]
    pub attached: bool,
    #[serde(default)]
    pub attributes: Attributes,
}

/// Salted SHA-256 password hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordRecord {
    salt: [u8; 16],
    hash: [u8; 32],
}

impl PasswordRecord {
    /// Hash `secret` under a freshly generated salt
    pub fn new(secret: &str) -> Self {
        let salt = Uuid::new_v4().into_bytes();
        Self {
            salt,
            hash: Self::digest(&salt, secret),
        }
    }

    pub fn verify(&self, candidate: &str) -> bool {
        Self::digest(&self.salt, candidate) == self.hash
    }

    fn digest(salt: &[u8; 16], secret: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(secret.as_bytes());
        hasher.finalize().into()
    }
}

/// The fixed set of entity kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Room,
    Exit,
    Item,
    Player,
}

/// Any world entity, returned by world store lookups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entity {
    Room(Room),
    Exit(Exit),
    Item(Item),
    Player(Player),
}

impl Entity {
    pub fn id(&self) -> IdType {
        match self {
            Entity::Room(r) => r.id,
            Entity::Exit(e) => e.id,
            Entity::Item(i) => i.id,
            Entity::Player(p) => p.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Entity::Room(r) => &r.name,
            Entity::Exit(e) => &e.name,
            Entity::Item(i) => &i.name,
            Entity::Player(p) => &p.name,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Room(_) => EntityKind::Room,
            Entity::Exit(_) => EntityKind::Exit,
            Entity::Item(_) => EntityKind::Item,
            Entity::Player(_) => EntityKind::Player,
        }
    }

    pub fn into_room(self) -> Option<Room> {
        match self {
            Entity::Room(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_exit(self) -> Option<Exit> {
        match self {
            Entity::Exit(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_item(self) -> Option<Item> {
        match self {
            Entity::Item(i) => Some(i),
            _ => None,
        }
    }

    pub fn into_player(self) -> Option<Player> {
        match self {
            Entity::Player(p) => Some(p),
            _ => None,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name(), self.id())
    }
}

/// Everything the world store owns; also the unit of persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldDatabase {
    pub next_id: IdType,
    pub default_room: IdType,
    #[serde(default)]
    pub players: BTreeMap<IdType, Player>,
    #[serde(default)]
    pub rooms: BTreeMap<IdType, Room>,
    #[serde(default)]
    pub items: BTreeMap<IdType, Item>,
    #[serde(default)]
    pub auth: BTreeMap<IdType, PasswordRecord>,
}

impl WorldDatabase {
    /// An empty database whose first allocated ID is 1
    pub fn empty() -> Self {
        Self {
            next_id: IdType(1),
            default_room: HOME_ROOM,
            players: BTreeMap::new(),
            rooms: BTreeMap::new(),
            items: BTreeMap::new(),
            auth: BTreeMap::new(),
        }
    }

    /// First-boot world: a lobby and a cellar joined by a staircase
    pub fn seeded() -> Self {
        let mut db = Self::empty();

        let lobby_id = db.allocate_id();
        let cellar_id = db.allocate_id();
        let down_id = db.allocate_id();
        let up_id = db.allocate_id();

        let lobby = Room {
            id: lobby_id,
            name: "Main Lobby".to_string(),
            description: "This is the main lobby.".to_string(),
            exits: vec![Exit {
                id: down_id,
                name: "down".to_string(),
                description: "Stairs spiral down from here to the cellar.".to_string(),
                long_description: "You can see the flicker of firelight coming up from below."
                    .to_string(),
                destination: cellar_id,
                arrive_message: "{name} comes down the stairs from the main lobby.".to_string(),
                leave_message: "{name} heads down the stairs to the cellar.".to_string(),
                ..Exit::blank(down_id)
            }],
            owner: IdType::default(),
            attributes: Attributes::new(),
        };

        let cellar = Room {
            id: cellar_id,
            name: "Cellar".to_string(),
            description: "You are in a cellar underneath the main lobby.\nTorches on the walls provide light."
                .to_string(),
            exits: vec![Exit {
                id: up_id,
                name: "up".to_string(),
                description: "Stairs spiral up from here to the main lobby.".to_string(),
                long_description:
                    "You can see light shining down from above and you hear the sound of people talking."
                        .to_string(),
                destination: lobby_id,
                arrive_message: "{name} comes up the stairs from the cellar.".to_string(),
                leave_message: "{name} heads up the stairs to the main lobby.".to_string(),
                ..Exit::blank(up_id)
            }],
            owner: IdType::default(),
            attributes: Attributes::new(),
        };

        db.default_room = lobby_id;
        db.rooms.insert(lobby_id, lobby);
        db.rooms.insert(cellar_id, cellar);
        db
    }

    /// Hand out the next global ID
    pub fn allocate_id(&mut self) -> IdType {
        let id = self.next_id;
        self.next_id = IdType(id.0 + 1);
        id
    }

    /// Locate an exit: (owning room id, index in its exit list)
    pub fn exit_position(&self, id: IdType) -> Option<(IdType, usize)> {
        self.rooms.values().find_map(|room| {
            room.exits
                .iter()
                .position(|e| e.id == id)
                .map(|idx| (room.id, idx))
        })
    }

    pub fn exits(&self) -> impl Iterator<Item = &Exit> {
        self.rooms.values().flat_map(|r| r.exits.iter())
    }
}

impl Default for WorldDatabase {
    fn default() -> Self {
        Self::seeded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_world_layout() {
        let db = WorldDatabase::seeded();

        assert_eq!(db.rooms.len(), 2);
        assert_eq!(db.default_room, HOME_ROOM);
        assert_eq!(db.next_id, IdType(5));

        let lobby = &db.rooms[&IdType(1)];
        let cellar = &db.rooms[&IdType(2)];
        assert_eq!(lobby.exits[0].destination, cellar.id);
        assert_eq!(cellar.exits[0].destination, lobby.id);
        assert!(db.players.is_empty());
    }

    #[test]
    fn test_ids_are_global_across_kinds() {
        let db = WorldDatabase::seeded();
        let mut ids: Vec<IdType> = db.rooms.keys().copied().collect();
        ids.extend(db.exits().map(|e| e.id));
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4, "room and exit IDs must not overlap");
    }

    #[test]
    fn test_blank_exit_text_substitution() {
        let exit = Exit {
            arrive_message: "{name} climbs up.".to_string(),
            leave_message: "{name} goes down.".to_string(),
            ..Exit::blank(IdType(9))
        };
        assert_eq!(exit.destination, HOME_ROOM);
        assert_eq!(exit.arrive_text("Alice"), "Alice climbs up.");
        assert_eq!(exit.leave_text("Bob"), "Bob goes down.");
    }

    #[test]
    fn test_exit_position() {
        let db = WorldDatabase::seeded();
        assert_eq!(db.exit_position(IdType(4)), Some((IdType(2), 0)));
        assert_eq!(db.exit_position(IdType(99)), None);
    }

    #[test]
    fn test_password_record() {
        let record = PasswordRecord::new("hunter2");
        assert!(record.verify("hunter2"));
        assert!(!record.verify("hunter3"));
        assert!(!record.verify(""));

        // Same secret, different salt
        assert_ne!(record, PasswordRecord::new("hunter2"));
    }

    #[test]
    fn test_entity_accessors() {
        let db = WorldDatabase::seeded();
        let entity = Entity::Room(db.rooms[&IdType(1)].clone());

        assert_eq!(entity.id(), IdType(1));
        assert_eq!(entity.kind(), EntityKind::Room);
        assert_eq!(entity.to_string(), "Main Lobby [@1]");
        assert!(entity.clone().into_player().is_none());
        assert!(entity.into_room().is_some());
    }

    #[test]
    fn test_exit_message_templates() {
        let db = WorldDatabase::seeded();
        let down = &db.rooms[&IdType(1)].exits[0];
        assert_eq!(down.leave_text("Alice"), "Alice heads down the stairs to the cellar.");
    }

    #[test]
    fn test_database_json_shape() {
        let db = WorldDatabase::seeded();
        let json = serde_json::to_string(&db).unwrap();
        let back: WorldDatabase = serde_json::from_str(&json).unwrap();
        assert_eq!(back, db);
    }
}
