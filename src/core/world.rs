/// World store actor
///
/// One task owns the `WorldDatabase`. Everything else talks to it through a
/// `WorldHandle`, which sends a request carrying a one-shot reply channel and
/// waits for the answer. Requests are handled strictly one at a time in
/// arrival order, so mutations never interleave and every read observes a
/// single consistent instant of the world.
///
/// The loop also saves on a timer and on request. Stopping is reserved to the
/// single `WorldShutdown` token: it drains requests already queued, saves one
/// last time and ends the task. After that the request channel is closed, so a
/// late request fails with `MushError::WorldStopped` instead of waiting
/// forever.

use crate::core::entities::{
    Entity, EntityKind, Exit, Item, Location, LocationKind, PasswordRecord, Player, Room,
    WorldDatabase, HOME_ROOM, ROOT_PLAYER,
};
use crate::core::ids::IdType;
use crate::error::{MushError, Result};
use crate::persistence::Snapshotter;
use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{block_in_place, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How often the world is saved without being asked
pub const SAVE_STATE_FREQUENCY: Duration = Duration::from_secs(60 * 60);

/// Default depth of the request queue
pub const DEFAULT_QUEUE_SIZE: usize = 256;

/// Lookup criteria for `find`
#[derive(Debug, Clone, PartialEq)]
pub enum FindQuery {
    ById(IdType),
    ByOwner(IdType),
    ByLocation(Location),
    /// Case-insensitive exact name match
    ByName(String),
}

/// Kind plus initial fields of an entity to create
#[derive(Debug, Clone, PartialEq)]
pub enum NewEntity {
    Player {
        name: String,
        description: String,
    },
    Room {
        name: String,
        description: String,
        owner: IdType,
    },
    Item {
        name: String,
        description: String,
        owner: IdType,
    },
    Exit {
        /// Room the exit leaves from
        room: IdType,
        name: String,
        description: String,
        destination: IdType,
        owner: IdType,
    },
}

/// Messages understood by the world store
#[derive(Debug)]
pub enum WorldRequest {
    Find {
        kind: EntityKind,
        query: FindQuery,
        reply: oneshot::Sender<Vec<Entity>>,
    },
    New {
        entity: NewEntity,
        reply: oneshot::Sender<Option<Entity>>,
    },
    Update {
        entity: Entity,
        reply: oneshot::Sender<bool>,
    },
    Destroy {
        kind: EntityKind,
        id: IdType,
        reply: oneshot::Sender<bool>,
    },
    CheckPassword {
        id: IdType,
        secret: String,
        reply: oneshot::Sender<bool>,
    },
    SetPassword {
        id: IdType,
        secret: String,
        reply: oneshot::Sender<bool>,
    },
    SaveState {
        reply: oneshot::Sender<Result<PathBuf>>,
    },
}

/// World store builder
pub struct WorldStoreBuilder<S: Snapshotter> {
    db: WorldDatabase,
    snapshotter: S,
    save_interval: Duration,
    queue_size: usize,
}

impl<S: Snapshotter> WorldStoreBuilder<S> {
    pub fn new(db: WorldDatabase, snapshotter: S) -> Self {
        Self {
            db,
            snapshotter,
            save_interval: SAVE_STATE_FREQUENCY,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }

    pub fn save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = size.max(1);
        self
    }

    /// Start the store loop on the current tokio runtime
    pub fn spawn(self) -> (WorldHandle, WorldShutdown) {
        let (sender, requests) = mpsc::channel(self.queue_size);
        let (stop, stop_rx) = oneshot::channel();

        let store = WorldStore {
            db: self.db,
            snapshotter: self.snapshotter,
            requests,
        };
        let task = tokio::spawn(store.run(stop_rx, self.save_interval));

        (WorldHandle { sender }, WorldShutdown { stop, task })
    }
}

/// Sole owner of the world database
pub struct WorldStore<S: Snapshotter> {
    db: WorldDatabase,
    snapshotter: S,
    requests: mpsc::Receiver<WorldRequest>,
}

impl<S: Snapshotter> WorldStore<S> {
    pub fn builder(db: WorldDatabase, snapshotter: S) -> WorldStoreBuilder<S> {
        WorldStoreBuilder::new(db, snapshotter)
    }

    async fn run(mut self, mut stop: oneshot::Receiver<()>, save_interval: Duration) -> Result<PathBuf> {
        info!("World store started");

        let mut save_timer = interval_at(Instant::now() + save_interval, save_interval);
        save_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut stop => {
                    debug!("World store received shutdown signal");
                    break;
                }
                _ = save_timer.tick() => {
                    debug!("Periodic save triggered");
                    // Failure is already logged; the loop keeps serving
                    let _ = self.save();
                }
                request = self.requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => {
                        debug!("All world handles dropped");
                        break;
                    }
                },
            }
        }

        // Refuse new requests, answer the ones already queued
        self.requests.close();
        while let Some(request) = self.requests.recv().await {
            self.handle(request);
        }

        let result = self.save();
        info!("World store stopped");
        result
    }

    fn handle(&mut self, request: WorldRequest) {
        // A dropped reply receiver only means the caller gave up waiting
        match request {
            WorldRequest::Find { kind, query, reply } => {
                let _ = reply.send(self.find(kind, &query));
            }
            WorldRequest::New { entity, reply } => {
                let _ = reply.send(self.create(entity));
            }
            WorldRequest::Update { entity, reply } => {
                let _ = reply.send(self.update(entity));
            }
            WorldRequest::Destroy { kind, id, reply } => {
                let _ = reply.send(self.destroy(kind, id));
            }
            WorldRequest::CheckPassword { id, secret, reply } => {
                let _ = reply.send(self.check_password(id, &secret));
            }
            WorldRequest::SetPassword { id, secret, reply } => {
                let _ = reply.send(self.set_password(id, &secret));
            }
            WorldRequest::SaveState { reply } => {
                let _ = reply.send(self.save());
            }
        }
    }

    /// Snapshot I/O blocks; on a multi-threaded runtime the worker hands its
    /// other tasks off first. The loop still waits, so saves stay serialized.
    fn save(&self) -> Result<PathBuf> {
        let on_multi_thread = Handle::try_current()
            .map(|h| h.runtime_flavor() == RuntimeFlavor::MultiThread)
            .unwrap_or(false);
        let saved = if on_multi_thread {
            block_in_place(|| self.snapshotter.save(&self.db))
        } else {
            self.snapshotter.save(&self.db)
        };

        saved.map_err(|e| {
            error!("Could not save world state: {}", e);
            e
        })
    }

    fn find(&self, kind: EntityKind, query: &FindQuery) -> Vec<Entity> {
        let db = &self.db;
        match kind {
            EntityKind::Player => {
                let matches: Vec<&Player> = match query {
                    FindQuery::ById(id) => db.players.get(id).into_iter().collect(),
                    FindQuery::ByName(name) => db
                        .players
                        .values()
                        .filter(|p| same_name(&p.name, name))
                        .collect(),
                    FindQuery::ByLocation(loc) => {
                        db.players.values().filter(|p| p.location == *loc).collect()
                    }
                    FindQuery::ByOwner(_) => Vec::new(),
                };
                matches.into_iter().cloned().map(Entity::Player).collect()
            }
            EntityKind::Room => {
                let matches: Vec<&Room> = match query {
                    FindQuery::ById(id) => db.rooms.get(id).into_iter().collect(),
                    FindQuery::ByOwner(owner) => {
                        db.rooms.values().filter(|r| r.owner == *owner).collect()
                    }
                    FindQuery::ByName(name) => db
                        .rooms
                        .values()
                        .filter(|r| same_name(&r.name, name))
                        .collect(),
                    FindQuery::ByLocation(_) => Vec::new(),
                };
                matches.into_iter().cloned().map(Entity::Room).collect()
            }
            EntityKind::Item => {
                let matches: Vec<&Item> = match query {
                    FindQuery::ById(id) => db.items.get(id).into_iter().collect(),
                    FindQuery::ByOwner(owner) => {
                        db.items.values().filter(|i| i.owner == *owner).collect()
                    }
                    FindQuery::ByLocation(loc) => {
                        db.items.values().filter(|i| i.location == *loc).collect()
                    }
                    FindQuery::ByName(name) => db
                        .items
                        .values()
                        .filter(|i| same_name(&i.name, name))
                        .collect(),
                };
                matches.into_iter().cloned().map(Entity::Item).collect()
            }
            EntityKind::Exit => {
                let mut matches: Vec<&Exit> = match query {
                    FindQuery::ById(id) => db.exits().filter(|e| e.id == *id).collect(),
                    FindQuery::ByOwner(owner) => db.exits().filter(|e| e.owner == *owner).collect(),
                    FindQuery::ByName(name) => {
                        db.exits().filter(|e| same_name(&e.name, name)).collect()
                    }
                    FindQuery::ByLocation(loc) if loc.kind == LocationKind::Room => db
                        .rooms
                        .get(&loc.id)
                        .map(|r| r.exits.iter().collect())
                        .unwrap_or_default(),
                    FindQuery::ByLocation(_) => Vec::new(),
                };
                matches.sort_by_key(|e| e.id);
                matches.into_iter().cloned().map(Entity::Exit).collect()
            }
        }
    }

    fn create(&mut self, entity: NewEntity) -> Option<Entity> {
        let db = &mut self.db;
        match entity {
            NewEntity::Player { name, description } => {
                if db.players.values().any(|p| same_name(&p.name, &name)) {
                    info!("Player name {} is already taken", name);
                    return None;
                }
                let id = db.allocate_id();
                let player = Player {
                    id,
                    name,
                    description,
                    location: Location::room(db.default_room),
                    admin: db.players.is_empty(),
                    last_acted: Utc::now(),
                };
                info!("New player {} [{}] (admin: {})", player.name, id, player.admin);
                db.players.insert(id, player.clone());
                Some(Entity::Player(player))
            }
            NewEntity::Room {
                name,
                description,
                owner,
            } => {
                let id = db.allocate_id();
                let room = Room {
                    id,
                    name,
                    description,
                    exits: Vec::new(),
                    owner,
                    attributes: Default::default(),
                };
                info!("New room {} [{}]", room.name, id);
                db.rooms.insert(id, room.clone());
                Some(Entity::Room(room))
            }
            NewEntity::Item {
                name,
                description,
                owner,
            } => {
                let id = db.allocate_id();
                let item = Item {
                    id,
                    name,
                    description,
                    owner,
                    location: Location::player(owner),
                    attached: false,
                    attributes: Default::default(),
                };
                info!("New item {} [{}]", item.name, id);
                db.items.insert(id, item.clone());
                Some(Entity::Item(item))
            }
            NewEntity::Exit {
                room,
                name,
                description,
                destination,
                owner,
            } => {
                if !db.rooms.contains_key(&room) {
                    debug!("Cannot add exit '{}' to unknown room {}", name, room);
                    return None;
                }
                let id = db.allocate_id();
                let exit = Exit {
                    name,
                    description,
                    destination,
                    owner,
                    ..Exit::blank(id)
                };
                info!("New exit {} [{}] in room {}", exit.name, id, room);
                db.rooms.get_mut(&room)?.exits.push(exit.clone());
                Some(Entity::Exit(exit))
            }
        }
    }

    fn update(&mut self, entity: Entity) -> bool {
        let db = &mut self.db;
        match entity {
            Entity::Player(player) => match db.players.get_mut(&player.id) {
                Some(slot) => {
                    *slot = player;
                    true
                }
                None => false,
            },
            Entity::Room(mut room) => match db.rooms.get_mut(&room.id) {
                Some(slot) => {
                    // Exits change only through their own requests
                    room.exits = std::mem::take(&mut slot.exits);
                    *slot = room;
                    true
                }
                None => false,
            },
            Entity::Item(item) => match db.items.get_mut(&item.id) {
                Some(slot) => {
                    *slot = item;
                    true
                }
                None => false,
            },
            Entity::Exit(exit) => match db.exit_position(exit.id) {
                Some((room_id, idx)) => match db.rooms.get_mut(&room_id) {
                    Some(room) => {
                        room.exits[idx] = exit;
                        true
                    }
                    None => false,
                },
                None => false,
            },
        }
    }

    fn destroy(&mut self, kind: EntityKind, id: IdType) -> bool {
        let db = &mut self.db;
        let destroyed = match kind {
            EntityKind::Room if id == HOME_ROOM => {
                warn!("Refusing to destroy home room {}", id);
                return false;
            }
            EntityKind::Player if id == ROOT_PLAYER => {
                warn!("Refusing to destroy root player {}", id);
                return false;
            }
            EntityKind::Room => db.rooms.remove(&id).is_some(),
            EntityKind::Player => {
                db.auth.remove(&id);
                db.players.remove(&id).is_some()
            }
            EntityKind::Item => db.items.remove(&id).is_some(),
            EntityKind::Exit => match db.exit_position(id) {
                Some((room_id, idx)) => db
                    .rooms
                    .get_mut(&room_id)
                    .map(|room| {
                        room.exits.remove(idx);
                    })
                    .is_some(),
                None => false,
            },
        };

        if destroyed {
            info!("Destroyed {:?} {}", kind, id);
        } else {
            debug!("Nothing to destroy for {:?} {}", kind, id);
        }
        destroyed
    }

    fn check_password(&self, id: IdType, candidate: &str) -> bool {
        match self.db.auth.get(&id) {
            Some(record) => record.verify(candidate),
            None => {
                debug!("No password stored for {}", id);
                false
            }
        }
    }

    fn set_password(&mut self, id: IdType, secret: &str) -> bool {
        self.db.auth.insert(id, PasswordRecord::new(secret));
        debug!("Password updated for {}", id);
        true
    }
}

fn same_name(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.trim().to_lowercase()
}

/// Cloneable client side of the world store
#[derive(Debug, Clone)]
pub struct WorldHandle {
    sender: mpsc::Sender<WorldRequest>,
}

impl WorldHandle {
    /// Send a raw request and wait for its reply
    ///
    /// # Errors
    /// - `MushError::WorldStopped`: the store loop has ended
    pub async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WorldRequest,
    ) -> Result<T> {
        let (reply, answer) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| MushError::WorldStopped)?;
        answer.await.map_err(|_| MushError::WorldStopped)
    }

    /// Zero or more entities of `kind` matching `query`, ordered by ID
    pub async fn find(&self, kind: EntityKind, query: FindQuery) -> Result<Vec<Entity>> {
        self.request(|reply| WorldRequest::Find { kind, query, reply }).await
    }

    /// Create an entity with a freshly allocated ID
    ///
    /// Returns `None` for a player whose name is already taken
    /// (case-insensitively) and for an exit whose source room does not exist.
    pub async fn create(&self, entity: NewEntity) -> Result<Option<Entity>> {
        self.request(|reply| WorldRequest::New { entity, reply }).await
    }

    /// Replace the stored copy of an existing entity
    pub async fn update(&self, entity: Entity) -> Result<bool> {
        self.request(|reply| WorldRequest::Update { entity, reply }).await
    }

    /// Remove an entity; `false` if unknown or protected
    pub async fn destroy(&self, kind: EntityKind, id: IdType) -> Result<bool> {
        self.request(|reply| WorldRequest::Destroy { kind, id, reply }).await
    }

    pub async fn check_password(&self, id: IdType, secret: impl Into<String>) -> Result<bool> {
        let secret = secret.into();
        self.request(|reply| WorldRequest::CheckPassword { id, secret, reply })
            .await
    }

    pub async fn set_password(&self, id: IdType, secret: impl Into<String>) -> Result<bool> {
        let secret = secret.into();
        self.request(|reply| WorldRequest::SetPassword { id, secret, reply })
            .await
    }

    /// Save immediately, returning the new backup path
    pub async fn save_state(&self) -> Result<PathBuf> {
        self.request(|reply| WorldRequest::SaveState { reply }).await?
    }

    pub async fn player(&self, id: IdType) -> Result<Option<Player>> {
        Ok(self
            .find(EntityKind::Player, FindQuery::ById(id))
            .await?
            .into_iter()
            .find_map(Entity::into_player))
    }

    pub async fn player_by_name(&self, name: &str) -> Result<Option<Player>> {
        Ok(self
            .find(EntityKind::Player, FindQuery::ByName(name.to_string()))
            .await?
            .into_iter()
            .find_map(Entity::into_player))
    }

    pub async fn room(&self, id: IdType) -> Result<Option<Room>> {
        Ok(self
            .find(EntityKind::Room, FindQuery::ById(id))
            .await?
            .into_iter()
            .find_map(Entity::into_room))
    }

    pub async fn item(&self, id: IdType) -> Result<Option<Item>> {
        Ok(self
            .find(EntityKind::Item, FindQuery::ById(id))
            .await?
            .into_iter()
            .find_map(Entity::into_item))
    }

    /// True once the store loop has stopped accepting requests
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Exclusive right to stop the world store
///
/// Not `Clone`: exactly one owner sequences shutdown.
#[derive(Debug)]
pub struct WorldShutdown {
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<PathBuf>>,
}

impl WorldShutdown {
    /// Drain queued requests, save, and stop the loop
    ///
    /// Returns the path of the final snapshot.
    pub async fn shutdown(self) -> Result<PathBuf> {
        info!("Shutting down world store");
        // The loop may already have ended if every handle was dropped
        let _ = self.stop.send(());
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                error!("World store task failed: {}", e);
                Err(MushError::WorldStopped)
            }
        }
    }
}
