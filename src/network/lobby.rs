/// Built-in session handler
///
/// Logs a client in by name (creating the player on first visit), announces
/// arrivals and departures to everyone, and understands `who` and `quit`.
/// Anything richer belongs to an external command layer.

use crate::core::connection::Connection;
use crate::core::entities::{Entity, Player};
use crate::core::world::NewEntity;
use crate::error::Result;
use crate::network::server::SessionHandler;
use chrono::Utc;
use tracing::{debug, info};

/// Failed password attempts before the connection is dropped
const MAX_PASSWORD_ATTEMPTS: usize = 3;

pub fn version_string() -> String {
    format!("mushd v{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Default, Clone)]
pub struct Lobby;

impl Lobby {
    pub fn new() -> Self {
        Self
    }

    /// Returns `None` if the client left before logging in
    async fn login(&self, conn: &mut Connection) -> Result<Option<Player>> {
        conn.println(&format!("Welcome to {}", version_string())).await?;

        loop {
            let Some(name) = self.ask_name(conn).await? else {
                return Ok(None);
            };

            let world = conn.world().clone();
            if let Some(player) = world.player_by_name(&name).await? {
                return self.authenticate(conn, player).await;
            }

            conn.print("New character. Choose a password => ").await?;
            let Some(secret) = conn.read_secret().await? else {
                return Ok(None);
            };

            // The store refuses the name if someone registered it meanwhile
            let created = world
                .create(NewEntity::Player {
                    name: name.clone(),
                    description: String::new(),
                })
                .await?;
            let Some(player) = created.and_then(Entity::into_player) else {
                conn.println(&format!("The name {} was just taken.", name)).await?;
                continue;
            };
            world.set_password(player.id, secret).await?;

            conn.println(&format!("Welcome, {}.", player.name)).await?;
            return Ok(Some(player));
        }
    }

    async fn ask_name(&self, conn: &mut Connection) -> Result<Option<String>> {
        loop {
            conn.print("Username => ").await?;
            match conn.read_line().await? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(line.trim().to_string())),
            }
        }
    }

    async fn authenticate(&self, conn: &mut Connection, player: Player) -> Result<Option<Player>> {
        for _ in 0..MAX_PASSWORD_ATTEMPTS {
            conn.print("Password => ").await?;
            let Some(secret) = conn.read_secret().await? else {
                return Ok(None);
            };
            if conn.world().check_password(player.id, secret).await? {
                conn.println(&format!("Welcome back, {}.", player.name)).await?;
                return Ok(Some(player));
            }
            conn.println("Wrong password.").await?;
        }
        info!("Too many failed logins for {} from {}", player.name, conn.session());
        Ok(None)
    }

    async fn who(&self, conn: &Connection) -> Result<()> {
        let mut lines = vec!["Connected players:".to_string()];
        for session in conn.registry().list().await {
            let Some(id) = session.player().await else {
                continue;
            };
            if let Some(player) = conn.world().player(id).await? {
                let online = Utc::now().signed_duration_since(session.connected_at());
                lines.push(format!("  {:<20} {}m", player.name, online.num_minutes()));
            }
        }
        conn.println(&lines.join("\n")).await
    }
}

impl SessionHandler for Lobby {
    async fn handle(&self, mut conn: Connection) -> Result<()> {
        let Some(mut player) = self.login(&mut conn).await? else {
            return Ok(());
        };

        conn.session().set_player(Some(player.id)).await;
        info!("{} logged in as {} [{}]", conn.session(), player.name, player.id);
        conn.wall(&format!("{} has appeared.\n", player.name)).await;

        while let Some(line) = conn.read_line().await? {
            player.last_acted = Utc::now();
            conn.world().update(Entity::Player(player.clone())).await?;

            match line.trim().to_lowercase().as_str() {
                "" => {}
                "quit" => {
                    conn.println("Goodbye.").await?;
                    break;
                }
                "who" => self.who(&conn).await?,
                other => {
                    debug!("Unknown command from {}: {}", player.name, other);
                    conn.println("Huh? Try 'who' or 'quit'.").await?;
                }
            }
        }

        conn.session().set_player(None).await;
        let remaining = conn.wall(&format!("{} disappears in a puff of smoke.\n", player.name)).await;
        debug!("Departure of {} seen by {} sessions", player.name, remaining);
        Ok(())
    }
}
