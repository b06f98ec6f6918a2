//! Room directory: the authority on which room names exist.
//!
//! The operation log consults the directory the first time it sees a room
//! name. A room the directory does not know is never created.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};

/// Directory record for a room. Only its presence matters to the server.
pub type RoomProfile = Map<String, Value>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DirectoryError {
    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait RoomDirectory: Send + Sync {
    /// `Ok(None)` means the room definitely does not exist.
    async fn lookup_room(&self, name: &str) -> Result<Option<RoomProfile>, DirectoryError>;
}

/// Accepts every room name.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenDirectory;

#[async_trait]
impl RoomDirectory for OpenDirectory {
    async fn lookup_room(&self, name: &str) -> Result<Option<RoomProfile>, DirectoryError> {
        let mut profile = RoomProfile::new();
        profile.insert("name".into(), Value::String(name.to_string()));
        Ok(Some(profile))
    }
}

/// Fixed set of known rooms.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    rooms: HashMap<String, RoomProfile>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory containing the given names with empty profiles.
    pub fn with_rooms<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut directory = Self::new();
        for name in names {
            directory.insert(name, RoomProfile::new());
        }
        directory
    }

    pub fn insert(&mut self, name: impl Into<String>, profile: RoomProfile) {
        self.rooms.insert(name.into(), profile);
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[async_trait]
impl RoomDirectory for StaticDirectory {
    async fn lookup_room(&self, name: &str) -> Result<Option<RoomProfile>, DirectoryError> {
        Ok(self.rooms.get(name).cloned())
    }
}
