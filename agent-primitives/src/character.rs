//! Agent identity: the character definition and its persisted record.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AgentId, now_millis};

/// Logical identity of an agent: who it is, how it behaves, and which
/// plugins it loads. One character per kernel instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Character {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<AgentId>,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    bio: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    settings: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    secrets: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    plugins: Vec<String>,
}

impl Character {
    /// Starts building a character with the supplied display name.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> CharacterBuilder {
        CharacterBuilder {
            id: None,
            name: name.into(),
            username: None,
            bio: String::new(),
            system: None,
            settings: Map::new(),
            secrets: Map::new(),
            plugins: Vec::new(),
        }
    }

    /// Returns the explicit identifier, when one was assigned.
    #[must_use]
    pub const fn id(&self) -> Option<AgentId> {
        self.id
    }

    /// Returns the identifier for this character.
    ///
    /// Falls back to a stable identifier derived from the name and username
    /// when no explicit id was assigned, so the same character always maps
    /// to the same agent.
    #[must_use]
    pub fn agent_id(&self) -> AgentId {
        self.id.unwrap_or_else(|| {
            let seed = match &self.username {
                Some(username) => format!("{}:{username}", self.name),
                None => self.name.clone(),
            };
            AgentId::derived(&seed)
        })
    }

    /// Returns the display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the optional username.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Returns the biography text.
    #[must_use]
    pub fn bio(&self) -> &str {
        &self.bio
    }

    /// Returns the system prompt, if configured.
    #[must_use]
    pub fn system(&self) -> Option<&str> {
        self.system.as_deref()
    }

    /// Returns the settings bucket.
    #[must_use]
    pub fn settings(&self) -> &Map<String, Value> {
        &self.settings
    }

    /// Returns the secrets bucket. Values are opaque to the kernel.
    #[must_use]
    pub fn secrets(&self) -> &Map<String, Value> {
        &self.secrets
    }

    /// Returns the ordered list of plugin names this character loads.
    #[must_use]
    pub fn plugins(&self) -> &[String] {
        &self.plugins
    }

    /// Writes a value into the settings bucket.
    pub fn set_setting(&mut self, key: impl Into<String>, value: Value) {
        self.settings.insert(key.into(), value);
    }

    /// Writes a value into the secrets bucket.
    pub fn set_secret(&mut self, key: impl Into<String>, value: Value) {
        self.secrets.insert(key.into(), value);
    }
}

/// Builder for [`Character`].
#[derive(Debug)]
pub struct CharacterBuilder {
    id: Option<AgentId>,
    name: String,
    username: Option<String>,
    bio: String,
    system: Option<String>,
    settings: Map<String, Value>,
    secrets: Map<String, Value>,
    plugins: Vec<String>,
}

impl CharacterBuilder {
    /// Assigns an explicit agent identifier.
    #[must_use]
    pub fn id(mut self, id: AgentId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the username used for deterministic id derivation.
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the biography text.
    #[must_use]
    pub fn bio(mut self, bio: impl Into<String>) -> Self {
        self.bio = bio.into();
        self
    }

    /// Sets the system prompt.
    #[must_use]
    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Adds a settings entry.
    #[must_use]
    pub fn setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    /// Adds a secret entry. Values are treated as opaque.
    #[must_use]
    pub fn secret(mut self, key: impl Into<String>, value: Value) -> Self {
        self.secrets.insert(key.into(), value);
        self
    }

    /// Appends a plugin name to the ordered load list.
    #[must_use]
    pub fn plugin(mut self, name: impl Into<String>) -> Self {
        self.plugins.push(name.into());
        self
    }

    /// Consumes the builder and returns the character.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidCharacter`] when the name is empty or
    /// whitespace.
    pub fn build(self) -> crate::Result<Character> {
        if self.name.trim().is_empty() {
            return Err(crate::Error::invalid_character(
                "character name cannot be empty",
            ));
        }

        Ok(Character {
            id: self.id,
            name: self.name,
            username: self.username,
            bio: self.bio,
            system: self.system,
            settings: self.settings,
            secrets: self.secrets,
            plugins: self.plugins,
        })
    }
}

/// Persisted agent record: a character plus lifecycle bookkeeping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agent {
    /// Identifier the record is stored under.
    pub id: AgentId,
    /// The character definition at the time of the last update.
    pub character: Character,
    /// Whether the agent is currently enabled.
    pub enabled: bool,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
    /// Last update time, epoch milliseconds.
    pub updated_at: i64,
}

impl Agent {
    /// Creates a persisted record for the supplied character.
    #[must_use]
    pub fn from_character(character: &Character) -> Self {
        let now = now_millis();
        Self {
            id: character.agent_id(),
            character: character.clone(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }
}
