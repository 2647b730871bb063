use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Contract every stored record must satisfy.
///
/// An entity has a unique, immutable `id` and a pair of timestamps.
/// `updated_at` is monotonically non-decreasing and is bumped by
/// repositories on every save via [`Entity::touch`]. The core treats entity
/// payloads opaquely; concrete kinds are owned by the caller.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Unique identifier, immutable after creation
    fn id(&self) -> &str;

    /// Creation timestamp
    fn created_at(&self) -> DateTime<Utc>;

    /// Last modification timestamp (never moves backwards)
    fn updated_at(&self) -> DateTime<Utc>;

    /// Bump `updated_at` to now without ever decreasing it
    fn touch(&mut self);

    /// Stable name of the entity kind, used for table and source naming
    fn kind() -> &'static str;
}

/// A single message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl Message {
    /// Create a new message with a random id
    pub fn new(conversation_id: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            role,
            content: content.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for Message {
    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn touch(&mut self) {
        self.updated_at = self.updated_at.max(Utc::now());
    }

    fn kind() -> &'static str {
        "message"
    }
}

/// A conversation groups an ordered set of messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a new empty conversation
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            message_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for Conversation {
    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn touch(&mut self) {
        self.updated_at = self.updated_at.max(Utc::now());
    }

    fn kind() -> &'static str {
        "conversation"
    }
}

/// A long-lived memory extracted from past conversations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub content: String,
    /// Simple relevance weight assigned by the caller
    pub importance: f64,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryRecord {
    /// Create a new memory record with a random id
    pub fn new(content: impl Into<String>, importance: f64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            importance,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for MemoryRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn touch(&mut self) {
        self.updated_at = self.updated_at.max(Utc::now());
    }

    fn kind() -> &'static str {
        "memory"
    }
}
