//! Core data types that flow through the import and chat pipelines.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Access/refresh token pair for the connected storage account.
///
/// Serialized as the on-disk token blob.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Tokens are treated as expired this long before their actual expiry.
pub const EXPIRY_SKEW_SECS: i64 = 60;

impl Credential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_SKEW_SECS) >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// A file in the connected account that may be imported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    /// Storage provider file id; also the document id in the store.
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub modified_at: Option<DateTime<Utc>>,
    /// Size in bytes as reported by the listing, when known.
    pub size: Option<u64>,
    /// Display name of the containing folder.
    pub parent: String,
    pub web_link: String,
}

/// A span of extracted document text with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub document_id: String,
    /// Name of the parent document, for labelling context and citations.
    pub document_name: String,
    /// Position within the parent document, unique per document.
    pub chunk_index: i64,
    pub text: String,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// A stored chunk ranked against a query.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// An imported document with its chunk count.
#[derive(Debug, Clone)]
pub struct DocumentSummary {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub web_link: String,
    pub chunk_count: i64,
    pub imported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message of the active conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(expires_in: i64) -> Credential {
        Credential {
            access_token: "ya29.secret".to_string(),
            refresh_token: Some("1//refresh".to_string()),
            expires_at: Utc::now() + Duration::seconds(expires_in),
            scopes: vec![],
        }
    }

    #[test]
    fn expiry_includes_skew() {
        assert!(credential(30).is_expired());
        assert!(!credential(3600).is_expired());
    }

    #[test]
    fn debug_output_redacts_tokens() {
        let text = format!("{:?}", credential(3600));
        assert!(!text.contains("ya29"));
        assert!(!text.contains("1//refresh"));
        assert!(text.contains("<redacted>"));
    }

    #[test]
    fn credential_without_refresh_token_cannot_refresh() {
        let mut c = credential(0);
        c.refresh_token = None;
        assert!(!c.can_refresh());
    }
}
