use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TranscriptRole {
    User,
    Persona,
}

/// One entry of a conversation log. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: TranscriptRole,
    pub content: String,
    /// Persona that produced the message; only set in multi mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    pub sent_at: DateTime<Utc>,
}

impl TranscriptRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TranscriptRole::User => "user",
            TranscriptRole::Persona => "persona",
        }
    }

    /// Role name in chat-completion payloads.
    pub fn to_api_role(self) -> &'static str {
        match self {
            TranscriptRole::User => "user",
            TranscriptRole::Persona => "assistant",
        }
    }
}

impl TryFrom<&str> for TranscriptRole {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(TranscriptRole::User),
            "persona" => Ok(TranscriptRole::Persona),
            _ => Err(format!("invalid transcript role: {value}")),
        }
    }
}

impl TryFrom<String> for TranscriptRole {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<TranscriptRole> for String {
    fn from(value: TranscriptRole) -> Self {
        value.as_str().to_string()
    }
}

impl Message {
    pub fn new(role: TranscriptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            persona: None,
            sent_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TranscriptRole::User, content)
    }

    pub fn persona_response(content: impl Into<String>) -> Self {
        Self::new(TranscriptRole::Persona, content)
    }

    pub fn tagged(mut self, persona: Option<&str>) -> Self {
        self.persona = persona.map(str::to_owned);
        self
    }

    pub fn is_user(&self) -> bool {
        self.role == TranscriptRole::User
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_round_trip_through_strings() {
        assert_eq!(TranscriptRole::try_from("persona"), Ok(TranscriptRole::Persona));
        assert!(TranscriptRole::try_from("assistant").is_err());
        assert_eq!(String::from(TranscriptRole::User), "user");
    }

    #[test]
    fn persona_messages_map_to_assistant_api_role() {
        assert_eq!(TranscriptRole::Persona.to_api_role(), "assistant");
        assert_eq!(TranscriptRole::User.to_api_role(), "user");
    }

    #[test]
    fn untagged_messages_omit_persona_field() {
        let json = serde_json::to_value(Message::user("hello")).unwrap();
        assert_eq!(json["role"], "user");
        assert!(json.get("persona").is_none());

        let tagged = Message::persona_response("hi").tagged(Some("plato"));
        let json = serde_json::to_value(tagged).unwrap();
        assert_eq!(json["persona"], "plato");
    }
}
