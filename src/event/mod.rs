//! Identity events mirrored into the user store.
//!
//! Each event kind flows on its own topic:
//! envelope → decrypt → payload → [`Event`] → [`apply`].

mod consumer;
mod kafka;
mod source;

pub use self::consumer::*;
pub use self::kafka::*;
pub use self::source::*;

use std::fmt;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::crypto::{DecryptionError, Decryptor};
use crate::user::{Profile, StoreError, UserRepository};

/// Kind of mutation carried by a topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Edited,
    Deleted,
}

impl EventKind {
    pub const ALL: [EventKind; 3] =
        [EventKind::Created, EventKind::Edited, EventKind::Deleted];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Edited => "edited",
            EventKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Message unit read from the bus.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub ciphertext: String,
}

/// Decrypted content of a create or edit [`Envelope`].
#[derive(Debug, Deserialize, Validate)]
pub struct Payload {
    #[validate(length(min = 1, max = 255, message = "id must be 1 to 255 characters long."))]
    pub id: String,
    #[serde(flatten)]
    pub profile: Profile,
}

/// Decrypted content of a delete [`Envelope`]. Other fields are ignored.
#[derive(Debug, Deserialize, Validate)]
pub struct Identity {
    #[validate(length(min = 1, max = 255, message = "id must be 1 to 255 characters long."))]
    pub id: String,
}

fn parse<T: DeserializeOwned + Validate>(plaintext: &str) -> Result<T, EventError> {
    let payload = serde_json::from_str::<T>(plaintext)
        .map_err(|err| EventError::PayloadMalformed(err.to_string()))?;
    payload
        .validate()
        .map_err(|err| EventError::PayloadMalformed(err.to_string()))?;

    Ok(payload)
}

/// Mutation to apply on the user store.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Created(String, Profile),
    Edited(String, Profile),
    Deleted(String),
}

/// Why a message was discarded.
///
/// None of these are worth retrying: the content itself is unusable.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("envelope is malformed: {0}")]
    EnvelopeMalformed(#[source] serde_json::Error),
    #[error(transparent)]
    Decryption(#[from] DecryptionError),
    #[error("payload is malformed: {0}")]
    PayloadMalformed(String),
}

impl Event {
    /// Decode raw bus bytes of a `kind` topic.
    pub fn decode(
        kind: EventKind,
        raw: &[u8],
        decryptor: &dyn Decryptor,
    ) -> Result<Self, EventError> {
        let envelope = serde_json::from_slice::<Envelope>(raw)
            .map_err(EventError::EnvelopeMalformed)?;
        let plaintext = decryptor.decrypt(&envelope.ciphertext)?;

        Ok(match kind {
            EventKind::Created => {
                let payload = parse::<Payload>(&plaintext)?;
                Event::Created(payload.id, payload.profile)
            },
            EventKind::Edited => {
                let payload = parse::<Payload>(&plaintext)?;
                Event::Edited(payload.id, payload.profile)
            },
            EventKind::Deleted => Event::Deleted(parse::<Identity>(&plaintext)?.id),
        })
    }

    pub fn id(&self) -> &str {
        match self {
            Event::Created(id, _) | Event::Edited(id, _) | Event::Deleted(id) => id,
        }
    }
}

/// Result of a successful [`apply`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Store changed (or was already in the target state).
    Applied,
    /// Target user is absent; nothing to do.
    Skipped,
}

/// Apply `event` to `repo`.
///
/// Safe to call again with the same event after any failure.
pub async fn apply(
    event: &Event,
    repo: &dyn UserRepository,
) -> Result<Outcome, StoreError> {
    match event {
        Event::Created(id, profile) => {
            repo.upsert(id, profile).await?;
            Ok(Outcome::Applied)
        },
        Event::Edited(id, profile) => {
            if repo.update(id, profile).await? {
                Ok(Outcome::Applied)
            } else {
                tracing::info!(user_id = %id, "edit received for unknown user, skipped");
                Ok(Outcome::Skipped)
            }
        },
        Event::Deleted(id) => {
            if repo.delete_by_id(id).await? {
                Ok(Outcome::Applied)
            } else {
                tracing::debug!(user_id = %id, "user already deleted");
                Ok(Outcome::Skipped)
            }
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::{SymmetricCipher, SymmetricKey};
    use crate::user::MemoryUserRepository;

    pub fn cipher() -> SymmetricCipher {
        SymmetricCipher::new(SymmetricKey::from_bytes([0x42; 32]).unwrap())
    }

    /// Wrap `plaintext` as upstream does.
    pub fn envelope(cipher: &SymmetricCipher, plaintext: &str) -> Vec<u8> {
        let ciphertext = cipher.encrypt_to_hex(plaintext).unwrap();
        serde_json::json!({ "ciphertext": ciphertext })
            .to_string()
            .into_bytes()
    }

    fn decode(kind: EventKind, plaintext: &str) -> Result<Event, EventError> {
        let cipher = cipher();
        Event::decode(kind, &envelope(&cipher, plaintext), &cipher)
    }

    #[test]
    fn test_decode_variants() {
        let json = r#"{"id":"u1","username":"alice","firstName":"Alice"}"#;

        let Event::Created(id, profile) = decode(EventKind::Created, json).unwrap() else {
            panic!("excepted created event");
        };
        assert_eq!(id, "u1");
        assert_eq!(profile.username.as_deref(), Some("alice"));
        assert_eq!(profile.first_name.as_deref(), Some("Alice"));

        assert!(matches!(
            decode(EventKind::Edited, json).unwrap(),
            Event::Edited(..)
        ));
        assert_eq!(
            decode(EventKind::Deleted, json).unwrap(),
            Event::Deleted("u1".into())
        );
    }

    #[test]
    fn test_decode_image() {
        let json = r#"{"id":"u1","image":{"data":[137,80,78,71],"contentType":"image/png"}}"#;

        let Event::Created(_, profile) = decode(EventKind::Created, json).unwrap() else {
            panic!("excepted created event");
        };
        let image = profile.image.unwrap();
        assert_eq!(image.data, [137, 80, 78, 71]);
        assert_eq!(image.content_type, "image/png");
    }

    #[test]
    fn test_decode_base64_image() {
        let json = r#"{"id":"u1","username":"alice","image":{"data":"iVBORw==","contentType":"image/png"}}"#;

        let Event::Created(_, profile) = decode(EventKind::Created, json).unwrap() else {
            panic!("excepted created event");
        };
        assert_eq!(profile.image.unwrap().data, [0x89, 0x50, 0x4E, 0x47]);
    }

    #[test]
    fn test_unreadable_image_keeps_profile() {
        let json = r#"{"id":"u1","username":"alice","image":{"data":"%%not base64%%"}}"#;

        let Event::Created(id, profile) = decode(EventKind::Created, json).unwrap() else {
            panic!("excepted created event");
        };
        assert_eq!(id, "u1");
        assert_eq!(profile.username.as_deref(), Some("alice"));
        assert_eq!(profile.image, None);
    }

    #[test]
    fn test_delete_needs_only_id() {
        let json = r#"{"id":"u1","semester":3,"image":{"data":"x"}}"#;

        assert_eq!(
            decode(EventKind::Deleted, json).unwrap(),
            Event::Deleted("u1".into())
        );
        // Same payload is not a valid profile.
        assert!(matches!(
            decode(EventKind::Created, json),
            Err(EventError::PayloadMalformed(_))
        ));
    }

    #[test]
    fn test_decode_errors() {
        let cipher = cipher();

        assert!(matches!(
            Event::decode(EventKind::Created, b"not json", &cipher),
            Err(EventError::EnvelopeMalformed(_))
        ));
        assert!(matches!(
            Event::decode(EventKind::Created, br#"{"payload":"x"}"#, &cipher),
            Err(EventError::EnvelopeMalformed(_))
        ));
        assert!(matches!(
            Event::decode(EventKind::Created, br#"{"ciphertext":"zz"}"#, &cipher),
            Err(EventError::Decryption(_))
        ));
        assert!(matches!(
            decode(EventKind::Created, "hello world"),
            Err(EventError::PayloadMalformed(_))
        ));
        assert!(matches!(
            decode(EventKind::Created, r#"{"username":"alice"}"#),
            Err(EventError::PayloadMalformed(_))
        ));
        assert!(matches!(
            decode(EventKind::Deleted, r#"{"id":""}"#),
            Err(EventError::PayloadMalformed(_))
        ));
        let long_id = format!(r#"{{"id":"{}"}}"#, "u".repeat(256));
        let Err(EventError::PayloadMalformed(message)) = decode(EventKind::Deleted, &long_id) else {
            panic!("excepted malformed payload");
        };
        assert!(message.contains("1 to 255"));
    }

    #[tokio::test]
    async fn test_apply_is_order_tolerant() {
        let repo = MemoryUserRepository::new();
        let edit = Event::Edited(
            "u1".into(),
            Profile {
                email: Some("b@x.com".into()),
                ..Default::default()
            },
        );

        assert_eq!(apply(&edit, &repo).await.unwrap(), Outcome::Skipped);
        assert!(repo.is_empty());

        let delete = Event::Deleted("u1".into());
        assert_eq!(apply(&delete, &repo).await.unwrap(), Outcome::Skipped);
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let repo = MemoryUserRepository::new();
        let events = [
            (EventKind::Created, r#"{"id":"u1","username":"alice","email":"a@x.com"}"#),
            (EventKind::Edited, r#"{"id":"u1","email":"b@x.com"}"#),
        ];

        let event = decode(events[0].0, events[0].1).unwrap();
        apply(&event, &repo).await.unwrap();
        // Redelivery.
        apply(&event, &repo).await.unwrap();

        let user = repo.find_by_id("u1").await.unwrap();
        assert_eq!(repo.len(), 1);
        assert_eq!(user.profile.username.as_deref(), Some("alice"));
        assert_eq!(user.profile.email.as_deref(), Some("a@x.com"));

        let event = decode(events[1].0, events[1].1).unwrap();
        apply(&event, &repo).await.unwrap();

        let user = repo.find_by_id("u1").await.unwrap();
        assert_eq!(user.profile.username.as_deref(), Some("alice"));
        assert_eq!(user.profile.email.as_deref(), Some("b@x.com"));

        let event = decode(EventKind::Deleted, r#"{"id":"u1"}"#).unwrap();
        assert_eq!(apply(&event, &repo).await.unwrap(), Outcome::Applied);
        assert!(matches!(
            repo.find_by_id("u1").await,
            Err(StoreError::NotFound)
        ));
    }
}
