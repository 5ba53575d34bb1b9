mod memory;
mod postgres;
mod repository;

pub use memory::*;
pub use postgres::*;
pub use repository::{StoreError, UserRepository};

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};

/// User as mirrored from the identity system.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(flatten)]
    pub profile: Profile,
}

/// Every field of a [`User`] except its `id`.
///
/// Also used as a partial update: `None` means "leave untouched".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semester: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub career: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_image",
        skip_serializing_if = "Option::is_none"
    )]
    pub image: Option<Image>,
}

/// Profile picture.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// Raw bytes, or a base64 string on input.
    #[serde(deserialize_with = "image_data")]
    pub data: Vec<u8>,
    pub content_type: String,
}

fn image_data<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Data {
        Bytes(Vec<u8>),
        Base64(String),
    }

    match Data::deserialize(deserializer)? {
        Data::Bytes(bytes) => Ok(bytes),
        Data::Base64(encoded) => STANDARD
            .decode(encoded.trim())
            .map_err(serde::de::Error::custom),
    }
}

/// An unreadable image is dropped; the rest of the profile is kept.
fn lenient_image<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Image>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum MaybeImage {
        Image(Image),
        Other(IgnoredAny),
    }

    Ok(match MaybeImage::deserialize(deserializer)? {
        MaybeImage::Image(image) => Some(image),
        MaybeImage::Other(_) => None,
    })
}

impl Profile {
    /// Copy every supplied field of `patch` over `self`.
    pub fn merge(&mut self, patch: &Profile) {
        fn set<T: Clone>(field: &mut Option<T>, value: &Option<T>) {
            if let Some(value) = value {
                *field = Some(value.clone());
            }
        }

        set(&mut self.username, &patch.username);
        set(&mut self.email, &patch.email);
        set(&mut self.first_name, &patch.first_name);
        set(&mut self.last_name, &patch.last_name);
        set(&mut self.address, &patch.address);
        set(&mut self.phone, &patch.phone);
        set(&mut self.semester, &patch.semester);
        set(&mut self.parallel, &patch.parallel);
        set(&mut self.career, &patch.career);
        set(&mut self.description, &patch.description);
        set(&mut self.image, &patch.image);
    }
}

/// Fields exposed on reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    Username,
    Email,
    FirstName,
    LastName,
    Address,
    Phone,
    Semester,
    Parallel,
    Career,
    Description,
}

impl Field {
    pub const ALL: [Field; 10] = [
        Field::Username,
        Field::Email,
        Field::FirstName,
        Field::LastName,
        Field::Address,
        Field::Phone,
        Field::Semester,
        Field::Parallel,
        Field::Career,
        Field::Description,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            Field::Username => "username",
            Field::Email => "email",
            Field::FirstName => "firstName",
            Field::LastName => "lastName",
            Field::Address => "address",
            Field::Phone => "phone",
            Field::Semester => "semester",
            Field::Parallel => "parallel",
            Field::Career => "career",
            Field::Description => "description",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Field name is not a read field.
#[derive(Debug, thiserror::Error)]
#[error("unknown field '{0}'")]
pub struct UnknownField(pub String);

impl FromStr for Field {
    type Err = UnknownField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Field::ALL
            .into_iter()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| UnknownField(s.to_owned()))
    }
}

/// Selection of fields to populate on read.
#[derive(Clone, Debug, PartialEq)]
pub struct Projection(Vec<Field>);

impl Default for Projection {
    fn default() -> Self {
        Self(Field::ALL.to_vec())
    }
}

impl Projection {
    /// Create a [`Projection`] over `fields`.
    pub fn new(fields: impl IntoIterator<Item = Field>) -> Self {
        Self(fields.into_iter().collect())
    }

    /// Parse a comma separated list such as `username,email`.
    /// An empty list means every read field.
    pub fn parse(list: &str) -> Result<Self, UnknownField> {
        let fields = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Field::from_str)
            .collect::<Result<Vec<_>, _>>()?;

        if fields.is_empty() {
            Ok(Self::default())
        } else {
            Ok(Self(fields))
        }
    }

    /// Projected fields, in request order.
    pub fn fields(&self) -> &[Field] {
        &self.0
    }

    pub fn contains(&self, field: Field) -> bool {
        self.0.contains(&field)
    }

    /// Keep only projected fields of `user`.
    pub fn apply(&self, user: User) -> User {
        let keep = |field: Field, value: Option<String>| {
            value.filter(|_| self.contains(field))
        };
        let p = user.profile;

        User {
            id: user.id,
            profile: Profile {
                username: keep(Field::Username, p.username),
                email: keep(Field::Email, p.email),
                first_name: keep(Field::FirstName, p.first_name),
                last_name: keep(Field::LastName, p.last_name),
                address: keep(Field::Address, p.address),
                phone: keep(Field::Phone, p.phone),
                semester: keep(Field::Semester, p.semester),
                parallel: keep(Field::Parallel, p.parallel),
                career: keep(Field::Career, p.career),
                description: keep(Field::Description, p.description),
                image: None,
            },
        }
    }
}
