use crate::error::{Error, Result};
use serde::de::{Deserializer, Error as _};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

/// URI scheme prefix of entity ids.
pub const ENTITY_URI_PREFIX: &str = "of:";

/// Content-addressed identifier of an entity within a space.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct EntityId([u8; 32]);

impl EntityId {
    /// Creates an id from raw bytes.
    pub fn new(id: [u8; 32]) -> Self {
        Self(id)
    }

    /// Generates a random id.
    ///
    /// Used as the fallback when a referent has no stable identity yet;
    /// callers relying on determinism must pre-assign ids.
    pub fn random() -> Result<Self> {
        let mut id = [0; 32];
        getrandom::getrandom(&mut id)
            .map_err(|err| Error::InvalidIdentity(err.to_string()))?;
        Ok(Self(id))
    }

    /// Returns the `of:` URI form.
    pub fn to_uri(&self) -> String {
        format!("{}{}", ENTITY_URI_PREFIX, self)
    }

    /// Parses an id from its `of:` URI form.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let hash = uri
            .strip_prefix(ENTITY_URI_PREFIX)
            .ok_or_else(|| Error::InvalidIdentity(format!("not an entity uri: {}", uri)))?;
        hash.parse()
    }

    /// Parses either the bare hash form or the `of:` URI form.
    pub fn parse_flexible(s: &str) -> Result<Self> {
        if s.starts_with(ENTITY_URI_PREFIX) {
            Self::from_uri(s)
        } else {
            s.parse()
        }
    }
}

impl From<EntityId> for [u8; 32] {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl AsRef<[u8; 32]> for EntityId {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..2]))
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut id = [0; 44];
        base64::encode_config_slice(&self.0, base64::URL_SAFE, &mut id);
        write!(f, "{}", std::str::from_utf8(&id).expect("base64 is ascii"))
    }
}

impl std::str::FromStr for EntityId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 44 {
            return Err(Error::InvalidIdentity(format!(
                "invalid entity id length {}",
                s.len()
            )));
        }
        let mut id = [0; 32];
        base64::decode_config_slice(s, base64::URL_SAFE, &mut id)
            .map_err(|err| Error::InvalidIdentity(err.to_string()))?;
        Ok(Self(id))
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        // Canonical sigil form: {"/": "<hash>"}.
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("/", &self.to_string())?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Sigil {
            #[serde(rename = "/")]
            hash: String,
        }
        let sigil = Sigil::deserialize(deserializer)?;
        EntityId::parse_flexible(&sigil.hash).map_err(D::Error::custom)
    }
}

/// A named, independently addressable memory scope for entities. DID-shaped.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct SpaceId(String);

impl SpaceId {
    /// Returns the DID string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SpaceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if !s.starts_with("did:") {
            return Err(Error::InvalidIdentity(format!("not a did: {}", s)));
        }
        Ok(Self(s.to_string()))
    }
}

/// Media type of a document. `application/json` is traversable; everything
/// else is an opaque blob.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MediaType {
    /// `application/json`.
    Json,
    /// Any other media type, kept verbatim.
    Other(String),
}

impl Default for MediaType {
    fn default() -> Self {
        Self::Json
    }
}

impl MediaType {
    /// True for `application/json`.
    pub fn is_json(&self) -> bool {
        matches!(self, Self::Json)
    }

    /// Returns the media type string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Json => "application/json",
            Self::Other(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MediaType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(if s == "application/json" {
            Self::Json
        } else {
            Self::Other(s.to_string())
        })
    }
}

impl Serialize for MediaType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MediaType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().expect("media type parse is infallible"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_round_trip() {
        let id = EntityId::new([7; 32]);
        let uri = id.to_uri();
        assert!(uri.starts_with("of:"));
        assert_eq!(EntityId::from_uri(&uri).unwrap(), id);
    }

    #[test]
    fn sigil_round_trip() {
        let id = EntityId::new([9; 32]);
        let json = serde_json::to_string(&id).unwrap();
        let back: EntityId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn space_requires_did() {
        assert!("did:key:z6Mk".parse::<SpaceId>().is_ok());
        assert!("key:z6Mk".parse::<SpaceId>().is_err());
    }
}
