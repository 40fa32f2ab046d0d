use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::LimeError;

/// Instance-less address `name@domain`; the unit used for authentication and
/// envelope storage. Comparison and hashing ignore case on both parts.
#[derive(Debug, Clone, Eq)]
pub struct Identity {
    pub name: String,
    pub domain: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
        }
    }

    /// Promotes the identity to a node with the given instance.
    pub fn with_instance(self, instance: impl Into<String>) -> Node {
        Node {
            identity: self,
            instance: Some(instance.into()),
        }
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && self.domain.eq_ignore_ascii_case(&other.domain)
    }
}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.to_ascii_lowercase().hash(state);
        self.domain.to_ascii_lowercase().hash(state);
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.domain)
    }
}

impl FromStr for Identity {
    type Err = LimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, domain) = s
            .split_once('@')
            .ok_or_else(|| LimeError::Protocol(format!("invalid identity '{}': missing '@'", s)))?;
        if name.is_empty() || domain.is_empty() {
            return Err(LimeError::Protocol(format!(
                "invalid identity '{}': empty name or domain",
                s
            )));
        }
        Ok(Identity::new(name, domain))
    }
}

/// Fully qualified endpoint address `name@domain/instance`.
///
/// The instance part is optional; a node without one addresses whichever
/// instance the peer's routing policy selects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    pub identity: Identity,
    pub instance: Option<String>,
}

impl Node {
    pub fn new(identity: Identity, instance: Option<String>) -> Self {
        Self { identity, instance }
    }

    /// Instance-less projection used as the storage and auth key.
    pub fn to_identity(&self) -> Identity {
        self.identity.clone()
    }
}

impl From<Identity> for Node {
    fn from(identity: Identity) -> Self {
        Node {
            identity,
            instance: None,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance {
            Some(instance) => write!(f, "{}/{}", self.identity, instance),
            None => write!(f, "{}", self.identity),
        }
    }
}

impl FromStr for Node {
    type Err = LimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((identity, instance)) if !instance.is_empty() => Ok(Node {
                identity: identity.parse()?,
                instance: Some(instance.to_string()),
            }),
            Some((identity, _)) => Ok(Node {
                identity: identity.parse()?,
                instance: None,
            }),
            None => Ok(Node {
                identity: s.parse()?,
                instance: None,
            }),
        }
    }
}

// Both address types travel on the wire as plain strings.

macro_rules! string_serde {
    ($ty:ident, $expecting:literal) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct StrVisitor;

                impl Visitor<'_> for StrVisitor {
                    type Value = $ty;

                    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.write_str($expecting)
                    }

                    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                        v.parse().map_err(|e: LimeError| de::Error::custom(e))
                    }
                }

                deserializer.deserialize_str(StrVisitor)
            }
        }
    };
}

string_serde!(Identity, "an identity in 'name@domain' form");
string_serde!(Node, "a node address in 'name@domain/instance' form");
