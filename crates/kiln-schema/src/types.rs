//! Newtype wrappers for engine identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }

            /// First 12 bytes, the conventional short form of engine ids.
            /// Ids that cannot be cut there are returned whole.
            pub fn short(&self) -> &str {
                let id = self.0.strip_prefix("sha256:").unwrap_or(&self.0);
                id.get(..12).unwrap_or(id)
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Identifier of an image known to the container engine.
    ImageId
);

string_newtype!(
    /// Identifier of a container created by the container engine.
    ContainerId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_strips_digest_prefix() {
        let id = ImageId::new("sha256:0123456789abcdef0123");
        assert_eq!(id.short(), "0123456789ab");
    }

    #[test]
    fn short_of_short_id_is_whole() {
        let id = ContainerId::new("abc");
        assert_eq!(id.short(), "abc");
    }

    #[test]
    fn short_never_splits_a_character() {
        let id = ImageId::new("sha256:aüüüüüü");
        assert_eq!(id.short(), "aüüüüüü");
        let id = ImageId::new("abcdefghijkü");
        assert_eq!(id.short(), "abcdefghijkü");
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = ImageId::new("img-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"img-1\"");
    }
}
