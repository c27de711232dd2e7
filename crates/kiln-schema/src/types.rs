//! String newtypes for the identifiers threaded between builds.
//!
//! Each one serializes as a plain string so lockfiles, manifests and build
//! info documents stay readable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
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

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
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
    /// Content hash identifying a built image, as reported by the backend
    /// that produced it (`sha256:...` for the daemon, `blake3:...` for direct).
    ImageId
);

string_newtype!(
    /// Human-facing image reference such as `registry/app:1.2`.
    ImageTag
);

string_newtype!(
    /// Identifier of a project taking part in a multi-project build run.
    ProjectId
);

string_newtype!(
    /// Blake3 hash of a blob in the object store.
    ObjectHash
);

impl ImageId {
    /// Hex digest with any `algo:` prefix removed, truncated to 12 characters.
    pub fn short(&self) -> &str {
        let hex = self.0.split_once(':').map_or(self.0.as_str(), |(_, h)| h);
        hex.get(..12).unwrap_or(hex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_id_short_strips_algorithm() {
        let id = ImageId::new("sha256:0123456789abcdef0123");
        assert_eq!(id.short(), "0123456789ab");
    }

    #[test]
    fn image_id_short_without_prefix() {
        assert_eq!(ImageId::new("abc").short(), "abc");
    }

    #[test]
    fn tag_serializes_as_plain_string() {
        let tag = ImageTag::new("local/app:1");
        assert_eq!(serde_json::to_string(&tag).unwrap(), "\"local/app:1\"");
        let back: ImageTag = serde_json::from_str("\"local/app:1\"").unwrap();
        assert_eq!(back, tag);
    }

    #[test]
    fn project_id_compares_with_str() {
        let id = ProjectId::from("base");
        assert_eq!(id, "base");
        assert_eq!(id.to_string(), "base");
    }
}
