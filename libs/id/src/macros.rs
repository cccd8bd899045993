//! Macros for defining typed ID types.

/// Length of the long-form hex body (`i-0123456789abcdef0`).
pub const LONG_BODY_LEN: usize = 17;

/// Length of the legacy short-form hex body (`ami-5fb8c835`).
pub const SHORT_BODY_LEN: usize = 8;

/// Returns true if `body` is a well-formed hex body.
#[doc(hidden)]
pub fn is_valid_body(body: &str) -> bool {
    (body.len() == LONG_BODY_LEN || body.len() == SHORT_BODY_LEN)
        && body
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Macro to define a typed ID with a specific prefix.
///
/// This generates a newtype wrapper around the canonical string with:
/// - A `PREFIX` constant
/// - `from_sequence()` to mint a deterministic ID
/// - `parse()` to parse from string
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations
/// - `Ord`, `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_id!(InstanceId, "i");
/// define_id!(VolumeId, "vol");
///
/// let vm = InstanceId::from_sequence(1);
/// let parsed: VolumeId = "vol-049df61146c4d7901".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        /// A typed ID for this resource type.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// The prefix for this ID type.
            pub const PREFIX: &'static str = $prefix;

            /// Mints a deterministic ID from a sequence number.
            #[must_use]
            pub fn from_sequence(seq: u64) -> Self {
                Self(format!("{}-{:017x}", Self::PREFIX, seq))
            }

            /// Parses an ID from a string.
            ///
            /// The string must be in the format `{prefix}-{hex}`.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let Some((prefix, body)) = s.rsplit_once('-') else {
                    return Err($crate::IdError::MissingSeparator(s.to_string()));
                };

                if prefix != Self::PREFIX {
                    return Err($crate::IdError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }

                if !$crate::__is_valid_body(body) {
                    return Err($crate::IdError::InvalidBody {
                        body: body.to_string(),
                    });
                }

                Ok(Self(s.to_string()))
            }

            /// Returns the canonical string form.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}
