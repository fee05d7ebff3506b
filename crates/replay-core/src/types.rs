//! Identifier and enum types shared across the engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for core types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The provided value was empty.
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    /// Invalid recording mode value.
    #[error("invalid recording mode: {value}")]
    InvalidRecordingMode { value: String },

    /// Invalid sample decision value.
    #[error("invalid sample decision: {value}")]
    InvalidSampleDecision { value: String },
}

/// Generates a validated string ID newtype with common trait implementations.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new ID after validation.
            pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into();
                if id.is_empty() {
                    return Err(ValidationError::Empty { field: $field_name });
                }
                Ok(Self(id))
            }

            /// Returns the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_string_id!(
    /// A validated replay (session) identifier.
    ///
    /// Generated as a hyphen-less v4 UUID when a session is created; loaded
    /// verbatim from storage for sticky sessions.
    ReplayId, "replay ID"
);

impl ReplayId {
    /// Generates a fresh random replay ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

/// Which recording mode the engine runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordingMode {
    /// Every event is recorded and flushed on the debounce schedule.
    #[default]
    Session,
    /// Only a rolling window is kept until an error promotes the replay.
    Buffer,
}

impl RecordingMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Buffer => "buffer",
        }
    }
}

impl fmt::Display for RecordingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordingMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Self::Session),
            "buffer" => Ok(Self::Buffer),
            _ => Err(ValidationError::InvalidRecordingMode {
                value: s.to_string(),
            }),
        }
    }
}

/// Sampling outcome fixed when a session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleDecision {
    /// Full session recording.
    Session,
    /// Error-triggered recording only.
    Buffer,
    /// Not recorded at all.
    Unsampled,
}

impl SampleDecision {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Buffer => "buffer",
            Self::Unsampled => "unsampled",
        }
    }
}

impl fmt::Display for SampleDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RecordingMode> for SampleDecision {
    fn from(mode: RecordingMode) -> Self {
        match mode {
            RecordingMode::Session => Self::Session,
            RecordingMode::Buffer => Self::Buffer,
        }
    }
}

impl std::str::FromStr for SampleDecision {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Self::Session),
            "buffer" => Ok(Self::Buffer),
            "unsampled" => Ok(Self::Unsampled),
            _ => Err(ValidationError::InvalidSampleDecision {
                value: s.to_string(),
            }),
        }
    }
}
