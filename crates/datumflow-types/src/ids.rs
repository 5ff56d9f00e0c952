//! Identifier newtypes.

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the inner string.
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

        impl<S: Into<String>> From<S> for $name {
            fn from(value: S) -> Self {
                Self(value.into())
            }
        }
    };
}

string_id!(
    /// Opaque job identifier.
    JobId
);

string_id!(
    /// Opaque pipeline identifier.
    PipelineId
);

string_id!(
    /// Identifier of one unit of work within a job.
    DatumId
);

string_id!(
    /// Reference to an externally stored statistics commit.
    CommitRef
);
