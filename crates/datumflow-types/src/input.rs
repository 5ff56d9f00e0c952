//! Datum input descriptors.
//!
//! One datum is defined by an ordered set of inputs. Each input is either a
//! reference into the platform's content-addressed filesystem or an external
//! git checkout. The variant is an explicit discriminator so the staging
//! layer has a single dispatch point.

use serde::{Deserialize, Serialize};

/// Data source for one input of a datum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Input {
    /// Files selected from a content-addressed repo by path glob.
    File {
        repo: String,
        glob: String,
        /// Subpath of the scratch directory this input is staged under.
        name: String,
    },
    /// A git checkout of `reference` from `url`.
    Git {
        url: String,
        reference: String,
        name: String,
    },
}

impl Input {
    /// The per-input staging subpath.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::File { name, .. } | Self::Git { name, .. } => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_input_tagged_serde() {
        let input = Input::File {
            repo: "images".into(),
            glob: "/*".into(),
            name: "images".into(),
        };
        let json = serde_json::to_string(&input).unwrap();
        assert!(json.contains("\"kind\":\"file\""));
        let back: Input = serde_json::from_str(&json).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn git_input_tagged_serde() {
        let input = Input::Git {
            url: "https://example.com/repo.git".into(),
            reference: "refs/heads/main".into(),
            name: "source".into(),
        };
        let json = serde_json::to_string(&input).unwrap();
        assert!(json.contains("\"kind\":\"git\""));
        let back: Input = serde_json::from_str(&json).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn name_dispatches_over_variants() {
        let file = Input::File {
            repo: "r".into(),
            glob: "/*".into(),
            name: "a".into(),
        };
        let git = Input::Git {
            url: "u".into(),
            reference: "main".into(),
            name: "b".into(),
        };
        assert_eq!(file.name(), "a");
        assert_eq!(git.name(), "b");
    }
}
