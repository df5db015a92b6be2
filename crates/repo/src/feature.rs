//! Compatibility check between the features a repository requires and the
//! features this build understands.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RepoError;

/// Features this build supports. Entries are short, human-readable and
/// immutable once a release starts requiring them.
pub const SUPPORTED_FEATURES: &[&str] = &["index-v1", "index-v2"];

/// Name of a repository feature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Feature(String);

impl Feature {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Feature {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What a client that does not understand a feature should do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IfNotUnderstood {
    /// Only warn instead of refusing to open the repository
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub warn: bool,
    /// Message shown instead of the generic one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Link with more information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A feature the repository requires, with its policy for clients that
/// don't support it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequiredFeature {
    pub feature: Feature,
    #[serde(default)]
    pub if_not_understood: IfNotUnderstood,
}

impl RequiredFeature {
    /// A feature that fails hard when missing.
    pub fn new(feature: impl Into<Feature>) -> Self {
        Self {
            feature: feature.into(),
            if_not_understood: IfNotUnderstood::default(),
        }
    }

    /// A feature that only warns when missing.
    pub fn warn_only(feature: impl Into<Feature>) -> Self {
        let mut f = Self::new(feature);
        f.if_not_understood.warn = true;
        f
    }

    pub fn unsupported_message(&self) -> String {
        let mut msg = match &self.if_not_understood.message {
            Some(m) if !m.is_empty() => m.clone(),
            _ => format!(
                "This version of strongbox does not support feature '{}'.",
                self.feature
            ),
        };
        if let Some(url) = self.if_not_understood.url.as_deref().filter(|u| !u.is_empty()) {
            msg.push_str("\nSee: ");
            msg.push_str(url);
        }
        msg
    }
}

/// Required features missing from `supported`, in the order they are
/// declared.
pub fn unsupported_features<'a, S: AsRef<str>>(
    required: &'a [RequiredFeature],
    supported: &[S],
) -> Vec<&'a RequiredFeature> {
    required
        .iter()
        .filter(|r| !supported.iter().any(|s| s.as_ref() == r.feature.as_str()))
        .collect()
}

/// Fail if any required feature is missing and its policy is not
/// warn-only. With `ignore_missing` every missing feature only warns.
pub fn check_required_features<S: AsRef<str>>(
    required: &[RequiredFeature],
    supported: &[S],
    ignore_missing: bool,
) -> Result<(), RepoError> {
    for missing in unsupported_features(required, supported) {
        let message = missing.unsupported_message();
        if ignore_missing || missing.if_not_understood.warn {
            tracing::warn!(feature = %missing.feature, "{}", message);
            continue;
        }
        return Err(RepoError::Incompatible {
            feature: missing.feature.to_string(),
            message,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required(names: &[&str]) -> Vec<RequiredFeature> {
        names.iter().map(|n| RequiredFeature::new(*n)).collect()
    }

    #[test]
    fn test_all_supported_passes() {
        let req = required(&["index-v1", "index-v2"]);
        assert!(check_required_features(&req, SUPPORTED_FEATURES, false).is_ok());
    }

    #[test]
    fn test_missing_hard_feature_fails_with_message() {
        let req = required(&["index-v1", "index-v2"]);
        let err = check_required_features(&req, &["index-v1"], false).unwrap_err();
        match err {
            RepoError::Incompatible { feature, message } => {
                assert_eq!(feature, "index-v2");
                assert_eq!(
                    message,
                    "This version of strongbox does not support feature 'index-v2'."
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_warn_only_and_ignore_flag_pass() {
        let req = vec![RequiredFeature::new("index-v1"), RequiredFeature::warn_only("epoch-v9")];
        assert!(check_required_features(&req, SUPPORTED_FEATURES, false).is_ok());

        let req = required(&["index-v3"]);
        assert!(check_required_features(&req, SUPPORTED_FEATURES, true).is_ok());
        assert!(check_required_features(&req, SUPPORTED_FEATURES, false).is_err());
    }

    #[test]
    fn test_gate_fails_iff_some_hard_feature_missing() {
        let supported = ["a", "b"];
        let cases: Vec<(Vec<RequiredFeature>, bool)> = vec![
            (vec![], false),
            (required(&["a", "b"]), false),
            (vec![RequiredFeature::warn_only("c")], false),
            (vec![RequiredFeature::warn_only("c"), RequiredFeature::new("d")], true),
            (vec![RequiredFeature::new("d"), RequiredFeature::warn_only("c")], true),
        ];
        for (req, should_fail) in cases {
            assert_eq!(
                check_required_features(&req, &supported, false).is_err(),
                should_fail,
                "{req:?}"
            );
            assert!(check_required_features(&req, &supported, true).is_ok());
        }
    }

    #[test]
    fn test_custom_message_and_url() {
        let mut f = RequiredFeature::new("x");
        f.if_not_understood.message = Some("Upgrade now.".into());
        f.if_not_understood.url = Some("https://example.com/x".into());
        assert_eq!(f.unsupported_message(), "Upgrade now.\nSee: https://example.com/x");
    }

    #[test]
    fn test_json_shape() {
        let f = RequiredFeature::warn_only("index-v2");
        let v = serde_json::to_value(&f).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"feature": "index-v2", "ifNotUnderstood": {"warn": true}})
        );
        let parsed: RequiredFeature = serde_json::from_value(serde_json::json!({"feature": "f"})).unwrap();
        assert_eq!(parsed, RequiredFeature::new("f"));
    }
}
