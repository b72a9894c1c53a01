use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::ModelError;

fn split_key(s: &str) -> Result<(&str, &str), ModelError> {
    match s.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((ns, name))
        }
        _ => Err(ModelError::InvalidKey(s.to_string())),
    }
}

/// Identifier of a capture job definition (`namespace/name`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobKey {
    namespace: String,
    name: String,
}

impl JobKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    #[inline]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Identifier of a pod (`namespace/name`); key of the live-capture table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PodKey {
    namespace: String,
    name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    #[inline]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

macro_rules! key_conversions {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}/{}", self.namespace, self.name)
            }
        }

        impl FromStr for $ty {
            type Err = ModelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let (ns, name) = split_key(s)?;
                Ok(Self::new(ns, name))
            }
        }

        impl TryFrom<String> for $ty {
            type Error = ModelError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl From<$ty> for String {
            fn from(key: $ty) -> String {
                key.to_string()
            }
        }
    };
}

key_conversions!(JobKey);
key_conversions!(PodKey);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let key: JobKey = "default/web-capture".parse().unwrap();
        assert_eq!(key.namespace(), "default");
        assert_eq!(key.name(), "web-capture");
        assert_eq!(key.to_string(), "default/web-capture");
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in ["", "noslash", "/name", "ns/", "a/b/c"] {
            assert!(bad.parse::<PodKey>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn serializes_as_string() {
        let key = PodKey::new("kube-system", "coredns-0");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#""kube-system/coredns-0""#);

        let back: PodKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
