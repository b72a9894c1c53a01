use std::{fmt, str::FromStr};

use crate::ModelError;

/// Container runtimes whose PIDs the agent knows how to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerRuntime {
    Containerd,
    CriO,
    Docker,
}

impl ContainerRuntime {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerRuntime::Containerd => "containerd",
            ContainerRuntime::CriO => "cri-o",
            ContainerRuntime::Docker => "docker",
        }
    }
}

impl FromStr for ContainerRuntime {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "containerd" => Ok(ContainerRuntime::Containerd),
            "cri-o" | "crio" => Ok(ContainerRuntime::CriO),
            "docker" => Ok(ContainerRuntime::Docker),
            other => Err(ModelError::UnsupportedRuntime(other.to_string())),
        }
    }
}

/// Runtime-qualified container identifier, parsed from `<runtime>://<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerRef {
    pub runtime: ContainerRuntime,
    pub id: String,
}

impl FromStr for ContainerRef {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (runtime, id) = s
            .split_once("://")
            .filter(|(rt, id)| !rt.is_empty() && !id.is_empty())
            .ok_or_else(|| ModelError::InvalidContainerId(s.to_string()))?;

        Ok(Self {
            runtime: runtime.parse()?,
            id: id.to_string(),
        })
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.runtime.as_str(), self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_runtimes() {
        let c: ContainerRef = "containerd://abc123".parse().unwrap();
        assert_eq!(c.runtime, ContainerRuntime::Containerd);
        assert_eq!(c.id, "abc123");

        let c: ContainerRef = "crio://def".parse().unwrap();
        assert_eq!(c.runtime, ContainerRuntime::CriO);

        let c: ContainerRef = "docker://f00".parse().unwrap();
        assert_eq!(c.runtime, ContainerRuntime::Docker);
    }

    #[test]
    fn rejects_malformed_identifiers() {
        assert!(matches!(
            "abc123".parse::<ContainerRef>(),
            Err(ModelError::InvalidContainerId(_))
        ));
        assert!(matches!(
            "containerd://".parse::<ContainerRef>(),
            Err(ModelError::InvalidContainerId(_))
        ));
    }

    #[test]
    fn rejects_unsupported_runtime() {
        assert_eq!(
            "rkt://abc".parse::<ContainerRef>(),
            Err(ModelError::UnsupportedRuntime("rkt".into()))
        );
    }
}
