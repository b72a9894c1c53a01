//! Container → host PID resolution through the runtime's inspection CLI.

use async_trait::async_trait;
use podcap_model::{ContainerRef, ContainerRuntime};
use tokio::process::Command;
use tracing::trace;

use crate::{ExecError, ExecResult};

#[async_trait]
pub trait PidResolver: Send + Sync + 'static {
    /// Host PID of the container's init process.
    async fn resolve(&self, container: &ContainerRef) -> ExecResult<u32>;
}

/// Resolves PIDs with `crictl inspect` (CRI runtimes) or `docker inspect`.
#[derive(Debug, Clone, Default)]
pub struct CriResolver {
    /// CRI endpoint passed as `--runtime-endpoint`, e.g. `unix:///run/containerd/containerd.sock`.
    endpoint: Option<String>,
}

impl CriResolver {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint: endpoint.filter(|e| !e.is_empty()),
        }
    }

    /// Program and arguments of the inspection command for `container`.
    pub fn inspect_command(&self, container: &ContainerRef) -> (String, Vec<String>) {
        match container.runtime {
            ContainerRuntime::Containerd | ContainerRuntime::CriO => {
                let mut args = Vec::with_capacity(8);
                if let Some(endpoint) = &self.endpoint {
                    args.extend(["--runtime-endpoint".to_string(), endpoint.clone()]);
                }
                args.extend(
                    ["inspect", "--output", "go-template", "--template", "{{.info.pid}}"]
                        .map(String::from),
                );
                args.push(container.id.clone());
                ("crictl".into(), args)
            }
            ContainerRuntime::Docker => (
                "docker".into(),
                vec![
                    "inspect".into(),
                    "--format".into(),
                    "{{.State.Pid}}".into(),
                    container.id.clone(),
                ],
            ),
        }
    }
}

#[async_trait]
impl PidResolver for CriResolver {
    async fn resolve(&self, container: &ContainerRef) -> ExecResult<u32> {
        let (program, args) = self.inspect_command(container);
        trace!(target: "podcap.exec.resolve", %program, ?args, "inspecting container");

        let out = Command::new(&program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExecError::Resolve(format!("{program}: {e}")))?;
        if !out.status.success() {
            return Err(ExecError::Resolve(format!(
                "{program} exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        parse_pid(&String::from_utf8_lossy(&out.stdout))
    }
}

/// Always resolves to the same PID. Useful where no container runtime is reachable.
#[derive(Debug, Clone, Copy)]
pub struct FixedResolver(pub u32);

#[async_trait]
impl PidResolver for FixedResolver {
    async fn resolve(&self, _container: &ContainerRef) -> ExecResult<u32> {
        Ok(self.0)
    }
}

fn parse_pid(raw: &str) -> ExecResult<u32> {
    let raw = raw.trim();
    match raw.parse::<u32>() {
        Ok(0) => Err(ExecError::Resolve("container has no running process (pid 0)".into())),
        Ok(pid) => Ok(pid),
        Err(e) => Err(ExecError::Resolve(format!("failed to parse PID {raw:?}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cref(s: &str) -> ContainerRef {
        s.parse().unwrap()
    }

    #[test]
    fn crictl_command_carries_endpoint() {
        let resolver = CriResolver::new(Some("unix:///run/containerd/containerd.sock".into()));
        let (program, args) = resolver.inspect_command(&cref("containerd://abc123"));
        assert_eq!(program, "crictl");
        assert_eq!(
            args,
            [
                "--runtime-endpoint",
                "unix:///run/containerd/containerd.sock",
                "inspect",
                "--output",
                "go-template",
                "--template",
                "{{.info.pid}}",
                "abc123"
            ]
        );

        let (_, args) = CriResolver::new(Some(String::new())).inspect_command(&cref("cri-o://x"));
        assert_eq!(args[0], "inspect");
    }

    #[test]
    fn docker_command() {
        let (program, args) = CriResolver::default().inspect_command(&cref("docker://f00"));
        assert_eq!(program, "docker");
        assert_eq!(args, ["inspect", "--format", "{{.State.Pid}}", "f00"]);
    }

    #[test]
    fn pid_parsing() {
        assert_eq!(parse_pid("4242\n").unwrap(), 4242);
        assert!(parse_pid("0").is_err());
        assert!(parse_pid("<no value>").is_err());
        assert!(parse_pid("").is_err());
    }
}
