//! Construction of the capture command.

use std::path::Path;

use tokio::process::Command;

/// Parameters of one capture process.
#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec<'a> {
    /// Host PID whose network namespace is entered.
    pub pid: u32,
    /// First output file; rotation appends a numeric suffix.
    pub output: &'a Path,
    pub max_files: u32,
    pub chunk_size_mb: u32,
    pub interface: &'a str,
}

/// Builds the command that captures traffic for a [`LaunchSpec`].
///
/// The supervisor owns everything around the command (process group, stdio, limits), so
/// implementations only choose the program and its arguments.
pub trait CaptureLauncher: Send + Sync + 'static {
    fn command(&self, spec: &LaunchSpec<'_>) -> Command;
}

/// `nsenter --net=/proc/<pid>/ns/net -- tcpdump ...`.
#[derive(Debug, Clone)]
pub struct NsenterTcpdump {
    pub nsenter: String,
    pub tcpdump: String,
}

impl Default for NsenterTcpdump {
    fn default() -> Self {
        Self {
            nsenter: "nsenter".into(),
            tcpdump: "tcpdump".into(),
        }
    }
}

impl CaptureLauncher for NsenterTcpdump {
    fn command(&self, spec: &LaunchSpec<'_>) -> Command {
        let mut cmd = Command::new(&self.nsenter);
        cmd.arg(format!("--net=/proc/{}/ns/net", spec.pid))
            .arg("--")
            .arg(&self.tcpdump)
            .args(["-C", &spec.chunk_size_mb.to_string()])
            .args(["-W", &spec.max_files.to_string()])
            .arg("-w")
            .arg(spec.output)
            .args(["-i", spec.interface]);
        cmd
    }
}

/// Arbitrary program whose arguments may reference `{pid}`, `{output}`, `{files}`,
/// `{chunk}` and `{iface}`.
#[derive(Debug, Clone)]
pub struct TemplateLauncher {
    program: String,
    args: Vec<String>,
}

impl TemplateLauncher {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn render(&self, arg: &str, spec: &LaunchSpec<'_>) -> String {
        arg.replace("{pid}", &spec.pid.to_string())
            .replace("{output}", &spec.output.to_string_lossy())
            .replace("{files}", &spec.max_files.to_string())
            .replace("{chunk}", &spec.chunk_size_mb.to_string())
            .replace("{iface}", spec.interface)
    }
}

impl CaptureLauncher for TemplateLauncher {
    fn command(&self, spec: &LaunchSpec<'_>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args.iter().map(|arg| self.render(arg, spec)));
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn spec(output: &Path) -> LaunchSpec<'_> {
        LaunchSpec {
            pid: 4242,
            output,
            max_files: 3,
            chunk_size_mb: 1,
            interface: "eth0",
        }
    }

    #[test]
    fn nsenter_tcpdump_arguments() {
        let output = Path::new("/captures/capture-web-web-0.pcap");
        let cmd = NsenterTcpdump::default().command(&spec(output));
        assert_eq!(cmd.as_std().get_program(), "nsenter");
        assert_eq!(
            args(&cmd),
            [
                "--net=/proc/4242/ns/net",
                "--",
                "tcpdump",
                "-C",
                "1",
                "-W",
                "3",
                "-w",
                "/captures/capture-web-web-0.pcap",
                "-i",
                "eth0"
            ]
        );
    }

    #[test]
    fn template_placeholders() {
        let output = Path::new("/tmp/out.pcap");
        let launcher = TemplateLauncher::new("sh", ["-c", "touch {output} && sleep {files}", "{pid}-{iface}"]);
        let cmd = launcher.command(&spec(output));
        assert_eq!(cmd.as_std().get_program(), "sh");
        assert_eq!(args(&cmd), ["-c", "touch /tmp/out.pcap && sleep 3", "4242-eth0"]);
    }
}
