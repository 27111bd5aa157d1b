//! Remote command execution abstraction

use async_trait::async_trait;
use pfsmon_core::{Host, PfsError, Result, SshLogin, TransportConfig};
use std::collections::HashMap;
use std::path::Path;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::checksum::{parse_sha256sum, sha256_file};

/// Output from a remote command that exited 0
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// Trait for running commands on cluster hosts (allows mocking in tests)
///
/// Implementations must be safe to call again with the same arguments:
/// retries re-issue the exact same command.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a shell command on `host`
    ///
    /// A non-zero exit is `PfsError::Exec`, an unreachable host is
    /// `PfsError::Connect` and running past `timeout` is `PfsError::Timeout`.
    async fn run(&self, host: &str, command: &str, timeout: Duration) -> Result<CommandOutput>;

    /// Copy a local file to `remote_path` on `host`
    async fn push_file(&self, host: &str, local_path: &Path, remote_path: &str) -> Result<()>;
}

#[async_trait]
impl<T: RemoteExecutor + ?Sized> RemoteExecutor for Arc<T> {
    async fn run(&self, host: &str, command: &str, timeout: Duration) -> Result<CommandOutput> {
        (**self).run(host, command, timeout).await
    }

    async fn push_file(&self, host: &str, local_path: &Path, remote_path: &str) -> Result<()> {
        (**self).push_file(host, local_path, remote_path).await
    }
}

/// Quote a string for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn is_local(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// scp exits 1 whether the copy or the underlying ssh connection failed
fn is_connect_failure(stderr: &str) -> bool {
    const MARKERS: [&str; 7] = [
        "ssh: connect to host",
        "Could not resolve hostname",
        "Connection refused",
        "Connection timed out",
        "No route to host",
        "lost connection",
        "Permission denied (publickey",
    ];
    MARKERS.iter().any(|m| stderr.contains(m))
}

/// Real executor backed by the `ssh` and `scp` programs
///
/// Hosts named `localhost` are handled in-process with `sh -c` and a plain
/// file copy. Per-host logins from the registry override the transport's
/// user and identity file.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    transport: TransportConfig,
    transfer_timeout: Duration,
    logins: HashMap<String, SshLogin>,
}

impl SshExecutor {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            transfer_timeout: Duration::from_secs(300),
            logins: HashMap::new(),
        }
    }

    /// Use the ssh login overrides carried by these hosts
    pub fn with_logins<'a>(mut self, hosts: impl IntoIterator<Item = &'a Host>) -> Self {
        for host in hosts {
            if !host.login.is_empty() {
                self.logins.insert(host.address.clone(), host.login.clone());
            }
        }
        self
    }

    /// Upper bound on one file transfer
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    fn destination(&self, host: &str) -> String {
        let login = self.logins.get(host);
        let target = login.and_then(|l| l.hostname.as_deref()).unwrap_or(host);
        let user = login
            .and_then(|l| l.user.as_ref())
            .or(self.transport.user.as_ref());
        match user {
            Some(user) => format!("{}@{}", user, target),
            None => target.to_string(),
        }
    }

    fn common_options(&self, host: &str, cmd: &mut Command) {
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.transport.connect_timeout_secs));
        let identity = self
            .logins
            .get(host)
            .and_then(|l| l.identity_file.as_ref())
            .or(self.transport.identity_file.as_ref());
        if let Some(identity) = identity {
            cmd.arg("-i").arg(identity);
        }
    }

    fn ssh_command(&self, host: &str, command: &str) -> Command {
        if is_local(host) {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            return cmd;
        }

        let mut cmd = Command::new(&self.transport.ssh_program);
        self.common_options(host, &mut cmd);
        if let Some(port) = self.transport.port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg(self.destination(host)).arg(command);
        cmd
    }

    fn scp_command(&self, host: &str, local_path: &Path, remote_path: &str) -> Command {
        let mut cmd = Command::new(&self.transport.scp_program);
        self.common_options(host, &mut cmd);
        if let Some(port) = self.transport.port {
            cmd.arg("-P").arg(port.to_string());
        }
        cmd.arg(local_path)
            .arg(format!("{}:{}", self.destination(host), remote_path));
        cmd
    }

    async fn output_within(
        &self,
        host: &str,
        mut cmd: Command,
        timeout: Duration,
    ) -> Result<Output> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(PfsError::Io(e)),
            Err(_) => Err(PfsError::Timeout {
                host: host.to_string(),
                after: timeout,
            }),
        }
    }

    fn classify(&self, host: &str, output: Output) -> Result<CommandOutput> {
        let output = CommandOutput::from(output);
        match output.exit_code {
            0 => Ok(output),
            // ssh reserves 255 for its own failures (refused, auth, DNS)
            255 if !is_local(host) => Err(PfsError::connect(host, output.stderr.trim())),
            code => Err(PfsError::Exec {
                host: host.to_string(),
                exit_code: code,
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    fn classify_transfer(&self, host: &str, output: Output) -> Result<()> {
        let output = CommandOutput::from(output);
        match output.exit_code {
            0 => Ok(()),
            _ if is_connect_failure(&output.stderr) => {
                Err(PfsError::connect(host, output.stderr.trim()))
            }
            code => Err(PfsError::Exec {
                host: host.to_string(),
                exit_code: code,
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    async fn copy_local(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let dest = Path::new(remote_path);
        if let Some(dir) = dest.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::copy(local_path, dest).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    #[instrument(skip(self), fields(local = is_local(host)))]
    async fn run(&self, host: &str, command: &str, timeout: Duration) -> Result<CommandOutput> {
        debug!("Running on {}: {}", host, command);

        let output = self
            .output_within(host, self.ssh_command(host, command), timeout)
            .await?;
        let result = self.classify(host, output);

        if let Err(e) = &result {
            debug!("Command failed on {}: {}", host, e);
        }
        result
    }

    #[instrument(skip(self), fields(local = is_local(host)))]
    async fn push_file(&self, host: &str, local_path: &Path, remote_path: &str) -> Result<()> {
        let expected = sha256_file(local_path).await?;
        debug!("Pushing {} to {}:{}", local_path.display(), host, remote_path);

        if is_local(host) {
            self.copy_local(local_path, remote_path).await?;
        } else {
            // Exit 255 here surfaces as Connect before scp muddies it
            let reach = Duration::from_secs(self.transport.connect_timeout_secs.max(1) * 2);
            self.run(host, "true", reach).await?;

            let output = self
                .output_within(
                    host,
                    self.scp_command(host, local_path, remote_path),
                    self.transfer_timeout,
                )
                .await?;
            self.classify_transfer(host, output)?;
        }

        let check = format!("sha256sum {}", shell_quote(remote_path));
        let output = self.run(host, &check, self.transfer_timeout).await?;
        let actual = parse_sha256sum(&output.stdout)?;

        if actual != expected {
            return Err(PfsError::Exec {
                host: host.to_string(),
                exit_code: 1,
                stderr: format!(
                    "checksum mismatch for {}: expected {}, got {}",
                    remote_path, expected, actual
                ),
            });
        }

        debug!("Verified {}:{} ({})", host, remote_path, actual);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfsmon_core::Role;
    use tempfile::TempDir;

    fn executor() -> SshExecutor {
        SshExecutor::new(TransportConfig::default())
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/etc/a b"), "'/etc/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_destination_with_user() {
        let mut transport = TransportConfig::default();
        transport.user = Some("root".to_string());
        let exec = SshExecutor::new(transport);
        assert_eq!(exec.destination("oss01"), "root@oss01");
        assert_eq!(executor().destination("oss01"), "oss01");
    }

    #[test]
    fn test_per_host_login_overrides_transport() {
        let mut transport = TransportConfig::default();
        transport.user = Some("root".to_string());
        transport.identity_file = Some("/root/.ssh/id_cluster".into());

        let oss01 = Host::new("oss01", [Role::ObjectStorage]).with_login(SshLogin {
            hostname: Some("oss01-ib.lab".to_string()),
            user: Some("admin".to_string()),
            identity_file: Some("/root/.ssh/oss_key".into()),
        });
        let oss02 = Host::new("oss02", [Role::ObjectStorage]);
        let exec = SshExecutor::new(transport).with_logins([&oss01, &oss02]);

        assert_eq!(exec.destination("oss01"), "admin@oss01-ib.lab");
        assert_eq!(exec.destination("oss02"), "root@oss02");

        let args = |host: &str| -> Vec<String> {
            exec.ssh_command(host, "true")
                .as_std()
                .get_args()
                .map(|a| a.to_string_lossy().into_owned())
                .collect()
        };
        let oss01_args = args("oss01");
        assert!(oss01_args.contains(&"/root/.ssh/oss_key".to_string()));
        assert!(!oss01_args.contains(&"/root/.ssh/id_cluster".to_string()));
        assert_eq!(oss01_args.last().map(String::as_str), Some("true"));
        assert!(args("oss02").contains(&"/root/.ssh/id_cluster".to_string()));
    }

    #[test]
    fn test_scp_connection_failures_are_connect_errors() {
        assert!(is_connect_failure(
            "ssh: connect to host oss01 port 22: Connection refused\r\nlost connection"
        ));
        assert!(is_connect_failure(
            "ssh: Could not resolve hostname oss09: Name or service not known"
        ));
        assert!(!is_connect_failure(
            "scp: /etc/lustre/ost.conf: No space left on device"
        ));
    }

    #[tokio::test]
    async fn test_unreachable_push_is_connect_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let src = dir.path().join("ost.conf");
        std::fs::write(&src, "ost\n").unwrap();

        // Stand-ins: ssh fails like an unreachable host, scp would fail generically
        let fake_ssh = dir.path().join("ssh");
        std::fs::write(&fake_ssh, "#!/bin/sh\necho 'ssh: connect to host oss01 port 22: No route to host' >&2\nexit 255\n").unwrap();
        std::fs::set_permissions(&fake_ssh, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut transport = TransportConfig::default();
        transport.ssh_program = fake_ssh.to_string_lossy().into_owned();
        transport.scp_program = "false".to_string();
        let err = SshExecutor::new(transport)
            .push_file("oss01", &src, "/etc/lustre/ost.conf")
            .await
            .unwrap_err();
        assert!(matches!(err, PfsError::Connect { .. }), "got {err}");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_localhost_run() {
        let output = executor()
            .run("localhost", "echo hello", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_localhost_nonzero_exit_is_exec_error() {
        let err = executor()
            .run("localhost", "echo boom >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            PfsError::Exec {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_localhost_timeout() {
        let err = executor()
            .run("localhost", "sleep 5", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, PfsError::Timeout { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_localhost_push_verifies_checksum() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("mgs.conf");
        std::fs::write(&src, "fsname=testfs\n").unwrap();
        let dest = dir.path().join("etc").join("mgs.conf");

        executor()
            .push_file("localhost", &src, dest.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "fsname=testfs\n");
    }
}
