use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{ProcessExit, ProcessHost, ProcessKiller, ProcessRequest, RunningProcess};
use crate::cancel::CancelToken;

/// How long to wait for output pipes to close once the process is gone.
/// Grandchildren that inherited the pipes can otherwise hold them open.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawns real OS processes through `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessHost;

impl ProcessHost for TokioProcessHost {
    fn spawn(&self, request: &ProcessRequest) -> std::io::Result<Box<dyn RunningProcess>> {
        let (program, args) = invocation(request);

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        debug!(program = %program, args = ?args, pid = ?child.id(), "Spawned process");

        let stdout = child.stdout.take().map(|s| tokio::spawn(read_all(s)));
        let stderr = child.stderr.take().map(|s| tokio::spawn(read_all(s)));
        let (killer, kill_requested) = ProcessKiller::new();

        Ok(Box::new(TokioProcess {
            child,
            stdout,
            stderr,
            killer,
            kill_requested,
        }))
    }
}

struct TokioProcess {
    child: Child,
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
    killer: ProcessKiller,
    kill_requested: CancelToken,
}

#[async_trait]
impl RunningProcess for TokioProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn killer(&self) -> ProcessKiller {
        self.killer.clone()
    }

    async fn wait(&mut self) -> std::io::Result<ProcessExit> {
        let status = tokio::select! {
            status = self.child.wait() => status?,
            _ = self.kill_requested.cancelled() => {
                // The process may already be gone; that race is expected.
                if let Err(e) = self.child.start_kill() {
                    debug!(error = %e, "Kill request raced with process exit");
                }
                self.child.wait().await?
            }
        };

        Ok(ProcessExit {
            code: status.code(),
            stdout: collect(self.stdout.take()).await,
            stderr: collect(self.stderr.take()).await,
        })
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!(error = %e, "Output stream closed with error");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(handle: Option<JoinHandle<String>>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            debug!(error = %e, "Output reader task failed");
            String::new()
        }
        Err(_) => {
            debug!("Output pipe still open after process exit, dropping it");
            String::new()
        }
    }
}

/// Program and argument vector for a request. Elevated requests go through
/// `sudo -n` unless the agent already runs as root.
fn invocation(request: &ProcessRequest) -> (String, Vec<String>) {
    let mut args = split_arguments(&request.arguments);
    if request.elevated && cfg!(unix) && !running_as_root() {
        args.insert(0, request.command.clone());
        args.insert(0, "-n".to_string());
        ("sudo".to_string(), args)
    } else {
        (request.command.clone(), args)
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    // SAFETY: geteuid takes no arguments and always succeeds.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

/// Splits an argument string on whitespace, keeping single- or double-quoted
/// sections together and stripping the quotes.
pub fn split_arguments(arguments: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;

    for c in arguments.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_plain_arguments() {
        assert_eq!(
            split_arguments("--tables=10  --threads=8 run"),
            vec!["--tables=10", "--threads=8", "run"]
        );
        assert!(split_arguments("   ").is_empty());
    }

    #[test]
    fn split_keeps_quoted_sections() {
        assert_eq!(
            split_arguments(r#"runspeccpu.sh "--config vc-linux-x64.cfg --tune base" intrate"#),
            vec!["runspeccpu.sh", "--config vc-linux-x64.cfg --tune base", "intrate"]
        );
        assert_eq!(
            split_arguments("-c 'echo hello world'"),
            vec!["-c", "echo hello world"]
        );
        assert_eq!(split_arguments(r#"--name="" x"#), vec!["--name=", "x"]);
    }

    #[test]
    fn non_elevated_invocation_runs_command_directly() {
        let req = ProcessRequest::new("make").arguments("-j install");
        let (program, args) = invocation(&req);
        assert_eq!(program, "make");
        assert_eq!(args, vec!["-j", "install"]);
    }

    #[cfg(unix)]
    #[test]
    fn elevation_follows_effective_uid() {
        let req = ProcessRequest::new("mount").arguments("/dev/sr0 /mnt/iso").elevated(true);
        let (program, args) = invocation(&req);
        if unsafe { libc::geteuid() } == 0 {
            assert_eq!(program, "mount");
            assert_eq!(args, vec!["/dev/sr0", "/mnt/iso"]);
        } else {
            assert_eq!(program, "sudo");
            assert_eq!(args, vec!["-n", "mount", "/dev/sr0", "/mnt/iso"]);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let req = ProcessRequest::new("sh").arguments("-c 'echo hello; echo oops 1>&2; exit 3'");
        let mut process = TokioProcessHost.spawn(&req).unwrap();
        let exit = process.wait().await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert_eq!(exit.stdout.trim(), "hello");
        assert_eq!(exit.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_terminates_running_process() {
        let req = ProcessRequest::new("sleep").arguments("30");
        let mut process = TokioProcessHost.spawn(&req).unwrap();
        process.killer().kill();
        let exit = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .expect("killed process did not exit")
            .unwrap();
        assert_eq!(exit.code, None);
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let req = ProcessRequest::new("/definitely/not/a/binary");
        assert!(TokioProcessHost.spawn(&req).is_err());
    }
}
