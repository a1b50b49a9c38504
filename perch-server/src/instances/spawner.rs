//! Process spawner - launches service commands and captures their output

use super::ServiceSpec;
use super::health::ReadySignal;
use crate::defaults::{KILL_REAP_TIMEOUT, READINESS_PROBE_INTERVAL, READINESS_TIMEOUT, STOP_GRACE_PERIOD};
use crate::error::SupervisorError;
use crate::logs::LogBuffer;
use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// How processes are launched and torn down
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Shell used to run commands (`<shell> -c <command>`)
    pub shell: String,
    pub readiness_timeout: Duration,
    pub probe_interval: Duration,
    /// Time between SIGTERM and SIGKILL on stop
    pub stop_grace: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            readiness_timeout: READINESS_TIMEOUT,
            probe_interval: READINESS_PROBE_INTERVAL,
            stop_grace: STOP_GRACE_PERIOD,
        }
    }
}

pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Child environment: configured vars (with `$PORT` expanded) plus `PORT`
/// and `FORCE_COLOR`.
pub fn build_env(spec: &ServiceSpec, port: u16) -> BTreeMap<String, String> {
    let port_str = port.to_string();
    let mut env: BTreeMap<String, String> = spec
        .env
        .iter()
        .map(|(k, v)| {
            let v = v.replace("${PORT}", &port_str).replace("$PORT", &port_str);
            (k.clone(), v)
        })
        .collect();
    env.insert("PORT".to_string(), port_str);
    env.insert("FORCE_COLOR".to_string(), "1".to_string());
    env
}

/// Launch `spec.command` through the shell in its own process group.
pub fn spawn(spec: &ServiceSpec, port: u16, shell: &str) -> std::io::Result<Child> {
    Command::new(shell)
        .arg("-c")
        .arg(&spec.command)
        .current_dir(&spec.dir)
        .envs(build_env(spec, port))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
}

/// Reader tasks copying a child's stdout and stderr into its log buffer
#[derive(Default)]
pub struct OutputPumps(Vec<JoinHandle<()>>);

impl OutputPumps {
    /// Wait for both streams to hit EOF, giving up after `limit` (a
    /// background grandchild can hold a pipe open indefinitely).
    pub async fn drain(self, limit: Duration) {
        let pending = self.0.len();
        let all = async {
            for pump in self.0 {
                let _ = pump.await;
            }
        };
        if timeout(limit, all).await.is_err() {
            tracing::debug!(pending, "Output still open after exit");
        }
    }
}

/// Pump stdout and stderr into the service's log buffer.
pub fn capture_output(
    child: &mut Child,
    service: &str,
    logs: Arc<LogBuffer>,
    ready: Option<ReadySignal>,
) -> OutputPumps {
    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump_lines(
            stdout,
            service.to_string(),
            logs.clone(),
            ready.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump_lines(stderr, service.to_string(), logs, ready)));
    }
    OutputPumps(pumps)
}

async fn pump_lines<R>(reader: R, service: String, logs: Arc<LogBuffer>, ready: Option<ReadySignal>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                // Tools print all sorts of bytes; keep what we can.
                let line = String::from_utf8_lossy(&buf).into_owned();
                tracing::trace!(service = %service, "{}", line.trim_end());
                if let Some(ready) = &ready {
                    ready.observe(&line);
                }
                logs.push(line);
            }
            Err(e) => {
                tracing::debug!(service = %service, error = %e, "Output stream closed");
                break;
            }
        }
    }
}

/// Send a signal to every process in the group led by `pid`.
pub fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
    // targets the process group we created with process_group(0).
    unsafe { libc::kill(-pgid, signal) == 0 }
}

/// SIGTERM the process group, escalate to SIGKILL after `grace`.
///
/// Returns `StopTimeout` when escalation was needed; the process is gone
/// (or unreapable) either way.
pub async fn terminate(child: &mut Child, grace: Duration) -> Result<(), SupervisorError> {
    let Some(pid) = child.id() else {
        // Already reaped.
        return Ok(());
    };

    signal_group(pid, libc::SIGTERM);
    match timeout(grace, child.wait()).await {
        Ok(_) => {
            // Stragglers in the group outlive their leader otherwise.
            signal_group(pid, libc::SIGKILL);
            Ok(())
        }
        Err(_) => {
            signal_group(pid, libc::SIGKILL);
            let _ = child.start_kill();
            if timeout(KILL_REAP_TIMEOUT, child.wait()).await.is_err() {
                tracing::error!(pid, "Process did not exit after SIGKILL");
            }
            Err(SupervisorError::StopTimeout { grace })
        }
    }
}

/// Human-readable exit reason: "exit code N" or "signal N"
pub fn describe_exit(status: &ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "unknown status".to_string(),
    }
}
