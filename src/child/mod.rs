use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::process::Stdio;

use anyhow::{Context, Result};
use log::debug;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{getsid, setsid, Pid};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::config::CommandConfig;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Data { fd: Fd, bytes: Vec<u8> },
    Error(i32),
    Exit { code: i32, signal: Option<i32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fd {
    Stdout,
    Stderr,
}

/// A handle to a live child process, placed in its own session so the
/// whole process group can be signalled, not just the direct child.
pub struct ChildHandle {
    pid: Pid,
}

impl ChildHandle {
    pub fn session_id(&self) -> nix::Result<Pid> {
        getsid(Some(self.pid))
    }

    pub fn kill_process_group(&self, signal: Signal) -> nix::Result<()> {
        killpg(self.session_id()?, signal)
    }
}

fn merge_env(overrides: &[String]) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    for entry in overrides {
        match entry.split_once('=') {
            Some((key, "")) => {
                env.remove(key);
            }
            Some((key, value)) => {
                env.insert(key.to_string(), value.to_string());
            }
            None => {
                // bare KEY with no '=' carries no instruction; ignored.
            }
        }
    }
    env
}

fn build_command(cmd: &CommandConfig) -> Command {
    let mut command = Command::new(&cmd.file);
    command.args(&cmd.args);
    command.env_clear();
    command.envs(merge_env(&cmd.env));
    if let Some(cwd) = &cmd.cwd {
        command.current_dir(cwd);
    }
    command.stdin(Stdio::piped());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    unsafe {
        // Runs between fork and exec; only async-signal-safe calls belong here.
        command.pre_exec(|| {
            setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }
    command
}

fn spawn_reader(
    mut reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    fd: Fd,
    events: mpsc::Sender<ProcessEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let bytes = buf[..n].to_vec();
                    if events
                        .send(ProcessEvent::Data { fd, bytes })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
}

/// Spawns a long-running, supervised process. Returns a handle for signalling
/// it and a channel of `ProcessEvent`s: `Data` as output arrives, and exactly
/// one terminal `Exit` once stdio has drained and the OS wait completes.
pub fn spawn_supervised(
    cmd: &CommandConfig,
) -> Result<(ChildHandle, mpsc::Receiver<ProcessEvent>)> {
    let mut command = build_command(cmd);
    let mut child = command
        .spawn()
        .with_context(|| format!("spawning {}", cmd.file))?;

    let pid = Pid::from_raw(child.id().context("child has no pid")? as i32);
    let handle = ChildHandle { pid };

    let (tx, rx) = mpsc::channel(64);

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_task = stdout.map(|s| spawn_reader(BufReader::new(s), Fd::Stdout, tx.clone()));
    let stderr_task = stderr.map(|s| spawn_reader(BufReader::new(s), Fd::Stderr, tx.clone()));

    tokio::spawn(async move {
        if let Some(t) = stdout_task {
            let _ = t.await;
        }
        if let Some(t) = stderr_task {
            let _ = t.await;
        }
        let (code, signal) = match child.wait().await {
            Ok(status) => exit_parts(status),
            Err(_) => (-1, None),
        };
        debug!("child {pid} exited: code={code} signal={signal:?}");
        let _ = tx.send(ProcessEvent::Exit { code, signal }).await;
    });

    Ok((handle, rx))
}

fn exit_parts(status: std::process::ExitStatus) -> (i32, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    (status.code().unwrap_or(0), status.signal())
}

/// Runs a short-lived command to completion (used for checker probes), with
/// an optional kill-on-timeout. Returns the folded exit code: the process
/// exit code if nonzero, else the terminating signal number, else 0.
pub async fn run_to_completion(cmd: &CommandConfig) -> i32 {
    let command = build_command(cmd);
    run_to_completion_inner(command, cmd.timeout_ms).await
}

async fn run_to_completion_inner(mut command: Command, timeout_ms: u64) -> i32 {
    let child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            let errno = e.raw_os_error().unwrap_or(1);
            return -errno;
        }
    };
    run_child_to_completion(child, timeout_ms).await
}

async fn run_child_to_completion(mut child: Child, timeout_ms: u64) -> i32 {
    let pid = child.id().map(|p| Pid::from_raw(p as i32));

    let status = if timeout_ms > 0 {
        match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), child.wait()).await
        {
            Ok(result) => result,
            Err(_) => {
                if let Some(pid) = pid {
                    let _ = killpg(pid, Signal::SIGTERM);
                }
                child.wait().await
            }
        }
    } else {
        child.wait().await
    };

    match status {
        Ok(status) => {
            let (code, signal) = exit_parts(status);
            if code != 0 {
                code
            } else {
                signal.unwrap_or(0)
            }
        }
        Err(_) => -1,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cmd(file: &str, args: &[&str]) -> CommandConfig {
        CommandConfig {
            file: file.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: vec![],
            cwd: None,
            timeout_ms: 0,
        }
    }

    #[tokio::test]
    async fn run_to_completion_reports_exit_code() {
        let code = run_to_completion(&cmd("/bin/sh", &["-c", "exit 7"])).await;
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn run_to_completion_reports_spawn_failure_as_negative_errno() {
        let code = run_to_completion(&cmd("/definitely/not/a/binary", &[])).await;
        assert!(code < 0);
    }

    #[tokio::test]
    async fn spawn_supervised_streams_stdout_then_exits() {
        let (_, mut events) = spawn_supervised(&cmd("/bin/sh", &["-c", "echo hi"])).unwrap();
        let mut saw_data = false;
        loop {
            match events.recv().await {
                Some(ProcessEvent::Data { fd: Fd::Stdout, bytes }) => {
                    saw_data = true;
                    assert_eq!(&bytes, b"hi\n");
                }
                Some(ProcessEvent::Exit { code, .. }) => {
                    assert_eq!(code, 0);
                    break;
                }
                Some(_) => {}
                None => break,
            }
        }
        assert!(saw_data);
    }

    #[test]
    fn merge_env_applies_clear_set_and_ignore_rules() {
        std::env::set_var("NEXER_TEST_KEEP", "keep");
        let overrides = vec![
            "NEXER_TEST_KEEP=".to_string(),
            "NEXER_TEST_SET=value".to_string(),
            "NEXER_TEST_BARE".to_string(),
        ];
        let env = merge_env(&overrides);
        assert!(!env.contains_key("NEXER_TEST_KEEP"));
        assert_eq!(env.get("NEXER_TEST_SET").map(String::as_str), Some("value"));
        assert!(!env.contains_key("NEXER_TEST_BARE"));
    }
}
