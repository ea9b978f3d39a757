// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::ffi::CString;
use std::path::Path;

use anyhow::{bail, Context};
use bytes::Bytes;
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, Pid};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

use super::{read_chunk, set_nonblocking, write_all, ExitStatus, PtyFd};

/// One PTY-backed child process, spawned via `forkpty`.
///
/// `forkpty` makes the child a session leader with the PTY slave as its
/// controlling terminal, so signals aimed at the worker's process group
/// never propagate to the broker.
pub struct NativePty {
    master: AsyncFd<PtyFd>,
    child_pid: Pid,
}

impl NativePty {
    /// Spawn `command` on a fresh PTY.
    ///
    /// `command` must have at least one element (the CLI binary). `env`
    /// entries are added to the inherited environment; `cwd`, when given,
    /// becomes the child's working directory.
    // forkpty requires unsafe: post-fork child is partially initialized
    #[allow(unsafe_code)]
    pub fn spawn(
        command: &[String],
        cwd: Option<&Path>,
        env: &[(String, String)],
        cols: u16,
        rows: u16,
    ) -> anyhow::Result<Self> {
        if command.is_empty() {
            bail!("empty command");
        }

        let winsize = Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };

        // SAFETY: forkpty is unsafe because the child is in a
        // partially-initialized state after fork. We set up env/cwd and
        // immediately exec.
        let result = unsafe { forkpty(&winsize, None) }.context("forkpty failed")?;

        match result {
            ForkptyResult::Child => {
                std::env::set_var("TERM", "xterm-256color");
                for (key, value) in env {
                    std::env::set_var(key, value);
                }
                if let Some(dir) = cwd {
                    if std::env::set_current_dir(dir).is_err() {
                        // Exec in the inherited cwd rather than dying silently.
                        std::env::set_var("AGENT_RELAY_CWD_FALLBACK", "1");
                    }
                }

                let c_args: Vec<CString> = command
                    .iter()
                    .map(|s| CString::new(s.as_bytes()))
                    .collect::<Result<_, _>>()
                    .context("invalid command argument")?;

                execvp(&c_args[0], &c_args).context("execvp failed")?;
                unreachable!();
            }
            ForkptyResult::Parent { child, master } => {
                set_nonblocking(&master)?;
                let afd = AsyncFd::new(PtyFd(master)).context("AsyncFd::new failed")?;
                Ok(Self { master: afd, child_pid: child })
            }
        }
    }

    /// Pump PTY output to `output_tx` and `input_rx` to the PTY until the
    /// child exits, then reap it.
    pub async fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        mut input_rx: mpsc::Receiver<Bytes>,
    ) -> anyhow::Result<ExitStatus> {
        let pid = self.child_pid;
        let mut buf = vec![0u8; 8192];
        let mut input_closed = false;

        loop {
            if input_closed {
                match read_chunk(&self.master, &mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&buf[..n]);
                        if output_tx.send(data).await.is_err() {
                            break;
                        }
                    }
                    // EIO: slave side closed (child exited).
                    Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                    Err(e) => return Err(e.into()),
                }
            } else {
                tokio::select! {
                    result = read_chunk(&self.master, &mut buf) => {
                        match result {
                            Ok(0) => break,
                            Ok(n) => {
                                let data = Bytes::copy_from_slice(&buf[..n]);
                                if output_tx.send(data).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    input = input_rx.recv() => {
                        match input {
                            Some(data) => write_all(&self.master, &data).await?,
                            None => input_closed = true,
                        }
                    }
                }
            }
        }

        // Reap on a blocking thread to avoid stalling the runtime.
        let status =
            tokio::task::spawn_blocking(move || wait_for_exit(pid)).await.context("join wait")??;
        Ok(status)
    }

    /// Deliver a signal to the child's process group.
    pub fn signal_group(&self, signal: Signal) -> anyhow::Result<()> {
        kill(Pid::from_raw(-self.child_pid.as_raw()), signal).context("kill process group")?;
        Ok(())
    }

    pub fn child_pid(&self) -> u32 {
        self.child_pid.as_raw() as u32
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        // Best-effort shutdown of anything still alive in the group.
        let group = Pid::from_raw(-self.child_pid.as_raw());
        let _ = kill(group, Signal::SIGHUP);
        std::thread::sleep(std::time::Duration::from_millis(50));
        let _ = kill(group, Signal::SIGKILL);
        let _ = waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG));
    }
}

/// Block until the child exits and convert to our [`ExitStatus`].
fn wait_for_exit(pid: Pid) -> anyhow::Result<ExitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ExitStatus::exited(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(ExitStatus::signaled(sig as i32)),
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::ECHILD) => return Ok(ExitStatus::exited(0)),
            Err(e) => bail!("waitpid failed: {e}"),
        }
    }
}
