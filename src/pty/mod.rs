//! Pseudo-terminal plumbing for embedded terminals.
//!
//! Each bridge connection gets exactly one PTY process: `openpty` + `fork`,
//! with the child taking the slave as its controlling terminal and exec'ing
//! the shell. The parent keeps the master fd and runs a reader task that
//! fans output out on a bounded broadcast channel, so a lagging client sees a
//! gap, never an unbounded buffer.

use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use nix::unistd::ForkResult;
use tokio::sync::{broadcast, oneshot};

use crate::error::{Error, Result};

/// Buffered output chunks per PTY before lagged receivers drop oldest.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// A live PTY process owned by one bridge connection.
pub struct PtyProcess {
    pub pid: u32,
    /// PTY master fd; -1 once closed. Handlers read it atomically.
    master_fd: Arc<AtomicI32>,
    output_tx: broadcast::Sender<Bytes>,
}

impl PtyProcess {
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.output_tx.subscribe()
    }

    /// Write client input to the PTY master.
    pub fn write_input(&self, data: &[u8]) {
        let fd = self.master_fd.load(Ordering::SeqCst);
        if fd >= 0 {
            unsafe {
                nix::libc::write(fd, data.as_ptr() as *const _, data.len());
            }
        }
    }

    /// Apply a client-requested window size.
    pub fn resize(&self, cols: u16, rows: u16) {
        let fd = self.master_fd.load(Ordering::SeqCst);
        if fd >= 0 {
            set_pty_size(fd, cols, rows);
        }
    }

    /// Terminate the process. Safe to call after the process already
    /// exited. The reader task closes the master fd once the PTY drains;
    /// closing it here would strand the reader's fd registration.
    pub fn shutdown(&self) {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(self.pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
}

/// Spawn `command` under a fresh PTY with the given geometry. Returns the
/// process handle and a receiver that fires once with the exit code.
pub fn spawn_shell(
    command: &str,
    cwd: &Path,
    cols: u16,
    rows: u16,
) -> Result<(PtyProcess, oneshot::Receiver<i32>)> {
    let winsize = nix::pty::Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let pty = nix::pty::openpty(Some(&winsize), None)
        .map_err(|e| Error::Resource(format!("Failed to allocate PTY: {e}")))?;
    let master_fd = pty.master.into_raw_fd();
    let slave_fd = pty.slave.into_raw_fd();

    let command_owned = command.to_string();
    let cwd_owned = cwd.to_path_buf();

    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Parent { child }) => {
            unsafe { nix::libc::close(slave_fd) };

            let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
            let pid = child.as_raw() as u32;
            let master = Arc::new(AtomicI32::new(master_fd));
            let exit_rx = spawn_pty_reader(master.clone(), pid, output_tx.clone());

            Ok((
                PtyProcess {
                    pid,
                    master_fd: master,
                    output_tx,
                },
                exit_rx,
            ))
        }
        Ok(ForkResult::Child) => {
            unsafe { nix::libc::close(master_fd) };
            child_entrypoint(slave_fd, &command_owned, &cwd_owned);
        }
        Err(e) => {
            unsafe {
                nix::libc::close(master_fd);
                nix::libc::close(slave_fd);
            }
            Err(Error::Resource(format!("fork() failed: {e}")))
        }
    }
}

/// Child side: make the PTY slave the controlling terminal and exec the
/// command via the shell. Does not return on success.
fn child_entrypoint(slave_fd: RawFd, command: &str, cwd: &Path) -> ! {
    unsafe {
        nix::libc::setsid();
        nix::libc::ioctl(slave_fd, nix::libc::TIOCSCTTY as _, 0);
        nix::libc::dup2(slave_fd, 0);
        nix::libc::dup2(slave_fd, 1);
        nix::libc::dup2(slave_fd, 2);
        if slave_fd > 2 {
            nix::libc::close(slave_fd);
        }
    }

    std::env::set_var("TERM", "xterm-256color");
    let _ = std::env::set_current_dir(cwd);

    let sh = std::ffi::CString::new("/bin/sh").unwrap();
    let flag = std::ffi::CString::new("-c").unwrap();
    let cmd = std::ffi::CString::new(command).unwrap_or_else(|_| {
        std::ffi::CString::new("echo 'berth: invalid command'").unwrap()
    });
    let _ = nix::unistd::execvp(&sh, &[sh.clone(), flag, cmd]);

    eprintln!("berth: exec failed for '{command}'");
    std::process::exit(127);
}

/// Persistent reader: forwards master-fd output to the broadcast channel,
/// then closes the fd, reaps the child, and reports its exit code.
fn spawn_pty_reader(
    master: Arc<AtomicI32>,
    pid: u32,
    output_tx: broadcast::Sender<Bytes>,
) -> oneshot::Receiver<i32> {
    let (exit_tx, exit_rx) = oneshot::channel();
    let master_fd = master.load(Ordering::SeqCst);

    // Set non-blocking so AsyncFd works
    unsafe {
        let flags = nix::libc::fcntl(master_fd, nix::libc::F_GETFL);
        nix::libc::fcntl(master_fd, nix::libc::F_SETFL, flags | nix::libc::O_NONBLOCK);
    }

    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        let async_fd = match tokio::io::unix::AsyncFd::new(master_fd) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create AsyncFd for PTY master");
                let _ = exit_tx.send(-1);
                return;
            }
        };

        loop {
            let mut guard = match async_fd.readable().await {
                Ok(g) => g,
                Err(_) => break,
            };

            match guard.try_io(|inner| {
                let fd = inner.as_raw_fd();
                let n = unsafe { nix::libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else if n == 0 {
                    Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "PTY EOF",
                    ))
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => {
                    // Broadcast to any connected clients (ignore if none)
                    let _ = output_tx.send(Bytes::copy_from_slice(&buf[..n]));
                }
                Ok(Err(_)) => break, // EOF or error
                Err(_would_block) => continue,
            }
        }

        // PTY drained: release the master fd, then reap the child
        let fd = master.swap(-1, Ordering::SeqCst);
        if fd >= 0 {
            unsafe { nix::libc::close(fd) };
        }
        let code = tokio::task::spawn_blocking(move || reap(pid))
            .await
            .unwrap_or(-1);
        let _ = exit_tx.send(code);
    });

    exit_rx
}

fn reap(pid: u32) -> i32 {
    use nix::sys::wait::{waitpid, WaitStatus};
    match waitpid(nix::unistd::Pid::from_raw(pid as i32), None) {
        Ok(WaitStatus::Exited(_, code)) => code,
        Ok(WaitStatus::Signaled(_, signal, _)) => 128 + signal as i32,
        _ => -1,
    }
}

fn set_pty_size(fd: RawFd, cols: u16, rows: u16) {
    let ws = nix::libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe {
        nix::libc::ioctl(fd, nix::libc::TIOCSWINSZ, &ws);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exit_code_is_reported() {
        let (pty, exit_rx) = spawn_shell("exit 7", Path::new("/tmp"), 80, 24).unwrap();
        let code = tokio::time::timeout(std::time::Duration::from_secs(5), exit_rx)
            .await
            .expect("shell did not exit in time")
            .unwrap();
        assert_eq!(code, 7);
        pty.shutdown();
    }

    #[tokio::test]
    async fn shutdown_terminates_a_long_running_process() {
        let (pty, exit_rx) = spawn_shell("sleep 30", Path::new("/tmp"), 80, 24).unwrap();
        pty.shutdown();
        let code = tokio::time::timeout(std::time::Duration::from_secs(5), exit_rx)
            .await
            .expect("process did not die after shutdown")
            .unwrap();
        // SIGTERM exits as 128 + 15
        assert_eq!(code, 143);
    }
}
