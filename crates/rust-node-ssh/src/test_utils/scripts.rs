//! Ready-made [`FakeScript`]s.

use std::sync::Arc;
use std::time::Duration;

use super::fake_transport::{FakeProcessIo, FakeScript};
use crate::matcher::{SUDO_PROMPT, SUDO_SUCCESS};
use crate::transport::{ProcessControl, Signal};

/// Wrap an async closure as a [`FakeScript`].
pub fn from_fn<F, Fut>(f: F) -> FakeScript
where
    F: Fn(FakeProcessIo) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |io| Box::pin(f(io)))
}

/// Print `stdout` and exit 0.
#[must_use]
pub fn echo(stdout: &str) -> FakeScript {
    output(stdout, "", 0)
}

/// Print `stdout` and `stderr`, then exit with `status`.
#[must_use]
pub fn output(stdout: &str, stderr: &str, status: u32) -> FakeScript {
    let stdout = stdout.to_string();
    let stderr = stderr.to_string();
    from_fn(move |io| {
        let stdout = stdout.clone();
        let stderr = stderr.clone();
        async move {
            if !stdout.is_empty() {
                io.stdout(&stdout).await;
            }
            if !stderr.is_empty() {
                io.stderr(&stderr).await;
            }
            io.exit(status).await;
        }
    })
}

/// Behave like `sudo -S -p SudoPassword`: three password attempts, then
/// `inner` runs after the `SUDO-SUCCESS` marker.
#[must_use]
pub fn sudo(password: &str, inner: FakeScript) -> FakeScript {
    let password = password.to_string();
    from_fn(move |mut io| {
        let password = password.clone();
        let inner = Arc::clone(&inner);
        async move {
            for attempt in 1..=3 {
                io.stderr(SUDO_PROMPT).await;
                match io.read_line().await {
                    Some(line) if line == password => {
                        io.stdout(&format!("{SUDO_SUCCESS}\n")).await;
                        inner(io).await;
                        return;
                    }
                    Some(_) if attempt < 3 => io.stderr("Sorry, try again.\n").await,
                    Some(_) => {}
                    None => {
                        io.stderr("sudo: no password was provided\n").await;
                        io.exit(1).await;
                        return;
                    }
                }
            }
            io.stderr("sudo: 3 incorrect password attempts\n").await;
            io.exit(1).await;
        }
    })
}

/// Wait for a signal or close. SIGINT ends the process unless
/// `ignore_interrupt` is set; SIGKILL always does.
async fn wait_for_signal(mut io: FakeProcessIo, ignore_interrupt: bool) {
    while let Some(control) = io.next_control().await {
        match control {
            ProcessControl::Signal(Signal::Interrupt) if !ignore_interrupt => {
                io.killed("INT").await;
                return;
            }
            ProcessControl::Signal(Signal::Kill) => {
                io.killed("KILL").await;
                return;
            }
            ProcessControl::Close => return,
            _ => {}
        }
    }
}

/// Print `stdout`, then run for `duration` unless interrupted.
#[must_use]
pub fn sleep(duration: Duration, stdout: &str) -> FakeScript {
    let stdout = stdout.to_string();
    from_fn(move |io| {
        let stdout = stdout.clone();
        async move {
            if !stdout.is_empty() {
                io.stdout(&stdout).await;
            }
            let mut io = io;
            let deadline = tokio::time::sleep(duration);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    () = &mut deadline => {
                        io.exit(0).await;
                        return;
                    }
                    control = io.next_control() => match control {
                        Some(ProcessControl::Signal(Signal::Interrupt)) => {
                            io.killed("INT").await;
                            return;
                        }
                        Some(ProcessControl::Signal(Signal::Kill)) => {
                            io.killed("KILL").await;
                            return;
                        }
                        Some(ProcessControl::Close) | None => return,
                        Some(_) => {}
                    },
                }
            }
        }
    })
}

/// Never exits on its own and ignores SIGINT.
#[must_use]
pub fn stubborn() -> FakeScript {
    from_fn(|io| wait_for_signal(io, true))
}

/// Print each of `lines` on stdout, then hang until interrupted.
#[must_use]
pub fn lines_then_hang(lines: Vec<String>) -> FakeScript {
    from_fn(move |io| {
        let lines = lines.clone();
        async move {
            for line in &lines {
                io.stdout(&format!("{line}\n")).await;
            }
            wait_for_signal(io, false).await;
        }
    })
}
