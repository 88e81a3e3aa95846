//! Interactive capabilities supplied by the host
//!
//! `None` from either method means the user cancelled.

use crate::errors::Result;
use crate::security::SecureString;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::warn;

#[async_trait]
pub trait Prompter: Send + Sync {
    /// Ask for a secret such as a key passphrase
    async fn prompt_secret(&self, label: &str) -> Result<Option<SecureString>>;

    /// Ask the user to pick one of `options`; returns its index
    async fn select_one(&self, options: &[String], label: &str) -> Result<Option<usize>>;
}

/// Never asks anything; every prompt is treated as cancelled
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrompter;

#[async_trait]
impl Prompter for NoPrompter {
    async fn prompt_secret(&self, _label: &str) -> Result<Option<SecureString>> {
        Ok(None)
    }

    async fn select_one(&self, _options: &[String], _label: &str) -> Result<Option<usize>> {
        Ok(None)
    }
}

/// Prompts on stderr and reads answers line by line from stdin. An empty
/// answer or end of input cancels.
///
/// Secrets are read with terminal echo turned off when stdin is a terminal.
pub struct TerminalPrompter {
    stdin: Mutex<BufReader<tokio::io::Stdin>>,
}

impl TerminalPrompter {
    pub fn new() -> Self {
        Self {
            stdin: Mutex::new(BufReader::new(tokio::io::stdin())),
        }
    }

    async fn ask(&self, prompt: &str) -> Result<Option<String>> {
        let mut stderr = tokio::io::stderr();
        stderr.write_all(prompt.as_bytes()).await?;
        stderr.flush().await?;

        let mut line = String::new();
        let read = self.stdin.lock().await.read_line(&mut line).await?;
        let answer = line.trim_end_matches(['\r', '\n']).to_string();
        if read == 0 || answer.is_empty() {
            return Ok(None);
        }
        Ok(Some(answer))
    }
}

impl Default for TerminalPrompter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn prompt_secret(&self, label: &str) -> Result<Option<SecureString>> {
        let guard = EchoGuard::hide_stdin();
        let answer = self.ask(&format!("{}: ", label)).await;
        if guard.is_active() {
            drop(guard);
            // The newline was not echoed
            let mut stderr = tokio::io::stderr();
            stderr.write_all(b"\n").await?;
            stderr.flush().await?;
        }
        Ok(answer?.map(SecureString::from))
    }

    async fn select_one(&self, options: &[String], label: &str) -> Result<Option<usize>> {
        let mut menu = format!("{}\n", label);
        for (i, option) in options.iter().enumerate() {
            menu.push_str(&format!("  {}) {}\n", i + 1, option));
        }
        menu.push_str("> ");

        let choice = self
            .ask(&menu)
            .await?
            .and_then(|answer| answer.trim().parse::<usize>().ok())
            .filter(|n| (1..=options.len()).contains(n))
            .map(|n| n - 1);
        Ok(choice)
    }
}

/// Turns terminal echo off until dropped
#[cfg(unix)]
struct EchoGuard {
    restore: Option<(std::os::fd::OwnedFd, nix::sys::termios::Termios)>,
}

#[cfg(unix)]
impl EchoGuard {
    fn hide_stdin() -> Self {
        use std::os::fd::AsFd;
        Self::hide(std::io::stdin().as_fd())
    }

    /// Inactive when `fd` is not a terminal
    fn hide(fd: std::os::fd::BorrowedFd<'_>) -> Self {
        use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};

        let Ok(original) = tcgetattr(fd) else {
            return Self { restore: None };
        };
        let owned = match fd.try_clone_to_owned() {
            Ok(owned) => owned,
            Err(e) => {
                warn!("Could not hide input: {}", e);
                return Self { restore: None };
            }
        };

        let mut hidden = original.clone();
        hidden.local_flags.remove(LocalFlags::ECHO);
        if let Err(e) = tcsetattr(&owned, SetArg::TCSANOW, &hidden) {
            warn!("Could not hide input: {}", e);
            return Self { restore: None };
        }
        Self {
            restore: Some((owned, original)),
        }
    }

    fn is_active(&self) -> bool {
        self.restore.is_some()
    }
}

#[cfg(unix)]
impl Drop for EchoGuard {
    fn drop(&mut self) {
        use nix::sys::termios::{tcsetattr, SetArg};

        if let Some((fd, original)) = self.restore.take() {
            if let Err(e) = tcsetattr(&fd, SetArg::TCSANOW, &original) {
                warn!("Could not restore terminal echo: {}", e);
            }
        }
    }
}

#[cfg(not(unix))]
struct EchoGuard;

#[cfg(not(unix))]
impl EchoGuard {
    fn hide_stdin() -> Self {
        EchoGuard
    }

    fn is_active(&self) -> bool {
        false
    }
}
