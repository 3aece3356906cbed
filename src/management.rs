//! Management client: out-of-band account provisioning on a running
//! provider, over its local control socket.
//!
//! The protocol is line based. The server greets with `220`, each command is
//! a single line and every reply is one or more `NNN text` lines, where all
//! but the last use `NNN-text`.

use std::{path::Path, time::Duration};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info, warn};

use crate::error::ClusterError;
use crate::identity::PublicKey;

pub const STATUS_SERVICE_READY: u16 = 220;
pub const STATUS_OK: u16 = 250;

/// One complete reply; continuation lines are joined with `\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

pub struct ManagementClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ManagementClient {
    /// Connect and consume the ready banner.
    pub async fn connect(socket: &Path) -> Result<Self, ClusterError> {
        let stream = UnixStream::connect(socket)
            .await
            .map_err(|e| ClusterError::provisioning("connect", format!("{}: {e}", socket.display())))?;
        let (read, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read),
            writer,
        };
        client.expect_reply("banner", STATUS_SERVICE_READY).await?;
        Ok(client)
    }

    /// Send `line` and require `code` in reply. `step` names the command in
    /// any resulting error.
    pub async fn command(&mut self, step: &str, line: &str, code: u16) -> Result<Reply, ClusterError> {
        debug!(step, "management command");
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .map_err(|e| ClusterError::provisioning(step, e))?;
        self.expect_reply(step, code).await
    }

    async fn expect_reply(&mut self, step: &str, code: u16) -> Result<Reply, ClusterError> {
        let reply = self.read_reply(step).await?;
        if reply.code != code {
            return Err(ClusterError::provisioning(
                step,
                format!("expected {code}, got {} {}", reply.code, reply.text),
            ));
        }
        Ok(reply)
    }

    async fn read_reply(&mut self, step: &str) -> Result<Reply, ClusterError> {
        let mut text = Vec::new();
        loop {
            let mut line = String::new();
            let n = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| ClusterError::provisioning(step, e))?;
            if n == 0 {
                return Err(ClusterError::provisioning(step, "connection closed"));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            let (code, more, rest) = parse_line(line)
                .ok_or_else(|| ClusterError::provisioning(step, format!("malformed reply '{line}'")))?;
            text.push(rest.to_string());
            if !more {
                return Ok(Reply {
                    code,
                    text: text.join("\n"),
                });
            }
        }
    }
}

/// Split `NNN text` / `NNN-text` into code, continuation flag and text.
fn parse_line(line: &str) -> Option<(u16, bool, &str)> {
    let digits = line.get(..3)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let code = digits.parse().ok()?;
    match line.as_bytes().get(3) {
        None => Some((code, false, "")),
        Some(b' ') => Some((code, false, &line[4..])),
        Some(b'-') => Some((code, true, &line[4..])),
        Some(_) => None,
    }
}

/// Add `user` to the provider behind `socket` and bind `key` as both its
/// link and identity key.
///
/// Commands already accepted are not undone when a later one fails, so a
/// retry after a partial failure sees the user as already present.
pub async fn provision_user(socket: &Path, user: &str, key: &PublicKey) -> Result<(), ClusterError> {
    info!(user, socket = %socket.display(), "provisioning user");
    let key = hex::encode(key.as_bytes());
    let mut client = ManagementClient::connect(socket).await?;
    client
        .command("ADD_USER", &format!("ADD_USER {user} {key}"), STATUS_OK)
        .await?;
    client
        .command("SET_USER_IDENTITY", &format!("SET_USER_IDENTITY {user} {key}"), STATUS_OK)
        .await?;
    client.command("QUIT", "QUIT", STATUS_OK).await?;
    Ok(())
}

/// [`provision_user`], retried while the provider's socket is not yet
/// accepting connections. Failures after a connection was made are returned
/// as-is, since the sequence may already be partly applied.
pub async fn provision_user_when_ready(
    socket: &Path,
    user: &str,
    key: &PublicKey,
    attempts: u32,
    interval: Duration,
) -> Result<(), ClusterError> {
    let mut attempt = 1;
    loop {
        match provision_user(socket, user, key).await {
            Err(ClusterError::Provisioning { step, reason }) if step == "connect" && attempt < attempts => {
                debug!(user, attempt, "management socket not ready: {reason}");
                tokio::time::sleep(interval).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(user, attempt, "provisioning failed: {e}");
                return Err(e);
            }
            Ok(()) => return Ok(()),
        }
    }
}
