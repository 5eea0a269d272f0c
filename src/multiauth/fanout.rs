//! Concurrent `hasJoined` fan-out across the configured session servers.
//!
//! The Minecraft login flow guarantees that only the session service that
//! participated in a connection's encryption handshake answers 200 for its
//! serverId hash, so every upstream is asked at once and the first 200
//! with a non-empty body wins.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The session-server endpoint the backend calls.
pub const HAS_JOINED_PATH: &str = "/session/minecraft/hasJoined";

/// Overall deadline for a fan-out; also the per-request client timeout.
const UPSTREAM_DEADLINE: Duration = Duration::from_secs(10);

/// Session responses are small JSON documents; anything past this is cut.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// What a fan-out decided.
pub enum AuthOutcome {
    /// Some upstream vouched for the player; `body` is its exact payload.
    Match { body: Vec<u8> },
    /// Every upstream declined, failed, or the deadline passed.
    NoMatch,
}

/// One upstream's report back to the dispatcher.
struct UpstreamReply {
    label: String,
    outcome: std::result::Result<(u16, Vec<u8>), reqwest::Error>,
}

pub struct SessionMux {
    client: reqwest::Client,
    servers: Vec<String>,
}

impl SessionMux {
    pub fn new(servers: Vec<String>) -> Result<Self> {
        // Redirects are never followed: the first response from each
        // upstream is the answer, whatever its status.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(UPSTREAM_DEADLINE)
            .build()
            .context("building session-server http client")?;
        Ok(Self { client, servers })
    }

    /// Ask every configured session server at once and return the first
    /// 200-with-body answer, or `NoMatch` once all have reported or the
    /// deadline fires.
    pub async fn fan_out(&self, query: &str, username: &str) -> AuthOutcome {
        info!(username, upstreams = self.servers.len(), "hasJoined fan-out");

        // Capacity matches the probe count so a probe finishing after the
        // dispatcher has returned publishes without blocking and vanishes.
        let (tx, mut rx) = mpsc::channel(self.servers.len());
        for base in &self.servers {
            let client = self.client.clone();
            let base = base.clone();
            let query = query.to_string();
            let tx = tx.clone();
            tokio::spawn(async move {
                let reply = query_upstream(client, &base, &query).await;
                let _ = tx.send(reply).await;
            });
        }
        drop(tx);

        let deadline = tokio::time::sleep(UPSTREAM_DEADLINE);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(username, "deadline passed waiting for session servers");
                    return AuthOutcome::NoMatch;
                }
                reply = rx.recv() => {
                    let Some(reply) = reply else {
                        // Channel drained: every probe reported, none won.
                        info!(username, "no session server vouched for player");
                        return AuthOutcome::NoMatch;
                    };
                    match reply.outcome {
                        Ok((200, body)) if !body.is_empty() => {
                            info!(username, server = %reply.label, bytes = body.len(), "session match");
                            return AuthOutcome::Match { body };
                        }
                        Ok((status, body)) => {
                            debug!(server = %reply.label, status, bytes = body.len(), "no match");
                        }
                        Err(e) => {
                            warn!(server = %reply.label, error = %e, "upstream probe failed");
                        }
                    }
                }
            }
        }
    }
}

async fn query_upstream(client: reqwest::Client, base: &str, query: &str) -> UpstreamReply {
    let url = format!("{}{}?{}", base.trim_end_matches('/'), HAS_JOINED_PATH, query);
    let label = upstream_label(base);

    let outcome = match client.get(&url).send().await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            read_capped_body(resp).await.map(|body| (status, body))
        }
        Err(e) => Err(e),
    };

    UpstreamReply { label, outcome }
}

async fn read_capped_body(mut resp: reqwest::Response) -> std::result::Result<Vec<u8>, reqwest::Error> {
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        let remaining = MAX_BODY_BYTES - body.len();
        if chunk.len() >= remaining {
            body.extend_from_slice(&chunk[..remaining]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Short name for log lines; purely cosmetic.
fn upstream_label(base: &str) -> String {
    if base.contains("mojang") {
        "mojang".to_string()
    } else if base.contains("minehut") {
        "minehut".to_string()
    } else {
        base.to_string()
    }
}
