//! The provisioning handshake: a server-driven message exchange over a
//! persistent duplex connection that establishes the device identity with
//! Apple and yields the opaque `adi_pb` blob.
//!
//! The client never initiates; it only reacts to the five modeled server
//! messages. Anything else (error results, unrecognized results, malformed
//! frames, a disconnect before success) terminates the attempt. The only
//! sanctioned retry is the server's own `TryAgainSoon`, bounded here by a
//! [`RetryPolicy`] so a pathological server cannot hold resources forever.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::apple::{self, AppleHeaders, ProvisioningUrls};
use crate::client_info::ClientInfo;
use crate::error::AnisetteError;
use crate::headers::LocalEnvironment;
use crate::http::Request;
use crate::identity::{DeviceIdentity, IdentityVault};
use crate::messages::{EndProvisioningReply, IdentifierReply, ServerMessage, SpimReply};
use crate::transport::{ProvisioningStream, StreamConnector};

/// Connection-level progress of one handshake attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    AwaitingServerMessage,
    AwaitingStartProvisioningResult,
    AwaitingEndProvisioningResult,
    RetryScheduled,
    Succeeded,
}

/// Upper bound on server-directed `TryAgainSoon` retries.
///
/// The protocol itself is unbounded; the bound is a local hardening measure
/// against a server that keeps deferring forever.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of handshake attempts, counting the first.
    pub max_attempts: u32,
    /// Maximum cumulative server-requested wait across all retries.
    pub max_total_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            max_total_delay: Duration::from_secs(300),
        }
    }
}

/// How one handshake attempt ended, short of a terminal failure.
enum AttemptOutcome {
    /// The server confirmed provisioning; the blob is already persisted.
    Provisioned(String),
    /// The server asked for a fresh attempt after the given delay.
    RetryAfter(Duration),
}

/// Everything one handshake attempt needs besides the stream itself.
pub(crate) struct HandshakeContext<'a> {
    pub(crate) http: &'a Request,
    pub(crate) vault: &'a IdentityVault,
    pub(crate) identity: &'a DeviceIdentity,
    pub(crate) client_info: &'a ClientInfo,
    pub(crate) env: &'a LocalEnvironment,
    pub(crate) urls: &'a ProvisioningUrls,
}

impl HandshakeContext<'_> {
    fn apple_headers(&self) -> AppleHeaders<'_> {
        AppleHeaders {
            client_info: self.client_info,
            identity: self.identity,
            env: self.env,
        }
    }
}

/// Runs handshake attempts against `session_url` until the device is
/// provisioned, a terminal failure occurs, the retry policy is exhausted, or
/// the run is cancelled. Returns the persisted `adi_pb`.
pub(crate) async fn provision(
    ctx: &HandshakeContext<'_>,
    connector: &dyn StreamConnector,
    session_url: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<String, AnisetteError> {
    let mut attempts: u32 = 0;
    let mut total_delay = Duration::ZERO;

    loop {
        if cancel.is_cancelled() {
            return Err(AnisetteError::Cancelled);
        }
        attempts += 1;
        log::info!("starting provisioning session (attempt {attempts})");

        let mut stream = connector.connect(session_url).await.map_err(|err| {
            AnisetteError::provisioning(format!("session connect failed: {err}"))
        })?;

        match run_attempt(ctx, stream.as_mut(), cancel).await? {
            AttemptOutcome::Provisioned(adi_pb) => return Ok(adi_pb),
            AttemptOutcome::RetryAfter(delay) => {
                if attempts >= policy.max_attempts {
                    return Err(AnisetteError::provisioning(format!(
                        "server kept deferring provisioning after {attempts} attempts"
                    )));
                }
                total_delay = total_delay.saturating_add(delay);
                if total_delay > policy.max_total_delay {
                    return Err(AnisetteError::provisioning(
                        "server-requested retry delays exceeded the retry budget",
                    ));
                }
                log::info!("server asked to retry in {}ms", delay.as_millis());
                tokio::select! {
                    () = cancel.cancelled() => return Err(AnisetteError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Drives a single attempt over an established stream.
async fn run_attempt(
    ctx: &HandshakeContext<'_>,
    stream: &mut dyn ProvisioningStream,
    cancel: &CancellationToken,
) -> Result<AttemptOutcome, AnisetteError> {
    let mut state = HandshakeState::AwaitingServerMessage;

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => {
                let _ = stream.close().await;
                return Err(AnisetteError::Cancelled);
            }
            frame = stream.recv_text() => frame.map_err(|err| {
                AnisetteError::provisioning(format!("session stream failed: {err}"))
            })?,
        };
        let Some(text) = frame else {
            return Err(AnisetteError::provisioning(
                "connection closed before provisioning completed",
            ));
        };

        let message = ServerMessage::parse(&text)?;
        log::debug!("session message {message:?} in state {state:?}");

        match message {
            ServerMessage::GiveIdentifier => {
                // Generates and persists a fresh identifier if none exists
                // yet; otherwise replies with the stored one.
                let identity = ctx.vault.load_or_generate()?;
                send_reply(
                    stream,
                    &IdentifierReply {
                        identifier: &identity.to_base64(),
                    },
                )
                .await?;
                state = HandshakeState::AwaitingServerMessage;
            }
            ServerMessage::GiveStartProvisioningData => {
                state = HandshakeState::AwaitingStartProvisioningResult;
                log::debug!("state {state:?}");
                let spim =
                    apple::start_provisioning(ctx.http, ctx.urls, &ctx.apple_headers())
                        .await?;
                send_reply(stream, &SpimReply { spim: &spim }).await?;
                state = HandshakeState::AwaitingServerMessage;
            }
            ServerMessage::GiveEndProvisioningData { cpim } => {
                state = HandshakeState::AwaitingEndProvisioningResult;
                log::debug!("state {state:?}");
                let (ptm, tk) = apple::end_provisioning(
                    ctx.http,
                    ctx.urls,
                    &ctx.apple_headers(),
                    &cpim,
                )
                .await?;
                send_reply(stream, &EndProvisioningReply { ptm: &ptm, tk: &tk }).await?;
                state = HandshakeState::AwaitingServerMessage;
            }
            ServerMessage::ProvisioningSuccess { adi_pb } => {
                // Persist before closing so a teardown race cannot lose the
                // blob; the value is always written whole.
                ctx.vault.set_adi_pb(&adi_pb)?;
                state = HandshakeState::Succeeded;
                log::info!("provisioning succeeded (state {state:?})");
                let _ = stream.close().await;
                return Ok(AttemptOutcome::Provisioned(adi_pb));
            }
            ServerMessage::TryAgainSoon { duration } => {
                state = HandshakeState::RetryScheduled;
                log::debug!("state {state:?}");
                let _ = stream.close().await;
                return Ok(AttemptOutcome::RetryAfter(duration));
            }
        }
    }
}

async fn send_reply<T: serde::Serialize>(
    stream: &mut dyn ProvisioningStream,
    reply: &T,
) -> Result<(), AnisetteError> {
    let text = serde_json::to_string(reply).map_err(|err| {
        AnisetteError::provisioning(format!("failed to encode session reply: {err}"))
    })?;
    stream
        .send_text(text)
        .await
        .map_err(|err| AnisetteError::provisioning(format!("session send failed: {err}")))
}
