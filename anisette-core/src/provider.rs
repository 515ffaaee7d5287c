//! The provisioning orchestrator.
//!
//! Sequences version negotiation, consent gating, the provisioning handshake
//! and the header fetch into one asynchronous operation with a single
//! success/failure outcome. All collaborators are injected explicitly; the
//! engine holds no global state.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::apple::{self, AppleHeaders, DEFAULT_LOOKUP_URL};
use crate::client_info::ClientInfo;
use crate::error::AnisetteError;
use crate::fetch;
use crate::handshake::{self, HandshakeContext, RetryPolicy};
use crate::headers::{AnisetteHeaders, LocalEnvironment};
use crate::http::Request;
use crate::identity::IdentityVault;
use crate::store::{SecureIdentityStore, TrustedServers};
use crate::transport::{websocket_url, StreamConnector, WebSocketConnector};

/// Suspending prompt asking the user to confirm use of an insecure legacy
/// server. Implemented by the embedding UI; the run blocks on the answer.
#[async_trait]
pub trait LegacyConsentPrompt: Send + Sync {
    /// Returns whether the user accepts talking to the legacy server at
    /// `server_address`. A previously recorded consent for the same address
    /// bypasses this prompt entirely.
    async fn confirm_legacy(&self, server_address: &str) -> bool;
}

/// Default prompt that declines every legacy server. Consumers that want the
/// legacy path must inject a real prompt.
struct DenyLegacyUse;

#[async_trait]
impl LegacyConsentPrompt for DenyLegacyUse {
    async fn confirm_legacy(&self, _server_address: &str) -> bool {
        false
    }
}

/// Protocol generation of a probed server.
enum ServerVersion {
    /// Legacy one-shot server; use requires explicit consent.
    V1,
    /// Current protocol; carries the probed client info.
    V3(ClientInfo),
}

/// Obtains anisette headers from a provisioning server, establishing the
/// persistent device identity first when needed.
///
/// A provider owns one device identity (via the injected store) and runs at
/// most one provisioning run at a time; concurrent `fetch_anisette` calls
/// are serialized so the shared identity is never provisioned twice.
pub struct AnisetteProvider {
    base_url: String,
    lookup_url: String,
    http: Request,
    vault: IdentityVault,
    trusted: TrustedServers,
    consent: Arc<dyn LegacyConsentPrompt>,
    connector: Arc<dyn StreamConnector>,
    env: LocalEnvironment,
    retry_policy: RetryPolicy,
    cancel: CancellationToken,
    client_info: Mutex<Option<ClientInfo>>,
    run_lock: Mutex<()>,
}

impl AnisetteProvider {
    /// Starts building a provider for the given server, backed by the given
    /// secure identity store.
    #[must_use]
    pub fn builder(
        base_url: impl Into<String>,
        store: Arc<dyn SecureIdentityStore>,
    ) -> AnisetteProviderBuilder {
        AnisetteProviderBuilder {
            base_url: base_url.into(),
            lookup_url: DEFAULT_LOOKUP_URL.to_string(),
            store,
            consent: Arc::new(DenyLegacyUse),
            connector: Arc::new(WebSocketConnector::new()),
            env: LocalEnvironment::default(),
            retry_policy: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Fetches a complete anisette header set.
    ///
    /// Idempotent-safe to re-invoke after a failure. Cancelling the
    /// provider's token before the call short-circuits without any network
    /// activity; cancelling during the run tears the handshake down without
    /// writing partial state.
    ///
    /// # Errors
    ///
    /// Fails with one category per path: [`AnisetteError::Cancelled`],
    /// [`AnisetteError::InvalidAnisette`] (legacy response),
    /// [`AnisetteError::Anisette`] (V3 response/header fetch) or
    /// [`AnisetteError::Provisioning`] (handshake).
    pub async fn fetch_anisette(&self) -> Result<AnisetteHeaders, AnisetteError> {
        // Upstream failures are signaled through the cancellation token and
        // observed before any network call.
        if self.cancel.is_cancelled() {
            return Err(AnisetteError::Cancelled);
        }
        let _run = self.run_lock.lock().await;
        if self.cancel.is_cancelled() {
            return Err(AnisetteError::Cancelled);
        }

        match self.classify_server().await? {
            ServerVersion::V1 => self.fetch_legacy().await,
            ServerVersion::V3(client_info) => {
                let identity = self.vault.identifier()?;
                let adi_pb = self.vault.adi_pb()?;
                if let (Some(identity), Some(adi_pb)) = (identity, adi_pb) {
                    log::debug!("device already provisioned, fetching headers directly");
                    fetch::fetch_v3(
                        &self.http,
                        &self.base_url,
                        &identity,
                        &adi_pb,
                        &client_info,
                        &self.env,
                    )
                    .await
                } else {
                    self.provision_and_fetch(&client_info).await
                }
            }
        }
    }

    /// Forgets a previously recorded legacy-use consent for this server.
    ///
    /// # Errors
    ///
    /// Returns an error if the consent record cannot be updated.
    pub fn revoke_legacy_consent(&self) -> Result<(), AnisetteError> {
        self.trusted.revoke(&self.base_url)?;
        Ok(())
    }

    /// Probes the server generation, reusing the run-scoped client info when
    /// the persisted identity makes a re-probe unnecessary.
    async fn classify_server(&self) -> Result<ServerVersion, AnisetteError> {
        {
            let cached = self.client_info.lock().await;
            if let Some(info) = cached.as_ref() {
                if self.vault.identifier()?.is_some() {
                    log::debug!("reusing cached client_info");
                    return Ok(ServerVersion::V3(info.clone()));
                }
            }
        }

        let url = format!("{}/v3/client_info", self.base_url);
        let response = self.http.get(&url).send().await.map_err(|err| {
            AnisetteError::anisette(format!("client_info fetch failed: {err}"))
        })?;
        let bytes = response.bytes().await.map_err(|err| {
            AnisetteError::anisette(format!("client_info fetch failed: {err}"))
        })?;
        let value: serde_json::Value = serde_json::from_slice(&bytes).map_err(|err| {
            AnisetteError::anisette(format!("malformed client_info response: {err}"))
        })?;

        if value.get("client_info").is_none() {
            log::info!("server looks like a legacy (V1) anisette server");
            return Ok(ServerVersion::V1);
        }

        let info: ClientInfo = serde_json::from_value(value).map_err(|err| {
            AnisetteError::anisette(format!("malformed client_info response: {err}"))
        })?;
        log::info!("server speaks the current (V3) protocol");
        *self.client_info.lock().await = Some(info.clone());
        Ok(ServerVersion::V3(info))
    }

    /// Legacy path, gated behind explicit per-server consent.
    async fn fetch_legacy(&self) -> Result<AnisetteHeaders, AnisetteError> {
        if !self.trusted.is_trusted(&self.base_url)? {
            log::warn!(
                "legacy anisette server {} requires explicit confirmation",
                self.base_url
            );
            let confirmed = tokio::select! {
                () = self.cancel.cancelled() => false,
                confirmed = self.consent.confirm_legacy(&self.base_url) => confirmed,
            };
            if !confirmed {
                log::info!("legacy server use declined");
                return Err(AnisetteError::Cancelled);
            }
            self.trusted.record(&self.base_url)?;
        }
        fetch::fetch_v1(&self.http, &self.base_url).await
    }

    /// Establishes the device identity via the handshake, then fetches
    /// headers with the fresh provisioning blob.
    async fn provision_and_fetch(
        &self,
        client_info: &ClientInfo,
    ) -> Result<AnisetteHeaders, AnisetteError> {
        let identity = self.vault.load_or_generate()?;

        // Resolved once per run and reused across TryAgainSoon retries.
        let headers = AppleHeaders {
            client_info,
            identity: &identity,
            env: &self.env,
        };
        let urls =
            apple::lookup_provisioning_urls(&self.http, &self.lookup_url, &headers)
                .await?;

        let session_url =
            websocket_url(&format!("{}/v3/provisioning_session", self.base_url));
        let ctx = HandshakeContext {
            http: &self.http,
            vault: &self.vault,
            identity: &identity,
            client_info,
            env: &self.env,
            urls: &urls,
        };
        let adi_pb = handshake::provision(
            &ctx,
            self.connector.as_ref(),
            &session_url,
            &self.retry_policy,
            &self.cancel,
        )
        .await?;

        fetch::fetch_v3(
            &self.http,
            &self.base_url,
            &identity,
            &adi_pb,
            client_info,
            &self.env,
        )
        .await
    }
}

/// Builder for [`AnisetteProvider`].
pub struct AnisetteProviderBuilder {
    base_url: String,
    lookup_url: String,
    store: Arc<dyn SecureIdentityStore>,
    consent: Arc<dyn LegacyConsentPrompt>,
    connector: Arc<dyn StreamConnector>,
    env: LocalEnvironment,
    retry_policy: RetryPolicy,
    cancel: CancellationToken,
}

impl AnisetteProviderBuilder {
    /// Overrides the GSA service directory URL.
    #[must_use]
    pub fn lookup_url(mut self, url: impl Into<String>) -> Self {
        self.lookup_url = url.into();
        self
    }

    /// Installs the UI prompt deciding legacy-server use.
    #[must_use]
    pub fn consent_prompt(mut self, prompt: Arc<dyn LegacyConsentPrompt>) -> Self {
        self.consent = prompt;
        self
    }

    /// Replaces the session transport (scripted streams in tests).
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn StreamConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Sets the locale and time zone reported to Apple.
    #[must_use]
    pub fn local_environment(mut self, env: LocalEnvironment) -> Self {
        self.env = env;
        self
    }

    /// Bounds server-directed handshake retries.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Installs the cancellation token observed at entry and at every
    /// suspension point. Cancel it to signal an upstream failure or to abort
    /// a run in flight.
    #[must_use]
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Finishes the builder.
    #[must_use]
    pub fn build(self) -> AnisetteProvider {
        AnisetteProvider {
            base_url: self.base_url.trim_end_matches('/').to_string(),
            lookup_url: self.lookup_url,
            http: Request::new(),
            vault: IdentityVault::new(self.store.clone()),
            trusted: TrustedServers::new(self.store),
            consent: self.consent,
            connector: self.connector,
            env: self.env,
            retry_policy: self.retry_policy,
            cancel: self.cancel,
            client_info: Mutex::new(None),
            run_lock: Mutex::new(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::*;
    use crate::store::{MemoryStore, KEY_ADI_PB, KEY_IDENTIFIER};

    struct CountingPrompt {
        answer: bool,
        calls: AtomicU32,
    }

    impl CountingPrompt {
        fn new(answer: bool) -> Self {
            Self {
                answer,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl LegacyConsentPrompt for CountingPrompt {
        async fn confirm_legacy(&self, _server_address: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    const V1_BODY: &str = r#"{
        "X-Apple-I-MD-M": "m1",
        "X-Apple-I-MD": "p1",
        "X-Apple-I-MD-LU": "lu",
        "X-Mme-Device-Id": "ABCD",
        "X-MMe-Client-Info": "desc",
        "X-Apple-I-Client-Time": "2026-01-01T00:00:00Z",
        "X-Apple-Locale": "en_US",
        "X-Apple-I-TimeZone": "EST"
    }"#;

    #[tokio::test]
    async fn declined_consent_cancels_without_fetching() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v3/client_info")
            .with_body("{}")
            .create_async()
            .await;
        let root = server
            .mock("GET", "/")
            .with_body(V1_BODY)
            .expect(0)
            .create_async()
            .await;

        let prompt = Arc::new(CountingPrompt::new(false));
        let provider =
            AnisetteProvider::builder(server.url(), Arc::new(MemoryStore::new()))
                .consent_prompt(prompt.clone())
                .build();

        let err = provider.fetch_anisette().await.unwrap_err();
        assert!(matches!(err, AnisetteError::Cancelled));
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 1);
        root.assert_async().await;
    }

    #[tokio::test]
    async fn granted_consent_is_recorded_and_not_asked_again() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v3/client_info")
            .with_body("{}")
            .expect(2)
            .create_async()
            .await;
        server
            .mock("GET", "/")
            .with_body(V1_BODY)
            .expect(2)
            .create_async()
            .await;

        let prompt = Arc::new(CountingPrompt::new(true));
        let provider =
            AnisetteProvider::builder(server.url(), Arc::new(MemoryStore::new()))
                .consent_prompt(prompt.clone())
                .build();

        let headers = provider.fetch_anisette().await.unwrap();
        assert_eq!(headers.machine_id, "m1");
        assert_eq!(headers.local_user_id, "lu");

        // Second run: recorded consent bypasses the prompt.
        provider.fetch_anisette().await.unwrap();
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn revoked_consent_prompts_again() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v3/client_info")
            .with_body("{}")
            .expect(2)
            .create_async()
            .await;
        server
            .mock("GET", "/")
            .with_body(V1_BODY)
            .expect(2)
            .create_async()
            .await;

        let prompt = Arc::new(CountingPrompt::new(true));
        let provider =
            AnisetteProvider::builder(server.url(), Arc::new(MemoryStore::new()))
                .consent_prompt(prompt.clone())
                .build();

        provider.fetch_anisette().await.unwrap();
        provider.revoke_legacy_consent().unwrap();
        provider.fetch_anisette().await.unwrap();
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn provisioned_device_fetches_headers_directly() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v3/client_info")
            .with_body(r#"{"client_info":"<Mac>","user_agent":"akd/1.0"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/v3/get_headers")
            .with_body(r#"{"X-Apple-I-MD-M":"m1","X-Apple-I-MD":"p1"}"#)
            .create_async()
            .await;

        let store = Arc::new(MemoryStore::new());
        store
            .set(KEY_IDENTIFIER, b"AAECAwQFBgcICQoLDA0ODw==")
            .unwrap();
        store.set(KEY_ADI_PB, b"XYZ").unwrap();

        let provider = AnisetteProvider::builder(server.url(), store).build();
        let headers = provider.fetch_anisette().await.unwrap();

        assert_eq!(headers.machine_id, "m1");
        assert_eq!(headers.device_description, "<Mac>");
        assert_eq!(headers.device_serial_number, "0");
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_before_any_network_call() {
        let mut server = mockito::Server::new_async().await;
        let probe = server
            .mock("GET", "/v3/client_info")
            .with_body("{}")
            .expect(0)
            .create_async()
            .await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let provider =
            AnisetteProvider::builder(server.url(), Arc::new(MemoryStore::new()))
                .cancellation_token(cancel)
                .build();

        let err = provider.fetch_anisette().await.unwrap_err();
        assert!(matches!(err, AnisetteError::Cancelled));
        probe.assert_async().await;
    }

    #[tokio::test]
    async fn unreachable_client_info_is_an_anisette_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v3/client_info")
            .with_status(404)
            .with_body("<html>not found</html>")
            .create_async()
            .await;

        let provider =
            AnisetteProvider::builder(server.url(), Arc::new(MemoryStore::new()))
                .build();
        let err = provider.fetch_anisette().await.unwrap_err();
        assert!(matches!(err, AnisetteError::Anisette(_)));
    }

    #[tokio::test]
    async fn concurrent_fetches_are_serialized() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v3/client_info")
            .with_body(r#"{"client_info":"<Mac>","user_agent":"akd/1.0"}"#)
            .expect_at_least(1)
            .create_async()
            .await;
        server
            .mock("POST", "/v3/get_headers")
            .with_body(r#"{"X-Apple-I-MD-M":"m1","X-Apple-I-MD":"p1"}"#)
            .expect(2)
            .create_async()
            .await;

        let store = Arc::new(MemoryStore::new());
        store
            .set(KEY_IDENTIFIER, b"AAECAwQFBgcICQoLDA0ODw==")
            .unwrap();
        store.set(KEY_ADI_PB, b"XYZ").unwrap();

        let provider =
            Arc::new(AnisetteProvider::builder(server.url(), store).build());
        let started = Arc::new(AtomicBool::new(false));

        let first = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.fetch_anisette().await })
        };
        let second = {
            let provider = provider.clone();
            let started = started.clone();
            tokio::spawn(async move {
                started.store(true, Ordering::SeqCst);
                provider.fetch_anisette().await
            })
        };

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
        assert!(started.load(Ordering::SeqCst));
    }
}
