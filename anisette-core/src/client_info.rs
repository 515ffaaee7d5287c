use serde::Deserialize;

/// Server-chosen strings identifying the client software/platform to Apple.
///
/// Fetched once per provisioning run from the server's `client_info`
/// endpoint and cached for the run's lifetime. Every request carrying
/// Apple-facing headers needs both values, so a run cannot proceed without
/// them unless the server is a legacy one.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientInfo {
    /// The `X-Mme-Client-Info` value.
    pub client_info: String,
    /// The paired `User-Agent` value.
    pub user_agent: String,
}
