//! Apple GSA provisioning endpoints.
//!
//! These endpoints speak an XML property-list envelope with `Header`,
//! `Request` and `Response` top-level keys, and every request carries the
//! fixed Apple header set built from [`ClientInfo`] and the device identity.
//! Parse failures here are hard failures: malformed plist from Apple is not
//! transient.

use reqwest::RequestBuilder;
use serde::Deserialize;

use crate::client_info::ClientInfo;
use crate::error::AnisetteError;
use crate::headers::{signing_timestamp, LocalEnvironment};
use crate::http::Request;
use crate::identity::DeviceIdentity;

/// Well-known GSA service directory, queried once per run for the
/// provisioning endpoint URLs.
pub const DEFAULT_LOOKUP_URL: &str = "https://gsa.apple.com/grandslam/GsService2/lookup";

/// Provisioning endpoint URLs resolved from the service directory, reused
/// across handshake retries within one run.
#[derive(Debug, Clone)]
pub(crate) struct ProvisioningUrls {
    pub(crate) start_provisioning: String,
    pub(crate) end_provisioning: String,
}

/// The fixed request header set for Apple-facing calls.
pub(crate) struct AppleHeaders<'a> {
    pub(crate) client_info: &'a ClientInfo,
    pub(crate) identity: &'a DeviceIdentity,
    pub(crate) env: &'a LocalEnvironment,
}

impl AppleHeaders<'_> {
    pub(crate) fn apply(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("X-Mme-Client-Info", &self.client_info.client_info)
            .header("User-Agent", &self.client_info.user_agent)
            .header("Content-Type", "text/x-xml-plist")
            .header("Accept", "*/*")
            .header("X-Apple-I-MD-LU", self.identity.local_user_id())
            .header("X-Mme-Device-Id", self.identity.device_unique_identifier())
            .header("X-Apple-I-Client-Time", signing_timestamp())
            .header("X-Apple-Locale", &self.env.locale)
            .header("X-Apple-I-TimeZone", &self.env.time_zone)
    }
}

#[derive(Deserialize)]
struct LookupEnvelope {
    urls: LookupUrls,
}

#[derive(Deserialize)]
struct LookupUrls {
    #[serde(rename = "midStartProvisioning")]
    mid_start_provisioning: String,
    #[serde(rename = "midFinishProvisioning")]
    mid_finish_provisioning: String,
}

#[derive(Deserialize)]
struct StartEnvelope {
    #[serde(rename = "Response")]
    response: StartResponse,
}

#[derive(Deserialize)]
struct StartResponse {
    spim: String,
}

#[derive(Deserialize)]
struct EndEnvelope {
    #[serde(rename = "Response")]
    response: EndResponse,
}

#[derive(Deserialize)]
struct EndResponse {
    ptm: String,
    tk: String,
}

/// Encodes the `{Header: {}, Request: {...}}` XML plist envelope.
fn encode_envelope(request: plist::Dictionary) -> Result<Vec<u8>, AnisetteError> {
    #[derive(serde::Serialize)]
    struct Envelope {
        #[serde(rename = "Header")]
        header: plist::Dictionary,
        #[serde(rename = "Request")]
        request: plist::Dictionary,
    }

    let envelope = Envelope {
        header: plist::Dictionary::new(),
        request,
    };
    let mut body = Vec::new();
    plist::to_writer_xml(&mut body, &envelope).map_err(|err| {
        AnisetteError::provisioning(format!("failed to encode request envelope: {err}"))
    })?;
    Ok(body)
}

async fn post_envelope(
    http: &Request,
    url: &str,
    headers: &AppleHeaders<'_>,
    request: plist::Dictionary,
) -> Result<Vec<u8>, AnisetteError> {
    let body = encode_envelope(request)?;
    let response = headers
        .apply(http.post(url))
        .body(body)
        .send()
        .await
        .map_err(|err| {
            AnisetteError::provisioning(format!("request to {url} failed: {err}"))
        })?;
    let bytes = response.bytes().await.map_err(|err| {
        AnisetteError::provisioning(format!("failed to read response from {url}: {err}"))
    })?;
    Ok(bytes.to_vec())
}

/// Resolves the provisioning endpoint URLs from the service directory.
pub(crate) async fn lookup_provisioning_urls(
    http: &Request,
    lookup_url: &str,
    headers: &AppleHeaders<'_>,
) -> Result<ProvisioningUrls, AnisetteError> {
    let response = headers
        .apply(http.get(lookup_url))
        .send()
        .await
        .map_err(|err| {
            AnisetteError::provisioning(format!("service directory lookup failed: {err}"))
        })?;
    let bytes = response.bytes().await.map_err(|err| {
        AnisetteError::provisioning(format!("service directory lookup failed: {err}"))
    })?;
    let lookup: LookupEnvelope = plist::from_bytes(&bytes).map_err(|err| {
        AnisetteError::provisioning(format!(
            "malformed service directory response: {err}"
        ))
    })?;
    log::debug!(
        "resolved provisioning endpoints: start={} end={}",
        lookup.urls.mid_start_provisioning,
        lookup.urls.mid_finish_provisioning
    );
    Ok(ProvisioningUrls {
        start_provisioning: lookup.urls.mid_start_provisioning,
        end_provisioning: lookup.urls.mid_finish_provisioning,
    })
}

/// POSTs an empty envelope to the start-provisioning endpoint and extracts
/// `spim`.
pub(crate) async fn start_provisioning(
    http: &Request,
    urls: &ProvisioningUrls,
    headers: &AppleHeaders<'_>,
) -> Result<String, AnisetteError> {
    let bytes =
        post_envelope(http, &urls.start_provisioning, headers, plist::Dictionary::new())
            .await?;
    let envelope: StartEnvelope = plist::from_bytes(&bytes).map_err(|err| {
        AnisetteError::provisioning(format!(
            "malformed start-provisioning response: {err}"
        ))
    })?;
    Ok(envelope.response.spim)
}

/// POSTs `cpim` to the end-provisioning endpoint and extracts `ptm` and `tk`.
pub(crate) async fn end_provisioning(
    http: &Request,
    urls: &ProvisioningUrls,
    headers: &AppleHeaders<'_>,
    cpim: &str,
) -> Result<(String, String), AnisetteError> {
    let mut request = plist::Dictionary::new();
    request.insert("cpim".to_string(), plist::Value::String(cpim.to_string()));
    let bytes = post_envelope(http, &urls.end_provisioning, headers, request).await?;
    let envelope: EndEnvelope = plist::from_bytes(&bytes).map_err(|err| {
        AnisetteError::provisioning(format!("malformed end-provisioning response: {err}"))
    })?;
    Ok((envelope.response.ptm, envelope.response.tk))
}
