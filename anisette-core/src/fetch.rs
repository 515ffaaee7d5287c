//! One-shot header fetch paths.

use std::collections::HashMap;

use serde::Serialize;

use crate::client_info::ClientInfo;
use crate::error::AnisetteError;
use crate::headers::{assemble_v3, remap_v1, AnisetteHeaders, LocalEnvironment};
use crate::http::Request;
use crate::identity::DeviceIdentity;

#[derive(Serialize)]
struct GetHeadersBody<'a> {
    identifier: &'a str,
    adi_pb: &'a str,
}

/// Legacy (V1) path: one GET to the server root, producing headers directly.
/// Any malformed or incomplete body is terminal; there is no retry.
pub(crate) async fn fetch_v1(
    http: &Request,
    base_url: &str,
) -> Result<AnisetteHeaders, AnisetteError> {
    log::info!("fetching anisette from legacy server");
    let response = http.get(base_url).send().await.map_err(|err| {
        AnisetteError::invalid_anisette(format!("legacy fetch failed: {err}"))
    })?;
    let raw: HashMap<String, String> = response.json().await.map_err(|err| {
        AnisetteError::invalid_anisette(format!("malformed legacy response: {err}"))
    })?;

    let fields = remap_v1(&raw);
    AnisetteHeaders::validate(&fields).map_err(AnisetteError::InvalidAnisette)
}

/// V3 path: POST the persisted identity and provisioning blob to
/// `get_headers`, then assemble the canonical set with client-derived fields
/// overriding anything the server returned for them.
pub(crate) async fn fetch_v3(
    http: &Request,
    base_url: &str,
    identity: &DeviceIdentity,
    adi_pb: &str,
    client_info: &ClientInfo,
    env: &LocalEnvironment,
) -> Result<AnisetteHeaders, AnisetteError> {
    log::info!("fetching anisette headers");
    let url = format!("{base_url}/v3/get_headers");
    let identifier = identity.to_base64();
    let body = GetHeadersBody {
        identifier: &identifier,
        adi_pb,
    };
    let response = http
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|err| AnisetteError::anisette(format!("header fetch failed: {err}")))?;
    let raw: HashMap<String, String> = response.json().await.map_err(|err| {
        AnisetteError::anisette(format!("malformed header response: {err}"))
    })?;

    if raw.get("result").is_some_and(|result| result == "GetHeadersError") {
        let message = raw.get("message").map_or("unknown", String::as_str);
        return Err(AnisetteError::anisette(format!(
            "server refused to produce headers: {message}"
        )));
    }

    let fields = assemble_v3(&raw, identity, client_info, env);
    AnisetteHeaders::validate(&fields).map_err(AnisetteError::Anisette)
}
