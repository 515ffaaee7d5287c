//! JSON text frames exchanged over the provisioning session.
//!
//! The server drives the exchange; every frame carries a `result`
//! discriminator plus result-specific payload keys. The client only ever
//! replies. Unmodeled or malformed frames terminate the handshake instead of
//! being ignored.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AnisetteError;

/// A decoded server frame the state machine knows how to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ServerMessage {
    /// Reply with the device identifier, generating one first if needed.
    GiveIdentifier,
    /// Obtain `spim` from Apple's start-provisioning endpoint and reply.
    GiveStartProvisioningData,
    /// Forward `cpim` to Apple's end-provisioning endpoint, reply with
    /// `ptm` and `tk`.
    GiveEndProvisioningData {
        /// Opaque client provisioning intermediate metadata from the server.
        cpim: String,
    },
    /// The handshake succeeded; the blob must be persisted before closing.
    ProvisioningSuccess {
        /// The opaque provisioning blob to persist.
        adi_pb: String,
    },
    /// Tear down and retry the whole handshake after the given delay.
    TryAgainSoon {
        /// Server-specified wait before the next attempt.
        duration: Duration,
    },
}

#[derive(Deserialize)]
struct RawFrame {
    result: String,
    duration: Option<f64>,
    cpim: Option<String>,
    adi_pb: Option<String>,
}

impl ServerMessage {
    /// Parses one text frame.
    ///
    /// # Errors
    ///
    /// Any frame that is not one of the five modeled results is a terminal
    /// provisioning failure: explicit error results (`*Error`, `*Invalid*`,
    /// `ClosingPerRequest`, `Timeout`, `TextOnly`) and unrecognized or
    /// payload-incomplete frames alike.
    pub(crate) fn parse(text: &str) -> Result<Self, AnisetteError> {
        let raw: RawFrame = serde_json::from_str(text).map_err(|err| {
            AnisetteError::provisioning(format!("malformed session frame: {err}"))
        })?;

        match raw.result.as_str() {
            "GiveIdentifier" => Ok(Self::GiveIdentifier),
            "GiveStartProvisioningData" => Ok(Self::GiveStartProvisioningData),
            "GiveEndProvisioningData" => {
                let cpim = raw.cpim.ok_or_else(|| {
                    AnisetteError::provisioning(
                        "GiveEndProvisioningData frame is missing cpim",
                    )
                })?;
                Ok(Self::GiveEndProvisioningData { cpim })
            }
            "ProvisioningSuccess" => {
                let adi_pb = raw.adi_pb.ok_or_else(|| {
                    AnisetteError::provisioning(
                        "ProvisioningSuccess frame is missing adi_pb",
                    )
                })?;
                Ok(Self::ProvisioningSuccess { adi_pb })
            }
            "TryAgainSoon" => {
                let millis = raw.duration.ok_or_else(|| {
                    AnisetteError::provisioning("TryAgainSoon frame is missing duration")
                })?;
                if !millis.is_finite() || millis < 0.0 {
                    return Err(AnisetteError::provisioning(
                        "TryAgainSoon duration is not a valid delay",
                    ));
                }
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let duration = Duration::from_millis(millis as u64);
                Ok(Self::TryAgainSoon { duration })
            }
            result => {
                if result.contains("Error")
                    || result.contains("Invalid")
                    || result == "ClosingPerRequest"
                    || result == "Timeout"
                    || result == "TextOnly"
                {
                    Err(AnisetteError::provisioning(format!(
                        "server reported {result}"
                    )))
                } else {
                    Err(AnisetteError::provisioning(format!(
                        "unrecognized session result {result}"
                    )))
                }
            }
        }
    }
}

/// Reply to `GiveIdentifier`.
#[derive(Serialize)]
pub(crate) struct IdentifierReply<'a> {
    pub(crate) identifier: &'a str,
}

/// Reply to `GiveStartProvisioningData`.
#[derive(Serialize)]
pub(crate) struct SpimReply<'a> {
    pub(crate) spim: &'a str,
}

/// Reply to `GiveEndProvisioningData`.
#[derive(Serialize)]
pub(crate) struct EndProvisioningReply<'a> {
    pub(crate) ptm: &'a str,
    pub(crate) tk: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modeled_frames() {
        assert_eq!(
            ServerMessage::parse(r#"{"result":"GiveIdentifier"}"#).unwrap(),
            ServerMessage::GiveIdentifier
        );
        assert_eq!(
            ServerMessage::parse(r#"{"result":"GiveStartProvisioningData"}"#).unwrap(),
            ServerMessage::GiveStartProvisioningData
        );
        assert_eq!(
            ServerMessage::parse(r#"{"result":"GiveEndProvisioningData","cpim":"c"}"#)
                .unwrap(),
            ServerMessage::GiveEndProvisioningData {
                cpim: "c".to_string()
            }
        );
        assert_eq!(
            ServerMessage::parse(r#"{"result":"ProvisioningSuccess","adi_pb":"XYZ"}"#)
                .unwrap(),
            ServerMessage::ProvisioningSuccess {
                adi_pb: "XYZ".to_string()
            }
        );
        assert_eq!(
            ServerMessage::parse(r#"{"result":"TryAgainSoon","duration":1500}"#).unwrap(),
            ServerMessage::TryAgainSoon {
                duration: Duration::from_millis(1500)
            }
        );
    }

    #[test]
    fn fractional_duration_is_truncated_to_millis() {
        assert_eq!(
            ServerMessage::parse(r#"{"result":"TryAgainSoon","duration":250.75}"#)
                .unwrap(),
            ServerMessage::TryAgainSoon {
                duration: Duration::from_millis(250)
            }
        );
    }

    #[test]
    fn classified_error_results_are_terminal() {
        for result in [
            "GiveIdentifierError",
            "InvalidIdentifier",
            "ClosingPerRequest",
            "Timeout",
            "TextOnly",
        ] {
            let err =
                ServerMessage::parse(&format!(r#"{{"result":"{result}"}}"#)).unwrap_err();
            assert!(
                matches!(err, AnisetteError::Provisioning(_)),
                "{result} should be a provisioning failure, got {err:?}"
            );
        }
    }

    #[test]
    fn unrecognized_results_are_terminal() {
        let err = ServerMessage::parse(r#"{"result":"BrandNewThing"}"#).unwrap_err();
        assert!(matches!(err, AnisetteError::Provisioning(_)));
    }

    #[test]
    fn missing_payload_fields_are_terminal() {
        for frame in [
            r#"{"result":"GiveEndProvisioningData"}"#,
            r#"{"result":"ProvisioningSuccess"}"#,
            r#"{"result":"TryAgainSoon"}"#,
            r#"{"result":"TryAgainSoon","duration":-5}"#,
        ] {
            assert!(matches!(
                ServerMessage::parse(frame),
                Err(AnisetteError::Provisioning(_))
            ));
        }
    }

    #[test]
    fn non_json_frames_are_terminal() {
        assert!(matches!(
            ServerMessage::parse("plain text"),
            Err(AnisetteError::Provisioning(_))
        ));
        assert!(matches!(
            ServerMessage::parse(r#"{"no_result":true}"#),
            Err(AnisetteError::Provisioning(_))
        ));
    }

    #[test]
    fn replies_serialize_to_expected_json() {
        assert_eq!(
            serde_json::to_string(&IdentifierReply { identifier: "id64" }).unwrap(),
            r#"{"identifier":"id64"}"#
        );
        assert_eq!(
            serde_json::to_string(&SpimReply { spim: "s" }).unwrap(),
            r#"{"spim":"s"}"#
        );
        assert_eq!(
            serde_json::to_string(&EndProvisioningReply { ptm: "p", tk: "t" }).unwrap(),
            r#"{"ptm":"p","tk":"t"}"#
        );
    }
}
