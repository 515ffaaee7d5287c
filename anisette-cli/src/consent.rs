//! Consent prompts deciding legacy-server use.

use anisette_core::LegacyConsentPrompt;
use async_trait::async_trait;

/// Accepts every legacy server; selected with `--trust-legacy`.
pub struct AlwaysTrust;

#[async_trait]
impl LegacyConsentPrompt for AlwaysTrust {
    async fn confirm_legacy(&self, server_address: &str) -> bool {
        tracing::warn!("trusting legacy anisette server {server_address} (--trust-legacy)");
        true
    }
}

/// Interactive terminal prompt.
pub struct TerminalPrompt;

#[async_trait]
impl LegacyConsentPrompt for TerminalPrompt {
    async fn confirm_legacy(&self, server_address: &str) -> bool {
        let server = server_address.to_string();
        tokio::task::spawn_blocking(move || {
            eprintln!(
                "WARNING: {server} is an older anisette server. Using it has a higher \
                 likelihood of locking your account. Continue? [y/N]"
            );
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() {
                return false;
            }
            matches!(line.trim(), "y" | "Y" | "yes")
        })
        .await
        .unwrap_or(false)
    }
}
