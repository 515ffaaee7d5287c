//! Common test utilities shared across integration tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anisette_core::{ProvisioningStream, StreamConnector, TransportError};
use async_trait::async_trait;

/// A scripted provisioning stream: yields a fixed sequence of server frames
/// and records everything the client sends.
pub struct ScriptedStream {
    incoming: VecDeque<String>,
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ProvisioningStream for ScriptedStream {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn recv_text(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.incoming.pop_front())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Hands out one [`ScriptedStream`] per connect, in order.
pub struct ScriptedConnector {
    scripts: Mutex<VecDeque<Vec<String>>>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl ScriptedConnector {
    pub fn new(scripts: Vec<Vec<&str>>) -> Self {
        Self {
            scripts: Mutex::new(
                scripts
                    .into_iter()
                    .map(|frames| frames.into_iter().map(str::to_string).collect())
                    .collect(),
            ),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Everything the client sent, across all attempts.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// How many scripted connections are still unused.
    pub fn remaining_scripts(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }
}

#[async_trait]
impl StreamConnector for ScriptedConnector {
    async fn connect(
        &self,
        _url: &str,
    ) -> Result<Box<dyn ProvisioningStream>, TransportError> {
        let frames = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TransportError::Connect("no scripted session left".to_string()))?;
        Ok(Box::new(ScriptedStream {
            incoming: frames.into(),
            sent: self.sent.clone(),
        }))
    }
}

/// Start-provisioning response envelope used by most scenarios.
pub const START_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict><key>Response</key><dict><key>spim</key><string>c3BpbQ==</string></dict></dict>
</plist>"#;

/// End-provisioning response envelope used by most scenarios.
pub const END_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict><key>Response</key><dict>
<key>ptm</key><string>cHRt</string>
<key>tk</key><string>dGs=</string>
</dict></dict>
</plist>"#;

/// Builds the service-directory response pointing at `base`.
pub fn lookup_plist(base: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
  <key>urls</key>
  <dict>
    <key>midStartProvisioning</key>
    <string>{base}/startProvisioning</string>
    <key>midFinishProvisioning</key>
    <string>{base}/endProvisioning</string>
  </dict>
</dict>
</plist>"#
    )
}
