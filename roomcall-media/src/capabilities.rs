//! Capability negotiation against the router

use crate::error::{Result, SessionError};
use crate::protocol::{MediaKind, RtpCapabilities};
use tokio::sync::watch;
use tracing::{debug, info};

/// Holds the capability set agreed between the router and the local engine.
///
/// Loading is idempotent. Every publish and consume path checks
/// [`is_loaded`](Self::is_loaded) before using the capabilities.
pub struct CapabilityNegotiator {
    loaded: watch::Sender<Option<RtpCapabilities>>,
}

impl Default for CapabilityNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityNegotiator {
    #[must_use]
    pub fn new() -> Self {
        let (loaded, _) = watch::channel(None);
        Self { loaded }
    }

    /// Intersect the router capabilities with the native ones.
    ///
    /// A second call is a no-op returning the cached set.
    pub fn load(
        &self,
        router: &RtpCapabilities,
        native: &RtpCapabilities,
    ) -> Result<RtpCapabilities> {
        if let Some(existing) = self.capabilities() {
            debug!("Capabilities already loaded");
            return Ok(existing);
        }

        let codecs: Vec<_> = router
            .codecs
            .iter()
            .filter(|codec| native.codecs.iter().any(|local| local.matches(codec)))
            .cloned()
            .collect();

        if codecs.is_empty() {
            return Err(SessionError::NegotiationFailure(
                "no codec in common with the router".to_string(),
            ));
        }

        let capabilities = RtpCapabilities {
            codecs,
            header_extensions: router.header_extensions.clone(),
        };

        // First writer wins if two loads race
        let mut result = capabilities.clone();
        let stored = self.loaded.send_if_modified(|slot| match slot {
            Some(existing) => {
                result = existing.clone();
                false
            }
            None => {
                *slot = Some(capabilities);
                true
            }
        });

        if stored {
            info!(
                codecs = result.codecs.len(),
                audio = result.supports(MediaKind::Audio),
                video = result.supports(MediaKind::Video),
                "Loaded media capabilities"
            );
        }
        Ok(result)
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded.borrow().is_some()
    }

    #[must_use]
    pub fn capabilities(&self) -> Option<RtpCapabilities> {
        self.loaded.borrow().clone()
    }

    /// Whether a producer of `kind` can be negotiated
    #[must_use]
    pub fn can_produce(&self, kind: MediaKind) -> bool {
        self.loaded
            .borrow()
            .as_ref()
            .is_some_and(|caps| caps.supports(kind))
    }

    /// Resolves with the capabilities once they are loaded
    pub async fn wait_loaded(&self) -> Option<RtpCapabilities> {
        let mut rx = self.loaded.subscribe();
        let loaded = rx.wait_for(Option::is_some).await.ok()?;
        (*loaded).clone()
    }
}
