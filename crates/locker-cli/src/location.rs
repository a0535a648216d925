//! Location stand-ins for a host without a location service.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::warn;

use locker_core::{AuthorizationStatus, Error, LocationProvider, RemediationPrompt};
use locker_types::Coordinates;

/// Reports one configured position. Authorized only when a position is set.
#[derive(Debug, Clone, Copy)]
pub struct FixedLocation {
    coordinates: Option<Coordinates>,
}

impl FixedLocation {
    pub fn new(coordinates: Option<Coordinates>) -> Self {
        Self { coordinates }
    }
}

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn authorization_status(&self) -> AuthorizationStatus {
        if self.coordinates.is_some() {
            AuthorizationStatus::Authorized
        } else {
            AuthorizationStatus::Denied
        }
    }

    async fn request_authorization(&self) {}

    async fn request_location(&self) -> locker_core::Result<Coordinates> {
        self.coordinates
            .ok_or_else(|| Error::LocationUnavailable("no location configured".to_string()))
    }

    // The configured position never changes while the command runs
    fn authorization_changes(&self) -> BoxStream<'static, AuthorizationStatus> {
        futures::stream::empty().boxed()
    }
}

/// Tells the user how to supply a location.
#[derive(Debug, Default)]
pub struct LogPrompt;

impl RemediationPrompt for LogPrompt {
    fn show_location_settings(&self) {
        warn!("No location available. Pass --lat/--lng or set [location] in the config file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_location() {
        let provider = FixedLocation::new(Some(Coordinates { lat: 1.5, lng: 2.5 }));
        assert!(provider.authorization_status().await.is_authorized());
        assert_eq!(
            provider.request_location().await.unwrap(),
            Coordinates { lat: 1.5, lng: 2.5 }
        );
    }

    #[tokio::test]
    async fn test_missing_location_is_denied() {
        let provider = FixedLocation::new(None);
        assert!(provider.authorization_status().await.needs_remediation());
        assert!(provider.request_location().await.is_err());
        assert_eq!(provider.authorization_changes().next().await, None);
    }
}
