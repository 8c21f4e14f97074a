use derive_more::Display;
use log::trace;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

/// The result type of tracker operations.
pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TrackerError {
    /// Failed to parse the tracker announce url.
    #[error("failed to parse tracker url, {0}")]
    Parse(String),
    /// The scheme of the tracker announce url is not supported.
    #[error("scheme \"{0}\" is not supported")]
    UnsupportedScheme(String),
}

/// A handle onto a single announce endpoint.
/// The announce protocol itself is driven elsewhere, the handle only carries the
/// validated url together with the request settings of the session.
#[derive(Debug, Clone, Display, PartialEq)]
#[display("{}", url)]
pub struct Tracker {
    url: Url,
    timeout: Duration,
    user_agent: String,
}

impl Tracker {
    /// Get the announce url of the tracker.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the request timeout of the tracker.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Get the user agent used for announce requests.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

/// The session wide tracker cache.
/// Tracker handles are created once per announce url and shared between torrents.
#[derive(Debug, Clone)]
pub struct TrackerManager {
    trackers: Arc<Mutex<HashMap<String, Tracker>>>,
}

impl TrackerManager {
    pub fn new() -> Self {
        Self {
            trackers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Get or create the tracker handle for the given announce url.
    ///
    /// # Returns
    ///
    /// It returns an error when the url could not be parsed or uses an unsupported scheme.
    pub async fn get(
        &self,
        url: &str,
        timeout: Duration,
        user_agent: &str,
    ) -> TrackerResult<Tracker> {
        let mut trackers = self.trackers.lock().await;
        if let Some(tracker) = trackers.get(url) {
            return Ok(tracker.clone());
        }

        let parsed = Url::parse(url).map_err(|e| TrackerError::Parse(e.to_string()))?;
        match parsed.scheme() {
            "http" | "https" | "udp" => {}
            scheme => return Err(TrackerError::UnsupportedScheme(scheme.to_string())),
        }

        trace!("Created tracker handle for {}", parsed);
        let tracker = Tracker {
            url: parsed,
            timeout,
            user_agent: user_agent.to_string(),
        };
        trackers.insert(url.to_string(), tracker.clone());
        Ok(tracker)
    }

    /// Get the number of cached tracker handles.
    pub async fn len(&self) -> usize {
        self.trackers.lock().await.len()
    }
}

impl Default for TrackerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracker_manager_get() {
        let manager = TrackerManager::new();

        let result = manager
            .get(
                "udp://tracker.example.org:1337/announce",
                Duration::from_secs(10),
                "downpour/0.1",
            )
            .await
            .expect("expected a tracker handle");

        assert_eq!("udp", result.url().scheme());
        assert_eq!(Duration::from_secs(10), result.timeout());
        assert_eq!("downpour/0.1", result.user_agent());
    }

    #[tokio::test]
    async fn test_tracker_manager_caches_handles() {
        let manager = TrackerManager::new();
        let url = "http://tracker.example.org/announce";

        let first = manager
            .get(url, Duration::from_secs(10), "downpour/0.1")
            .await
            .unwrap();
        let second = manager
            .get(url, Duration::from_secs(30), "other-agent")
            .await
            .unwrap();

        assert_eq!(first, second, "expected the cached handle to be returned");
        assert_eq!(1, manager.len().await);
    }

    #[tokio::test]
    async fn test_tracker_manager_unsupported_scheme() {
        let manager = TrackerManager::new();

        let result = manager
            .get("ws://tracker.example.org", Duration::from_secs(10), "downpour/0.1")
            .await;

        assert_eq!(
            Err(TrackerError::UnsupportedScheme("ws".to_string())),
            result
        );
    }

    #[tokio::test]
    async fn test_tracker_manager_invalid_url() {
        let manager = TrackerManager::new();

        let result = manager
            .get("not a url", Duration::from_secs(10), "downpour/0.1")
            .await;

        if let Err(TrackerError::Parse(_)) = result {
        } else {
            panic!("expected TrackerError::Parse, but got {:?} instead", result);
        }
    }
}
