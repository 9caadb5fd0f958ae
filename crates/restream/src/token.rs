use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use reqwest::header::LOCATION;
use tokio::time::Instant;
use url::Url;

use crate::{
    error::{RestreamError, RestreamResult},
    util::http::HttpClient,
};

/// Edge node location plus the token which authorizes requests to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeEndpoint {
    /// Directory of the manifest on the edge node, always ending with `/`.
    pub base: Url,
    /// Opaque token: the query string of the redirect, or the edge path when the token
    /// is embedded in it.
    pub token: String,
    query: Option<String>,
}

impl EdgeEndpoint {
    /// Split the edge URL of a manifest into its directory and token.
    pub fn from_manifest_url(url: &Url) -> RestreamResult<Self> {
        if url.cannot_be_a_base() || url.host_str().is_none() {
            return Err(RestreamError::TokenRefreshFailed(format!(
                "malformed edge location: {url}"
            )));
        }

        let mut base = url.join("./")?;
        base.set_query(None);
        base.set_fragment(None);

        let query = url.query().filter(|q| !q.is_empty()).map(str::to_string);
        let token = match &query {
            Some(query) => query.clone(),
            None => base.path().trim_matches('/').to_string(),
        };
        if token.is_empty() {
            return Err(RestreamError::TokenRefreshFailed(format!(
                "no token in edge location: {url}"
            )));
        }

        Ok(Self { base, token, query })
    }

    /// Resolve a path relative to the manifest directory, carrying the token query.
    pub fn resolve(&self, path: &str) -> RestreamResult<Url> {
        let mut url = self.base.join(path)?;
        if let (Some(query), None) = (&self.query, url.query()) {
            url.set_query(Some(query));
        }
        Ok(url)
    }
}

struct EdgeToken {
    endpoint: EdgeEndpoint,
    issued_at: Instant,
    expires_at: Instant,
}

/// The edge credentials of one channel.
///
/// Reading the current endpoint never waits on network I/O; a refresh runs under
/// its own async lock so at most one is in flight per session.
pub struct TokenSession {
    client: HttpClient,
    entry_url: Url,
    validity: Duration,
    safety_margin: Duration,

    current: Mutex<Option<EdgeToken>>,
    refresh_lock: tokio::sync::Mutex<()>,
    refreshes: AtomicU64,
}

impl TokenSession {
    pub fn new(
        client: HttpClient,
        entry_url: Url,
        validity: Duration,
        safety_margin: Duration,
    ) -> Self {
        Self {
            client,
            entry_url,
            validity,
            safety_margin,
            current: Mutex::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Seed the session with an edge URL which was issued just now.
    pub fn with_initial_edge(self, edge_manifest_url: &Url) -> RestreamResult<Self> {
        let endpoint = EdgeEndpoint::from_manifest_url(edge_manifest_url)?;
        self.store(endpoint);
        Ok(self)
    }

    pub fn entry_url(&self) -> &Url {
        &self.entry_url
    }

    /// Endpoint for the next request, if any was issued yet.
    pub fn current_endpoint(&self) -> Option<EdgeEndpoint> {
        self.lock().as_ref().map(|t| t.endpoint.clone())
    }

    /// Remaining validity of the current token.
    pub fn remaining(&self) -> Option<Duration> {
        self.lock()
            .as_ref()
            .map(|t| t.expires_at.saturating_duration_since(Instant::now()))
    }

    /// Token issue time of the current endpoint.
    pub fn issued_at(&self) -> Option<Instant> {
        self.lock().as_ref().map(|t| t.issued_at)
    }

    /// Number of refreshes performed so far.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Return an endpoint which stays valid for at least the safety margin,
    /// refreshing the token first when necessary.
    pub async fn ensure_fresh(&self) -> RestreamResult<EdgeEndpoint> {
        if let Some(endpoint) = self.fresh_endpoint() {
            return Ok(endpoint);
        }

        let _guard = self.refresh_lock.lock().await;

        // someone else refreshed while we were waiting for the lock
        if let Some(endpoint) = self.fresh_endpoint() {
            return Ok(endpoint);
        }

        self.refresh().await
    }

    /// Mark the current token as expired, e.g. after the edge rejected it.
    pub fn invalidate(&self) {
        if let Some(token) = self.lock().as_mut() {
            token.expires_at = token.issued_at;
        }
    }

    fn fresh_endpoint(&self) -> Option<EdgeEndpoint> {
        let current = self.lock();
        let token = current.as_ref()?;
        let remaining = token.expires_at.saturating_duration_since(Instant::now());
        (remaining > self.safety_margin).then(|| token.endpoint.clone())
    }

    async fn refresh(&self) -> RestreamResult<EdgeEndpoint> {
        let response = self
            .client
            .get(self.entry_url.clone())
            .send()
            .await
            .map_err(|e| RestreamError::TokenRefreshFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_redirection() {
            return Err(RestreamError::TokenRefreshFailed(format!(
                "expected a redirect from {}, got {status}",
                self.entry_url
            )));
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|l| l.to_str().ok())
            .ok_or_else(|| {
                RestreamError::TokenRefreshFailed(format!("{status} without Location header"))
            })?;
        let location = self
            .entry_url
            .join(location)
            .map_err(|e| RestreamError::TokenRefreshFailed(format!("bad Location: {e}")))?;

        let endpoint = EdgeEndpoint::from_manifest_url(&location)?;
        self.store(endpoint.clone());
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(edge = %endpoint.base, "Edge token refreshed");

        Ok(endpoint)
    }

    fn store(&self, endpoint: EdgeEndpoint) {
        let issued_at = Instant::now();
        *self.lock() = Some(EdgeToken {
            endpoint,
            issued_at,
            expires_at: issued_at + self.validity,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<EdgeToken>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
