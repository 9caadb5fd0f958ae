use std::{ops::Deref, time::Duration};

use reqwest::{redirect::Policy, Client, ClientBuilder, Proxy};

use crate::error::RestreamResult;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Shared HTTP client for every channel.
///
/// Redirects are never followed: the token probe has to observe the redirect of the
/// CDN entry point itself, and edge nodes answer segment requests directly.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(builder: ClientBuilder) -> RestreamResult<Self> {
        let client = builder.redirect(Policy::none()).build()?;
        Ok(Self { client })
    }

    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }
}

impl Deref for HttpClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[derive(Default)]
pub struct HttpClientBuilder {
    timeout: Option<Duration>,
    user_agent: Option<String>,
    proxy: Option<String>,
}

impl HttpClientBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn build(self) -> RestreamResult<HttpClient> {
        let mut builder = Client::builder().timeout(self.timeout.unwrap_or(DEFAULT_TIMEOUT));
        if let Some(user_agent) = self.user_agent {
            builder = builder.user_agent(user_agent);
        }
        if let Some(proxy) = self.proxy {
            builder = builder.proxy(Proxy::all(proxy)?);
        }
        HttpClient::new(builder)
    }
}
