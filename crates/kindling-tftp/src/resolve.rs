//! Kernel parameter resolution.
//!
//! Boot parameters for a machine live in a remote service; the backend
//! asks for them per request. The trait seam keeps the TFTP side testable
//! without a network and lets deployments swap the transport.

use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

use kindling_pxe::KernelParameters;

use crate::error::BackendError;

/// Resolves kernel boot parameters for a client request.
#[async_trait]
pub trait ParamsResolver: Send + Sync {
    /// Resolve parameters for the given request query.
    ///
    /// `Ok(None)` means the service has no boot configuration for this
    /// machine; the caller reports the requested file as missing.
    async fn resolve(
        &self,
        query: &[(String, String)],
    ) -> std::result::Result<Option<KernelParameters>, BackendError>;
}

/// Resolver backed by the HTTP parameter generation service.
#[derive(Debug, Clone)]
pub struct HttpResolver {
    client: reqwest::Client,
    generator_url: Url,
}

impl HttpResolver {
    pub fn new(generator_url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            generator_url,
        }
    }

    /// The per-request URL: the generator URL's own query pairs merged
    /// with the request parameters. On a key collision the request wins.
    fn request_url(&self, query: &[(String, String)]) -> Url {
        let mut url = self.generator_url.clone();
        let base: Vec<(String, String)> = url
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            for (key, value) in &base {
                if !query.iter().any(|(request_key, _)| request_key == key) {
                    pairs.append_pair(key, value);
                }
            }
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        url
    }
}

#[async_trait]
impl ParamsResolver for HttpResolver {
    async fn resolve(
        &self,
        query: &[(String, String)],
    ) -> std::result::Result<Option<KernelParameters>, BackendError> {
        let url = self.request_url(query);
        let response = self.client.get(url).send().await?;
        // 204: the service answered but has nothing for this machine.
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let params = response.error_for_status()?.json().await?;
        Ok(Some(params))
    }
}
