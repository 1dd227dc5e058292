//! Remote resource client
//!
//! Resolves endpoints through the [`Registry`], substitutes this operator's
//! location into every template, and maps HTTP outcomes onto
//! [`ClientError`]: 404 is `NotFound`, other non-2xx is `Remote`, and
//! connection failures are `Transport`.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use reqwest::{Method, Response, StatusCode, Url};
use serde::Serialize;
use tracing::{debug, trace};
use volley_common::metrics::{status_class, REMOTE_REQUESTS};
use volley_common::RemoteObject;

use crate::registry::{Collection, Registry};
use crate::{ClientError, PING_ENDPOINT};

/// Default base URL of the tracking API
pub const DEFAULT_ENDPOINT: &str = "http://localhost:8000/api/";

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for [`RemoteClient`]
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL; endpoint templates are resolved relative to it
    pub endpoint: String,
    /// Location slug substituted for `{location}`
    pub region: String,
    /// Basic-auth user
    pub user: Option<String>,
    /// Basic-auth password
    pub password: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl ClientConfig {
    /// Config for `region` against the default endpoint, without credentials
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            region: region.into(),
            user: None,
            password: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the base URL
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set basic-auth credentials
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Override the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Client for the job-tracking API
#[derive(Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    base: Url,
    region: String,
    user: Option<String>,
    password: Option<String>,
    registry: Arc<Registry>,
}

impl RemoteClient {
    /// Build a client; fails if the base URL is malformed
    pub fn new(config: ClientConfig, registry: Arc<Registry>) -> Result<Self, ClientError> {
        let mut endpoint = config.endpoint.clone();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        let base = Url::parse(&endpoint).map_err(|e| ClientError::InvalidEndpoint {
            endpoint: config.endpoint.clone(),
            message: e.to_string(),
        })?;

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("volley-operator/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base,
            region: config.region,
            user: config.user,
            password: config.password,
            registry,
        })
    }

    /// Location this client is bound to
    pub fn region(&self) -> &str {
        &self.region
    }

    /// The registry endpoints are resolved through
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn resolve(&self, template: &str, name: Option<&str>) -> Result<Url, ClientError> {
        let mut path = template.replace("{location}", &self.region);
        if let Some(name) = name {
            path = path.replace("{name}", name);
        }
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| ClientError::InvalidEndpoint {
                endpoint: template.to_string(),
                message: e.to_string(),
            })
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<Response, ClientError> {
        trace!(%method, %url, "tracking API request");
        let mut request = self.http.request(method.clone(), url.clone());
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_ref());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                record_request(&method, None);
                return Err(e.into());
            }
        };
        let status = response.status();
        record_request(&method, Some(status.as_u16()));

        if status == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Remote {
                method: method.to_string(),
                url: url.to_string(),
                code: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn decode_into<T: RemoteObject>(
        response: Response,
        obj: &mut T,
    ) -> Result<(), ClientError> {
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(());
        }
        *obj = serde_json::from_slice(&bytes).map_err(|source| ClientError::Decode {
            kind: T::KIND.to_string(),
            source,
        })?;
        Ok(())
    }

    /// Fetch one item by name
    pub async fn get<T: RemoteObject>(&self, name: &str) -> Result<T, ClientError> {
        let url = self.resolve(self.registry.item_endpoint::<T>()?, Some(name))?;
        let response = self.send(Method::GET, url, None::<&()>).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|source| ClientError::Decode {
            kind: T::KIND.to_string(),
            source,
        })
    }

    /// Fetch every item of `T` at this location
    pub async fn list<T: RemoteObject>(&self) -> Result<Vec<T>, ClientError> {
        let url = self.resolve(self.registry.collection_endpoint::<T>()?, None)?;
        let response = self.send(Method::GET, url, None::<&()>).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|source| ClientError::Decode {
            kind: T::KIND.to_string(),
            source,
        })
    }

    /// Fetch every item of a registered kind into a fresh type-erased collection
    pub async fn list_dyn(&self, kind: &str) -> Result<Box<dyn Collection>, ClientError> {
        let mut collection = self.registry.new_collection(kind)?;
        let url = self.resolve(self.registry.collection_endpoint_of(kind)?, None)?;
        let response = self.send(Method::GET, url, None::<&()>).await?;
        let bytes = response.bytes().await?;
        collection
            .decode(&bytes)
            .map_err(|source| ClientError::Decode {
                kind: kind.to_string(),
                source,
            })?;
        Ok(collection)
    }

    /// POST `obj` to its collection; the response replaces `obj` when non-empty
    pub async fn create<T: RemoteObject>(&self, obj: &mut T) -> Result<(), ClientError> {
        let url = self.resolve(self.registry.collection_endpoint::<T>()?, None)?;
        let response = self.send(Method::POST, url, Some(&*obj)).await?;
        Self::decode_into(response, obj).await
    }

    /// PUT `obj` to its item endpoint; the response replaces `obj` when non-empty
    pub async fn update<T: RemoteObject>(&self, obj: &mut T) -> Result<(), ClientError> {
        let url = self.resolve(self.registry.item_endpoint::<T>()?, Some(obj.name()))?;
        debug!(kind = T::KIND, name = %obj.name(), "updating remote object");
        let response = self.send(Method::PUT, url, Some(&*obj)).await?;
        Self::decode_into(response, obj).await
    }

    /// Mark this location's workers as online
    pub async fn ping(&self) -> Result<(), ClientError> {
        let url = self.resolve(PING_ENDPOINT, None)?;
        self.send(Method::PUT, url, None::<&()>).await?;
        Ok(())
    }
}

fn record_request(method: &Method, code: Option<u16>) {
    REMOTE_REQUESTS.add(
        1,
        &[
            KeyValue::new("method", method.to_string()),
            KeyValue::new("result", status_class(code)),
        ],
    );
}
