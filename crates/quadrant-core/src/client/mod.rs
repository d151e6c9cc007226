//! HTTP client for quadrant servers.
//!
//! One accessor per call shape:
//! - [`RpcClient::query`] / [`RpcClient::mutate`]: one request, one response
//! - [`RpcClient::subscribe`]: server-push stream of events
//! - [`RpcClient::connect`]: full-duplex connection
//!
//! Input is validated before anything touches the network, and every value
//! coming back is validated against the declared output shape before the
//! caller sees it. No retries and no cancellation of in-flight one-shot
//! calls; a per-request timeout is configurable on [`ClientConfig`].
//!
//! # Thread Safety
//!
//! `RpcClient` is cheap to clone and safe to share across tasks; every
//! streaming call owns its own transport.

mod duplex;
mod subscription;

pub use subscription::{StreamEvent, Subscription};

use crate::config::ClientConfig;
use crate::connection::DuplexConnection;
use crate::error::{Result, RpcError};
use crate::schema::{MethodKind, Procedure};
use crate::typed::{DuplexRpc, MutationRpc, QueryRpc, Rpc, SubscriptionRpc};
use crate::validate::validate;
use crate::wire;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use serde_json::Value;
use tracing::debug;

/// Client for one quadrant server.
#[derive(Debug, Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl RpcClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in config.headers() {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| RpcError::Config {
                message: format!("Invalid header name {}: {}", name, e),
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| RpcError::Config {
                message: format!("Invalid value for header {}: {}", name, e),
            })?;
            headers.insert(name, value);
        }

        let http = reqwest::Client::builder().default_headers(headers).build()?;
        Ok(Self { http, config })
    }

    /// Client for the server named by `QUADRANT_API_URL`.
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Run a QUERY.
    pub async fn query<R: QueryRpc>(&self, input: &R::Input) -> Result<R::Output> {
        self.one_shot::<R>(input).await
    }

    /// Run a MUTATION.
    pub async fn mutate<R: MutationRpc>(&self, input: &R::Input) -> Result<R::Output> {
        self.one_shot::<R>(input).await
    }

    /// Open a SUBSCRIPTION.
    ///
    /// Resolves once the server has accepted the stream; the returned
    /// [`Subscription`] yields `Opened` first.
    pub async fn subscribe<R: SubscriptionRpc>(
        &self,
        input: &R::Input,
    ) -> Result<Subscription<R::Output>> {
        let label = R::label();
        let input = validate(&R::input_shape(), &serde_json::to_value(input)?).map_err(
            |failure| RpcError::InvalidInput {
                procedure: label.clone(),
                failure,
            },
        )?;
        let url = wire::with_payload(&self.config.endpoint(R::SERVICE, R::NAME), &input)?;

        debug!("Subscribing to {}", label);
        let response = self
            .http
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(remote_error(status.as_u16(), response.text().await.unwrap_or_default()));
        }

        Ok(Subscription::start(label, R::output_shape(), response))
    }

    /// Open a BIDIRECTIONAL connection.
    ///
    /// Register message listeners on the returned connection before sending:
    /// inbound messages that arrive with no listener are dropped.
    pub async fn connect<R: DuplexRpc>(&self) -> Result<DuplexConnection<R::Input, R::Output>> {
        let url = self.config.socket_endpoint(R::SERVICE, R::NAME);
        let core = duplex::open(
            &url,
            self.config.headers(),
            R::label(),
            R::input_shape(),
            R::output_shape(),
        )
        .await?;
        Ok(DuplexConnection::owned(core))
    }

    /// Untyped one-shot call against a registry declaration.
    ///
    /// Returns the normalized output value.
    pub async fn call(&self, service: &str, procedure: &Procedure, input: Value) -> Result<Value> {
        let label = format!("{}.{}", service, procedure.name());
        let kind = procedure.kind();
        if !kind.is_one_shot() {
            return Err(RpcError::KindMismatch {
                service: service.to_string(),
                procedure: procedure.name().to_string(),
                kind,
                detail: "not a one-shot procedure".to_string(),
            });
        }

        let input = validate(procedure.input(), &input).map_err(|failure| RpcError::InvalidInput {
            procedure: label.clone(),
            failure,
        })?;

        let endpoint = self.config.endpoint(service, procedure.name());
        let request = match kind {
            MethodKind::Query => self.http.get(wire::with_payload(&endpoint, &input)?),
            _ => self.http.post(&endpoint).json(&input),
        };
        let request = match self.config.request_timeout() {
            Some(timeout) => request.timeout(timeout),
            None => request,
        };

        debug!("Calling {} ({})", label, kind);
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(remote_error(status.as_u16(), response.text().await.unwrap_or_default()));
        }

        let body = response.bytes().await?;
        let data = wire::extract_data(&body)?;

        validate(procedure.output(), &data).map_err(|failure| RpcError::InvalidOutput {
            procedure: label,
            failure,
        })
    }

    async fn one_shot<R: Rpc>(&self, input: &R::Input) -> Result<R::Output> {
        let data = self
            .call(R::SERVICE, &R::declaration(), serde_json::to_value(input)?)
            .await?;

        serde_json::from_value(data).map_err(|e| RpcError::MalformedResponse {
            message: format!("{} returned an undecodable value: {}", R::label(), e),
        })
    }
}

fn remote_error(status: u16, text: String) -> RpcError {
    let message = if text.is_empty() {
        "No error message returned from backend".to_string()
    } else {
        text
    };
    RpcError::Remote {
        status: Some(status),
        message,
    }
}
