//! HTTP client for the control plane.
//!
//! A thin reqwest wrapper with per-operation deadlines. The client carries
//! the agent's TLS identity for mTLS and additionally forwards its leaf
//! certificate in `x-client-cert` — the same header a TLS-terminating
//! edge proxy populates — so the control plane sees one shape of request
//! whether or not a proxy sits in between.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use nkudo_types::wire::{
    EnrollRequest, EnrollResponse, ErrorBody, ExecutionResultRequest, Heartbeat,
    HeartbeatResponse, LogBatch, RenewRequest, RenewResponse,
};

use crate::config::deadlines;
use crate::error::ClientError;

/// Client for the control plane's agent surface.
pub struct ControlPlaneClient {
    base_url: String,
    http: reqwest::Client,
    /// URL-encoded leaf certificate, sent on authenticated calls.
    cert_header: Option<String>,
}

impl std::fmt::Debug for ControlPlaneClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ControlPlaneClient {
    /// Client without an identity — only enrollment is possible.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Identity`] if the TLS stack fails to build.
    pub fn unauthenticated(base_url: &str, insecure_tls: bool) -> Result<Self, ClientError> {
        let http = builder(insecure_tls)
            .build()
            .map_err(|e| ClientError::Identity {
                reason: e.to_string(),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            http,
            cert_header: None,
        })
    }

    /// Client with the agent's key, certificate, and pinned CA.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Identity`] if the material fails to parse.
    pub fn with_identity(
        base_url: &str,
        key_pem: &str,
        cert_pem: &str,
        ca_pem: &str,
        insecure_tls: bool,
    ) -> Result<Self, ClientError> {
        let identity_pem = format!("{cert_pem}\n{key_pem}");
        let identity = reqwest::Identity::from_pem(identity_pem.as_bytes()).map_err(|e| {
            ClientError::Identity {
                reason: format!("identity parse failed: {e}"),
            }
        })?;
        let ca = reqwest::Certificate::from_pem(ca_pem.as_bytes()).map_err(|e| {
            ClientError::Identity {
                reason: format!("CA parse failed: {e}"),
            }
        })?;
        let http = builder(insecure_tls)
            .identity(identity)
            .add_root_certificate(ca)
            .build()
            .map_err(|e| ClientError::Identity {
                reason: e.to_string(),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            http,
            cert_header: Some(urlencoding::encode(cert_pem).into_owned()),
        })
    }

    /// Redeem an enrollment token.
    ///
    /// # Errors
    ///
    /// Propagates transport and API errors.
    pub async fn enroll(&self, request: &EnrollRequest) -> Result<EnrollResponse, ClientError> {
        self.post("/v1/enroll", request, deadlines::ENROLL).await
    }

    /// Post a heartbeat.
    ///
    /// # Errors
    ///
    /// Propagates transport and API errors.
    pub async fn heartbeat(
        &self,
        heartbeat: &Heartbeat,
    ) -> Result<HeartbeatResponse, ClientError> {
        self.post("/v1/heartbeat", heartbeat, deadlines::HEARTBEAT)
            .await
    }

    /// Pull pending plans without a heartbeat.
    ///
    /// # Errors
    ///
    /// Propagates transport and API errors.
    pub async fn plans_next(&self) -> Result<HeartbeatResponse, ClientError> {
        let response = self
            .authenticated(self.http.get(format!("{}/v1/plans/next", self.base_url)))
            .timeout(deadlines::DISPATCH)
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Report terminal execution results.
    ///
    /// # Errors
    ///
    /// Propagates transport and API errors.
    pub async fn report_results(
        &self,
        request: &ExecutionResultRequest,
    ) -> Result<(), ClientError> {
        let _: serde_json::Value = self
            .post("/v1/executions/result", request, deadlines::DISPATCH)
            .await?;
        Ok(())
    }

    /// Ship execution log frames.
    ///
    /// # Errors
    ///
    /// Propagates transport and API errors.
    pub async fn send_logs(&self, batch: &LogBatch) -> Result<(), ClientError> {
        let _: serde_json::Value = self.post("/v1/logs", batch, deadlines::DISPATCH).await?;
        Ok(())
    }

    /// Rotate the client certificate.
    ///
    /// # Errors
    ///
    /// Propagates transport and API errors.
    pub async fn renew(&self, request: &RenewRequest) -> Result<RenewResponse, ClientError> {
        self.post("/v1/renew", request, deadlines::RENEWAL).await
    }

    /// Revoke this agent's certificate and detach it.
    ///
    /// # Errors
    ///
    /// Propagates transport and API errors.
    pub async fn unenroll(&self) -> Result<(), ClientError> {
        let response = self
            .authenticated(self.http.post(format!("{}/v1/unenroll", self.base_url)))
            .timeout(deadlines::RENEWAL)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    /// Probe whether this client's identity is accepted (used by the
    /// rotator before swapping certificates into place).
    ///
    /// # Errors
    ///
    /// Propagates transport and API errors.
    pub async fn probe(&self) -> Result<(), ClientError> {
        self.plans_next().await.map(|_| ())
    }

    fn authenticated(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.cert_header {
            Some(header) => builder.header("x-client-cert", header),
            None => builder,
        }
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        deadline: Duration,
    ) -> Result<T, ClientError> {
        let response = self
            .authenticated(self.http.post(format!("{}{path}", self.base_url)))
            .timeout(deadline)
            .json(body)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::MalformedResponse {
                reason: e.to_string(),
            })
    }

    async fn api_error(response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        match response.json::<ErrorBody>().await {
            Ok(body) => ClientError::Api {
                status,
                code: body.error,
                message: body.message,
            },
            Err(_) => ClientError::Api {
                status,
                code: "UNKNOWN".to_owned(),
                message: "no error body".to_owned(),
            },
        }
    }
}

fn builder(insecure_tls: bool) -> reqwest::ClientBuilder {
    let builder = reqwest::Client::builder().use_rustls_tls();
    if insecure_tls {
        builder.danger_accept_invalid_certs(true)
    } else {
        builder
    }
}
