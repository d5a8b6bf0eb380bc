//! JSON-RPC over HTTP transport to the signer cluster manager

use crate::client::SignerTransport;
use crate::error::{Result, TssError};
use crate::types::{Method, KEYGEN_METHOD};
use async_trait::async_trait;
use jsonrpsee::core::client::{ClientT, Error as ClientError};
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use serde_json::Value;
use std::time::Duration;

/// Calls `<method>` on the manager with the request as its single positional param
pub struct HttpSignerTransport {
    client: HttpClient,
    url: String,
}

impl HttpSignerTransport {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = HttpClientBuilder::default()
            .request_timeout(timeout)
            .build(url)
            .map_err(|e| TssError::Transport(e.to_string()))?;

        tracing::info!("Signer cluster client for {}", url);

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SignerTransport for HttpSignerTransport {
    async fn call(&self, method: Method, params: Value) -> Result<Value> {
        self.client
            .request::<Value, _>(method.as_str(), rpc_params![params])
            .await
            .map_err(map_client_error)
    }

    async fn keygen(&self, params: Value) -> Result<Value> {
        self.client
            .request::<Value, _>(KEYGEN_METHOD, rpc_params![params])
            .await
            .map_err(map_client_error)
    }
}

fn map_client_error(err: ClientError) -> TssError {
    match err {
        ClientError::Call(obj) => {
            // culprit responses list the offending nodes in `data`
            let culprits = obj
                .data()
                .and_then(|raw| serde_json::from_str::<Vec<String>>(raw.get()).ok())
                .unwrap_or_default();
            TssError::from_response(obj.code(), obj.message(), culprits)
        }
        ClientError::ParseError(e) => TssError::Decode(e.to_string()),
        other => TssError::Transport(other.to_string()),
    }
}
