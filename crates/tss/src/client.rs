//! Threshold signature coordinator
//!
//! Round-trips requests to the signer cluster and checks returned signatures against
//! the cluster key from keygen. Nothing here retries; `TssError::classify` tells the
//! caller whether to retry or escalate.

use crate::error::{Result, TssError};
use crate::types::{
    AskResponse, KeygenRequest, KeygenResponse, Method, SignResponse, SignStateRequest,
    SignatureData, SlashRequest, KEYGEN_METHOD,
};
use async_trait::async_trait;
use k256::ecdsa::VerifyingKey;
use l2_consensus::types::Hash;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Request/response channel to the signer cluster
#[async_trait]
pub trait SignerTransport: Send + Sync {
    async fn call(&self, method: Method, params: Value) -> Result<Value>;

    /// Keygen ceremony, served by the manager next to the signing methods
    async fn keygen(&self, params: Value) -> Result<Value>;
}

pub struct ThresholdSignatureCoordinator<T> {
    transport: T,
    cluster_key: RwLock<Option<VerifyingKey>>,
}

impl<T: SignerTransport> ThresholdSignatureCoordinator<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            cluster_key: RwLock::new(None),
        }
    }

    /// Start with a cluster key from an earlier keygen
    pub fn with_cluster_key(transport: T, cluster_public_key: &str) -> Result<Self> {
        let coordinator = Self::new(transport);
        *coordinator.cluster_key.write() = Some(parse_cluster_key(cluster_public_key)?);
        Ok(coordinator)
    }

    pub fn cluster_key(&self) -> Option<VerifyingKey> {
        self.cluster_key.read().clone()
    }

    async fn request<P, R>(&self, method: Method, params: &P) -> Result<R>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        tracing::debug!(method = %method, "Signer cluster request");
        let response = self.transport.call(method, params).await.map_err(|e| {
            if e.is_culprit() {
                tracing::warn!(method = %method, "Signer cluster reported culprit: {}", e);
            }
            e
        })?;
        Ok(serde_json::from_value(response)?)
    }

    /// Whether the cluster agrees to sign this batch
    pub async fn ask_state_batch(&self, req: &SignStateRequest) -> Result<bool> {
        let resp: AskResponse = self.request(Method::AskStateBatch, req).await?;
        Ok(resp.result)
    }

    /// Aggregated signature over the batch digest
    pub async fn sign_state_batch(&self, req: &SignStateRequest) -> Result<SignResponse> {
        let resp: SignResponse = self.request(Method::SignStateBatch, req).await?;
        self.verify(&req.digest(), &resp.signature)?;

        tracing::info!(
            start_block = req.start_block,
            roots = req.state_roots.len(),
            "State batch signed by cluster"
        );
        Ok(resp)
    }

    pub async fn ask_slash(&self, req: &SlashRequest) -> Result<bool> {
        let resp: AskResponse = self.request(Method::AskSlash, req).await?;
        Ok(resp.result)
    }

    /// Penalty transaction for `req.address`, when the cluster grants the slash
    pub async fn sign_slash(&self, req: &SlashRequest) -> Result<SignResponse> {
        let resp: SignResponse = self.request(Method::SignSlash, req).await?;
        tracing::info!(
            address = %req.address,
            batch_index = req.batch_index,
            granted = resp.has_slash_tx(),
            "Slash signing finished"
        );
        Ok(resp)
    }

    /// Run the keygen ceremony and keep the resulting cluster key
    pub async fn keygen(&self, req: &KeygenRequest) -> Result<KeygenResponse> {
        let params = serde_json::to_value(req)?;
        tracing::debug!(method = KEYGEN_METHOD, "Signer cluster request");
        let resp: KeygenResponse = serde_json::from_value(self.transport.keygen(params).await?)?;
        let key = parse_cluster_key(&resp.cluster_public_key)?;
        *self.cluster_key.write() = Some(key);

        tracing::info!(
            nodes = req.nodes.len(),
            threshold = req.threshold,
            "Cluster key generated: {}",
            resp.cluster_public_key
        );
        Ok(resp)
    }

    /// Check a 65-byte `r || s || v` signature against the cluster key
    pub fn verify(&self, digest: &Hash, signature: &[u8]) -> Result<()> {
        let Some(expected) = self.cluster_key() else {
            tracing::debug!("No cluster key yet, skipping signature check");
            return Ok(());
        };

        let data = SignatureData::from_signature(signature, digest).ok_or_else(|| {
            TssError::InvalidSignature(format!("expected 65 bytes, got {}", signature.len()))
        })?;
        let recovered = data.recover_key()?;

        if recovered != expected {
            return Err(TssError::InvalidSignature(
                "signature is not from the cluster key".into(),
            ));
        }
        Ok(())
    }
}

fn parse_cluster_key(hex_key: &str) -> Result<VerifyingKey> {
    let raw = hex_key.strip_prefix("0x").unwrap_or(hex_key);
    let bytes = hex::decode(raw).map_err(|e| TssError::Decode(e.to_string()))?;
    VerifyingKey::from_sec1_bytes(&bytes).map_err(|e| TssError::Decode(e.to_string()))
}
