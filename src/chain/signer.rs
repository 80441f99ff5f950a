use async_trait::async_trait;
use color_eyre::eyre::Result;
use tracing::{debug, instrument};
use url::Url;

use super::{BatchMint, ChainError, MintWallet, SubmitReceipt};
use crate::config::WalletConfig;

/// Hands batch mints to an external signing service
///
/// The service owns the collection owner's key, builds the message body from
/// the JSON layout of [`BatchMint`] and broadcasts it.
#[derive(Debug, Clone)]
pub struct RemoteSigner {
    http: reqwest::Client,
    endpoint: Url,
    token: Option<String>,
}

impl RemoteSigner {
    pub fn new(config: &WalletConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            http,
            endpoint: config.endpoint.join("v1/batch-mint")?,
            token: config.token(),
        })
    }
}

#[async_trait]
impl MintWallet for RemoteSigner {
    #[instrument(skip_all, fields(collection = %mint.collection, entries = mint.entries.len()))]
    async fn submit(&self, mint: &BatchMint) -> Result<SubmitReceipt, ChainError> {
        let mut req = self.http.post(self.endpoint.clone()).json(mint);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChainError::Status { status, body });
        }

        let receipt: SubmitReceipt = resp.json().await?;
        debug!(hash = ?receipt.message_hash, "submitted");
        Ok(receipt)
    }
}
