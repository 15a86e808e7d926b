use super::types::*;
use anyhow::Context;
use reqwest::Url;
use std::future::Future;

/// Anything that can carry out a payout. The engine only talks to this trait.
pub trait PayoutService: Send + Sync + 'static {
    fn withdraw(&self, req: WithdrawRequest) -> impl Future<Output = anyhow::Result<WithdrawResponse>> + Send;
}

#[derive(Clone)]
pub struct PayoutClient {
    base: Url,
    http: reqwest::Client,
}

impl PayoutClient {
    pub fn new(base: String) -> anyhow::Result<Self> {
        let base = Url::parse(&base).with_context(|| format!("invalid payout API url {base}"))?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("dashminer/", env!("CARGO_PKG_VERSION")))
            .default_headers({
                let mut h = reqwest::header::HeaderMap::new();
                h.insert(reqwest::header::ACCEPT, reqwest::header::HeaderValue::from_static("application/json"));
                h
            })
            .build()?;
        Ok(Self { base, http })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }
}

impl PayoutService for PayoutClient {
    /// `POST /api/withdraw`. Error statuses still carry a JSON body with
    /// `success: false`, so the body is decoded regardless of status.
    async fn withdraw(&self, req: WithdrawRequest) -> anyhow::Result<WithdrawResponse> {
        let url = self.base.join("/api/withdraw")?;
        let resp = self.http.post(url).json(&req).send().await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<WithdrawResponse>(&body) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !status.is_success() => anyhow::bail!("withdraw failed: {} – {}", status, body),
            Err(e) => Err(e).context("malformed withdraw response"),
        }
    }
}
