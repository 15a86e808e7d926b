use serde::{Deserialize, Serialize};

/// Body of `POST /api/withdraw`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawRequest {
    pub recipient_address: String,
    #[serde(rename = "amountSOL")]
    pub amount_sol: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawResponse {
    pub success: bool,
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}
