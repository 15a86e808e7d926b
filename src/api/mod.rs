pub mod client;
pub mod types;

pub use client::{PayoutClient, PayoutService};
pub use types::{WithdrawRequest, WithdrawResponse};
