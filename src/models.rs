//! Wire types for the HTTP surface.

use serde::{Deserialize, Serialize};

use crate::engine::store::Bid;

/// Form body of `POST /bid`.
#[derive(Debug, Clone, Deserialize)]
pub struct BidForm {
    pub client: u32,
    pub price: u32,
}

/// Form body of `POST /system/boot`. Times are `YYYY-MM-DD HH:MM:SS` wall
/// clock; missing fields fall back to defaults or environment values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootForm {
    pub start_time: Option<String>,
    pub half_time: Option<String>,
    pub end_time: Option<String>,
    pub capacity: Option<u32>,
    pub warning_price: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BidResponse {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<Bid>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusResponse {
    pub code: u16,
    pub message: String,
    pub info: StatusInfo,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusInfo {
    pub start_time: String,
    pub half_time: String,
    pub end_time: String,
    pub capacity: u32,
    pub warning_price: u32,

    pub time: String,
    pub session: u8,
    pub bidders: u32,
    pub lowest_price: u32,
    pub lowest_time: String,
}
