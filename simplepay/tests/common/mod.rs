//! Shared fixtures for integration tests.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::{
    collections::VecDeque,
    sync::{Mutex, PoisonError},
};

use simplepay::{
    GatewayConfig, GatewayError, LegacySigner, ModernSigner, Result, SecretKey, Signer,
    transport::{OutboundRequest, Transport, TransportResponse},
};

/// Transport answering from a fixed script and recording every request.
#[derive(Debug, Default)]
pub struct Script {
    replies: Mutex<VecDeque<Result<TransportResponse>>>,
    sent: Mutex<Vec<OutboundRequest>>,
}

impl Script {
    pub fn new(replies: impl IntoIterator<Item = Result<TransportResponse>>) -> Self {
        Self { replies: Mutex::new(replies.into_iter().collect()), sent: Mutex::new(Vec::new()) }
    }

    pub fn sent(&self) -> Vec<OutboundRequest> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Transport for Script {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).push(request);
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Err(GatewayError::TransportFailure("script exhausted".into())))
    }
}

/// EUR and HUF merchants on the sandbox.
pub fn config() -> GatewayConfig {
    GatewayConfig::from_pairs([
        ("EUR_MERCHANT", "M1"),
        ("EUR_SECRET_KEY", "S1"),
        ("HUF_MERCHANT", "M2"),
        ("HUF_SECRET_KEY", "S2"),
        ("SANDBOX", "true"),
    ])
    .expect("fixture config is valid")
}

/// JSON reply signed with `key` in the `Signature` header.
pub fn signed_json(body: &str, key: &str) -> Result<TransportResponse> {
    let signature = ModernSigner.sign(&SecretKey::from(key), body.as_bytes())?;
    Ok(TransportResponse::ok(body).with_header("Signature", signature))
}

/// IOS answer for `status`, signed with `key`.
pub fn ios_answer(order_ref: &str, status: &str, key: &str) -> Result<TransportResponse> {
    let values = ["2024-03-01 10:00:00", "99001", order_ref, status, "CCVISAMC"];
    let hash = LegacySigner.sign_chain(&SecretKey::from(key), values)?;
    Ok(TransportResponse::ok(format!(
        "<?xml version=\"1.0\"?>\n<Order><ORDER_DATE>{}</ORDER_DATE><REFNO>{}</REFNO><REFNOEXT>{}</REFNOEXT>\
         <ORDER_STATUS>{}</ORDER_STATUS><PAYMETHOD>{}</PAYMETHOD><HASH>{hash}</HASH></Order>",
        values[0], values[1], values[2], values[3], values[4]
    )))
}
