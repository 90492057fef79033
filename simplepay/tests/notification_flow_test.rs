//! Integration tests for IPN validation and confirmation.

mod common;

use chrono::{TimeZone, Utc};
use common::config;
use serde_json::Value;
use simplepay::{
    LegacySigner, ModernSigner, RequestContext, SecretKey, Signer,
    log::MemoryLogger,
    notification::{BufferedResponse, NotificationValidator},
};

fn received_at() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 15, 0).unwrap()
}

#[test]
fn test_modern_ipn_confirmed_once() {
    let validator = NotificationValidator::new(&config(), MemoryLogger::new());
    let body = r#"{"salt":"x","orderRef":"101","method":"CARD","merchant":"M1","finishDate":"2024-03-01T10:14:00+01:00","paymentDate":"2024-03-01T10:13:00+01:00","transactionId":500,"status":"FINISHED"}"#;
    let signature = ModernSigner.sign(&SecretKey::from("S1"), body.as_bytes()).unwrap();
    let ctx = RequestContext::from_body(body).with_header("signature", signature).with_received_at(received_at());

    let outcome = validator.validate_ipn(&ctx).unwrap();
    assert!(outcome.valid);
    assert_eq!(outcome.transaction_id(), "500");

    let mut response = BufferedResponse::default();
    assert!(validator.confirm_ipn(&outcome, &mut response));
    assert_eq!(response.writes, 1);

    let echoed: Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(echoed["receiveDate"], "2024-03-01T09:15:00+00:00");
    assert_eq!(echoed["status"], "FINISHED");

    let header = response.headers.iter().find(|(k, _)| k == "Signature").map(|(_, v)| v.as_str()).unwrap();
    assert!(ModernSigner.verify(&SecretKey::from("S1"), response.body.as_bytes(), header).unwrap().valid);
}

#[test]
fn test_modern_ipn_tampered_not_confirmed() {
    let validator = NotificationValidator::new(&config(), MemoryLogger::new());
    let body = r#"{"merchant":"M1","orderRef":"101","status":"FINISHED"}"#;
    let signature = ModernSigner.sign(&SecretKey::from("S1"), body.as_bytes()).unwrap();
    let ctx = RequestContext::from_body(body.replace("FINISHED", "REFUND")).with_header("Signature", signature);

    let outcome = validator.validate_ipn(&ctx).unwrap();
    assert!(!outcome.valid);

    let mut response = BufferedResponse::default();
    assert!(!validator.confirm_ipn(&outcome, &mut response));
    assert_eq!(response, BufferedResponse::default());
}

#[test]
fn test_legacy_ipn_confirmed() {
    let validator = NotificationValidator::new(&config(), MemoryLogger::new());
    let posted = [
        ("SALEDATE", "2024-03-01 09:14:00"),
        ("REFNO", "99001"),
        ("REFNOEXT", "101"),
        ("ORDERSTATUS", "COMPLETE"),
        ("PAYMETHOD", "Visa/MasterCard/Eurocard"),
        ("IPN_PID[]", "1"),
        ("IPN_PID[]", "2"),
        ("IPN_PNAME[]", "Lamp"),
        ("IPN_PNAME[]", "Bulb"),
        ("IPN_DATE", "20240301091500"),
        ("CURRENCY", "HUF"),
    ];
    let values: Vec<&str> = posted.iter().map(|(_, v)| *v).collect();
    let hash = LegacySigner.sign_chain(&SecretKey::from("S2"), &values).unwrap();
    let mut form = posted.to_vec();
    form.push(("HASH", hash.as_str()));
    let ctx = RequestContext::from_body(Vec::new()).with_form(form).with_received_at(received_at());

    let outcome = validator.validate_legacy_ipn(&ctx, None).unwrap();
    assert!(outcome.hash_valid);
    assert!(outcome.valid);

    let confirm_hash = LegacySigner
        .sign_chain(&SecretKey::from("S2"), ["1", "Lamp", "20240301091500", "20240301091500"])
        .unwrap();
    let mut response = BufferedResponse::default();
    assert!(validator.confirm_legacy_ipn(&outcome, &mut response));
    assert_eq!(response.body, format!("<EPAYMENT>20240301091500|{confirm_hash}</EPAYMENT>"));
}

#[test]
fn test_legacy_ipn_waiting_payment_not_confirmed() {
    let validator = NotificationValidator::new(&config(), MemoryLogger::new());
    let posted = [("REFNOEXT", "101"), ("ORDERSTATUS", "WAITING_PAYMENT"), ("IPN_DATE", "20240301091500")];
    let values: Vec<&str> = posted.iter().map(|(_, v)| *v).collect();
    let hash = LegacySigner.sign_chain(&SecretKey::from("S2"), &values).unwrap();
    let mut form = posted.to_vec();
    form.push(("HASH", hash.as_str()));
    let ctx = RequestContext::from_body(Vec::new()).with_form(form);

    let outcome = validator.validate_legacy_ipn(&ctx, Some("HUF")).unwrap();
    assert!(outcome.hash_valid);
    assert!(!outcome.valid);
    assert!(outcome.confirmation.is_none());
}
