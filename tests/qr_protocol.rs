use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::NaiveDate;

use courtbook::{
    error::BookingError,
    qr::{decode, encode, QrError, QrToken},
};

fn token() -> QrToken {
    let issued_at = NaiveDate::from_ymd_opt(2024, 6, 3)
        .and_then(|d| d.and_hms_opt(8, 15, 0))
        .expect("datetime");
    QrToken::new(42, issued_at)
}

#[test]
fn issued_token_is_versioned_and_decodes() {
    let raw = encode(&token()).expect("encode");
    assert!(raw.starts_with("v1."));
    assert!(raw.chars().all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c)));
    assert_eq!(decode(&raw).expect("decode"), token());
    assert_eq!(decode(&format!("  {raw}\n")).expect("trimmed"), token());
}

#[test]
fn malformed_payloads_have_distinct_errors() {
    assert_eq!(decode(""), Err(QrError::Empty));
    assert_eq!(decode("   "), Err(QrError::Empty));
    assert_eq!(decode(&"v1.".repeat(400)), Err(QrError::TooLong));
    assert_eq!(decode("no-version"), Err(QrError::UnsupportedVersion(String::new())));
    assert_eq!(decode("v2.abc"), Err(QrError::UnsupportedVersion("v2".to_string())));
    assert_eq!(decode("v1.***"), Err(QrError::InvalidEncoding));

    let not_a_token = format!("v1.{}", URL_SAFE_NO_PAD.encode(br#"{"hello":1}"#));
    assert!(matches!(decode(&not_a_token), Err(QrError::InvalidPayload(_))));
}

#[test]
fn decode_errors_are_not_verification_errors() {
    let err: BookingError = decode("garbage").expect_err("invalid").into();
    assert!(matches!(err, BookingError::InvalidQr(_)));
    assert!(err.conflict().is_none());
}
