use entitle_crypto::CryptoError;
use entitle_license::{LicenseError, RejectReason};

#[test]
fn reject_codes_are_stable() {
    let cases = [
        (RejectReason::Malformed, "malformed"),
        (RejectReason::BadSignature, "bad_signature"),
        (RejectReason::MissingField("license_id"), "missing_license_id"),
        (RejectReason::InvalidPayload, "invalid_payload"),
        (RejectReason::FingerprintMismatch, "fingerprint_mismatch"),
        (RejectReason::FingerprintUnavailable, "fingerprint_unavailable"),
        (RejectReason::NotYetValid, "not_yet_valid"),
        (RejectReason::Expired, "expired"),
        (RejectReason::LicenseConsumed, "license_consumed"),
        (RejectReason::RateLimited, "rate_limited"),
        (RejectReason::StorageFailed, "storage_failed"),
        (RejectReason::TamperHmac, "tamper_hmac"),
        (RejectReason::ClockRollback, "clock_rollback"),
    ];
    for (reason, code) in cases {
        assert_eq!(reason.code(), code);
    }
}

#[test]
fn reject_reason_serializes_as_code() {
    let json = serde_json::to_string(&RejectReason::MissingField("fingerprint")).unwrap();
    assert_eq!(json, "\"missing_fingerprint\"");

    let json = serde_json::to_string(&Some(RejectReason::ClockRollback)).unwrap();
    assert_eq!(json, "\"clock_rollback\"");
}

#[test]
fn reject_reason_display() {
    assert_eq!(
        RejectReason::MissingField("expires_at").to_string(),
        "license payload is missing `expires_at`"
    );
    assert_eq!(RejectReason::Expired.to_string(), "license has expired");
}

#[test]
fn license_error_display() {
    let err = LicenseError::Storage("disk full".to_string());
    assert_eq!(err.to_string(), "storage error: disk full");

    let err = LicenseError::InvalidPublicKey {
        source_name: "inline".to_string(),
        reason: "bad length".to_string(),
    };
    assert_eq!(err.to_string(), "invalid public key from inline: bad length");

    assert_eq!(
        LicenseError::SupportToolsDisabled.to_string(),
        "support tools are disabled"
    );
}

#[test]
fn crypto_errors_convert() {
    let err: LicenseError = CryptoError::Decryption("tag mismatch".to_string()).into();
    assert!(matches!(err, LicenseError::Crypto(_)));
    assert!(err.to_string().starts_with("crypto error:"));
}

#[test]
fn serde_errors_convert() {
    let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err: LicenseError = parse.into();
    assert!(matches!(err, LicenseError::Serialization(_)));
}
