mod common;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{Duration, TimeZone, Utc};
use common::{fingerprint_for, make_token, other_keypair, payload_json, sign_token, test_keypair};
use entitle_license::{LicenseTokenVerifier, REQUIRED_FIELDS, RejectReason, normalize};
use serde_json::json;

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn verifier() -> LicenseTokenVerifier {
    LicenseTokenVerifier::new(test_keypair().1)
}

fn valid_token() -> String {
    let (sk, _) = test_keypair();
    make_token(&sk, "alpha", "L1", now() - Duration::days(1), now() + Duration::days(30))
}

// ── Valid tokens ─────────────────────────────────────────────────

#[test]
fn verify_valid_token() {
    let fp = fingerprint_for("alpha");
    let payload = verifier().verify(&valid_token(), Some(&fp), now()).unwrap();
    assert_eq!(payload.license_id, "L1");
    assert_eq!(payload.fingerprint, fp);
    assert_eq!(payload.customer_id.as_deref(), Some("cust-1"));
    assert_eq!(payload.edition.as_deref(), Some("pro"));
    assert_eq!(payload.license_version, 2);
}

#[test]
fn verify_tolerates_pasted_noise() {
    let token = valid_token();
    let (payload, signature) = token.split_once('.').unwrap();
    let (head, tail) = payload.split_at(10);
    let noisy = format!("  {head}\u{200B}\n{tail}\u{3002}{signature}\t");

    let fp = fingerprint_for("alpha");
    assert!(verifier().verify(&noisy, Some(&fp), now()).is_ok());
}

#[test]
fn normalize_maps_dashes_and_stops() {
    assert_eq!(normalize("ab\u{2013}cd\u{FF0E}ef"), "ab-cd.ef");
    assert_eq!(normalize("a\u{2212}b\u{FF61}c"), "a-b.c");
    assert_eq!(normalize(" a b\u{FEFF}c "), "abc");
}

#[test]
fn optional_fields_default() {
    let (sk, _) = test_keypair();
    let fp = fingerprint_for("alpha");
    let payload = json!({
        "fingerprint": fp,
        "issued_at": now().timestamp() - 60,
        "expires_at": (now() + Duration::days(1)).timestamp(),
        "license_id": "L-min",
    });
    let token = sign_token(&sk, &payload.to_string());

    let decoded = verifier().verify(&token, Some(&fp), now()).unwrap();
    assert_eq!(decoded.customer_id, None);
    assert_eq!(decoded.edition, None);
    assert_eq!(decoded.license_version, 1);
    assert_eq!(decoded.issued_at, now() - Duration::seconds(60));
}

#[test]
fn numeric_customer_id_and_millisecond_timestamps() {
    let (sk, _) = test_keypair();
    let fp = fingerprint_for("alpha");
    let payload = json!({
        "fingerprint": fp,
        "issued_at": now().timestamp_millis(),
        "expires_at": (now() + Duration::days(1)).timestamp_millis(),
        "license_id": "L-ms",
        "customer_id": 42,
    });
    let token = sign_token(&sk, &payload.to_string());

    let decoded = verifier().decode(&token).unwrap();
    assert_eq!(decoded.customer_id.as_deref(), Some("42"));
    assert_eq!(decoded.issued_at, now());
}

// ── Malformed tokens ─────────────────────────────────────────────

#[test]
fn missing_separator_is_malformed() {
    let token = valid_token().replace('.', "");
    assert_eq!(verifier().decode(&token), Err(RejectReason::Malformed));
}

#[test]
fn duplicate_separator_is_malformed() {
    let token = format!("{}.x", valid_token());
    assert_eq!(verifier().decode(&token), Err(RejectReason::Malformed));
    assert_eq!(verifier().decode("a..b"), Err(RejectReason::Malformed));
}

#[test]
fn empty_segments_are_malformed() {
    let token = valid_token();
    let (payload, signature) = token.split_once('.').unwrap();
    assert_eq!(
        verifier().decode(&format!(".{signature}")),
        Err(RejectReason::Malformed)
    );
    assert_eq!(
        verifier().decode(&format!("{payload}.")),
        Err(RejectReason::Malformed)
    );
    assert_eq!(verifier().decode(""), Err(RejectReason::Malformed));
}

#[test]
fn non_alphabet_characters_are_malformed_not_bad_signature() {
    let token = valid_token();
    for bad in ['+', '/', '=', '$', 'é'] {
        let mut chars: Vec<char> = token.chars().collect();
        chars.insert(5, bad);
        let tampered: String = chars.into_iter().collect();
        assert_eq!(
            verifier().decode(&tampered),
            Err(RejectReason::Malformed),
            "character {bad:?}"
        );
    }
}

#[test]
fn oversized_payload_is_malformed() {
    let small = verifier().with_limits(16, Duration::hours(24));
    assert_eq!(small.decode(&valid_token()), Err(RejectReason::Malformed));
}

#[test]
fn short_signature_is_malformed() {
    let token = valid_token();
    let (payload, _) = token.split_once('.').unwrap();
    let short = URL_SAFE_NO_PAD.encode([1u8; 32]);
    assert_eq!(
        verifier().decode(&format!("{payload}.{short}")),
        Err(RejectReason::Malformed)
    );
}

#[test]
fn long_signature_is_malformed() {
    let token = valid_token();
    let (payload, _) = token.split_once('.').unwrap();
    let long = URL_SAFE_NO_PAD.encode([1u8; 96]);
    assert_eq!(
        verifier().decode(&format!("{payload}.{long}")),
        Err(RejectReason::Malformed)
    );
}

// ── Signatures ───────────────────────────────────────────────────

#[test]
fn tampered_payload_fails_signature() {
    let (sk, _) = test_keypair();
    let fp = fingerprint_for("alpha");
    let original = payload_json(&fp, "L1", now(), now() + Duration::days(1));
    let token = sign_token(&sk, &original);
    let (_, signature) = token.split_once('.').unwrap();

    let forged = original.replace("L1", "L2");
    let forged_token = format!("{}.{signature}", URL_SAFE_NO_PAD.encode(forged.as_bytes()));
    assert_eq!(
        verifier().decode(&forged_token),
        Err(RejectReason::BadSignature)
    );
}

#[test]
fn foreign_key_fails_signature() {
    let (sk, _) = other_keypair();
    let token = make_token(&sk, "alpha", "L1", now(), now() + Duration::days(1));
    assert_eq!(verifier().decode(&token), Err(RejectReason::BadSignature));
}

#[test]
fn zeroed_signature_fails() {
    let token = valid_token();
    let (payload, _) = token.split_once('.').unwrap();
    let zeros = URL_SAFE_NO_PAD.encode([0u8; 64]);
    assert_eq!(
        verifier().decode(&format!("{payload}.{zeros}")),
        Err(RejectReason::BadSignature)
    );
}

// ── Payload fields ───────────────────────────────────────────────

#[test]
fn each_required_field_is_reported() {
    let (sk, _) = test_keypair();
    let fp = fingerprint_for("alpha");
    let full: serde_json::Value =
        serde_json::from_str(&payload_json(&fp, "L1", now(), now() + Duration::days(1))).unwrap();

    for field in REQUIRED_FIELDS {
        let mut payload = full.clone();
        payload.as_object_mut().unwrap().remove(field);
        let token = sign_token(&sk, &payload.to_string());

        let err = verifier().decode(&token).unwrap_err();
        assert_eq!(err, RejectReason::MissingField(field));
        assert_eq!(err.code(), format!("missing_{field}"));
    }
}

#[test]
fn null_or_blank_required_field_is_missing() {
    let (sk, _) = test_keypair();
    let payload = json!({
        "fingerprint": "  ",
        "issued_at": now().to_rfc3339(),
        "expires_at": now().to_rfc3339(),
        "license_id": null,
    });
    let token = sign_token(&sk, &payload.to_string());
    assert_eq!(
        verifier().decode(&token),
        Err(RejectReason::MissingField("fingerprint"))
    );
}

#[test]
fn non_object_payload_is_invalid() {
    let (sk, _) = test_keypair();
    let token = sign_token(&sk, "[1,2,3]");
    assert_eq!(verifier().decode(&token), Err(RejectReason::InvalidPayload));
}

#[test]
fn bad_timestamp_is_invalid() {
    let (sk, _) = test_keypair();
    let payload = json!({
        "fingerprint": "abc",
        "issued_at": "yesterday",
        "expires_at": now().to_rfc3339(),
        "license_id": "L1",
    });
    let token = sign_token(&sk, &payload.to_string());
    assert_eq!(verifier().decode(&token), Err(RejectReason::InvalidPayload));
}

// ── Binding and time ─────────────────────────────────────────────

#[test]
fn token_for_other_machine_is_fingerprint_mismatch() {
    let other = fingerprint_for("beta");
    assert_eq!(
        verifier().verify(&valid_token(), Some(&other), now()),
        Err(RejectReason::FingerprintMismatch)
    );
}

#[test]
fn unknown_fingerprint_is_unavailable() {
    assert_eq!(
        verifier().verify(&valid_token(), None, now()),
        Err(RejectReason::FingerprintUnavailable)
    );
}

#[test]
fn issued_at_grace_window() {
    let (sk, _) = test_keypair();
    let fp = fingerprint_for("alpha");
    let expires = now() + Duration::days(30);

    let inside = make_token(&sk, "alpha", "L1", now() + Duration::hours(23), expires);
    assert!(verifier().verify(&inside, Some(&fp), now()).is_ok());

    let outside = make_token(&sk, "alpha", "L1", now() + Duration::hours(25), expires);
    assert_eq!(
        verifier().verify(&outside, Some(&fp), now()),
        Err(RejectReason::NotYetValid)
    );
}

#[test]
fn expiry_is_inclusive() {
    let (sk, _) = test_keypair();
    let fp = fingerprint_for("alpha");
    let token = make_token(&sk, "alpha", "L1", now() - Duration::days(10), now());

    assert!(verifier().verify(&token, Some(&fp), now()).is_ok());
    assert_eq!(
        verifier().verify(&token, Some(&fp), now() + Duration::seconds(1)),
        Err(RejectReason::Expired)
    );
}

#[test]
fn fingerprint_is_checked_before_time() {
    let (sk, _) = test_keypair();
    let token = make_token(&sk, "alpha", "L1", now() - Duration::days(10), now() - Duration::days(1));
    let other = fingerprint_for("beta");
    assert_eq!(
        verifier().verify(&token, Some(&other), now()),
        Err(RejectReason::FingerprintMismatch)
    );
}
