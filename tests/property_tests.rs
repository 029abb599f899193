//! Property tests for signing and redaction invariants.

use a3s_audit::{IntegritySigner, RedactionConfig, Redactor, RetryConfig, RetryExecutor, SignerConfig};
use proptest::prelude::*;
use serde_json::{Map, Value};

fn signer() -> IntegritySigner {
    IntegritySigner::new("secret", SignerConfig::default()).unwrap()
}

// Strategy: arbitrary nested JSON
fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[ -~]{0,40}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::btree_map("[a-z_]{1,12}", inner, 0..6)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

// Strategy: property maps mixing sensitive keys and sensitive-looking values
fn arb_properties() -> impl Strategy<Value = Value> {
    let key = prop_oneof![
        Just("password".to_string()),
        Just("api_key".to_string()),
        Just("contact_email".to_string()),
        Just("note".to_string()),
        "[a-z_]{1,10}",
    ];
    let value = prop_oneof![
        arb_json(),
        Just(Value::from("reach me at jane.doe@example.org")),
        Just(Value::from("card 4111 1111 1111 1111 on file")),
        Just(Value::from("from 10.1.2.3 via (555) 123-4567")),
        Just(Value::from("10.0.0.1555 123 4567")),
        "[0-9 .()+-]{5,40}".prop_map(Value::String),
        "[A-Za-z0-9]{28,48}".prop_map(Value::String),
    ];
    prop::collection::vec((key, value), 0..8)
        .prop_map(|pairs| Value::Object(pairs.into_iter().collect::<Map<String, Value>>()))
}

fn reversed(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.reverse();
            Value::Object(entries.into_iter().map(|(k, v)| (k.clone(), reversed(v))).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(reversed).collect()),
        other => other.clone(),
    }
}

proptest! {
    /// Property: a freshly signed record always verifies
    #[test]
    fn proptest_sign_then_verify(
        event_type in "[a-z_]{1,20}",
        description in "[ -~]{0,60}",
        properties in arb_json(),
    ) {
        let signer = signer();
        let mut record = serde_json::json!({
            "type": event_type,
            "description": description,
            "properties": properties,
            "created_at": "2024-01-01T00:00:00Z",
        });
        let signature = signer.sign(&record).unwrap();
        record["signature"] = Value::String(signature);

        prop_assert!(signer.verify(&record));
    }

    /// Property: mutating a signed field invalidates the signature
    #[test]
    fn proptest_mutation_breaks_signature(
        description in "[ -~]{0,60}",
        suffix in "[ -~]{1,10}",
    ) {
        let signer = signer();
        let mut record = serde_json::json!({
            "type": "login",
            "description": description,
            "created_at": "2024-01-01T00:00:00Z",
        });
        let signature = signer.sign(&record).unwrap();
        record["signature"] = Value::String(signature);
        record["description"] = Value::String(format!("{}{}", description, suffix));

        prop_assert!(!signer.verify(&record));
    }

    /// Property: canonical form ignores key order at every depth
    #[test]
    fn proptest_key_order_independent(value in prop::collection::btree_map("[a-z]{1,8}", arb_json(), 1..8)) {
        let signer = signer();
        let forward = Value::Object(value.into_iter().collect());
        let backward = reversed(&forward);

        prop_assert_eq!(signer.canonicalize(&forward).unwrap(), signer.canonicalize(&backward).unwrap());
    }

    /// Property: redacting twice equals redacting once
    #[test]
    fn proptest_redaction_idempotent(properties in arb_properties()) {
        let redactor = Redactor::new(&RedactionConfig::default()).unwrap();
        let once = redactor.filter_value(&properties);
        let twice = redactor.filter_value(&once);

        prop_assert_eq!(once, twice);
    }

    /// Property: password values never survive redaction
    #[test]
    fn proptest_password_always_masked(secret in "[A-Za-z0-9]{5,30}") {
        let redactor = Redactor::new(&RedactionConfig::default()).unwrap();
        let out = redactor.filter_value(&serde_json::json!({ "password": secret.clone() }));

        prop_assert_ne!(out["password"].as_str(), Some(secret.as_str()));
    }

    /// Property: pre-jitter backoff is non-decreasing and capped
    #[test]
    fn proptest_backoff_monotone(
        base in 1u64..5_000,
        cap in 5_000u64..120_000,
        multiplier in 1.0f64..4.0,
    ) {
        let executor = RetryExecutor::new(RetryConfig {
            base_delay_ms: base,
            max_delay_ms: cap,
            multiplier,
            ..Default::default()
        });
        let mut previous = std::time::Duration::ZERO;
        for attempt in 1..=30 {
            let delay = executor.backoff_delay(attempt);
            prop_assert!(delay >= previous);
            prop_assert!(delay.as_millis() as u64 <= cap);
            previous = delay;
        }
    }
}
