// tests/serialization_props.rs
// Property test: any serializable document survives the line round trip.

use proptest::prelude::*;

use featherbase_core::{deserialize, serialize, Value};

fn json_leaf() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        Just(serde_json::Value::Null),
        any::<bool>().prop_map(serde_json::Value::from),
        (-1_000_000i64..1_000_000i64).prop_map(serde_json::Value::from),
        (-1.0e9f64..1.0e9f64).prop_map(serde_json::Value::from),
        "[a-zA-Z0-9 _-]{0,12}".prop_map(serde_json::Value::from),
        // The date escape: decoded to a date value, re-encoded identically.
        (0i64..4_102_444_800_000i64).prop_map(|ms| serde_json::json!({ "$$date": ms })),
    ]
}

fn json_tree() -> impl Strategy<Value = serde_json::Value> {
    json_leaf().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
        ]
    })
}

proptest! {
    #[test]
    fn serialized_documents_roundtrip(
        fields in prop::collection::btree_map("[a-z]{1,8}", json_tree(), 0..5)
    ) {
        let json = serde_json::Value::Object(fields.into_iter().collect());
        let doc = Value::from_json(&json);
        let line = serialize(&doc);
        prop_assert!(!line.contains('\n'));
        prop_assert_eq!(deserialize(&line).unwrap(), doc);
    }
}
