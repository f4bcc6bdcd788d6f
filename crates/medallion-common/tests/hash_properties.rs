//! Property tests for the record content hash

use medallion_common::{content_hash, Record, Value};
use proptest::prelude::*;

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        (-1.0e6f64..1.0e6).prop_map(Value::Float),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::Text),
    ]
}

fn fields_strategy(min: usize) -> impl Strategy<Value = Vec<(String, Value)>> {
    prop::collection::btree_map("[a-z]{1,10}", value_strategy(), min..10)
        .prop_map(|fields| fields.into_iter().collect())
}

fn altered(value: &Value) -> Value {
    match value {
        Value::Null => Value::Int(0),
        Value::Bool(b) => Value::Bool(!b),
        Value::Int(i) => Value::Int(i.wrapping_add(1)),
        Value::Float(f) => Value::Float(f + 1.0),
        Value::Text(s) => Value::Text(format!("{}x", s)),
        other => Value::Text(format!("{:?}", other)),
    }
}

proptest! {
    #[test]
    fn hash_ignores_field_order(
        (fields, shuffled) in fields_strategy(0)
            .prop_flat_map(|f| (Just(f.clone()), Just(f).prop_shuffle()))
    ) {
        let original: Record = fields.into_iter().collect();
        let reordered: Record = shuffled.into_iter().collect();
        prop_assert_eq!(content_hash(&original), content_hash(&reordered));
    }

    #[test]
    fn hash_changes_with_any_value(
        (fields, index) in fields_strategy(1)
            .prop_flat_map(|f| { let len = f.len(); (Just(f), 0..len) })
    ) {
        let original: Record = fields.iter().cloned().collect();
        let mut changed = original.clone();
        let (name, value) = &fields[index];
        changed.insert(name.clone(), altered(value));

        prop_assert_ne!(content_hash(&original), content_hash(&changed));
    }

    #[test]
    fn hash_is_stable_across_calls(fields in fields_strategy(0)) {
        let record: Record = fields.into_iter().collect();
        prop_assert_eq!(content_hash(&record), content_hash(&record.clone()));
    }
}
