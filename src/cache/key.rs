use serde_json::Value;

/// Builds the hashed half of a cache key from request arguments.
///
/// Two logically identical requests must land on one entry, so the
/// argument document is canonicalized before hashing: object keys are
/// emitted in sorted order (serde_json's map already guarantees this),
/// and homogeneous scalar arrays — gene id lists, tier sets, source
/// sets, none of which are order-sensitive anywhere in the API — are
/// sorted as well.
pub fn hashed_key(args: &impl serde::Serialize) -> String {
    let value = serde_json::to_value(args).unwrap_or(Value::Null);
    let canonical = canonicalize(value);
    let encoded = serde_json::to_string(&canonical).unwrap_or_default();
    format!("{:x}", md5::compute(encoded.as_bytes()))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Array(items) => {
            let mut items: Vec<Value> = items.into_iter().map(canonicalize).collect();
            if items.iter().all(is_scalar) {
                items.sort_by(|a, b| scalar_sort_key(a).cmp(&scalar_sort_key(b)));
            }
            Value::Array(items)
        }
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, canonicalize(value)))
                .collect(),
        ),
        scalar => scalar,
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}

fn scalar_sort_key(value: &Value) -> (u8, String) {
    match value {
        Value::Null => (0, String::new()),
        Value::Bool(b) => (1, b.to_string()),
        // Zero-pad so numeric order survives the string comparison.
        Value::Number(n) => (2, format!("{:0>24}", n.to_string())),
        Value::String(s) => (3, s.clone()),
        _ => (4, String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::hashed_key;
    use serde::Serialize;

    #[derive(Serialize)]
    struct BuildArgs {
        gene_ids: Vec<i64>,
        min_string_score: u32,
    }

    #[test]
    fn permuted_id_lists_share_one_key() {
        let a = hashed_key(&BuildArgs {
            gene_ids: vec![1, 3, 4, 5, 7],
            min_string_score: 400,
        });
        let b = hashed_key(&BuildArgs {
            gene_ids: vec![7, 5, 4, 3, 1],
            min_string_score: 400,
        });
        assert_eq!(a, b);
    }

    #[test]
    fn differing_thresholds_produce_distinct_keys() {
        let a = hashed_key(&BuildArgs {
            gene_ids: vec![1, 2],
            min_string_score: 400,
        });
        let b = hashed_key(&BuildArgs {
            gene_ids: vec![1, 2],
            min_string_score: 700,
        });
        assert_ne!(a, b);
    }

    #[test]
    fn numeric_sort_is_by_value_not_lexicographic() {
        let a = hashed_key(&vec![2, 10, 1]);
        let b = hashed_key(&vec![1, 2, 10]);
        assert_eq!(a, b);
    }

    #[test]
    fn map_key_order_is_irrelevant() {
        let a = hashed_key(&serde_json::json!({"b": 1, "a": 2}));
        let b = hashed_key(&serde_json::json!({"a": 2, "b": 1}));
        assert_eq!(a, b);
    }
}
