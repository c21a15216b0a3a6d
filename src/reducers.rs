//! Channel reducers: how a new write combines with the prior channel value.
//!
//! The set is closed in v1: `replace` (default), `append` (list concat), and
//! `merge` (shallow key-wise map merge, last writer wins). Adding a reducer
//! requires compiler validation changes and a migration note for existing
//! workflows.

use thiserror::Error;

use crate::ast::ReducerKind;
use crate::value::Value;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReducerError {
    #[error("append on channel '{channel}' requires list values, got {got}")]
    AppendNonList { channel: String, got: &'static str },

    #[error("merge on channel '{channel}' requires map values, got {got}")]
    MergeNonMap { channel: String, got: &'static str },
}

/// Combine a new write with the prior value of a channel.
///
/// `prior` is None when the channel has never been written. Reducer
/// application is deterministic given a fixed input sequence.
pub fn apply(
    kind: ReducerKind,
    channel: &str,
    prior: Option<&Value>,
    write: Value,
) -> Result<Value, ReducerError> {
    match kind {
        ReducerKind::Replace => Ok(write),
        ReducerKind::Append => {
            let mut items = match prior {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::List(existing)) => existing.clone(),
                Some(other) => {
                    return Err(ReducerError::AppendNonList {
                        channel: channel.to_string(),
                        got: other.type_name(),
                    });
                }
            };
            match write {
                Value::List(new_items) => items.extend(new_items),
                other => {
                    return Err(ReducerError::AppendNonList {
                        channel: channel.to_string(),
                        got: other.type_name(),
                    });
                }
            }
            Ok(Value::List(items))
        }
        ReducerKind::Merge => {
            let mut entries = match prior {
                None | Some(Value::Null) => Default::default(),
                Some(Value::Map(existing)) => existing.clone(),
                Some(other) => {
                    return Err(ReducerError::MergeNonMap {
                        channel: channel.to_string(),
                        got: other.type_name(),
                    });
                }
            };
            match write {
                Value::Map(new_entries) => {
                    for (key, value) in new_entries {
                        entries.insert(key, value);
                    }
                }
                other => {
                    return Err(ReducerError::MergeNonMap {
                        channel: channel.to_string(),
                        got: other.type_name(),
                    });
                }
            }
            Ok(Value::Map(entries))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn list(values: &[i64]) -> Value {
        Value::List(values.iter().map(|v| Value::Int(*v)).collect())
    }

    fn map(entries: &[(&str, i64)]) -> Value {
        Value::Map(
            entries
                .iter()
                .map(|(key, value)| (key.to_string(), Value::Int(*value)))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[test]
    fn test_replace_is_idempotent() {
        let first = apply(ReducerKind::Replace, "c", None, Value::Int(1)).unwrap();
        let second = apply(ReducerKind::Replace, "c", Some(&first), Value::Int(1)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_append_preserves_order() {
        let first = apply(ReducerKind::Append, "c", None, list(&[1])).unwrap();
        let second = apply(ReducerKind::Append, "c", Some(&first), list(&[2, 3])).unwrap();
        assert_eq!(second, list(&[1, 2, 3]));
    }

    #[test]
    fn test_append_on_unset_channel() {
        let result = apply(ReducerKind::Append, "c", None, list(&[7])).unwrap();
        assert_eq!(result, list(&[7]));
    }

    #[test]
    fn test_append_rejects_non_list() {
        let err = apply(ReducerKind::Append, "c", None, Value::Int(1)).unwrap_err();
        assert_eq!(
            err,
            ReducerError::AppendNonList {
                channel: "c".to_string(),
                got: "int"
            }
        );
    }

    #[test]
    fn test_merge_last_writer_wins() {
        let first = apply(ReducerKind::Merge, "c", None, map(&[("a", 1), ("b", 2)])).unwrap();
        let second = apply(
            ReducerKind::Merge,
            "c",
            Some(&first),
            map(&[("b", 9), ("d", 4)]),
        )
        .unwrap();
        assert_eq!(second, map(&[("a", 1), ("b", 9), ("d", 4)]));
    }

    #[test]
    fn test_merge_rejects_non_map() {
        let err = apply(ReducerKind::Merge, "c", Some(&map(&[])), list(&[1])).unwrap_err();
        assert!(matches!(err, ReducerError::MergeNonMap { .. }));
    }
}
