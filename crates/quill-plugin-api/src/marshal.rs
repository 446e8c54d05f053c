//! Value marshalling at the bridge boundary.
//!
//! The bridge accepts a deliberately small value surface: null, bool,
//! int, float, string, lists of those, and handles. Maps never cross the
//! boundary, and nesting is capped. Violations are
//! [`RuntimeError::MarshalError`], which is a recoverable per-call error
//! and never counts as an extension fault.

use quill_runtime::{HandleRef, RuntimeError, RuntimeResult, Value};

/// Maximum nesting depth for lists crossing the bridge.
pub const MAX_BRIDGE_DEPTH: usize = 16;

/// Check that a single value may cross the bridge.
pub fn check_bridge_value(value: &Value) -> RuntimeResult<()> {
    check_depth(value, 0)
}

/// Check every argument of a bridge call.
pub fn check_args(args: &[Value]) -> RuntimeResult<()> {
    for arg in args {
        check_bridge_value(arg)?;
    }
    Ok(())
}

fn check_depth(value: &Value, depth: usize) -> RuntimeResult<()> {
    if depth > MAX_BRIDGE_DEPTH {
        return Err(RuntimeError::MarshalError(format!(
            "value nesting exceeds depth {MAX_BRIDGE_DEPTH}"
        )));
    }
    match value {
        Value::Null
        | Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::Str(_)
        | Value::Handle(_) => Ok(()),
        Value::List(items) => {
            for item in items {
                check_depth(item, depth + 1)?;
            }
            Ok(())
        }
        Value::Map(_) => Err(RuntimeError::MarshalError(
            "maps cannot cross the bridge boundary".to_string(),
        )),
    }
}

/// Require an exact argument count for a bridge operation.
pub fn expect_arity(operation: &str, args: &[Value], count: usize) -> RuntimeResult<()> {
    if args.len() != count {
        return Err(RuntimeError::MarshalError(format!(
            "{operation} takes {count} argument(s), got {}",
            args.len()
        )));
    }
    Ok(())
}

/// Extract a string argument.
pub fn expect_str(operation: &str, value: Value) -> RuntimeResult<String> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(type_error(operation, "string", &other)),
    }
}

/// Extract an integer argument.
pub fn expect_int(operation: &str, value: Value) -> RuntimeResult<i64> {
    match value {
        Value::Int(i) => Ok(i),
        other => Err(type_error(operation, "int", &other)),
    }
}

/// Extract a handle argument.
pub fn expect_handle(operation: &str, value: Value) -> RuntimeResult<HandleRef> {
    match value {
        Value::Handle(h) => Ok(h),
        other => Err(type_error(operation, "handle", &other)),
    }
}

fn type_error(operation: &str, expected: &str, got: &Value) -> RuntimeError {
    RuntimeError::MarshalError(format!(
        "{operation} expected a {expected} argument, got {}",
        got.type_name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_runtime::HandleKind;

    #[test]
    fn test_scalars_pass() {
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Int(3),
            Value::Float(2.5),
            Value::Str("x".to_string()),
            Value::Handle(HandleRef {
                kind: HandleKind::Chapter,
                index: 0,
                generation: 1,
            }),
        ] {
            assert!(check_bridge_value(&value).is_ok());
        }
    }

    #[test]
    fn test_map_rejected() {
        let value = Value::Map(vec![("k".to_string(), Value::Int(1))]);
        assert!(matches!(
            check_bridge_value(&value),
            Err(RuntimeError::MarshalError(_))
        ));
    }

    #[test]
    fn test_map_inside_list_rejected() {
        let value = Value::List(vec![Value::Map(vec![])]);
        assert!(check_bridge_value(&value).is_err());
    }

    #[test]
    fn test_deep_nesting_rejected() {
        let mut value = Value::Int(0);
        for _ in 0..MAX_BRIDGE_DEPTH + 2 {
            value = Value::List(vec![value]);
        }
        assert!(check_bridge_value(&value).is_err());
    }

    #[test]
    fn test_extractors() {
        assert_eq!(expect_str("op", Value::Str("a".to_string())).unwrap(), "a");
        assert_eq!(expect_int("op", Value::Int(4)).unwrap(), 4);
        assert!(expect_int("op", Value::Str("4".to_string())).is_err());
        assert!(expect_arity("op", &[Value::Null], 1).is_ok());
        assert!(expect_arity("op", &[], 1).is_err());
    }
}
