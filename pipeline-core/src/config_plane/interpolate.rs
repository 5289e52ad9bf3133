//! `${NAME}` environment-variable interpolation over parsed configuration
//! values, with a recursion-depth guard.
//!
//! `shellexpand` performs one pass of substitution but has no guarded
//! recursive variant, so a value like `FOO=${FOO}` (or a longer cycle
//! spread across several variables) would expand forever if this module
//! kept re-running it to a fixpoint unconditionally. Capping the number of
//! passes turns a would-be infinite loop into a rejected configuration.
//!
//! The lookup itself is injectable (`resolve: &dyn Fn(&str) -> Option<String>`)
//! so tests can exercise interpolation against a fixed map instead of the
//! process environment; [`interpolate_value`] is the production entry point,
//! resolving through [`std::env::var`].

use serde_json::Value;

use crate::config_plane::ConfigError;

/// Maximum number of substitution passes applied to a single string value
/// before giving up and reporting [`ConfigError::InterpolationDepthExceeded`].
const MAX_INTERPOLATION_DEPTH: u32 = 8;

/// Recursively interpolates every string leaf of a parsed JSON value against
/// the process environment. Arrays and objects are walked depth-first;
/// numbers, booleans, and null pass through unchanged.
pub fn interpolate_value(value: &Value) -> Result<Value, ConfigError> {
    interpolate_value_with(value, &|name| std::env::var(name).ok())
}

fn interpolate_value_with(value: &Value, resolve: &dyn Fn(&str) -> Option<String>) -> Result<Value, ConfigError> {
    match value {
        Value::String(text) => Ok(Value::String(interpolate_string(text, 0, resolve)?)),
        Value::Array(items) => Ok(Value::Array(
            items.iter().map(|item| interpolate_value_with(item, resolve)).collect::<Result<_, _>>()?,
        )),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, inner) in map {
                out.insert(key.clone(), interpolate_value_with(inner, resolve)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn interpolate_string(input: &str, depth: u32, resolve: &dyn Fn(&str) -> Option<String>) -> Result<String, ConfigError> {
    if !input.contains('$') {
        return Ok(input.to_owned());
    }
    if depth >= MAX_INTERPOLATION_DEPTH {
        return Err(ConfigError::interpolation_depth_exceeded(input.to_owned()));
    }

    let expanded = shellexpand::env_with_context_no_errors(input, |name| resolve(name));
    if expanded == input {
        // No further substitution happened this pass: either every
        // placeholder is now resolved (handled by the `contains('$')`
        // check above) or what remains is not valid `${NAME}` syntax (a
        // literal dollar sign). Either way, further passes would not help.
        return Ok(expanded.into_owned());
    }
    interpolate_string(&expanded, depth + 1, resolve)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |name| pairs.iter().find(|(key, _)| *key == name).map(|(_, value)| (*value).to_owned())
    }

    #[test]
    fn substitutes_a_known_environment_variable() {
        let input = Value::String("prefix-${HOST}-suffix".to_owned());
        let result = interpolate_value_with(&input, &resolver(&[("HOST", "resolved")])).expect("interpolation");
        assert_eq!(result, Value::String("prefix-resolved-suffix".to_owned()));
    }

    #[test]
    fn leaves_unresolvable_placeholders_blank_rather_than_erroring() {
        let input = Value::String("${UNSET}".to_owned());
        let result = interpolate_value_with(&input, &resolver(&[])).expect("interpolation");
        assert_eq!(result, Value::String(String::new()));
    }

    #[test]
    fn non_string_values_pass_through_unchanged() {
        let input = serde_json::json!({ "count": 3, "enabled": true, "tag": null });
        let result = interpolate_value_with(&input, &resolver(&[])).expect("interpolation");
        assert_eq!(result, input);
    }

    #[test]
    fn mutually_recursive_variables_are_rejected_by_the_recursion_guard() {
        // A resolves to "${B}" and B resolves back to "${A}": the expansion
        // toggles between the two forever and never reaches a fixpoint, so
        // only the depth guard stops it.
        let input = Value::String("${A}".to_owned());
        let result = interpolate_value_with(&input, &resolver(&[("A", "${B}"), ("B", "${A}")]));
        assert!(result.is_err());
    }

    #[test]
    fn nested_object_and_array_leaves_are_interpolated() {
        let input = serde_json::json!({ "list": ["${NESTED}"] });
        let result = interpolate_value_with(&input, &resolver(&[("NESTED", "nested-value")])).expect("interpolation");
        assert_eq!(result, serde_json::json!({ "list": ["nested-value"] }));
    }

    #[test]
    fn chained_variables_resolve_within_the_depth_guard() {
        let input = Value::String("${A}".to_owned());
        let result =
            interpolate_value_with(&input, &resolver(&[("A", "${B}"), ("B", "final")])).expect("interpolation");
        assert_eq!(result, Value::String("final".to_owned()));
    }
}
