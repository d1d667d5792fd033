use std::env;

pub const RUNTIME_CHECKS_VAR: &str = "CAF_RUNTIME_CHECKS";
pub const FATAL_EXIT_CODE_VAR: &str = "CAF_FATAL_EXIT_CODE";

/// Runtime settings, read once when the runtime is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Reject image indices other than 1 instead of ignoring them.
    pub runtime_checks: bool,
    /// Process exit code after a fatal error with no status to report to.
    pub fatal_exit_code: i32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_checks: false,
            fatal_exit_code: 1,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or unparsable values
    /// keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let runtime_checks = lookup(RUNTIME_CHECKS_VAR)
            .and_then(|value| parse_flag(&value))
            .unwrap_or(defaults.runtime_checks);
        let fatal_exit_code = lookup(FATAL_EXIT_CODE_VAR)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(defaults.fatal_exit_code);
        Self {
            runtime_checks,
            fatal_exit_code,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(RuntimeConfig::from_lookup(lookup(&[])), RuntimeConfig::default());
    }

    #[test]
    fn reads_flags_and_exit_code() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (RUNTIME_CHECKS_VAR, "Yes"),
            (FATAL_EXIT_CODE_VAR, " 3 "),
        ]));
        assert!(config.runtime_checks);
        assert_eq!(config.fatal_exit_code, 3);
    }

    #[test]
    fn garbage_keeps_defaults() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (RUNTIME_CHECKS_VAR, "maybe"),
            (FATAL_EXIT_CODE_VAR, "x"),
        ]));
        assert_eq!(config, RuntimeConfig::default());
    }
}
