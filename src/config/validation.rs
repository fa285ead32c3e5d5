//! Config validation: unknown-key detection with "did you mean" suggestions
//! and range checks.
//!
//! The raw TOML is walked first so typos surface as warnings instead of being
//! silently ignored by `#[serde(default)]`. Range checks run on the parsed
//! config and split into hard errors and warnings.

use std::collections::HashSet;

use super::{AgentConfig, DriverConfig};

/// A non-fatal config warning.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (did you mean '{s}'?)")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Every valid dotted key path of [`AgentConfig`].
///
/// Kept by hand in step with the structs in `agent_config.rs`.
pub fn known_config_keys() -> HashSet<&'static str> {
    [
        // [server]
        "server",
        "server.host",
        "server.port",
        "server.tls",
        // [location]
        "location",
        "location.decimate",
        "location.orientation",
        "location.require_gps_time",
        "location.fix_change_events",
        "location.format",
        "location.driver",
        "location.driver.tcp",
        "location.driver.tcp.host",
        "location.driver.tcp.port",
        "location.driver.serial",
        "location.driver.serial.port",
        "location.driver.serial.baud",
        "location.driver.file",
        "location.driver.file.path",
        // [queue]
        "queue",
        "queue.dir",
        "queue.state_max_depth",
        "queue.event_max_depth",
        "queue.overflow",
        "queue.retain_acked",
        // [uplink]
        "uplink",
        "uplink.state_window",
        "uplink.event_window",
        "uplink.retry_backoff_secs",
        "uplink.batch_wait_ms",
        "uplink.connect_timeout_secs",
        "uplink.stop_timeout_secs",
        "uplink.backlog_report_secs",
    ]
    .into_iter()
    .collect()
}

// ============================================================================
// TOML Key Walking
// ============================================================================

/// Collect the dotted path of every key in a TOML tree.
///
/// `{ a = { b = 1 } }` yields `["a", "a.b"]`.
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let Some(table) = value.as_table() else {
        return Vec::new();
    };

    let mut keys = Vec::new();
    for (k, v) in table {
        let path = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{prefix}.{k}")
        };
        if v.is_table() {
            keys.extend(walk_toml_keys(v, &path));
        }
        keys.push(path);
    }
    keys
}

/// Levenshtein edit distance.
fn edit_distance(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != *cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(substitution);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_chars.len()]
}

/// Closest known key within edit distance 3.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    known
        .iter()
        .map(|k| (*k, edit_distance(unknown, k)))
        .filter(|(_, dist)| *dist <= 3)
        .min_by(|(ka, da), (kb, db)| da.cmp(db).then_with(|| ka.cmp(kb)))
        .map(|(k, _)| k.to_string())
}

/// Warn about keys the agent does not understand. Never fails.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    // Syntax errors are reported by the serde pass
    let Ok(value) = raw_toml.parse::<toml::Value>() else {
        return Vec::new();
    };

    let known = known_config_keys();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key.as_str()))
        .map(|key| ValidationWarning {
            suggestion: suggest_correction(&key, &known),
            message: format!("Unknown config key '{key}'"),
            field: key,
        })
        .collect()
}

// ============================================================================
// Range Validation
// ============================================================================

/// Check value ranges on a parsed config.
///
/// Returns (errors, warnings); errors prevent startup.
pub fn validate_ranges(config: &AgentConfig) -> (Vec<String>, Vec<ValidationWarning>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if config.server.host.trim().is_empty() {
        errors.push("server.host must not be empty".to_string());
    }
    if config.server.port == 0 {
        errors.push("server.port must be > 0".to_string());
    }

    if config.location.decimate == 0 {
        errors.push("location.decimate must be >= 1".to_string());
    }
    if let Some(DriverConfig::Serial { baud: 0, .. }) = &config.location.driver {
        errors.push("location.driver.serial.baud must be > 0".to_string());
    }
    if config.location.driver.is_none() {
        errors.push(
            "no location driver configured; set exactly one of \
             [location.driver.tcp], [location.driver.serial], [location.driver.file] \
             or location.driver = \"stdin\""
                .to_string(),
        );
    }

    let uplink = &config.uplink;
    if uplink.state_window == 0 {
        errors.push("uplink.state_window must be >= 1".to_string());
    }
    if uplink.event_window == 0 {
        errors.push("uplink.event_window must be >= 1".to_string());
    }
    if uplink.batch_wait_ms == 0 {
        errors.push("uplink.batch_wait_ms must be > 0".to_string());
    }

    let queue = &config.queue;
    for (field, max_depth, window) in [
        ("queue.state_max_depth", queue.state_max_depth, uplink.state_window),
        ("queue.event_max_depth", queue.event_max_depth, uplink.event_window),
    ] {
        if max_depth > 0 && max_depth < window {
            warnings.push(ValidationWarning {
                field: field.to_string(),
                message: format!(
                    "{field} = {max_depth} is smaller than its uplink window ({window}); \
                     batches will never fill"
                ),
                suggestion: None,
            });
        }
    }

    if uplink.retry_backoff_secs == 0 {
        warnings.push(ValidationWarning {
            field: "uplink.retry_backoff_secs".to_string(),
            message: "uplink.retry_backoff_secs = 0 retries a failing server in a tight loop"
                .to_string(),
            suggestion: None,
        });
    }

    (errors, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("decimate", "decimate"), 0);
        assert_eq!(edit_distance("decimat", "decimate"), 1);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("abc", ""), 3);
    }

    #[test]
    fn test_walk_nested_driver_keys() {
        let value: toml::Value = r#"
            [location.driver.tcp]
            host = "10.0.0.5"
            port = 55555
        "#
        .parse()
        .unwrap();
        let keys = walk_toml_keys(&value, "");
        for expected in [
            "location",
            "location.driver",
            "location.driver.tcp",
            "location.driver.tcp.host",
            "location.driver.tcp.port",
        ] {
            assert!(keys.iter().any(|k| k == expected), "missing {expected}");
        }
    }

    #[test]
    fn test_unknown_key_suggestion() {
        let warnings = validate_unknown_keys(
            r#"
            [uplink]
            state_windw = 20
            "#,
        );
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "uplink.state_windw");
        assert_eq!(warnings[0].suggestion.as_deref(), Some("uplink.state_window"));
    }

    #[test]
    fn test_known_keys_produce_no_warnings() {
        let warnings = validate_unknown_keys(
            r#"
            [server]
            host = "uplink.example.com"
            port = 443
            tls = true

            [location]
            decimate = 5
            driver = "stdin"
            "#,
        );
        assert!(warnings.is_empty(), "{warnings:?}");
    }

    #[test]
    fn test_ranges_reject_zero_values() {
        let mut config = AgentConfig::default();
        config.location.decimate = 0;
        config.uplink.state_window = 0;
        config.server.port = 0;

        let (errors, _) = validate_ranges(&config);
        assert!(errors.iter().any(|e| e.contains("decimate")));
        assert!(errors.iter().any(|e| e.contains("state_window")));
        assert!(errors.iter().any(|e| e.contains("server.port")));
        // Default config has no driver either
        assert!(errors.iter().any(|e| e.contains("driver")));
    }

    #[test]
    fn test_zero_baud_rejected() {
        let mut config = AgentConfig::default();
        config.location.driver = Some(DriverConfig::Serial { port: "/dev/ttyACM0".into(), baud: 0 });

        let (errors, _) = validate_ranges(&config);
        assert_eq!(errors, vec!["location.driver.serial.baud must be > 0".to_string()]);
    }
}
