//! Utility helpers shared across the pipeline.
//!
//! This module is organized into focused submodules:
//!
//! - [`gate`] - Global in-flight record gate (memory backpressure)
//! - [`throttle`] - Time-based log throttling
//! - [`waitgroup`] - Await-able completion barrier for batches

mod gate;
mod throttle;
mod waitgroup;

pub use gate::RecordGate;
pub use throttle::LogThrottle;
pub use waitgroup::WaitGroup;

/// Returns the smallest `shift` for which `1 << shift` is no smaller than `s`.
pub fn get_shift(s: usize) -> u32 {
    let mut shift = 0u32;
    while (1usize << shift) < s {
        shift += 1;
    }
    shift
}

/// Placeholder token for a db-key field, e.g. `tenant` -> `${tenant}`.
pub fn key_token(field: &str) -> String {
    format!("${{{field}}}")
}

/// Whether `template` references the given field as a placeholder.
pub fn template_references(template: &str, field: &str) -> bool {
    template.contains(&key_token(field))
}

/// Substitute `${field}` in a db-key template with the record value.
///
/// Dots in the value become underscores so the result stays a usable
/// database name.
pub fn substitute_db_key(template: &str, field: &str, value: &str) -> String {
    let token = key_token(field);
    if !template.contains(&token) {
        return template.to_owned();
    }
    let value = value.replace('.', "_");
    template.replace(&token, &value)
}

/// Compare dotted ClickHouse version strings. An `x` segment on either
/// side matches anything.
pub fn compare_clickhouse_version(v1: &str, v2: &str) -> std::cmp::Ordering {
    let s1: Vec<&str> = v1.split('.').collect();
    let s2: Vec<&str> = v2.split('.').collect();
    for (i, p1) in s1.iter().enumerate() {
        let Some(p2) = s2.get(i) else { break };
        if *p1 == "x" || *p2 == "x" {
            continue;
        }
        let f1: i64 = p1.parse().unwrap_or(0);
        let f2: i64 = p2.parse().unwrap_or(0);
        match f1.cmp(&f2) {
            std::cmp::Ordering::Equal => {}
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}
