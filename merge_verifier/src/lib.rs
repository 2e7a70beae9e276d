//! Verification probes for execution and beacon nodes crossing the terminal
//! total difficulty transition.

pub mod client;
pub mod data_points;
pub mod env;
pub mod probe;
pub mod tracing;
pub mod types;
pub mod verification;
pub mod verifier;

/// Common information for the `--version` CLI flags.
pub fn version() -> String {
    let pkg_name = env!("CARGO_PKG_NAME");
    let git_describe = env!("VERGEN_GIT_DESCRIBE");
    let timestamp = env!("VERGEN_BUILD_TIMESTAMP");
    format!("{pkg_name} ({git_describe}) [built: {timestamp}]")
}

/// Deserializes `u64` values that beacon APIs encode as decimal strings.
mod quoted_u64 {
    use serde::{de::Error as _, Deserialize as _, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
