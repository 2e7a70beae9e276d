use std::io;
use std::path::PathBuf;

use tracing::{debug, warn};

/// Points at a dotenv file to load instead of `./.env`.
pub const ENV_FILE_VAR: &str = "MERGE_VERIFIER_ENV_FILE";

/// Loads `MERGE_VERIFIER_*` settings from a dotenv file into the process
/// environment. Variables already set in the environment win.
///
/// A missing file is not an error; a malformed one is reported and skipped.
pub fn load_dotenvy_vars_if_present() {
    let loaded = match std::env::var_os(ENV_FILE_VAR) {
        Some(path) => dotenvy::from_path(&path).map(|()| PathBuf::from(path)),
        None => dotenvy::dotenv(),
    };
    match loaded {
        Ok(path) => debug!(path = %path.display(), "loaded environment file"),
        Err(dotenvy::Error::Io(io::Error { .. })) => (),
        Err(e) => warn!("found an environment file but could not parse it: {e}"),
    }
}
