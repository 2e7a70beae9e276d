use std::path::PathBuf;

use alloy::primitives::U256;
use clap::{Parser, ValueHint};
use merge_verifier::client::execution::parse_ttd;
use merge_verifier::client::{ClientEndpoint, DEFAULT_CALL_TIMEOUT};

const PROBE_HELP_HEADING: &str = "Probe options";
const WATCHDOG_HELP_HEADING: &str = "Watchdog options";

/// Verifies that execution and beacon nodes cross the terminal total
/// difficulty and keep producing healthy chains afterwards.
#[derive(Parser)]
#[command(version = merge_verifier::version(), propagate_version = true)]
pub(crate) struct Cli {
    /// Node to verify, as `<client type>,<url>`. Repeat for several nodes.
    #[arg(
        long = "client",
        required = true,
        value_delimiter = ';',
        env = "MERGE_VERIFIER_CLIENTS"
    )]
    pub(crate) clients: Vec<ClientEndpoint>,

    /// Terminal total difficulty, decimal or `0x` hex.
    #[arg(long, value_parser = parse_ttd, env = "MERGE_VERIFIER_TTD")]
    pub(crate) ttd: U256,

    /// Rule file replacing the built-in verifications.
    #[arg(long, value_hint = ValueHint::FilePath, env = "MERGE_VERIFIER_OVERRIDE_VERIFICATIONS")]
    pub(crate) override_verifications: Option<PathBuf>,

    /// Rule file appended to the verifications. May be repeated.
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub(crate) extra_verifications: Vec<PathBuf>,

    /// Deadline in seconds for a single node request.
    #[arg(
        long,
        default_value_t = DEFAULT_CALL_TIMEOUT.as_secs(),
        env = "MERGE_VERIFIER_CALL_TIMEOUT"
    )]
    pub(crate) call_timeout: u64,

    /// Heights behind the head after which a failing height is skipped.
    #[arg(
        long,
        help_heading = PROBE_HELP_HEADING,
        default_value_t = 5,
        env = "MERGE_VERIFIER_RETRY_WINDOW"
    )]
    pub(crate) retry_window: u64,

    /// Gap to the head that switches a probe into backfill.
    #[arg(
        long,
        help_heading = PROBE_HELP_HEADING,
        default_value_t = 10,
        env = "MERGE_VERIFIER_BACKFILL_THRESHOLD"
    )]
    pub(crate) backfill_threshold: u64,

    /// Seconds between probe ticks, overriding every rule's delay.
    #[arg(long, help_heading = PROBE_HELP_HEADING, env = "MERGE_VERIFIER_CHECK_DELAY")]
    pub(crate) check_delay: Option<u64>,

    /// Epochs to wait for the terminal block before giving up. 0 waits
    /// forever.
    #[arg(
        long,
        help_heading = WATCHDOG_HELP_HEADING,
        default_value_t = 5,
        env = "MERGE_VERIFIER_TTD_EPOCH_LIMIT"
    )]
    pub(crate) ttd_epoch_limit: u64,

    /// Epochs after the terminal block to wait for every verification to
    /// pass. 0 waits forever.
    #[arg(
        long,
        help_heading = WATCHDOG_HELP_HEADING,
        default_value_t = 5,
        env = "MERGE_VERIFIER_VERIF_EPOCH_LIMIT"
    )]
    pub(crate) verif_epoch_limit: u64,
}
