//! Default configuration values - single source of truth

/// Default database host
pub const HOST: &str = "localhost";

/// Default MySQL port
pub const PORT: u16 = 3306;

/// Default user
pub const USER: &str = "root";

/// Whether connections request a persistent (kept-alive) socket by default
pub const PERSISTENT: bool = true;

/// Retries after the first attempt (0 = unbounded)
pub const MAX_RETRY_COUNT: u32 = 0;

/// Give up retrying after this many milliseconds (0 = never)
pub const RETRY_TIMEOUT_MS: u64 = 10_000;

/// Base delay between attempts in milliseconds
pub const RETRY_DELAY_MS: u64 = 1_000;

/// Interval between dispatcher ticks in milliseconds
pub const TICK_INTERVAL_MS: u64 = 10;

/// Prefix of environment variable overrides (`RQMUX__RETRY__DELAY_MS=...`)
pub const ENV_PREFIX: &str = "RQMUX";

/// Separator between nested keys in environment variable overrides
pub const ENV_SEPARATOR: &str = "__";

/// Config file looked up when no path is given
pub const CONFIG_FILE: &str = "rqmux";
