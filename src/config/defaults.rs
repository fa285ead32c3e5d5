//! System-wide default constants.
//!
//! Grouped by subsystem. Config structs reference these so the TOML defaults
//! and the documented defaults cannot drift apart.

// ============================================================================
// Paths & Environment
// ============================================================================

/// Directory name under the platform config/data dirs.
pub const APP_DIR_NAME: &str = "nav-uplink";

/// Config file name inside the config directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Credentials file name inside the data directory.
pub const CREDENTIALS_FILE_NAME: &str = "credentials.toml";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "NAV_UPLINK_CONFIG";

/// Environment variable carrying the device access token.
pub const ACCESS_TOKEN_ENV: &str = "NAV_UPLINK_ACCESS_TOKEN";

// ============================================================================
// Server
// ============================================================================

pub const SERVER_HOST: &str = "localhost";

pub const SERVER_PORT: u16 = 443;

// ============================================================================
// Location
// ============================================================================

/// Forward every Nth fused record.
pub const DECIMATE: u32 = 1;

// ============================================================================
// Queue
// ============================================================================

/// Maximum Ready + Unacked state updates; 0 = unbounded.
///
/// 86 400 = one day at 1 Hz.
pub const STATE_QUEUE_MAX_DEPTH: usize = 86_400;

/// Maximum Ready + Unacked events; 0 = unbounded.
pub const EVENT_QUEUE_MAX_DEPTH: usize = 10_000;

/// Acked entries kept per queue after trimming.
pub const RETAIN_ACKED: usize = 1_000;

// ============================================================================
// Uplink
// ============================================================================

/// State updates exposed to redelivery per failed stream.
pub const STATE_WINDOW: usize = 50;

/// Events exposed to redelivery per failed stream.
pub const EVENT_WINDOW: usize = 10;

/// Delay after a failed stream before resuming (seconds).
pub const RETRY_BACKOFF_SECS: u64 = 5;

/// How long `get_batch` waits for a Ready entry (milliseconds).
pub const BATCH_WAIT_MS: u64 = 1_000;

/// Bound on the initial connectivity check (seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Budget for joining both sessions at shutdown (seconds).
pub const STOP_TIMEOUT_SECS: u64 = 5;

/// Backlog log interval (seconds); 0 disables the monitor.
pub const BACKLOG_REPORT_SECS: u64 = 60;

/// TCP keepalive idle time for network drivers (seconds).
pub const TCP_KEEPALIVE_SECS: u64 = 30;

/// Bound on connecting to a TCP receiver (seconds).
pub const DRIVER_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Serial line rate when `baud` is omitted.
pub const SERIAL_BAUD: u32 = 115_200;

/// Serial read timeout; bounds how long the reader thread takes to notice shutdown (ms).
pub const SERIAL_READ_TIMEOUT_MS: u64 = 500;
