use std::ops::Range;
use std::time::Duration;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:9280";
pub const DEFAULT_TLD: &str = "test";
pub const DEFAULT_URL_PORT: u16 = 80;

pub const READINESS_TIMEOUT: Duration = Duration::from_secs(30);
pub const READINESS_PROBE_INTERVAL: Duration = Duration::from_millis(200);
pub const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(100);
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);
pub const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on waiting for buffered output after a process exits
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub const LOG_CAPACITY: usize = 1000;
pub const PORT_RANGE: Range<u16> = 50000..60000;

pub const STATUS_REFRESH_INTERVAL: Duration = Duration::from_secs(1);
pub const SUBSCRIBER_BUFFER: usize = 64;
pub const RUNNER_EVENT_BUFFER: usize = 1024;

pub const CONFIG_DEBOUNCE: Duration = Duration::from_millis(200);
pub const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

pub const ANALYZE_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a launcher gets to fail before it is left running on its own
pub const DESKTOP_LAUNCH_SETTLE: Duration = Duration::from_secs(2);
