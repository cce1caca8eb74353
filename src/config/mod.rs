/// Command-line configuration surface.
///
/// Every tunable of the router lives here. Durations accept `inf`,
/// `<n>min`, `<n>s`, `<n>ms` and `<n>us`; `inf` disables the corresponding
/// timeout or threshold. Options are installed once at startup and read
/// through [`options()`] everywhere else.
use clap::Parser;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// Stand-in for "no limit". Kept well clear of `Duration::MAX` so that
/// adding a small margin to it can never overflow.
pub const INF: Duration = Duration::from_secs(u32::MAX as u64);

#[derive(Parser, Debug, Clone)]
#[command(name = "pasarela")]
#[command(about = "A sharding router for MongoDB-flavoured document databases")]
#[command(version)]
pub struct Options {
    /// Config servers holding the cluster topology, `host:port[,host:port...]`
    #[arg(short = 'c', long, value_name = "ADDRS")]
    pub config_servers: String,

    /// Address to listen on, `[host:]port` (repeatable)
    #[arg(short = 'l', long, value_name = "ADDR", required = true)]
    pub listen: Vec<String>,

    /// Cache the cluster topology in this file
    #[arg(short = 'C', long, value_name = "FILE")]
    pub config_cache: Option<PathBuf>,

    /// Write log to this file instead of stderr
    #[arg(short = 'L', long, value_name = "FILE")]
    pub log: Option<PathBuf>,

    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Require authorization for clients
    #[arg(long, value_parser = parse_switch, default_value = "no", action = clap::ArgAction::Set)]
    pub auth: bool,

    /// File containing a shared secret between the router and the backends
    #[arg(long, value_name = "PATH")]
    pub key_file: Option<PathBuf>,

    /// Estimated ping between two local backends
    #[arg(long, value_parser = parse_duration, default_value = "10ms")]
    pub local_threshold: Duration,

    /// Ignore replicas whose replication lag exceeds this value
    #[arg(long, value_parser = parse_duration, default_value = "inf")]
    pub max_repl_lag: Duration,

    /// Default timeout for queries
    #[arg(long, value_parser = parse_duration, default_value = "inf")]
    pub read_timeout: Duration,

    /// Default timeout for inserts, updates and deletes
    #[arg(long, value_parser = parse_duration, default_value = "inf")]
    pub write_timeout: Duration,

    /// Hedging trigger for queries
    #[arg(long, value_parser = parse_duration, default_value = "inf")]
    pub read_retransmit: Duration,

    /// Retransmit trigger for writes
    #[arg(long, value_parser = parse_duration, default_value = "inf")]
    pub write_retransmit: Duration,

    /// Timeout for backend pings
    #[arg(long, value_parser = parse_duration, default_value = "500ms")]
    pub ping_timeout: Duration,

    /// Ping interval for alive backends
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub ping_interval: Duration,

    /// Ping interval for dead backends
    #[arg(long, value_parser = parse_duration, default_value = "2s")]
    pub ping_fail_interval: Duration,

    /// Timeout for config servers
    #[arg(long, value_parser = parse_duration, default_value = "1s")]
    pub conf_timeout: Duration,

    /// Hedging trigger for config servers
    #[arg(long, value_parser = parse_duration, default_value = "20ms")]
    pub conf_retransmit: Duration,

    /// Poll interval for config servers
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub conf_interval: Duration,

    /// Maximal primary election time before the monitor reports an issue
    #[arg(long, value_parser = parse_duration, default_value = "inf")]
    pub monitor_no_primary: Duration,

    /// Maximal topology age before the monitor reports an issue
    #[arg(long, value_parser = parse_duration, default_value = "inf")]
    pub monitor_config_age: Duration,

    /// Idle connections kept per endpoint
    #[arg(long, value_name = "N", default_value_t = default_parallelism())]
    pub conn_pool_size: usize,

    /// OS threads in the runtime pool
    #[arg(long, value_name = "N", default_value_t = default_parallelism())]
    pub threads: usize,

    /// Share the cursor map process-wide
    #[arg(long, value_parser = parse_switch, default_value = "no", action = clap::ArgAction::Set)]
    pub global_cursors: bool,

    /// Reject all writes through this router
    #[arg(long, value_parser = parse_switch, default_value = "no", action = clap::ArgAction::Set)]
    pub read_only: bool,
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for Options {
    fn default() -> Self {
        Options {
            config_servers: String::new(),
            listen: Vec::new(),
            config_cache: None,
            log: None,
            verbose: 0,
            auth: false,
            key_file: None,
            local_threshold: Duration::from_millis(10),
            max_repl_lag: INF,
            read_timeout: INF,
            write_timeout: INF,
            read_retransmit: INF,
            write_retransmit: INF,
            ping_timeout: Duration::from_millis(500),
            ping_interval: Duration::from_secs(10),
            ping_fail_interval: Duration::from_secs(2),
            conf_timeout: Duration::from_secs(1),
            conf_retransmit: Duration::from_millis(20),
            conf_interval: Duration::from_secs(10),
            monitor_no_primary: INF,
            monitor_config_age: INF,
            conn_pool_size: default_parallelism(),
            threads: default_parallelism(),
            global_cursors: false,
            read_only: false,
        }
    }
}

static OPTIONS: OnceLock<Options> = OnceLock::new();

impl Options {
    /// Installs this option set as the process-wide one. Later installs are
    /// ignored, which keeps tests that race on it harmless.
    pub fn install(self) {
        let _ = OPTIONS.set(self);
    }
}

/// Process-wide options; defaults when none were installed (tests).
pub fn options() -> &'static Options {
    OPTIONS.get_or_init(Options::default)
}

/// True if the duration means "no limit".
pub fn is_inf(d: Duration) -> bool {
    d >= INF
}

/// `Some(d)` for finite durations, `None` for "no limit".
pub fn finite(d: Duration) -> Option<Duration> {
    if is_inf(d) {
        None
    } else {
        Some(d)
    }
}

/// Parses `yes`/`no` style switches.
pub fn parse_switch(s: &str) -> Result<bool, String> {
    match s {
        "yes" | "true" | "1" | "" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(format!("cannot parse `{s}' as yes/no")),
    }
}

/// Parses a duration in the `inf | <n>(min|s|ms|us)` grammar.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    if s == "inf" {
        return Ok(INF);
    }

    let digits = s.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return Err(format!("cannot parse `{s}' as time; use `<num>(min|s|ms|us)'"));
    }
    let value: u64 = s[..digits]
        .parse()
        .map_err(|e| format!("cannot parse `{s}': {e}"))?;

    let d = match &s[digits..] {
        "min" | "m" => Duration::from_secs(value * 60),
        "s" => Duration::from_secs(value),
        "ms" => Duration::from_millis(value),
        "us" => Duration::from_micros(value),
        dim => return Err(format!("unknown time dimension `{dim}'")),
    };
    if d >= INF {
        return Err(format!("`{s}' is too large"));
    }
    Ok(d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("5min").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("70us").unwrap(), Duration::from_micros(70));
    }

    #[test]
    fn test_parse_duration_inf() {
        let d = parse_duration("inf").unwrap();
        assert!(is_inf(d));
        assert_eq!(finite(d), None);
        assert_eq!(finite(Duration::from_secs(1)), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10h").is_err());
        assert!(parse_duration("ms").is_err());
    }

    #[test]
    fn test_parse_switch() {
        assert_eq!(parse_switch("yes"), Ok(true));
        assert_eq!(parse_switch("no"), Ok(false));
        assert!(parse_switch("maybe").is_err());
    }

    #[test]
    fn test_cli_round_trip() {
        let opts = Options::parse_from([
            "pasarela",
            "-c",
            "cfg1:27019,cfg2:27019",
            "-l",
            "0.0.0.0:27017",
            "-l",
            "[::]:27017",
            "--read-retransmit",
            "50ms",
            "--auth",
            "yes",
            "-vv",
        ]);
        assert_eq!(opts.config_servers, "cfg1:27019,cfg2:27019");
        assert_eq!(opts.listen.len(), 2);
        assert_eq!(opts.read_retransmit, Duration::from_millis(50));
        assert!(opts.auth);
        assert_eq!(opts.verbose, 2);
        assert!(is_inf(opts.read_timeout));
        assert!(!opts.read_only);
    }
}
