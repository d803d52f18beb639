//! Command-line and environment configuration for the service binary.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

use crate::runtime::DEFAULT_PYTHON;
use crate::server::ServerConfig;
use crate::supervisor::SupervisorConfig;
use crate::trace::{TracePolicy, DEFAULT_TRACE_DEPTH};
use crate::types::DEFAULT_TIMEOUT_SECS;

/// Python snippet execution service
///
/// Examples:
///   python-executor --port 9000
///   EXECUTOR_DEFAULT_TIMEOUT=30 python-executor
#[derive(Clone, Debug, Parser)]
#[command(name = "python-executor", version, about)]
pub struct Args {
    /// Address to bind the server to
    #[arg(long, env = "EXECUTOR_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "EXECUTOR_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Python interpreter used for workers
    #[arg(long, env = "EXECUTOR_PYTHON", default_value = DEFAULT_PYTHON)]
    pub python: PathBuf,

    /// Timeout in seconds when a request does not carry one
    #[arg(long, env = "EXECUTOR_DEFAULT_TIMEOUT", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub default_timeout: u64,

    /// Runs allowed to execute at the same time
    #[arg(long, env = "EXECUTOR_MAX_CONCURRENT", default_value_t = 1)]
    pub max_concurrent: usize,

    /// Capture limit per output stream in bytes
    #[arg(long, env = "EXECUTOR_MAX_OUTPUT_BYTES", default_value_t = 1024 * 1024)]
    pub max_output_bytes: usize,

    /// Innermost traceback frames kept in failure reports
    #[arg(long, env = "EXECUTOR_TRACE_DEPTH", default_value_t = DEFAULT_TRACE_DEPTH)]
    pub trace_depth: usize,

    /// Largest accepted snippet body in bytes
    #[arg(long, env = "EXECUTOR_MAX_BODY_BYTES", default_value_t = 2 * 1024 * 1024)]
    pub max_body_bytes: usize,
}

impl Args {
    /// Supervisor settings
    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            default_timeout_secs: self.default_timeout,
            max_concurrent: self.max_concurrent.max(1),
            max_output_bytes: self.max_output_bytes,
            trace: TracePolicy::with_depth(self.trace_depth),
            python: self.python.clone(),
        }
    }

    /// Server settings
    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            addr: SocketAddr::new(self.host, self.port),
            max_body_bytes: self.max_body_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_library_defaults() {
        let args = Args::try_parse_from(["python-executor"]).unwrap();

        let supervisor = args.supervisor_config();
        let defaults = SupervisorConfig::default();
        assert_eq!(supervisor.default_timeout_secs, defaults.default_timeout_secs);
        assert_eq!(supervisor.max_concurrent, defaults.max_concurrent);
        assert_eq!(supervisor.max_output_bytes, defaults.max_output_bytes);
        assert_eq!(supervisor.trace, defaults.trace);
        assert_eq!(supervisor.python, defaults.python);

        let server = args.server_config();
        let defaults = ServerConfig::default();
        assert_eq!(server.addr, defaults.addr);
        assert_eq!(server.max_body_bytes, defaults.max_body_bytes);
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::try_parse_from([
            "python-executor",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--python",
            "/usr/bin/python3.12",
            "--default-timeout",
            "30",
            "--trace-depth",
            "2",
        ])
        .unwrap();

        assert_eq!(args.server_config().addr, SocketAddr::from(([127, 0, 0, 1], 9000)));
        let supervisor = args.supervisor_config();
        assert_eq!(supervisor.default_timeout_secs, 30);
        assert_eq!(supervisor.trace.depth, 2);
        assert_eq!(supervisor.python, PathBuf::from("/usr/bin/python3.12"));
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let args = Args::try_parse_from(["python-executor", "--max-concurrent", "0"]).unwrap();
        assert_eq!(args.supervisor_config().max_concurrent, 1);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Args::try_parse_from(["python-executor", "--port", "http"]).is_err());
        assert!(Args::try_parse_from(["python-executor", "--default-timeout", "-5"]).is_err());
        assert!(Args::try_parse_from(["python-executor", "--host", "localhost:80"]).is_err());
    }
}
