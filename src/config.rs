//! # 启动参数
//!
//! Every flag can also come from the environment, so the service runs the
//! same way under a process manager as from a shell.

use std::{fmt, time::Duration};

use clap::{Parser, ValueEnum};
use reqwest::Url;

pub const DEFAULT_UPSTREAM_URL: &str = "http://thecatapi.com/api/images/get";

/// cats server
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Param {
    /// 监听端口
    #[arg(long, short, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Worker groups; the runtime gets `web_concurrency * max_threads` threads.
    #[arg(long, env = "WEB_CONCURRENCY", default_value_t = 2)]
    pub web_concurrency: usize,

    /// Threads per worker group.
    #[arg(long, env = "MAX_THREADS", default_value_t = 5)]
    pub max_threads: usize,

    /// Read from `RACK_ENV` so existing deployment manifests keep working.
    #[arg(long, env = "RACK_ENV", value_enum, ignore_case = true, default_value_t = Environment::Development)]
    pub environment: Environment,

    /// Endpoint whose `Location` header `GET /` reports.
    #[arg(long, env = "UPSTREAM_URL", default_value = DEFAULT_UPSTREAM_URL)]
    pub upstream_url: Url,

    /// Outbound request timeout in seconds.
    #[arg(long = "upstream-timeout", env = "UPSTREAM_TIMEOUT_SECS", default_value_t = 5)]
    pub upstream_timeout_secs: u64,

    /// Connection idle timeout in seconds.
    #[arg(long = "idle-timeout", env = "IDLE_TIMEOUT_SECS", default_value_t = 120)]
    pub idle_timeout_secs: u64,

    /// Seconds shutdown waits for open connections before exiting.
    #[arg(long = "drain-timeout", env = "DRAIN_TIMEOUT_SECS", default_value_t = 10)]
    pub drain_timeout_secs: u64,

    /// reqwest client的代理
    #[arg(long, env = "HTTP_PROXY_URL", default_value = "")]
    pub http_proxy: String,
}

impl Param {
    pub fn worker_threads(&self) -> usize {
        self.web_concurrency.saturating_mul(self.max_threads).max(1)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
