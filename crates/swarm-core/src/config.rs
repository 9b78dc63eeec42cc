//! Runtime configuration read from `AISWARM_*` environment variables.
//!
//! Invalid values fall back to the default with a warning; CLI flags are
//! applied on top by the binary.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::build::BuildConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::registry::Credentials;
use crate::retry::RetryPolicy;

pub const ENV_MAX_PARALLEL_BUILDS: &str = "AISWARM_MAX_PARALLEL_BUILDS";
pub const ENV_BUILD_TIMEOUT_SECS: &str = "AISWARM_BUILD_TIMEOUT_SECS";
pub const ENV_PUSH_TIMEOUT_SECS: &str = "AISWARM_PUSH_TIMEOUT_SECS";
pub const ENV_PUSH_ATTEMPT_TIMEOUT_SECS: &str = "AISWARM_PUSH_ATTEMPT_TIMEOUT_SECS";
pub const ENV_APPLY_TIMEOUT_SECS: &str = "AISWARM_APPLY_TIMEOUT_SECS";
pub const ENV_PUSH_ATTEMPTS: &str = "AISWARM_PUSH_ATTEMPTS";
pub const ENV_APPLY_ATTEMPTS: &str = "AISWARM_APPLY_ATTEMPTS";
pub const ENV_BACKOFF_BASE_MS: &str = "AISWARM_BACKOFF_BASE_MS";
pub const ENV_STATE_DIR: &str = "AISWARM_STATE_DIR";
pub const ENV_REGISTRY_USERNAME: &str = "AISWARM_REGISTRY_USERNAME";
pub const ENV_REGISTRY_PASSWORD: &str = "AISWARM_REGISTRY_PASSWORD";
pub const ENV_CONTROL_PLANE_URL: &str = "AISWARM_CONTROL_PLANE_URL";

#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub max_parallel_builds: usize,
    pub build_timeout: Duration,
    /// Bound on the whole push stage of one agent, retries included.
    pub push_timeout: Duration,
    /// Bound on one registry push attempt. See
    /// [`SwarmConfig::registry_attempt_timeout`].
    pub push_attempt_timeout: Option<Duration>,
    pub apply_timeout: Duration,
    pub push_attempts: u32,
    pub apply_attempts: u32,
    pub backoff_base: Duration,
    /// Overrides `<project>/.aiswarm` when set.
    pub state_dir: Option<PathBuf>,
    pub credentials: Option<Credentials>,
    /// Endpoint of the control-plane gateway used by cloud providers.
    pub control_plane_url: Option<String>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_parallel_builds: default_parallelism(),
            build_timeout: Duration::from_secs(20 * 60),
            push_timeout: Duration::from_secs(10 * 60),
            push_attempt_timeout: None,
            apply_timeout: Duration::from_secs(10 * 60),
            push_attempts: 3,
            apply_attempts: 4,
            backoff_base: Duration::from_millis(500),
            state_dir: None,
            credentials: None,
            control_plane_url: None,
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl SwarmConfig {
    /// Load from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            parse_or(&lookup, key, default.as_secs()).map_or(default, Duration::from_secs)
        };

        let credentials = match (
            lookup(ENV_REGISTRY_USERNAME).filter(|v| !v.is_empty()),
            lookup(ENV_REGISTRY_PASSWORD),
        ) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            (Some(_), None) => {
                warn!(
                    key = ENV_REGISTRY_PASSWORD,
                    "registry username set without a password; ignoring credentials"
                );
                None
            }
            _ => None,
        };

        let push_attempt_timeout =
            lookup(ENV_PUSH_ATTEMPT_TIMEOUT_SECS).and_then(|raw| match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
                _ => {
                    warn!(
                        key = ENV_PUSH_ATTEMPT_TIMEOUT_SECS,
                        value = %raw,
                        "invalid value, deriving from the push timeout"
                    );
                    None
                }
            });

        Self {
            max_parallel_builds: parse_or(&lookup, ENV_MAX_PARALLEL_BUILDS, defaults.max_parallel_builds)
                .unwrap_or(defaults.max_parallel_builds),
            build_timeout: secs(ENV_BUILD_TIMEOUT_SECS, defaults.build_timeout),
            push_timeout: secs(ENV_PUSH_TIMEOUT_SECS, defaults.push_timeout),
            push_attempt_timeout,
            apply_timeout: secs(ENV_APPLY_TIMEOUT_SECS, defaults.apply_timeout),
            push_attempts: parse_or(&lookup, ENV_PUSH_ATTEMPTS, defaults.push_attempts)
                .unwrap_or(defaults.push_attempts),
            apply_attempts: parse_or(&lookup, ENV_APPLY_ATTEMPTS, defaults.apply_attempts)
                .unwrap_or(defaults.apply_attempts),
            backoff_base: parse_or(&lookup, ENV_BACKOFF_BASE_MS, 500u64)
                .map_or(defaults.backoff_base, Duration::from_millis),
            state_dir: lookup(ENV_STATE_DIR)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            credentials,
            control_plane_url: lookup(ENV_CONTROL_PLANE_URL).filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn build_config(&self) -> BuildConfig {
        BuildConfig {
            max_parallel: self.max_parallel_builds,
            timeout: self.build_timeout,
            ..BuildConfig::default()
        }
    }

    /// Per-attempt registry timeout, never longer than the push stage.
    /// Without an explicit value, `push_timeout` is split evenly across
    /// `push_attempts`.
    pub fn registry_attempt_timeout(&self) -> Duration {
        let derived = self.push_timeout / self.push_attempts.max(1);
        self.push_attempt_timeout
            .unwrap_or(derived)
            .min(self.push_timeout)
            .max(Duration::from_secs(1))
    }

    pub fn push_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.push_attempts, self.backoff_base)
    }

    pub fn apply_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.apply_attempts, self.backoff_base)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_parallel_agents: self.max_parallel_builds,
            push_timeout: self.push_timeout,
            apply_timeout: self.apply_timeout,
            apply_retry: self.apply_retry(),
        }
    }
}

/// Parse `key`, returning `None` (and warning) for unset-but-invalid values.
/// Zero is rejected for every numeric setting.
fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialEq + Default + std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Some(default);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value != T::default() => Some(value),
        _ => {
            warn!(key, value = %raw, default = %default, "invalid value, using default");
            None
        }
    }
}
