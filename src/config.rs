//! Process-wide configuration for one `Core` (`SPEC_FULL.md`,
//! "Configuration").
//!
//! The library never reads a file itself — that's explicitly out of scope
//! (`spec.md` §1: "The CLI, logging backend, config loading, build system"
//! are external collaborators). `CoreConfig` is `serde`-derived purely so
//! an embedding application (e.g. this crate's own demo binary) can load it
//! from whatever format it likes and hand the parsed struct in.

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_FDS_TARGET;

/// Top-level knobs a `Core` is constructed with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Soft-limit target the FDS limiter tries to raise `RLIMIT_NOFILE` to.
    pub fds_target: u64,
    /// Dispatcher polling frequency in milliseconds; `0` disables easy mode
    /// and blocks indefinitely between turns (bounded by the next timer
    /// deadline).
    pub dispatcher_frequency_ms: u64,
    /// Whether `Core::start` installs the fatal-signal trap.
    pub signal_interception: bool,
    /// Whether to attempt OS-level socket-buffer/backlog tuning (e.g.
    /// `net.core.somaxconn`) at startup. Best effort; never fatal.
    pub boost_sysctls: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            fds_target: DEFAULT_FDS_TARGET,
            dispatcher_frequency_ms: 0,
            signal_interception: true,
            boost_sysctls: false,
        }
    }
}

impl CoreConfig {
    /// Start from defaults.
    #[must_use]
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder(Self::default())
    }
}

/// Fluent builder over [`CoreConfig`].
#[derive(Debug, Clone)]
pub struct CoreConfigBuilder(CoreConfig);

impl CoreConfigBuilder {
    #[must_use]
    pub fn fds_target(mut self, target: u64) -> Self {
        self.0.fds_target = target;
        self
    }

    #[must_use]
    pub fn dispatcher_frequency_ms(mut self, ms: u64) -> Self {
        self.0.dispatcher_frequency_ms = ms;
        self
    }

    #[must_use]
    pub fn signal_interception(mut self, enabled: bool) -> Self {
        self.0.signal_interception = enabled;
        self
    }

    #[must_use]
    pub fn boost_sysctls(mut self, enabled: bool) -> Self {
        self.0.boost_sysctls = enabled;
        self
    }

    #[must_use]
    pub fn build(self) -> CoreConfig {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_defaults() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.fds_target, DEFAULT_FDS_TARGET);
        assert_eq!(cfg.dispatcher_frequency_ms, 0);
        assert!(cfg.signal_interception);
    }

    #[test]
    fn builder_overrides_selected_fields() {
        let cfg = CoreConfig::builder().dispatcher_frequency_ms(10).signal_interception(false).build();
        assert_eq!(cfg.dispatcher_frequency_ms, 10);
        assert!(!cfg.signal_interception);
        assert_eq!(cfg.fds_target, DEFAULT_FDS_TARGET);
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = CoreConfig::builder().fds_target(1024).build();
        let json = serde_json::to_string(&cfg).expect("serialize");
        let back: CoreConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.fds_target, 1024);
    }
}
