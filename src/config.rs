//! Environment-level configuration for the bridge presentation path.
//!
//! All knobs are read once at swapchain creation and carried as a plain
//! struct, so tests can construct any configuration without touching the
//! process environment.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Socket path of the compositor bridge. Unset or empty disables the
/// bridge path entirely.
pub const ENV_SOCKET: &str = "WSI_BRIDGE_SOCKET";
/// Milliseconds to wait for per-frame feedback before permanently falling
/// back to timer pacing.
pub const ENV_FEEDBACK_TIMEOUT_MS: &str = "WSI_BRIDGE_FEEDBACK_TIMEOUT_MS";
/// Frames-per-second cap for bridge submission. `0` disables timer pacing.
pub const ENV_MAX_FPS: &str = "WSI_BRIDGE_MAX_FPS";
/// Prefer linear buffer layouts when allocating bridge images.
pub const ENV_PREFER_LINEAR: &str = "WSI_BRIDGE_PREFER_LINEAR";
/// Keep MAILBOX/IMMEDIATE present modes instead of forcing FIFO in bridge
/// mode.
pub const ENV_ALLOW_MAILBOX: &str = "WSI_BRIDGE_ALLOW_MAILBOX";

pub const DEFAULT_FEEDBACK_TIMEOUT_MS: u64 = 250;
pub const MAX_FEEDBACK_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_BRIDGE_FPS: u32 = 60;
pub const MAX_SUPPORTED_FPS: u32 = 240;

/// Parsed configuration for one swapchain.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bridge socket path, if the bridge path is requested at all.
    pub socket_path: Option<PathBuf>,
    /// Bounded wait for a feedback reply after each frame.
    pub feedback_timeout: Duration,
    /// Explicit FPS cap; `None` means "no override, use the default".
    pub max_fps_override: Option<u32>,
    /// Restrict bridge allocations to linear layouts when available.
    pub prefer_linear: bool,
    /// Keep the application's MAILBOX/IMMEDIATE mode in bridge mode.
    pub allow_mailbox: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            feedback_timeout: Duration::from_millis(DEFAULT_FEEDBACK_TIMEOUT_MS),
            max_fps_override: None,
            prefer_linear: false,
            allow_mailbox: false,
        }
    }
}

impl BridgeConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup(ENV_SOCKET).filter(|p| !p.is_empty()) {
            config.socket_path = Some(PathBuf::from(path));
        }

        if let Some(raw) = lookup(ENV_FEEDBACK_TIMEOUT_MS).filter(|v| !v.is_empty()) {
            match raw.parse::<u64>() {
                Ok(ms) => {
                    config.feedback_timeout =
                        Duration::from_millis(ms.min(MAX_FEEDBACK_TIMEOUT_MS));
                }
                Err(_) => {
                    warn!(
                        "invalid {}='{}', using default {} ms",
                        ENV_FEEDBACK_TIMEOUT_MS, raw, DEFAULT_FEEDBACK_TIMEOUT_MS
                    );
                }
            }
        }

        if let Some(raw) = lookup(ENV_MAX_FPS).filter(|v| !v.is_empty()) {
            match raw.parse::<u32>() {
                Ok(fps) => config.max_fps_override = Some(fps.min(MAX_SUPPORTED_FPS)),
                Err(_) => {
                    warn!("invalid {}='{}', using default pacing", ENV_MAX_FPS, raw);
                }
            }
        }

        config.prefer_linear = flag_enabled(lookup(ENV_PREFER_LINEAR));
        config.allow_mailbox = flag_enabled(lookup(ENV_ALLOW_MAILBOX));

        config
    }

    /// FPS cap to apply in bridge mode: the explicit override always wins,
    /// otherwise a conservative default independent of the present mode.
    pub fn effective_bridge_fps(&self) -> u32 {
        self.max_fps_override.unwrap_or(DEFAULT_BRIDGE_FPS)
    }

    /// Whether the explicit FPS override is set (used only for logging
    /// decisions; the value itself comes from [`effective_bridge_fps`]).
    ///
    /// [`effective_bridge_fps`]: Self::effective_bridge_fps
    pub fn has_fps_override(&self) -> bool {
        self.max_fps_override.is_some()
    }
}

/// A flag variable is enabled when set to anything but the literal `"0"`.
fn flag_enabled(value: Option<String>) -> bool {
    match value {
        Some(v) => !v.is_empty() && v != "0",
        None => false,
    }
}
