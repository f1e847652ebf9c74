use std::str::FromStr;

use crate::error::EngineError;

/// The driver stack an engine acquires its device from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum BackendKind {
    /// The host reference device.
    #[default]
    Host,
    /// A GPU through wgpu. Requires the `wgpu` feature.
    Wgpu,
}

impl FromStr for BackendKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(BackendKind::Host),
            "wgpu" => Ok(BackendKind::Wgpu),
            other => Err(EngineError::InvalidConfig(format!(
                "unknown backend '{other}', expected 'host' or 'wgpu'"
            ))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Host => write!(f, "host"),
            BackendKind::Wgpu => write!(f, "wgpu"),
        }
    }
}

/// Engine construction options.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct EngineConfig {
    /// The driver stack to use.
    pub backend: BackendKind,
    /// Substring the tagged adapter description must contain. Empty matches any adapter.
    pub adapter_filter: String,
    /// Enables driver validation and command tracing.
    pub debug: bool,
    /// Allows float32 operators to run at half precision.
    pub allow_half_precision: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Host,
            adapter_filter: String::new(),
            debug: false,
            allow_half_precision: true,
        }
    }
}

impl EngineConfig {
    /// Sets the backend.
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the adapter name filter.
    pub fn with_adapter_filter(mut self, filter: impl Into<String>) -> Self {
        self.adapter_filter = filter.into();
        self
    }

    /// Enables or disables debug mode.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Allows or forbids half precision computation.
    pub fn with_half_precision(mut self, allow: bool) -> Self {
        self.allow_half_precision = allow;
        self
    }

    /// Reads the configuration from `ACCEL_BACKEND`, `ACCEL_ADAPTER` and `ACCEL_DEBUG`.
    ///
    /// Unset variables keep their default.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] if a variable cannot be parsed.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let mut config = Self::default();
        if let Some(backend) = lookup("ACCEL_BACKEND") {
            config.backend = backend.parse()?;
        }
        if let Some(filter) = lookup("ACCEL_ADAPTER") {
            config.adapter_filter = filter;
        }
        if let Some(debug) = lookup("ACCEL_DEBUG") {
            config.debug = parse_flag(&debug)?;
        }
        Ok(config)
    }
}

fn parse_flag(value: &str) -> Result<bool, EngineError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => Err(EngineError::InvalidConfig(format!(
            "'{other}' is not a boolean"
        ))),
    }
}
