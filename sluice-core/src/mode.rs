//! Runtime mode configuration for Sluice.

use serde::{Deserialize, Serialize};

/// Runtime mode for Sluice services.
///
/// Controls whether sessions are backed by the real transcoder binary or by
/// a simulated transcoder that writes a synthetic HLS window. This allows
/// offline development while keeping the same registry and HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeMode {
    /// Production mode - launches the configured transcoder binary
    Production,
    /// Development mode - uses the simulated transcoder
    Development,
}

impl RuntimeMode {
    /// Check if running in development mode.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Check if running in production mode.
    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

impl Default for RuntimeMode {
    fn default() -> Self {
        Self::Production
    }
}

impl std::fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "PRODUCTION"),
            Self::Development => write!(f, "DEVELOPMENT"),
        }
    }
}

impl std::str::FromStr for RuntimeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            _ => Err(format!(
                "Invalid runtime mode: '{s}'. Valid options are: production, development"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("prod".parse::<RuntimeMode>(), Ok(RuntimeMode::Production));
        assert_eq!("DEV".parse::<RuntimeMode>(), Ok(RuntimeMode::Development));
        assert!("staging".parse::<RuntimeMode>().is_err());
        assert!(RuntimeMode::default().is_production());
        assert_eq!(RuntimeMode::Development.to_string(), "DEVELOPMENT");
    }
}
