use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, read once from the environment at startup.
/// Every knob has a default so a bare `.env` with just the API keys is
/// enough to run locally.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: PathBuf,
    pub upload_dir: PathBuf,
    pub gemini_api_key: String,
    /// Ordered generation strategies: primary model first, then fallback.
    pub primary_model: String,
    pub fallback_model: String,
    pub weather_api_key: Option<String>,
    pub default_location: String,
    /// Inactivity window on a streaming connection before it is closed
    /// with a timeout error.
    pub stream_timeout: Duration,
    /// Ceiling on a single buffered provider call.
    pub request_timeout: Duration,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        let data_dir = PathBuf::from(&home).join(".dhenu");

        let db_path = std::env::var("DHENU_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("dhenu.db"));
        let upload_dir = std::env::var("DHENU_UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("uploads"));

        Self {
            port: env_or("DHENU_PORT", "3000").parse().unwrap_or(3000),
            db_path,
            upload_dir,
            gemini_api_key: env_or("GEMINI_API_KEY", ""),
            primary_model: env_or("DHENU_PRIMARY_MODEL", "gemini-2.5-pro"),
            fallback_model: env_or("DHENU_FALLBACK_MODEL", "gemini-2.5-flash"),
            weather_api_key: std::env::var("OPENWEATHER_API_KEY").ok(),
            default_location: env_or("DHENU_DEFAULT_LOCATION", "Delhi,IN"),
            stream_timeout: Duration::from_secs(
                env_or("DHENU_STREAM_TIMEOUT_SECS", "15").parse().unwrap_or(15),
            ),
            request_timeout: Duration::from_secs(
                env_or("DHENU_REQUEST_TIMEOUT_SECS", "60").parse().unwrap_or(60),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_env() {
        // Not touching the real env here; just exercise the fallback path
        // for keys that are unlikely to be set in a test runner.
        let cfg = Config::from_env();
        assert_eq!(cfg.primary_model, "gemini-2.5-pro");
        assert_eq!(cfg.stream_timeout, Duration::from_secs(15));
        assert_eq!(cfg.request_timeout, Duration::from_secs(60));
    }
}
