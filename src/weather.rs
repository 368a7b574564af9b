use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Intent detection for weather questions. A trait so the keyword
/// heuristic can later be swapped for a proper intent model without
/// touching the controller.
pub trait WeatherIntent: Send + Sync {
    fn detect(&self, message: &str) -> bool;
    fn extract_location(&self, message: &str) -> Option<String>;
}

const WEATHER_KEYWORDS: &[&str] = &[
    // English
    "temperature", "weather", "forecast", "hot", "cold", "rain", "sunny",
    "climate", "degrees", "celsius", "fahrenheit",
    // Transliterated Hindi
    "tapman", "taapman", "tapmaan", "mausam", "mosam", "garmi",
    "thand", "barish", "dhoop", "jalvayu", "degree",
    // Common misspellings and variations
    "temp", "whether", "forcast", "temprature",
    "tapamaan", "taapmaan", "tapamana",
];

const HINDI_PHRASES: &[&str] = &[
    "aaj ka tapman",
    "aaj ka mausam",
    "tapman kya hai",
    "kitna garam",
    "kitna thanda",
];

/// Keyword-and-pattern classifier covering English and transliterated
/// Hindi phrasing, misspellings included.
pub struct KeywordWeatherIntent {
    location_patterns: Vec<Regex>,
}

impl KeywordWeatherIntent {
    pub fn new() -> Self {
        let patterns = [
            r"(?i)in\s+([a-zA-Z\s]+?)(?:\?|$)",
            r"(?i)at\s+([a-zA-Z\s]+?)(?:\?|$)",
            r"(?i)for\s+([a-zA-Z\s]+?)(?:\?|$)",
            r"(?i)(?:weather|temperature)\s+(?:in|at|of)\s+([a-zA-Z\s]+?)(?:\?|$)",
            r"(?i)(?:weather|temperature)\s+for\s+([a-zA-Z\s]+?)(?:\?|$)",
            r"(?i)([a-zA-Z\s]+?)\s+(?:weather|temperature)(?:\?|$)",
            r"(?i)(?:mein|me)\s+([a-zA-Z\s]+?)(?:\?|$)",
            r"(?i)([a-zA-Z\s]+?)\s+(?:ka|ki|ke)\s+(?:tapman|mausam)(?:\?|$)",
            r"(?i)(?:tapman|mausam)\s+(?:ka|ki|ke)\s+([a-zA-Z\s]+?)(?:\?|$)",
        ];

        Self {
            location_patterns: patterns
                .iter()
                .map(|p| Regex::new(p).expect("static location pattern"))
                .collect(),
        }
    }
}

impl Default for KeywordWeatherIntent {
    fn default() -> Self {
        Self::new()
    }
}

impl WeatherIntent for KeywordWeatherIntent {
    fn detect(&self, message: &str) -> bool {
        let lower = message.to_lowercase();

        if HINDI_PHRASES.iter().any(|phrase| lower.contains(phrase)) {
            return true;
        }
        WEATHER_KEYWORDS.iter().any(|kw| lower.contains(kw))
    }

    fn extract_location(&self, message: &str) -> Option<String> {
        for pattern in &self.location_patterns {
            if let Some(caps) = pattern.captures(message) {
                if let Some(m) = caps.get(1) {
                    let location = m.as_str().trim();
                    if location.len() > 2 {
                        return Some(location.to_string());
                    }
                }
            }
        }
        None
    }
}

// --- OpenWeather lookup ---

#[derive(Debug, Clone, Deserialize)]
pub struct WeatherReport {
    pub name: String,
    pub main: WeatherMain,
    pub weather: Vec<WeatherCondition>,
    pub wind: WeatherWind,
    pub sys: WeatherSys,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeatherMain {
    pub temp: f64,
    pub humidity: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeatherCondition {
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeatherWind {
    pub speed: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeatherSys {
    pub country: String,
}

#[derive(Debug, Deserialize)]
struct IpLocation {
    city: Option<String>,
    country: Option<String>,
}

/// Weather short-circuit for chat turns: classify, extract a location,
/// fetch, format. Every failure returns `None` so the caller falls through
/// to normal generation — a user question is always answered by some path.
pub struct WeatherService {
    intent: Arc<dyn WeatherIntent>,
    client: reqwest::Client,
    api_key: Option<String>,
    default_location: String,
}

impl WeatherService {
    pub fn new(
        intent: Arc<dyn WeatherIntent>,
        api_key: Option<String>,
        default_location: String,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client");

        Self {
            intent,
            client,
            api_key,
            default_location,
        }
    }

    /// Answer a weather question directly, or `None` when the message is
    /// not a weather query or every lookup failed.
    pub async fn try_answer(&self, message: &str, language: &str) -> Option<String> {
        if !self.intent.detect(message) {
            return None;
        }

        let report = match self.intent.extract_location(message) {
            Some(location) => match self.by_location(&location).await {
                Some(report) => Some(report),
                None => {
                    debug!(location, "weather lookup failed, trying default location");
                    self.fallback_report().await
                }
            },
            None => self.fallback_report().await,
        }?;

        Some(format_report(&report, language))
    }

    async fn fallback_report(&self) -> Option<WeatherReport> {
        match self.by_location(&self.default_location).await {
            Some(report) => Some(report),
            None => {
                debug!("default-location weather failed, trying IP geolocation");
                self.by_ip().await
            }
        }
    }

    async fn by_location(&self, location: &str) -> Option<WeatherReport> {
        let api_key = self.api_key.as_deref()?;
        let response = self
            .client
            .get("https://api.openweathermap.org/data/2.5/weather")
            .query(&[("q", location), ("units", "metric"), ("appid", api_key)])
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?;

        response.json::<WeatherReport>().await.ok()
    }

    async fn by_ip(&self) -> Option<WeatherReport> {
        // Without an API key the follow-up lookup cannot succeed; skip the
        // geolocation round-trip entirely.
        self.api_key.as_deref()?;

        let geo = self
            .client
            .get("https://ipapi.co/json/")
            .send()
            .await
            .ok()?
            .json::<IpLocation>()
            .await
            .ok()?;

        let (city, country) = (geo.city?, geo.country?);
        self.by_location(&format!("{city},{country}")).await
    }
}

/// Natural-language weather sentence. Hindi and English get dedicated
/// phrasing; other languages fall back to English.
pub fn format_report(report: &WeatherReport, language: &str) -> String {
    let condition = report
        .weather
        .first()
        .map(|c| c.description.as_str())
        .unwrap_or("unknown");

    if language == "hi" || language.to_lowercase().contains("hindi") {
        format!(
            "{}, {} में वर्तमान तापमान {}°C है।\nमौसम की स्थिति: {}।\nआर्द्रता: {}%।\nहवा की गति: {} मीटर/सेकंड।",
            report.name, report.sys.country, report.main.temp, condition, report.main.humidity, report.wind.speed
        )
    } else {
        format!(
            "Current temperature in {}, {} is {}°C.\nWeather condition: {}.\nHumidity: {}%.\nWind speed: {} m/s.",
            report.name, report.sys.country, report.main.temp, condition, report.main.humidity, report.wind.speed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent() -> KeywordWeatherIntent {
        KeywordWeatherIntent::new()
    }

    #[test]
    fn detects_english_and_hindi_weather_queries() {
        let intent = intent();
        assert!(intent.detect("What is the temperature today?"));
        assert!(intent.detect("Aaj ka mausam kaisa hai"));
        assert!(intent.detect("tapman batao"));
        assert!(intent.detect("aaj ka tapman"));
        assert!(intent.detect("whats the temprature outside")); // misspelling
    }

    #[test]
    fn ignores_non_weather_farming_questions() {
        let intent = intent();
        assert!(!intent.detect("what is the best fertilizer for wheat"));
        assert!(!intent.detect("my goat is limping"));
    }

    #[test]
    fn extracts_prepositional_locations() {
        let intent = intent();
        assert_eq!(
            intent.extract_location("what is the weather in Jaipur?"),
            Some("Jaipur".to_string())
        );
        assert_eq!(
            intent.extract_location("temperature for Nagpur"),
            Some("Nagpur".to_string())
        );
    }

    #[test]
    fn extracts_hindi_possessive_locations() {
        let intent = intent();
        assert_eq!(
            intent.extract_location("Lucknow ka tapman"),
            Some("Lucknow".to_string())
        );
    }

    #[test]
    fn short_matches_are_not_locations() {
        let intent = intent();
        // "it" is under the 3-character floor.
        assert_eq!(intent.extract_location("weather in it"), None);
    }

    #[test]
    fn formats_reports_per_language() {
        let report = WeatherReport {
            name: "Delhi".into(),
            main: WeatherMain { temp: 31.0, humidity: 40.0 },
            weather: vec![WeatherCondition { description: "clear sky".into() }],
            wind: WeatherWind { speed: 3.2 },
            sys: WeatherSys { country: "IN".into() },
        };

        let en = format_report(&report, "en");
        assert!(en.contains("Current temperature in Delhi, IN is 31°C."));

        let hi = format_report(&report, "hi");
        assert!(hi.contains("तापमान"));
        assert!(hi.contains("Delhi"));
    }
}
