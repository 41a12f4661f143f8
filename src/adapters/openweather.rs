//! OpenWeatherMap current-conditions adapter.
//!
//! `GET {base}?lat=..&lon=..&appid=..&units=metric` and keep the main
//! condition, temperature, humidity and the sunrise/sunset times.  The
//! response decoding is always compiled; the HTTP client needs the
//! `remote` feature.

use serde::Deserialize;

use crate::Timestamp;
use crate::app::ports::WeatherReading;
use crate::error::SensorError;

#[derive(Debug, Deserialize)]
struct Condition {
    main: String,
}

#[derive(Debug, Deserialize)]
struct Main {
    temp: f32,
    humidity: f32,
}

#[derive(Debug, Default, Deserialize)]
struct Sys {
    sunrise: Option<i64>,
    sunset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Current {
    weather: Vec<Condition>,
    main: Main,
    #[serde(default)]
    sys: Sys,
}

fn unix_secs_to_ms(secs: Option<i64>) -> Option<Timestamp> {
    secs.filter(|s| *s >= 0).map(|s| s as Timestamp * 1_000)
}

/// Decode a current-weather response body.
pub fn parse_current(body: &str) -> Result<WeatherReading, SensorError> {
    let current: Current = serde_json::from_str(body).map_err(|_| SensorError::Malformed)?;
    let condition = current
        .weather
        .into_iter()
        .next()
        .map(|c| c.main)
        .ok_or(SensorError::Malformed)?;
    Ok(WeatherReading {
        condition,
        temperature_c: current.main.temp,
        humidity_pct: current.main.humidity,
        sunrise: unix_secs_to_ms(current.sys.sunrise),
        sunset: unix_secs_to_ms(current.sys.sunset),
    })
}

#[cfg(feature = "remote")]
pub use client::OpenWeather;

#[cfg(feature = "remote")]
mod client {
    use std::time::Duration;

    use log::{info, warn};
    use reqwest::blocking::Client;

    use super::parse_current;
    use crate::app::ports::{WeatherPort, WeatherReading};
    use crate::config::WeatherConfig;
    use crate::error::SensorError;

    pub struct OpenWeather {
        http: Client,
        base_url: String,
        api_key: String,
        latitude: f64,
        longitude: f64,
    }

    impl OpenWeather {
        pub fn new(config: &WeatherConfig, api_key: String) -> Result<Self, SensorError> {
            let http = Client::builder()
                .timeout(Duration::from_secs(u64::from(config.timeout_secs)))
                .build()
                .map_err(|_| SensorError::Unavailable)?;
            info!(
                "OpenWeather: lat={:.3} lon={:.3}",
                config.latitude, config.longitude
            );
            Ok(Self {
                http,
                base_url: config.base_url.clone(),
                api_key,
                latitude: config.latitude,
                longitude: config.longitude,
            })
        }
    }

    impl WeatherPort for OpenWeather {
        fn fetch(&mut self) -> Result<WeatherReading, SensorError> {
            let response = self
                .http
                .get(&self.base_url)
                .query(&[
                    ("lat", self.latitude.to_string()),
                    ("lon", self.longitude.to_string()),
                    ("appid", self.api_key.clone()),
                    ("units", "metric".to_string()),
                ])
                .send()
                .map_err(|e| {
                    warn!("OpenWeather: request failed: {}", e);
                    SensorError::ReadFailed
                })?;
            if !response.status().is_success() {
                warn!("OpenWeather: HTTP {}", response.status());
                return Err(SensorError::ReadFailed);
            }
            let body = response.text().map_err(|_| SensorError::ReadFailed)?;
            parse_current(&body)
        }
    }
}
