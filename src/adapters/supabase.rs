//! REST remote store (PostgREST / Supabase style).
//!
//! Each record becomes one JSON row POSTed to `{base}/rest/v1/{table}`
//! with `on_conflict=record_key` and `Prefer: resolution=merge-duplicates`,
//! so a repeated upsert of the same key replaces the row instead of
//! duplicating it.
//!
//! Row rendering is pure and always compiled; the HTTP client needs the
//! `remote` feature.

use serde_json::{Value, json};

use crate::Timestamp;
use crate::adapters::time::to_rfc3339;
use crate::perception::emotion::{EmotionLabel, EmotionTrend};
use crate::storage::record::{Record, RecordKey};

fn optional_time(at: Option<Timestamp>) -> Value {
    at.map_or(Value::Null, |t| Value::String(to_rfc3339(t)))
}

fn optional_label(label: EmotionLabel) -> Value {
    match label {
        EmotionLabel::Unknown => Value::Null,
        known => Value::String(known.as_str().to_string()),
    }
}

fn optional_trend(trend: EmotionTrend) -> Value {
    match trend {
        EmotionTrend::Unknown => Value::Null,
        known => Value::String(known.as_str().to_string()),
    }
}

/// Render `record` as the remote row for its table.
pub fn remote_row(key: RecordKey, record: &Record) -> Value {
    let mut row = match record {
        Record::Emotion(r) => json!({
            "timestamp": to_rfc3339(r.timestamp),
            "emotion_class": r.emotion_class.as_str(),
            "confidence": r.confidence,
        }),
        Record::Light(r) => json!({
            "timestamp": to_rfc3339(r.timestamp),
            "lux_value": r.lux,
            "sensor_type": r.sensor_type,
        }),
        Record::Weather(r) => json!({
            "timestamp": to_rfc3339(r.timestamp),
            "weather_condition": r.condition,
            "temperature": r.temperature_c,
            "humidity": r.humidity_pct,
            "sunrise_time": optional_time(r.sunrise),
            "sunset_time": optional_time(r.sunset),
            "daylight_duration": r.daylight_hours,
        }),
        Record::FoodEvent(e) => json!({
            "timestamp": to_rfc3339(e.timestamp),
            "food_type": e.category.as_str(),
            "health_category": e.health.as_str(),
            "calories": e.calories,
            "detection_confidence": e.detection_confidence,
            "detection_source": e.detection_source.as_str(),
            "emotion_before": optional_label(e.emotion_before),
            "emotion_after": optional_label(e.emotion_after),
            "emotion_trend": optional_trend(e.emotion_trend),
            "warning_triggered": u8::from(e.warning_triggered),
        }),
    };
    row["record_key"] = Value::String(key.to_string());
    row
}

#[cfg(feature = "remote")]
pub use client::SupabaseStore;

#[cfg(feature = "remote")]
mod client {
    use std::time::Duration;

    use log::{debug, info};
    use reqwest::blocking::Client;

    use super::remote_row;
    use crate::app::ports::{RemoteError, RemoteStorePort};
    use crate::storage::record::{Record, RecordKey};

    pub struct SupabaseStore {
        http: Client,
        base_url: String,
        api_key: String,
    }

    impl SupabaseStore {
        pub fn new(base_url: &str, api_key: String, timeout_secs: u32) -> Result<Self, RemoteError> {
            let http = Client::builder()
                .timeout(Duration::from_secs(u64::from(timeout_secs)))
                .build()
                .map_err(|e| RemoteError::Unreachable(e.to_string()))?;
            info!("SupabaseStore: remote at {}", base_url);
            Ok(Self {
                http,
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key,
            })
        }

        fn endpoint(&self, table: &str) -> String {
            format!("{}/rest/v1/{}?on_conflict=record_key", self.base_url, table)
        }
    }

    impl RemoteStorePort for SupabaseStore {
        fn upsert(&mut self, key: RecordKey, record: &Record) -> Result<(), RemoteError> {
            let table = record.table().as_str();
            let response = self
                .http
                .post(self.endpoint(table))
                .header("apikey", &self.api_key)
                .bearer_auth(&self.api_key)
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&remote_row(key, record))
                .send()
                .map_err(|e| {
                    if e.is_timeout() {
                        RemoteError::Timeout
                    } else {
                        RemoteError::Unreachable(e.to_string())
                    }
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(RemoteError::Rejected {
                    status: status.as_u16(),
                });
            }
            debug!("SupabaseStore: {} {} upserted", table, key);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::{DetectionSource, FoodCategory, HealthTag};
    use crate::storage::record::{FoodEvent, WeatherRow};

    #[test]
    fn food_event_row_uses_remote_columns() {
        let key = RecordKey::generate();
        let rec = Record::FoodEvent(FoodEvent {
            timestamp: 0,
            category: FoodCategory::Donut,
            health: HealthTag::Unhealthy,
            calories: 250,
            detection_confidence: 0.75,
            detection_source: DetectionSource::General,
            emotion_before: EmotionLabel::Neutral,
            emotion_after: EmotionLabel::Unknown,
            emotion_trend: EmotionTrend::Unknown,
            warning_triggered: true,
        });
        let row = remote_row(key, &rec);
        assert_eq!(row["record_key"], key.to_string());
        assert_eq!(row["timestamp"], "1970-01-01T00:00:00.000Z");
        assert_eq!(row["food_type"], "donut");
        assert_eq!(row["health_category"], "unhealthy");
        assert_eq!(row["detection_source"], "general");
        assert_eq!(row["emotion_before"], "neutral");
        assert!(row["emotion_after"].is_null());
        assert!(row["emotion_trend"].is_null());
        assert_eq!(row["warning_triggered"], 1);
    }

    #[test]
    fn weather_row_renders_missing_sun_times_as_null() {
        let rec = Record::Weather(WeatherRow {
            timestamp: 0,
            condition: "Clouds".into(),
            temperature_c: 12.0,
            humidity_pct: 80.0,
            sunrise: None,
            sunset: None,
            daylight_hours: None,
        });
        let row = remote_row(RecordKey::generate(), &rec);
        assert_eq!(row["weather_condition"], "Clouds");
        assert!(row["sunrise_time"].is_null());
        assert!(row["daylight_duration"].is_null());
    }
}
