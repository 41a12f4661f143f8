//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter         | Implements             | Connects to                 |
//! |-----------------|------------------------|-----------------------------|
//! | `config_file`   | ConfigPort             | JSON file on disk           |
//! | `log_sink`      | EventSink              | `log` facade / stderr       |
//! | `memory_remote` | RemoteStorePort        | In-process map (offline)    |
//! | `openweather`   | WeatherPort            | OpenWeatherMap REST API     |
//! | `replay`        | CameraPort             | Recorded session (JSONL)    |
//! |                 | DetectorPort           |                             |
//! |                 | EmotionClassifierPort  |                             |
//! | `serial_link`   | ActuatorPort           | Feedback board line protocol|
//! |                 | LightSensorPort        |                             |
//! | `supabase`      | RemoteStorePort        | PostgREST upsert endpoint   |
//! | `time`          | ClockPort              | System wall clock (chrono)  |
//!
//! The local store adapter ([`FileJournal`](crate::storage::journal::FileJournal))
//! lives with the rest of the storage layer.

pub mod config_file;
pub mod log_sink;
pub mod memory_remote;
pub mod openweather;
pub mod replay;
pub mod serial_link;
pub mod supabase;
pub mod time;
