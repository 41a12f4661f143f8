//! SmartSnack main entry point
//!
//! Hexagonal architecture: producers feed a single coordinator, every
//! record goes local-first through the dual writer.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  Replay*            SerialBoard        FileJournal  SystemClock│
//! │  (Camera+Models)    (Actuator+Light)   (LocalStore) (Clock)    │
//! │  SupabaseStore      OpenWeather        LogEventSink            │
//! │  (RemoteStore)      (Weather)          (EventSink)             │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │              AppService (pure logic)                   │    │
//! │  │  Fusion · Smoothing · Cooldown · Assembly · Backfill   │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! │                                                                │
//! │  Vision · Poller · Weather · Replicator threads · Coordinator  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Usage:
//!
//! ```text
//! smartsnack [-c CONFIG] run SESSION.jsonl    replay a recorded session
//! smartsnack [-c CONFIG] report [--reanalyze] summarise the local journal
//! ```
#![deny(unused_must_use)]

use std::fs::File;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use log::{error, info, warn};

use smartsnack::Timestamp;
use smartsnack::adapters::config_file::JsonConfigFile;
#[cfg(feature = "remote")]
use smartsnack::adapters::config_file::secret_from_env;
use smartsnack::adapters::log_sink::LogEventSink;
use smartsnack::adapters::memory_remote::MemoryRemote;
use smartsnack::adapters::replay::{ReplayCamera, ReplayClassifier, ReplayDetector, ReplaySession};
use smartsnack::adapters::serial_link::{DetachedBoard, SerialBoard};
use smartsnack::adapters::time::SystemClock;
use smartsnack::app::ports::{
    ActuatorCommand, ActuatorPort, ClockPort, ConfigPort, LightSensorPort, RemoteError,
    RemoteStorePort, WeatherPort,
};
use smartsnack::app::service::AppService;
use smartsnack::config::SystemConfig;
use smartsnack::diagnostics;
use smartsnack::error::{ActuatorError, SensorError};
use smartsnack::perception::DetectionSource;
use smartsnack::perception::emotion::EmotionLabel;
use smartsnack::scheduler::{
    Coordinator, Shutdown, VisionRig, new_inbox, spawn_poller, spawn_replicator,
    spawn_vision, spawn_weather,
};
use smartsnack::storage::journal::FileJournal;
use smartsnack::storage::query;
use smartsnack::storage::record::{Record, RecordKey};
use smartsnack::storage::replicator::{ReplicationQueue, Replicator, RetryPolicy};
use smartsnack::storage::DualWriter;

const DEFAULT_CONFIG: &str = "smartsnack.json";

// ── Command line ──────────────────────────────────────────────

enum Mode {
    Run { session: PathBuf },
    Report { reanalyze: bool },
}

fn parse_args() -> Result<(PathBuf, Mode)> {
    let mut config = PathBuf::from(DEFAULT_CONFIG);
    let mut args = std::env::args().skip(1).peekable();

    if matches!(args.peek().map(String::as_str), Some("-c" | "--config")) {
        args.next();
        config = args
            .next()
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("--config needs a path"))?;
    }

    let mode = match args.next().as_deref() {
        Some("run") => Mode::Run {
            session: args
                .next()
                .map(PathBuf::from)
                .ok_or_else(|| anyhow!("run needs a recorded session file"))?,
        },
        Some("report") => Mode::Report {
            reanalyze: args.next().as_deref() == Some("--reanalyze"),
        },
        other => bail!(
            "unknown command {:?}\nusage: smartsnack [-c CONFIG] run SESSION.jsonl | report [--reanalyze]",
            other
        ),
    };
    Ok((config, mode))
}

// ── Adapter selection ─────────────────────────────────────────

/// The feedback board, or its absence.
#[derive(Clone)]
enum Board {
    Serial(SerialBoard<File>),
    Detached(DetachedBoard),
}

impl ActuatorPort for Board {
    fn send(&mut self, command: ActuatorCommand) -> Result<(), ActuatorError> {
        match self {
            Self::Serial(b) => b.send(command),
            Self::Detached(b) => b.send(command),
        }
    }
}

impl LightSensorPort for Board {
    fn read_lux(&mut self) -> Result<f32, SensorError> {
        match self {
            Self::Serial(b) => b.read_lux(),
            Self::Detached(b) => b.read_lux(),
        }
    }

    fn sensor_type(&self) -> &str {
        match self {
            Self::Serial(b) => b.sensor_type(),
            Self::Detached(b) => b.sensor_type(),
        }
    }
}

fn open_board(config: &SystemConfig) -> Board {
    let Some(serial) = &config.serial else {
        info!("Board: none configured, actuation disabled");
        return Board::Detached(DetachedBoard);
    };
    let reply_timeout = Duration::from_millis(u64::from(serial.reply_timeout_ms));
    match SerialBoard::open(&serial.device, &serial.light_sensor_type, reply_timeout) {
        Ok(board) => {
            if !board.ping() {
                warn!("Board: {} did not answer PING", serial.device);
            }
            Board::Serial(board)
        }
        Err(e) => {
            warn!("Board: cannot open {} ({}), actuation disabled", serial.device, e);
            Board::Detached(DetachedBoard)
        }
    }
}

/// Where replication goes.  Without a configured remote, records still
/// complete the dual write against an in-process store.
enum Remote {
    #[cfg(feature = "remote")]
    Rest(smartsnack::adapters::supabase::SupabaseStore),
    Memory(MemoryRemote),
}

impl RemoteStorePort for Remote {
    fn upsert(&mut self, key: RecordKey, record: &Record) -> Result<(), RemoteError> {
        match self {
            #[cfg(feature = "remote")]
            Self::Rest(r) => r.upsert(key, record),
            Self::Memory(r) => r.upsert(key, record),
        }
    }
}

fn build_remote(config: &SystemConfig) -> Result<Remote> {
    let Some(remote) = &config.remote else {
        info!("Remote: none configured, replicating in-process only");
        return Ok(Remote::Memory(MemoryRemote::new()));
    };

    #[cfg(feature = "remote")]
    {
        let key = secret_from_env(&remote.api_key_env).context("remote API key")?;
        let store = smartsnack::adapters::supabase::SupabaseStore::new(
            &remote.base_url,
            key,
            remote.timeout_secs,
        )
        .context("remote client")?;
        Ok(Remote::Rest(store))
    }

    #[cfg(not(feature = "remote"))]
    {
        warn!(
            "Remote: {} configured but built without the `remote` feature",
            remote.base_url
        );
        Ok(Remote::Memory(MemoryRemote::new()))
    }
}

#[cfg(feature = "remote")]
fn build_weather(config: &SystemConfig) -> Result<Option<impl WeatherPort + Send + 'static>> {
    let Some(weather) = &config.weather else {
        return Ok(None);
    };
    let key = secret_from_env(&weather.api_key_env).context("weather API key")?;
    let client = smartsnack::adapters::openweather::OpenWeather::new(weather, key)
        .context("weather client")?;
    Ok(Some(client))
}

#[cfg(not(feature = "remote"))]
fn build_weather(config: &SystemConfig) -> Result<Option<NoWeather>> {
    if config.weather.is_some() {
        warn!("Weather: configured but built without the `remote` feature");
    }
    Ok(None)
}

#[cfg(not(feature = "remote"))]
struct NoWeather;

#[cfg(not(feature = "remote"))]
impl WeatherPort for NoWeather {
    fn fetch(&mut self) -> Result<smartsnack::app::ports::WeatherReading, SensorError> {
        Err(SensorError::Unavailable)
    }
}

// ── Main ──────────────────────────────────────────────────────

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    diagnostics::install_panic_handler();

    info!("╔══════════════════════════════════════╗");
    info!("║  SmartSnack v{:<24}║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    let (config_path, mode) = parse_args()?;
    let config = JsonConfigFile::new(&config_path)
        .load()
        .with_context(|| format!("loading {}", config_path.display()))?;

    let journal = FileJournal::open(&config.storage.journal_path, config.storage.fsync)
        .with_context(|| format!("opening journal {}", config.storage.journal_path))?;
    if journal.skipped_lines() > 0 {
        warn!("Journal: {} unreadable line(s) skipped", journal.skipped_lines());
    }

    match mode {
        Mode::Run { session } => run(config, journal, &session),
        Mode::Report { reanalyze } => report(&config, journal, reanalyze),
    }
}

fn run(config: SystemConfig, journal: FileJournal, session: &Path) -> Result<()> {
    let clock = SystemClock::new();

    // ── 1. Storage ────────────────────────────────────────────
    let local = Arc::new(Mutex::new(journal));
    let queue = Arc::new(ReplicationQueue::new(config.storage.retry_queue_capacity));
    let writer = DualWriter::new(Arc::clone(&local), Arc::clone(&queue));

    let replicator = Replicator::new(
        Arc::clone(&local),
        build_remote(&config)?,
        Arc::clone(&queue),
        RetryPolicy::from_config(&config.storage),
    )
    .with_state_path(&config.storage.retry_state_path);
    let replicator = spawn_replicator(replicator, clock).context("spawning replicator")?;

    // ── 2. Producers ──────────────────────────────────────────
    let session = Arc::new(
        ReplaySession::load(session)
            .map_err(|e| anyhow!("{}: {}", session.display(), e))?,
    );
    let board = open_board(&config);
    let shutdown = Shutdown::new();
    let inbox = new_inbox();

    let rig = VisionRig {
        camera: ReplayCamera::new(Arc::clone(&session), clock.now()),
        narrow: ReplayDetector::new(Arc::clone(&session), DetectionSource::Narrow),
        general: ReplayDetector::new(Arc::clone(&session), DetectionSource::General),
        classifier: ReplayClassifier::new(Arc::clone(&session)),
    };
    let vision = spawn_vision(
        rig,
        Arc::clone(&inbox),
        config.timing.vision_fps,
        shutdown.clone(),
    )
    .context("spawning vision")?;

    // When the recording ends, give the last events one backfill delay to
    // settle, then stop.
    let settle = Duration::from_secs(u64::from(config.emotion.backfill_delay_secs))
        + Duration::from_millis(u64::from(config.timing.coordinator_tick_ms) * 2);
    let vision = {
        let shutdown = shutdown.clone();
        thread::Builder::new()
            .name("vision-watch".into())
            .spawn(move || {
                let stats = vision.join().unwrap_or_default();
                if stats.stream_ended && !shutdown.is_triggered() {
                    info!("Session ended, settling for {:?}", settle);
                    let until = std::time::Instant::now() + settle;
                    while !shutdown.is_triggered() && std::time::Instant::now() < until {
                        thread::sleep(Duration::from_millis(100));
                    }
                    shutdown.trigger();
                }
                stats
            })
            .context("spawning vision watcher")?
    };

    let light = config.serial.is_some().then(|| board.clone());
    let poller = spawn_poller(
        light,
        writer.clone(),
        Arc::clone(&inbox),
        clock,
        Duration::from_secs(u64::from(config.timing.emotion_log_interval_secs)),
        Duration::from_secs(u64::from(config.timing.light_interval_secs)),
        shutdown.clone(),
    )
    .context("spawning poller")?;

    let weather = match build_weather(&config)? {
        Some(client) => Some(
            spawn_weather(
                client,
                writer.clone(),
                clock,
                Duration::from_secs(u64::from(config.timing.weather_interval_secs)),
                shutdown.clone(),
            )
            .context("spawning weather")?,
        ),
        None => None,
    };

    // Operator console: a line reading `q` stops the session.  Detached;
    // it stays blocked on stdin until the process exits.
    {
        let shutdown = shutdown.clone();
        thread::Builder::new()
            .name("console".into())
            .spawn(move || {
                for line in std::io::stdin().lock().lines() {
                    match line {
                        Ok(l) if l.trim() == "q" => {
                            info!("Console: shutdown requested");
                            shutdown.trigger();
                            break;
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            })
            .context("spawning console")?;
    }

    // ── 3. Coordinator (this thread) ──────────────────────────
    let mut coordinator = Coordinator {
        app: AppService::new(config.clone()),
        actuator: board,
        store: writer.clone(),
        sink: LogEventSink::new(),
        clock,
        tick: Duration::from_millis(u64::from(config.timing.coordinator_tick_ms)),
    };
    if let Err(e) = coordinator.run(&inbox, &shutdown) {
        error!("Coordinator stopped: {}", e);
    }

    // ── 4. Orderly shutdown ───────────────────────────────────
    shutdown.trigger();
    let vision_stats = vision.join().unwrap_or_default();
    let poller_stats = poller.join().unwrap_or_default();
    let weather_samples = weather
        .map(|h| h.join().unwrap_or_default().samples)
        .unwrap_or_default();

    if shutdown.fault().is_none() {
        if let Err(e) = coordinator.drain(&inbox) {
            error!("Drain failed: {}", e);
            if e.is_fatal() {
                shutdown.fail(e);
            }
        }
    }
    coordinator.app.note_producer_stats(
        vision_stats.dropped,
        poller_stats.light_samples + weather_samples,
    );
    let stats = coordinator.finish();

    queue.close();
    let replication = replicator.join().unwrap_or_default();

    info!("Session: {}", stats.summary(clock.now()));
    info!(
        "Replication: committed={} failures={} rescans={}",
        replication.committed, replication.failures, replication.rescans
    );

    match shutdown.fault() {
        Some(fault) => Err(anyhow!("pipeline stopped: {}", fault)),
        None => Ok(()),
    }
}

/// Print the emotion distribution and per-food trends, optionally
/// re-deriving `emotion_after` for events that never got it.
fn report(config: &SystemConfig, journal: FileJournal, reanalyze: bool) -> Result<()> {
    let clock = SystemClock::new();
    let now: Timestamp = clock.now();
    let local = Arc::new(Mutex::new(journal));

    if reanalyze {
        // Replication of the updated rows happens on the next `run`.
        let queue = Arc::new(ReplicationQueue::new(config.storage.retry_queue_capacity));
        let writer = DualWriter::new(Arc::clone(&local), queue);
        let window_ms = u64::from(config.emotion.backfill_delay_secs) * 1_000;
        let outcome = query::reanalyze_pending(&writer, 0, now, window_ms)
            .context("re-analysing food events")?;
        println!(
            "re-analysis: examined={} updated={} no_data={}",
            outcome.examined, outcome.updated, outcome.no_data
        );
    }

    let store = local.lock().map_err(|_| anyhow!("journal lock poisoned"))?;
    let distribution = query::emotion_distribution(&*store, 0, now);
    let logged: usize = distribution.values().sum();
    println!("emotion distribution ({} samples):", logged);
    for label in EmotionLabel::CLASSES {
        let n = distribution.get(&label).copied().unwrap_or_default();
        let pct = if logged == 0 { 0.0 } else { n as f32 * 100.0 / logged as f32 };
        println!("  {:<14} {:>6}  {:>5.1}%", label.as_str(), n, pct);
    }

    println!("trends by food:");
    for (food, counts) in query::trends_by_food(&*store) {
        println!(
            "  {:<8} total={:<4} improved={:<4} worsened={:<4} stable={:<4} improvement={:.0}%",
            food.as_str(),
            counts.total(),
            counts.improved,
            counts.worsened,
            counts.stable,
            counts.improvement_rate() * 100.0
        );
    }

    match query::average_emotion_score(&*store, 0, now) {
        Some(score) => println!("average emotion score: {:.2} (1-4)", score),
        None => println!("average emotion score: n/a"),
    }

    println!("mood before eating:");
    for (mood, foods) in query::food_emotion_matrix(&*store) {
        let row: Vec<String> = foods
            .iter()
            .map(|(food, n)| format!("{}={}", food.as_str(), n))
            .collect();
        println!("  {:<14} {}", mood.as_str(), row.join(" "));
    }

    println!("snacking by hour:");
    for (hour, n) in query::snacking_frequency_by_hour(&*store, &clock)
        .iter()
        .enumerate()
        .filter(|(_, n)| **n > 0)
    {
        println!("  {:02}h {:>5}", hour, n);
    }

    let day_start = now.saturating_sub(24 * 3_600_000);
    println!("last 24h light and mood:");
    for hour in query::light_emotion_correlation(&*store, &clock, day_start, now) {
        println!(
            "  {:02}h lux={:>8.1} mood={} ({})",
            hour.hour,
            hour.avg_lux,
            hour.dominant.as_str(),
            hour.emotion_count
        );
    }
    let pattern = query::hourly_emotion_pattern(&*store, &clock, day_start, now);
    let busiest = pattern
        .iter()
        .enumerate()
        .max_by_key(|(_, counts)| counts.values().sum::<usize>());
    if let Some((hour, counts)) = busiest.filter(|(_, c)| c.values().sum::<usize>() > 0) {
        println!(
            "  most emotion samples at {:02}h: {}",
            hour,
            counts.values().sum::<usize>()
        );
    }
    Ok(())
}
