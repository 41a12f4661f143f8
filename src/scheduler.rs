//! Producer threads and the coordinator loop.
//!
//! Every producer runs on its own cadence and only talks to the rest of
//! the pipeline through the coordinator inbox or a [`DualWriter`] clone,
//! so a slow network call never stalls the vision loop.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Producers                            │
//! │                                                              │
//! │  ┌────────────┐  ┌───────────────────────┐  ┌─────────────┐  │
//! │  │ Vision     │  │ Poller (LocalExecutor)│  │ Weather     │  │
//! │  │ ~20 fps    │  │ emotion tick · light  │  │ hourly      │  │
//! │  └─────┬──────┘  └──────┬──────────┬─────┘  └──────┬──────┘  │
//! │        │ try_send       │ try_send │ write         │ write   │
//! │        ▼                ▼          ▼               ▼         │
//! │  ┌──────────────────────────┐   ┌──────────────────────────┐ │
//! │  │   Inbox (bounded)        │   │   DualWriter             │ │
//! │  └────────────┬─────────────┘   └────────────┬─────────────┘ │
//! │               ▼                              │ enqueue       │
//! │     Coordinator (caller's thread)            ▼               │
//! │     AppService.handle_command / tick    Replicator thread    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Shutdown order: stop and join producers, drain the inbox, shut the
//! service down, close the replication queue, join the replicator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use async_io_mini::Timer;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use futures_lite::future;
use log::{debug, error, info, warn};

use crate::app::commands::{AppCommand, PerceptionFrame};
use crate::app::ports::{
    ActuatorPort, CameraPort, ClockPort, DetectorPort, EmotionClassifierPort, EventSink,
    LightSensorPort, LocalStorePort, RemoteStorePort, StorageError, WeatherPort,
};
use crate::app::service::AppService;
use crate::diagnostics::SessionStats;
use crate::error::{Error, SensorError};
use crate::perception::{Detection, Frame};
use crate::storage::record::{LightRow, Record, WeatherRow};
use crate::storage::replicator::{Replicator, ReplicatorStats};
use crate::storage::{DualWriter, RecordSink};

/// Depth of the coordinator inbox.
pub const INBOX_DEPTH: usize = 32;

/// Longest single sleep of a producer, so shutdown is noticed quickly.
const STOP_POLL: Duration = Duration::from_millis(100);

/// Held writes beyond which a retryable local failure becomes fatal.
pub const BACKLOG_LIMIT: usize = 1_024;

/// Coordinator inbox: many producers, one consumer.
pub type Inbox = Channel<CriticalSectionRawMutex, AppCommand, INBOX_DEPTH>;

pub fn new_inbox() -> Arc<Inbox> {
    Arc::new(Channel::new())
}

// ═══════════════════════════════════════════════════════════════
//  Shutdown signal
// ═══════════════════════════════════════════════════════════════

#[derive(Default)]
struct ShutdownState {
    requested: AtomicBool,
    fault: Mutex<Option<Error>>,
}

/// Cooperative stop flag shared by every thread.  A producer that hits a
/// local storage failure records it with [`fail`](Self::fail), which also
/// requests shutdown.
#[derive(Clone, Default)]
pub struct Shutdown(Arc<ShutdownState>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        if !self.0.requested.swap(true, Ordering::SeqCst) {
            info!("Scheduler: shutdown requested");
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.0.requested.load(Ordering::SeqCst)
    }

    /// Record a fatal failure and stop the pipeline.  The first failure
    /// wins.
    pub fn fail(&self, error: Error) {
        {
            let mut fault = self.0.fault.lock().unwrap_or_else(PoisonError::into_inner);
            if fault.is_none() {
                *fault = Some(error);
            }
        }
        self.trigger();
    }

    pub fn fault(&self) -> Option<Error> {
        self.0
            .fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Sleep up to `total`, waking early on shutdown.
fn sleep_unless_stopped(total: Duration, shutdown: &Shutdown) {
    let deadline = Instant::now() + total;
    while !shutdown.is_triggered() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(STOP_POLL));
    }
}

/// Async twin of [`sleep_unless_stopped`] for executor tasks.
async fn pause(total: Duration, shutdown: &Shutdown) {
    let deadline = Instant::now() + total;
    while !shutdown.is_triggered() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        Timer::after((deadline - now).min(STOP_POLL)).await;
    }
}

// ═══════════════════════════════════════════════════════════════
//  Vision loop
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VisionStats {
    pub frames: u64,
    /// Frames lost to a full inbox.
    pub dropped: u64,
    pub camera_failures: u64,
    pub model_failures: u64,
    /// Iterations that overran the frame budget.
    pub deadline_misses: u64,
    pub worst_frame_ms: u64,
    /// Camera reported the end of its stream.
    pub stream_ended: bool,
}

/// Camera and models for the vision thread.
pub struct VisionRig<Cam, Nd, Gd, Ec> {
    pub camera: Cam,
    pub narrow: Nd,
    pub general: Gd,
    pub classifier: Ec,
}

/// Capture → detect (narrow, general) → classify → hand to the
/// coordinator, paced to `fps`.  Returns when shutdown is requested or
/// the camera stream ends.
pub fn vision_loop<Cam, Nd, Gd, Ec>(
    mut rig: VisionRig<Cam, Nd, Gd, Ec>,
    inbox: &Inbox,
    fps: u32,
    shutdown: &Shutdown,
) -> VisionStats
where
    Cam: CameraPort,
    Nd: DetectorPort,
    Gd: DetectorPort,
    Ec: EmotionClassifierPort,
{
    let budget = Duration::from_secs(1) / fps.max(1);
    let mut stats = VisionStats::default();
    info!("Vision: started ({} fps, budget {:?})", fps, budget);

    while !shutdown.is_triggered() {
        let started = Instant::now();

        let frame = match rig.camera.capture() {
            Ok(frame) => frame,
            Err(SensorError::StreamEnded) => {
                info!("Vision: camera stream ended");
                stats.stream_ended = true;
                break;
            }
            Err(e) => {
                stats.camera_failures += 1;
                warn!("Vision: capture failed: {}", e);
                sleep_unless_stopped(budget, shutdown);
                continue;
            }
        };

        let narrow = detect_or_empty(&mut rig.narrow, &frame, &mut stats);
        let general = detect_or_empty(&mut rig.general, &frame, &mut stats);
        let emotion = match rig.classifier.classify(&frame) {
            Ok(sample) => sample,
            Err(e) => {
                stats.model_failures += 1;
                warn!("Vision: emotion classifier failed on frame {}: {}", frame.seq, e);
                None
            }
        };

        let cmd = AppCommand::Frame(PerceptionFrame {
            seq: frame.seq,
            captured_at: frame.captured_at,
            narrow,
            general,
            emotion,
        });
        stats.frames += 1;
        if inbox.try_send(cmd).is_err() {
            stats.dropped += 1;
            warn!("Vision: coordinator inbox full, frame {} dropped", frame.seq);
        }

        let elapsed = started.elapsed();
        stats.worst_frame_ms = stats.worst_frame_ms.max(elapsed.as_millis() as u64);
        if elapsed > budget {
            stats.deadline_misses += 1;
            debug!("Vision: frame {} overran budget ({:?})", frame.seq, elapsed);
        } else {
            sleep_unless_stopped(budget - elapsed, shutdown);
        }
    }

    info!(
        "Vision: stopped after {} frames ({} dropped, {} overruns, worst {}ms)",
        stats.frames, stats.dropped, stats.deadline_misses, stats.worst_frame_ms
    );
    stats
}

/// A failed detector contributes nothing to the frame.
fn detect_or_empty(detector: &mut impl DetectorPort, frame: &Frame, stats: &mut VisionStats) -> Vec<Detection> {
    match detector.detect(frame) {
        Ok(list) => list,
        Err(e) => {
            stats.model_failures += 1;
            warn!(
                "Vision: {} detector failed on frame {}: {}",
                detector.source().as_str(),
                frame.seq,
                e
            );
            Vec::new()
        }
    }
}

pub fn spawn_vision<Cam, Nd, Gd, Ec>(
    rig: VisionRig<Cam, Nd, Gd, Ec>,
    inbox: Arc<Inbox>,
    fps: u32,
    shutdown: Shutdown,
) -> std::io::Result<JoinHandle<VisionStats>>
where
    Cam: CameraPort + Send + 'static,
    Nd: DetectorPort + Send + 'static,
    Gd: DetectorPort + Send + 'static,
    Ec: EmotionClassifierPort + Send + 'static,
{
    thread::Builder::new()
        .name("vision".into())
        .spawn(move || vision_loop(rig, &inbox, fps, &shutdown))
}

// ═══════════════════════════════════════════════════════════════
//  Poller: emotion log tick + light sensor
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerStats {
    pub emotion_ticks: u64,
    pub light_samples: u64,
    pub light_failures: u64,
}

async fn emotion_tick_loop<C: ClockPort>(
    inbox: &Inbox,
    clock: &C,
    interval: Duration,
    shutdown: &Shutdown,
) -> u64 {
    let mut ticks = 0;
    loop {
        pause(interval, shutdown).await;
        if shutdown.is_triggered() {
            return ticks;
        }
        if inbox.try_send(AppCommand::LogEmotion { at: clock.now() }).is_ok() {
            ticks += 1;
        } else {
            warn!("Poller: coordinator inbox full, emotion log tick skipped");
        }
    }
}

async fn light_loop<S, L, C>(
    mut sensor: S,
    writer: DualWriter<L>,
    clock: &C,
    interval: Duration,
    shutdown: &Shutdown,
) -> (u64, u64)
where
    S: LightSensorPort,
    L: LocalStorePort,
    C: ClockPort,
{
    let (mut samples, mut failures) = (0, 0);
    loop {
        match sensor.read_lux() {
            Ok(lux) => {
                let row = LightRow {
                    timestamp: clock.now(),
                    lux,
                    sensor_type: sensor.sensor_type().to_owned(),
                };
                match writer.write(Record::Light(row)) {
                    Ok(_) => {
                        samples += 1;
                        debug!("Poller: light {:.1} lux logged", lux);
                    }
                    Err(StorageError::ConstraintViolation(why)) => {
                        failures += 1;
                        warn!("Poller: light reading rejected: {}", why);
                    }
                    Err(e) => {
                        error!("Poller: local write failed: {}", e);
                        shutdown.fail(e.into());
                        return (samples, failures);
                    }
                }
            }
            Err(e) => {
                failures += 1;
                warn!("Poller: light read failed: {}", e);
            }
        }
        pause(interval, shutdown).await;
        if shutdown.is_triggered() {
            return (samples, failures);
        }
    }
}

/// Run the emotion log timer and (optionally) the light poller as two
/// tasks on one `edge-executor` until shutdown.
pub fn poller_loop<S, L, C>(
    light: Option<S>,
    writer: DualWriter<L>,
    inbox: &Inbox,
    clock: &C,
    emotion_interval: Duration,
    light_interval: Duration,
    shutdown: &Shutdown,
) -> PollerStats
where
    S: LightSensorPort,
    L: LocalStorePort,
    C: ClockPort,
{
    let executor: edge_executor::LocalExecutor<'_, 4> = edge_executor::LocalExecutor::new();

    let emotion = executor.spawn(emotion_tick_loop(inbox, clock, emotion_interval, shutdown));
    let light = light.map(|sensor| {
        executor.spawn(light_loop(sensor, writer, clock, light_interval, shutdown))
    });

    info!("Poller: started (light sensor {})", if light.is_some() { "on" } else { "off" });

    let (emotion_ticks, (light_samples, light_failures)) = future::block_on(executor.run(async {
        let ticks = emotion.await;
        let light = match light {
            Some(task) => task.await,
            None => (0, 0),
        };
        (ticks, light)
    }));

    info!(
        "Poller: stopped ({} emotion ticks, {} light samples)",
        emotion_ticks, light_samples
    );
    PollerStats {
        emotion_ticks,
        light_samples,
        light_failures,
    }
}

#[allow(clippy::too_many_arguments)]
pub fn spawn_poller<S, L, C>(
    light: Option<S>,
    writer: DualWriter<L>,
    inbox: Arc<Inbox>,
    clock: C,
    emotion_interval: Duration,
    light_interval: Duration,
    shutdown: Shutdown,
) -> std::io::Result<JoinHandle<PollerStats>>
where
    S: LightSensorPort + Send + 'static,
    L: LocalStorePort + Send + 'static,
    C: ClockPort + Send + 'static,
{
    thread::Builder::new().name("poller".into()).spawn(move || {
        poller_loop(
            light,
            writer,
            &inbox,
            &clock,
            emotion_interval,
            light_interval,
            &shutdown,
        )
    })
}

// ═══════════════════════════════════════════════════════════════
//  Weather
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeatherStats {
    pub samples: u64,
    pub failures: u64,
}

/// Fetch immediately, then every `interval`.  Fetch failures are skipped
/// until the next interval.
pub fn weather_loop<W, L, C>(
    mut weather: W,
    writer: &DualWriter<L>,
    clock: &C,
    interval: Duration,
    shutdown: &Shutdown,
) -> WeatherStats
where
    W: WeatherPort,
    L: LocalStorePort,
    C: ClockPort,
{
    let mut stats = WeatherStats::default();
    while !shutdown.is_triggered() {
        match weather.fetch() {
            Ok(reading) => {
                let row = WeatherRow::from_reading(clock.now(), reading);
                info!(
                    "Weather: {} {:.1}C {:.0}% humidity",
                    row.condition, row.temperature_c, row.humidity_pct
                );
                match writer.write(Record::Weather(row)) {
                    Ok(_) => stats.samples += 1,
                    Err(StorageError::ConstraintViolation(why)) => {
                        stats.failures += 1;
                        warn!("Weather: reading rejected: {}", why);
                    }
                    Err(e) => {
                        error!("Weather: local write failed: {}", e);
                        shutdown.fail(e.into());
                        break;
                    }
                }
            }
            Err(e) => {
                stats.failures += 1;
                warn!("Weather: fetch failed: {}", e);
            }
        }
        sleep_unless_stopped(interval, shutdown);
    }
    stats
}

pub fn spawn_weather<W, L, C>(
    weather: W,
    writer: DualWriter<L>,
    clock: C,
    interval: Duration,
    shutdown: Shutdown,
) -> std::io::Result<JoinHandle<WeatherStats>>
where
    W: WeatherPort + Send + 'static,
    L: LocalStorePort + Send + 'static,
    C: ClockPort + Send + 'static,
{
    thread::Builder::new()
        .name("weather".into())
        .spawn(move || weather_loop(weather, &writer, &clock, interval, &shutdown))
}

// ═══════════════════════════════════════════════════════════════
//  Replicator
// ═══════════════════════════════════════════════════════════════

/// Recover unreplicated records, then run the replicator until its queue
/// is closed.
pub fn spawn_replicator<L, R, C>(
    mut replicator: Replicator<L, R>,
    clock: C,
) -> std::io::Result<JoinHandle<ReplicatorStats>>
where
    L: LocalStorePort + Send + 'static,
    R: RemoteStorePort + Send + 'static,
    C: ClockPort + Send + 'static,
{
    thread::Builder::new().name("replicator".into()).spawn(move || {
        replicator.recover(clock.now());
        replicator.run(&clock)
    })
}

// ═══════════════════════════════════════════════════════════════
//  Coordinator
// ═══════════════════════════════════════════════════════════════

/// The single consumer of the inbox.  Owns the [`AppService`] and the
/// actuator, so every domain state change happens on this thread.
pub struct Coordinator<A, S, K, C> {
    pub app: AppService,
    pub actuator: A,
    pub store: S,
    pub sink: K,
    pub clock: C,
    pub tick: Duration,
}

impl<A, S, K, C> Coordinator<A, S, K, C>
where
    A: ActuatorPort,
    S: RecordSink,
    K: EventSink,
    C: ClockPort,
{
    fn handle(&mut self, cmd: AppCommand) -> Result<(), StorageError> {
        let at = match &cmd {
            AppCommand::Frame(f) => f.captured_at,
            AppCommand::LogEmotion { at } => *at,
            _ => self.clock.now(),
        };
        let hour = Some(self.clock.local_hour(at));
        self.app
            .handle_command(cmd, hour, &mut self.actuator, &self.store, &mut self.sink)
    }

    /// Decide whether a local write failure stops the pipeline.  Retryable
    /// failures are held in the service backlog until it grows past
    /// [`BACKLOG_LIMIT`].
    fn escalate(&self, e: StorageError) -> crate::error::Result<()> {
        let backlog = self.app.backlog();
        let e = Error::from(e);
        if e.is_fatal() || backlog >= BACKLOG_LIMIT {
            error!("Coordinator: {} ({} write(s) held), stopping", e, backlog);
            return Err(e);
        }
        warn!("Coordinator: {} ({} write(s) held for retry)", e, backlog);
        Ok(())
    }

    /// Serve the inbox until shutdown is requested or a fatal error occurs.
    /// Housekeeping ticks run every `tick` regardless of traffic.
    pub fn run(&mut self, inbox: &Inbox, shutdown: &Shutdown) -> crate::error::Result<()> {
        self.app.start(self.clock.now(), &mut self.sink);
        let tick_ms = self.tick.as_millis() as u64;
        let mut next_tick = self.clock.now().saturating_add(tick_ms);

        while !shutdown.is_triggered() {
            let wait = Duration::from_millis(next_tick.saturating_sub(self.clock.now()))
                .min(STOP_POLL);
            let received = future::block_on(future::or(
                async { Some(inbox.receive().await) },
                async {
                    Timer::after(wait).await;
                    None
                },
            ));

            if let Some(cmd) = received {
                if matches!(cmd, AppCommand::Shutdown) {
                    shutdown.trigger();
                    break;
                }
                if let Err(e) = self.handle(cmd).or_else(|e| self.escalate(e)) {
                    shutdown.fail(e.clone());
                    return Err(e);
                }
            }

            let now = self.clock.now();
            if now >= next_tick {
                let ticked = self
                    .app
                    .tick(now, &mut self.actuator, &self.store, &mut self.sink);
                if let Err(e) = ticked.or_else(|e| self.escalate(e)) {
                    shutdown.fail(e.clone());
                    return Err(e);
                }
                next_tick = now.saturating_add(tick_ms);
            }
        }
        Ok(())
    }

    /// Handle whatever is still queued once the producers are joined, so
    /// in-flight frames are committed.  Stops at the first fatal error.
    pub fn drain(&mut self, inbox: &Inbox) -> crate::error::Result<usize> {
        let mut drained = 0;
        while let Ok(cmd) = inbox.try_receive() {
            if matches!(cmd, AppCommand::Shutdown) {
                continue;
            }
            self.handle(cmd).or_else(|e| self.escalate(e))?;
            drained += 1;
        }
        if drained > 0 {
            info!("Coordinator: drained {} queued command(s)", drained);
        }
        Ok(drained)
    }

    /// Give held writes a last try, then abandon backfills and rest the
    /// board.
    pub fn finish(&mut self) -> SessionStats {
        if let Err(e) = self.app.flush(&self.store, &mut self.sink) {
            warn!("Coordinator: final flush failed: {}", e);
        }
        self.app.shutdown(&mut self.actuator, &mut self.sink)
    }
}
