//! Feedback board adapter: line protocol over a serial device.
//!
//! The board understands newline-terminated ASCII commands and answers
//! each with exactly one line:
//!
//! | Command       | Reply          |
//! |---------------|----------------|
//! | `LED_ON`      | `OK`           |
//! | `LED_OFF`     | `OK`           |
//! | `SERVO_SHAKE` | `OK`           |
//! | `SERVO_NOD`   | `OK`           |
//! | `SERVO_RESET` | `OK`           |
//! | `READ_LIGHT`  | lux as decimal |
//! | `PING`        | `PONG`         |
//!
//! The same board drives the servo and LED and hosts the light sensor, so
//! [`SerialBoard`] is a cheap clonable handle over one shared link: the
//! coordinator owns one clone as its [`ActuatorPort`], the poller thread
//! another as its [`LightSensorPort`].  The mutex keeps request/reply
//! pairs from interleaving.
//!
//! A reader thread splits incoming bytes into lines.  A request discards
//! any line already waiting (a reply that arrived after its deadline) and
//! then waits at most the reply timeout for the answer.
//!
//! Line settings (baud rate, raw mode) are configured on the device
//! outside the process.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::app::ports::{ActuatorCommand, ActuatorPort, LightSensorPort};
use crate::error::{ActuatorError, SensorError};

/// Longest reply line accepted before the link is considered garbled.
const MAX_REPLY: usize = 64;

const ACK: &str = "OK";

fn wire_command(command: ActuatorCommand) -> &'static str {
    match command {
        ActuatorCommand::Shake => "SERVO_SHAKE",
        ActuatorCommand::Nod => "SERVO_NOD",
        ActuatorCommand::Reset => "SERVO_RESET",
        ActuatorCommand::LedOn => "LED_ON",
        ActuatorCommand::LedOff => "LED_OFF",
    }
}

// ───────────────────────────────────────────────────────────────
// Reader thread
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Incoming {
    Line(String),
    /// A line longer than [`MAX_REPLY`]; its bytes were dropped.
    TooLong,
}

/// Read lines from `io` until EOF or a hard error, forwarding each one.
fn pump_lines(mut io: impl Read, lines: Sender<Incoming>) {
    let mut line = Vec::with_capacity(16);
    let mut overflow = false;
    let mut buf = [0u8; 64];
    loop {
        let n = match io.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("SerialBoard: read failed: {}", e);
                break;
            }
        };
        for &byte in &buf[..n] {
            if byte == b'\n' {
                let incoming = if overflow {
                    Incoming::TooLong
                } else {
                    Incoming::Line(String::from_utf8_lossy(&line).trim().to_string())
                };
                line.clear();
                overflow = false;
                if lines.send(incoming).is_err() {
                    return;
                }
            } else if line.len() >= MAX_REPLY {
                overflow = true;
            } else {
                line.push(byte);
            }
        }
    }
    debug!("SerialBoard: link closed");
}

// ───────────────────────────────────────────────────────────────
// Line link
// ───────────────────────────────────────────────────────────────

#[derive(Debug)]
enum LinkError {
    Write(io::Error),
    /// Deadline passed, or the link closed, before a reply line.
    NoReply,
    TooLong,
}

struct LineLink<W> {
    out: W,
    replies: Receiver<Incoming>,
    timeout: Duration,
}

impl<W: Write> LineLink<W> {
    fn request(&mut self, command: &str) -> Result<String, LinkError> {
        let stale = self.replies.try_iter().count();
        if stale > 0 {
            debug!("SerialBoard: dropped {} stale line(s) before {}", stale, command);
        }
        self.out
            .write_all(command.as_bytes())
            .and_then(|()| self.out.write_all(b"\n"))
            .and_then(|()| self.out.flush())
            .map_err(LinkError::Write)?;
        match self.replies.recv_timeout(self.timeout) {
            Ok(Incoming::Line(line)) => Ok(line),
            Ok(Incoming::TooLong) => Err(LinkError::TooLong),
            Err(_) => Err(LinkError::NoReply),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Board handle
// ───────────────────────────────────────────────────────────────

/// Shared handle to the feedback board.  Implements both
/// [`ActuatorPort`] and [`LightSensorPort`].
pub struct SerialBoard<W> {
    link: Arc<Mutex<LineLink<W>>>,
    sensor_type: String,
}

impl<W> Clone for SerialBoard<W> {
    fn clone(&self) -> Self {
        Self {
            link: Arc::clone(&self.link),
            sensor_type: self.sensor_type.clone(),
        }
    }
}

impl SerialBoard<File> {
    /// Open the serial device read/write.
    pub fn open(device: &str, sensor_type: &str, reply_timeout: Duration) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(device)?;
        let reader = file.try_clone()?;
        info!(
            "SerialBoard: opened {} (reply timeout {}ms)",
            device,
            reply_timeout.as_millis()
        );
        Self::new(reader, file, sensor_type, reply_timeout)
    }
}

impl<W: Write> SerialBoard<W> {
    /// Start the reader thread over `reader` and send commands on `writer`.
    pub fn new<R>(reader: R, writer: W, sensor_type: &str, reply_timeout: Duration) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("serial-rx".into())
            .spawn(move || pump_lines(reader, tx))?;
        Ok(Self {
            link: Arc::new(Mutex::new(LineLink {
                out: writer,
                replies: rx,
                timeout: reply_timeout,
            })),
            sensor_type: sensor_type.to_string(),
        })
    }

    fn request(&self, command: &str) -> Result<String, LinkError> {
        let mut link = self.link.lock().map_err(|_| LinkError::NoReply)?;
        link.request(command)
    }

    /// Round-trip a `PING`.  `true` when the board answered `PONG`.
    pub fn ping(&self) -> bool {
        matches!(self.request("PING"), Ok(reply) if reply == "PONG")
    }
}

impl<W: Write> ActuatorPort for SerialBoard<W> {
    fn send(&mut self, command: ActuatorCommand) -> Result<(), ActuatorError> {
        match self.request(wire_command(command)) {
            Ok(reply) if reply == ACK => Ok(()),
            Ok(reply) => {
                warn!("SerialBoard: {} answered {:?}", command.as_str(), reply);
                Err(ActuatorError::UnexpectedReply)
            }
            Err(LinkError::Write(e)) => {
                warn!("SerialBoard: {} write failed: {}", command.as_str(), e);
                Err(ActuatorError::WriteFailed)
            }
            Err(LinkError::TooLong) => Err(ActuatorError::UnexpectedReply),
            Err(LinkError::NoReply) => {
                warn!("SerialBoard: no reply to {}", command.as_str());
                Err(ActuatorError::NoAck)
            }
        }
    }
}

impl<W: Write> LightSensorPort for SerialBoard<W> {
    fn read_lux(&mut self) -> Result<f32, SensorError> {
        let reply = self.request("READ_LIGHT").map_err(|e| match e {
            LinkError::TooLong => SensorError::Malformed,
            LinkError::Write(_) | LinkError::NoReply => SensorError::ReadFailed,
        })?;
        let lux: f32 = reply.parse().map_err(|_| SensorError::Malformed)?;
        if !lux.is_finite() || lux < 0.0 {
            return Err(SensorError::OutOfRange);
        }
        Ok(lux)
    }

    fn sensor_type(&self) -> &str {
        &self.sensor_type
    }
}

// ───────────────────────────────────────────────────────────────
// No board
// ───────────────────────────────────────────────────────────────

/// Stand-in when no board is configured.  Every actuation fails with
/// [`ActuatorError::Disconnected`] so events still record
/// `warning_triggered = false`; light reads are unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedBoard;

impl ActuatorPort for DetachedBoard {
    fn send(&mut self, _command: ActuatorCommand) -> Result<(), ActuatorError> {
        Err(ActuatorError::Disconnected)
    }
}

impl LightSensorPort for DetachedBoard {
    fn read_lux(&mut self) -> Result<f32, SensorError> {
        Err(SensorError::Unavailable)
    }

    fn sensor_type(&self) -> &str {
        "none"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Instant;

    const PATIENT: Duration = Duration::from_secs(2);

    /// Read side of an in-memory wire.
    struct Pipe {
        chunks: Receiver<Vec<u8>>,
        pending: VecDeque<u8>,
    }

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                match self.chunks.recv() {
                    Ok(chunk) => self.pending.extend(chunk),
                    Err(_) => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len());
            for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    /// Board stand-in: answers each flushed command with the next scripted
    /// reply (an empty string means no answer).  Everything written is
    /// captured.
    struct Bench {
        script: VecDeque<String>,
        wire: Sender<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Write for Bench {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            if let Some(reply) = self.script.pop_front().filter(|r| !r.is_empty()) {
                let _ = self.wire.send(reply.as_bytes().to_vec());
            }
            Ok(())
        }
    }

    fn bench(script: &[&str], timeout: Duration) -> SerialBoard<Bench> {
        let (wire, chunks) = mpsc::channel();
        let pipe = Pipe {
            chunks,
            pending: VecDeque::new(),
        };
        let out = Bench {
            script: script.iter().map(|r| r.to_string()).collect(),
            wire,
            written: Vec::new(),
        };
        SerialBoard::new(pipe, out, "BH1750", timeout).unwrap()
    }

    fn written(board: &SerialBoard<Bench>) -> String {
        String::from_utf8(board.link.lock().unwrap().out.written.clone()).unwrap()
    }

    /// A read that blocks until the test drops the sender.
    struct Stuck(Receiver<()>);

    impl Read for Stuck {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    #[test]
    fn commands_go_out_as_lines() {
        let mut board = bench(&["OK\r\n", "OK\n"], PATIENT);
        board.send(ActuatorCommand::LedOn).unwrap();
        board.send(ActuatorCommand::Shake).unwrap();
        assert_eq!(written(&board), "LED_ON\nSERVO_SHAKE\n");
    }

    #[test]
    fn missing_reply_is_no_ack() {
        let mut board = bench(&[""], Duration::from_millis(50));
        assert_eq!(board.send(ActuatorCommand::Nod), Err(ActuatorError::NoAck));
    }

    #[test]
    fn silent_device_times_out_instead_of_blocking() {
        let (_hold, never) = mpsc::channel();
        let mut board =
            SerialBoard::new(Stuck(never), io::sink(), "BH1750", Duration::from_millis(50)).unwrap();
        let started = Instant::now();
        assert_eq!(board.send(ActuatorCommand::Shake), Err(ActuatorError::NoAck));
        assert_eq!(board.read_lux(), Err(SensorError::ReadFailed));
        assert!(started.elapsed() < PATIENT);
    }

    #[test]
    fn late_reply_is_not_taken_for_the_next_answer() {
        let (tx, rx) = mpsc::channel();
        let mut link = LineLink {
            out: Vec::new(),
            replies: rx,
            timeout: Duration::from_millis(20),
        };
        assert!(matches!(link.request("LED_ON"), Err(LinkError::NoReply)));

        // The ack for LED_ON arrives after its deadline.
        tx.send(Incoming::Line("OK".into())).unwrap();
        assert!(matches!(link.request("READ_LIGHT"), Err(LinkError::NoReply)));
        assert_eq!(link.out, b"LED_ON\nREAD_LIGHT\n");
    }

    #[test]
    fn stale_line_is_dropped_before_the_real_reply() {
        let mut board = bench(&["", "312.5\n"], Duration::from_millis(50));
        assert_eq!(board.send(ActuatorCommand::LedOn), Err(ActuatorError::NoAck));
        // The ack for LED_ON shows up after its deadline.
        board
            .link
            .lock()
            .unwrap()
            .out
            .wire
            .send(b"OK\n".to_vec())
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(board.read_lux(), Ok(312.5));
    }

    #[test]
    fn wrong_reply_is_unexpected() {
        let mut board = bench(&["ERR\n"], PATIENT);
        assert_eq!(
            board.send(ActuatorCommand::Reset),
            Err(ActuatorError::UnexpectedReply)
        );
    }

    #[test]
    fn light_reading_parses_float() {
        let mut board = bench(&["312.5\n"], PATIENT);
        assert_eq!(board.read_lux(), Ok(312.5));
        assert_eq!(board.sensor_type(), "BH1750");
        assert_eq!(written(&board), "READ_LIGHT\n");
    }

    #[test]
    fn light_reading_rejects_garbage_and_negatives() {
        let mut board = bench(&["bright\n", "-4\n"], PATIENT);
        assert_eq!(board.read_lux(), Err(SensorError::Malformed));
        assert_eq!(board.read_lux(), Err(SensorError::OutOfRange));
    }

    #[test]
    fn overlong_reply_is_rejected_and_link_recovers() {
        let long = format!("{}\n", "x".repeat(MAX_REPLY + 1));
        let mut board = bench(&[&long, "OK\n"], PATIENT);
        assert_eq!(
            board.send(ActuatorCommand::LedOff),
            Err(ActuatorError::UnexpectedReply)
        );
        assert_eq!(board.send(ActuatorCommand::LedOff), Ok(()));
    }

    #[test]
    fn clones_share_one_link() {
        let board = bench(&["OK\n", "42\n"], PATIENT);
        let mut actuator = board.clone();
        let mut sensor = board.clone();
        actuator.send(ActuatorCommand::LedOn).unwrap();
        assert_eq!(sensor.read_lux(), Ok(42.0));
        assert_eq!(written(&board), "LED_ON\nREAD_LIGHT\n");
    }

    #[test]
    fn ping_expects_pong() {
        assert!(bench(&["PONG\n"], PATIENT).ping());
        assert!(!bench(&["OK\n"], PATIENT).ping());
    }

    #[test]
    fn detached_board_fails_everything() {
        let mut board = DetachedBoard;
        assert_eq!(
            board.send(ActuatorCommand::Shake),
            Err(ActuatorError::Disconnected)
        );
        assert_eq!(board.read_lux(), Err(SensorError::Unavailable));
    }
}
