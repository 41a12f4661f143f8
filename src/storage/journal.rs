//! Append-only local journal: the durable local store.
//!
//! One JSON object per line.  Four operations are journaled:
//!
//! ```text
//! {"op":"insert","key":"…","record":{"table":"food_event_log","row":{…}}}
//! {"op":"backfill","key":"…","emotion_after":"neutral","emotion_trend":"Improved"}
//! {"op":"warning_retracted","key":"…"}
//! {"op":"replicated","key":"…","version":2}
//! ```
//!
//! The in-memory view (records, timestamp index, category index, pending
//! replication set) is rebuilt by replaying the file on open.  A torn final
//! line from a crash is skipped and fenced off with a newline before the
//! next append.  A failed append is cut back so it never glues itself onto
//! the next line.
//!
//! Once superseded lines dominate the file, [`FileJournal::compact`]
//! rewrites it as one `insert` (carrying the current version) plus at most
//! one `replicated` mark per record.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::Timestamp;
use crate::app::ports::{LocalStorePort, StorageError};
use crate::perception::FoodCategory;
use crate::perception::emotion::{EmotionLabel, EmotionTrend};
use crate::storage::record::{FoodEvent, Record, RecordKey, StoredRecord, Table};

/// Journals shorter than this are never compacted on open.
const COMPACT_MIN_LINES: usize = 4_096;

/// One journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalEntry {
    Insert {
        key: RecordKey,
        record: Record,
        /// Only written by compaction; fresh inserts are version 1.
        #[serde(default = "first_version", skip_serializing_if = "is_first_version")]
        version: u32,
    },
    Backfill {
        key: RecordKey,
        emotion_after: EmotionLabel,
        emotion_trend: EmotionTrend,
    },
    /// The board never acknowledged the warning recorded on the event.
    WarningRetracted {
        key: RecordKey,
    },
    Replicated {
        key: RecordKey,
        version: u32,
    },
}

const fn first_version() -> u32 {
    1
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_first_version(v: &u32) -> bool {
    *v == 1
}

/// Decode one journal line.
pub fn decode_line(line: &str) -> Result<JournalEntry, serde_json::Error> {
    serde_json::from_str(line)
}

// ───────────────────────────────────────────────────────────────
// In-memory view
// ───────────────────────────────────────────────────────────────

/// Indexed view of the journal contents.
#[derive(Debug, Default)]
struct JournalIndex {
    records: HashMap<RecordKey, StoredRecord>,
    /// Write sequence of every record.
    seqs: HashMap<RecordKey, u64>,
    /// Records whose current version is not on the remote, by write order.
    pending: BTreeMap<u64, RecordKey>,
    /// `(table, timestamp, seq)` → key.
    by_time: BTreeMap<(Table, Timestamp, u64), RecordKey>,
    by_category: HashMap<FoodCategory, Vec<RecordKey>>,
    next_seq: u64,
}

impl JournalIndex {
    /// Apply an entry.  Returns `false` if it was inapplicable (duplicate
    /// insert, unknown key, second backfill).
    fn apply(&mut self, entry: JournalEntry) -> bool {
        match entry {
            JournalEntry::Insert {
                key,
                record,
                version,
            } => {
                if version == 0 || self.records.contains_key(&key) {
                    return false;
                }
                let seq = self.next_seq;
                self.next_seq += 1;
                self.by_time
                    .insert((record.table(), record.timestamp(), seq), key);
                if let Some(event) = record.as_food_event() {
                    self.by_category.entry(event.category).or_default().push(key);
                }
                self.seqs.insert(key, seq);
                self.pending.insert(seq, key);
                self.records.insert(
                    key,
                    StoredRecord {
                        record,
                        version,
                        replicated_version: 0,
                    },
                );
                true
            }
            JournalEntry::Backfill {
                key,
                emotion_after,
                emotion_trend,
            } => {
                let applied = match self.records.get_mut(&key) {
                    Some(StoredRecord {
                        record: Record::FoodEvent(event),
                        version,
                        ..
                    }) if event.awaiting_backfill() => {
                        event.emotion_after = emotion_after;
                        event.emotion_trend = emotion_trend;
                        *version += 1;
                        true
                    }
                    _ => false,
                };
                applied && self.refresh(key)
            }
            JournalEntry::WarningRetracted { key } => {
                let applied = match self.records.get_mut(&key) {
                    Some(StoredRecord {
                        record: Record::FoodEvent(event),
                        version,
                        ..
                    }) if event.warning_triggered => {
                        event.warning_triggered = false;
                        *version += 1;
                        true
                    }
                    _ => false,
                };
                applied && self.refresh(key)
            }
            JournalEntry::Replicated { key, version } => match self.records.get_mut(&key) {
                Some(stored) => {
                    stored.replicated_version = stored.replicated_version.max(version);
                    self.refresh(key)
                }
                None => false,
            },
        }
    }

    /// Keep `pending` in step with the record's replication marks.
    fn refresh(&mut self, key: RecordKey) -> bool {
        let (Some(stored), Some(&seq)) = (self.records.get(&key), self.seqs.get(&key)) else {
            return false;
        };
        if stored.is_replicated() {
            self.pending.remove(&seq);
        } else {
            self.pending.insert(seq, key);
        }
        true
    }

    /// Minimal entry list reproducing the current state, in write order.
    fn snapshot(&self) -> Vec<JournalEntry> {
        let mut keys: Vec<(u64, RecordKey)> = self.seqs.iter().map(|(k, s)| (*s, *k)).collect();
        keys.sort_unstable_by_key(|(seq, _)| *seq);

        let mut entries = Vec::with_capacity(keys.len() * 2);
        for (_, key) in keys {
            let Some(stored) = self.records.get(&key) else {
                continue;
            };
            entries.push(JournalEntry::Insert {
                key,
                record: stored.record.clone(),
                version: stored.version,
            });
            if stored.replicated_version > 0 {
                entries.push(JournalEntry::Replicated {
                    key,
                    version: stored.replicated_version,
                });
            }
        }
        entries
    }
}

// ───────────────────────────────────────────────────────────────
// Append path
// ───────────────────────────────────────────────────────────────

/// What the journal needs from the file underneath it.
trait LogFile: Write {
    fn end(&mut self) -> io::Result<u64>;
    fn cut(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl LogFile for File {
    fn end(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn cut(&mut self, len: u64) -> io::Result<()> {
        // Opened with O_APPEND, so the next write lands at the new end.
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Append one complete line.  A write that fails part way is cut back to
/// the previous end of file; if even that fails, `torn` is set and the next
/// append starts with a fencing newline.
fn append_line<F: LogFile>(
    file: &mut F,
    line: &[u8],
    fsync: bool,
    torn: &mut bool,
) -> Result<(), StorageError> {
    if *torn {
        file.write_all(b"\n")
            .map_err(|e| StorageError::io("fence", &e))?;
        *torn = false;
    }
    let before = file.end().map_err(|e| StorageError::io("stat", &e))?;
    if let Err(e) = file.write_all(line) {
        if let Err(cut) = file.cut(before) {
            error!("Journal: could not cut back failed append: {}", cut);
            *torn = true;
        }
        return Err(StorageError::io("write", &e));
    }
    if fsync {
        file.sync().map_err(|e| StorageError::io("fsync", &e))?;
    }
    Ok(())
}

fn encode(entry: &JournalEntry) -> Result<Vec<u8>, StorageError> {
    let mut line = serde_json::to_vec(entry).map_err(|_| StorageError::Encode)?;
    line.push(b'\n');
    Ok(line)
}

// ───────────────────────────────────────────────────────────────
// File journal
// ───────────────────────────────────────────────────────────────

/// File-backed [`LocalStorePort`].
pub struct FileJournal {
    path: PathBuf,
    file: File,
    fsync: bool,
    index: JournalIndex,
    /// Non-empty lines currently in the file.
    lines: usize,
    /// Lines skipped during replay.
    skipped_lines: usize,
    /// The file may end in a fragment of a failed append.
    torn: bool,
}

impl FileJournal {
    /// Open (or create) the journal at `path` and replay it.
    pub fn open(path: impl AsRef<Path>, fsync: bool) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::io("create_dir", &e))?;
            }
        }

        let mut file = open_append(&path)?;
        let mut index = JournalIndex::default();
        let mut skipped_lines = 0;
        let mut lines = 0;

        {
            let reader = BufReader::new(&file);
            for (n, line) in reader.lines().enumerate() {
                let line = line.map_err(|e| StorageError::io("read", &e))?;
                if line.trim().is_empty() {
                    continue;
                }
                lines += 1;
                match decode_line(&line) {
                    Ok(entry) => {
                        if !index.apply(entry) {
                            warn!("Journal: line {} inapplicable, ignored", n + 1);
                        }
                    }
                    Err(e) => {
                        skipped_lines += 1;
                        warn!("Journal: line {} unreadable ({}), skipped", n + 1, e);
                    }
                }
            }
        }

        // Fence off a torn tail so the next entry starts on its own line.
        if ends_without_newline(&mut file)? {
            file.write_all(b"\n")
                .map_err(|e| StorageError::io("write", &e))?;
        }

        let mut journal = Self {
            path,
            file,
            fsync,
            index,
            lines,
            skipped_lines,
            torn: false,
        };

        if journal.lines >= COMPACT_MIN_LINES && journal.lines > 2 * journal.index.records.len() {
            journal.compact()?;
        }

        info!(
            "Journal: opened {} ({} lines, {} records, {} unreplicated)",
            journal.path.display(),
            journal.lines,
            journal.index.records.len(),
            journal.index.pending.len()
        );
        Ok(journal)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    /// Non-empty lines in the file, superseded ones included.
    pub fn line_count(&self) -> usize {
        self.lines
    }

    /// Rewrite the file with one line per record state, dropping superseded
    /// backfill, retraction and replication lines.  Returns the number of
    /// lines removed.
    ///
    /// The new file is written and synced beside the old one, then renamed
    /// over it, so a crash leaves one complete journal or the other.
    pub fn compact(&mut self) -> Result<usize, StorageError> {
        let entries = self.index.snapshot();
        let tmp = self.path.with_extension("compact");
        {
            let mut out = File::create(&tmp).map_err(|e| StorageError::io("create", &e))?;
            for entry in &entries {
                out.write_all(&encode(entry)?)
                    .map_err(|e| StorageError::io("write", &e))?;
            }
            out.sync_all().map_err(|e| StorageError::io("fsync", &e))?;
        }
        std::fs::rename(&tmp, &self.path).map_err(|e| StorageError::io("rename", &e))?;
        self.file = open_append(&self.path)?;
        self.torn = false;

        let removed = self.lines.saturating_sub(entries.len());
        info!(
            "Journal: compacted {} ({} -> {} lines)",
            self.path.display(),
            self.lines,
            entries.len()
        );
        self.lines = entries.len();
        self.skipped_lines = 0;
        Ok(removed)
    }

    /// Write one entry and make it durable, then apply it in memory.
    fn commit(&mut self, entry: JournalEntry) -> Result<(), StorageError> {
        let line = encode(&entry)?;
        append_line(&mut self.file, &line, self.fsync, &mut self.torn)?;
        self.lines += 1;
        self.index.apply(entry);
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File, StorageError> {
    OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .map_err(|e| StorageError::io("open", &e))
}

fn ends_without_newline(file: &mut File) -> Result<bool, StorageError> {
    let len = file
        .metadata()
        .map_err(|e| StorageError::io("stat", &e))?
        .len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))
        .map_err(|e| StorageError::io("seek", &e))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)
        .map_err(|e| StorageError::io("read", &e))?;
    Ok(last[0] != b'\n')
}

impl LocalStorePort for FileJournal {
    fn append(&mut self, key: RecordKey, record: &Record) -> Result<(), StorageError> {
        record.validate()?;
        if self.index.records.contains_key(&key) {
            return Err(StorageError::ConstraintViolation("duplicate record key"));
        }
        self.commit(JournalEntry::Insert {
            key,
            record: record.clone(),
            version: first_version(),
        })
    }

    fn backfill(
        &mut self,
        key: RecordKey,
        after: EmotionLabel,
        trend: EmotionTrend,
    ) -> Result<(), StorageError> {
        match self.index.records.get(&key) {
            None => return Err(StorageError::NotFound),
            Some(StoredRecord {
                record: Record::FoodEvent(e),
                ..
            }) if e.awaiting_backfill() => {}
            Some(_) => return Err(StorageError::NotBackfillable),
        }
        if after == EmotionLabel::Unknown && trend != EmotionTrend::Unknown {
            return Err(StorageError::ConstraintViolation(
                "emotion_trend requires emotion_after",
            ));
        }
        self.commit(JournalEntry::Backfill {
            key,
            emotion_after: after,
            emotion_trend: trend,
        })
    }

    fn retract_warning(&mut self, key: RecordKey) -> Result<(), StorageError> {
        match self.index.records.get(&key) {
            None => Err(StorageError::NotFound),
            Some(StoredRecord {
                record: Record::FoodEvent(e),
                ..
            }) if e.warning_triggered => self.commit(JournalEntry::WarningRetracted { key }),
            Some(_) => Ok(()),
        }
    }

    fn mark_replicated(&mut self, key: RecordKey, version: u32) -> Result<(), StorageError> {
        match self.index.records.get(&key) {
            None => Err(StorageError::NotFound),
            Some(stored) if stored.replicated_version >= version => Ok(()),
            Some(_) => self.commit(JournalEntry::Replicated { key, version }),
        }
    }

    fn get(&self, key: RecordKey) -> Option<StoredRecord> {
        self.index.records.get(&key).cloned()
    }

    fn unreplicated(&self) -> Vec<RecordKey> {
        self.index.pending.values().copied().collect()
    }

    fn range(&self, table: Table, from: Timestamp, to: Timestamp) -> Vec<(RecordKey, Record)> {
        if to <= from {
            return Vec::new();
        }
        self.index
            .by_time
            .range((table, from, 0)..(table, to, 0))
            .filter_map(|(_, key)| {
                self.index
                    .records
                    .get(key)
                    .map(|s| (*key, s.record.clone()))
            })
            .collect()
    }

    fn by_category(&self, category: FoodCategory) -> Vec<(RecordKey, FoodEvent)> {
        let mut events: Vec<(RecordKey, FoodEvent)> = self
            .index
            .by_category
            .get(&category)
            .into_iter()
            .flatten()
            .filter_map(|key| {
                self.index
                    .records
                    .get(key)
                    .and_then(|s| s.record.as_food_event())
                    .map(|e| (*key, *e))
            })
            .collect();
        events.sort_by_key(|(_, e)| e.timestamp);
        events
    }

    fn len(&self) -> usize {
        self.index.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::{DetectionSource, HealthTag};
    use crate::storage::record::{EmotionRow, LightRow};

    fn chip_at(t: Timestamp) -> Record {
        Record::FoodEvent(FoodEvent {
            timestamp: t,
            category: FoodCategory::Chip,
            health: HealthTag::Unhealthy,
            calories: 15,
            detection_confidence: 0.8,
            detection_source: DetectionSource::Narrow,
            emotion_before: EmotionLabel::Neutral,
            emotion_after: EmotionLabel::Unknown,
            emotion_trend: EmotionTrend::Unknown,
            warning_triggered: true,
        })
    }

    fn journal_in(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("smartsnack.journal")
    }

    /// In-memory file that accepts `budget` more bytes, then fails with
    /// the device full.
    struct FlakyFile {
        data: Vec<u8>,
        budget: usize,
        can_cut: bool,
    }

    impl FlakyFile {
        fn new(budget: usize) -> Self {
            Self {
                data: Vec::new(),
                budget,
                can_cut: true,
            }
        }

        fn lines(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.data)
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_owned)
                .collect()
        }
    }

    impl Write for FlakyFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero));
            }
            let n = buf.len().min(self.budget);
            self.data.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogFile for FlakyFile {
        fn end(&mut self) -> io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn cut(&mut self, len: u64) -> io::Result<()> {
            if !self.can_cut {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            self.data.truncate(len as usize);
            Ok(())
        }

        fn sync(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn insert_line(t: Timestamp) -> (RecordKey, Vec<u8>) {
        let key = RecordKey::generate();
        let line = encode(&JournalEntry::Insert {
            key,
            record: chip_at(t),
            version: 1,
        })
        .unwrap();
        (key, line)
    }

    #[test]
    fn append_then_reopen_replays() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_in(&dir);
        let k1 = RecordKey::generate();
        let k2 = RecordKey::generate();
        {
            let mut j = FileJournal::open(&path, true).unwrap();
            j.append(k1, &chip_at(1_000)).unwrap();
            j.append(
                k2,
                &Record::Emotion(EmotionRow {
                    timestamp: 2_000,
                    emotion_class: EmotionLabel::Positive,
                    confidence: 0.7,
                }),
            )
            .unwrap();
            j.backfill(k1, EmotionLabel::Positive, EmotionTrend::Improved)
                .unwrap();
            j.mark_replicated(k2, 1).unwrap();
        }
        let j = FileJournal::open(&path, true).unwrap();
        assert_eq!(j.len(), 2);
        let stored = j.get(k1).unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(
            stored.record.as_food_event().unwrap().emotion_trend,
            EmotionTrend::Improved
        );
        assert_eq!(j.unreplicated(), vec![k1]);
    }

    #[test]
    fn rejects_constraint_violations() {
        let dir = tempfile::tempdir().unwrap();
        let mut j = FileJournal::open(journal_in(&dir), false).unwrap();
        let bad = Record::Light(LightRow {
            timestamp: 0,
            lux: f32::NAN,
            sensor_type: "BH1750".into(),
        });
        assert!(matches!(
            j.append(RecordKey::generate(), &bad),
            Err(StorageError::ConstraintViolation(_))
        ));
        assert!(j.is_empty());
    }

    #[test]
    fn backfill_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut j = FileJournal::open(journal_in(&dir), false).unwrap();
        let k = RecordKey::generate();
        j.append(k, &chip_at(0)).unwrap();
        j.backfill(k, EmotionLabel::Neutral, EmotionTrend::Stable)
            .unwrap();
        assert_eq!(
            j.backfill(k, EmotionLabel::Positive, EmotionTrend::Improved),
            Err(StorageError::NotBackfillable)
        );
        assert_eq!(
            j.backfill(RecordKey::generate(), EmotionLabel::Positive, EmotionTrend::Improved),
            Err(StorageError::NotFound)
        );
    }

    #[test]
    fn retracted_warning_is_a_new_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_in(&dir);
        let k = RecordKey::generate();
        {
            let mut j = FileJournal::open(&path, true).unwrap();
            j.append(k, &chip_at(0)).unwrap();
            j.mark_replicated(k, 1).unwrap();
            j.retract_warning(k).unwrap();
            // Second retraction is a no-op.
            j.retract_warning(k).unwrap();
            assert_eq!(j.unreplicated(), vec![k]);
        }
        let j = FileJournal::open(&path, true).unwrap();
        let stored = j.get(k).unwrap();
        assert_eq!(stored.version, 2);
        assert!(!stored.record.as_food_event().unwrap().warning_triggered);
        assert_eq!(j.line_count(), 3);
    }

    #[test]
    fn stale_replication_mark_keeps_record_unreplicated() {
        let dir = tempfile::tempdir().unwrap();
        let mut j = FileJournal::open(journal_in(&dir), false).unwrap();
        let k = RecordKey::generate();
        j.append(k, &chip_at(0)).unwrap();
        j.backfill(k, EmotionLabel::Neutral, EmotionTrend::Stable)
            .unwrap();
        // Remote acked version 1, but version 2 exists locally.
        j.mark_replicated(k, 1).unwrap();
        assert_eq!(j.unreplicated(), vec![k]);
        j.mark_replicated(k, 2).unwrap();
        assert!(j.unreplicated().is_empty());
    }

    #[test]
    fn unreplicated_keeps_write_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut j = FileJournal::open(journal_in(&dir), false).unwrap();
        let keys: Vec<_> = (0..4).map(|_| RecordKey::generate()).collect();
        for (i, k) in keys.iter().enumerate() {
            j.append(*k, &chip_at(10_000 - i as u64)).unwrap();
        }
        j.mark_replicated(keys[1], 1).unwrap();
        assert_eq!(j.unreplicated(), vec![keys[0], keys[2], keys[3]]);
        // A backfill puts a replicated record back in line at its old place.
        j.backfill(keys[1], EmotionLabel::Neutral, EmotionTrend::Stable)
            .unwrap();
        assert_eq!(j.unreplicated(), keys);
    }

    #[test]
    fn torn_tail_is_skipped_and_fenced() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_in(&dir);
        let k = RecordKey::generate();
        {
            let mut j = FileJournal::open(&path, true).unwrap();
            j.append(k, &chip_at(0)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(br#"{"op":"insert","key":"#).unwrap();
        }
        let k2 = RecordKey::generate();
        {
            let mut j = FileJournal::open(&path, true).unwrap();
            assert_eq!(j.skipped_lines(), 1);
            j.append(k2, &chip_at(5)).unwrap();
        }
        let j = FileJournal::open(&path, true).unwrap();
        assert_eq!(j.len(), 2);
        assert_eq!(j.skipped_lines(), 1);
    }

    #[test]
    fn failed_append_is_cut_back() {
        let (_, first) = insert_line(0);
        let (_, second) = insert_line(1);
        let (key, third) = insert_line(2);

        let mut file = FlakyFile::new(first.len() + second.len() / 2);
        let mut torn = false;
        append_line(&mut file, &first, true, &mut torn).unwrap();
        assert!(matches!(
            append_line(&mut file, &second, true, &mut torn),
            Err(StorageError::Io { .. })
        ));
        assert!(!torn);
        assert_eq!(file.data, first);

        file.budget = usize::MAX;
        append_line(&mut file, &third, true, &mut torn).unwrap();
        let lines = file.lines();
        assert_eq!(lines.len(), 2);
        assert!(matches!(decode_line(&lines[1]), Ok(JournalEntry::Insert { key: k, .. }) if k == key));
    }

    #[test]
    fn uncuttable_fragment_is_fenced_before_next_append() {
        let (_, first) = insert_line(0);
        let (key, second) = insert_line(1);

        let mut file = FlakyFile::new(first.len() / 2);
        file.can_cut = false;
        let mut torn = false;
        assert!(append_line(&mut file, &first, true, &mut torn).is_err());
        assert!(torn);

        file.budget = usize::MAX;
        append_line(&mut file, &second, true, &mut torn).unwrap();
        assert!(!torn);
        let lines = file.lines();
        assert_eq!(lines.len(), 2);
        assert!(decode_line(&lines[0]).is_err());
        assert!(matches!(decode_line(&lines[1]), Ok(JournalEntry::Insert { key: k, .. }) if k == key));
    }

    #[test]
    fn compaction_keeps_state_and_drops_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_in(&dir);
        let keys: Vec<_> = (0..3).map(|_| RecordKey::generate()).collect();
        {
            let mut j = FileJournal::open(&path, true).unwrap();
            for (i, k) in keys.iter().enumerate() {
                j.append(*k, &chip_at(i as u64 * 1_000)).unwrap();
            }
            j.backfill(keys[0], EmotionLabel::Positive, EmotionTrend::Improved)
                .unwrap();
            j.mark_replicated(keys[0], 1).unwrap();
            j.mark_replicated(keys[0], 2).unwrap();
            j.mark_replicated(keys[1], 1).unwrap();
            j.retract_warning(keys[2]).unwrap();
            assert_eq!(j.line_count(), 8);

            assert_eq!(j.compact().unwrap(), 3);
            assert_eq!(j.line_count(), 5);
            // Still appendable after the rename.
            j.append(RecordKey::generate(), &chip_at(9_000)).unwrap();
        }
        let j = FileJournal::open(&path, true).unwrap();
        assert_eq!(j.len(), 4);
        assert_eq!(j.line_count(), 6);
        let first = j.get(keys[0]).unwrap();
        assert_eq!((first.version, first.replicated_version), (2, 2));
        assert_eq!(
            first.record.as_food_event().unwrap().emotion_after,
            EmotionLabel::Positive
        );
        let third = j.get(keys[2]).unwrap();
        assert_eq!(third.version, 2);
        assert!(!third.record.as_food_event().unwrap().warning_triggered);
        assert_eq!(j.unreplicated()[0], keys[2]);
        assert_eq!(j.unreplicated().len(), 2);
    }

    #[test]
    fn indices_by_time_and_category() {
        let dir = tempfile::tempdir().unwrap();
        let mut j = FileJournal::open(journal_in(&dir), false).unwrap();
        for t in [3_000, 1_000, 2_000] {
            j.append(RecordKey::generate(), &chip_at(t)).unwrap();
        }
        let in_range = j.range(Table::FoodEventLog, 1_000, 3_000);
        let stamps: Vec<_> = in_range.iter().map(|(_, r)| r.timestamp()).collect();
        assert_eq!(stamps, vec![1_000, 2_000]);
        assert!(j.range(Table::EmotionLog, 0, 10_000).is_empty());

        let chips = j.by_category(FoodCategory::Chip);
        let stamps: Vec<_> = chips.iter().map(|(_, e)| e.timestamp).collect();
        assert_eq!(stamps, vec![1_000, 2_000, 3_000]);
        assert!(j.by_category(FoodCategory::Apple).is_empty());
    }
}
