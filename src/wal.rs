use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Anything larger is treated as a corrupt length prefix.
const MAX_RECORD_LEN: usize = 1 << 20;

/// Write one record: `[u32 le: len][bincode: Event][u32 le: crc32(payload)]`.
fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Outcome of reading one record during replay.
enum Record {
    Event(Event),
    /// Clean end of file, or a torn or corrupt tail. Replay stops here.
    End,
}

/// Read `buf.len()` bytes, mapping a short read to `None`.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<Option<()>> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(Some(())),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

fn read_record(reader: &mut impl Read) -> io::Result<Record> {
    let mut len_buf = [0u8; 4];
    if read_exact_or_eof(reader, &mut len_buf)?.is_none() {
        return Ok(Record::End);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        warn!("WAL record claims {len} bytes, discarding tail");
        return Ok(Record::End);
    }
    let mut payload = vec![0u8; len];
    if read_exact_or_eof(reader, &mut payload)?.is_none() {
        return Ok(Record::End);
    }
    let mut crc_buf = [0u8; 4];
    if read_exact_or_eof(reader, &mut crc_buf)?.is_none() {
        return Ok(Record::End);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        warn!("WAL record with bad checksum, discarding tail");
        return Ok(Record::End);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Record::Event(event)),
        Err(e) => {
            warn!("undecodable WAL record ({e}), discarding tail");
            Ok(Record::End)
        }
    }
}

/// Append-only event log of one tenant.
///
/// A crash can leave a torn last record; the length prefix and checksum let
/// replay drop it without losing anything before it. A failed flush rolls the
/// file back to its last acknowledged length, so rejected events never reach
/// disk later.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Encoded records not yet written.
    pending: Vec<u8>,
    pending_events: u64,
    /// File length covering only acknowledged records.
    committed_len: u64,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path` for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            pending: Vec::new(),
            pending_events: 0,
            committed_len,
            appends_since_compact: 0,
        })
    }

    /// Append and fsync a single event. The engine batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without syncing. Durable only after `flush_sync`.
    /// A record that fails to encode leaves the buffer untouched.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        let mut record = Vec::new();
        encode_record(&mut record, event)?;
        self.pending.extend_from_slice(&record);
        self.pending_events += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Write and fsync everything buffered. On failure the buffer is dropped
    /// and the file is truncated back to its acknowledged length.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let written = self
            .file
            .write_all(&self.pending)
            .and_then(|()| self.file.sync_all());
        match written {
            Ok(()) => {
                self.committed_len += self.pending.len() as u64;
                self.pending.clear();
                self.pending_events = 0;
                Ok(())
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    /// Forget buffered events and cut off anything written after the last
    /// acknowledged record.
    pub fn rollback(&mut self) {
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending_events);
        self.pending.clear();
        self.pending_events = 0;
        let truncated = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .and_then(|f| f.set_len(self.committed_len).and_then(|()| f.sync_all()));
        if let Err(e) = truncated {
            warn!(
                "cannot truncate WAL {} back to {} bytes: {e}",
                self.path.display(),
                self.committed_len
            );
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted event set next to the WAL and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            encode_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the WAL and continue appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.file = file;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// All intact events in file order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Record::Event(event) = read_record(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;
    use tempfile::TempDir;
    use ulid::Ulid;

    fn booked(owner: &str, start: i64, end: i64) -> Event {
        Event::ReservationCreated {
            id: Ulid::new(),
            owner_id: owner.into(),
            span: Span::new(start, end),
            created_at: 0,
        }
    }

    #[test]
    fn append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("room.wal");

        let events = vec![
            Event::ProfileCreated {
                id: "anna".into(),
                created_at: 1,
            },
            booked("anna", 1000, 2000),
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("torn.wal");
        let first = booked("anna", 0, 10);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            // length prefix claims 200 bytes, only 3 follow
            f.write_all(&200u32.to_le_bytes()).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(Wal::replay(&dir.path().join("absent.wal")).unwrap().is_empty());
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("crc.wal");
        let good = booked("anna", 0, 10);
        let bad = Event::ReservationDeleted { id: Ulid::new() };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        // the record after the corrupt one is never reached either
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&booked("bert", 20, 30)).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn compaction_shrinks_and_keeps_appending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("compact.wal");

        let keep = booked("anna", 0, 10);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&keep).unwrap();
            // churn: book and cancel repeatedly
            for i in 0..20 {
                let id = Ulid::new();
                wal.append(&Event::ReservationCreated {
                    id,
                    owner_id: "bert".into(),
                    span: Span::new(100 + i, 200 + i),
                    created_at: 0,
                })
                .unwrap();
                wal.append(&Event::ReservationDeleted { id }).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 41);
        }
        let before = fs::metadata(&path).unwrap().len();

        let later = booked("carla", 50, 60);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(std::slice::from_ref(&keep)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&later).unwrap();
        }
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![keep, later]);
        assert!(!Wal::compact_path(&path).exists());
    }

    #[test]
    fn buffered_appends_need_flush() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buffered.wal");
        let events: Vec<Event> = (0..5).map(|i| booked("anna", i * 10, i * 10 + 5)).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            assert!(Wal::replay(&path).unwrap().is_empty());
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn failed_flush_never_reaches_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("failing.wal");
        let first = booked("anna", 0, 10);
        let rejected = booked("bert", 20, 30);
        let later = booked("carla", 20, 30);

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&first).unwrap();
        let acknowledged = fs::metadata(&path).unwrap().len();

        // A read-only handle makes the next write fail, and stray bytes stand
        // in for a record that was only partly written.
        wal.file = File::open(&path).unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7, 7, 7]).unwrap();
        }
        wal.append_buffered(&rejected).unwrap();
        assert!(wal.flush_sync().is_err());
        assert_eq!(wal.appends_since_compact(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), acknowledged);

        wal.file = OpenOptions::new().append(true).open(&path).unwrap();
        wal.append(&later).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, later]);
    }

    #[test]
    fn rollback_drops_a_partial_batch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.wal");
        let mut wal = Wal::open(&path).unwrap();

        wal.append_buffered(&booked("anna", 0, 10)).unwrap();
        wal.rollback();
        wal.flush_sync().unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }
}
