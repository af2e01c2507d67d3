use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Larger length prefixes are treated as damage, not allocated.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Bytes a frame adds around its payload: length prefix and checksum.
const FRAME_OVERHEAD: u64 = 8;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`, little endian.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

enum Frame {
    Event(Event),
    End,
    /// A damaged tail, usually a write cut short by a crash.
    Torn(&'static str),
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut word = [0u8; 4];
    if !read_exact_or_eof(reader, &mut word)? {
        return Ok(Frame::End);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(Frame::Torn("implausible frame length"));
    }
    let mut payload = vec![0u8; len];
    if !read_exact_or_eof(reader, &mut payload)? {
        return Ok(Frame::Torn("truncated payload"));
    }
    if !read_exact_or_eof(reader, &mut word)? {
        return Ok(Frame::Torn("truncated checksum"));
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(Frame::Torn("checksum mismatch"));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Frame::Event(event)),
        Err(_) => Ok(Frame::Torn("undecodable payload")),
    }
}

/// Append-only log of schedule events.
///
/// Appends go through a `BufWriter`; nothing is durable until `flush_sync`.
/// The file never holds bytes past `committed_len` once a flush fails or a
/// damaged tail is recovered, so later appends stay reachable on replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length after the last successful `flush_sync`.
    committed_len: u64,
    appends_since_compact: u64,
    /// Appends buffered since the last successful `flush_sync`.
    uncommitted: u64,
}

/// Intact events of a log file and where they end.
struct Scan {
    events: Vec<Event>,
    valid_len: u64,
    torn: Option<&'static str>,
}

impl Wal {
    /// Open the log for appending. Call `recover` first on a log that may
    /// end in a damaged frame.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            committed_len,
            appends_since_compact: 0,
            uncommitted: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        self.uncommitted += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.sync_all()?;
        self.committed_len = file.metadata()?.len();
        self.uncommitted = 0;
        Ok(())
    }

    /// Drop everything appended since the last successful `flush_sync`,
    /// both still buffered and already written.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // Discard the buffer without writing it out.
        let _ = stale.into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.committed_len)?;
        file.sync_all()?;
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.uncommitted);
        self.uncommitted = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a snapshot of the current state next to the log and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and reopen it for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.uncommitted = 0;
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

    fn scan(path: &Path) -> io::Result<Scan> {
        let mut scan = Scan {
            events: Vec::new(),
            valid_len: 0,
            torn: None,
        };
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(scan),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        loop {
            match read_frame(&mut reader)? {
                Frame::Event(event) => {
                    let payload_len = bincode::serialized_size(&event)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    scan.valid_len += payload_len + FRAME_OVERHEAD;
                    scan.events.push(event);
                }
                Frame::End => break,
                Frame::Torn(reason) => {
                    scan.torn = Some(reason);
                    break;
                }
            }
        }
        Ok(scan)
    }

    /// Read every intact event without touching the file. A missing file is
    /// an empty log.
    #[cfg(test)]
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::scan(path)?.events)
    }

    /// Read every intact event and cut the file back to the end of the last
    /// one, so appends made after a crash follow intact frames.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let scan = Self::scan(path)?;
        if let Some(reason) = scan.torn {
            let file = OpenOptions::new().write(true).open(path)?;
            let damaged = file.metadata()?.len() - scan.valid_len;
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
            tracing::warn!(
                path = %path.display(),
                recovered = scan.events.len(),
                discarded_bytes = damaged,
                "truncated damaged WAL tail: {reason}"
            );
        }
        Ok(scan.events)
    }
}
