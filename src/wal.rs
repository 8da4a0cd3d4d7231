use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Commit;

/// Frame one commit as `[len][bincode][crc32]`.
fn encode_commit(writer: &mut impl Write, commit: &Commit) -> io::Result<()> {
    let payload =
        bincode::serialize(commit).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "commit too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read the next framed commit. `Ok(None)` on clean EOF, a torn tail, or a
/// checksum/decoding failure: everything from that point on is discarded.
fn decode_next(reader: &mut impl Read) -> io::Result<Option<Commit>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Commit>(&payload).ok())
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only log of committed transactions.
///
/// Each entry is one [`Commit`], so a transaction's events are durable
/// together or not at all: a crash mid-write leaves a torn tail that replay
/// drops as a unit.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, commit: &Commit) -> io::Result<()> {
        self.append_buffered(commit)?;
        self.flush_sync()
    }

    /// Buffer a commit. Not durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, commit: &Commit) -> io::Result<()> {
        encode_commit(&mut self.writer, commit)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to `<wal>.tmp` and fsync it.
    pub fn write_compact_file(path: &Path, snapshot: &[Commit]) -> io::Result<()> {
        let file = File::create(path.with_extension("wal.tmp"))?;
        let mut writer = BufWriter::new(file);
        for commit in snapshot {
            encode_commit(&mut writer, commit)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(self.path.with_extension("wal.tmp"), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, snapshot: &[Commit]) -> io::Result<()> {
        Self::write_compact_file(&self.path, snapshot)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// All intact commits in log order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Commit>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut commits = Vec::new();
        while let Some(commit) = decode_next(&mut reader)? {
            commits.push(commit);
        }
        Ok(commits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("stallbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn unit_commit(unit_id: Ulid) -> Commit {
        let rates = Rates { daily: 100, weekly: None, monthly: None };
        Commit {
            events: vec![Event::UnitRegistered {
                unit: RentalUnit::new(unit_id, Ulid::new(), "B-07", rates),
            }],
        }
    }

    fn status_commit(unit_id: Ulid, status: UnitStatus) -> Commit {
        Commit {
            events: vec![Event::UnitStatusChanged {
                unit_id,
                status,
                reserved_to: None,
                reservation_expires_at: None,
            }],
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let uid = Ulid::new();
        let commits = vec![unit_commit(uid), status_commit(uid, UnitStatus::Maintenance)];
        {
            let mut wal = Wal::open(&path).unwrap();
            for c in &commits {
                wal.append(c).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), commits);
    }

    #[test]
    fn torn_tail_drops_the_whole_commit() {
        let path = tmp_path("torn_tail.wal");
        let uid = Ulid::new();
        let first = unit_commit(uid);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        // Half of a second frame: a length prefix and a few payload bytes.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&64u32.to_le_bytes()).unwrap();
            f.write_all(&[7u8; 10]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let payload = bincode::serialize(&unit_commit(Ulid::new())).unwrap();
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let uid = Ulid::new();
        let registered = unit_commit(uid);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&registered).unwrap();
            for _ in 0..10 {
                wal.append(&status_commit(uid, UnitStatus::Maintenance)).unwrap();
                wal.append(&status_commit(uid, UnitStatus::Available)).unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let booked = status_commit(uid, UnitStatus::Booked);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(std::slice::from_ref(&registered)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&booked).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted log should shrink: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![registered, booked]);
    }

    #[test]
    fn buffered_appends_are_counted() {
        let path = tmp_path("buffered.wal");
        let commits: Vec<Commit> = (0..5).map(|_| unit_commit(Ulid::new())).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for c in &commits {
                wal.append_buffered(c).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), commits);
    }
}
