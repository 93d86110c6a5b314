//! The per-user write-ahead log (`spec.md` §4.1): durability and crash
//! recovery for one user's [`Tree`](crate::tree::Tree).
//!
//! The on-disk framing is hand-rolled (varints + a running checksum) the
//! way `backpak::index`/`backpak::pack` hand-roll their magic-bytes-plus-
//! length-prefixed framing, but the checksum itself follows
//! `backpak::hashing::HashingWriter`/`HashingReader`'s "wrap a `Read`/
//! `Write` and fold a running digest as bytes pass through" shape — here
//! folding a 4-byte running value instead of driving a `Sha224`.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use camino::{Utf8Path, Utf8PathBuf};
use lazy_static::lazy_static;
use serde_derive::{Deserialize, Serialize};

use crate::entry::DirEntry;
use crate::error::{DirError, Kind};

const VERSION_MAGIC: &[u8; 8] = b"UPDRWAL\x01";
const INDEX_MAGIC: &[u8; 8] = b"UPDRIDX\x01";
const FILE_PREFIX: &str = "clog.";

/// Rotate once the current file exceeds this fraction of the disk budget.
const ROTATE_FRACTION: f64 = 1.0 / 8.0;
/// Trim oldest files once the aggregate exceeds this fraction of the budget.
const TRIM_FRACTION: f64 = 3.0 / 4.0;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Request {
    Lookup,
    Glob,
    Put,
    Delete,
    WhichAccess,
    Version,
    /// `wipeLog(user)`: the named user's LRU entries are stale and should
    /// be marked so, without forgetting that the cache was interested in
    /// them (`spec.md` §4.4.1 Retrying). Carries `name = user` in the
    /// `Record`; durable, so a restart doesn't re-serve stale entries as
    /// fresh before the watcher reconnects and resyncs them.
    Obsolete,
}

impl Request {
    fn to_byte(self) -> u8 {
        match self {
            Request::Lookup => 0,
            Request::Glob => 1,
            Request::Put => 2,
            Request::Delete => 3,
            Request::WhichAccess => 4,
            Request::Version => 5,
            Request::Obsolete => 6,
        }
    }

    fn from_byte(b: u8) -> io::Result<Self> {
        Ok(match b {
            0 => Request::Lookup,
            1 => Request::Glob,
            2 => Request::Put,
            3 => Request::Delete,
            4 => Request::WhichAccess,
            5 => Request::Version,
            6 => Request::Obsolete,
            _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "unknown request byte")),
        })
    }
}

/// A compact, wire-marshallable form of [`DirError`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MarshalledError {
    pub kind: Kind,
    pub message: String,
}

impl From<&DirError> for MarshalledError {
    fn from(e: &DirError) -> Self {
        Self {
            kind: e.kind,
            message: e.message.clone(),
        }
    }
}

fn kind_to_byte(k: Kind) -> u8 {
    match k {
        Kind::Invalid => 0,
        Kind::NotExist => 1,
        Kind::Exist => 2,
        Kind::IsDir => 3,
        Kind::NotDir => 4,
        Kind::NotEmpty => 5,
        Kind::Permission => 6,
        Kind::Private => 7,
        Kind::Io => 8,
        Kind::Internal => 9,
        Kind::NotSupported => 10,
    }
}

fn byte_to_kind(b: u8) -> io::Result<Kind> {
    Ok(match b {
        0 => Kind::Invalid,
        1 => Kind::NotExist,
        2 => Kind::Exist,
        3 => Kind::IsDir,
        4 => Kind::NotDir,
        5 => Kind::NotEmpty,
        6 => Kind::Permission,
        7 => Kind::Private,
        8 => Kind::Io,
        9 => Kind::Internal,
        10 => Kind::NotSupported,
        _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "unknown error kind byte")),
    })
}

/// One WAL record: a mutation (or read, for audit/replay purposes in the
/// clog) plus whatever the operation produced.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Record {
    pub request: Request,
    pub sequence: i64,
    pub error: Option<MarshalledError>,
    pub entry: Option<DirEntry>,
    /// Present when `entry` is absent (e.g. a Delete or a not-found Lookup).
    pub name: Option<String>,
    /// Present on glob-complete records: the full set of child basenames.
    pub children: Option<Vec<String>>,
}

impl Record {
    pub fn version() -> Self {
        Self {
            request: Request::Version,
            sequence: 0,
            error: None,
            entry: None,
            name: None,
            children: None,
        }
    }
}

// --- varint + zigzag helpers -------------------------------------------------

fn write_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            break;
        } else {
            buf.push(byte | 0x80);
        }
    }
}

fn read_uvarint<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte)?;
        let byte = byte[0];
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 64 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "varint too long"));
        }
    }
}

fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_uvarint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let len = read_uvarint(r)? as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

const FLAG_ERROR: u8 = 1 << 0;
const FLAG_ENTRY: u8 = 1 << 1;
const FLAG_NAME: u8 = 1 << 2;
const FLAG_CHILDREN: u8 = 1 << 3;

fn encode_payload(record: &Record) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.push(record.request.to_byte());
    write_uvarint(&mut buf, zigzag_encode(record.sequence));

    let mut flags = 0u8;
    if record.error.is_some() {
        flags |= FLAG_ERROR;
    }
    if record.entry.is_some() {
        flags |= FLAG_ENTRY;
    }
    if record.name.is_some() {
        flags |= FLAG_NAME;
    }
    if record.children.is_some() {
        flags |= FLAG_CHILDREN;
    }
    buf.push(flags);

    if let Some(e) = &record.error {
        buf.push(kind_to_byte(e.kind));
        write_string(&mut buf, &e.message);
    }
    if let Some(entry) = &record.entry {
        let mut cbor = Vec::new();
        ciborium::into_writer(entry, &mut cbor)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        write_uvarint(&mut buf, cbor.len() as u64);
        buf.extend_from_slice(&cbor);
    }
    if let Some(name) = &record.name {
        write_string(&mut buf, name);
    }
    if let Some(children) = &record.children {
        write_uvarint(&mut buf, children.len() as u64);
        for c in children {
            write_string(&mut buf, c);
        }
    }
    Ok(buf)
}

fn decode_payload(bytes: &[u8]) -> io::Result<Record> {
    let mut r = io::Cursor::new(bytes);
    let mut byte = [0u8; 1];
    r.read_exact(&mut byte)?;
    let request = Request::from_byte(byte[0])?;
    let sequence = zigzag_decode(read_uvarint(&mut r)?);

    r.read_exact(&mut byte)?;
    let flags = byte[0];

    let error = if flags & FLAG_ERROR != 0 {
        let mut kb = [0u8; 1];
        r.read_exact(&mut kb)?;
        let kind = byte_to_kind(kb[0])?;
        let message = read_string(&mut r)?;
        Some(MarshalledError { kind, message })
    } else {
        None
    };

    let entry = if flags & FLAG_ENTRY != 0 {
        let len = read_uvarint(&mut r)? as usize;
        let mut cbor = vec![0u8; len];
        r.read_exact(&mut cbor)?;
        let entry: DirEntry = ciborium::from_reader(io::Cursor::new(cbor))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        Some(entry)
    } else {
        None
    };

    let name = if flags & FLAG_NAME != 0 {
        Some(read_string(&mut r)?)
    } else {
        None
    };

    let children = if flags & FLAG_CHILDREN != 0 {
        let n = read_uvarint(&mut r)? as usize;
        let mut v = Vec::with_capacity(n);
        for _ in 0..n {
            v.push(read_string(&mut r)?);
        }
        Some(v)
    } else {
        None
    };

    Ok(Record {
        request,
        sequence,
        error,
        entry,
        name,
        children,
    })
}

// --- checksum: a fixed-permutation 4-byte running hash -----------------------

lazy_static! {
    static ref PERMUTATION: [u32; 256] = {
        let mut table = [0u32; 256];
        // A fixed, arbitrary-but-stable permutation: not cryptographic,
        // just enough to tell "truncated tail" from "plausible record".
        let mut state: u32 = 0x9E3779B9;
        for (i, slot) in table.iter_mut().enumerate() {
            state ^= (i as u32).wrapping_mul(0x85EBCA6B);
            state = state.wrapping_mul(0xC2B2AE35).rotate_left(13);
            *slot = state;
        }
        table
    };
}

/// `Wal::checksum`: a fixed-permutation running hash over `bytes`, folded
/// onto `state` (pass `0` to start a new checksum).
pub fn checksum(state: u32, bytes: &[u8]) -> u32 {
    let mut h = state;
    for &b in bytes {
        h = h.rotate_left(5) ^ PERMUTATION[b as usize];
    }
    h
}

/// Address of a record within the WAL: which rotated file, and the byte
/// offset of the record's length-prefix within it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct LogOffset {
    pub file: u64,
    pub pos: u64,
}

impl LogOffset {
    pub const ZERO: LogOffset = LogOffset { file: 1, pos: 0 };
}

/// The small sidecar persisted next to the log: the current root entry (if
/// the tree exists) and how far the log has been applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexFile {
    pub root: Option<DirEntry>,
    pub offset: LogOffset,
}

fn file_name(n: u64) -> String {
    format!("{FILE_PREFIX}{n:08}")
}

fn parse_file_number(name: &str) -> Option<u64> {
    name.strip_prefix(FILE_PREFIX)?.parse().ok()
}

/// One user's write-ahead log: a sequence of rotated files plus the index
/// sidecar. Holds its own buffered writer; readers may open independent
/// handles via [`Wal::try_clone`].
pub struct Wal {
    dir: Utf8PathBuf,
    budget_bytes: u64,
    read_only: bool,
    current_file: u64,
    writer: Option<BufWriter<File>>,
    open_readers: BTreeMap<u64, File>,
}

impl Wal {
    /// Open (creating if necessary) the log directory for one user.
    /// `budget_bytes` governs rotation/trimming (`spec.md` §4.1).
    pub fn open(dir: &Utf8Path, budget_bytes: u64) -> Result<Self, DirError> {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
        }

        let mut numbers = Self::valid_file_numbers(dir)?;

        let current_file = if let Some(&last) = numbers.last() {
            last
        } else {
            let n = 1;
            Self::create_file_with_version(dir, n)?;
            numbers.push(n);
            n
        };

        let path = dir.join(file_name(current_file));
        let writer = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;

        Ok(Self {
            dir: dir.to_owned(),
            budget_bytes,
            read_only: false,
            current_file,
            writer: Some(BufWriter::new(writer)),
            open_readers: BTreeMap::new(),
        })
    }

    /// Scan `dir` for `clog.NNNNNNNN` files, deleting any whose first
    /// record isn't a matching `Version` record (`spec.md` §4.1) and
    /// returning the survivors' numbers in ascending order.
    fn valid_file_numbers(dir: &Utf8Path) -> Result<Vec<u64>, DirError> {
        let mut numbers = Vec::new();
        let read_dir = match fs::read_dir(dir) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(numbers),
            Err(e) => return Err(io_err(dir, e)),
        };
        for entry in read_dir {
            let entry = entry.map_err(|e| io_err(dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(n) = parse_file_number(name) else { continue };
            let path = dir.join(name);
            if Self::has_valid_version(&path)? {
                numbers.push(n);
            } else {
                let _ = fs::remove_file(&path);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    fn has_valid_version(path: &Utf8Path) -> Result<bool, DirError> {
        let mut f = match File::open(path) {
            Ok(f) => f,
            Err(_) => return Ok(false),
        };
        match read_record_at(&mut f, 0) {
            Ok(Some((record, _next))) => Ok(record.request == Request::Version),
            _ => Ok(false),
        }
    }

    fn create_file_with_version(dir: &Utf8Path, n: u64) -> Result<(), DirError> {
        let path = dir.join(file_name(n));
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = f.set_permissions(fs::Permissions::from_mode(0o700));
        }
        write_record(&mut f, &Record::version()).map_err(|e| io_err(&path, e))?;
        f.sync_all().map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    /// Append a record; returns the offset it was written at.
    pub fn append(
        &mut self,
        request: Request,
        name: Option<String>,
        error: Option<MarshalledError>,
        entry: Option<DirEntry>,
        sequence: i64,
    ) -> Result<LogOffset, DirError> {
        if self.read_only {
            return Err(DirError::new(Kind::Io, self.dir.as_std_path(), "log handle is read-only"));
        }
        let record = Record {
            request,
            sequence,
            error,
            entry,
            name,
            children: None,
        };
        self.append_record(record)
    }

    pub fn append_glob_complete(
        &mut self,
        name: String,
        children: Vec<String>,
        sequence: i64,
    ) -> Result<LogOffset, DirError> {
        if self.read_only {
            return Err(DirError::new(Kind::Io, self.dir.as_std_path(), "log handle is read-only"));
        }
        self.append_record(Record {
            request: Request::Glob,
            sequence,
            error: None,
            entry: None,
            name: Some(name),
            children: Some(children),
        })
    }

    fn append_record(&mut self, record: Record) -> Result<LogOffset, DirError> {
        let path = self.dir.join(file_name(self.current_file));
        let writer = self.writer.as_mut().expect("writer present when not read-only");

        let pos = writer
            .get_ref()
            .metadata()
            .map_err(|e| io_err(&path, e))?
            .len();

        write_record(writer, &record).map_err(|e| io_err(&path, e))?;
        writer.flush().map_err(|e| io_err(&path, e))?;
        writer.get_ref().sync_data().map_err(|e| io_err(&path, e))?;

        let offset = LogOffset {
            file: self.current_file,
            pos,
        };

        self.maybe_rotate()?;
        self.maybe_trim()?;

        Ok(offset)
    }

    fn current_file_len(&self) -> Result<u64, DirError> {
        let path = self.dir.join(file_name(self.current_file));
        Ok(fs::metadata(&path).map_err(|e| io_err(&path, e))?.len())
    }

    fn maybe_rotate(&mut self) -> Result<(), DirError> {
        let threshold = (self.budget_bytes as f64 * ROTATE_FRACTION) as u64;
        if self.current_file_len()? <= threshold {
            return Ok(());
        }
        self.writer.as_mut().unwrap().flush().map_err(|e| io_err(&self.dir, e))?;
        let next = self.current_file + 1;
        Self::create_file_with_version(&self.dir, next)?;
        let path = self.dir.join(file_name(next));
        let fh = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        self.writer = Some(BufWriter::new(fh));
        self.current_file = next;
        crate::counters::bump(crate::counters::Op::WalRotation);
        Ok(())
    }

    fn aggregate_bytes(&self) -> Result<u64, DirError> {
        let mut total = 0u64;
        for n in Self::valid_file_numbers(&self.dir)? {
            let path = self.dir.join(file_name(n));
            total += fs::metadata(&path).map_err(|e| io_err(&path, e))?.len();
        }
        Ok(total)
    }

    fn maybe_trim(&mut self) -> Result<(), DirError> {
        let trim_threshold = (self.budget_bytes as f64 * TRIM_FRACTION) as u64;
        let mut numbers = Self::valid_file_numbers(&self.dir)?;
        let mut total = self.aggregate_bytes()?;
        while total > trim_threshold && numbers.len() > 1 {
            let oldest = numbers.remove(0);
            if oldest == self.current_file {
                break;
            }
            let path = self.dir.join(file_name(oldest));
            let len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
            total = total.saturating_sub(len);
            crate::counters::bump(crate::counters::Op::WalTrim);
        }
        Ok(())
    }

    /// Read the record at `offset`; returns the record and the offset of
    /// the next one, or `None` if `offset` is at or past the end of the
    /// log (including a truncated/corrupt trailing record, per
    /// `spec.md` §4.1's recovery semantics).
    pub fn read_at(&mut self, offset: LogOffset) -> Result<Option<(Record, LogOffset)>, DirError> {
        let path = self.dir.join(file_name(offset.file));
        if !self.open_readers.contains_key(&offset.file) {
            let f = File::open(&path).map_err(|e| io_err(&path, e))?;
            self.open_readers.insert(offset.file, f);
        }
        let f = self.open_readers.get_mut(&offset.file).unwrap();
        match read_record_at(f, offset.pos).map_err(|e| io_err(&path, e))? {
            Some((record, next_pos)) => Ok(Some((
                record,
                LogOffset {
                    file: offset.file,
                    pos: next_pos,
                },
            ))),
            None => {
                // Try the next rotated file, if any.
                let numbers = Self::valid_file_numbers(&self.dir)?;
                match numbers.iter().find(|&&n| n > offset.file) {
                    Some(&next_file) => self.read_at(LogOffset { file: next_file, pos: 0 }),
                    None => Ok(None),
                }
            }
        }
    }

    /// Replay every record from `from` to the end of the log, applying
    /// `apply` to each (used by `Tree` recovery and the clog's startup
    /// replay). Stops silently at the first truncated/corrupt tail.
    pub fn replay(
        &mut self,
        from: LogOffset,
        mut apply: impl FnMut(&Record),
    ) -> Result<LogOffset, DirError> {
        let mut offset = from;
        loop {
            match self.read_at(offset)? {
                Some((record, next)) => {
                    if record.request != Request::Version {
                        apply(&record);
                    }
                    offset = next;
                }
                None => return Ok(offset),
            }
        }
    }

    /// A read-only handle sharing the same files; any write call on it
    /// fails with `Kind::Io`, per `spec.md` §4.1.
    pub fn try_clone(&self) -> Result<Wal, DirError> {
        Ok(Wal {
            dir: self.dir.clone(),
            budget_bytes: self.budget_bytes,
            read_only: true,
            current_file: self.current_file,
            writer: None,
            open_readers: BTreeMap::new(),
        })
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    // --- index sidecar -------------------------------------------------

    fn index_path(&self) -> Utf8PathBuf {
        self.dir.join("index")
    }

    pub fn write_index(&self, index: &IndexFile) -> Result<(), DirError> {
        let path = self.index_path();
        let mut bytes = INDEX_MAGIC.to_vec();
        ciborium::into_writer(index, &mut bytes).map_err(|e| io_err(&path, e.to_string()))?;
        crate::file_util::atomic_write(&path, &bytes)
    }

    pub fn read_index(&self) -> Result<Option<IndexFile>, DirError> {
        let path = self.index_path();
        let mut f = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path, e)),
        };
        crate::file_util::check_magic(&mut f, &path, INDEX_MAGIC)?;
        let index = ciborium::from_reader(f).map_err(|e| io_err(&path, e.to_string()))?;
        Ok(Some(index))
    }

    // --- whole-repository helpers ---------------------------------------

    pub fn has_log(user: &str, base_dir: &Utf8Path) -> bool {
        fs::read_dir(base_dir.join(user))
            .map(|mut rd| rd.any(|e| e.is_ok()))
            .unwrap_or(false)
    }

    pub fn delete_logs(user: &str, base_dir: &Utf8Path) -> Result<(), DirError> {
        let dir = base_dir.join(user);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&dir, e)),
        }
    }

    pub fn list_users(pattern: &str, base_dir: &Utf8Path) -> Result<Vec<String>, DirError> {
        let re = crate::dirserver::glob_to_regex(pattern)
            .map_err(|e| DirError::new(Kind::Invalid, pattern, e))?;
        let mut users = Vec::new();
        let read_dir = match fs::read_dir(base_dir) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(users),
            Err(e) => return Err(io_err(base_dir, e)),
        };
        for entry in read_dir {
            let entry = entry.map_err(|e| io_err(base_dir, e))?;
            if let Some(name) = entry.file_name().to_str() {
                if re.is_match(name) {
                    users.push(name.to_string());
                }
            }
        }
        users.sort();
        Ok(users)
    }
}

fn io_err(path: impl AsRef<Utf8Path>, e: impl std::fmt::Display) -> DirError {
    DirError::new(Kind::Io, path.as_ref().as_std_path(), e.to_string())
}

/// Write one record (length-prefixed payload plus a 4-byte checksum) to `w`.
fn write_record<W: Write>(w: &mut W, record: &Record) -> io::Result<()> {
    let payload = encode_payload(record)?;
    let mut framed = Vec::with_capacity(payload.len() + 10);
    write_uvarint(&mut framed, payload.len() as u64);
    framed.extend_from_slice(&payload);
    let sum = checksum(0, &framed);
    w.write_all(&framed)?;
    w.write_all(&sum.to_le_bytes())?;
    Ok(())
}

/// Read one record from `r` at byte offset `pos`. Returns `None` (not an
/// error) if there isn't a complete, checksummed record there — the
/// caller treats that as "end of log" during recovery.
fn read_record_at(r: &mut File, pos: u64) -> io::Result<Option<(Record, u64)>> {
    let len = r.metadata()?.len();
    if pos >= len {
        return Ok(None);
    }
    r.seek(SeekFrom::Start(pos))?;
    let mut reader = BufReader::new(&mut *r);

    // We need the raw bytes of the length varint to checksum them, so read
    // it byte-by-byte while copying into `framed`.
    let mut framed = Vec::new();
    let payload_len = match read_uvarint_tee(&mut reader, &mut framed) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };

    let mut payload = vec![0u8; payload_len as usize];
    if reader.read_exact(&mut payload).is_err() {
        return Ok(None);
    }
    framed.extend_from_slice(&payload);

    let mut sum_bytes = [0u8; 4];
    if reader.read_exact(&mut sum_bytes).is_err() {
        return Ok(None);
    }
    let expected = u32::from_le_bytes(sum_bytes);
    let actual = checksum(0, &framed);
    if actual != expected {
        return Ok(None);
    }

    let record = match decode_payload(&payload) {
        Ok(r) => r,
        Err(_) => return Ok(None),
    };

    let consumed = framed.len() as u64 + 4;
    Ok(Some((record, pos + consumed)))
}

fn read_uvarint_tee<R: Read>(r: &mut R, tee: &mut Vec<u8>) -> io::Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte)?;
        tee.push(byte[0]);
        result |= ((byte[0] & 0x7f) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 64 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "varint too long"));
        }
    }
}
