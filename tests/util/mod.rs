//! A scripted, instrumented decoder for exercising mounts end to end
//! without a real decompression library.

#![allow(dead_code)]

use std::{
    io::{Read, Seek, SeekFrom, Write},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering::Relaxed},
        mpsc,
    },
    thread,
    time::Duration,
};

use archivefs::{
    Config, MountError, MountOptions, MountSession,
    decoder::{ArchiveInput, Decoder, DecoderError, DecoderSession, Entry, Result},
};
use bstr::BString;
use tempfile::NamedTempFile;

pub struct FakeEntry {
    pub path: String,
    pub mode: u32,
    pub mtime: i64,
    pub data: Vec<u8>,
    pub size_known: bool,
    pub symlink: Option<String>,
}

pub fn file(path: &str, data: impl Into<Vec<u8>>, mtime: i64) -> FakeEntry {
    FakeEntry {
        path: path.to_owned(),
        mode: 0o100644,
        mtime,
        data: data.into(),
        size_known: true,
        symlink: None,
    }
}

pub fn dir(path: &str) -> FakeEntry {
    FakeEntry {
        path: path.to_owned(),
        mode: 0o040755,
        mtime: 0,
        data: Vec::new(),
        size_known: true,
        symlink: None,
    }
}

pub fn symlink(path: &str, target: &str, mtime: i64) -> FakeEntry {
    FakeEntry {
        path: path.to_owned(),
        mode: 0o120777,
        mtime,
        data: Vec::new(),
        size_known: true,
        symlink: Some(target.to_owned()),
    }
}

/// A 9000-byte deterministic pattern, longer than small side buffers.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[derive(Debug, Default)]
pub struct Counters {
    /// Decode sessions opened, the initialization scan's included.
    pub sessions_opened: AtomicUsize,
    /// Entry headers visited across all sessions.
    pub headers_read: AtomicUsize,
    /// Total decompressed bytes produced across all sessions.
    pub bytes_decoded: AtomicU64,
}

pub struct FakeDecoder {
    entries: Arc<Vec<FakeEntry>>,
    pub counters: Arc<Counters>,
    max_chunk: Option<usize>,
    read_error: Option<(String, Arc<AtomicBool>)>,
    raw: bool,
    filter: bool,
    /// Bytes consumed from the archive file per header, to make progress
    /// observable.
    header_bytes: usize,
    /// When set, the scan session blocks before each header after the
    /// first until a token arrives (cancellation still interrupts it).
    gate: Option<Arc<Mutex<mpsc::Receiver<()>>>>,
}

impl FakeDecoder {
    pub fn new(entries: Vec<FakeEntry>) -> Self {
        Self {
            entries: Arc::new(entries),
            counters: Arc::new(Counters::default()),
            max_chunk: None,
            read_error: None,
            raw: false,
            filter: true,
            header_bytes: 0,
            gate: None,
        }
    }

    /// Cap the byte count of a single decode read, forcing short reads.
    pub fn max_chunk(mut self, n: usize) -> Self {
        self.max_chunk = Some(n);
        self
    }

    /// Fail every data read with the given decoder message.
    pub fn read_error(mut self, message: &str) -> Self {
        self.read_error = Some((message.to_owned(), Arc::new(AtomicBool::new(true))));
        self
    }

    /// Like [`read_error`][Self::read_error], but armed and disarmed at
    /// will through the returned switch. Starts disarmed.
    pub fn read_error_switch(&mut self, message: &str) -> Arc<AtomicBool> {
        let armed = Arc::new(AtomicBool::new(false));
        self.read_error = Some((message.to_owned(), Arc::clone(&armed)));
        armed
    }

    pub fn raw(mut self, filter: bool) -> Self {
        self.raw = true;
        self.filter = filter;
        self
    }

    pub fn header_bytes(mut self, n: usize) -> Self {
        self.header_bytes = n;
        self
    }

    /// Returns the sender feeding the scan gate; one token unblocks one
    /// header.
    pub fn gated(&mut self) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        self.gate = Some(Arc::new(Mutex::new(rx)));
        tx
    }

    /// The archive file size the fake scan will consume in total.
    pub fn archive_size(&self) -> usize {
        self.header_bytes * self.entries.len()
    }
}

impl Decoder for FakeDecoder {
    fn open(
        &self,
        input: Box<dyn ArchiveInput>,
        _passphrase: Option<&[u8]>,
    ) -> Result<Box<dyn DecoderSession>> {
        let nth = self.counters.sessions_opened.fetch_add(1, Relaxed);
        Ok(Box::new(FakeSession {
            entries: Arc::clone(&self.entries),
            counters: Arc::clone(&self.counters),
            input,
            cursor: None,
            read_offset: 0,
            max_chunk: self.max_chunk,
            read_error: self.read_error.clone(),
            raw: self.raw,
            filter: self.filter,
            header_bytes: self.header_bytes,
            // Only the first session (the scan's) is gated; readers opened
            // for file handles must never block on it.
            gate: if nth == 0 { self.gate.clone() } else { None },
        }))
    }
}

struct FakeSession {
    entries: Arc<Vec<FakeEntry>>,
    counters: Arc<Counters>,
    input: Box<dyn ArchiveInput>,
    cursor: Option<usize>,
    read_offset: usize,
    max_chunk: Option<usize>,
    read_error: Option<(String, Arc<AtomicBool>)>,
    raw: bool,
    filter: bool,
    header_bytes: usize,
    gate: Option<Arc<Mutex<mpsc::Receiver<()>>>>,
}

impl DecoderSession for FakeSession {
    fn next_entry(&mut self) -> Result<Option<Entry>> {
        let next = self.cursor.map_or(0, |c| c + 1);
        if next >= self.entries.len() {
            return Ok(None);
        }

        if next >= 1 {
            if let Some(gate) = self.gate.clone() {
                let gate = gate.lock().unwrap();
                while gate.try_recv().is_err() {
                    // A zero-length seek is the cancellation point; it
                    // neither consumes input nor moves the position.
                    self.input.seek(SeekFrom::Current(0))?;
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }

        if self.header_bytes > 0 {
            let mut scratch = vec![0u8; self.header_bytes];
            self.input.read(&mut scratch)?;
        }

        self.cursor = Some(next);
        self.read_offset = 0;
        self.counters.headers_read.fetch_add(1, Relaxed);

        let e = &self.entries[next];
        Ok(Some(Entry {
            pathname: BString::from(e.path.as_str()),
            mode: e.mode,
            size: e.size_known.then(|| e.data.len() as u64),
            mtime: e.mtime,
            symlink_target: e.symlink.as_deref().map(BString::from),
            encrypted: false,
        }))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if let Some((message, armed)) = &self.read_error {
            if armed.load(Relaxed) {
                return Err(DecoderError::new(message.clone()));
            }
        }
        let data = &self.entries[self.cursor.expect("no current entry")].data;
        let rest = &data[self.read_offset..];
        let mut n = rest.len().min(buf.len());
        if let Some(max) = self.max_chunk {
            n = n.min(max);
        }
        buf[..n].copy_from_slice(&rest[..n]);
        self.read_offset += n;
        self.counters.bytes_decoded.fetch_add(n as u64, Relaxed);
        Ok(n)
    }

    fn is_raw(&self) -> bool {
        self.raw
    }

    fn has_decode_filter(&self) -> bool {
        self.filter
    }
}

/// A mounted fake archive plus the backing temp file.
#[derive(Debug)]
pub struct TestMount {
    pub session: MountSession,
    pub counters: Arc<Counters>,
    _file: NamedTempFile,
}

pub fn try_mount(
    decoder: FakeDecoder,
    options: MountOptions,
    config: Config,
) -> std::result::Result<TestMount, MountError> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&vec![0u8; decoder.archive_size()]).unwrap();
    file.flush().unwrap();

    let counters = Arc::clone(&decoder.counters);
    let session = MountSession::new(file.path(), Arc::new(decoder), options, config)?;
    Ok(TestMount {
        session,
        counters,
        _file: file,
    })
}

pub fn mount(decoder: FakeDecoder) -> TestMount {
    try_mount(decoder, MountOptions::new(), Config::new()).unwrap()
}

pub fn mount_with_config(decoder: FakeDecoder, config: Config) -> TestMount {
    try_mount(decoder, MountOptions::new(), config).unwrap()
}

/// Read `len` bytes at `offset` through an open handle, looping over
/// short reads the way a transport would.
pub fn read_at(
    session: &MountSession,
    handle: &mut archivefs::FileHandle,
    offset: u64,
    len: usize,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = vec![0u8; len];
    while out.len() < len {
        let at = offset + out.len() as u64;
        let n = session
            .read(handle, at, &mut buf[..len - out.len()])
            .unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    out
}
