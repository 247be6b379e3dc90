//! The two-phase initialization scan.
//!
//! Mounting splits the work in two. The *pre-scan* is synchronous and
//! cheap: it opens a decode session, walks headers to the first
//! non-directory entry and probes just enough data to surface the errors a
//! caller must see before the mount exists at all (not an archive, raw
//! data without a compression filter, missing or wrong passphrase). The
//! *build* walks the remaining headers and constructs the
//! [`Tree`]; it runs either lazily on the first filesystem request or on a
//! background thread, in which case every read of the underlying file
//! checks a shutdown flag so unmounting never waits for a full scan of a
//! huge archive.
//!
//! Progress is measured against the *compressed* file: the high-water mark
//! of the byte position consumed so far, over the archive's file size.
//! That proxies scan progress well even though entries decompress to
//! wildly different sizes.

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering::Relaxed},
    },
};

use bstr::{BStr, ByteSlice};

use crate::{
    PROGRESS_SCALE,
    buffer::SideBufferPool,
    decoder::{
        ArchiveInput, Cancelled, Decoder, DecoderError, DecoderSession, Entry, ErrorClass,
        classify_error_message,
    },
    session::{MountError, MountErrorKind},
    tree::{self, TYPE_DIR, TYPE_LNK, TYPE_MASK, Tree, TreeBuilder},
};

/// Shared state between a running scan and the mount that owns it.
pub(crate) struct ScanControl {
    shutdown: AtomicBool,
    position_hwm: AtomicU64,
    archive_size: u64,
}

impl ScanControl {
    pub(crate) fn new(archive_size: u64) -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            position_hwm: AtomicU64::new(0),
            archive_size,
        }
    }

    /// Ask the scan to stop at its next I/O operation.
    pub(crate) fn cancel(&self) {
        self.shutdown.store(true, Relaxed);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.shutdown.load(Relaxed)
    }

    fn note_position(&self, position: u64) {
        self.position_hwm.fetch_max(position, Relaxed);
    }

    /// Scan progress scaled to [`PROGRESS_SCALE`]. Monotone, and pinned to
    /// the scale once the whole file has been visited.
    pub(crate) fn progress(&self) -> u32 {
        let m = self.position_hwm.load(Relaxed);
        let n = self.archive_size;
        if m == 0 || n == 0 {
            0
        } else if m >= n {
            PROGRESS_SCALE
        } else {
            (u64::from(PROGRESS_SCALE) * m / n) as u32
        }
    }
}

/// The byte stream handed to the scan's decode session: a plain
/// reader/seeker instrumented to feed [`ScanControl`] and to fail fast once
/// cancellation is requested.
pub(crate) struct ScanInput<R> {
    inner: R,
    position: u64,
    control: Arc<ScanControl>,
}

impl<R: Read + Seek> ScanInput<R> {
    pub(crate) fn new(inner: R, control: Arc<ScanControl>) -> Self {
        Self {
            inner,
            position: 0,
            control,
        }
    }

    fn check_cancelled(&self) -> io::Result<()> {
        if self.control.is_cancelled() {
            return Err(io::Error::other(Cancelled));
        }
        Ok(())
    }
}

impl<R: Read + Seek> Read for ScanInput<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_cancelled()?;
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        self.control.note_position(self.position);
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for ScanInput<R> {
    fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        self.check_cancelled()?;
        self.position = self.inner.seek(from)?;
        self.control.note_position(self.position);
        Ok(self.position)
    }
}

/// Result of a successful pre-scan, consumed by [`build_tree`].
pub(crate) enum PreScan {
    /// The archive has no entries. The tree is just a root directory.
    Empty,
    /// The first non-directory header has been read and validated.
    Started {
        session: Box<dyn DecoderSession>,
        first_entry: Entry,
        /// Archive index of `first_entry`. Directory entries skipped on
        /// the way still consumed an index each.
        first_index: u64,
        raw: bool,
    },
}

impl fmt::Debug for PreScan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreScan::Empty => f.pad("Empty"),
            PreScan::Started {
                first_entry,
                first_index,
                raw,
                ..
            } => f
                .debug_struct("Started")
                .field("first_entry", first_entry)
                .field("first_index", first_index)
                .field("raw", raw)
                .finish_non_exhaustive(),
        }
    }
}

fn header_error(err: &DecoderError, archive_label: &str) -> MountError {
    if err.is_cancelled() {
        return MountError::new(MountErrorKind::Cancelled, err.message());
    }
    error!("invalid archive {archive_label}: {err}");
    MountError::new(MountErrorKind::InvalidHeader, err.message())
}

/// The synchronous part of mounting: open a decode session and fail early
/// on everything that makes the archive unmountable.
pub(crate) fn pre_scan(
    decoder: &dyn Decoder,
    input: Box<dyn ArchiveInput>,
    passphrase: Option<&[u8]>,
    archive_label: &str,
) -> Result<PreScan, MountError> {
    let mut session = decoder.open(input, passphrase).map_err(|err| {
        error!("could not open {archive_label}: {err}");
        MountError::new(MountErrorKind::CannotOpen, err.message())
    })?;

    let mut next_index: u64 = 0;
    let (first_entry, first_index) = loop {
        match session.next_entry() {
            Err(err) => bail!(header_error(&err, archive_label)),
            Ok(None) => return Ok(PreScan::Empty),
            Ok(Some(entry)) => {
                let index = next_index;
                next_index += 1;
                if entry.mode & TYPE_MASK == TYPE_DIR {
                    continue;
                }
                break (entry, index);
            }
        }
    };

    let raw = session.is_raw();
    if raw {
        // A raw archive must have at least one compression filter, else we
        // would happily mount arbitrary data (e.g. foo.jpeg).
        if !session.has_decode_filter() {
            error!("invalid raw archive: {archive_label}");
            bail!(MountError::new(
                MountErrorKind::InvalidRawArchive,
                "no compression filter matched",
            ));
        }
    } else {
        // Reading the first byte of the first non-directory entry reveals
        // whether we also need a passphrase.
        let mut probe = [0u8; 1];
        if let Err(err) = session.read(&mut probe) {
            if err.is_cancelled() {
                bail!(MountError::new(MountErrorKind::Cancelled, err.message()));
            }
            error!("{archive_label}: {err}");
            let kind = match classify_error_message(err.message()) {
                ErrorClass::PassphraseRequired => MountErrorKind::PassphraseRequired,
                ErrorClass::PassphraseIncorrect => MountErrorKind::PassphraseIncorrect,
                ErrorClass::PassphraseNotSupported => MountErrorKind::PassphraseNotSupported,
                ErrorClass::InvalidContents => MountErrorKind::InvalidContents,
            };
            bail!(MountError::new(kind, err.message()));
        }
    }

    Ok(PreScan::Started {
        session,
        first_entry,
        first_index,
        raw,
    })
}

/// Everything the build phase needs besides the decode session itself.
pub(crate) struct ScanContext<'a> {
    pub pool: &'a SideBufferPool,
    pub control: &'a ScanControl,
    /// Archive name for log messages, already redacted if requested.
    pub archive_label: &'a str,
    pub redact_pathnames: bool,
}

impl ScanContext<'_> {
    fn pathname_label(&self, pathname: &BStr) -> String {
        if self.redact_pathnames {
            "[redacted]".to_owned()
        } else {
            pathname.to_string()
        }
    }
}

fn cancelled_error() -> MountError {
    MountError::new(MountErrorKind::Cancelled, "initialization scan cancelled")
}

/// The expensive part of mounting: walk every remaining header and build
/// the directory tree.
pub(crate) fn build_tree(pre: PreScan, ctx: &ScanContext<'_>) -> Result<Tree, MountError> {
    trace_time!("scanned {}", ctx.archive_label);
    let mut builder = TreeBuilder::new();
    let (mut session, first_entry, mut index, raw) = match pre {
        PreScan::Empty => return Ok(builder.finish()),
        PreScan::Started {
            session,
            first_entry,
            first_index,
            raw,
        } => (session, first_entry, first_index, raw),
    };

    let mut entry = Some(first_entry);
    loop {
        if ctx.control.is_cancelled() {
            bail!(cancelled_error());
        }
        let entry = match entry.take() {
            Some(e) => e,
            None => {
                index += 1;
                match session.next_entry() {
                    Err(err) if err.is_cancelled() => {
                        bail!(MountError::new(MountErrorKind::Cancelled, err.message()));
                    }
                    Err(err) => {
                        error!("invalid archive {}: {err}", ctx.archive_label);
                        bail!(MountError::new(MountErrorKind::InvalidContents, err.message()));
                    }
                    Ok(None) => break,
                    Ok(Some(e)) => e,
                }
            }
        };
        if entry.mode & TYPE_MASK == TYPE_DIR {
            // Directory entries carry no content worth a node of their own;
            // directories materialize from their descendants' pathnames.
            // The entry still consumed an archive index.
            continue;
        }
        scan_entry(&mut builder, session.as_mut(), entry, index, raw, ctx)?;
    }

    Ok(builder.finish())
}

/// Vet one non-directory entry and insert it as a leaf, or skip it with a
/// log line. Only structural defects (duplicates, index disorder) fail the
/// whole build.
fn scan_entry(
    builder: &mut TreeBuilder,
    session: &mut dyn DecoderSession,
    entry: Entry,
    index: u64,
    raw: bool,
    ctx: &ScanContext<'_>,
) -> Result<(), MountError> {
    let Some(pathname) = tree::normalize_pathname(entry.pathname.as_bstr()) else {
        warn!(
            "skipping invalid pathname in {}: {}",
            ctx.archive_label,
            ctx.pathname_label(entry.pathname.as_bstr()),
        );
        return Ok(());
    };

    let symlink_target = if entry.mode & TYPE_MASK == TYPE_LNK {
        match entry.symlink_target {
            Some(target) if !target.is_empty() => Some(target),
            _ => {
                warn!(
                    "empty link in {}: {}",
                    ctx.archive_label,
                    ctx.pathname_label(pathname.as_bstr()),
                );
                return Ok(());
            }
        }
    } else if entry.mode & TYPE_MASK != tree::TYPE_REG {
        warn!(
            "irregular non-link file in {}: {}",
            ctx.archive_label,
            ctx.pathname_label(pathname.as_bstr()),
        );
        return Ok(());
    } else {
        None
    };

    let mut size = entry.size.unwrap_or(0);
    if raw && size == 0 {
        // Raw archives don't always record the decompressed size; the only
        // way to learn it is to decompress the whole stream. The probed
        // bytes go through the side buffer pool, so the head of the entry
        // stays cached for the first reads after mounting.
        loop {
            if ctx.control.is_cancelled() {
                bail!(cancelled_error());
            }
            let n = ctx
                .pool
                .probe_scratch(index, size, |buf| session.read(buf))
                .map_err(|err| {
                    if err.is_cancelled() {
                        return MountError::new(MountErrorKind::Cancelled, err.message());
                    }
                    error!("could not decompress {}: {err}", ctx.archive_label);
                    MountError::new(MountErrorKind::InvalidContents, err.message())
                })?;
            if n == 0 {
                break;
            }
            size += n as u64;
        }
    }

    builder
        .insert_leaf(
            pathname.as_bstr(),
            symlink_target,
            index,
            size,
            entry.mtime,
            entry.mode,
        )
        .map_err(|err| {
            error!("collision in {}: {err}", ctx.archive_label);
            MountError::new(MountErrorKind::InvalidContents, err.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bstr::BString;

    struct FakeEntry {
        path: &'static str,
        mode: u32,
        mtime: i64,
        size: Option<u64>,
        data: Vec<u8>,
        symlink: Option<&'static str>,
    }

    fn file(path: &'static str, data: &[u8]) -> FakeEntry {
        FakeEntry {
            path,
            mode: 0o100644,
            mtime: 0,
            size: Some(data.len() as u64),
            data: data.to_vec(),
            symlink: None,
        }
    }

    fn dir(path: &'static str) -> FakeEntry {
        FakeEntry {
            path,
            mode: 0o040755,
            mtime: 0,
            size: Some(0),
            data: Vec::new(),
            symlink: None,
        }
    }

    struct FakeSession {
        entries: Vec<FakeEntry>,
        cursor: Option<usize>,
        read_offset: usize,
        raw: bool,
        filter: bool,
        read_error: Option<&'static str>,
    }

    impl FakeSession {
        fn cooked(entries: Vec<FakeEntry>) -> Self {
            Self {
                entries,
                cursor: None,
                read_offset: 0,
                raw: false,
                filter: true,
                read_error: None,
            }
        }
    }

    impl DecoderSession for FakeSession {
        fn next_entry(&mut self) -> crate::decoder::Result<Option<Entry>> {
            let next = self.cursor.map_or(0, |c| c + 1);
            if next >= self.entries.len() {
                return Ok(None);
            }
            self.cursor = Some(next);
            self.read_offset = 0;
            let e = &self.entries[next];
            Ok(Some(Entry {
                pathname: BString::from(e.path),
                mode: e.mode,
                size: e.size,
                mtime: e.mtime,
                symlink_target: e.symlink.map(BString::from),
                encrypted: false,
            }))
        }

        fn read(&mut self, buf: &mut [u8]) -> crate::decoder::Result<usize> {
            if let Some(msg) = self.read_error {
                bail!(DecoderError::new(msg));
            }
            let data = &self.entries[self.cursor.expect("no current entry")].data;
            let rest = &data[self.read_offset..];
            let n = rest.len().min(buf.len());
            buf[..n].copy_from_slice(&rest[..n]);
            self.read_offset += n;
            Ok(n)
        }

        fn is_raw(&self) -> bool {
            self.raw
        }

        fn has_decode_filter(&self) -> bool {
            self.filter
        }
    }

    struct FakeDecoder(std::sync::Mutex<Option<FakeSession>>);

    impl FakeDecoder {
        fn new(session: FakeSession) -> Self {
            Self(std::sync::Mutex::new(Some(session)))
        }
    }

    impl Decoder for FakeDecoder {
        fn open(
            &self,
            _input: Box<dyn ArchiveInput>,
            _passphrase: Option<&[u8]>,
        ) -> crate::decoder::Result<Box<dyn DecoderSession>> {
            Ok(Box::new(self.0.lock().unwrap().take().expect("one session")))
        }
    }

    fn null_input() -> Box<dyn ArchiveInput> {
        Box::new(io::Cursor::new(Vec::new()))
    }

    fn scan(session: FakeSession) -> Result<Tree, MountError> {
        let decoder = FakeDecoder::new(session);
        let pre = pre_scan(&decoder, null_input(), None, "archive.zip")?;
        let pool = SideBufferPool::new(4, 128);
        let control = ScanControl::new(0);
        build_tree(
            pre,
            &ScanContext {
                pool: &pool,
                control: &control,
                archive_label: "archive.zip",
                redact_pathnames: false,
            },
        )
    }

    #[test]
    fn empty_archive_builds_bare_root() {
        let tree = scan(FakeSession::cooked(Vec::new())).unwrap();
        assert_eq!(tree.node_count(), 1);
        assert!(tree.node(tree.get("/").unwrap()).is_dir());
    }

    #[test]
    fn directory_entries_consume_indexes() {
        let tree = scan(FakeSession::cooked(vec![
            dir("d/"),
            file("d/f", b"hello"),
        ]))
        .unwrap();

        assert_eq!(tree.get_by_index(0), None);
        assert_eq!(tree.get_by_index(1), tree.get("/d/f"));
        assert_eq!(tree.node(tree.get("/d/f").unwrap()).size, 5);
    }

    #[test]
    fn bad_entries_are_skipped_not_fatal() {
        let mut fifo = file("fifo", b"");
        fifo.mode = 0o010644;
        let mut empty_link = file("link", b"");
        empty_link.mode = 0o120777;
        let tree = scan(FakeSession::cooked(vec![
            file("../evil", b"x"),
            fifo,
            empty_link,
            file("ok", b"data"),
        ]))
        .unwrap();

        assert_eq!(tree.get("/evil"), None);
        assert_eq!(tree.get("/../evil"), None);
        assert_eq!(tree.get("/fifo"), None);
        assert_eq!(tree.get("/link"), None);
        // Skipped entries still consumed their indexes.
        assert_eq!(tree.get_by_index(3), tree.get("/ok"));
    }

    #[test]
    fn duplicate_pathname_fails_the_build() {
        let err = scan(FakeSession::cooked(vec![
            file("a", b"1"),
            file("./a", b"2"),
        ]))
        .unwrap_err();
        assert_eq!(err.kind(), MountErrorKind::InvalidContents);
    }

    #[test]
    fn raw_without_filter_is_rejected() {
        let mut session = FakeSession::cooked(vec![file("data", b"x")]);
        session.raw = true;
        session.filter = false;
        let decoder = FakeDecoder::new(session);
        let err = pre_scan(&decoder, null_input(), None, "archive").unwrap_err();
        assert_eq!(err.kind(), MountErrorKind::InvalidRawArchive);
    }

    #[test]
    fn raw_size_is_probed_and_cached() {
        let mut entry = file("data.gz", &vec![7u8; 300]);
        entry.size = None;
        let mut session = FakeSession::cooked(vec![entry]);
        session.raw = true;

        let decoder = FakeDecoder::new(session);
        let pre = pre_scan(&decoder, null_input(), None, "archive").unwrap();
        let pool = SideBufferPool::new(4, 128);
        let control = ScanControl::new(0);
        let tree = build_tree(
            pre,
            &ScanContext {
                pool: &pool,
                control: &control,
                archive_label: "archive",
                redact_pathnames: false,
            },
        )
        .unwrap();

        assert_eq!(tree.node(tree.get("/data.gz").unwrap()).size, 300);
        // The probe went through the side buffers, so the head of the
        // entry is already cached.
        let mut out = [0u8; 128];
        assert!(pool.read_into(0, 0, &mut out));
        assert_eq!(out, [7u8; 128]);
    }

    #[test]
    fn passphrase_probe_classifies_errors() {
        let mut session = FakeSession::cooked(vec![file("secret", b"")]);
        session.read_error = Some("Passphrase required for this entry");
        let decoder = FakeDecoder::new(session);
        let err = pre_scan(&decoder, null_input(), None, "archive").unwrap_err();
        assert_eq!(err.kind(), MountErrorKind::PassphraseRequired);
    }

    #[test]
    fn cancellation_stops_the_build() {
        let session = FakeSession::cooked(vec![file("a", b"1"), file("b", b"2")]);
        let decoder = FakeDecoder::new(session);
        let pre = pre_scan(&decoder, null_input(), None, "archive").unwrap();
        let pool = SideBufferPool::new(4, 128);
        let control = ScanControl::new(0);
        control.cancel();
        let err = build_tree(
            pre,
            &ScanContext {
                pool: &pool,
                control: &control,
                archive_label: "archive",
                redact_pathnames: false,
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), MountErrorKind::Cancelled);
    }

    #[test]
    fn scan_input_tracks_progress_and_cancels() {
        let control = Arc::new(ScanControl::new(100));
        let mut input = ScanInput::new(io::Cursor::new(vec![0u8; 100]), Arc::clone(&control));

        let mut buf = [0u8; 50];
        input.read(&mut buf).unwrap();
        assert_eq!(control.progress(), PROGRESS_SCALE / 2);

        // Seeking backwards must not lower the high-water mark.
        input.seek(SeekFrom::Start(10)).unwrap();
        assert_eq!(control.progress(), PROGRESS_SCALE / 2);

        input.seek(SeekFrom::End(0)).unwrap();
        assert_eq!(control.progress(), PROGRESS_SCALE);

        control.cancel();
        let err = input.read(&mut buf).unwrap_err();
        assert!(DecoderError::from(err).is_cancelled());
    }

    #[test]
    fn progress_handles_empty_and_unknown_sizes() {
        let control = ScanControl::new(0);
        control.note_position(50);
        assert_eq!(control.progress(), 0);

        let control = ScanControl::new(100);
        assert_eq!(control.progress(), 0);
        control.note_position(200);
        assert_eq!(control.progress(), PROGRESS_SCALE);
    }
}
