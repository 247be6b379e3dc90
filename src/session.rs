//! The mounted-archive session: the surface a filesystem transport drives.
//!
//! A [`MountSession`] owns everything behind one mount: the decoder, the
//! directory tree (or the still-running scan that will produce it), the
//! warm reader pool and the side buffers. The transport (a FUSE binding,
//! an NFS shim, a test harness) calls the operation methods from its
//! worker threads; all methods take `&self` except where a per-handle
//! cursor is mutated.
//!
//! Construction runs the cheap pre-scan synchronously, so a missing file,
//! a non-archive or a wrong passphrase fails before the mount exists.
//! Whether the expensive tree build runs lazily on the first operation or
//! on a background thread is chosen by
//! [`MountOptions::async_progress`]; in the background case the mount
//! serves a synthetic one-file filesystem until the scan completes.

use std::{
    fmt,
    fs::File,
    mem,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering::Relaxed},
    },
    thread,
};

use bstr::{BStr, BString, ByteSlice};

use crate::{
    buffer::SideBufferPool,
    decoder::{Decoder, DecoderError},
    init::{self, PreScan, ScanContext, ScanControl, ScanInput},
    reader::{Reader, ReaderCache},
    tree::{self, NodeId, NodeKind, TYPE_DIR, TYPE_REG, Tree},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Sizing knobs for one mount's caches.
///
/// The defaults keep a mount's footprint small: eight warm readers and
/// eight 128KiB side buffers, about 1MiB of decompressed cache.
#[derive(Debug, Clone)]
pub struct Config {
    saved_readers: usize,
    side_buffers: usize,
    side_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            saved_readers: 8,
            side_buffers: 8,
            side_buffer_size: 128 << 10,
        }
    }

    /// Number of idle decompression cursors kept warm.
    pub fn saved_readers(mut self, n: usize) -> Self {
        self.saved_readers = n;
        self
    }

    /// Number of side buffer slots.
    pub fn side_buffers(mut self, n: usize) -> Self {
        self.side_buffers = n;
        self
    }

    /// Byte capacity of one side buffer slot. Also the chunk size of
    /// forward skips and of the raw-archive size probe.
    pub fn side_buffer_size(mut self, n: usize) -> Self {
        self.side_buffer_size = n;
        self
    }

    fn validate(&self) -> Result<(), MountError> {
        if self.saved_readers == 0 || self.side_buffers < 2 || self.side_buffer_size == 0 {
            bail!(MountError::new(
                MountErrorKind::InvalidConfig,
                format!(
                    "invalid cache sizing: {} readers, {} side buffers of {} bytes",
                    self.saved_readers, self.side_buffers, self.side_buffer_size,
                ),
            ));
        }
        Ok(())
    }
}

/// Per-mount behavior switches.
#[derive(Clone, Default)]
pub struct MountOptions {
    passphrase: Option<Vec<u8>>,
    async_progress: Option<String>,
    redact_archive_name: bool,
    redact_pathnames: bool,
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Passphrase for encrypted archives.
    pub fn passphrase(mut self, passphrase: impl Into<Vec<u8>>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Build the tree on a background thread instead of lazily. Until the
    /// scan completes the mount serves a synthetic root containing one
    /// marker file of the given name, whose mtime reports scan progress
    /// out of [`PROGRESS_SCALE`][crate::PROGRESS_SCALE].
    pub fn async_progress(mut self, marker: impl Into<String>) -> Self {
        self.async_progress = Some(marker.into());
        self
    }

    /// Log `[redacted]` instead of the archive's filename.
    pub fn redact_archive_name(mut self, redact: bool) -> Self {
        self.redact_archive_name = redact;
        self
    }

    /// Log `[redacted]` instead of entry pathnames.
    pub fn redact_pathnames(mut self, redact: bool) -> Self {
        self.redact_pathnames = redact;
        self
    }
}

// The passphrase stays out of Debug output.
impl fmt::Debug for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountOptions")
            .field("passphrase", &self.passphrase.as_ref().map(|_| ".."))
            .field("async_progress", &self.async_progress)
            .field("redact_archive_name", &self.redact_archive_name)
            .field("redact_pathnames", &self.redact_pathnames)
            .finish()
    }
}

/// Why a mount could not be established (or why its scan failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum MountErrorKind {
    /// The archive file could not be opened or a decode session could not
    /// be created over it.
    CannotOpen,
    /// The archive's headers could not be parsed at all.
    InvalidHeader,
    /// Headers parsed but the archive's contents are malformed.
    InvalidContents,
    /// A raw stream with no recognized compression filter.
    InvalidRawArchive,
    PassphraseRequired,
    PassphraseIncorrect,
    PassphraseNotSupported,
    /// Rejected [`Config`] or [`MountOptions`] values.
    InvalidConfig,
    /// The scan was cancelled by shutdown.
    Cancelled,
}

impl MountErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            MountErrorKind::CannotOpen => "cannot open archive",
            MountErrorKind::InvalidHeader => "invalid archive header",
            MountErrorKind::InvalidContents => "invalid archive contents",
            MountErrorKind::InvalidRawArchive => "invalid raw archive",
            MountErrorKind::PassphraseRequired => "passphrase required",
            MountErrorKind::PassphraseIncorrect => "incorrect passphrase",
            MountErrorKind::PassphraseNotSupported => "passphrase not supported",
            MountErrorKind::InvalidConfig => "invalid configuration",
            MountErrorKind::Cancelled => "cancelled",
        }
    }
}

/// A fatal, sticky mount failure.
///
/// Once the scan fails, every subsequent operation on the session reports
/// the same error; a partial tree is never served.
#[derive(Clone)]
pub struct MountError(Box<MountErrorInner>);

#[derive(Clone)]
struct MountErrorInner {
    kind: MountErrorKind,
    message: String,
}

impl MountError {
    pub(crate) fn new(kind: MountErrorKind, message: impl Into<String>) -> Self {
        Self(Box::new(MountErrorInner {
            kind,
            message: message.into(),
        }))
    }

    pub fn kind(&self) -> MountErrorKind {
        self.0.kind
    }

    pub fn message(&self) -> &str {
        &self.0.message
    }
}

impl fmt::Debug for MountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountError")
            .field("kind", &self.0.kind)
            .field("message", &self.0.message)
            .finish()
    }
}

impl fmt::Display for MountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.0.kind.as_str(), self.0.message)
    }
}

impl std::error::Error for MountError {}

/// A per-operation failure, shaped for easy mapping onto errno-style
/// transports.
#[derive(Debug)]
pub enum Error {
    /// No node at the given pathname (`ENOENT`).
    NotFound,
    /// Content access on a directory (`EISDIR`).
    IsADirectory,
    /// Directory access on a non-directory (`ENOTDIR`).
    NotADirectory,
    /// `readlink` on a non-symlink (`ENOLINK`).
    NotALink,
    /// Write access, or the synthetic progress marker (`EACCES`).
    PermissionDenied,
    /// Malformed request parameters (`EINVAL`).
    InvalidArgument,
    /// Content access while a background scan is still running (`EIO`).
    NotReady,
    /// The decoder failed mid-read (`EIO`).
    Decode(DecoderError),
    /// The initialization scan failed; sticky (`EIO`).
    Mount(MountError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => f.pad("no such file or directory"),
            Error::IsADirectory => f.pad("is a directory"),
            Error::NotADirectory => f.pad("not a directory"),
            Error::NotALink => f.pad("not a symbolic link"),
            Error::PermissionDenied => f.pad("permission denied"),
            Error::InvalidArgument => f.pad("invalid argument"),
            Error::NotReady => f.pad("initialization has not completed"),
            Error::Decode(err) => write!(f, "decode failed: {err}"),
            Error::Mount(err) => write!(f, "mount failed: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Decode(err) => Some(err),
            Error::Mount(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DecoderError> for Error {
    #[cold]
    fn from(err: DecoderError) -> Self {
        Error::Decode(err)
    }
}

impl From<MountError> for Error {
    #[cold]
    fn from(err: MountError) -> Self {
        Error::Mount(err)
    }
}

/// The access mode a transport requests in `open`. Anything but
/// [`AccessMode::ReadOnly`] is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Stat-shaped node attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttr {
    pub kind: NodeKind,
    /// File-type bits plus read/execute permissions; never writable.
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    /// Always 1; archives carry no hard links.
    pub nlink: u32,
}

/// One `readdir` row.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: BString,
    pub attr: FileAttr,
}

/// An open regular file: the node's identity plus this handle's warm
/// decompression cursor.
///
/// Handles are not thread-safe cursors; a transport that reads one handle
/// from several threads must serialize those reads, which is what FUSE
/// does per file handle anyway.
pub struct FileHandle {
    node: NodeId,
    index_within_archive: u64,
    size: u64,
    reader: Option<Reader>,
    label: String,
}

impl FileHandle {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("node", &self.node)
            .field("index_within_archive", &self.index_within_archive)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

enum InitState {
    /// Tree not built yet. Holds the pre-scan in lazy-sync mode; in
    /// background mode the scan thread owns it and this holds `None`.
    Pending(Option<PreScan>),
    Ready(Arc<Tree>),
    Failed(MountError),
}

struct Shared {
    state: Mutex<InitState>,
    /// Background scan finished (successfully or not). Always `true` in
    /// lazy-sync mode.
    complete: AtomicBool,
    control: Arc<ScanControl>,
    pool: SideBufferPool,
    readers: ReaderCache,
    decoder: Arc<dyn Decoder>,
    archive_path: std::path::PathBuf,
    passphrase: Option<Vec<u8>>,
    archive_label: String,
    redact_pathnames: bool,
    /// Marker filename, present iff the scan runs in the background.
    async_marker: Option<String>,
}

impl Shared {
    fn build_now(&self, pre: PreScan) -> InitState {
        let result = init::build_tree(
            pre,
            &ScanContext {
                pool: &self.pool,
                control: &self.control,
                archive_label: &self.archive_label,
                redact_pathnames: self.redact_pathnames,
            },
        );
        match result {
            Ok(tree) => InitState::Ready(Arc::new(tree)),
            Err(err) => InitState::Failed(err),
        }
    }
}

/// One mounted archive.
pub struct MountSession {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl fmt::Debug for MountSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountSession")
            .field("archive", &self.shared.archive_label)
            .field("complete", &self.shared.complete.load(Relaxed))
            .finish_non_exhaustive()
    }
}

impl MountSession {
    /// Open `archive_path` and run the synchronous pre-scan. On return the
    /// archive is known to be mountable; the tree itself may still be
    /// pending.
    pub fn new(
        archive_path: impl AsRef<Path>,
        decoder: Arc<dyn Decoder>,
        options: MountOptions,
        config: Config,
    ) -> Result<Self, MountError> {
        let archive_path = archive_path.as_ref().to_path_buf();
        config.validate()?;
        if let Some(marker) = &options.async_progress {
            if !tree::valid_pathname(BStr::new(marker.as_bytes()), false) {
                bail!(MountError::new(
                    MountErrorKind::InvalidConfig,
                    format!("invalid progress marker name: {marker:?}"),
                ));
            }
        }

        let archive_label = if options.redact_archive_name {
            "[redacted]".to_owned()
        } else {
            archive_path.display().to_string()
        };

        let file = File::open(&archive_path).map_err(|err| {
            error!("could not open {archive_label}: {err}");
            MountError::new(MountErrorKind::CannotOpen, err.to_string())
        })?;
        let archive_size = file
            .metadata()
            .map_err(|err| MountError::new(MountErrorKind::CannotOpen, err.to_string()))?
            .len();

        let control = Arc::new(ScanControl::new(archive_size));
        let input = ScanInput::new(file, Arc::clone(&control));
        let pre = init::pre_scan(
            decoder.as_ref(),
            Box::new(input),
            options.passphrase.as_deref(),
            &archive_label,
        )?;

        let background = options.async_progress.is_some();
        let (held_pre, worker_pre) = if background {
            (None, Some(pre))
        } else {
            (Some(pre), None)
        };
        let shared = Arc::new(Shared {
            state: Mutex::new(InitState::Pending(held_pre)),
            complete: AtomicBool::new(!background),
            control,
            pool: SideBufferPool::new(config.side_buffers, config.side_buffer_size),
            readers: ReaderCache::new(config.saved_readers),
            decoder,
            archive_path,
            passphrase: options.passphrase,
            archive_label,
            redact_pathnames: options.redact_pathnames,
            async_marker: options.async_progress,
        });

        let mut session = Self {
            shared,
            worker: None,
        };
        if let Some(pre) = worker_pre {
            let shared = Arc::clone(&session.shared);
            // The thread owns the pre-scan; the session only keeps the join
            // handle, so dropping the session can always interrupt and join.
            session.worker = Some(thread::spawn(move || {
                let state = shared.build_now(pre);
                *shared.state.lock().unwrap() = state;
                shared.complete.store(true, Relaxed);
            }));
        }
        Ok(session)
    }

    /// Scan progress out of [`PROGRESS_SCALE`][crate::PROGRESS_SCALE].
    pub fn initialization_progress(&self) -> u32 {
        self.shared.control.progress()
    }

    /// Whether the tree build has finished (successfully or not). Always
    /// true after the first operation in lazy-sync mode.
    pub fn initialization_complete(&self) -> bool {
        self.shared.complete.load(Relaxed)
    }

    /// The built tree, building it now if this mount is lazy-sync and no
    /// operation has run yet.
    pub fn tree(&self) -> Result<Arc<Tree>> {
        let mut state = self.shared.state.lock().unwrap();
        if let InitState::Pending(pre) = &mut *state {
            let Some(pre) = pre.take() else {
                // Background mode: the scan thread owns the pre-scan and
                // callers must not block on it.
                bail!(Error::NotReady);
            };
            *state = self.shared.build_now(pre);
            self.shared.complete.store(true, Relaxed);
        }
        match &*state {
            InitState::Ready(tree) => Ok(Arc::clone(tree)),
            InitState::Failed(err) => Err(Error::Mount(err.clone())),
            InitState::Pending(_) => unreachable!("resolved above"),
        }
    }

    /// The still-scanning synthetic filesystem, if it applies: `Some` iff
    /// this mount scans in the background and the scan has not completed.
    fn pending_marker(&self) -> Option<&str> {
        let marker = self.shared.async_marker.as_deref()?;
        (!self.shared.complete.load(Relaxed)).then_some(marker)
    }

    fn node_attr(node: &tree::Node) -> FileAttr {
        FileAttr {
            kind: node.kind,
            mode: node.mode,
            size: node.size,
            mtime: node.mtime,
            nlink: 1,
        }
    }

    fn marker_attr(&self) -> FileAttr {
        FileAttr {
            kind: NodeKind::RegularFile,
            // Deliberately unreadable: the marker has no content, only an
            // mtime.
            mode: TYPE_REG,
            size: 0,
            mtime: i64::from(self.shared.control.progress()),
            nlink: 1,
        }
    }

    pub fn getattr(&self, pathname: impl AsRef<[u8]>) -> Result<FileAttr> {
        let pathname = pathname.as_ref();
        if let Some(marker) = self.pending_marker() {
            if pathname == b"/" {
                return Ok(FileAttr {
                    kind: NodeKind::Directory,
                    mode: TYPE_DIR | 0o555,
                    size: 0,
                    mtime: 0,
                    nlink: 1,
                });
            } else if pathname.strip_prefix(b"/") == Some(marker.as_bytes()) {
                return Ok(self.marker_attr());
            }
            bail!(Error::NotFound);
        }

        let tree = self.tree()?;
        let id = tree.get(pathname).ok_or(Error::NotFound)?;
        Ok(Self::node_attr(tree.node(id)))
    }

    pub fn readlink(&self, pathname: impl AsRef<[u8]>) -> Result<BString> {
        let pathname = pathname.as_ref();
        if let Some(marker) = self.pending_marker() {
            if pathname == b"/" || pathname.strip_prefix(b"/") == Some(marker.as_bytes()) {
                bail!(Error::NotALink);
            }
            bail!(Error::NotFound);
        }

        let tree = self.tree()?;
        let id = tree.get(pathname).ok_or(Error::NotFound)?;
        tree.node(id).symlink_target.clone().ok_or(Error::NotALink)
    }

    /// List a directory's children in archive insertion order.
    ///
    /// The `.` and `..` rows are not synthesized here; the transport adds
    /// them per its own directory-filler convention.
    pub fn readdir(&self, pathname: impl AsRef<[u8]>) -> Result<Vec<DirEntry>> {
        let pathname = pathname.as_ref();
        if let Some(marker) = self.pending_marker() {
            if pathname == b"/" {
                return Ok(vec![DirEntry {
                    name: BString::from(marker),
                    attr: self.marker_attr(),
                }]);
            } else if pathname.strip_prefix(b"/") == Some(marker.as_bytes()) {
                bail!(Error::NotADirectory);
            }
            bail!(Error::NotFound);
        }

        let tree = self.tree()?;
        let id = tree.get(pathname).ok_or(Error::NotFound)?;
        if !tree.node(id).is_dir() {
            bail!(Error::NotADirectory);
        }
        Ok(tree
            .children(id)
            .map(|(_, node)| DirEntry {
                name: node.rel_name.clone(),
                attr: Self::node_attr(node),
            })
            .collect())
    }

    /// Open a regular file for reading and pin a warm reader to the
    /// returned handle.
    pub fn open(&self, pathname: impl AsRef<[u8]>, access: AccessMode) -> Result<FileHandle> {
        let pathname = pathname.as_ref();
        if let Some(marker) = self.pending_marker() {
            if pathname == b"/" {
                bail!(Error::IsADirectory);
            } else if pathname.strip_prefix(b"/") == Some(marker.as_bytes()) {
                bail!(Error::PermissionDenied);
            }
            bail!(Error::NotFound);
        }

        let tree = self.tree()?;
        let id = tree.get(pathname).ok_or(Error::NotFound)?;
        let node = tree.node(id);
        if node.is_dir() {
            bail!(Error::IsADirectory);
        }
        if access != AccessMode::ReadOnly {
            bail!(Error::PermissionDenied);
        }
        let index = node.index_within_archive.ok_or(Error::InvalidArgument)?;

        let reader = self.acquire_reader(index)?;
        Ok(FileHandle {
            node: id,
            index_within_archive: index,
            size: node.size,
            reader: Some(reader),
            label: self.pathname_label(pathname.as_bstr()),
        })
    }

    /// Read `dst.len()` bytes at `offset`, short only at end-of-file.
    ///
    /// Served from a side buffer when one covers the range; otherwise the
    /// handle's reader decompresses forward to `offset` (replacing itself
    /// with a better-positioned one first if it has already passed it) and
    /// then decodes into `dst`.
    pub fn read(&self, handle: &mut FileHandle, offset: u64, dst: &mut [u8]) -> Result<usize> {
        if self.pending_marker().is_some() {
            bail!(Error::NotReady);
        }
        self.tree()?;

        if offset >= handle.size {
            return Ok(0);
        }
        let len = dst.len().min((handle.size - offset) as usize);
        let dst = &mut dst[..len];
        if len == 0 {
            return Ok(0);
        }

        if self
            .shared
            .pool
            .read_into(handle.index_within_archive, offset, dst)
        {
            return Ok(len);
        }

        let reader = handle.reader.as_mut().ok_or(Error::InvalidArgument)?;
        if offset < reader.offset_within_entry() {
            // The stream has already passed this offset and cannot seek
            // backwards. Swap in the best-positioned idle reader and
            // return the overshot one to the pool.
            trace!(
                "seeking backwards to {offset} in {}: swapping readers",
                handle.label,
            );
            let fresh = self.acquire_reader(handle.index_within_archive)?;
            let old = mem::replace(reader, fresh);
            self.shared.readers.release(old);
        }

        reader
            .advance_offset(offset, &self.shared.pool)
            .map_err(|err| {
                error!("could not advance to {offset} in {}: {err}", handle.label);
                Error::Decode(err)
            })?;
        let n = reader.read(dst).map_err(|err| {
            error!("could not read {} bytes from {}: {err}", len, handle.label);
            Error::Decode(err)
        })?;
        Ok(n)
    }

    /// Close a handle, returning its reader to the warm pool.
    pub fn release(&self, mut handle: FileHandle) {
        if let Some(reader) = handle.reader.take() {
            self.shared.readers.release(reader);
        }
    }

    fn acquire_reader(&self, index: u64) -> Result<Reader> {
        let shared = &self.shared;
        shared
            .readers
            .acquire(index, || {
                let file = File::open(&shared.archive_path).map_err(DecoderError::from)?;
                let session = shared
                    .decoder
                    .open(Box::new(file), shared.passphrase.as_deref())?;
                Ok(Reader::new(session))
            })
            .map_err(|err| {
                error!(
                    "could not position a reader at entry {index} of {}: {err}",
                    shared.archive_label,
                );
                Error::Decode(err)
            })
    }

    fn pathname_label(&self, pathname: &BStr) -> String {
        if self.shared.redact_pathnames {
            "[redacted]".to_owned()
        } else {
            pathname.to_string()
        }
    }
}

impl Drop for MountSession {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.shared.control.cancel();
            let _ = worker.join();
        }
    }
}
