//! Log file management: filename sequencing under 8.3 constraints and the
//! framed record writer.
//!
//! Log files live at `<dir>/<base>[_<N>]`. Within a directory the bare
//! basename counts as sequence 0 and `base_<N>` as sequence N; a new file
//! always takes the next free sequence number. The FAT name field is 8
//! characters, so a basename that leaves no room for `_<N>` fails rather
//! than silently colliding.
//!
//! On the wire each record is `0x00 | COBS(<delimited record>)`: the zero
//! marks the frame boundary, and the COBS body is zero-free, so a reader
//! can resynchronize after torn writes from power loss.

use crate::encoding::cobs;
use crate::record::{Record, MAX_RECORD_LEN};
use tachyon_core::{File, Filesystem, FsError};

/// Longest directory or base name component.
pub const NAME_LEN: usize = 8;

/// A sequentially appended record file.
pub struct RecordFile<F: Filesystem> {
    file: Option<F::File>,
}

impl<F: Filesystem> RecordFile<F> {
    /// No file open.
    pub const fn new() -> Self {
        Self { file: None }
    }

    /// `true` while a file is open for appending.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Create the next file in sequence under `dirname`, creating the
    /// directory if needed.
    pub fn new_file(
        &mut self,
        fs: &mut F,
        dirname: &str,
        basename: &str,
    ) -> Result<(), FsError> {
        if self.file.is_some() {
            warn!("previous log file never closed");
            self.file = None;
        }
        if dirname.len() > NAME_LEN || basename.len() > NAME_LEN {
            return Err(FsError::InvalidPath);
        }

        let mut next_seq: u32 = 0;
        match fs.read_dir(dirname, &mut |entry| {
            if let Some(seq) = entry_sequence(entry, basename) {
                next_seq = next_seq.max(seq + 1);
            }
        }) {
            Ok(()) => {}
            Err(FsError::NotFound) => {
                fs.make_dir(dirname)?;
            }
            Err(e) => return Err(e),
        }

        // <dir>/<base>[_<seq>]
        let mut path = [0u8; NAME_LEN + 1 + NAME_LEN];
        let mut len = 0;
        path[..dirname.len()].copy_from_slice(dirname.as_bytes());
        len += dirname.len();
        path[len] = b'/';
        len += 1;
        path[len..len + basename.len()].copy_from_slice(basename.as_bytes());
        len += basename.len();

        if next_seq > 0 {
            let digits_room = NAME_LEN.saturating_sub(basename.len() + 1);
            if digits_room == 0 {
                warn!("basename '{}' leaves no room for a sequence", basename);
                return Err(FsError::InvalidPath);
            }
            path[len] = b'_';
            let digits = format_u32(&mut path[len + 1..len + 1 + digits_room], next_seq);
            if digits == 0 {
                warn!("basename '{}' too long for sequence {}", basename, next_seq);
                return Err(FsError::InvalidPath);
            }
            len += 1 + digits;
        }

        let path = core::str::from_utf8(&path[..len]).map_err(|_| FsError::InvalidPath)?;
        debug!("opening log file '{}'", path);
        self.file = Some(fs.create(path)?);
        Ok(())
    }

    /// Frame and append one record. Silently returns `false` with no file
    /// open or on any encoding or write failure.
    pub fn write(&mut self, record: &Record<'_>) -> bool {
        let Some(file) = self.file.as_mut() else {
            return false;
        };
        let mut encoded = [0u8; MAX_RECORD_LEN];
        let Ok(encoded_len) = record.encode_delimited(&mut encoded) else {
            return false;
        };
        let mut framed = [0u8; 1 + cobs::max_encoded_len(MAX_RECORD_LEN)];
        framed[0] = 0; // frame boundary marker
        let Some(cobs_len) = cobs::encode(&encoded[..encoded_len], &mut framed[1..]) else {
            return false;
        };
        file.write(&framed[..1 + cobs_len]).is_ok()
    }

    /// Flush to the medium.
    pub fn sync(&mut self) -> bool {
        match self.file.as_mut() {
            Some(file) => file.sync().is_ok(),
            None => false,
        }
    }

    /// Close the file; further writes no-op until the next
    /// [`new_file`](Self::new_file).
    pub fn close(&mut self) -> bool {
        match self.file.take() {
            Some(mut file) => file.close().is_ok(),
            None => false,
        }
    }
}

impl<F: Filesystem> Default for RecordFile<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Sequence number a directory entry claims for `basename`: 0 for the bare
/// basename, N for `basename_<N>`, `None` for unrelated entries (including
/// anything carrying an extension).
fn entry_sequence(entry: &str, basename: &str) -> Option<u32> {
    let rest = entry.strip_prefix(basename)?;
    if rest.is_empty() {
        return Some(0);
    }
    let digits = rest.strip_prefix('_')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Decimal-format `value` into `out`, returning the digit count, or 0 if it
/// does not fit.
fn format_u32(out: &mut [u8], value: u32) -> usize {
    let mut digits = 1;
    let mut probe = value;
    while probe >= 10 {
        digits += 1;
        probe /= 10;
    }
    if digits > out.len() {
        return 0;
    }
    let mut value = value;
    for slot in out[..digits].iter_mut().rev() {
        *slot = b'0' + (value % 10) as u8;
        value /= 10;
    }
    digits
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::record::info_record;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;
    use std::string::{String, ToString};
    use std::vec::Vec;

    /// In-memory 8.3-flavored filesystem shared with the logger tests.
    #[derive(Default)]
    pub(crate) struct FsState {
        pub mounted: bool,
        pub mount_fails: bool,
        pub dirs: BTreeMap<String, Vec<String>>,
        pub files: Vec<(String, Rc<RefCell<FileState>>)>,
        pub unmounts: u32,
    }

    #[derive(Default)]
    pub(crate) struct FileState {
        pub bytes: Vec<u8>,
        pub synced_len: usize,
        pub closed: bool,
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeFs(pub Rc<RefCell<FsState>>);

    pub(crate) struct FakeFile(Rc<RefCell<FileState>>);

    impl File for FakeFile {
        fn write(&mut self, bytes: &[u8]) -> Result<(), FsError> {
            let mut state = self.0.borrow_mut();
            if state.closed {
                return Err(FsError::Io);
            }
            state.bytes.extend_from_slice(bytes);
            Ok(())
        }
        fn sync(&mut self) -> Result<(), FsError> {
            let mut state = self.0.borrow_mut();
            state.synced_len = state.bytes.len();
            Ok(())
        }
        fn close(&mut self) -> Result<(), FsError> {
            self.0.borrow_mut().closed = true;
            Ok(())
        }
    }

    impl Filesystem for FakeFs {
        type File = FakeFile;

        fn mount(&mut self) -> Result<(), FsError> {
            let mut state = self.0.borrow_mut();
            if state.mount_fails {
                return Err(FsError::NoMedium);
            }
            state.mounted = true;
            Ok(())
        }

        fn unmount(&mut self) {
            let mut state = self.0.borrow_mut();
            state.mounted = false;
            state.unmounts += 1;
        }

        fn read_dir(&mut self, dir: &str, visit: &mut dyn FnMut(&str)) -> Result<(), FsError> {
            let state = self.0.borrow();
            let entries = state.dirs.get(dir).ok_or(FsError::NotFound)?;
            for entry in entries {
                visit(entry);
            }
            Ok(())
        }

        fn make_dir(&mut self, dir: &str) -> Result<(), FsError> {
            self.0
                .borrow_mut()
                .dirs
                .insert(dir.to_string(), Vec::new());
            Ok(())
        }

        fn create(&mut self, path: &str) -> Result<FakeFile, FsError> {
            let mut state = self.0.borrow_mut();
            let (dir, name) = path.split_once('/').ok_or(FsError::InvalidPath)?;
            state
                .dirs
                .get_mut(dir)
                .ok_or(FsError::NotFound)?
                .push(name.to_string());
            let file = Rc::new(RefCell::new(FileState::default()));
            state.files.push((path.to_string(), file.clone()));
            Ok(FakeFile(file))
        }
    }

    impl FakeFs {
        pub(crate) fn with_dir(dir: &str, entries: &[&str]) -> Self {
            let fs = Self::default();
            fs.0.borrow_mut().dirs.insert(
                dir.to_string(),
                entries.iter().map(|e| e.to_string()).collect(),
            );
            fs
        }

        pub(crate) fn created_paths(&self) -> Vec<String> {
            self.0
                .borrow()
                .files
                .iter()
                .map(|(path, _)| path.clone())
                .collect()
        }

        pub(crate) fn last_file(&self) -> Rc<RefCell<FileState>> {
            self.0.borrow().files.last().unwrap().1.clone()
        }
    }

    #[test]
    fn sequence_scans_existing_entries() {
        // Scenario from the bench: 0830, 0830_1 and 0830_3 exist; the next
        // file is 0830_4.
        let mut fs = FakeFs::with_dir("20240115", &["0830", "0830_1", "0830_3"]);
        let mut file = RecordFile::new();
        file.new_file(&mut fs, "20240115", "0830").unwrap();
        assert_eq!(fs.created_paths(), ["20240115/0830_4"]);
    }

    #[test]
    fn first_file_takes_bare_basename() {
        let mut fs = FakeFs::with_dir("20240115", &[]);
        let mut file = RecordFile::new();
        file.new_file(&mut fs, "20240115", "0830").unwrap();
        assert_eq!(fs.created_paths(), ["20240115/0830"]);
    }

    #[test]
    fn missing_directory_is_created() {
        let mut fs = FakeFs::default();
        let mut file = RecordFile::new();
        file.new_file(&mut fs, "20240115", "0830").unwrap();
        assert!(fs.0.borrow().dirs.contains_key("20240115"));
        assert_eq!(fs.created_paths(), ["20240115/0830"]);
    }

    #[test]
    fn unrelated_and_suffixed_entries_are_ignored() {
        let mut fs = FakeFs::with_dir(
            "20240115",
            &["0900", "0830_2.BAK", "0830_X", "0830_12"],
        );
        let mut file = RecordFile::new();
        file.new_file(&mut fs, "20240115", "0830").unwrap();
        assert_eq!(fs.created_paths(), ["20240115/0830_13"]);
    }

    #[test]
    fn basename_too_long_for_sequence_fails() {
        // 8-character basename exists already: no room for `_1`.
        let mut fs = FakeFs::with_dir("20240115", &["COLDSTRT"]);
        let mut file = RecordFile::new();
        assert_eq!(
            file.new_file(&mut fs, "20240115", "COLDSTRT"),
            Err(FsError::InvalidPath)
        );

        // 7 characters leave no digit room either once `_` is added.
        let mut fs = FakeFs::with_dir("20240115", &["LOGFILE"]);
        assert_eq!(
            file.new_file(&mut fs, "20240115", "LOGFILE"),
            Err(FsError::InvalidPath)
        );
    }

    #[test]
    fn component_length_limits() {
        let mut fs = FakeFs::default();
        let mut file = RecordFile::new();
        assert_eq!(
            file.new_file(&mut fs, "DIRECTORY9", "0830"),
            Err(FsError::InvalidPath)
        );
        assert_eq!(
            file.new_file(&mut fs, "20240115", "BASENAME9"),
            Err(FsError::InvalidPath)
        );
    }

    #[test]
    fn records_are_zero_delimited_cobs_frames() {
        let mut fs = FakeFs::with_dir("20240115", &[]);
        let mut file = RecordFile::new();
        file.new_file(&mut fs, "20240115", "0830").unwrap();
        assert!(file.write(&info_record("FS mounted", 1, 10)));
        assert!(file.write(&info_record("second", 1, 20)));

        let handle = fs.last_file();
        let state = handle.borrow();
        // Each record starts with the frame marker and is zero-free after
        // it.
        assert_eq!(state.bytes[0], 0);
        let frames: Vec<&[u8]> = state.bytes[1..].split(|&b| b == 0).collect();
        assert_eq!(frames.len(), 2);
        for frame in frames {
            assert!(!frame.is_empty());
            let mut decoded = [0u8; MAX_RECORD_LEN];
            let len = cobs::decode(frame, &mut decoded).expect("well-formed COBS");
            let (body, consumed) = crate::proto::read_delimited(&decoded[..len]).unwrap();
            assert_eq!(consumed, len);
            let _ = body;
        }
    }

    #[test]
    fn closed_file_write_is_a_silent_no_op() {
        let mut fs = FakeFs::with_dir("20240115", &[]);
        let mut file: RecordFile<FakeFs> = RecordFile::new();
        assert!(!file.write(&info_record("nope", 1, 0)));
        assert!(!file.sync());
        assert!(!file.close());

        file.new_file(&mut fs, "20240115", "0830").unwrap();
        assert!(file.write(&info_record("yes", 1, 0)));
        assert!(file.sync());
        assert!(file.close());
        assert!(!file.write(&info_record("nope", 1, 0)));
    }

    #[test]
    fn format_u32_fits_or_fails() {
        let mut buf = [0u8; 3];
        assert_eq!(format_u32(&mut buf, 0), 1);
        assert_eq!(&buf[..1], b"0");
        assert_eq!(format_u32(&mut buf, 999), 3);
        assert_eq!(&buf[..3], b"999");
        assert_eq!(format_u32(&mut buf, 1000), 0);
    }
}
