//! File and directory store. Handles exposed to the target are 1-based
//! slot IDs in a single bounded table holding either an open file or a
//! directory iterator.

use crate::host::{HostError, HostResult};
use crate::logging;
use crate::table::{SlotTable, HANDLE_LIMIT};
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions, ReadDir};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;

pub const SEEK_SET: u32 = 0;
pub const SEEK_CUR: u32 = 1;
pub const SEEK_END: u32 = 2;

pub const TYPE_FILE: u16 = 0;
pub const TYPE_DIR: u16 = 1;
pub const TYPE_OTHER: u16 = 2;

enum Node {
    File {
        file: File,
        /// Sticky error flag, set by any failed read/write/seek and
        /// reported by the error-flag query until the handle is closed.
        error: bool,
    },
    Dir(ReadDir),
}

pub struct FileStore {
    table: SlotTable<Node>,
    log: logging::Logger,
}

impl FileStore {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> FileStore {
        FileStore {
            table: SlotTable::new(HANDLE_LIMIT),
            log: logging::child_or_discard(log.into()),
        }
    }

    /// Opens `path` with a C-style mode string (`r`, `r+`, `w`, `w+`, `a`,
    /// `a+`; a `b` suffix is accepted and ignored) and stores the file in
    /// the first free slot.
    pub fn open(&mut self, mode: &str, path: &OsStr) -> HostResult<u32> {
        let file = Self::open_options(mode)?.open(path)?;

        let id = self
            .table
            .insert(Node::File { file, error: false })
            .ok_or(HostError::Exhausted)?;

        logging::debug!(self.log, "file opened";
                        "context" => "open",
                        "mode" => mode,
                        "handle" => id);

        Ok(id)
    }

    /// Reads up to `size` bytes, short only at end-of-file.
    pub fn read(&mut self, id: u32, size: usize) -> HostResult<Vec<u8>> {
        let (file, error) = self.file_mut(id)?;

        let mut data = vec![0u8; size];
        let mut filled = 0;

        while filled < size {
            match file.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(count) => filled += count,
                Err(err) => {
                    *error = true;
                    return Err(err.into());
                }
            }
        }

        data.truncate(filled);
        Ok(data)
    }

    /// Reads one line the way `fgets` does: at most `size - 1` bytes,
    /// stopping after a newline, NUL-terminated. End-of-file with nothing
    /// read is an error so the target can detect it.
    pub fn gets(&mut self, id: u32, size: usize) -> HostResult<Vec<u8>> {
        if size == 0 {
            return Err(HostError::Unsupported);
        }

        let (file, error) = self.file_mut(id)?;

        let mut line = Vec::new();

        while line.len() < size - 1 {
            let mut byte = [0u8; 1];
            match file.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    line.push(byte[0]);
                    if byte[0] == b'\n' {
                        break;
                    }
                }
                Err(err) => {
                    *error = true;
                    return Err(err.into());
                }
            }
        }

        if line.is_empty() {
            return Err(HostError::Io(std::io::ErrorKind::UnexpectedEof));
        }

        line.push(0);
        Ok(line)
    }

    pub fn write(&mut self, id: u32, data: &[u8]) -> HostResult<u32> {
        let (file, error) = self.file_mut(id)?;

        if let Err(err) = file.write_all(data) {
            *error = true;
            return Err(err.into());
        }

        Ok(data.len() as u32)
    }

    /// The u32 offset is reinterpreted as signed for CUR/END so the target
    /// can seek backwards with wrapped values.
    pub fn seek(&mut self, id: u32, offset: u32, whence: u32) -> HostResult<()> {
        let position = match whence {
            SEEK_SET => SeekFrom::Start(u64::from(offset)),
            SEEK_CUR => SeekFrom::Current(i64::from(offset as i32)),
            SEEK_END => SeekFrom::End(i64::from(offset as i32)),
            _ => return Err(HostError::Unsupported),
        };

        let (file, error) = self.file_mut(id)?;

        if let Err(err) = file.seek(position) {
            *error = true;
            return Err(err.into());
        }

        Ok(())
    }

    pub fn tell(&mut self, id: u32) -> HostResult<u32> {
        let (file, error) = self.file_mut(id)?;

        match file.seek(SeekFrom::Current(0)) {
            Ok(position) => Ok(position as u32),
            Err(err) => {
                *error = true;
                Err(err.into())
            }
        }
    }

    /// Sticky error flag for the handle.
    pub fn error_flag(&mut self, id: u32) -> HostResult<bool> {
        let (_, error) = self.file_mut(id)?;
        Ok(*error)
    }

    /// Closes the file and frees the slot. Closing a vacant slot or a
    /// directory handle is an error.
    pub fn close(&mut self, id: u32) -> HostResult<()> {
        match self.table.get(id) {
            Some(Node::File { .. }) => (),
            Some(Node::Dir(_)) => return Err(HostError::StaleHandle),
            None => return Err(HostError::StaleHandle),
        }

        self.table.remove(id);

        logging::debug!(self.log, "file closed"; "context" => "close", "handle" => id);
        Ok(())
    }

    pub fn open_dir(&mut self, path: &OsStr) -> HostResult<u32> {
        let iter = fs::read_dir(path)?;

        let id = self
            .table
            .insert(Node::Dir(iter))
            .ok_or(HostError::Exhausted)?;

        logging::debug!(self.log, "directory opened"; "context" => "open_dir", "handle" => id);

        Ok(id)
    }

    /// Next entry name as a NUL-terminated string truncated to `size`
    /// bytes. End of directory yields the empty string.
    pub fn read_dir_entry(&mut self, id: u32, size: usize) -> HostResult<Vec<u8>> {
        if size == 0 {
            return Err(HostError::Unsupported);
        }

        let iter = match self.table.get_mut(id) {
            Some(Node::Dir(iter)) => iter,
            _ => return Err(HostError::StaleHandle),
        };

        let entry = match iter.next() {
            Some(entry) => entry?,
            None => return Ok(vec![0]),
        };

        let name = entry.file_name();
        let mut data = name.as_bytes().to_vec();
        data.truncate(size - 1);
        data.push(0);

        Ok(data)
    }

    pub fn close_dir(&mut self, id: u32) -> HostResult<()> {
        match self.table.get(id) {
            Some(Node::Dir(_)) => (),
            _ => return Err(HostError::StaleHandle),
        }

        self.table.remove(id);

        logging::debug!(self.log, "directory closed"; "context" => "close_dir", "handle" => id);
        Ok(())
    }

    /// File-type probe for a path.
    pub fn stat(&self, path: &OsStr) -> HostResult<u16> {
        let metadata = fs::metadata(path)?;
        let file_type = metadata.file_type();

        if file_type.is_file() {
            Ok(TYPE_FILE)
        } else if file_type.is_dir() {
            Ok(TYPE_DIR)
        } else {
            Ok(TYPE_OTHER)
        }
    }

    fn open_options(mode: &str) -> HostResult<OpenOptions> {
        let mut chars = mode.chars().filter(|&c| c != 'b');
        let base = chars.next().ok_or(HostError::Unsupported)?;
        let update = match chars.next() {
            None => false,
            Some('+') => true,
            Some(_) => return Err(HostError::Unsupported),
        };

        let mut options = OpenOptions::new();

        match base {
            'r' => {
                options.read(true).write(update);
            }
            'w' => {
                options.write(true).create(true).truncate(true).read(update);
            }
            'a' => {
                options.append(true).create(true).read(update);
            }
            _ => return Err(HostError::Unsupported),
        }

        Ok(options)
    }

    fn file_mut(&mut self, id: u32) -> HostResult<(&mut File, &mut bool)> {
        match self.table.get_mut(id) {
            Some(Node::File { file, error }) => Ok((file, error)),
            _ => Err(HostError::StaleHandle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;
    use std::path::Path;
    use tempfile::tempdir;

    fn os(path: &Path) -> &OsStr {
        path.as_os_str()
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let mut store = FileStore::new(None);

        let id = store.open("w", os(&path)).unwrap();
        assert_eq!(store.write(id, b"offload").unwrap(), 7);
        store.close(id).unwrap();

        let id = store.open("r", os(&path)).unwrap();
        assert_eq!(store.read(id, 16).unwrap(), b"offload");
        assert_eq!(store.read(id, 16).unwrap(), b"");
        store.close(id).unwrap();
    }

    #[test]
    fn test_gets_reads_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lines.txt");
        fs::write(&path, "first\nsecond\n").unwrap();

        let mut store = FileStore::new(None);
        let id = store.open("r", os(&path)).unwrap();

        assert_eq!(store.gets(id, 64).unwrap(), b"first\n\0");
        assert_eq!(store.gets(id, 64).unwrap(), b"second\n\0");
        assert_eq!(
            store.gets(id, 64).unwrap_err(),
            HostError::Io(ErrorKind::UnexpectedEof)
        );
    }

    #[test]
    fn test_gets_truncates_to_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("long.txt");
        fs::write(&path, "abcdefgh\n").unwrap();

        let mut store = FileStore::new(None);
        let id = store.open("r", os(&path)).unwrap();

        assert_eq!(store.gets(id, 4).unwrap(), b"abc\0");
        assert_eq!(store.gets(id, 64).unwrap(), b"defgh\n\0");
    }

    #[test]
    fn test_seek_and_tell() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seek.bin");
        fs::write(&path, "0123456789").unwrap();

        let mut store = FileStore::new(None);
        let id = store.open("r", os(&path)).unwrap();

        store.seek(id, 4, SEEK_SET).unwrap();
        assert_eq!(store.tell(id).unwrap(), 4);

        // Negative offset arrives as a wrapped u32.
        store.seek(id, (-2i32) as u32, SEEK_END).unwrap();
        assert_eq!(store.tell(id).unwrap(), 8);
        assert_eq!(store.read(id, 4).unwrap(), b"89");

        store.seek(id, 0, SEEK_SET).unwrap();
        assert_eq!(store.tell(id).unwrap(), 0);

        assert_eq!(store.seek(id, 0, 9).unwrap_err(), HostError::Unsupported);
    }

    #[test]
    fn test_error_flag_is_sticky() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flag.bin");

        let mut store = FileStore::new(None);
        let id = store.open("w", os(&path)).unwrap();

        assert_eq!(store.error_flag(id).unwrap(), false);

        // Reading a write-only handle fails and latches the flag.
        assert!(store.read(id, 4).is_err());
        assert_eq!(store.error_flag(id).unwrap(), true);
        assert_eq!(store.error_flag(id).unwrap(), true);
    }

    #[test]
    fn test_double_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("close.bin");

        let mut store = FileStore::new(None);
        let id = store.open("w", os(&path)).unwrap();

        store.close(id).unwrap();
        assert_eq!(store.close(id).unwrap_err(), HostError::StaleHandle);
    }

    #[test]
    fn test_handle_exhaustion_and_reuse() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("many.bin");
        fs::write(&path, "x").unwrap();

        let mut store = FileStore::new(None);
        let mut ids = Vec::new();

        for _ in 0..HANDLE_LIMIT {
            ids.push(store.open("r", os(&path)).unwrap());
        }

        assert_eq!(
            store.open("r", os(&path)).unwrap_err(),
            HostError::Exhausted
        );

        store.close(ids[50]).unwrap();
        assert_eq!(store.open("r", os(&path)).unwrap(), ids[50]);
    }

    #[test]
    fn test_directory_listing() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("one"), "").unwrap();
        fs::write(dir.path().join("two"), "").unwrap();

        let mut store = FileStore::new(None);
        let id = store.open_dir(os(dir.path())).unwrap();

        let mut names = Vec::new();
        loop {
            let entry = store.read_dir_entry(id, 64).unwrap();
            if entry == vec![0] {
                break;
            }
            names.push(entry);
        }
        store.close_dir(id).unwrap();

        names.sort();
        assert_eq!(names, vec![b"one\0".to_vec(), b"two\0".to_vec()]);
    }

    #[test]
    fn test_close_kind_mismatch() {
        let dir = tempdir().unwrap();

        let mut store = FileStore::new(None);
        let id = store.open_dir(os(dir.path())).unwrap();

        assert_eq!(store.close(id).unwrap_err(), HostError::StaleHandle);
        store.close_dir(id).unwrap();
    }

    #[test]
    fn test_stat_types() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain");
        fs::write(&path, "").unwrap();

        let store = FileStore::new(None);

        assert_eq!(store.stat(os(&path)).unwrap(), TYPE_FILE);
        assert_eq!(store.stat(os(dir.path())).unwrap(), TYPE_DIR);
        assert!(store.stat(os(&dir.path().join("missing"))).is_err());
    }

    #[test]
    fn test_open_rejects_unknown_mode() {
        let mut store = FileStore::new(None);

        assert_eq!(
            store.open("q", OsStr::new("/tmp/never")).unwrap_err(),
            HostError::Unsupported
        );
    }
}
