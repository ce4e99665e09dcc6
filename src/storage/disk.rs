use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::common::{PageId, FIRST_DATA_PAGE_ID, PAGE_SIZE};
use crate::error::{DbError, Result};
use crate::storage::checksum;

/// Magic bytes branding page 0 of every database file.
pub const FILE_MAGIC: &[u8; 8] = b"FRANCODB";

/// Magic prefix of the sidecar metadata file.
const META_MAGIC: &[u8; 8] = b"FDB.META";

/// Enforced database file extension.
const FILE_EXTENSION: &str = "fdb";

/// DiskManager performs the physical page reads and writes for one database
/// file. It is the only component in the core that touches the file directly.
///
/// The file is created on first open with the magic header in page 0; any
/// later open validates that header and fails with `CorruptFile` otherwise.
/// All positional I/O is serialized by an internal lock. When an encryption
/// key is set, every page except page 0 is XORed with a keystream derived
/// from the key and the page id on its way to and from disk.
pub struct DiskManager {
    file_path: PathBuf,
    meta_path: PathBuf,
    io: Mutex<File>,
    encryption_key: RwLock<Option<String>>,
}

impl DiskManager {
    /// Create or open a database file, appending the `.fdb` extension when
    /// missing.
    pub fn new(db_file: impl AsRef<Path>) -> Result<Self> {
        let raw = db_file.as_ref();
        let file_path = if raw.extension().and_then(|e| e.to_str()) == Some(FILE_EXTENSION) {
            raw.to_path_buf()
        } else {
            let mut name = raw.as_os_str().to_os_string();
            name.push(".fdb");
            PathBuf::from(name)
        };

        if let Some(parent) = file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&file_path)?;

        let mut meta_name = file_path.as_os_str().to_os_string();
        meta_name.push(".meta");

        let manager = Self {
            file_path: file_path.clone(),
            meta_path: PathBuf::from(meta_name),
            io: Mutex::new(file),
            encryption_key: RwLock::new(None),
        };

        if manager.file_len()? == 0 {
            // Brand a fresh file with the magic page.
            let mut magic_page = [0u8; PAGE_SIZE];
            magic_page[..FILE_MAGIC.len()].copy_from_slice(FILE_MAGIC);
            manager.write_page_raw(0, &magic_page)?;
            manager.flush()?;
            info!(file = %file_path.display(), "created new database file");
        } else {
            let page = manager.read_page_raw(0)?;
            if &page[..FILE_MAGIC.len()] != FILE_MAGIC {
                return Err(DbError::CorruptFile(format!(
                    "{} is missing the magic header",
                    file_path.display()
                )));
            }
        }

        Ok(manager)
    }

    /// Read one page, zero-padding short reads past end of file.
    ///
    /// Data pages with a non-zero stored checksum are verified after any
    /// decryption; a mismatch is fatal to the caller but not to the engine.
    pub fn read_page(&self, page_id: PageId) -> Result<[u8; PAGE_SIZE]> {
        if page_id < 0 {
            return Err(DbError::InvalidPageId(page_id));
        }
        let mut data = self.read_page_raw(page_id)?;
        if page_id != 0 {
            self.apply_keystream(page_id, &mut data);
        }
        if page_id >= FIRST_DATA_PAGE_ID
            && checksum::stored_checksum(&data) != 0
            && !checksum::verify_page_checksum(&data)
        {
            return Err(DbError::ChecksumMismatch(format!(
                "page {} failed verification on read",
                page_id
            )));
        }
        Ok(data)
    }

    /// Write one page. The caller must have recomputed the page checksum;
    /// page 0 is reserved for the creation path and rejected here.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        if page_id <= 0 {
            return Err(DbError::InvalidPageId(page_id));
        }
        if !checksum::verify_page_checksum(data) {
            return Err(DbError::ChecksumMismatch(format!(
                "page {} written without a valid checksum",
                page_id
            )));
        }
        let mut out = *data;
        self.apply_keystream(page_id, &mut out);
        self.write_page_raw(page_id, &out)
    }

    /// Number of pages currently backed by the file.
    pub fn num_pages(&self) -> Result<u32> {
        Ok((self.file_len()? / PAGE_SIZE as u64) as u32)
    }

    /// Force all buffered writes to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.io.lock().sync_all()?;
        Ok(())
    }

    /// Write the sidecar metadata file, prefixed with its magic bytes.
    pub fn write_metadata(&self, data: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(META_MAGIC.len() + data.len());
        bytes.extend_from_slice(META_MAGIC);
        bytes.extend_from_slice(data.as_bytes());
        std::fs::write(&self.meta_path, bytes)?;
        Ok(())
    }

    /// Read the sidecar metadata file, validating its magic prefix.
    pub fn read_metadata(&self) -> Result<Option<String>> {
        if !self.meta_path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&self.meta_path)?;
        if bytes.len() < META_MAGIC.len() || &bytes[..META_MAGIC.len()] != META_MAGIC {
            return Err(DbError::CorruptFile(format!(
                "{} is missing the metadata magic header",
                self.meta_path.display()
            )));
        }
        let body = String::from_utf8(bytes[META_MAGIC.len()..].to_vec())
            .map_err(|e| DbError::CorruptFile(e.to_string()))?;
        Ok(Some(body))
    }

    /// Enable or disable transparent page encryption. An empty key disables.
    pub fn set_encryption_key(&self, key: &str) {
        let mut guard = self.encryption_key.write();
        *guard = if key.is_empty() {
            None
        } else {
            Some(key.to_string())
        };
    }

    pub fn is_encryption_enabled(&self) -> bool {
        self.encryption_key.read().is_some()
    }

    pub fn file_name(&self) -> &Path {
        &self.file_path
    }

    /// Flush pending writes ahead of dropping the handle.
    pub fn shutdown(&self) -> Result<()> {
        self.flush()
    }

    fn file_len(&self) -> Result<u64> {
        Ok(self.io.lock().metadata()?.len())
    }

    fn read_page_raw(&self, page_id: PageId) -> Result<[u8; PAGE_SIZE]> {
        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut data = [0u8; PAGE_SIZE];
        let mut file = self.io.lock();
        file.seek(SeekFrom::Start(offset))?;

        let mut read_total = 0;
        while read_total < PAGE_SIZE {
            let n = file.read(&mut data[read_total..])?;
            if n == 0 {
                break; // Past EOF: remainder stays zero.
            }
            read_total += n;
        }
        Ok(data)
    }

    fn write_page_raw(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.io.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// XOR the page with a keystream derived from the key and page id.
    /// Applying it twice restores the original bytes.
    fn apply_keystream(&self, page_id: PageId, data: &mut [u8; PAGE_SIZE]) {
        let guard = self.encryption_key.read();
        let key = match guard.as_deref() {
            Some(key) => key,
            None => return,
        };
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(key.as_bytes());
        hasher.update(&page_id.to_le_bytes());
        let mut state = hasher.finalize() | 1;
        for byte in data.iter_mut() {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            *byte ^= (state & 0xFF) as u8;
        }
    }
}
