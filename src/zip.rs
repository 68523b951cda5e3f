//! Random-access ZIP reading over HTTP byte ranges.
//!
//! A remote archive URL plus its total length acts as a random-access
//! handle: fetch the tail window to find the end-of-central-directory
//! record, fetch the central directory to enumerate members, then fetch and
//! inflate one member at a time. A request touching one chain's CSVs pays
//! for those files, not for the whole archive.
//!
//! Zip64 is not handled: an archive past 4 GiB or 65535 entries fails fast
//! with [`ZipError::EocdNotFound`] or a size misparse instead of silently
//! truncating.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt};
use flate2::read::DeflateDecoder;
use reqwest::{Client, StatusCode, header};
use thiserror::Error;
use tracing::debug;

/// End-of-central-directory signature, `PK\x05\x06`.
const EOCD_SIGNATURE: u32 = 0x0605_4b50;
/// Central-directory file header signature, `PK\x01\x02`.
const CDH_SIGNATURE: u32 = 0x0201_4b50;
/// Fixed EOCD length without the trailing comment.
const EOCD_SIZE: usize = 22;
/// Largest possible EOCD: fixed part plus a maximal 65535-byte comment.
const EOCD_TAIL_WINDOW: u64 = 65_557;
/// Fixed part of a local file header.
const LOCAL_HEADER_SIZE: usize = 30;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

#[derive(Debug, Error)]
pub enum ZipError {
    #[error("end-of-central-directory signature not found")]
    EocdNotFound,

    #[error("range request failed with status {0}")]
    RangeFailed(u16),

    #[error("unsupported compression method {0}")]
    UnsupportedCompression(u16),

    #[error("truncated archive: wanted {wanted} bytes, got {got}")]
    Truncated { wanted: usize, got: usize },

    #[error("range request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("inflate failed: {0}")]
    Inflate(#[from] std::io::Error),
}

/// One central-directory entry.
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub method: u16,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub header_offset: u32,
}

/// A remote archive addressed by URL and total byte length.
#[derive(Clone)]
pub struct RemoteZip {
    client: Client,
    url: String,
    size: u64,
}

impl RemoteZip {
    pub fn new(client: Client, url: impl Into<String>, size: u64) -> Self {
        Self {
            client,
            url: url.into(),
            size,
        }
    }

    /// Fetch the inclusive byte range `[start, end]`.
    ///
    /// Strict `206 Partial Content` is the expected success. A server that
    /// ignores the `Range` header and answers `200 OK` is tolerated: the
    /// first `end - start + 1` bytes of the body stand in for the range.
    async fn fetch_range(&self, start: u64, end: u64) -> Result<Vec<u8>, ZipError> {
        debug!("range {}-{} of {}", start, end, self.url);
        let resp = self
            .client
            .get(&self.url)
            .header(header::RANGE, format!("bytes={start}-{end}"))
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::PARTIAL_CONTENT && !status.is_success() {
            return Err(ZipError::RangeFailed(status.as_u16()));
        }

        let mut body = resp.bytes().await?.to_vec();
        let wanted = (end - start + 1) as usize;
        if body.len() > wanted {
            body.truncate(wanted);
        }
        Ok(body)
    }

    /// Enumerate the central directory.
    ///
    /// Two range requests: the EOCD tail window, then exactly the directory
    /// bytes it points at.
    pub async fn entries(&self) -> Result<Vec<Entry>, ZipError> {
        let window = self.size.min(EOCD_TAIL_WINDOW);
        if window < EOCD_SIZE as u64 {
            return Err(ZipError::EocdNotFound);
        }
        let tail = self.fetch_range(self.size - window, self.size - 1).await?;
        let (cd_offset, cd_size) = find_eocd(&tail).ok_or(ZipError::EocdNotFound)?;
        if cd_size == 0 {
            return Ok(Vec::new());
        }
        let cd = self
            .fetch_range(cd_offset as u64, cd_offset as u64 + cd_size as u64 - 1)
            .await?;
        Ok(parse_central_directory(&cd))
    }

    /// Fetch and decompress one member.
    pub async fn read(&self, entry: &Entry) -> Result<Vec<u8>, ZipError> {
        let offset = entry.header_offset as u64;
        let header = self
            .fetch_range(offset, offset + LOCAL_HEADER_SIZE as u64 - 1)
            .await?;
        if header.len() < LOCAL_HEADER_SIZE {
            return Err(ZipError::Truncated {
                wanted: LOCAL_HEADER_SIZE,
                got: header.len(),
            });
        }

        let data_start = local_data_start(offset, &header);

        if entry.compressed_size == 0 {
            return inflate(entry.method, &[]);
        }
        let data = self
            .fetch_range(data_start, data_start + entry.compressed_size as u64 - 1)
            .await?;
        if data.len() < entry.compressed_size as usize {
            return Err(ZipError::Truncated {
                wanted: entry.compressed_size as usize,
                got: data.len(),
            });
        }
        inflate(entry.method, &data)
    }

    /// [`read`](Self::read) decoded as UTF-8.
    pub async fn read_text(&self, entry: &Entry) -> Result<String, ZipError> {
        let bytes = self.read(entry).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Where the member data starts, given a 30-byte local header at
/// `header_offset`. The local header repeats the name and extra fields with
/// lengths that may differ from the central directory; the data starts
/// after both.
fn local_data_start(header_offset: u64, header: &[u8]) -> u64 {
    let name_len = u16::from_le_bytes([header[26], header[27]]) as u64;
    let extra_len = u16::from_le_bytes([header[28], header[29]]) as u64;
    header_offset + LOCAL_HEADER_SIZE as u64 + name_len + extra_len
}

/// Scan a tail buffer backward for the EOCD and return
/// `(cd_offset, cd_size)`.
pub fn find_eocd(tail: &[u8]) -> Option<(u32, u32)> {
    if tail.len() < EOCD_SIZE {
        return None;
    }
    for i in (0..=tail.len() - EOCD_SIZE).rev() {
        let sig = u32::from_le_bytes([tail[i], tail[i + 1], tail[i + 2], tail[i + 3]]);
        if sig == EOCD_SIGNATURE {
            let cd_size = u32::from_le_bytes([tail[i + 12], tail[i + 13], tail[i + 14], tail[i + 15]]);
            let cd_offset =
                u32::from_le_bytes([tail[i + 16], tail[i + 17], tail[i + 18], tail[i + 19]]);
            return Some((cd_offset, cd_size));
        }
    }
    None
}

/// Walk fixed-layout central-directory headers until the signature check
/// fails. Filenames are decoded as UTF-8.
pub fn parse_central_directory(cd: &[u8]) -> Vec<Entry> {
    let mut entries = Vec::new();
    let mut cursor = Cursor::new(cd);

    loop {
        let Ok(sig) = cursor.read_u32::<LittleEndian>() else {
            break;
        };
        if sig != CDH_SIGNATURE {
            break;
        }
        let Some(entry) = read_cdh(&mut cursor) else {
            break;
        };
        entries.push(entry);
    }
    entries
}

fn read_cdh(cursor: &mut Cursor<&[u8]>) -> Option<Entry> {
    let _version_made_by = cursor.read_u16::<LittleEndian>().ok()?;
    let _version_needed = cursor.read_u16::<LittleEndian>().ok()?;
    let _flags = cursor.read_u16::<LittleEndian>().ok()?;
    let method = cursor.read_u16::<LittleEndian>().ok()?;
    let _mod_time = cursor.read_u16::<LittleEndian>().ok()?;
    let _mod_date = cursor.read_u16::<LittleEndian>().ok()?;
    let _crc32 = cursor.read_u32::<LittleEndian>().ok()?;
    let compressed_size = cursor.read_u32::<LittleEndian>().ok()?;
    let uncompressed_size = cursor.read_u32::<LittleEndian>().ok()?;
    let name_len = cursor.read_u16::<LittleEndian>().ok()?;
    let extra_len = cursor.read_u16::<LittleEndian>().ok()?;
    let comment_len = cursor.read_u16::<LittleEndian>().ok()?;
    let _disk_start = cursor.read_u16::<LittleEndian>().ok()?;
    let _internal_attrs = cursor.read_u16::<LittleEndian>().ok()?;
    let _external_attrs = cursor.read_u32::<LittleEndian>().ok()?;
    let header_offset = cursor.read_u32::<LittleEndian>().ok()?;

    let mut name = vec![0u8; name_len as usize];
    cursor.read_exact(&mut name).ok()?;
    let skip = extra_len as u64 + comment_len as u64;
    cursor.set_position(cursor.position() + skip);

    Some(Entry {
        name: String::from_utf8_lossy(&name).into_owned(),
        method,
        compressed_size,
        uncompressed_size,
        header_offset,
    })
}

/// Decompress member bytes according to the entry's compression method.
pub fn inflate(method: u16, data: &[u8]) -> Result<Vec<u8>, ZipError> {
    match method {
        METHOD_STORED => Ok(data.to_vec()),
        METHOD_DEFLATE => {
            let mut out = Vec::new();
            DeflateDecoder::new(data).read_to_end(&mut out)?;
            Ok(out)
        }
        other => Err(ZipError::UnsupportedCompression(other)),
    }
}

/// Process-lifetime cache of parsed central directories, keyed by archive
/// URL and invalidated when the archive size changes. This is the only
/// shared mutable state in the core; a single mutex around the map is
/// enough.
#[derive(Default)]
pub struct DirectoryCache {
    inner: Mutex<HashMap<String, (u64, Arc<Vec<Entry>>)>>,
}

impl DirectoryCache {
    pub fn get(&self, url: &str, size: u64) -> Option<Arc<Vec<Entry>>> {
        let inner = self.inner.lock().expect("directory cache poisoned");
        inner
            .get(url)
            .filter(|(cached_size, _)| *cached_size == size)
            .map(|(_, entries)| Arc::clone(entries))
    }

    pub fn put(&self, url: &str, size: u64, entries: Arc<Vec<Entry>>) {
        let mut inner = self.inner.lock().expect("directory cache poisoned");
        inner.insert(url.to_string(), (size, entries));
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use flate2::Compression;
    use flate2::write::DeflateEncoder;
    use std::io::Write;

    /// A member to place in a handcrafted archive.
    pub struct Member<'a> {
        pub name: &'a str,
        pub method: u16,
        pub data: &'a [u8],
    }

    fn le16(v: u16) -> [u8; 2] {
        v.to_le_bytes()
    }

    fn le32(v: u32) -> [u8; 4] {
        v.to_le_bytes()
    }

    pub fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    /// Build a minimal valid archive: local headers, central directory,
    /// EOCD, optional archive comment.
    pub fn build_zip(members: &[Member<'_>], comment: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut central = Vec::new();

        for m in members {
            let stored;
            let payload: &[u8] = match m.method {
                8 => {
                    stored = deflate(m.data);
                    &stored
                }
                _ => m.data,
            };
            let offset = out.len() as u32;

            out.extend_from_slice(&le32(0x0403_4b50));
            out.extend_from_slice(&le16(20)); // version needed
            out.extend_from_slice(&le16(0)); // flags
            out.extend_from_slice(&le16(m.method));
            out.extend_from_slice(&le16(0)); // mod time
            out.extend_from_slice(&le16(0)); // mod date
            out.extend_from_slice(&le32(0)); // crc32, unchecked by the reader
            out.extend_from_slice(&le32(payload.len() as u32));
            out.extend_from_slice(&le32(m.data.len() as u32));
            out.extend_from_slice(&le16(m.name.len() as u16));
            out.extend_from_slice(&le16(0)); // extra len
            out.extend_from_slice(m.name.as_bytes());
            out.extend_from_slice(payload);

            central.extend_from_slice(&le32(0x0201_4b50));
            central.extend_from_slice(&le16(20)); // version made by
            central.extend_from_slice(&le16(20)); // version needed
            central.extend_from_slice(&le16(0)); // flags
            central.extend_from_slice(&le16(m.method));
            central.extend_from_slice(&le16(0)); // mod time
            central.extend_from_slice(&le16(0)); // mod date
            central.extend_from_slice(&le32(0)); // crc32
            central.extend_from_slice(&le32(payload.len() as u32));
            central.extend_from_slice(&le32(m.data.len() as u32));
            central.extend_from_slice(&le16(m.name.len() as u16));
            central.extend_from_slice(&le16(0)); // extra len
            central.extend_from_slice(&le16(0)); // comment len
            central.extend_from_slice(&le16(0)); // disk start
            central.extend_from_slice(&le16(0)); // internal attrs
            central.extend_from_slice(&le32(0)); // external attrs
            central.extend_from_slice(&le32(offset));
            central.extend_from_slice(m.name.as_bytes());
        }

        let cd_offset = out.len() as u32;
        out.extend_from_slice(&central);

        out.extend_from_slice(&le32(0x0605_4b50));
        out.extend_from_slice(&le16(0)); // disk number
        out.extend_from_slice(&le16(0)); // cd start disk
        out.extend_from_slice(&le16(members.len() as u16));
        out.extend_from_slice(&le16(members.len() as u16));
        out.extend_from_slice(&le32(central.len() as u32));
        out.extend_from_slice(&le32(cd_offset));
        out.extend_from_slice(&le16(comment.len() as u16));
        out.extend_from_slice(comment);
        out
    }
}
