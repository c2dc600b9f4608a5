//! Streaming tar containers for tape aggregates.
//!
//! Members are written header-block-then-data with 512-byte padding, so an
//! aggregate streams through in chunks and never materialises in memory. A
//! rolling ADLER32 over every byte written (or read) is the aggregate
//! checksum recorded in the catalog.

use adler32::RollingAdler32;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use nearline_storage::{ByteStream, StorageError, StorageResult, StreamingUpload};

const BLOCK_SIZE: usize = 512;

/// The checksum algorithm name stored beside aggregate checksums.
pub const CHECKSUM_ALGORITHM: &str = "ADLER32";

fn padding_for(size: u64) -> usize {
    ((BLOCK_SIZE as u64 - (size % BLOCK_SIZE as u64)) % BLOCK_SIZE as u64) as usize
}

/// Writes a tar container into a streaming upload, checksumming as it goes.
pub struct TarStreamWriter {
    upload: Box<dyn StreamingUpload>,
    adler: RollingAdler32,
    bytes_written: u64,
}

impl TarStreamWriter {
    pub fn new(upload: Box<dyn StreamingUpload>) -> Self {
        Self {
            upload,
            adler: RollingAdler32::new(),
            bytes_written: 0,
        }
    }

    async fn write_raw(&mut self, data: Bytes) -> StorageResult<()> {
        self.adler.update_buffer(&data);
        self.bytes_written += data.len() as u64;
        self.upload.write(data).await
    }

    /// Begin a member: write its ustar header block.
    pub async fn append_header(
        &mut self,
        name: &str,
        size: u64,
        mode: u32,
        uid: u32,
        gid: u32,
        mtime: i64,
    ) -> StorageResult<()> {
        let mut header = tar::Header::new_ustar();
        header
            .set_path(name)
            .map_err(|e| StorageError::InvalidKey(format!("tar member name {name}: {e}")))?;
        header.set_size(size);
        header.set_mode(mode);
        header.set_uid(u64::from(uid));
        header.set_gid(u64::from(gid));
        header.set_mtime(mtime.max(0) as u64);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        self.write_raw(Bytes::copy_from_slice(header.as_bytes())).await
    }

    /// Append member content. The caller must write exactly the size named
    /// in the header before finishing the entry.
    pub async fn append_data(&mut self, chunk: Bytes) -> StorageResult<()> {
        self.write_raw(chunk).await
    }

    /// Close a member: pad its content to the block boundary.
    pub async fn finish_entry(&mut self, size: u64) -> StorageResult<()> {
        let padding = padding_for(size);
        if padding > 0 {
            self.write_raw(Bytes::from(vec![0u8; padding])).await?;
        }
        Ok(())
    }

    /// Close the container: write the end-of-archive blocks and finish the
    /// upload. Returns the checksum and total bytes.
    pub async fn finish(mut self) -> StorageResult<(u32, u64)> {
        self.write_raw(Bytes::from(vec![0u8; 2 * BLOCK_SIZE])).await?;
        let checksum = self.adler.hash();
        let total = self.bytes_written;
        self.upload.finish().await?;
        Ok((checksum, total))
    }

    pub async fn abort(self) -> StorageResult<()> {
        self.upload.abort().await
    }
}

/// One member's metadata as read back off tape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TarMember {
    pub name: String,
    pub size: u64,
}

/// Reads a tar container from a byte stream, checksumming as it goes.
pub struct TarStreamReader {
    stream: ByteStream,
    buffer: BytesMut,
    adler: RollingAdler32,
    stream_done: bool,
}

impl TarStreamReader {
    pub fn new(stream: ByteStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
            adler: RollingAdler32::new(),
            stream_done: false,
        }
    }

    async fn fill(&mut self, wanted: usize) -> StorageResult<()> {
        while self.buffer.len() < wanted && !self.stream_done {
            match self.stream.next().await {
                Some(Ok(chunk)) => {
                    self.adler.update_buffer(&chunk);
                    self.buffer.extend_from_slice(&chunk);
                }
                Some(Err(e)) => return Err(e),
                None => self.stream_done = true,
            }
        }
        if self.buffer.len() < wanted {
            return Err(StorageError::Tape(format!(
                "truncated tar stream: wanted {wanted} bytes, have {}",
                self.buffer.len()
            )));
        }
        Ok(())
    }

    /// The next member header, or None at the end-of-archive marker.
    pub async fn next_member(&mut self) -> StorageResult<Option<TarMember>> {
        self.fill(BLOCK_SIZE).await?;
        let block = self.buffer.split_to(BLOCK_SIZE);
        if block.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        let header = tar::Header::from_byte_slice(&block);
        let name = header
            .path()
            .map_err(|e| StorageError::Tape(format!("bad tar member path: {e}")))?
            .to_string_lossy()
            .into_owned();
        let size = header
            .entry_size()
            .map_err(|e| StorageError::Tape(format!("bad tar member size: {e}")))?;
        Ok(Some(TarMember { name, size }))
    }

    /// Read up to `max` bytes of the current member's remaining content.
    pub async fn read_data(&mut self, remaining: u64, max: usize) -> StorageResult<Bytes> {
        let wanted = remaining.min(max as u64) as usize;
        if wanted == 0 {
            return Ok(Bytes::new());
        }
        if self.buffer.is_empty() {
            self.fill(1).await?;
        }
        let take = wanted.min(self.buffer.len());
        Ok(self.buffer.split_to(take).freeze())
    }

    /// Discard the padding after a member of the given size.
    pub async fn skip_padding(&mut self, size: u64) -> StorageResult<()> {
        let padding = padding_for(size);
        if padding > 0 {
            self.fill(padding).await?;
            let _ = self.buffer.split_to(padding);
        }
        Ok(())
    }

    /// Discard `size` bytes of member content plus padding.
    pub async fn skip_member(&mut self, size: u64) -> StorageResult<()> {
        let mut remaining = size;
        while remaining > 0 {
            let chunk = self.read_data(remaining, 1024 * 1024).await?;
            if chunk.is_empty() {
                return Err(StorageError::Tape("truncated tar member".to_string()));
            }
            remaining -= chunk.len() as u64;
        }
        self.skip_padding(size).await
    }

    /// Consume whatever trails the end-of-archive marker and return the
    /// checksum over every byte seen.
    pub async fn finish(mut self) -> StorageResult<u32> {
        while !self.stream_done {
            match self.stream.next().await {
                Some(Ok(chunk)) => self.adler.update_buffer(&chunk),
                Some(Err(e)) => return Err(e),
                None => self.stream_done = true,
            }
        }
        Ok(self.adler.hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearline_storage::{FilesystemBackend, ObjectStore};

    async fn store() -> (tempfile::TempDir, FilesystemBackend) {
        let temp = tempfile::tempdir().unwrap();
        let store = FilesystemBackend::new(temp.path()).await.unwrap();
        store.ensure_bucket("tape").await.unwrap();
        (temp, store)
    }

    async fn write_container(store: &FilesystemBackend, members: &[(&str, &[u8])]) -> u32 {
        let upload = store.put_stream("tape", "agg.tar").await.unwrap();
        let mut writer = TarStreamWriter::new(upload);
        for (name, body) in members {
            writer
                .append_header(name, body.len() as u64, 0o644, 1000, 100, 0)
                .await
                .unwrap();
            writer.append_data(Bytes::copy_from_slice(body)).await.unwrap();
            writer.finish_entry(body.len() as u64).await.unwrap();
        }
        let (checksum, _total) = writer.finish().await.unwrap();
        checksum
    }

    #[tokio::test]
    async fn container_round_trips_members_and_checksum() {
        let (_t, store) = store().await;
        let bucket = uuid::Uuid::new_v4().to_string();
        let name_a = format!("{bucket}/{}", "a".repeat(64));
        let members: Vec<(&str, &[u8])> = vec![
            (name_a.as_str(), b"first body"),
            ("short/name", b"second body with more bytes"),
        ];
        let written_checksum = write_container(&store, &members).await;

        let stream = store.get_stream("tape", "agg.tar").await.unwrap();
        let mut reader = TarStreamReader::new(stream);

        let first = reader.next_member().await.unwrap().unwrap();
        assert_eq!(first.name, name_a);
        assert_eq!(first.size, 10);
        let mut body = Vec::new();
        let mut remaining = first.size;
        while remaining > 0 {
            let chunk = reader.read_data(remaining, 4).await.unwrap();
            remaining -= chunk.len() as u64;
            body.extend_from_slice(&chunk);
        }
        assert_eq!(body, b"first body");
        reader.skip_padding(first.size).await.unwrap();

        let second = reader.next_member().await.unwrap().unwrap();
        assert_eq!(second.name, "short/name");
        reader.skip_member(second.size).await.unwrap();

        assert!(reader.next_member().await.unwrap().is_none());
        let read_checksum = reader.finish().await.unwrap();
        assert_eq!(read_checksum, written_checksum);
    }

    #[tokio::test]
    async fn archive_is_readable_by_the_tar_crate() {
        let (_t, store) = store().await;
        write_container(&store, &[("plain.dat", b"interop body")]).await;

        let mut stream = store.get_stream("tape", "agg.tar").await.unwrap();
        let mut raw = Vec::new();
        while let Some(chunk) = stream.next().await {
            raw.extend_from_slice(&chunk.unwrap());
        }
        let mut archive = tar::Archive::new(std::io::Cursor::new(raw));
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_string_lossy(), "plain.dat");
        let mut body = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut body).unwrap();
        assert_eq!(body, b"interop body");
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let (_t, store) = store().await;
        write_container(&store, &[("plain.dat", b"interop body")]).await;

        // chop the container short
        let mut stream = store.get_stream("tape", "agg.tar").await.unwrap();
        let mut raw = Vec::new();
        while let Some(chunk) = stream.next().await {
            raw.extend_from_slice(&chunk.unwrap());
        }
        raw.truncate(600);
        let cut: ByteStream =
            Box::pin(futures::stream::once(async move { Ok(Bytes::from(raw)) }));
        let mut reader = TarStreamReader::new(cut);
        let member = reader.next_member().await.unwrap().unwrap();
        assert!(reader.skip_member(member.size).await.is_err());
    }
}
