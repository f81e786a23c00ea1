//! A seekable read stream over a remote archive, fetched range-by-range and
//! cached in fixed-size blocks. Used to peek into modlist bundles without
//! downloading them fully.
//!
//! The `Read`/`Seek` implementation is synchronous; call it from a blocking
//! context (`spawn_blocking`) when an async runtime is driving.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom};

use reqwest::header::RANGE;
use tokio::runtime::Handle;

const BLOCK_SIZE: u64 = 1 << 20;

/// Fetches one byte range of the remote resource.
pub trait RangeFetcher: Send {
    fn total_size(&self) -> u64;
    fn fetch_range(&mut self, start: u64, end: u64) -> io::Result<Vec<u8>>;
}

/// Range fetcher over HTTP, driven through a runtime handle.
pub struct HttpRangeFetcher {
    client: reqwest::Client,
    url: String,
    size: u64,
    handle: Handle,
}

impl HttpRangeFetcher {
    pub fn new(client: reqwest::Client, url: String, size: u64, handle: Handle) -> Self {
        Self {
            client,
            url,
            size,
            handle,
        }
    }
}

impl RangeFetcher for HttpRangeFetcher {
    fn total_size(&self) -> u64 {
        self.size
    }

    fn fetch_range(&mut self, start: u64, end: u64) -> io::Result<Vec<u8>> {
        let request = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={start}-{}", end - 1));
        let bytes = self
            .handle
            .block_on(async move { request.send().await?.error_for_status()?.bytes().await })
            .map_err(io::Error::other)?;
        Ok(bytes.to_vec())
    }
}

pub struct ChunkedSeekableStream<F> {
    fetcher: F,
    position: u64,
    blocks: HashMap<u64, Vec<u8>>,
}

impl<F: RangeFetcher> ChunkedSeekableStream<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            position: 0,
            blocks: HashMap::new(),
        }
    }

    fn block_for(&mut self, index: u64) -> io::Result<&[u8]> {
        if !self.blocks.contains_key(&index) {
            let start = index * BLOCK_SIZE;
            let end = (start + BLOCK_SIZE).min(self.fetcher.total_size());
            let bytes = self.fetcher.fetch_range(start, end)?;
            self.blocks.insert(index, bytes);
        }
        Ok(self.blocks[&index].as_slice())
    }
}

impl<F: RangeFetcher> Read for ChunkedSeekableStream<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let total = self.fetcher.total_size();
        if self.position >= total {
            return Ok(0);
        }
        let index = self.position / BLOCK_SIZE;
        let offset = (self.position % BLOCK_SIZE) as usize;
        let block = self.block_for(index)?;
        if offset >= block.len() {
            return Ok(0);
        }
        let available = &block[offset..];
        let take = available.len().min(buf.len());
        buf[..take].copy_from_slice(&available[..take]);
        self.position += take as u64;
        Ok(take)
    }
}

impl<F: RangeFetcher> Seek for ChunkedSeekableStream<F> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let total = self.fetcher.total_size() as i64;
        let next = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(delta) => total + delta,
            SeekFrom::Current(delta) => self.position as i64 + delta,
        };
        if next < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.position = next as u64;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemoryFetcher {
        bytes: Vec<u8>,
        fetches: usize,
    }

    impl RangeFetcher for MemoryFetcher {
        fn total_size(&self) -> u64 {
            self.bytes.len() as u64
        }

        fn fetch_range(&mut self, start: u64, end: u64) -> io::Result<Vec<u8>> {
            self.fetches += 1;
            Ok(self.bytes[start as usize..end as usize].to_vec())
        }
    }

    #[test]
    fn reads_across_block_boundaries() {
        let size = (BLOCK_SIZE + 100) as usize;
        let bytes: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let mut stream = ChunkedSeekableStream::new(MemoryFetcher {
            bytes: bytes.clone(),
            fetches: 0,
        });

        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, bytes);
        assert_eq!(stream.fetcher.fetches, 2);
    }

    #[test]
    fn seek_and_block_cache() {
        let bytes: Vec<u8> = (0..1000u32).flat_map(|i| i.to_le_bytes()).collect();
        let mut stream = ChunkedSeekableStream::new(MemoryFetcher {
            bytes: bytes.clone(),
            fetches: 0,
        });

        stream.seek(SeekFrom::Start(400)).unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 100);

        // Everything fits one block; a second read costs no fetch.
        stream.seek(SeekFrom::End(-4)).unwrap();
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 999);
        assert_eq!(stream.fetcher.fetches, 1);

        assert_eq!(stream.seek(SeekFrom::Current(0)).unwrap(), bytes.len() as u64);
        assert!(stream.seek(SeekFrom::Start(0)).is_ok());
        assert!(stream.seek(SeekFrom::End(-(bytes.len() as i64) - 1)).is_err());
    }
}
