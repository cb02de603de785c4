//! Deterministic torrent content for simulation.
//!
//! Content bytes come from a seeded ChaCha stream, so the same seed and layout
//! always produce the same torrent, info hash included.

use bytes::Bytes;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha1::{Digest, Sha1};
use undertow_core::swarm::{FileEntry, InfoHash, TorrentInfo};

/// A whole torrent: metadata plus every byte of its files.
#[derive(Debug, Clone)]
pub struct SimulatedContent {
    info_hash: InfoHash,
    info: TorrentInfo,
    data: Bytes,
}

impl SimulatedContent {
    /// Single-file torrent of `length` bytes.
    pub fn single_file(name: &str, length: u64, piece_length: u64, seed: u64) -> Self {
        ContentBuilder::new(name, piece_length)
            .seed(seed)
            .file(name, length)
            .build()
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn info(&self) -> &TorrentInfo {
        &self.info
    }

    /// All bytes in torrent byte space.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Bytes of piece `index`. Empty when out of range.
    pub fn piece(&self, index: usize) -> Bytes {
        let piece_length = self.info.piece_length as usize;
        let start = (index * piece_length).min(self.data.len());
        let end = (start + piece_length).min(self.data.len());
        self.data.slice(start..end)
    }

    /// Bytes of file `index`. Empty when the file does not exist.
    pub fn file_data(&self, index: usize) -> Bytes {
        match self.info.file(index) {
            Some(file) => self.data.slice(file.offset as usize..file.end() as usize),
            None => Bytes::new(),
        }
    }

    /// Magnet link resolving to this content.
    pub fn magnet_link(&self) -> String {
        format!("magnet:?xt=urn:btih:{}&dn={}", self.info_hash, self.info.name)
    }
}

/// Builder for multi-file [`SimulatedContent`].
#[derive(Debug, Clone)]
pub struct ContentBuilder {
    name: String,
    piece_length: u64,
    seed: u64,
    files: Vec<(String, u64)>,
}

impl ContentBuilder {
    pub fn new(name: &str, piece_length: u64) -> Self {
        Self {
            name: name.to_string(),
            piece_length,
            seed: 42,
            files: Vec::new(),
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Appends a file; files are laid out back to back in order.
    pub fn file(mut self, path: &str, length: u64) -> Self {
        self.files.push((path.to_string(), length));
        self
    }

    pub fn build(self) -> SimulatedContent {
        let mut files = Vec::with_capacity(self.files.len());
        let mut offset = 0u64;
        for (index, (path, length)) in self.files.iter().enumerate() {
            files.push(FileEntry {
                index,
                path: path.clone(),
                offset,
                length: *length,
            });
            offset += length;
        }

        let mut data = vec![0u8; offset as usize];
        ChaCha8Rng::seed_from_u64(self.seed).fill_bytes(&mut data);

        let info = TorrentInfo {
            name: self.name.clone(),
            piece_length: self.piece_length,
            piece_count: offset.div_ceil(self.piece_length) as usize,
            files,
        };

        SimulatedContent {
            info_hash: self.info_hash(),
            info,
            data: Bytes::from(data),
        }
    }

    fn info_hash(&self) -> InfoHash {
        let mut hasher = Sha1::new();
        hasher.update(self.name.as_bytes());
        hasher.update(self.seed.to_le_bytes());
        hasher.update(self.piece_length.to_le_bytes());
        for (path, length) in &self.files {
            hasher.update(path.as_bytes());
            hasher.update(length.to_le_bytes());
        }

        let digest = hasher.finalize();
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        InfoHash::new(hash)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_layout_is_contiguous() {
        let content = ContentBuilder::new("show", 1024)
            .file("show.nfo", 1000)
            .file("show.mkv", 5000)
            .build();

        let files = &content.info().files;
        assert_eq!(files[0].offset, 0);
        assert_eq!(files[1].offset, 1000);
        assert_eq!(content.info().length(), 6000);
        assert_eq!(content.info().piece_count, 6);
        assert_eq!(content.data().len(), 6000);
        assert_eq!(content.piece(5).len(), 6000 - 5 * 1024);
        assert!(content.piece(6).is_empty());
    }

    #[test]
    fn test_same_seed_same_torrent() {
        let a = SimulatedContent::single_file("movie.mp4", 4096, 1024, 7);
        let b = SimulatedContent::single_file("movie.mp4", 4096, 1024, 7);
        let c = SimulatedContent::single_file("movie.mp4", 4096, 1024, 8);

        assert_eq!(a.info_hash(), b.info_hash());
        assert_eq!(a.data(), b.data());
        assert_ne!(a.info_hash(), c.info_hash());
        assert_ne!(a.data(), c.data());
    }

    #[test]
    fn test_magnet_link_parses_back() {
        let content = SimulatedContent::single_file("movie.mp4", 4096, 1024, 7);
        let spec = undertow_core::TorrentSpec::from_link(&content.magnet_link()).unwrap();
        assert_eq!(spec.info_hash, content.info_hash());
    }

    proptest! {
        #[test]
        fn prop_file_data_matches_torrent_space(
            lengths in prop::collection::vec(1u64..5000, 1..5),
            piece_length in 256u64..4096,
        ) {
            let builder = lengths
                .iter()
                .enumerate()
                .fold(ContentBuilder::new("t", piece_length), |b, (i, len)| {
                    b.file(&format!("f{i}"), *len)
                });
            let content = builder.build();

            for file in &content.info().files {
                let bytes = content.file_data(file.index);
                prop_assert_eq!(bytes.len() as u64, file.length);
                prop_assert_eq!(
                    &bytes[..],
                    &content.data()[file.offset as usize..file.end() as usize]
                );
            }
        }
    }
}
