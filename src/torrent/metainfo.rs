use crate::torrent::{InfoHash, Result, SessionError, TorrentFile};
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Represents a list of web seed URLs, which can be a single URL or multiple.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum UrlList {
    Single(String),
    Multiple(Vec<String>),
}

impl UrlList {
    /// Get the URLs of this list.
    pub fn urls(&self) -> Vec<String> {
        match self {
            UrlList::Single(url) => vec![url.clone()],
            UrlList::Multiple(urls) => urls.clone(),
        }
    }
}

/// A file entry of a multi-file info dictionary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InfoFile {
    /// Length of the file in bytes.
    pub length: u64,
    /// The path segments of the file, relative to the torrent directory.
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,
}

/// The info dictionary of a torrent.
/// Field order is irrelevant for hashing as the bencode serializer writes dictionary keys sorted.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct TorrentInfo {
    /// Length of each piece in bytes.
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    /// The concatenated SHA-1 hashes of all pieces.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    /// Name of the torrent.
    /// This either represents the name of the file or the name of the directory.
    pub name: String,
    /// Flag indicating if the torrent is private, see BEP27.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<i64>,
    /// The length of the payload in single file mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    /// The files of the payload in multi file mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<InfoFile>>,
}

impl TorrentInfo {
    /// Check if the torrent is marked as private, see BEP27.
    pub fn is_private(&self) -> bool {
        self.private == Some(1)
    }

    /// Check if the torrent payload consists of multiple files.
    pub fn is_multi_file(&self) -> bool {
        self.files.is_some()
    }

    /// Get the total payload length of the torrent in bytes.
    pub fn total_length(&self) -> u64 {
        match &self.files {
            Some(files) => files.iter().map(|e| e.length).sum(),
            None => self.length.unwrap_or(0),
        }
    }

    /// Get the total number of pieces of the torrent.
    pub fn total_pieces(&self) -> usize {
        self.pieces.len() / 20
    }

    /// Get the files of the torrent payload with their byte offsets.
    /// In single file mode the torrent name is used as the file path.
    pub fn files(&self) -> Vec<TorrentFile> {
        match &self.files {
            Some(files) => {
                let mut offset = 0u64;
                files
                    .iter()
                    .map(|file| {
                        let result = TorrentFile {
                            path: file.path.join("/"),
                            length: file.length,
                            offset,
                        };
                        offset += file.length;
                        result
                    })
                    .collect()
            }
            None => vec![TorrentFile {
                path: self.name.clone(),
                length: self.length.unwrap_or(0),
                offset: 0,
            }],
        }
    }

    /// Encode this info dictionary back to its canonical bencode representation.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_bencode::to_bytes(self).map_err(|e| SessionError::TorrentParse(e.to_string()))
    }

    /// Parse an info dictionary from the given raw bencode bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_bencode::from_bytes(bytes).map_err(|e| SessionError::TorrentParse(e.to_string()))
    }
}

impl std::fmt::Debug for TorrentInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentInfo")
            .field("piece_length", &self.piece_length)
            .field("pieces", &self.pieces.len())
            .field("name", &self.name)
            .field("private", &self.private)
            .field("length", &self.length)
            .field("files", &self.files)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    #[serde(default)]
    announce: Option<String>,
    #[serde(rename = "announce-list", default)]
    announce_list: Option<Vec<Vec<String>>>,
    #[serde(rename = "url-list", default)]
    url_list: Option<UrlList>,
    info: TorrentInfo,
}

/// A parsed `.torrent` metainfo document.
#[derive(Debug, Clone, PartialEq)]
pub struct Metainfo {
    /// The parsed info dictionary.
    pub info: TorrentInfo,
    /// The canonical bencode bytes of the info dictionary.
    pub info_bytes: Vec<u8>,
    /// The info hash of the torrent.
    pub info_hash: InfoHash,
    /// The announce url of the torrent.
    pub announce: Option<String>,
    /// The tiered announce urls of the torrent, see BEP12.
    pub announce_list: Option<Vec<Vec<String>>>,
    /// The web seed urls of the torrent, see BEP19.
    pub url_list: Vec<String>,
}

impl Metainfo {
    /// Parse a metainfo document from the given reader.
    pub fn parse<R: Read>(mut reader: R) -> Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }

    /// Parse a metainfo document from the given raw bencode bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: RawMetainfo =
            serde_bencode::from_bytes(bytes).map_err(|e| SessionError::TorrentParse(e.to_string()))?;
        let info_bytes = raw.info.to_bytes()?;
        let info_hash = InfoHash::from_info_bytes(&info_bytes);

        Ok(Self {
            info: raw.info,
            info_bytes,
            info_hash,
            announce: raw.announce,
            announce_list: raw.announce_list,
            url_list: raw.url_list.map(|e| e.urls()).unwrap_or_default(),
        })
    }

    /// Get the announce urls of the torrent.
    /// The announce-list takes precedence over the single announce url when present.
    pub fn trackers(&self) -> Vec<String> {
        if let Some(announce_list) = self.announce_list.as_ref() {
            let mut trackers = Vec::new();
            for tier in announce_list {
                for tracker in tier {
                    if !trackers.contains(tracker) {
                        trackers.push(tracker.clone());
                    }
                }
            }
            return trackers;
        }

        self.announce.clone().map(|e| vec![e]).unwrap_or_default()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Create a valid single file info dictionary for testing purposes.
    pub fn single_file_info(name: &str, total_length: u64, piece_length: u64) -> TorrentInfo {
        let total_pieces = (total_length + piece_length - 1) / piece_length;
        TorrentInfo {
            piece_length,
            pieces: vec![0u8; total_pieces as usize * 20],
            name: name.to_string(),
            private: None,
            length: Some(total_length),
            files: None,
        }
    }

    /// Create a metainfo document as raw bencode bytes for testing purposes.
    pub fn create_metainfo_bytes(info: &TorrentInfo, trackers: Vec<&str>, url_list: Vec<&str>) -> Vec<u8> {
        #[derive(Serialize)]
        struct Raw<'a> {
            #[serde(skip_serializing_if = "Option::is_none")]
            announce: Option<String>,
            #[serde(rename = "announce-list", skip_serializing_if = "Option::is_none")]
            announce_list: Option<Vec<Vec<String>>>,
            #[serde(rename = "url-list", skip_serializing_if = "Option::is_none")]
            url_list: Option<Vec<String>>,
            info: &'a TorrentInfo,
        }

        serde_bencode::to_bytes(&Raw {
            announce: trackers.first().map(|e| e.to_string()),
            announce_list: Some(vec![trackers.iter().map(|e| e.to_string()).collect()])
                .filter(|e: &Vec<Vec<String>>| !e[0].is_empty()),
            url_list: Some(url_list.iter().map(|e| e.to_string()).collect())
                .filter(|e: &Vec<String>| !e.is_empty()),
            info,
        })
        .unwrap()
    }

    #[test]
    fn test_metainfo_from_bytes() {
        let info = single_file_info("debian.iso", 12, 4);
        let bytes = create_metainfo_bytes(&info, vec!["udp://tracker.example.org:1337"], vec![]);

        let result = Metainfo::from_bytes(&bytes).expect("expected the metainfo to have been parsed");

        assert_eq!(info, result.info);
        assert_eq!(
            vec!["udp://tracker.example.org:1337".to_string()],
            result.trackers()
        );
        assert_eq!(result.info_hash, InfoHash::from_info_bytes(&result.info_bytes));
    }

    #[test]
    fn test_metainfo_info_bytes_round_trip() {
        let info = single_file_info("sample.bin", 100, 16);
        let bytes = create_metainfo_bytes(&info, vec![], vec![]);

        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        let restored = TorrentInfo::from_bytes(&metainfo.info_bytes).unwrap();

        assert_eq!(metainfo.info, restored);
        assert_eq!(
            metainfo.info_hash,
            InfoHash::from_info_bytes(&restored.to_bytes().unwrap())
        );
    }

    #[test]
    fn test_metainfo_url_list_single() {
        let info = single_file_info("sample.bin", 8, 4);
        let mut bytes = create_metainfo_bytes(&info, vec![], vec!["http://mirror.example.org/sample.bin"]);

        let result = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(
            vec!["http://mirror.example.org/sample.bin".to_string()],
            result.url_list
        );

        // single url form
        let replacement = "8:url-list36:http://mirror.example.org/sample.bin";
        let original = "8:url-listl36:http://mirror.example.org/sample.bine";
        let encoded = String::from_utf8(bytes.clone()).unwrap();
        bytes = encoded.replace(original, replacement).into_bytes();

        let result = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(
            vec!["http://mirror.example.org/sample.bin".to_string()],
            result.url_list
        );
    }

    #[test]
    fn test_torrent_info_files_multi_file() {
        let info = TorrentInfo {
            piece_length: 4,
            pieces: vec![0u8; 3 * 20],
            name: "bundle".to_string(),
            private: None,
            length: None,
            files: Some(vec![
                InfoFile {
                    length: 5,
                    path: vec!["docs".to_string(), "a.txt".to_string()],
                    md5sum: None,
                },
                InfoFile {
                    length: 7,
                    path: vec!["b.bin".to_string()],
                    md5sum: None,
                },
            ]),
        };

        let files = info.files();

        assert_eq!(12, info.total_length());
        assert_eq!("docs/a.txt", files[0].path);
        assert_eq!(0, files[0].offset);
        assert_eq!("b.bin", files[1].path);
        assert_eq!(5, files[1].offset);
    }

    #[test]
    fn test_torrent_info_is_private() {
        let mut info = single_file_info("sample.bin", 8, 4);
        assert_eq!(false, info.is_private());

        info.private = Some(1);
        assert_eq!(true, info.is_private());
    }
}
