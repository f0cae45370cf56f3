//! Torrent `info` dictionary parsing (BEP-3).
//!
//! Takes a decoded bencode tree and produces a normalised record. Single-file
//! torrents are presented as a one-element file list whose path is the
//! torrent name, so consumers never branch on the two modes.

use crate::bencode::Value;

/// Declared piece length must fit in a signed 32-bit integer.
const MAX_PIECE_LENGTH: i64 = 1 << 31;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    pub name: String,
    pub piece_length: u64,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub length: u64,
}

impl Metainfo {
    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|file| file.length).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetainfoError {
    #[error("info is not a dictionary")]
    NotADict,
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
    #[error("negative file length")]
    NegativeLength,
    #[error("file path component contains NUL")]
    NulInPath,
    #[error("file path escapes the torrent directory")]
    PathEscape,
    #[error("torrent has no usable files")]
    NoFiles,
}

/// Normalises a decoded `info` dictionary.
pub fn parse_info(value: &Value) -> Result<Metainfo, MetainfoError> {
    if value.as_dict().is_none() {
        return Err(MetainfoError::NotADict);
    }

    // Clients that ship a "name.utf-8" key put the authoritative encoding
    // there; fall back to "name" with lossy conversion.
    let name_bytes = value
        .dict_get_bytes(b"name.utf-8")
        .or_else(|| value.dict_get_bytes(b"name"))
        .ok_or(MetainfoError::MissingField("name"))?;
    let name = String::from_utf8_lossy(name_bytes).into_owned();

    let piece_length = value
        .dict_get_int(b"piece length")
        .ok_or(MetainfoError::MissingField("piece length"))?;
    if piece_length <= 0 || piece_length > MAX_PIECE_LENGTH {
        return Err(MetainfoError::InvalidField("piece length"));
    }

    let files = match value.dict_get(b"files") {
        Some(files_value) => parse_files(files_value)?,
        None => {
            // Single-file mode: synthesize one entry named after the torrent.
            let length = value
                .dict_get_int(b"length")
                .ok_or(MetainfoError::MissingField("length"))?;
            if length < 0 {
                return Err(MetainfoError::NegativeLength);
            }
            vec![FileEntry {
                path: vec![name.clone()],
                length: length as u64,
            }]
        }
    };

    if files.is_empty() {
        return Err(MetainfoError::NoFiles);
    }

    Ok(Metainfo {
        name,
        piece_length: piece_length as u64,
        files,
    })
}

fn parse_files(value: &Value) -> Result<Vec<FileEntry>, MetainfoError> {
    let list = value.as_list().ok_or(MetainfoError::InvalidField("files"))?;
    let mut files = Vec::with_capacity(list.len());

    for entry in list {
        let length = entry
            .dict_get_int(b"length")
            .ok_or(MetainfoError::MissingField("length"))?;
        if length < 0 {
            return Err(MetainfoError::NegativeLength);
        }

        let path_value = entry
            .dict_get(b"path")
            .ok_or(MetainfoError::MissingField("path"))?;
        let segments = path_value
            .as_list()
            .ok_or(MetainfoError::InvalidField("path"))?;

        let mut path = Vec::with_capacity(segments.len());
        for segment in segments {
            let bytes = segment
                .as_bytes()
                .ok_or(MetainfoError::InvalidField("path"))?;
            if bytes.is_empty() {
                continue;
            }
            if bytes.contains(&0) {
                return Err(MetainfoError::NulInPath);
            }
            if bytes == b".." {
                return Err(MetainfoError::PathEscape);
            }
            path.push(sanitize_component(bytes));
        }

        // An entry whose path collapses to nothing cannot be addressed.
        if path.is_empty() {
            continue;
        }
        files.push(FileEntry {
            path,
            length: length as u64,
        });
    }

    Ok(files)
}

/// Path separators inside a single component would silently change the
/// directory layout on disk; flatten them while keeping component boundaries.
fn sanitize_component(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode;

    fn info(pairs: Vec<(&[u8], Value)>) -> Value {
        Value::Dict(pairs.into_iter().map(|(k, v)| (k.to_vec(), v)).collect())
    }

    fn file_entry(path: Vec<&[u8]>, length: i64) -> Value {
        Value::Dict(vec![
            (b"length".to_vec(), Value::Int(length)),
            (
                b"path".to_vec(),
                Value::List(
                    path.into_iter()
                        .map(|p| Value::Bytes(p.to_vec()))
                        .collect(),
                ),
            ),
        ])
    }

    #[test]
    fn single_file_synthesizes_path() {
        let value = info(vec![
            (b"length", Value::Int(4096)),
            (b"name", Value::Bytes(b"ubuntu.iso".to_vec())),
            (b"piece length", Value::Int(16384)),
        ]);
        let meta = parse_info(&value).unwrap();
        assert_eq!(meta.name, "ubuntu.iso");
        assert_eq!(
            meta.files,
            vec![FileEntry {
                path: vec!["ubuntu.iso".to_string()],
                length: 4096
            }]
        );
        assert_eq!(meta.total_length(), 4096);
    }

    #[test]
    fn multi_file_keeps_component_boundaries() {
        let value = info(vec![
            (
                b"files",
                Value::List(vec![
                    file_entry(vec![b"cd1", b"track01.flac"], 100),
                    file_entry(vec![b"cd2", b"track01.flac"], 200),
                ]),
            ),
            (b"name", Value::Bytes(b"album".to_vec())),
            (b"piece length", Value::Int(32768)),
        ]);
        let meta = parse_info(&value).unwrap();
        assert_eq!(meta.files.len(), 2);
        assert_eq!(meta.files[0].path, vec!["cd1", "track01.flac"]);
        assert_eq!(meta.total_length(), 300);
    }

    #[test]
    fn prefers_utf8_name() {
        let value = info(vec![
            (b"length", Value::Int(1)),
            (b"name", Value::Bytes(vec![0xff, 0xfe])),
            (b"name.utf-8", Value::Bytes("fichier".as_bytes().to_vec())),
            (b"piece length", Value::Int(16384)),
        ]);
        assert_eq!(parse_info(&value).unwrap().name, "fichier");
    }

    #[test]
    fn invalid_utf8_name_is_replaced() {
        let value = info(vec![
            (b"length", Value::Int(1)),
            (b"name", Value::Bytes(vec![b'a', 0xff, b'b'])),
            (b"piece length", Value::Int(16384)),
        ]);
        assert_eq!(parse_info(&value).unwrap().name, "a\u{fffd}b");
    }

    #[test]
    fn rejects_negative_length() {
        let value = info(vec![
            (
                b"files",
                Value::List(vec![file_entry(vec![b"a"], -1)]),
            ),
            (b"name", Value::Bytes(b"x".to_vec())),
            (b"piece length", Value::Int(16384)),
        ]);
        assert_eq!(parse_info(&value), Err(MetainfoError::NegativeLength));
    }

    #[test]
    fn rejects_nul_and_dotdot_components() {
        let nul = info(vec![
            (
                b"files",
                Value::List(vec![file_entry(vec![b"a\0b"], 1)]),
            ),
            (b"name", Value::Bytes(b"x".to_vec())),
            (b"piece length", Value::Int(16384)),
        ]);
        assert_eq!(parse_info(&nul), Err(MetainfoError::NulInPath));

        let escape = info(vec![
            (
                b"files",
                Value::List(vec![file_entry(vec![b"..", b"etc"], 1)]),
            ),
            (b"name", Value::Bytes(b"x".to_vec())),
            (b"piece length", Value::Int(16384)),
        ]);
        assert_eq!(parse_info(&escape), Err(MetainfoError::PathEscape));
    }

    #[test]
    fn drops_entries_with_empty_paths() {
        let value = info(vec![
            (
                b"files",
                Value::List(vec![
                    file_entry(vec![b"", b""], 1),
                    file_entry(vec![b"", b"keep.txt"], 2),
                ]),
            ),
            (b"name", Value::Bytes(b"x".to_vec())),
            (b"piece length", Value::Int(16384)),
        ]);
        let meta = parse_info(&value).unwrap();
        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.files[0].path, vec!["keep.txt"]);
    }

    #[test]
    fn all_paths_empty_is_an_error() {
        let value = info(vec![
            (
                b"files",
                Value::List(vec![file_entry(vec![b""], 1)]),
            ),
            (b"name", Value::Bytes(b"x".to_vec())),
            (b"piece length", Value::Int(16384)),
        ]);
        assert_eq!(parse_info(&value), Err(MetainfoError::NoFiles));
    }

    #[test]
    fn sanitizes_separators_in_components() {
        let value = info(vec![
            (
                b"files",
                Value::List(vec![file_entry(vec![b"a/b\\c", b"d.txt"], 1)]),
            ),
            (b"name", Value::Bytes(b"x".to_vec())),
            (b"piece length", Value::Int(16384)),
        ]);
        let meta = parse_info(&value).unwrap();
        assert_eq!(meta.files[0].path, vec!["a_b_c", "d.txt"]);
    }

    #[test]
    fn rejects_bad_piece_length() {
        for pl in [0i64, -16384, (1 << 31) + 1] {
            let value = info(vec![
                (b"length", Value::Int(1)),
                (b"name", Value::Bytes(b"x".to_vec())),
                (b"piece length", Value::Int(pl)),
            ]);
            assert_eq!(
                parse_info(&value),
                Err(MetainfoError::InvalidField("piece length"))
            );
        }
    }

    #[test]
    fn parses_from_wire_bytes() {
        let raw = b"d6:lengthi2e4:name4:file12:piece lengthi16384ee";
        let value = bencode::decode(raw).unwrap();
        let meta = parse_info(&value).unwrap();
        assert_eq!(meta.name, "file");
        assert_eq!(meta.piece_length, 16384);
    }
}
