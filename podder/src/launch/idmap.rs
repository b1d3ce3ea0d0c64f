//! UID/GID mapping for rootless user namespaces (spec §4.5, §9).
//!
//! Reads every matching line of `/etc/subuid`/`/etc/subgid` for the calling
//! user and concatenates all of the granted ranges into the child's
//! `uid_map`/`gid_map`, rather than stopping at the first line: a single
//! subordinate-range line is common but not guaranteed, and truncating to
//! the first entry silently shrinks the mapped range on hosts that split a
//! user's allocation across multiple lines.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// One contiguous subordinate id range: `host_start` in the host namespace
/// maps to `count` container-side ids, offset by the ranges before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    /// First id of the range, as seen from the host namespace.
    pub host_start: u32,
    /// Number of ids in the range.
    pub count: u32,
}

/// Reads and concatenates every subordinate range granted to `user` (by
/// name or uid) from `path` (`/etc/subuid` or `/etc/subgid`). A missing file
/// yields no ranges rather than an error, since a host may grant the whole
/// allocation through other means.
pub fn read_subid_ranges(path: &Path, user: &str, uid: u32) -> Result<Vec<IdRange>> {
    let contents = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::Io(e)),
    };

    let uid_str = uid.to_string();
    let mut ranges = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.splitn(3, ':');
        let (Some(owner), Some(start), Some(count)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if owner != user && owner != uid_str {
            continue;
        }
        let (Ok(start), Ok(count)) = (start.parse(), count.parse()) else {
            continue;
        };
        ranges.push(IdRange {
            host_start: start,
            count,
        });
    }
    Ok(ranges)
}

/// Builds `uid_map`/`gid_map` file contents for a rootless launch: id 0
/// inside the container maps to the caller's own id outside, and the
/// subordinate ranges follow in order, each offset by the ids already
/// mapped before it.
#[must_use]
pub fn build_map(owner_id: u32, subordinate: &[IdRange]) -> String {
    let mut out = format!("0 {owner_id} 1\n");
    let mut inner = 1u32;
    for range in subordinate {
        out.push_str(&format!("{inner} {} {}\n", range.host_start, range.count));
        inner += range.count;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn read_subid_ranges_concatenates_all_matching_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "alice:100000:65536").unwrap();
        writeln!(file, "bob:165536:65536").unwrap();
        writeln!(file, "alice:231072:1000").unwrap();
        let ranges = read_subid_ranges(file.path(), "alice", 1000).unwrap();
        assert_eq!(
            ranges,
            vec![
                IdRange {
                    host_start: 100_000,
                    count: 65_536
                },
                IdRange {
                    host_start: 231_072,
                    count: 1_000
                },
            ]
        );
    }

    #[test]
    fn read_subid_ranges_matches_by_uid_when_name_absent() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1000:100000:65536").unwrap();
        let ranges = read_subid_ranges(file.path(), "someone", 1000).unwrap();
        assert_eq!(
            ranges,
            vec![IdRange {
                host_start: 100_000,
                count: 65_536
            }]
        );
    }

    #[test]
    fn missing_subid_file_yields_no_ranges() {
        let ranges = read_subid_ranges(Path::new("/nonexistent/subuid"), "alice", 1000).unwrap();
        assert!(ranges.is_empty());
    }

    #[test]
    fn build_map_offsets_each_range_by_ids_already_mapped() {
        let ranges = vec![
            IdRange {
                host_start: 100_000,
                count: 65_536,
            },
            IdRange {
                host_start: 231_072,
                count: 1_000,
            },
        ];
        let map = build_map(1000, &ranges);
        assert_eq!(map, "0 1000 1\n1 100000 65536\n65537 231072 1000\n");
    }
}
