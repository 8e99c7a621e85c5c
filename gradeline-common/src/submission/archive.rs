use std::io::{Cursor, Read};

use crate::error::Error;

/// Upper bound on the expanded size of a single archive member.
pub const MAX_MEMBER_BYTES: u64 = 64 * 1024 * 1024;

const INITIAL_MEMBER_CAPACITY: usize = 8 * 1024;

/// Reads every regular member of a zip archive into memory.
/// ---
/// Members are returned in archive order as `(name, contents)` pairs.
/// The sizes declared in the archive are not trusted; a member that expands
/// past `MAX_MEMBER_BYTES` rejects the whole archive.
pub fn unzip_members(data: &[u8]) -> Result<Vec<(String, Vec<u8>)>, Error> {
    unzip_members_limited(data, MAX_MEMBER_BYTES)
}

fn unzip_members_limited(data: &[u8], limit: u64) -> Result<Vec<(String, Vec<u8>)>, Error> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| Error::InvalidInput(format!("Invalid archive: {}", e)))?;

    let mut members = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| Error::InvalidInput(format!("Invalid archive entry {}: {}", i, e)))?;

        if entry.is_dir() {
            continue;
        }

        let mut contents = Vec::with_capacity(INITIAL_MEMBER_CAPACITY);
        entry.by_ref().take(limit + 1).read_to_end(&mut contents)?;
        if contents.len() as u64 > limit {
            return Err(Error::InvalidInput(format!(
                "Archive member {} expands past {} bytes",
                entry.name(),
                limit
            )));
        }
        members.push((entry.name().to_string(), contents));
    }

    Ok(members)
}
