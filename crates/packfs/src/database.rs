//! XCC filename databases.
//!
//! Mix archives store only name hashes. The XCC tools ship two kinds of
//! database that map hashes back to names: a *local* database stored inside
//! an archive, and a *global* database listing every name known for a game.

use std::collections::HashSet;
use std::io::{ErrorKind, Read};

use byteorder::{ReadBytesExt, LE};
use packfs_common::ReadExt;

use crate::{Error, Result};

/// Name of the local database entry inside a Mix archive.
pub const LOCAL_DATABASE_NAME: &str = "local mix database.dat";

/// Name of the global database resolved through the filesystem.
pub const GLOBAL_DATABASE_NAME: &str = "global mix database.dat";

const LOCAL_HEADER_SIZE: usize = 48;

/// Read the names listed in a local mix database.
pub fn read_local_database<R: Read>(mut reader: R) -> Result<Vec<String>> {
    reader.read_vec(LOCAL_HEADER_SIZE)?;
    let count = read_count(&mut reader, "local mix database")?;

    (0..count)
        .map(|_| reader.read_asciiz().map_err(Error::from))
        .collect()
}

/// Read the de-duplicated names listed in a global mix database.
///
/// The file is a sequence of blocks, one per game, each a count followed by
/// that many (name, description) pairs.
pub fn read_global_database<R: Read>(mut reader: R) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();

    loop {
        let count = match reader.read_i32::<LE>() {
            Ok(count) => count,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        if count < 0 {
            return Err(Error::malformed(
                "global mix database",
                format!("negative block size {count}"),
            ));
        }

        for _ in 0..count {
            let name = reader.read_asciiz()?;
            let _description = reader.read_asciiz()?;
            if seen.insert(name.clone()) {
                names.push(name);
            }
        }
    }

    tracing::debug!(names = names.len(), "read global mix database");
    Ok(names)
}

fn read_count<R: Read>(reader: &mut R, format: &'static str) -> Result<usize> {
    let count = reader.read_i32::<LE>()?;
    usize::try_from(count)
        .map_err(|_| Error::malformed(format, format!("negative entry count {count}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn asciiz(out: &mut Vec<u8>, s: &str) {
        out.extend_from_slice(s.as_bytes());
        out.push(0);
    }

    #[test]
    fn test_local_database() {
        let mut data = vec![0u8; LOCAL_HEADER_SIZE];
        data.extend_from_slice(&2i32.to_le_bytes());
        asciiz(&mut data, "rules.ini");
        asciiz(&mut data, "art.ini");

        let names = read_local_database(Cursor::new(data)).unwrap();
        assert_eq!(names, ["rules.ini", "art.ini"]);
    }

    #[test]
    fn test_local_database_truncated() {
        let mut data = vec![0u8; LOCAL_HEADER_SIZE];
        data.extend_from_slice(&3i32.to_le_bytes());
        asciiz(&mut data, "only-one");

        assert!(read_local_database(Cursor::new(data)).is_err());
    }

    #[test]
    fn test_global_database_dedups_across_blocks() {
        let mut data = Vec::new();
        data.extend_from_slice(&2i32.to_le_bytes());
        asciiz(&mut data, "conquer.mix");
        asciiz(&mut data, "main data");
        asciiz(&mut data, "rules.ini");
        asciiz(&mut data, "");
        data.extend_from_slice(&1i32.to_le_bytes());
        asciiz(&mut data, "rules.ini");
        asciiz(&mut data, "again");

        let names = read_global_database(Cursor::new(data)).unwrap();
        assert_eq!(names, ["conquer.mix", "rules.ini"]);
    }

    #[test]
    fn test_global_database_empty() {
        assert!(read_global_database(Cursor::new(Vec::new()))
            .unwrap()
            .is_empty());
    }
}
