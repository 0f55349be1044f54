//! Legacy filename hashing.
//!
//! Mix archives store a 32-bit ID per file instead of its name. Two
//! generations of tools produced those IDs: the original rotate-and-add fold
//! ([`PackageHashType::Classic`]) and a padded CRC-32
//! ([`PackageHashType::Crc32`]). Both must match the legacy tools bit for bit.

use std::fmt;

/// Which algorithm produced a stored filename hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PackageHashType {
    /// Rotate-left-by-one and add, over little-endian words.
    Classic,
    /// CRC-32 (IEEE) over the padded name.
    Crc32,
}

impl PackageHashType {
    /// Both algorithms, in the order they are tried.
    pub const ALL: [PackageHashType; 2] = [PackageHashType::Classic, PackageHashType::Crc32];
}

impl fmt::Display for PackageHashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classic => f.write_str("classic"),
            Self::Crc32 => f.write_str("crc32"),
        }
    }
}

/// Hash a filename with the given algorithm.
///
/// Names are upper-cased first, so the result is case-insensitive.
pub fn hash_filename(filename: &str, hash_type: PackageHashType) -> u32 {
    let name = filename.to_ascii_uppercase().into_bytes();
    match hash_type {
        PackageHashType::Classic => classic_hash(name),
        PackageHashType::Crc32 => crc32_hash(name),
    }
}

fn classic_hash(mut name: Vec<u8>) -> u32 {
    let padded = name.len().next_multiple_of(4);
    name.resize(padded, 0);

    name.chunks_exact(4).fold(0u32, |acc, word| {
        let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        acc.rotate_left(1).wrapping_add(word)
    })
}

fn crc32_hash(mut name: Vec<u8>) -> u32 {
    let len = name.len();
    let rem = len % 4;
    if rem != 0 {
        // The first byte of the trailing partial word is repeated as filler,
        // after a marker byte holding the partial word's length.
        let filler = name[len - rem];
        name.push(rem as u8);
        name.extend(std::iter::repeat(filler).take(3 - rem));
    }

    crc32fast::hash(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_ids() {
        // Well-known IDs of the XCC local database entry.
        assert_eq!(
            hash_filename("local mix database.dat", PackageHashType::Classic),
            0x54C2_D545
        );
        assert_eq!(
            hash_filename("local mix database.dat", PackageHashType::Crc32),
            0x366E_051F
        );
    }

    #[test]
    fn test_short_names() {
        assert_eq!(hash_filename("a", PackageHashType::Classic), 0x41);
        assert_eq!(hash_filename("rules.ini", PackageHashType::Classic), 0xB1C3_B238);
        assert_eq!(hash_filename("rules.ini", PackageHashType::Crc32), 0xF025_A96C);
    }

    #[test]
    fn test_case_insensitive() {
        for hash_type in PackageHashType::ALL {
            assert_eq!(
                hash_filename("Conquer.ENG", hash_type),
                hash_filename("conquer.eng", hash_type)
            );
        }
    }

    #[test]
    fn test_deterministic() {
        for hash_type in PackageHashType::ALL {
            let first = hash_filename("temperat.mix", hash_type);
            for _ in 0..4 {
                assert_eq!(hash_filename("temperat.mix", hash_type), first);
            }
        }
    }

    #[test]
    fn test_word_aligned_names_skip_padding() {
        // "ABCD" needs no padding: the CRC variant is plain CRC-32 of the name.
        assert_eq!(
            hash_filename("abcd", PackageHashType::Crc32),
            crc32fast::hash(b"ABCD")
        );
    }
}
