//! Unique document ID generation.

use rand::{ thread_rng, Rng };
use rand::distributions::Alphanumeric;

/// The length of an auto-assigned `_id`.
pub const ID_LENGTH: usize = 16;

/// Generates a random alphanumeric identifier of the given length.
pub fn uid(length: usize) -> String {
    thread_rng().sample_iter(&Alphanumeric).take(length).collect()
}

/// Generates a fresh document `_id`: 16 random alphanumeric characters.
///
/// With 62 possible characters per position, collisions within one
/// collection are not a practical concern; the `_id` index still enforces
/// uniqueness as a backstop.
pub fn new_document_id() -> String {
    uid(ID_LENGTH)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use super::*;

    #[test]
    fn ids_are_alphanumeric_and_sized() {
        for _ in 0..64 {
            let id = new_document_id();
            assert_eq!(id.len(), ID_LENGTH);
            assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn ids_do_not_repeat_in_practice() {
        let ids: HashSet<_> = (0..1024).map(|_| new_document_id()).collect();
        assert_eq!(ids.len(), 1024);
    }

    #[test]
    fn length_is_honored() {
        assert_eq!(uid(1).len(), 1);
        assert_eq!(uid(32).len(), 32);
        assert!(uid(0).is_empty());
    }
}
