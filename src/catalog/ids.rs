/// Length of a catalog (Spotify) base62 identifier.
pub const EXTERNAL_ID_LEN: usize = 22;

/// Whether `id` has the catalog's identifier shape: 22 base62 characters.
pub fn is_valid_external_id(id: &str) -> bool {
    id.len() == EXTERNAL_ID_LEN && id.bytes().all(|b| b.is_ascii_alphanumeric())
}
