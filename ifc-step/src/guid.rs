use uuid::Uuid;

/// IFC base64 alphabet (differs from RFC 4648)
const ALPHABET: &[u8; 64] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz_$";

pub const GLOBAL_ID_LEN: usize = 22;

/// Compress a 128-bit UUID into the 22-character IFC GlobalId form
pub fn compress(uuid: &Uuid) -> String {
    let value = uuid.as_u128();
    let mut out = [0u8; GLOBAL_ID_LEN];

    for (i, slot) in out.iter_mut().rev().enumerate() {
        let digit = (value >> (6 * i)) & 0x3f;
        *slot = ALPHABET[digit as usize];
    }

    // Only ASCII from ALPHABET ends up in `out`
    out.iter().map(|&b| b as char).collect()
}

/// Fresh random GlobalId
pub fn new_global_id() -> String {
    compress(&Uuid::new_v4())
}

/// Expand a GlobalId back into a UUID. Returns None for malformed ids.
pub fn expand(global_id: &str) -> Option<Uuid> {
    if global_id.len() != GLOBAL_ID_LEN {
        return None;
    }

    let mut value: u128 = 0;
    for (i, c) in global_id.bytes().enumerate() {
        let digit = ALPHABET.iter().position(|&a| a == c)? as u128;
        // The leading character only carries two bits
        if i == 0 && digit > 3 {
            return None;
        }
        value = (value << 6) | digit;
    }

    Some(Uuid::from_u128(value))
}

pub fn is_valid(global_id: &str) -> bool {
    expand(global_id).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_expand_matches() {
        let id = Uuid::new_v4();
        let compressed = compress(&id);
        assert_eq!(compressed.len(), GLOBAL_ID_LEN);
        assert_eq!(expand(&compressed), Some(id));
    }

    #[test]
    fn test_nil_uuid_is_all_zeros() {
        assert_eq!(compress(&Uuid::nil()), "0000000000000000000000");
    }

    #[test]
    fn test_rejects_bad_ids() {
        assert!(!is_valid("short"));
        assert!(!is_valid("Z000000000000000000000"));
        assert!(!is_valid("000000000000000000000!"));
    }
}
