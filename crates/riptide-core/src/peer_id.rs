use rand::RngCore;

use crate::hash_id::Id20;

/// Azureus-style client prefix: client code "RP", version 0.1.0.
const CLIENT_PREFIX: &[u8; 8] = b"-RP0100-";

pub fn generate_peer_id() -> Id20 {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_PREFIX);
    rand::rng().fill_bytes(&mut id[8..]);
    Id20::new(id)
}

/// Best-effort decode of an Azureus-style peer id for logs.
pub fn try_decode_peer_id(id: Id20) -> Option<String> {
    let b = id.as_bytes();
    if b[0] != b'-' || b[7] != b'-' {
        return None;
    }
    let client = std::str::from_utf8(&b[1..3]).ok()?;
    let version = std::str::from_utf8(&b[3..7]).ok()?;
    if !client.chars().all(|c| c.is_ascii_alphanumeric())
        || !version.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(format!("{client}/{version}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_has_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id.as_bytes()[..8], CLIENT_PREFIX);
        assert_eq!(try_decode_peer_id(id).unwrap(), "RP/0100");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(try_decode_peer_id(Id20::new([0xff; 20])).is_none());
    }
}
