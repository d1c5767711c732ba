use rand::Rng;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Opaque panel-side identifier (client email / subscription id).
pub fn panel_id(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panel_id_uses_lowercase_alphanumeric_alphabet() {
        for _ in 0..50 {
            let id = panel_id(16);
            assert_eq!(id.len(), 16);
            assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn panel_ids_are_unique_enough() {
        let a = panel_id(16);
        let b = panel_id(16);
        assert_ne!(a, b);
    }
}
