use rand::rngs::OsRng;
use rand::Rng;

pub const PASSCODE_LEN: usize = 6;

/// Six decimal digits drawn from the operating system's CSPRNG.
pub fn generate_passcode() -> String {
    (0..PASSCODE_LEN)
        .map(|_| char::from(b'0' + OsRng.gen_range(0..10u8)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passcode_is_six_digits() {
        for _ in 0..100 {
            let code = generate_passcode();
            assert_eq!(code.len(), PASSCODE_LEN);
            assert!(code.chars().all(|c| c.is_ascii_digit()), "{code}");
        }
    }

    #[test]
    fn test_passcodes_vary() {
        let codes: std::collections::HashSet<String> = (0..50).map(|_| generate_passcode()).collect();
        // 50 draws from 10^6 values colliding into one is practically impossible.
        assert!(codes.len() > 1);
    }
}
