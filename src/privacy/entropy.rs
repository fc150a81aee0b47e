//! Shannon entropy over a byte-value histogram, used to flag
//! high-entropy tokens (API keys, session secrets) that don't match any
//! structural pattern.

pub fn shannon_entropy_bits_per_char(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }
    let mut counts = [0u32; 256];
    let mut total = 0u32;
    for b in s.bytes() {
        counts[b as usize] += 1;
        total += 1;
    }
    let total = total as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// A run of characters plausible as part of a token: alphanumeric plus
/// `_`, `-`, `+`, `/`, `=`.
pub fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+' | '/' | '=')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_text_has_low_entropy() {
        let entropy = shannon_entropy_bits_per_char("aaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        assert!(entropy < 1.0);
    }

    #[test]
    fn random_looking_token_has_high_entropy() {
        let entropy = shannon_entropy_bits_per_char("qX7z9Lm2Kp8Rw4Tn6Yb1Vc3Ud5Ef0");
        assert!(entropy >= 4.0, "entropy was {entropy}");
    }
}
