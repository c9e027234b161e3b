//! The polymorphic cipher schemes backing string encryption.
//!
//! Each encrypted string draws one of four schemes at random. The key
//! material is never stored raw: every scheme ships its key in an
//! obfuscated form that the emitted decryption stub reverses at entry.
//!
//! | scheme | ciphertext           | stored key material        |
//! |--------|----------------------|----------------------------|
//! | xor    | `p[i] ^ k[i mod 16]` | `k[i] ^ i`                 |
//! | add    | `p[i] + k[i mod 16]` | `k[i] + i`                 |
//! | sub    | `p[i] ^ k[i mod 16]` | `0xFF - k[i]`              |
//! | sbox   | `S[p[i]]`            | the inverse permutation    |
//!
//! The schemes are a closed set, so they live in one tagged enum rather
//! than behind a trait object.

use crate::rng::Xorshift32;

/// Length of the per-string key for the keyed schemes.
pub const KEY_LEN: usize = 16;

/// One concrete cipher instance: scheme plus key material.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CipherScheme {
    /// XOR with a repeating key.
    XorKey {
        /// The raw key.
        key: [u8; KEY_LEN],
    },
    /// Byte-wise addition of a repeating key.
    AddKey {
        /// The raw key.
        key: [u8; KEY_LEN],
    },
    /// XOR with a repeating key whose stored form is the byte-wise
    /// complement-from-0xFF.
    SubConst {
        /// The raw key.
        key: [u8; KEY_LEN],
    },
    /// Substitution through a random permutation of 0..=255.
    SBox {
        /// The forward permutation applied when encrypting.
        forward: [u8; 256],
        /// The inverse permutation embedded in the binary.
        inverse: [u8; 256],
    },
}

impl CipherScheme {
    /// Draw a scheme uniformly, with fresh random key material.
    pub fn random(rng: &mut Xorshift32) -> Self {
        match rng.below(4) {
            0 => Self::XorKey { key: random_key(rng) },
            1 => Self::AddKey { key: random_key(rng) },
            2 => Self::SubConst { key: random_key(rng) },
            _ => {
                let forward = random_permutation(rng);
                let mut inverse = [0u8; 256];
                for (i, &s) in forward.iter().enumerate() {
                    inverse[s as usize] = i as u8;
                }
                Self::SBox { forward, inverse }
            }
        }
    }

    /// Short name for logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            Self::XorKey { .. } => "xor",
            Self::AddKey { .. } => "add",
            Self::SubConst { .. } => "sub",
            Self::SBox { .. } => "sbox",
        }
    }

    /// Encrypt `plain` (trailing NUL included).
    pub fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        match self {
            Self::XorKey { key } | Self::SubConst { key } => plain
                .iter()
                .enumerate()
                .map(|(i, &p)| p ^ key[i % KEY_LEN])
                .collect(),
            Self::AddKey { key } => plain
                .iter()
                .enumerate()
                .map(|(i, &p)| p.wrapping_add(key[i % KEY_LEN]))
                .collect(),
            Self::SBox { forward, .. } => plain.iter().map(|&p| forward[p as usize]).collect(),
        }
    }

    /// Reference decryption, byte-for-byte inverse of [`encrypt`].
    /// The emitted stubs implement exactly this.
    ///
    /// [`encrypt`]: Self::encrypt
    pub fn decrypt(&self, cipher: &[u8]) -> Vec<u8> {
        match self {
            Self::XorKey { key } | Self::SubConst { key } => cipher
                .iter()
                .enumerate()
                .map(|(i, &c)| c ^ key[i % KEY_LEN])
                .collect(),
            Self::AddKey { key } => cipher
                .iter()
                .enumerate()
                .map(|(i, &c)| c.wrapping_sub(key[i % KEY_LEN]))
                .collect(),
            Self::SBox { inverse, .. } => cipher.iter().map(|&c| inverse[c as usize]).collect(),
        }
    }

    /// The key material as it is embedded in the module: the obfuscated
    /// key for the keyed schemes, the inverse permutation for the s-box.
    pub fn stored_key_material(&self) -> Vec<u8> {
        match self {
            Self::XorKey { key } => key
                .iter()
                .enumerate()
                .map(|(i, &k)| k ^ i as u8)
                .collect(),
            Self::AddKey { key } => key
                .iter()
                .enumerate()
                .map(|(i, &k)| k.wrapping_add(i as u8))
                .collect(),
            Self::SubConst { key } => key.iter().map(|&k| 0xFF - k).collect(),
            Self::SBox { inverse, .. } => inverse.to_vec(),
        }
    }
}

fn random_key(rng: &mut Xorshift32) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rng.fill_bytes(&mut key);
    key
}

fn random_permutation(rng: &mut Xorshift32) -> [u8; 256] {
    let mut table = [0u8; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        *slot = i as u8;
    }
    rng.shuffle(&mut table);
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schemes(seed: u32) -> Vec<CipherScheme> {
        let mut rng = Xorshift32::from_seed(seed);
        let mut out = Vec::new();
        // Enough draws that every scheme kind shows up.
        while out.len() < 64 {
            out.push(CipherScheme::random(&mut rng));
        }
        for name in ["xor", "add", "sub", "sbox"] {
            assert!(out.iter().any(|s| s.name() == name), "missing {name}");
        }
        out
    }

    #[test]
    fn round_trip_all_schemes_all_lengths() {
        let mut rng = Xorshift32::from_seed(0xDEAD);
        for scheme in schemes(0xBEEF) {
            for len in [0usize, 1, 2, 15, 16, 17, 255, 256, 1024] {
                // Arbitrary bytes with a trailing NUL, like a C string.
                let mut plain: Vec<u8> = (0..len).map(|_| rng.below(255) as u8 + 1).collect();
                plain.push(0);
                let cipher = scheme.encrypt(&plain);
                assert_eq!(scheme.decrypt(&cipher), plain, "{}", scheme.name());
            }
        }
    }

    #[test]
    fn stored_key_reverses() {
        for scheme in schemes(7) {
            let stored = scheme.stored_key_material();
            match &scheme {
                CipherScheme::XorKey { key } => {
                    let recovered: Vec<u8> = stored
                        .iter()
                        .enumerate()
                        .map(|(i, &k)| k ^ i as u8)
                        .collect();
                    assert_eq!(&recovered, key);
                }
                CipherScheme::AddKey { key } => {
                    let recovered: Vec<u8> = stored
                        .iter()
                        .enumerate()
                        .map(|(i, &k)| k.wrapping_sub(i as u8))
                        .collect();
                    assert_eq!(&recovered, key);
                }
                CipherScheme::SubConst { key } => {
                    let recovered: Vec<u8> = stored.iter().map(|&k| 0xFF - k).collect();
                    assert_eq!(&recovered, key);
                }
                CipherScheme::SBox { forward, inverse } => {
                    assert_eq!(&stored, inverse);
                    for p in 0..=255u8 {
                        assert_eq!(inverse[forward[p as usize] as usize], p);
                    }
                }
            }
        }
    }

    #[test]
    fn ciphertext_differs_from_plaintext() {
        // A permutation may fix a point, but an all-ASCII string never maps
        // to itself under a fresh random key for the keyed schemes.
        let mut rng = Xorshift32::from_seed(99);
        let plain = b"TEAM_CHAKRAVYUHA\0";
        for _ in 0..32 {
            let scheme = CipherScheme::random(&mut rng);
            let cipher = scheme.encrypt(plain);
            assert_eq!(cipher.len(), plain.len());
            assert_ne!(cipher.as_slice(), plain.as_slice(), "{}", scheme.name());
        }
    }
}
