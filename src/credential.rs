use std::sync::OnceLock;

use tracing::{info, warn};

/// 混淆密钥：仅用于解出内置的上游凭据，不提供任何安全性。
const OBFUSCATION_KEY: &[u8] = b"TheOldLLm-Secure-2025-v9";
const ROTATION_MODULUS: usize = 17;

const EMBEDDED_CREDENTIAL: &str = concat!(
    "3b073c3e0d0f3329217b6f5b6250520f2e061e58531e151a67595e384c1281821a10605804194e5c",
    "23085a0d0a1f648c463d212806201107296b07363f112c485c6f6876071f051106285c6935354735",
    "67261520193b48152047652514743b0b102e41874d3834215f5a186126192018226b1188845821770e",
    "302a395a342642676c24123a544d1c664773075e6c285a75342d1b691715351677034a2d1f0f146a5c",
    "61815a520f8d706a35183c150e391a21235d3432533c731a705c59621c1167654331102f413662657a",
    "2301282135186a6b6a5e6528861d321e4613031d2c1f701f2f591f4d5f761654834f6d416f19030f13",
    "2e0c3d144577172912542b0d5f087e23587b2b4846445d0c274a2d35041e682428325144810e85518b",
    "68221a70453e1836360e27414c743437362a",
);

/// Reverses the positional XOR-and-rotate seal. Invalid hex pairs are skipped
/// but still advance the position counter.
pub fn unseal(hex: &str, key: &[u8]) -> Vec<u8> {
    let bytes = hex.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    let mut pos = 0usize;
    for pair in bytes.chunks(2) {
        if pair.len() == 2
            && let Ok(s) = std::str::from_utf8(pair)
            && let Ok(b) = u8::from_str_radix(s, 16)
        {
            let rotated = b.wrapping_sub((pos % ROTATION_MODULUS) as u8);
            out.push(rotated ^ key[pos % key.len()]);
        }
        pos += 1;
    }
    out
}

/// Inverse of [`unseal`].
#[cfg(test)]
pub fn seal(plain: &[u8], key: &[u8]) -> String {
    plain
        .iter()
        .enumerate()
        .map(|(pos, b)| {
            let mixed = (b ^ key[pos % key.len()]).wrapping_add((pos % ROTATION_MODULUS) as u8);
            format!("{mixed:02x}")
        })
        .collect()
}

/// The upstream bearer credential. An explicit override wins; otherwise the
/// embedded blob is decoded once, lazily, on first use.
#[derive(Debug, Default)]
pub struct Credential {
    override_key: Option<String>,
    derived: OnceLock<String>,
}

impl Credential {
    pub fn new(override_key: Option<String>) -> Self {
        Self {
            override_key,
            derived: OnceLock::new(),
        }
    }

    pub fn get(&self) -> &str {
        if let Some(k) = self.override_key.as_deref() {
            return k;
        }
        self.derived.get_or_init(|| {
            let raw = unseal(EMBEDDED_CREDENTIAL, OBFUSCATION_KEY);
            match String::from_utf8(raw) {
                Ok(s) => {
                    info!("derived upstream credential {}", fingerprint(&s));
                    s
                }
                Err(e) => {
                    warn!("embedded upstream credential is not utf-8: {}", e);
                    String::from_utf8_lossy(e.as_bytes()).into_owned()
                }
            }
        })
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(self.get())
    }

    pub fn is_override(&self) -> bool {
        self.override_key.is_some()
    }
}

/// Masked form safe for logs: the first and last four characters plus the length.
pub fn fingerprint(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return format!("****(len={})", chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}(len={})", chars.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector_round_trips() {
        let sealed = seal(b"hello-world", OBFUSCATION_KEY);
        assert_eq!(sealed, "3c0e0b26074e412a274a41");
        assert_eq!(unseal(&sealed, OBFUSCATION_KEY), b"hello-world");
    }

    #[test]
    fn invalid_pairs_are_skipped_but_consume_a_position() {
        // "zz" occupies position 0, so "0e" decodes as the second byte of the vector.
        let out = unseal("zz0e", OBFUSCATION_KEY);
        assert_eq!(out, b"e");
    }

    #[test]
    fn embedded_credential_decodes_to_a_tenant_key() {
        let cred = Credential::new(None);
        assert!(cred.get().starts_with("on_tenant_"));
        assert_eq!(cred.get().len(), 303);
        assert!(!cred.is_override());
    }

    #[test]
    fn override_wins_and_fingerprint_masks() {
        let cred = Credential::new(Some("sk-abcdefghijklmnop".to_string()));
        assert_eq!(cred.get(), "sk-abcdefghijklmnop");
        assert_eq!(cred.fingerprint(), "sk-a…mnop(len=19)");
        assert_eq!(fingerprint("short"), "****(len=5)");
    }
}
