//! Schemed password verification for the bind path.
//!
//! A stored hash may carry a "{SCHEME}" prefix. Dispatch is a typed variant
//! per scheme; unknown schemes surface a typed error so the dispatcher can
//! report a misconfiguration instead of bad credentials.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

/// Argon2id cost parameters, constructed once at startup and passed through
/// the bind path explicitly.
#[derive(Debug, Clone, Copy)]
pub struct Argon2Params {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for Argon2Params {
    fn default() -> Self {
        Argon2Params {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Cleartext,
    Argon2,
    Crypt,
    Ssha,
    Owncloud,
}

#[derive(Debug, Clone)]
pub struct Verifier {
    pub argon2: Argon2Params,
    /// Salt appended to cleartext for Owncloud legacy PHPass hashes.
    pub owncloud_legacy_salt: String,
}

impl Default for Verifier {
    fn default() -> Self {
        Verifier::new(Argon2Params::default())
    }
}

impl Verifier {
    pub fn new(argon2: Argon2Params) -> Self {
        Verifier {
            argon2,
            owncloud_legacy_salt: String::new(),
        }
    }

    /// Validate a cleartext password against a schemed hash.
    ///
    /// Ok(false) means the credentials do not match; Err means the stored
    /// hash cannot be interpreted (unknown scheme, malformed blob).
    pub fn validate(&self, password: &str, hash: &str) -> Result<bool> {
        let (scheme, rest) = split_scheme(hash)?;
        match scheme {
            Scheme::Cleartext => Ok(constant_time_eq(rest.as_bytes(), password.as_bytes())),

            Scheme::Argon2 => {
                // $argon2id$v=19$m=65536,t=3,p=2$c29tZXNhbHQ$RdescudvJCsg...
                let parsed = PasswordHash::new(rest).map_err(|e| {
                    Error::UnsupportedPasswordAlgorithm(format!("argon2: {e}"))
                })?;
                Ok(Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok())
            }

            Scheme::Crypt => {
                // Covers traditional DES (two byte salt) and the glibc
                // $id$salt$digest forms.
                Ok(pwhash::unix::verify(password, rest))
            }

            Scheme::Ssha => {
                // BASE64(SHA-1(clear_text + salt) + salt), 4 byte salt.
                let decoded = BASE64.decode(rest).map_err(|e| {
                    Error::UnsupportedPasswordAlgorithm(format!("ssha: {e}"))
                })?;
                if decoded.len() < Sha1::output_size() + 4 {
                    return Err(Error::UnsupportedPasswordAlgorithm(
                        "ssha: hash too short".to_string(),
                    ));
                }
                let salt = &decoded[decoded.len() - 4..];
                let mut hasher = Sha1::new();
                hasher.update(password.as_bytes());
                hasher.update(salt);
                let mut computed = hasher.finalize().to_vec();
                computed.extend_from_slice(salt);
                Ok(constant_time_eq(&decoded, &computed))
            }

            Scheme::Owncloud => Ok(self.verify_owncloud(password, rest)),
        }
    }

    fn verify_owncloud(&self, password: &str, hash: &str) -> bool {
        if let Some(v1) = hash.strip_prefix("1|") {
            return bcrypt::verify(password, v1).unwrap_or(false);
        }
        match hash.len() {
            // Legacy PHPass hash over cleartext plus instance salt.
            60 => {
                let salted = format!("{}{}", password, self.owncloud_legacy_salt);
                bcrypt::verify(&salted, hash).unwrap_or(false)
            }
            // Legacy hex SHA-1.
            40 => {
                let digest = Sha1::digest(password.as_bytes());
                let hex = digest
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect::<String>();
                constant_time_eq(hash.as_bytes(), hex.as_bytes())
            }
            _ => false,
        }
    }

    /// Produce a schemed hash for storage. Only cleartext and {ARGON2} can
    /// be generated.
    pub fn hash(&self, password: &str, scheme: &str) -> Result<String> {
        match scheme.to_uppercase().as_str() {
            "" | "{CLEARTEXT}" => Ok(password.to_string()),
            "{ARGON2}" => {
                let p = &self.argon2;
                let params = Params::new(p.memory_kib, p.iterations, p.parallelism, None)
                    .map_err(|e| Error::UnsupportedPasswordAlgorithm(format!("argon2: {e}")))?;
                let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
                let salt = SaltString::generate(&mut OsRng);
                let hashed = argon2
                    .hash_password(password.as_bytes(), &salt)
                    .map_err(|e| Error::UnsupportedPasswordAlgorithm(format!("argon2: {e}")))?;
                Ok(format!("{{ARGON2}}{}", hashed))
            }
            other => Err(Error::UnsupportedPasswordAlgorithm(other.to_string())),
        }
    }
}

/// Convenience wrapper with default parameters.
pub fn validate(password: &str, hash: &str) -> Result<bool> {
    Verifier::default().validate(password, hash)
}

fn split_scheme(hash: &str) -> Result<(Scheme, &str)> {
    if let Some(rest) = hash.strip_prefix('{') {
        let end = rest
            .find('}')
            .ok_or_else(|| Error::UnsupportedPasswordAlgorithm(hash.to_string()))?;
        if end == 0 {
            return Err(Error::UnsupportedPasswordAlgorithm(hash.to_string()));
        }
        let scheme = match rest[..end].to_uppercase().as_str() {
            "CLEARTEXT" => Scheme::Cleartext,
            "ARGON2" => Scheme::Argon2,
            "CRYPT" => Scheme::Crypt,
            "SSHA" => Scheme::Ssha,
            other => {
                return Err(Error::UnsupportedPasswordAlgorithm(other.to_string()));
            }
        };
        return Ok((scheme, &rest[end + 1..]));
    }

    // No scheme prefix: Owncloud legacy shapes, otherwise cleartext.
    if hash.starts_with("1|")
        || (hash.len() == 60 && hash.starts_with("$2"))
        || (hash.len() == 40 && hash.bytes().all(|b| b.is_ascii_hexdigit()))
    {
        return Ok((Scheme::Owncloud, hash));
    }
    Ok((Scheme::Cleartext, hash))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleartext_comparison() {
        assert!(validate("secret", "secret").unwrap());
        assert!(!validate("wrong", "secret").unwrap());
        assert!(validate("secret", "{CLEARTEXT}secret").unwrap());
    }

    #[test]
    fn argon2_roundtrip() {
        let verifier = Verifier::new(Argon2Params {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        });
        let hash = verifier.hash("correct horse", "{ARGON2}").unwrap();
        assert!(hash.starts_with("{ARGON2}$argon2id$"));
        assert!(verifier.validate("correct horse", &hash).unwrap());
        assert!(!verifier.validate("battery staple", &hash).unwrap());
    }

    #[test]
    fn ssha_known_vector() {
        // sha1("secret" + salt) + salt, salt = "salt".
        let salt = b"salt";
        let mut hasher = Sha1::new();
        hasher.update(b"secret");
        hasher.update(salt);
        let mut blob = hasher.finalize().to_vec();
        blob.extend_from_slice(salt);
        let hash = format!("{{SSHA}}{}", BASE64.encode(&blob));

        assert!(validate("secret", &hash).unwrap());
        assert!(!validate("wrong", &hash).unwrap());
    }

    #[test]
    fn crypt_glibc_form() {
        // "password" hashed with SHA-512 crypt, salt "saltstring".
        let hash = pwhash::sha512_crypt::hash_with("$6$saltstring", "password").unwrap();
        let schemed = format!("{{CRYPT}}{}", hash);
        assert!(validate("password", &schemed).unwrap());
        assert!(!validate("nope", &schemed).unwrap());
    }

    #[test]
    fn owncloud_v1_bcrypt() {
        let inner = bcrypt::hash("secret", 4).unwrap();
        let hash = format!("1|{}", inner);
        assert!(validate("secret", &hash).unwrap());
        assert!(!validate("other", &hash).unwrap());
    }

    #[test]
    fn owncloud_legacy_sha1() {
        // sha1("secret") in hex.
        let hex = Sha1::digest(b"secret")
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();
        assert_eq!(hex.len(), 40);
        assert!(validate("secret", &hex).unwrap());
        assert!(!validate("wrong", &hex).unwrap());
    }

    #[test]
    fn unknown_scheme_is_an_error() {
        assert!(matches!(
            validate("pw", "{MD9}whatever"),
            Err(Error::UnsupportedPasswordAlgorithm(_))
        ));
    }
}
