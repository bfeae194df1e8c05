//! Signed letters: short messages bound to a repository, a point in time and a signer.
//!
//! A letter is transported as a single line of base64, so it can be passed around in
//! line-oriented protocols.  Decoded, it reads:
//!
//! ```text
//! <payload>
//! --
//! T<unix seconds at signing>
//! N<repository identity>
//! X<base64 DER signing certificate>
//! --
//! sha256:<hex digest of everything above the second "--">
//! <base64 signature over the digest line>
//! ```
//!
//! Verification checks the signature against the embedded certificate before looking at any
//! of the embedded fields.  Whether that certificate may sign for the repository at all is a
//! separate question, answered by [`crate::trust`].

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use log::debug;

use crate::{
    hash::{ContentDigest, HashAlgorithm},
    signature::{Certificate, SignatureError, SignatureManager},
};

const SEPARATOR: &str = "\n--\n";

/// Reasons a letter fails verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LetterError {
    /// The envelope can't be decoded.
    #[error("malformed letter: {0}")]
    Malformed(String),
    /// The signature does not match the content or the embedded certificate.
    #[error("bad letter signature: {0}")]
    BadSignature(String),
    /// The letter was signed for a different repository.
    #[error("letter is for repository '{found}', expected '{expected}'")]
    RepositoryMismatch {
        /// The repository the caller asked for.
        expected: String,
        /// The repository the letter names.
        found: String,
    },
    /// The letter is older than the allowed maximum age.
    #[error("letter is {age}s old, maximum is {max_age}s")]
    TooOld {
        /// Age of the letter in seconds.
        age: u64,
        /// Allowed maximum in seconds.
        max_age: u64,
    },
}

fn malformed(reason: impl fmt::Display) -> LetterError {
    LetterError::Malformed(reason.to_string())
}

/// Signs `payload` for `repository` with the manager's identity, stamped with the current time.
pub fn sign(
    repository: &str,
    payload: &str,
    algorithm: HashAlgorithm,
    manager: &SignatureManager,
) -> Result<String, SignatureError> {
    sign_at(repository, payload, algorithm, manager, Utc::now())
}

/// Like [`sign()`], with an explicit signing time.
pub fn sign_at(
    repository: &str,
    payload: &str,
    algorithm: HashAlgorithm,
    manager: &SignatureManager,
    now: DateTime<Utc>,
) -> Result<String, SignatureError> {
    let certificate = manager.certificate().ok_or(SignatureError::NoCertificate)?;
    let mut text = format!(
        "{payload}{SEPARATOR}T{}\nN{repository}\nX{}\n",
        now.timestamp(),
        STANDARD.encode(certificate.to_der()?)
    );
    let digest = algorithm.digest(text.as_bytes()).to_string();
    let signature = manager.sign(digest.as_bytes(), algorithm)?;

    text.push_str(&format!("--\n{digest}\n{}", STANDARD.encode(signature)));
    Ok(STANDARD.encode(text))
}

/// A decoded letter.  Nothing in here is trustworthy until [`Letter::verify_at()`] says so.
#[derive(Debug, Clone)]
pub struct Letter {
    signed: String,
    payload_len: usize,
    timestamp: i64,
    repository: String,
    certificate: Certificate,
    digest: ContentDigest,
    signature: Vec<u8>,
}

/// A successfully verified letter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedLetter {
    /// The message.
    pub payload: String,
    /// The certificate that signed it.
    pub certificate: Certificate,
    /// When it was signed.
    pub signed_at: DateTime<Utc>,
}

impl Letter {
    /// Decodes a wire envelope without verifying it.
    pub fn parse(envelope: &str) -> Result<Self, LetterError> {
        let decoded = STANDARD
            .decode(envelope.trim())
            .map_err(|e| malformed(format!("not base64: {e}")))?;
        let text = String::from_utf8(decoded).map_err(malformed)?;

        let split = text
            .rfind(SEPARATOR)
            .ok_or_else(|| malformed("missing signature"))?;
        let (signed, trailer) = (&text[..split + 1], &text[split + SEPARATOR.len()..]);
        let lines: Vec<&str> = trailer.lines().collect();
        let (digest, signature) = match lines.as_slice() {
            [digest, signature] => (*digest, *signature),
            _ => return Err(malformed("signature trailer must have two lines")),
        };
        let digest = ContentDigest::parse(digest).map_err(malformed)?;
        let signature = STANDARD
            .decode(signature)
            .map_err(|e| malformed(format!("signature: {e}")))?;

        let header_start = signed[..split]
            .rfind(SEPARATOR)
            .ok_or_else(|| malformed("missing header"))?;
        let header = &signed[header_start + SEPARATOR.len()..];

        let (mut timestamp, mut repository, mut certificate) = (None, None, None);
        for line in header.lines() {
            let mut chars = line.chars();
            let marker = chars.next();
            let value = chars.as_str();
            let slot = match marker {
                Some('T') => &mut timestamp,
                Some('N') => &mut repository,
                Some('X') => &mut certificate,
                _ => return Err(malformed(format!("unexpected header line '{line}'"))),
            };
            if slot.replace(value).is_some() {
                return Err(malformed(format!("duplicate header field '{line}'")));
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| malformed("missing timestamp"))?
            .parse::<i64>()
            .map_err(|e| malformed(format!("timestamp: {e}")))?;
        let repository = repository
            .ok_or_else(|| malformed("missing repository"))?
            .to_string();
        let der = STANDARD
            .decode(certificate.ok_or_else(|| malformed("missing certificate"))?)
            .map_err(|e| malformed(format!("certificate: {e}")))?;
        let certificate =
            Certificate::from_der(&der).map_err(|e| malformed(format!("certificate: {e}")))?;

        Ok(Self {
            signed: signed.to_string(),
            payload_len: header_start,
            timestamp,
            repository,
            certificate,
            digest,
            signature,
        })
    }

    /// The repository named in the letter (unverified).
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The embedded signing certificate (unverified).
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Checks signature, repository and age, in that order.
    pub fn verify_at(
        self,
        repository: &str,
        max_age: u64,
        manager: &SignatureManager,
        now: DateTime<Utc>,
    ) -> Result<VerifiedLetter, LetterError> {
        let algorithm = self.digest.algorithm();
        if algorithm.digest(self.signed.as_bytes()) != self.digest {
            return Err(LetterError::BadSignature(
                "digest does not match content".to_string(),
            ));
        }
        let digest = self.digest.to_string();
        if !manager.verify_signature(
            digest.as_bytes(),
            &self.signature,
            &self.certificate,
            algorithm,
        ) {
            return Err(LetterError::BadSignature(manager.last_error()));
        }

        if self.repository != repository {
            return Err(LetterError::RepositoryMismatch {
                expected: repository.to_string(),
                found: self.repository,
            });
        }

        let signed_at = DateTime::from_timestamp(self.timestamp, 0)
            .ok_or_else(|| malformed(format!("timestamp {} out of range", self.timestamp)))?;
        // Letters from the (slightly) future count as brand new.
        let age = (now - signed_at).num_seconds().max(0) as u64;
        if age > max_age {
            return Err(LetterError::TooOld { age, max_age });
        }

        debug!(
            "letter for {repository} signed by {} verified ({age}s old)",
            self.certificate.fingerprint()
        );
        let mut payload = self.signed;
        payload.truncate(self.payload_len);
        Ok(VerifiedLetter {
            payload,
            certificate: self.certificate,
            signed_at,
        })
    }
}

/// Verifies a wire envelope for `repository`, allowing it to be at most `max_age` seconds old.
pub fn verify(
    envelope: &str,
    repository: &str,
    max_age: u64,
    manager: &SignatureManager,
) -> Result<VerifiedLetter, LetterError> {
    verify_at(envelope, repository, max_age, manager, Utc::now())
}

/// Like [`verify()`], evaluated at `now`.
pub fn verify_at(
    envelope: &str,
    repository: &str,
    max_age: u64,
    manager: &SignatureManager,
    now: DateTime<Utc>,
) -> Result<VerifiedLetter, LetterError> {
    Letter::parse(envelope)?.verify_at(repository, max_age, manager, now)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone};

    use super::*;
    use crate::test::{identity, signing_manager};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn reencode(envelope: &str, edit: impl FnOnce(String) -> String) -> String {
        let text = String::from_utf8(STANDARD.decode(envelope).unwrap()).unwrap();
        STANDARD.encode(edit(text))
    }

    #[test]
    fn test_round_trip() {
        let alice = identity("alice");
        let manager = signing_manager(alice);
        let envelope = sign_at("example.org", "hello", HashAlgorithm::Sha256, &manager, t0()).unwrap();
        assert!(!envelope.contains('\n'));

        let verifier = SignatureManager::new();
        let letter = verify_at(&envelope, "example.org", 60, &verifier, t0()).unwrap();
        assert_eq!(letter.payload, "hello");
        assert_eq!(letter.certificate, alice.certificate);
        assert_eq!(letter.signed_at, t0());

        // max_age == 0 still accepts a letter checked in the same second.
        verify_at(&envelope, "example.org", 0, &verifier, t0()).unwrap();
    }

    #[test]
    fn test_payload_edge_cases() {
        let manager = signing_manager(identity("alice"));
        for payload in ["", "line\n--\nTfake\n--\nsha256:00\nx", "trailing newline\n", "ünïcödé"] {
            let envelope = sign_at("example.org", payload, HashAlgorithm::Sha512, &manager, t0()).unwrap();
            let letter = verify_at(&envelope, "example.org", 60, &manager, t0()).unwrap();
            assert_eq!(letter.payload, payload);
        }
    }

    #[test]
    fn test_age_limit() {
        let manager = signing_manager(identity("alice"));
        let envelope = sign_at("example.org", "hello", HashAlgorithm::Sha256, &manager, t0()).unwrap();

        let at_limit = t0() + TimeDelta::seconds(60);
        verify_at(&envelope, "example.org", 60, &manager, at_limit).unwrap();

        let past_limit = t0() + TimeDelta::seconds(61);
        assert_eq!(
            verify_at(&envelope, "example.org", 60, &manager, past_limit).unwrap_err(),
            LetterError::TooOld {
                age: 61,
                max_age: 60
            }
        );

        let earlier = t0() - TimeDelta::seconds(30);
        verify_at(&envelope, "example.org", 0, &manager, earlier).unwrap();
    }

    #[test]
    fn test_repository_mismatch() {
        let manager = signing_manager(identity("alice"));
        let envelope = sign_at("a.example.org", "hello", HashAlgorithm::Sha256, &manager, t0()).unwrap();
        assert_eq!(
            verify_at(&envelope, "b.example.org", 60, &manager, t0()).unwrap_err(),
            LetterError::RepositoryMismatch {
                expected: "b.example.org".to_string(),
                found: "a.example.org".to_string(),
            }
        );
    }

    #[test]
    fn test_signature_checked_before_fields() {
        let manager = signing_manager(identity("alice"));
        let envelope = sign_at("a.example.org", "hello", HashAlgorithm::Sha256, &manager, t0()).unwrap();

        // Rewriting the repository breaks the signature; that must win over the mismatch.
        let replayed = reencode(&envelope, |t| t.replace("\nNa.example.org\n", "\nNb.example.org\n"));
        let err = verify_at(&replayed, "b.example.org", 60, &manager, t0()).unwrap_err();
        assert!(matches!(err, LetterError::BadSignature(_)), "{err}");

        // Same for backdating a stale letter.
        let stamp = format!("\nT{}\n", t0().timestamp());
        let fresh = format!("\nT{}\n", t0().timestamp() + 3600);
        let backdated = reencode(&envelope, |t| t.replace(&stamp, &fresh));
        let err = verify_at(&backdated, "a.example.org", 60, &manager, t0() + TimeDelta::hours(1))
            .unwrap_err();
        assert!(matches!(err, LetterError::BadSignature(_)), "{err}");
    }

    #[test]
    fn test_certificate_substitution() {
        let alice = signing_manager(identity("alice"));
        let bob = identity("bob");
        let envelope = sign_at("example.org", "hello", HashAlgorithm::Sha256, &alice, t0()).unwrap();

        // Swap in bob's certificate and recompute the digest: alice's signature no longer fits.
        let bob_x = format!("X{}\n", STANDARD.encode(bob.certificate.to_der().unwrap()));
        let forged = reencode(&envelope, |text| {
            let (signed, trailer) = text.rsplit_once("--\n").unwrap();
            let signed = signed
                .lines()
                .map(|l| if l.starts_with('X') { bob_x.clone() } else { format!("{l}\n") })
                .collect::<String>();
            let signature = trailer.lines().nth(1).unwrap();
            let digest = HashAlgorithm::Sha256.digest(signed.as_bytes());
            format!("{signed}--\n{digest}\n{signature}")
        });
        let err = verify_at(&forged, "example.org", 60, &alice, t0()).unwrap_err();
        assert!(matches!(err, LetterError::BadSignature(_)), "{err}");
    }

    #[test]
    fn test_malformed_envelopes() {
        let manager = signing_manager(identity("alice"));
        let good = sign_at("example.org", "hello", HashAlgorithm::Sha256, &manager, t0()).unwrap();

        let cases: Vec<(String, &str)> = vec![
            ("%%%".to_string(), "not base64"),
            (STANDARD.encode("just text"), "missing signature"),
            (STANDARD.encode("hello\n--\nsha256:00\nAAAA"), "expected 32 bytes"),
            (reencode(&good, |t| t.replace("\nT", "\nQ")), "unexpected header line"),
            (reencode(&good, |t| t.replace("\nN", "\nT")), "duplicate header field"),
            (reencode(&good, |t| format!("{t}\nextra")), "two lines"),
        ];
        for (envelope, expected) in cases {
            let err = verify_at(&envelope, "example.org", 60, &manager, t0()).unwrap_err();
            assert!(matches!(err, LetterError::Malformed(_)), "{envelope}: {err}");
            assert!(err.to_string().contains(expected), "{envelope}: unexpected error: {err}");
        }
    }

    #[test]
    fn test_sign_requires_identity() {
        assert!(matches!(
            sign("example.org", "hello", HashAlgorithm::Sha256, &SignatureManager::new()),
            Err(SignatureError::NoCertificate)
        ));
    }
}
