//! Signed, time-bounded certificate whitelists.
//!
//! A repository publishes the fingerprints of the certificates currently allowed to sign for
//! it in a whitelist document next to its content, at `<repository url>/.cvmfswhitelist`.
//! The document is signed by the repository master key (or by a certificate issued by a
//! trusted CA) and carries its own validity window.
//!
//! # Format
//!
//! ```text
//! Nexample.org                                     repository identity
//! I20240101000000                                  issued at (UTC)
//! E20240201000000                                  expires at (UTC)
//! FAB:CD:...:EF # release manager                  zero or more fingerprints
//! --
//! Dsha256:1e2eaa...                                digest of everything above "--"
//! S<base64>                                        signature over the D value
//! C<base64>                                        optional DER signer certificate
//! ```
//!
//! Parsing is strict: unknown markers, missing or repeated fields and a missing signature
//! trailer are all errors.  No field is trusted before the signature has been checked.

use std::{collections::HashSet, fmt};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use log::debug;

use crate::{
    fetch::{Fetch, FetchError},
    hash::{ContentDigest, Fingerprint, HashAlgorithm},
    signature::{Certificate, SignatureError, SignatureManager},
};

/// Name of the whitelist document relative to the repository URL.
pub const WHITELIST_FILE: &str = ".cvmfswhitelist";

/// How long before expiry a caller should start trying to fetch a fresh whitelist.
pub const REFRESH_WINDOW: TimeDelta = TimeDelta::seconds(3 * 24 * 3600);

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const SEPARATOR: &str = "\n--\n";

/// Which trusted material may vouch for a whitelist signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustAnchor {
    /// A pinned repository master key must verify the signature.
    PublicKeys,
    /// The attached signer certificate must chain to the trusted CA bundle.
    CaChain,
    /// Either of the above.
    #[default]
    Any,
}

/// Errors from loading a whitelist.
#[derive(Debug, thiserror::Error)]
pub enum WhitelistError {
    /// The document could not be retrieved.
    #[error("failed to fetch whitelist: {0}")]
    Fetch(#[from] FetchError),
    /// The document does not follow the whitelist format.
    #[error("malformed whitelist: {0}")]
    Malformed(String),
    /// The signature does not verify under any accepted trust anchor.
    #[error("whitelist signature invalid: {0}")]
    SignatureInvalid(String),
    /// The document is for a different repository.
    #[error("whitelist is for repository '{found}', expected '{expected}'")]
    IdentityMismatch {
        /// The repository the caller asked for.
        expected: String,
        /// The repository named in the document.
        found: String,
    },
}

fn malformed(reason: impl fmt::Display) -> WhitelistError {
    WhitelistError::Malformed(reason.to_string())
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, WhitelistError> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| malformed(format!("bad timestamp '{value}': {e}")))
}

/// The unsigned content of a whitelist, as assembled by a repository publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhitelistDocument {
    /// Repository identity (fqrn).
    pub repository: String,
    /// Start of the validity window.
    pub issued_at: DateTime<Utc>,
    /// End of the validity window.
    pub expires_at: DateTime<Utc>,
    /// Certificates allowed to sign for the repository.
    pub fingerprints: Vec<Fingerprint>,
}

impl WhitelistDocument {
    fn body(&self) -> String {
        let mut body = format!(
            "N{}\nI{}\nE{}\n",
            self.repository,
            self.issued_at.format(TIMESTAMP_FORMAT),
            self.expires_at.format(TIMESTAMP_FORMAT)
        );
        for fingerprint in &self.fingerprints {
            body.push_str(&format!("F{fingerprint}\n"));
        }
        body
    }

    /// Produces the signed document text using the manager's private key.
    ///
    /// If the manager also holds a certificate, it is attached so that verifiers can use the
    /// CA path.
    pub fn sign(
        &self,
        manager: &SignatureManager,
        algorithm: HashAlgorithm,
    ) -> Result<String, SignatureError> {
        let mut text = self.body();
        let digest = algorithm.digest(text.as_bytes()).to_string();
        let signature = manager.sign_detached(digest.as_bytes(), algorithm)?;

        text.push_str("--\n");
        text.push_str(&format!("D{digest}\nS{}\n", STANDARD.encode(signature)));
        if let Some(certificate) = manager.certificate() {
            text.push_str(&format!("C{}\n", STANDARD.encode(certificate.to_der()?)));
        }
        Ok(text)
    }
}

struct Trailer {
    digest: ContentDigest,
    signature: Vec<u8>,
    signer: Option<Certificate>,
}

impl Trailer {
    fn parse(text: &str) -> Result<Self, WhitelistError> {
        let (mut digest, mut signature, mut signer) = (None, None, None);
        for line in text.lines() {
            let mut chars = line.chars();
            let marker = chars.next();
            let value = chars.as_str();
            let slot = match marker {
                Some('D') => &mut digest,
                Some('S') => &mut signature,
                Some('C') => &mut signer,
                _ => return Err(malformed(format!("unexpected trailer line '{line}'"))),
            };
            if slot.replace(value).is_some() {
                return Err(malformed(format!("duplicate trailer field '{line}'")));
            }
        }

        let digest = digest.ok_or_else(|| malformed("missing digest"))?;
        let digest = ContentDigest::parse(digest).map_err(malformed)?;
        let signature = signature.ok_or_else(|| malformed("missing signature"))?;
        let signature = STANDARD
            .decode(signature)
            .map_err(|e| malformed(format!("signature: {e}")))?;
        let signer = signer
            .map(|value| {
                let der = STANDARD
                    .decode(value)
                    .map_err(|e| malformed(format!("signer certificate: {e}")))?;
                Certificate::from_der(&der)
                    .map_err(|e| malformed(format!("signer certificate: {e}")))
            })
            .transpose()?;

        Ok(Self {
            digest,
            signature,
            signer,
        })
    }

    fn verify(&self, manager: &SignatureManager, anchor: TrustAnchor) -> bool {
        let data = self.digest.to_string();
        let algorithm = self.digest.algorithm();

        let by_key = || {
            manager.has_trusted_public_keys()
                && manager.verify_with_trusted_keys(data.as_bytes(), &self.signature, algorithm)
        };
        let by_ca = || match &self.signer {
            Some(cert) if manager.has_trusted_ca() => {
                manager.verify_certificate_chain(cert)
                    && manager.verify_signature(data.as_bytes(), &self.signature, cert, algorithm)
            }
            _ => false,
        };

        match anchor {
            TrustAnchor::PublicKeys => by_key(),
            TrustAnchor::CaChain => by_ca(),
            TrustAnchor::Any => by_key() || by_ca(),
        }
    }
}

/// A verified whitelist.
///
/// Values are only ever produced by fully verifying a document, and never modified
/// afterwards: refreshing means loading a new one and replacing the old value.
#[derive(Debug, Clone)]
pub struct Whitelist {
    repository: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    fingerprints: HashSet<Fingerprint>,
    signer: Option<Certificate>,
}

impl Whitelist {
    /// Fetches and verifies the whitelist of the repository at `repository_url`.
    pub fn load(
        repository: &str,
        repository_url: &str,
        fetcher: &impl Fetch,
        manager: &SignatureManager,
        anchor: TrustAnchor,
    ) -> Result<Self, WhitelistError> {
        let url = format!("{}/{WHITELIST_FILE}", repository_url.trim_end_matches('/'));
        let data = fetcher.fetch(&url)?;
        Self::parse(&data, repository, manager, anchor)
    }

    /// Verifies and parses a whitelist document for `repository`.
    pub fn parse(
        data: &[u8],
        repository: &str,
        manager: &SignatureManager,
        anchor: TrustAnchor,
    ) -> Result<Self, WhitelistError> {
        let text = std::str::from_utf8(data).map_err(malformed)?;
        let split = text
            .find(SEPARATOR)
            .ok_or_else(|| malformed("missing signature trailer"))?;
        let (body, trailer) = (&text[..split + 1], &text[split + SEPARATOR.len()..]);

        let trailer = Trailer::parse(trailer)?;
        let algorithm = trailer.digest.algorithm();
        if algorithm.digest(body.as_bytes()) != trailer.digest {
            return Err(WhitelistError::SignatureInvalid(
                "digest does not match content".to_string(),
            ));
        }
        if !manager.has_trusted_public_keys() && !manager.has_trusted_ca() {
            return Err(WhitelistError::SignatureInvalid(
                "no trusted public keys or CA loaded".to_string(),
            ));
        }
        if !trailer.verify(manager, anchor) {
            return Err(WhitelistError::SignatureInvalid(manager.last_error()));
        }

        let whitelist = Self::parse_body(body, trailer.signer)?;
        if whitelist.repository != repository {
            return Err(WhitelistError::IdentityMismatch {
                expected: repository.to_string(),
                found: whitelist.repository,
            });
        }
        debug!(
            "whitelist for {repository}: {} certificate(s), expires {}",
            whitelist.fingerprints.len(),
            whitelist.expires_at
        );
        Ok(whitelist)
    }

    fn parse_body(body: &str, signer: Option<Certificate>) -> Result<Self, WhitelistError> {
        let (mut repository, mut issued_at, mut expires_at) = (None, None, None);
        let mut fingerprints = HashSet::new();

        for line in body.lines() {
            let mut chars = line.chars();
            let marker = chars.next();
            let value = chars.as_str();
            match marker {
                Some('N') if repository.is_none() && !value.is_empty() => {
                    repository = Some(value.to_string())
                }
                Some('I') if issued_at.is_none() => issued_at = Some(parse_timestamp(value)?),
                Some('E') if expires_at.is_none() => expires_at = Some(parse_timestamp(value)?),
                Some('F') => {
                    let value = value.split_once('#').map_or(value, |(fp, _comment)| fp);
                    let fingerprint = Fingerprint::parse(value)
                        .map_err(|e| malformed(format!("fingerprint '{value}': {e}")))?;
                    fingerprints.insert(fingerprint);
                }
                _ => return Err(malformed(format!("unexpected line '{line}'"))),
            }
        }

        let repository = repository.ok_or_else(|| malformed("missing repository name"))?;
        let issued_at = issued_at.ok_or_else(|| malformed("missing issue timestamp"))?;
        let expires_at = expires_at.ok_or_else(|| malformed("missing expiry timestamp"))?;
        if expires_at < issued_at {
            return Err(malformed("expires before it was issued"));
        }

        Ok(Self {
            repository,
            issued_at,
            expires_at,
            fingerprints,
            signer,
        })
    }

    /// The repository this whitelist is for.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// When the whitelist was issued.
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// When the whitelist stops being valid.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Whether the whitelist has expired at `now`.  It is still valid at exactly
    /// [`expires_at()`](Self::expires_at).
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Whether the whitelist expires within `window` of `now` (and so should be refreshed).
    pub fn expires_within(&self, now: DateTime<Utc>, window: TimeDelta) -> bool {
        now + window > self.expires_at
    }

    /// Whether `fingerprint` is listed.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.fingerprints.contains(fingerprint)
    }

    /// The listed fingerprints, in no particular order.
    pub fn fingerprints(&self) -> impl Iterator<Item = &Fingerprint> {
        self.fingerprints.iter()
    }

    /// The certificate attached to the document, if it was signed via the CA path.
    pub fn signer(&self) -> Option<&Certificate> {
        self.signer.as_ref()
    }
}
