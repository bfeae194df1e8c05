//! Test utilities for cvmfs-trust.
//!
//! Identities are generated on first use and cached for the rest of the process, so that the
//! same name always refers to the same key pair.  The CA fixtures (a CA, one issued and one
//! revoked certificate, and a CRL) are checked in under `tests/fixtures/ca`.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use openssl::{
    asn1::Asn1Time,
    hash::MessageDigest,
    pkey::PKey,
    rsa::Rsa,
    symm::Cipher,
    x509::{X509Builder, X509NameBuilder, X509},
};
use tempfile::TempDir;

use crate::{
    fetch::{Fetch, FetchError},
    hash::{Fingerprint, HashAlgorithm},
    signature::{Certificate, SignatureManager},
    whitelist::WhitelistDocument,
};

static KEYDIR: Lazy<TempDir> = Lazy::new(|| {
    TempDir::with_prefix("cvmfs-trust-test-").expect("can't create key directory")
});

static IDENTITIES: Lazy<Mutex<HashMap<String, &'static TestIdentity>>> =
    Lazy::new(Default::default);

/// A self-signed certificate and its key, written out in the formats the tools accept.
#[derive(Debug)]
pub struct TestIdentity {
    /// PEM certificate.
    pub cert_path: PathBuf,
    /// Unencrypted PKCS#8 PEM private key.
    pub key_path: PathBuf,
    /// The same private key, encrypted with [`password`](Self::password).
    pub encrypted_key_path: PathBuf,
    /// PEM public key.
    pub pubkey_path: PathBuf,
    /// Password of the encrypted key.
    pub password: String,
    /// The certificate.
    pub certificate: Certificate,
}

fn generate(name: &str) -> TestIdentity {
    let rsa = Rsa::generate(2048).expect("RSA key generation");
    let key = PKey::from_rsa(rsa).expect("PKey from RSA");

    let mut name_builder = X509NameBuilder::new().expect("X509NameBuilder");
    name_builder
        .append_entry_by_text("CN", name)
        .expect("append CN");
    let subject = name_builder.build();

    let mut builder = X509Builder::new().expect("X509Builder");
    builder.set_version(2).expect("set version");
    builder.set_subject_name(&subject).expect("set subject");
    builder.set_issuer_name(&subject).expect("set issuer");
    builder.set_pubkey(&key).expect("set pubkey");
    let not_before = Asn1Time::days_from_now(0).expect("not_before");
    let not_after = Asn1Time::days_from_now(365).expect("not_after");
    builder.set_not_before(&not_before).expect("set not_before");
    builder.set_not_after(&not_after).expect("set not_after");
    builder
        .sign(&key, MessageDigest::sha256())
        .expect("self-sign");
    let x509 = builder.build();

    let password = format!("{name}-password");
    let dir = KEYDIR.path();
    let identity = TestIdentity {
        cert_path: dir.join(format!("{name}.crt")),
        key_path: dir.join(format!("{name}.key")),
        encrypted_key_path: dir.join(format!("{name}.enc.key")),
        pubkey_path: dir.join(format!("{name}.pub")),
        certificate: Certificate::new(x509.clone()).expect("certificate"),
        password,
    };

    fs::write(&identity.cert_path, x509.to_pem().unwrap()).unwrap();
    fs::write(&identity.key_path, key.private_key_to_pem_pkcs8().unwrap()).unwrap();
    fs::write(
        &identity.encrypted_key_path,
        key.private_key_to_pem_pkcs8_passphrase(
            Cipher::aes_256_cbc(),
            identity.password.as_bytes(),
        )
        .unwrap(),
    )
    .unwrap();
    fs::write(&identity.pubkey_path, key.public_key_to_pem().unwrap()).unwrap();
    identity
}

/// The identity called `name`, generated on first use.
pub fn identity(name: &str) -> &'static TestIdentity {
    let mut identities = IDENTITIES.lock().unwrap();
    *identities
        .entry(name.to_string())
        .or_insert_with(|| &*Box::leak(Box::new(generate(name))))
}

/// A manager holding the certificate and private key of `identity`.
pub fn signing_manager(identity: &TestIdentity) -> SignatureManager {
    let mut manager = SignatureManager::new();
    manager.load_certificate(&identity.cert_path).unwrap();
    manager.load_private_key(&identity.key_path, "").unwrap();
    manager
}

/// A manager holding the repository master key, which signs whitelists.
pub fn master_manager() -> SignatureManager {
    signing_manager(identity("master"))
}

/// A manager trusting the repository master key.
pub fn trusting() -> SignatureManager {
    let mut manager = SignatureManager::new();
    manager
        .load_trusted_public_keys([&identity("master").pubkey_path])
        .unwrap();
    manager
}

/// A whitelist document for `repository`, signed with the master key.
pub fn signed_whitelist(
    repository: &str,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    fingerprints: Vec<Fingerprint>,
) -> String {
    let document = WhitelistDocument {
        repository: repository.to_string(),
        issued_at,
        expires_at,
        fingerprints,
    };
    document
        .sign(&master_manager(), HashAlgorithm::Sha256)
        .unwrap()
}

/// The checked-in CA fixtures.
#[derive(Debug)]
pub struct CaBundle {
    /// CA certificate followed by a CRL revoking [`revoked`](Self::revoked).
    pub bundle_path: PathBuf,
    /// The CA certificate alone.
    pub ca_only_path: PathBuf,
    /// A certificate issued by the CA.
    pub issued: Certificate,
    /// PEM file of [`issued`](Self::issued).
    pub issued_cert_path: PathBuf,
    /// Unencrypted key of [`issued`](Self::issued).
    pub issued_key_path: PathBuf,
    /// A certificate issued by the CA and later revoked.
    pub revoked: Certificate,
    /// PEM file of [`revoked`](Self::revoked).
    pub revoked_cert_path: PathBuf,
    /// Unencrypted key of [`revoked`](Self::revoked).
    pub revoked_key_path: PathBuf,
}

static CA_BUNDLE: Lazy<CaBundle> = Lazy::new(|| {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/ca");
    let load = |file: &str| {
        let pem = fs::read(dir.join(file)).unwrap();
        Certificate::new(X509::from_pem(&pem).unwrap()).unwrap()
    };
    CaBundle {
        bundle_path: dir.join("bundle.pem"),
        ca_only_path: dir.join("ca.pem"),
        issued: load("issued.pem"),
        issued_cert_path: dir.join("issued.pem"),
        issued_key_path: dir.join("issued.key"),
        revoked: load("revoked.pem"),
        revoked_cert_path: dir.join("revoked.pem"),
        revoked_key_path: dir.join("revoked.key"),
    }
});

/// The CA fixtures.
pub fn ca_bundle() -> &'static CaBundle {
    &CA_BUNDLE
}

/// An in-memory [`Fetch`] implementation.
///
/// URLs that were never registered fail with [`FetchError::Http`] 404.
#[derive(Debug, Default)]
pub struct TestFetcher {
    documents: RefCell<HashMap<String, Result<Vec<u8>, FetchError>>>,
    calls: Cell<usize>,
}

impl TestFetcher {
    /// A fetcher serving nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `body` at `url`, replacing whatever was there.
    pub fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.documents
            .borrow_mut()
            .insert(url.to_string(), Ok(body.into()));
    }

    /// Makes requests for `url` fail with `error`.
    pub fn fail(&self, url: &str, error: FetchError) {
        self.documents
            .borrow_mut()
            .insert(url.to_string(), Err(error));
    }

    /// Number of requests made so far.
    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl Fetch for TestFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.calls.set(self.calls.get() + 1);
        self.documents
            .borrow()
            .get(url)
            .cloned()
            .unwrap_or_else(|| {
                Err(FetchError::Http {
                    url: url.to_string(),
                    status: 404,
                })
            })
    }
}
