//! Deciding whether a letter's signer is currently trusted for a repository.
//!
//! A [`TrustContext`] bundles everything one verification flow needs: the repository it is
//! about, the trusted material, the local blacklist, the current whitelist and the means to
//! fetch a newer one.  Each letter goes through:
//!
//! 1. letter verification (signature, repository, age)
//! 2. best-effort whitelist refresh if the whitelist is close to expiry
//! 3. blacklist check
//! 4. whitelist expiry check
//! 5. whitelist membership check
//!
//! The blacklist is consulted before the whitelist, so a revoked certificate is refused even
//! if a (possibly stale or compromised) whitelist still lists it.

use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, error, warn};

use crate::{
    blacklist::Blacklist,
    fetch::Fetch,
    hash::Fingerprint,
    letter::{self, LetterError, VerifiedLetter},
    signature::SignatureManager,
    whitelist::{TrustAnchor, Whitelist, WhitelistError, REFRESH_WINDOW},
};

/// Why a letter was not trusted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrustFailure {
    /// The letter itself did not verify.
    #[error(transparent)]
    Letter(#[from] LetterError),
    /// The whitelist is past its expiry time.
    #[error("whitelist expired at {0}")]
    WhitelistExpired(DateTime<Utc>),
    /// The signing certificate is on the local blacklist.
    #[error("certificate {0} is blacklisted")]
    Blacklisted(Fingerprint),
    /// The signing certificate is not on the whitelist.
    #[error("certificate {0} is not whitelisted")]
    NotWhitelisted(Fingerprint),
}

impl TrustFailure {
    /// The process exit code reporting this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Letter(_) => 3,
            Self::WhitelistExpired(_) => 4,
            Self::Blacklisted(_) | Self::NotWhitelisted(_) => 5,
        }
    }
}

/// Static parameters of a verification flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustConfig {
    /// Repository identity (fqrn) letters must be bound to.
    pub repository: String,
    /// Base URL the whitelist is fetched from.
    pub repository_url: String,
    /// Which trusted material may vouch for the whitelist.
    pub anchor: TrustAnchor,
    /// How long before expiry to start refreshing the whitelist.
    pub refresh_window: TimeDelta,
}

impl TrustConfig {
    /// Configuration with the default anchor policy and refresh window.
    pub fn new(repository: impl Into<String>, repository_url: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            repository_url: repository_url.into(),
            anchor: TrustAnchor::default(),
            refresh_window: REFRESH_WINDOW,
        }
    }
}

/// Everything needed to verify letters for one repository.
#[derive(Debug)]
pub struct TrustContext<F: Fetch> {
    config: TrustConfig,
    signatures: SignatureManager,
    blacklist: Blacklist,
    whitelist: Whitelist,
    fetcher: F,
}

impl<F: Fetch> TrustContext<F> {
    /// Loads the initial whitelist; failing to do so is fatal.
    pub fn new(
        config: TrustConfig,
        signatures: SignatureManager,
        blacklist: Blacklist,
        fetcher: F,
    ) -> Result<Self, WhitelistError> {
        let whitelist = Self::fetch_whitelist(&config, &signatures, &fetcher)?;
        Ok(Self {
            config,
            signatures,
            blacklist,
            whitelist,
            fetcher,
        })
    }

    fn fetch_whitelist(
        config: &TrustConfig,
        signatures: &SignatureManager,
        fetcher: &F,
    ) -> Result<Whitelist, WhitelistError> {
        Whitelist::load(
            &config.repository,
            &config.repository_url,
            fetcher,
            signatures,
            config.anchor,
        )
    }

    /// The configuration this context was created with.
    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    /// The whitelist currently in use.
    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    /// The local blacklist.
    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    /// Tries to replace the whitelist if it expires within the refresh window.
    ///
    /// Returns whether the whitelist was replaced.  Any failure keeps the current whitelist;
    /// an expired whitelist keeps failing trust decisions regardless.
    pub fn refresh_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if !self
            .whitelist
            .expires_within(now, self.config.refresh_window)
        {
            return false;
        }

        debug!(
            "whitelist expires {}, refreshing",
            self.whitelist.expires_at()
        );
        match Self::fetch_whitelist(&self.config, &self.signatures, &self.fetcher) {
            Ok(fresh) => {
                self.whitelist = fresh;
                true
            }
            Err(err @ WhitelistError::Fetch(_)) => {
                warn!("keeping current whitelist: {err}");
                false
            }
            // Reachable but unacceptable: worth more attention than a network hiccup.
            Err(err) => {
                error!("keeping current whitelist, refresh rejected: {err}");
                false
            }
        }
    }

    /// The trust decision for a certificate, given the current blacklist and whitelist.
    pub fn decide(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> Result<(), TrustFailure> {
        if self.blacklist.contains(fingerprint) {
            return Err(TrustFailure::Blacklisted(*fingerprint));
        }
        if self.whitelist.is_expired(now) {
            return Err(TrustFailure::WhitelistExpired(self.whitelist.expires_at()));
        }
        if !self.whitelist.contains(fingerprint) {
            return Err(TrustFailure::NotWhitelisted(*fingerprint));
        }
        Ok(())
    }

    /// Verifies a letter and the trust in its signer.
    pub fn verify(&mut self, envelope: &str, max_age: u64) -> Result<VerifiedLetter, TrustFailure> {
        self.verify_at(envelope, max_age, Utc::now())
    }

    /// Like [`verify()`](Self::verify), evaluated at `now`.
    pub fn verify_at(
        &mut self,
        envelope: &str,
        max_age: u64,
        now: DateTime<Utc>,
    ) -> Result<VerifiedLetter, TrustFailure> {
        let letter = letter::verify_at(
            envelope,
            &self.config.repository,
            max_age,
            &self.signatures,
            now,
        )?;
        self.refresh_if_due(now);
        self.decide(&letter.certificate.fingerprint(), now)?;
        Ok(letter)
    }
}
