//! Certificate trust for CernVM-FS repositories.
//!
//! Repository content is signed by certificates that are vouched for by a signed, expiring
//! *whitelist* published next to the repository.  Clients combine that whitelist with a local
//! *blacklist* of revoked certificates.  On top of this, a *letter* is a small signed message
//! bound to a repository and a point in time, verified against the same trust decision.
//!
//! The main entry point is [`trust::TrustContext`].

pub mod blacklist;
pub mod fetch;
pub mod hash;
pub mod letter;
pub mod signature;
pub mod trust;
pub mod whitelist;

#[cfg(any(test, feature = "test"))]
pub mod test;
