use crate::registry::{CaRoot, LeafCert};
use chrono::{DateTime, Utc};
use rustls::RootCertStore;
use std::fmt;
use tracing::warn;

/// The mesh's trust anchors: the PEM roots as published by the registry and
/// the verification pool derived from them.
#[derive(Clone)]
pub struct TrustRoots {
    pems: Vec<String>,
    store: RootCertStore,
}

/// This service's identity certificate and its private key.
#[derive(Clone, PartialEq, Eq)]
pub struct LeafIdentity {
    pub cert_pem: String,
    pub key_pem: String,
    pub serial_number: String,
    pub valid_after: DateTime<Utc>,
    pub valid_before: DateTime<Utc>,
}

// === impl TrustRoots ===

impl TrustRoots {
    /// Builds a new set of roots from scratch.
    ///
    /// Every root's PEM is retained as published. A root that can't be parsed
    /// or added to the pool is logged and left out of the pool; the remaining
    /// roots are still trusted.
    pub fn from_roots(roots: &[CaRoot]) -> Self {
        let mut store = RootCertStore::empty();
        for root in roots {
            let mut pem = root.root_cert_pem.as_bytes();
            let mut added = 0;
            for cert in rustls_pemfile::certs(&mut pem) {
                match cert {
                    Ok(der) => match store.add(der) {
                        Ok(()) => added += 1,
                        Err(error) => {
                            warn!(root = %root.id, %error, "Unable to add CA certificate to pool")
                        }
                    },
                    Err(error) => {
                        warn!(root = %root.id, %error, "Unable to parse CA certificate")
                    }
                }
            }
            if added == 0 {
                warn!(root = %root.id, "No CA certificate added to pool");
            }
        }

        Self {
            pems: roots.iter().map(|r| r.root_cert_pem.clone()).collect(),
            store,
        }
    }

    /// The roots' PEM encodings, in the order the registry listed them.
    pub fn pems(&self) -> &[String] {
        &self.pems
    }

    /// The pool of roots that parsed successfully.
    pub fn store(&self) -> &RootCertStore {
        &self.store
    }
}

impl PartialEq for TrustRoots {
    fn eq(&self, other: &Self) -> bool {
        self.pems == other.pems
    }
}

impl Eq for TrustRoots {}

impl fmt::Debug for TrustRoots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustRoots")
            .field("roots", &self.pems.len())
            .field("pool", &self.store.len())
            .finish()
    }
}

// === impl LeafIdentity ===

impl From<LeafCert> for LeafIdentity {
    fn from(leaf: LeafCert) -> Self {
        Self {
            cert_pem: leaf.cert_pem,
            key_pem: leaf.private_key_pem,
            serial_number: leaf.serial_number,
            valid_after: leaf.valid_after,
            valid_before: leaf.valid_before,
        }
    }
}

impl fmt::Debug for LeafIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafIdentity")
            .field("serial_number", &self.serial_number)
            .field("valid_after", &self.valid_after)
            .field("valid_before", &self.valid_before)
            .finish_non_exhaustive()
    }
}
