//! The in-memory certificate chain and its deterministic update procedure.
//!
//! A chain aggregates the CA and the certificates issued by it, each issue
//! carrying the named CA bundles its consumers verify against. [`update`]
//! rotates and cleans the chain as needed and predicts when it has to run
//! again; [`verify`] checks that the chain is currently consistent.

mod cleanup;
mod deadlines;
mod rotation;

use std::collections::BTreeMap;

use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use snafu::{OptionExt, ResultExt, Snafu};
use time::OffsetDateTime;

use crate::crypto::{self, KeyPair};
use crate::options::{self, Options};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed validating certificate options"))]
    InvalidOptions { source: options::Error },

    #[snafu(display("failed generating CA key pair"))]
    RotateCa { source: crypto::Error },

    #[snafu(display("failed creating key pair for certificate {issue}"))]
    RotateIssue { issue: String, source: crypto::Error },

    #[snafu(display("failed encoding chain material"))]
    Encode { source: crypto::Error },

    #[snafu(display("failed reading certificate validity"))]
    Validity { source: crypto::Error },

    #[snafu(display("failed to serialize certificate"))]
    Serialize { source: openssl::error::ErrorStack },

    #[snafu(display("CA key pair is missing"))]
    MissingCa,

    #[snafu(display("CA bundle {bundle} of certificate {issue} is empty"))]
    EmptyBundle { issue: String, bundle: String },

    #[snafu(display(
        "last certificate of CA bundle {bundle} of certificate {issue} differs from the current CA certificate"
    ))]
    BundleOutOfSync { issue: String, bundle: String },

    #[snafu(display("failed verifying certificate {issue} with named CA {bundle}"))]
    VerifyIssue {
        issue: String,
        bundle: String,
        source: crypto::Error,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// A certificate with its validity window pre-extracted, so that deadline
/// arithmetic and cleanup stay infallible.
#[derive(Debug, Clone)]
pub(crate) struct DecodedCert {
    pub(crate) cert: X509,
    pub(crate) not_before: OffsetDateTime,
    pub(crate) not_after: OffsetDateTime,
}

impl DecodedCert {
    pub(crate) fn decode(cert: X509) -> crypto::Result<Self> {
        let (not_before, not_after) = crypto::cert_validity(&cert)?;
        Ok(DecodedCert {
            cert,
            not_before,
            not_after,
        })
    }
}

/// The certification authority of a chain.
#[derive(Debug, Default)]
pub struct CaData {
    /// Canonical name, used as the CA certificate's common name.
    pub name: String,
    pub key_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,

    pub(crate) key_pair: Option<KeyPair>,
}

/// An end-entity certificate issued by the chain's CA, together with the
/// named CA bundles known to its consumers.
#[derive(Debug, Default)]
pub struct CertificateIssue {
    /// Canonical name, the service DNS form `<svc>.<ns>.svc`.
    pub name: String,
    pub ips: Vec<String>,
    pub hostnames: Vec<String>,
    pub key_pem: Vec<u8>,
    /// PEM certificate sequence, two blocks during overlap, one otherwise.
    pub cert_pem: Vec<u8>,
    /// Bundle name to PEM-encoded CA certificate list. The last entry of
    /// every bundle is the current CA certificate.
    pub ca_bundles: BTreeMap<String, Vec<u8>>,

    pub(crate) key: Option<PKey<Private>>,
    pub(crate) certs: Vec<DecodedCert>,
    pub(crate) ca_certs: BTreeMap<String, Vec<DecodedCert>>,
}

impl CertificateIssue {
    pub fn new(name: impl Into<String>, ips: Vec<String>, hostnames: Vec<String>) -> Self {
        CertificateIssue {
            name: name.into(),
            ips,
            hostnames,
            ..CertificateIssue::default()
        }
    }
}

/// The full chain: the CA plus the certificates issued by it, keyed by issue
/// name.
#[derive(Debug, Default)]
pub struct ChainData {
    pub ca: CaData,
    pub issues: BTreeMap<String, CertificateIssue>,
}

/// Brings the chain current and predicts when it next needs attention.
///
/// Rotates every issued certificate when one is missing, invalid or past its
/// rotation deadline; additionally rotates the CA (and resets all issues)
/// when the CA itself is due or the chain fails verification; drops expired
/// and out-of-overlap material from bundles and issued lists. Returns the
/// earliest future deadline of the resulting chain.
pub fn update(options: &Options, data: &mut ChainData) -> Result<OffsetDateTime> {
    let options = options.normalized().context(InvalidOptionsSnafu)?;
    decode(data);
    Engine {
        options,
        data,
    }
    .update()
}

/// Verifies the chain: every piece of material parses, the last entry of
/// every named CA bundle is the current CA certificate, and every issue
/// verifies against every one of its bundles. The first failing invariant is
/// returned as an error.
pub fn verify(options: &Options, data: &mut ChainData) -> Result<()> {
    let options = options.normalized().context(InvalidOptionsSnafu)?;
    decode(data);
    Engine {
        options,
        data,
    }
    .verify_tls()
}

struct Engine<'a> {
    options: Options,
    data: &'a mut ChainData,
}

impl Engine<'_> {
    fn update(&mut self) -> Result<OffsetDateTime> {
        tracing::debug!("checking certificate chain for rotation or cleanup");

        let mut rotate_ca = self.ca_rotation_due();
        let rotate_certs = self.cert_rotation_due();

        if !rotate_ca {
            if let Err(err) = self.verify_tls() {
                tracing::info!(
                    error = %err,
                    "certificate chain failed verification, forcing full chain rotation"
                );
                rotate_ca = true;
            }
        }

        if rotate_ca {
            self.rotate_all()?;
        } else if rotate_certs {
            self.rotate_certs_with_overlap()?;
        }

        if self.ca_cleanup_due() {
            self.clean_up_ca_bundles()?;
        }
        if self.cert_cleanup_due() {
            self.clean_up_certs()?;
        }

        let update_at = self.next_update();
        tracing::debug!(update_at = %update_at, "certificate chain current until next update");
        Ok(update_at)
    }

    fn verify_tls(&self) -> Result<()> {
        let ca_pair = self.data.ca.key_pair.as_ref().context(MissingCaSnafu)?;
        let ca_der = ca_pair.cert.to_der().context(SerializeSnafu)?;
        for issue in self.data.issues.values() {
            for (bundle, certs) in &issue.ca_certs {
                let last = certs.last().with_context(|| EmptyBundleSnafu {
                    issue: issue.name.clone(),
                    bundle: bundle.clone(),
                })?;
                snafu::ensure!(
                    last.cert.to_der().context(SerializeSnafu)? == ca_der,
                    BundleOutOfSyncSnafu {
                        issue: issue.name.clone(),
                        bundle: bundle.clone(),
                    }
                );
                let bundle_pem = issue.ca_bundles.get(bundle).map(Vec::as_slice).unwrap_or(b"");
                crypto::verify_tls(&issue.cert_pem, &issue.key_pem, bundle_pem).with_context(
                    |_| VerifyIssueSnafu {
                        issue: issue.name.clone(),
                        bundle: bundle.clone(),
                    },
                )?;
            }
        }
        Ok(())
    }
}

/// Decodes the PEM material of a chain into its openssl forms. Invalid or
/// missing material is tolerated here: the affected slots stay empty, which
/// the rotation predicates observe and answer with a forced rotation.
fn decode(data: &mut ChainData) {
    match decode_key_pair(&data.ca.key_pem, &data.ca.cert_pem) {
        Ok((key, certs)) => {
            data.ca.key_pair = certs
                .into_iter()
                .next_back()
                .map(|last| KeyPair { key, cert: last.cert });
            if data.ca.key_pair.is_none() {
                tracing::info!("CA certificate list is empty, will force full chain rotation");
            }
        }
        Err(err) => {
            tracing::info!(error = %err, "CA key pair invalid, will force full chain rotation");
            data.ca.key_pair = None;
        }
    }

    for issue in data.issues.values_mut() {
        match decode_key_pair(&issue.key_pem, &issue.cert_pem) {
            Ok((key, certs)) => {
                issue.key = Some(key);
                issue.certs = certs;
            }
            Err(err) => {
                tracing::info!(
                    issue = %issue.name,
                    error = %err,
                    "certificate key pair invalid, will force all issued certificates rotation"
                );
                issue.key = None;
                issue.certs = Vec::new();
            }
        }

        issue.ca_certs.clear();
        for (bundle, pem) in &issue.ca_bundles {
            let certs = match decode_certs(pem) {
                Ok(certs) => certs,
                Err(err) => {
                    tracing::info!(
                        issue = %issue.name,
                        bundle = %bundle,
                        error = %err,
                        "verification CA bundle invalid, will force full chain rotation"
                    );
                    Vec::new()
                }
            };
            issue.ca_certs.insert(bundle.clone(), certs);
        }
    }
}

fn decode_key_pair(key_pem: &[u8], cert_pem: &[u8]) -> crypto::Result<(PKey<Private>, Vec<DecodedCert>)> {
    let key = crypto::parse_key_pem(key_pem)?;
    let certs = decode_certs(cert_pem)?;
    Ok((key, certs))
}

fn decode_certs(pem: &[u8]) -> crypto::Result<Vec<DecodedCert>> {
    crypto::parse_certs_pem(pem)?
        .into_iter()
        .map(DecodedCert::decode)
        .collect()
}
