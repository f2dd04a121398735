//! Cleanup passes: dropping expired and out-of-overlap material.

use std::time::Duration;

use snafu::ResultExt;
use time::OffsetDateTime;

use super::{CertificateIssue, DecodedCert, EncodeSnafu, Engine, Result};
use crate::crypto::{self, clock};

impl Engine<'_> {
    /// Drops superseded entries from every named CA bundle: anything expired
    /// or past `NotBefore + ca_overlap_interval`. The final entry of each
    /// bundle is always retained; consumers must keep trusting the current
    /// CA.
    pub(super) fn clean_up_ca_bundles(&mut self) -> Result<()> {
        tracing::info!("cleaning up CA certificates");
        let now = clock::now();
        let overlap = self.options.ca_overlap_interval;
        for issue in self.data.issues.values_mut() {
            let CertificateIssue {
                ca_certs,
                ca_bundles,
                ..
            } = issue;
            for (bundle, certs) in ca_certs.iter_mut() {
                clean_up_bundle(certs, overlap, now);
                let pem = crypto::encode_certs_pem(certs.iter().map(|cert| &cert.cert))
                    .context(EncodeSnafu)?;
                ca_bundles.insert(bundle.clone(), pem);
            }
        }
        Ok(())
    }

    /// Drops expired certificates from every issue, the newest included. An
    /// issue left without certificates reads as missing material on the next
    /// pass, which re-triggers rotation.
    pub(super) fn clean_up_certs(&mut self) -> Result<()> {
        tracing::info!("cleaning up issued certificates");
        let now = clock::now();
        for issue in self.data.issues.values_mut() {
            issue.certs.retain(|cert| {
                let keep = now < cert.not_after;
                if !keep {
                    tracing::info!(
                        issue = %issue.name,
                        not_after = %cert.not_after,
                        "cleaning up expired issued certificate"
                    );
                }
                keep
            });
            issue.cert_pem = crypto::encode_certs_pem(issue.certs.iter().map(|cert| &cert.cert))
                .context(EncodeSnafu)?;
        }
        Ok(())
    }
}

/// Removes every superseded bundle entry that is expired or past its overlap
/// window, keeping the final entry unconditionally.
pub(super) fn clean_up_bundle(
    certs: &mut Vec<DecodedCert>,
    overlap: Duration,
    now: OffsetDateTime,
) {
    if certs.len() <= 1 {
        return;
    }
    let Some(current) = certs.pop() else {
        return;
    };
    certs.retain(|cert| now < cert.not_after && now < cert.not_before + overlap);
    certs.push(current);
}
