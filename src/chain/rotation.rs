//! Rotation passes: minting a fresh CA plus reset issues, or fresh issues
//! overlapping the previous ones.

use snafu::ResultExt;

use super::{
    CertificateIssue, ChainData, DecodedCert, EncodeSnafu, Engine, MissingCaSnafu, Result,
    RotateCaSnafu, RotateIssueSnafu, ValiditySnafu,
};
use crate::crypto::{self, KeyPair};

impl Engine<'_> {
    /// Mints a fresh CA, installs it as the last entry of every named CA
    /// bundle and re-issues every certificate from scratch. Overlap for the
    /// issued certificates is unnecessary here: trust continuity during the
    /// transition comes from the bundles carrying both CA generations.
    pub(super) fn rotate_all(&mut self) -> Result<()> {
        tracing::info!(ca = %self.data.ca.name, "rotating CA key pair");
        let ca = crypto::new_ca(&self.data.ca.name, self.options.ca_rotate_interval)
            .context(RotateCaSnafu)?;
        self.install_ca(ca)?;
        self.rotate_certs(set_key_reset_cert)
    }

    pub(super) fn rotate_certs_with_overlap(&mut self) -> Result<()> {
        tracing::info!("rotating issued certificates with overlap");
        self.rotate_certs(set_key_append_cert)
    }

    /// Replaces the CA key pair in all its forms and appends the new CA
    /// certificate to every named bundle of every issue.
    fn install_ca(&mut self, pair: KeyPair) -> Result<()> {
        self.data.ca.key_pem = crypto::encode_key_pem(&pair.key).context(EncodeSnafu)?;
        self.data.ca.cert_pem = crypto::encode_cert_pem(&pair.cert).context(EncodeSnafu)?;
        let decoded = DecodedCert::decode(pair.cert.clone()).context(ValiditySnafu)?;
        for issue in self.data.issues.values_mut() {
            let CertificateIssue {
                ca_certs,
                ca_bundles,
                ..
            } = issue;
            for (bundle, certs) in ca_certs.iter_mut() {
                certs.push(decoded.clone());
                let pem = crypto::encode_certs_pem(certs.iter().map(|cert| &cert.cert))
                    .context(EncodeSnafu)?;
                ca_bundles.insert(bundle.clone(), pem);
            }
        }
        self.data.ca.key_pair = Some(pair);
        Ok(())
    }

    fn rotate_certs(
        &mut self,
        apply: fn(&mut CertificateIssue, KeyPair) -> Result<()>,
    ) -> Result<()> {
        let ChainData { ca, issues } = &mut *self.data;
        let ca_pair = ca.key_pair.as_ref().ok_or_else(|| MissingCaSnafu.build())?;
        for issue in issues.values_mut() {
            tracing::info!(issue = %issue.name, "rotating key pair for issued certificate");
            let pair = crypto::new_server_leaf(
                ca_pair,
                &issue.name,
                &issue.ips,
                &issue.hostnames,
                self.options.cert_rotate_interval,
            )
            .with_context(|_| RotateIssueSnafu {
                issue: issue.name.clone(),
            })?;
            apply(issue, pair)?;
        }
        Ok(())
    }
}

/// Installs a key pair on an issue, dropping any previous certificates.
fn set_key_reset_cert(issue: &mut CertificateIssue, pair: KeyPair) -> Result<()> {
    issue.key_pem = crypto::encode_key_pem(&pair.key).context(EncodeSnafu)?;
    issue.cert_pem = crypto::encode_cert_pem(&pair.cert).context(EncodeSnafu)?;
    issue.certs = vec![DecodedCert::decode(pair.cert).context(ValiditySnafu)?];
    issue.key = Some(pair.key);
    Ok(())
}

/// Installs a key pair on an issue, appending the certificate to the
/// previous ones for the overlap window.
fn set_key_append_cert(issue: &mut CertificateIssue, pair: KeyPair) -> Result<()> {
    issue
        .certs
        .push(DecodedCert::decode(pair.cert).context(ValiditySnafu)?);
    issue.key_pem = crypto::encode_key_pem(&pair.key).context(EncodeSnafu)?;
    issue.cert_pem =
        crypto::encode_certs_pem(issue.certs.iter().map(|cert| &cert.cert)).context(EncodeSnafu)?;
    issue.key = Some(pair.key);
    Ok(())
}
