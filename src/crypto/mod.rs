//! The signing module: RSA key pairs, the self-signed CA, server leaf
//! certificates and the TLS verification predicate. All operations are pure
//! over byte arrays and the [`clock`] indirection; no I/O happens here.

pub mod clock;
pub mod pem;

use std::net::IpAddr;
use std::time::Duration;

use openssl::{
    asn1::{Asn1Integer, Asn1Time, Asn1TimeRef},
    bn::{BigNum, MsbOption},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    stack::Stack,
    x509::{
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
            SubjectAlternativeName, SubjectKeyIdentifier,
        },
        store::X509StoreBuilder,
        verify::X509VerifyParam,
        X509Builder, X509NameBuilder, X509Ref, X509StoreContext, X509VerifyResult, X509,
    },
};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use time::OffsetDateTime;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate private key"))]
    GenerateKey { source: openssl::error::ErrorStack },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("failed to serialize certificate material"))]
    Serialize { source: openssl::error::ErrorStack },

    #[snafu(display("failed to parse PEM certificate block"))]
    ParseCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("failed to parse PEM private key"))]
    ParseKey { source: openssl::error::ErrorStack },

    #[snafu(display("failed to read certificate validity"))]
    Validity { source: openssl::error::ErrorStack },

    #[snafu(display("certificate validity is outside the representable range"))]
    ValidityRange { source: time::error::ComponentRange },

    #[snafu(display("certificate list is empty"))]
    EmptyCertificateList,

    #[snafu(display("CA bundle has no certificates"))]
    EmptyCaBundle,

    #[snafu(display("private key does not pair with the leaf certificate"))]
    KeyMismatch,

    #[snafu(display("leaf certificate has no DNS subject alternative name"))]
    MissingDnsName,

    #[snafu(display("failed to set up certificate verification"))]
    VerifySetup { source: openssl::error::ErrorStack },

    #[snafu(display("certificate verification failed: {reason}"))]
    VerificationFailed { reason: String },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A private key together with the certificate carrying its public half.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub key: PKey<Private>,
    pub cert: X509,
}

/// Generates a fresh RSA-2048 private key.
pub fn new_private_key() -> Result<PKey<Private>> {
    openssl::rsa::Rsa::generate(2048)
        .and_then(PKey::try_from)
        .context(GenerateKeySnafu)
}

/// Mints a self-signed CA valid from [`clock::now`] for `duration`.
pub fn new_ca(name: &str, duration: Duration) -> Result<KeyPair> {
    let key = new_private_key()?;
    let not_before = clock::now();
    let not_after = not_before + duration;
    let subject_name = X509NameBuilder::new()
        .and_then(|mut subject| {
            subject.append_entry_by_nid(Nid::COMMONNAME, name)?;
            Ok(subject)
        })
        .context(BuildCertificateSnafu)?
        .build();
    let cert = X509Builder::new()
        .and_then(|mut x509| {
            x509.set_version(
                3 - 1, // zero-indexed
            )?;
            x509.set_subject_name(&subject_name)?;
            x509.set_issuer_name(&subject_name)?;
            x509.set_not_before(Asn1Time::from_unix(not_before.unix_timestamp())?.as_ref())?;
            x509.set_not_after(Asn1Time::from_unix(not_after.unix_timestamp())?.as_ref())?;
            x509.set_pubkey(&key)?;
            let serial = BigNum::from_u32(0)?;
            x509.set_serial_number(Asn1Integer::from_bn(&serial)?.as_ref())?;
            let ctx = x509.x509v3_context(None, None);
            let exts = [
                BasicConstraints::new().critical().ca().build()?,
                SubjectKeyIdentifier::new().build(&ctx)?,
                KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .key_encipherment()
                    .key_cert_sign()
                    .build()?,
            ];
            for ext in exts {
                x509.append_extension(ext)?;
            }
            x509.sign(&key, MessageDigest::sha256())?;
            Ok(x509)
        })
        .context(BuildCertificateSnafu)?
        .build();
    Ok(KeyPair { key, cert })
}

/// Mints a server leaf signed by `ca`, valid from [`clock::now`] for
/// `duration`, with the union of `ips` and `hostnames` as subject alternative
/// names. IP strings that do not parse are skipped.
pub fn new_server_leaf(
    ca: &KeyPair,
    common_name: &str,
    ips: &[String],
    hostnames: &[String],
    duration: Duration,
) -> Result<KeyPair> {
    let key = new_private_key()?;
    let not_before = clock::now();
    let not_after = not_before + duration;
    let cert = X509Builder::new()
        .and_then(|mut x509| {
            let subject_name = X509NameBuilder::new()
                .and_then(|mut subject| {
                    subject.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
                    Ok(subject)
                })?
                .build();
            x509.set_version(
                3 - 1, // zero-indexed
            )?;
            x509.set_subject_name(&subject_name)?;
            x509.set_issuer_name(ca.cert.subject_name())?;
            x509.set_not_before(Asn1Time::from_unix(not_before.unix_timestamp())?.as_ref())?;
            x509.set_not_after(Asn1Time::from_unix(not_after.unix_timestamp())?.as_ref())?;
            x509.set_pubkey(&key)?;
            let mut serial = BigNum::new()?;
            serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
            x509.set_serial_number(Asn1Integer::from_bn(&serial)?.as_ref())?;
            let ctx = x509.x509v3_context(Some(&ca.cert), None);
            let mut exts = vec![
                BasicConstraints::new().build()?,
                KeyUsage::new().digital_signature().key_encipherment().build()?,
                ExtendedKeyUsage::new().server_auth().build()?,
                SubjectKeyIdentifier::new().build(&ctx)?,
                AuthorityKeyIdentifier::new()
                    .issuer(true)
                    .keyid(true)
                    .build(&ctx)?,
            ];
            let mut san = SubjectAlternativeName::new();
            san.critical();
            let mut has_san = false;
            for hostname in hostnames {
                san.dns(hostname);
                has_san = true;
            }
            for ip in ips {
                if ip.parse::<IpAddr>().is_ok() {
                    san.ip(ip);
                    has_san = true;
                }
            }
            if has_san {
                exts.push(san.build(&ctx)?);
            }
            for ext in exts {
                x509.append_extension(ext)?;
            }
            x509.sign(&ca.key, MessageDigest::sha256())?;
            Ok(x509)
        })
        .context(BuildCertificateSnafu)?
        .build();
    Ok(KeyPair { key, cert })
}

pub fn encode_cert_pem(cert: &X509Ref) -> Result<Vec<u8>> {
    cert.to_pem().context(SerializeSnafu)
}

/// Encodes a certificate list as a PEM sequence, preserving list order.
pub fn encode_certs_pem<'a>(certs: impl IntoIterator<Item = &'a X509>) -> Result<Vec<u8>> {
    let mut encoded = Vec::new();
    for cert in certs {
        encoded.extend(cert.to_pem().context(SerializeSnafu)?);
    }
    Ok(encoded)
}

pub fn encode_key_pem(key: &PKey<Private>) -> Result<Vec<u8>> {
    key.private_key_to_pem_pkcs8().context(SerializeSnafu)
}

/// Parses a PEM certificate sequence, preserving the order of the blocks.
/// Empty input yields an empty list; a block that fails X.509 parsing is an
/// error.
pub fn parse_certs_pem(pem: &[u8]) -> Result<Vec<X509>> {
    pem::split_certificate_blocks(pem)
        .into_iter()
        .map(|block| X509::from_pem(block).context(ParseCertificateSnafu))
        .collect()
}

pub fn parse_key_pem(pem: &[u8]) -> Result<PKey<Private>> {
    PKey::private_key_from_pem(pem).context(ParseKeySnafu)
}

/// Returns a certificate's `(NotBefore, NotAfter)` pair.
pub fn cert_validity(cert: &X509Ref) -> Result<(OffsetDateTime, OffsetDateTime)> {
    Ok((
        asn1_time_to_datetime(cert.not_before())?,
        asn1_time_to_datetime(cert.not_after())?,
    ))
}

fn asn1_time_to_datetime(at: &Asn1TimeRef) -> Result<OffsetDateTime> {
    let epoch = Asn1Time::from_unix(0).context(ValiditySnafu)?;
    let diff = epoch.diff(at).context(ValiditySnafu)?;
    OffsetDateTime::from_unix_timestamp(i64::from(diff.days) * 86_400 + i64::from(diff.secs))
        .context(ValidityRangeSnafu)
}

/// Verifies that the current (newest) certificate of `cert_pem` pairs with
/// `key_pem` and chains, at [`clock::now`], to a root from `ca_pem` under the
/// leaf's first DNS subject alternative name. `cert_pem` lists certificates
/// oldest first, so the current leaf is the last block; superseded entries
/// may already be expired during an overlap window and are not verified.
pub fn verify_tls(cert_pem: &[u8], key_pem: &[u8], ca_pem: &[u8]) -> Result<()> {
    let certs = parse_certs_pem(cert_pem)?;
    let leaf = certs.last().context(EmptyCertificateListSnafu)?;
    let key = parse_key_pem(key_pem)?;
    ensure!(
        leaf.public_key().context(VerifySetupSnafu)?.public_eq(&key),
        KeyMismatchSnafu
    );

    let cas = parse_certs_pem(ca_pem)?;
    ensure!(!cas.is_empty(), EmptyCaBundleSnafu);

    let dns_name = leaf
        .subject_alt_names()
        .and_then(|names| {
            names
                .iter()
                .find_map(|name| name.dnsname().map(str::to_owned))
        })
        .context(MissingDnsNameSnafu)?;

    let mut store = X509StoreBuilder::new().context(VerifySetupSnafu)?;
    for ca in &cas {
        store.add_cert(ca.clone()).context(VerifySetupSnafu)?;
    }
    let mut param = X509VerifyParam::new().context(VerifySetupSnafu)?;
    param.set_host(&dns_name).context(VerifySetupSnafu)?;
    param.set_time(clock::now().unix_timestamp() as libc::time_t);
    store.set_param(&param).context(VerifySetupSnafu)?;
    let store = store.build();

    let mut untrusted = Stack::new().context(VerifySetupSnafu)?;
    for cert in &certs[..certs.len() - 1] {
        untrusted.push(cert.clone()).context(VerifySetupSnafu)?;
    }

    let mut ctx = X509StoreContext::new().context(VerifySetupSnafu)?;
    let result = ctx
        .init(&store, leaf, &untrusted, |ctx| {
            ctx.verify_cert()?;
            Ok(ctx.error())
        })
        .context(VerifySetupSnafu)?;
    ensure!(
        result == X509VerifyResult::OK,
        VerificationFailedSnafu {
            reason: result.error_string().to_string(),
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn hostnames() -> Vec<String> {
        vec![
            "foo-svc".to_string(),
            "foo-svc.foo-ns".to_string(),
            "foo-svc.foo-ns.svc".to_string(),
            "foo-svc.foo-ns.svc.cluster.local".to_string(),
        ]
    }

    #[test]
    fn ca_is_self_signed_with_fixed_serial() {
        let _clock = clock::test_support::freeze();
        let ca = new_ca("test-ca", 70 * MINUTE).unwrap();
        assert_eq!(ca.cert.serial_number().to_bn().unwrap(), BigNum::from_u32(0).unwrap());
        assert_eq!(
            ca.cert.subject_name().to_der().unwrap(),
            ca.cert.issuer_name().to_der().unwrap()
        );
        assert!(ca.cert.public_key().unwrap().public_eq(&ca.key));
        let (not_before, not_after) = cert_validity(&ca.cert).unwrap();
        assert_eq!(not_after - not_before, time::Duration::minutes(70));
    }

    #[test]
    fn leaf_carries_requested_alternative_names() {
        let _clock = clock::test_support::freeze();
        let ca = new_ca("test-ca", 70 * MINUTE).unwrap();
        let leaf = new_server_leaf(
            &ca,
            "foo-svc.foo-ns.svc",
            &["10.0.0.1".to_string(), "not an ip".to_string()],
            &hostnames(),
            30 * MINUTE,
        )
        .unwrap();
        let names = leaf.cert.subject_alt_names().unwrap();
        let dns: Vec<_> = names.iter().filter_map(|n| n.dnsname()).collect();
        assert_eq!(
            dns,
            vec![
                "foo-svc",
                "foo-svc.foo-ns",
                "foo-svc.foo-ns.svc",
                "foo-svc.foo-ns.svc.cluster.local",
            ]
        );
        let ips: Vec<_> = names.iter().filter_map(|n| n.ipaddress()).collect();
        assert_eq!(ips, vec![[10, 0, 0, 1].as_slice()]);
    }

    #[test]
    fn pem_round_trip_preserves_order() {
        let _clock = clock::test_support::freeze();
        let first = new_ca("first", 70 * MINUTE).unwrap();
        let second = new_ca("second", 70 * MINUTE).unwrap();
        let encoded = encode_certs_pem([&first.cert, &second.cert]).unwrap();
        let parsed = parse_certs_pem(&encoded).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].to_der().unwrap(), first.cert.to_der().unwrap());
        assert_eq!(parsed[1].to_der().unwrap(), second.cert.to_der().unwrap());
    }

    #[test]
    fn parsing_tolerates_empty_input_but_not_bad_blocks() {
        assert!(parse_certs_pem(b"").unwrap().is_empty());
        assert!(parse_certs_pem(b"random bytes").unwrap().is_empty());
        let bad = b"-----BEGIN CERTIFICATE-----\nnot base64!\n-----END CERTIFICATE-----\n";
        assert!(matches!(
            parse_certs_pem(bad),
            Err(Error::ParseCertificate { .. })
        ));
    }

    #[test]
    fn verify_accepts_a_consistent_chain() {
        let _clock = clock::test_support::freeze();
        let ca = new_ca("test-ca", 70 * MINUTE).unwrap();
        let leaf = new_server_leaf(&ca, "foo-svc.foo-ns.svc", &[], &hostnames(), 30 * MINUTE)
            .unwrap();
        let cert_pem = encode_cert_pem(&leaf.cert).unwrap();
        let key_pem = encode_key_pem(&leaf.key).unwrap();
        let ca_pem = encode_cert_pem(&ca.cert).unwrap();
        verify_tls(&cert_pem, &key_pem, &ca_pem).unwrap();
    }

    #[test]
    fn verify_targets_the_newest_certificate_during_overlap() {
        let clock = clock::test_support::freeze();
        let ca = new_ca("test-ca", 70 * MINUTE).unwrap();
        let old_leaf =
            new_server_leaf(&ca, "foo-svc.foo-ns.svc", &[], &hostnames(), 30 * MINUTE).unwrap();
        clock.advance(27 * MINUTE);
        let new_leaf =
            new_server_leaf(&ca, "foo-svc.foo-ns.svc", &[], &hostnames(), 30 * MINUTE).unwrap();
        let cert_pem = encode_certs_pem([&old_leaf.cert, &new_leaf.cert]).unwrap();
        let key_pem = encode_key_pem(&new_leaf.key).unwrap();
        let ca_pem = encode_cert_pem(&ca.cert).unwrap();
        // The superseded first entry expires here; the chain stays valid
        // because the current leaf is the one verified.
        clock.advance(3 * MINUTE);
        verify_tls(&cert_pem, &key_pem, &ca_pem).unwrap();
    }

    #[test]
    fn verify_respects_the_engine_clock() {
        let clock = clock::test_support::freeze();
        let ca = new_ca("test-ca", 70 * MINUTE).unwrap();
        let leaf = new_server_leaf(&ca, "foo-svc.foo-ns.svc", &[], &hostnames(), 30 * MINUTE)
            .unwrap();
        let cert_pem = encode_cert_pem(&leaf.cert).unwrap();
        let key_pem = encode_key_pem(&leaf.key).unwrap();
        let ca_pem = encode_cert_pem(&ca.cert).unwrap();
        clock.advance(31 * MINUTE);
        assert!(matches!(
            verify_tls(&cert_pem, &key_pem, &ca_pem),
            Err(Error::VerificationFailed { .. })
        ));
    }

    #[test]
    fn verify_rejects_a_foreign_ca() {
        let _clock = clock::test_support::freeze();
        let ca = new_ca("test-ca", 70 * MINUTE).unwrap();
        let other = new_ca("other-ca", 70 * MINUTE).unwrap();
        let leaf = new_server_leaf(&ca, "foo-svc.foo-ns.svc", &[], &hostnames(), 30 * MINUTE)
            .unwrap();
        let cert_pem = encode_cert_pem(&leaf.cert).unwrap();
        let key_pem = encode_key_pem(&leaf.key).unwrap();
        let foreign_pem = encode_cert_pem(&other.cert).unwrap();
        assert!(matches!(
            verify_tls(&cert_pem, &key_pem, &foreign_pem),
            Err(Error::VerificationFailed { .. })
        ));
    }

    #[test]
    fn verify_rejects_a_mismatched_key() {
        let _clock = clock::test_support::freeze();
        let ca = new_ca("test-ca", 70 * MINUTE).unwrap();
        let leaf = new_server_leaf(&ca, "foo-svc.foo-ns.svc", &[], &hostnames(), 30 * MINUTE)
            .unwrap();
        let cert_pem = encode_cert_pem(&leaf.cert).unwrap();
        let other_key = encode_key_pem(&new_private_key().unwrap()).unwrap();
        let ca_pem = encode_cert_pem(&ca.cert).unwrap();
        assert!(matches!(
            verify_tls(&cert_pem, &other_key, &ca_pem),
            Err(Error::KeyMismatch)
        ));
    }

    #[test]
    fn verify_rejects_empty_material() {
        let _clock = clock::test_support::freeze();
        let ca = new_ca("test-ca", 70 * MINUTE).unwrap();
        let leaf = new_server_leaf(&ca, "foo-svc.foo-ns.svc", &[], &hostnames(), 30 * MINUTE)
            .unwrap();
        let cert_pem = encode_cert_pem(&leaf.cert).unwrap();
        let key_pem = encode_key_pem(&leaf.key).unwrap();
        let ca_pem = encode_cert_pem(&ca.cert).unwrap();
        assert!(matches!(
            verify_tls(b"", &key_pem, &ca_pem),
            Err(Error::EmptyCertificateList)
        ));
        assert!(matches!(
            verify_tls(&cert_pem, &key_pem, b""),
            Err(Error::EmptyCaBundle)
        ));
    }
}
