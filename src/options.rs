//! Rotation and overlap intervals for the certificate chain

use std::time::Duration;

use snafu::{ensure, Snafu};

const ONE_YEAR: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("ca_overlap_interval has to be <= ca_rotate_interval"))]
    CaOverlapExceedsCaRotate,

    #[snafu(display("cert_rotate_interval has to be <= ca_rotate_interval"))]
    CertRotateExceedsCaRotate,

    #[snafu(display("cert_overlap_interval has to be <= cert_rotate_interval"))]
    CertOverlapExceedsCertRotate,
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Durations governing when chain material is rotated and how long replaced
/// material stays published for consumers that cache it.
///
/// A zero interval cascades from its parent: `ca_overlap_interval` and
/// `cert_rotate_interval` default to `ca_rotate_interval`,
/// `cert_overlap_interval` defaults to `cert_rotate_interval`, and
/// `ca_rotate_interval` itself defaults to one year.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// Total lifetime of a CA certificate.
    pub ca_rotate_interval: Duration,

    /// How long a replaced CA certificate stays in the published CA bundles.
    pub ca_overlap_interval: Duration,

    /// Total lifetime of an issued server certificate. Every service
    /// referenced by the managed webhook configurations shares this value.
    pub cert_rotate_interval: Duration,

    /// How long a replaced server certificate stays in the issued list.
    pub cert_overlap_interval: Duration,
}

impl Options {
    /// Returns a copy with every zero interval cascaded from its parent.
    pub fn with_defaults(self) -> Options {
        let mut options = self;
        if options.ca_rotate_interval.is_zero() {
            options.ca_rotate_interval = ONE_YEAR;
        }
        if options.ca_overlap_interval.is_zero() {
            options.ca_overlap_interval = options.ca_rotate_interval;
        }
        if options.cert_rotate_interval.is_zero() {
            options.cert_rotate_interval = options.ca_rotate_interval;
        }
        if options.cert_overlap_interval.is_zero() {
            options.cert_overlap_interval = options.cert_rotate_interval;
        }
        options
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.ca_overlap_interval <= self.ca_rotate_interval,
            CaOverlapExceedsCaRotateSnafu
        );
        ensure!(
            self.cert_rotate_interval <= self.ca_rotate_interval,
            CertRotateExceedsCaRotateSnafu
        );
        ensure!(
            self.cert_overlap_interval <= self.cert_rotate_interval,
            CertOverlapExceedsCertRotateSnafu
        );
        Ok(())
    }

    /// Applies the default cascade and validates the result.
    pub fn normalized(self) -> Result<Options> {
        let options = self.with_defaults();
        options.validate()?;
        Ok(options)
    }
}
