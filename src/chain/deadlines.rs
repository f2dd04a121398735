//! Rotation and cleanup deadline arithmetic.
//!
//! Rotation deadlines answer "when must this material be replaced":
//! `NotAfter - overlap`, taken over the newest entry of each list. A missing
//! newest entry means the material is gone and rotation is due immediately,
//! expressed as `None`. Cleanup deadlines answer "when does a superseded
//! entry expire": `NotAfter` over the non-final entries of each list; with
//! no superseded entries there is nothing to clean and the set is empty,
//! also expressed as `None`.

use time::OffsetDateTime;

use super::Engine;
use crate::crypto::clock;

impl Engine<'_> {
    pub(super) fn ca_rotation_due(&self) -> bool {
        if self.data.ca.key_pair.is_none() {
            return true;
        }
        match self.ca_rotation_deadline() {
            Some(deadline) => clock::now() >= deadline,
            None => true,
        }
    }

    pub(super) fn cert_rotation_due(&self) -> bool {
        if self.data.issues.values().any(|issue| issue.key.is_none()) {
            return true;
        }
        match self.cert_rotation_deadline() {
            Some(deadline) => clock::now() >= deadline,
            None => true,
        }
    }

    pub(super) fn ca_cleanup_due(&self) -> bool {
        self.ca_cleanup_deadline()
            .is_some_and(|deadline| clock::now() >= deadline)
    }

    pub(super) fn cert_cleanup_due(&self) -> bool {
        self.cert_cleanup_deadline()
            .is_some_and(|deadline| clock::now() >= deadline)
    }

    /// Earliest rotation deadline over the newest entry of every named CA
    /// bundle. `None` when a bundle is empty or there are no bundles at all,
    /// both of which call for an immediate rotation.
    pub(super) fn ca_rotation_deadline(&self) -> Option<OffsetDateTime> {
        let overlap = self.options.ca_overlap_interval;
        let mut deadline: Option<OffsetDateTime> = None;
        for issue in self.data.issues.values() {
            for certs in issue.ca_certs.values() {
                let newest = certs.last()?;
                let candidate = newest.not_after - overlap;
                deadline = Some(deadline.map_or(candidate, |current| current.min(candidate)));
            }
        }
        deadline
    }

    /// Earliest rotation deadline over the newest certificate of every
    /// issue. `None` when an issue has no certificates or there are no
    /// issues, both of which call for an immediate rotation.
    pub(super) fn cert_rotation_deadline(&self) -> Option<OffsetDateTime> {
        let overlap = self.options.cert_overlap_interval;
        let mut deadline: Option<OffsetDateTime> = None;
        for issue in self.data.issues.values() {
            let newest = issue.certs.last()?;
            let candidate = newest.not_after - overlap;
            deadline = Some(deadline.map_or(candidate, |current| current.min(candidate)));
        }
        deadline
    }

    /// Earliest expiry over the superseded (non-final) entries of every
    /// named CA bundle.
    pub(super) fn ca_cleanup_deadline(&self) -> Option<OffsetDateTime> {
        self.data
            .issues
            .values()
            .flat_map(|issue| issue.ca_certs.values())
            .flat_map(|certs| certs.iter().rev().skip(1))
            .map(|cert| cert.not_after)
            .min()
    }

    /// Earliest expiry over the superseded (non-final) certificates of every
    /// issue.
    pub(super) fn cert_cleanup_deadline(&self) -> Option<OffsetDateTime> {
        self.data
            .issues
            .values()
            .flat_map(|issue| issue.certs.iter().rev().skip(1))
            .map(|cert| cert.not_after)
            .min()
    }

    /// The chain's next event: the minimum over all four deadline sets, or
    /// now when every set is empty.
    pub(super) fn next_update(&self) -> OffsetDateTime {
        let rotate_ca = self.ca_rotation_deadline();
        let rotate_certs = self.cert_rotation_deadline();
        let clean_up_ca = self.ca_cleanup_deadline();
        let clean_up_certs = self.cert_cleanup_deadline();
        tracing::debug!(
            rotate_ca = ?rotate_ca,
            rotate_certs = ?rotate_certs,
            clean_up_ca = ?clean_up_ca,
            clean_up_certs = ?clean_up_certs,
            "calculating earliest chain deadline"
        );
        [rotate_ca, rotate_certs, clean_up_ca, clean_up_certs]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or_else(clock::now)
    }
}
