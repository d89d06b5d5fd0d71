//! Reserved `ip rule` priority bands and routing table ids.
//!
//! Every number here is load-bearing: lower priority wins, so the ordering
//! of the constants below *is* the routing precedence.

/// Protection rules (source = tunnel underlay endpoint) pin underlay traffic
/// to the main table so the tunnel itself never routes over the overlay.
pub const PREF_PROTECTION: u32 = 10;
pub const TABLE_PROTECTION: u32 = 254; // main

/// Transient routing exception used while a health probe is in flight, so the
/// probe's own packets aren't captured by an overlay route pointed at the
/// tunnel being probed. The exception's lookup table is not a dedicated
/// table 5: it reuses table 80 for tunnel exits or `main` for
/// physical/third-party exits (see the health checker), so only the pref
/// is reserved here.
pub const PREF_PROBE_EXCEPTION: u32 = 5;

/// Overlay virtual IP routes, one per tunnel, always present regardless of
/// policy group configuration.
pub const PREF_OVERLAY_VIP: u32 = 80;
pub const TABLE_OVERLAY_VIP: u32 = 80;

/// Per-tunnel underlay route (keeps underlay reachability stable even if the
/// default route changes).
pub const PREF_UNDERLAY: u32 = 50;
pub const TABLE_UNDERLAY: u32 = 50;

/// User-defined policy groups occupy this range, one pref/table pair per
/// group, assigned in declaration order.
pub const PREF_POLICY_GROUP_MIN: u32 = 100;
pub const PREF_POLICY_GROUP_MAX: u32 = 899;

/// Catch-all default, lowest precedence.
pub const PREF_DEFAULT: u32 = 900;
pub const TABLE_DEFAULT: u32 = 900;

/// Returns `true` if `pref` falls inside the user policy group band.
pub fn is_policy_group_pref(pref: u32) -> bool {
    (PREF_POLICY_GROUP_MIN..=PREF_POLICY_GROUP_MAX).contains(&pref)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_ordering_holds() {
        assert!(PREF_PROBE_EXCEPTION < PREF_PROTECTION);
        assert!(PREF_PROTECTION < PREF_OVERLAY_VIP);
        assert!(PREF_UNDERLAY < PREF_OVERLAY_VIP);
        assert!(PREF_OVERLAY_VIP < PREF_POLICY_GROUP_MIN);
        assert!(PREF_POLICY_GROUP_MAX < PREF_DEFAULT);
    }

    #[test]
    fn policy_group_band_membership() {
        assert!(!is_policy_group_pref(PREF_PROTECTION));
        assert!(is_policy_group_pref(100));
        assert!(is_policy_group_pref(899));
        assert!(!is_policy_group_pref(900));
    }
}
