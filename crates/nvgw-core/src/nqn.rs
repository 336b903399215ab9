//! NVMe Qualified Name validation.
//!
//! Implements the NQN grammar checks applied at the API edge: the
//! `nqn.YYYY-MM.<reverse-domain>:<user>` form and the
//! `nqn.2014-08.org.nvmexpress:uuid:<uuid>` form. Validation happens before
//! any lock is taken or any state is read, so a malformed name can never
//! reach the engine or the state map.

use crate::error::{GwError, GwResult};

/// The well-known discovery subsystem NQN.
pub const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

const NQN_MIN_LENGTH: usize = 11;
const NQN_MAX_LENGTH: usize = 223;
const NQN_PREFIX: &str = "nqn.";
const NQN_UUID_PREFIX: &str = "nqn.2014-08.org.nvmexpress:uuid:";
const UUID_STRING_LENGTH: usize = 36;
const DOMAIN_LABEL_MAX_LEN: usize = 63;

/// Returns true when `nqn` names the discovery subsystem.
#[must_use]
pub fn is_discovery_nqn(nqn: &str) -> bool {
    nqn == DISCOVERY_NQN
}

/// Encloses an IPv6 address in brackets so a `:port` suffix can be
/// appended unambiguously. IPv4 addresses and already-bracketed strings
/// pass through unchanged.
#[must_use]
pub fn escape_address_if_ipv6(addr: &str) -> String {
    if addr.contains(':') && !addr.trim_start().starts_with('[') {
        format!("[{addr}]")
    } else {
        addr.to_string()
    }
}

/// Validates the textual shape of a UUID: five hyphen-separated hex groups
/// of 8-4-4-4-12 characters.
#[must_use]
pub fn is_valid_uuid(value: &str) -> bool {
    if value.len() != UUID_STRING_LENGTH {
        return false;
    }
    let parts: Vec<&str> = value.split('-').collect();
    if parts.len() != 5 {
        return false;
    }
    let expected = [8usize, 4, 4, 4, 12];
    for (part, len) in parts.iter().zip(expected) {
        if part.len() != len || !part.chars().all(|c| c.is_ascii_hexdigit()) {
            return false;
        }
    }
    true
}

fn validate_rev_domain(rev_domain: &str) -> GwResult<()> {
    for label in rev_domain.split('.') {
        if label.is_empty() {
            return Err(GwError::invalid_argument(
                "empty domain label doesn't start with a letter",
            ));
        }
        if label.len() > DOMAIN_LABEL_MAX_LEN {
            return Err(GwError::invalid_argument(format!(
                "domain label {label} is too long"
            )));
        }
        if !label.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
            return Err(GwError::invalid_argument(format!(
                "domain label {label} doesn't start with a letter"
            )));
        }
        if label.ends_with('-') {
            return Err(GwError::invalid_argument(format!(
                "domain label {label} doesn't end with an alphanumeric character"
            )));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(GwError::invalid_argument(format!(
                "domain label {label} contains a character outside [a-z,A-Z,0-9,'-']"
            )));
        }
    }
    Ok(())
}

/// Validates an NQN against the grammar accepted by the gateway.
///
/// The discovery NQN is grammatically valid here; callers that must reject
/// it (subsystem creation) check [`is_discovery_nqn`] separately.
///
/// # Errors
///
/// Returns `InvalidArgument` describing the first violated rule.
pub fn validate_nqn(nqn: &str) -> GwResult<()> {
    if nqn.len() < NQN_MIN_LENGTH {
        return Err(GwError::invalid_argument(format!(
            "NQN \"{nqn}\" is too short, minimal length is {NQN_MIN_LENGTH}"
        )));
    }
    if nqn.len() > NQN_MAX_LENGTH {
        return Err(GwError::invalid_argument(format!(
            "NQN \"{nqn}\" is too long, maximal length is {NQN_MAX_LENGTH}"
        )));
    }
    if !nqn.is_ascii() {
        return Err(GwError::invalid_argument(format!(
            "invalid NQN \"{nqn}\", must be ASCII"
        )));
    }
    // State-map keys are '/'-separated; an NQN may not contain one.
    if nqn.contains('/') {
        return Err(GwError::invalid_argument(format!(
            "invalid NQN \"{nqn}\", must not contain '/'"
        )));
    }
    if is_discovery_nqn(nqn) {
        return Ok(());
    }

    if let Some(uuid_part) = nqn.strip_prefix(NQN_UUID_PREFIX) {
        if uuid_part.len() != UUID_STRING_LENGTH {
            return Err(GwError::invalid_argument(format!(
                "invalid NQN \"{nqn}\": UUID is not the correct length"
            )));
        }
        if !is_valid_uuid(uuid_part) {
            return Err(GwError::invalid_argument(format!(
                "invalid NQN \"{nqn}\": UUID is not formatted correctly"
            )));
        }
        return Ok(());
    }

    let Some(no_prefix) = nqn.strip_prefix(NQN_PREFIX) else {
        return Err(GwError::invalid_argument(format!(
            "invalid NQN \"{nqn}\", doesn't start with \"{NQN_PREFIX}\""
        )));
    };

    // Date code: "YYYY-MM." then reverse domain.
    if no_prefix.len() < 8 || !no_prefix.is_char_boundary(8) {
        return Err(GwError::invalid_argument(format!(
            "invalid NQN \"{nqn}\": invalid date code"
        )));
    }
    let (date_part, rest) = no_prefix.split_at(8);
    let Some(date_part) = date_part.strip_suffix('.') else {
        return Err(GwError::invalid_argument(format!(
            "invalid NQN \"{nqn}\": invalid date code"
        )));
    };
    let mut date_fields = date_part.split('-');
    let year = date_fields.next().unwrap_or_default();
    let month = date_fields.next().unwrap_or_default();
    if date_fields.next().is_some()
        || year.len() != 4
        || month.len() != 2
        || year.parse::<u32>().is_err()
        || month.parse::<u32>().is_err()
    {
        return Err(GwError::invalid_argument(format!(
            "invalid NQN \"{nqn}\": invalid date code"
        )));
    }

    let Some((rev_domain, user_part)) = rest.split_once(':') else {
        return Err(GwError::invalid_argument(format!(
            "invalid NQN \"{nqn}\": must contain a user specified name starting with a \":\""
        )));
    };
    if user_part.is_empty() {
        return Err(GwError::invalid_argument(format!(
            "invalid NQN \"{nqn}\": must contain a user specified name starting with a \":\""
        )));
    }

    validate_rev_domain(rev_domain).map_err(|e| {
        GwError::invalid_argument(format!(
            "invalid NQN \"{nqn}\": reverse domain is not formatted correctly: {}",
            e.message
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_standard_nqn() {
        validate_nqn("nqn.2016-06.io.spdk:cnode1").unwrap();
        validate_nqn("nqn.2014-08.org.nvmexpress:uuid:6a0c1f30-2f22-4a47-a811-4f5b6a1dbb1a")
            .unwrap();
    }

    #[test]
    fn accepts_discovery_nqn() {
        validate_nqn(DISCOVERY_NQN).unwrap();
        assert!(is_discovery_nqn(DISCOVERY_NQN));
    }

    #[test]
    fn rejects_missing_prefix() {
        let err = validate_nqn("subsys.2016-06.io.spdk:cnode1").unwrap_err();
        assert!(err.message.contains("doesn't start with"));
    }

    #[test]
    fn rejects_bad_date_code() {
        assert!(validate_nqn("nqn.20x6-06.io.spdk:cnode1").is_err());
        assert!(validate_nqn("nqn.2016-6.io.spdk:cnode1").is_err());
        assert!(validate_nqn("nqn.201606.io.spdk:cnode1").is_err());
    }

    #[test]
    fn rejects_missing_user_part() {
        assert!(validate_nqn("nqn.2016-06.io.spdk").is_err());
        assert!(validate_nqn("nqn.2016-06.io.spdk:").is_err());
    }

    #[test]
    fn rejects_bad_rev_domain() {
        assert!(validate_nqn("nqn.2016-06.io..spdk:cnode1").is_err());
        assert!(validate_nqn("nqn.2016-06.io.9spdk:cnode1").is_err());
        assert!(validate_nqn("nqn.2016-06.io.spdk-:cnode1").is_err());
    }

    #[test]
    fn rejects_length_limits() {
        assert!(validate_nqn("nqn.x:y").is_err());
        let long = format!("nqn.2016-06.io.spdk:{}", "a".repeat(300));
        assert!(validate_nqn(&long).is_err());
    }

    #[test]
    fn rejects_malformed_uuid_nqn() {
        assert!(validate_nqn("nqn.2014-08.org.nvmexpress:uuid:not-a-uuid").is_err());
        assert!(validate_nqn(
            "nqn.2014-08.org.nvmexpress:uuid:6a0c1f30-2f22-4a47-a811-4f5b6a1dbb1g"
        )
        .is_err());
    }

    #[test]
    fn uuid_shape_checks() {
        assert!(is_valid_uuid("6a0c1f30-2f22-4a47-a811-4f5b6a1dbb1a"));
        assert!(!is_valid_uuid("6a0c1f30-2f22-4a47-a811"));
        assert!(!is_valid_uuid("6a0c1f302f224a47a8114f5b6a1dbb1aaaaa"));
    }

    #[test]
    fn ipv6_escaping() {
        assert_eq!(escape_address_if_ipv6("192.168.13.3"), "192.168.13.3");
        assert_eq!(escape_address_if_ipv6("fd00::17"), "[fd00::17]");
        assert_eq!(escape_address_if_ipv6("[fd00::17]"), "[fd00::17]");
    }
}
