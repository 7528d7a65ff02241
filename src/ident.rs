//! Resolution of user and group names and membership.
//!
//! UIDs and GIDs are accepted either as decimal strings or as names. Name
//! resolution goes through the system user/group database and is only
//! available when the `names` feature is enabled; without it, callers must
//! supply numeric values and group membership lists are empty.

use crate::error::{ServiceError, ServiceResult};

/// Parse a UID string. The string should either be a username or a decimal
/// user ID. Returns the user ID or an error.
pub fn parse_uid(uid: &str) -> ServiceResult<libc::uid_t> {
    match parse_decimal(uid) {
        Some(n) => Ok(n),
        None => user_by_name(uid),
    }
}

/// Parse a GID string. The string should either be a group name or a decimal
/// group ID. Returns the group ID or an error.
pub fn parse_gid(gid: &str) -> ServiceResult<libc::gid_t> {
    match parse_decimal(gid) {
        Some(n) => Ok(n),
        None => group_by_name(gid),
    }
}

/// Given a UID, returns the primary GID recorded for it in the user database.
pub fn primary_gid_of(uid: libc::uid_t) -> ServiceResult<libc::gid_t> {
    primary_gid_of_impl(uid)
}

/// Given a group ID, returns the supplementary group IDs that group implies:
/// the IDs of the groups named as members of it by the group database.
/// Order follows the database and duplicates are not filtered.
pub fn extra_gids(gid: libc::gid_t) -> ServiceResult<Vec<libc::gid_t>> {
    extra_gids_impl(gid)
}

// IDs are capped at 31 bits so that a numeric string can never collide with
// the "do not change identity" sentinel. Anything larger falls through to
// name lookup, exactly like a non-numeric string.
fn parse_decimal(s: &str) -> Option<u32> {
    match s.parse::<u32>() {
        Ok(n) if n <= 0x7fff_ffff => Some(n),
        _ => None,
    }
}

#[cfg(feature = "names")]
fn user_by_name(name: &str) -> ServiceResult<libc::uid_t> {
    match users::get_user_by_name(name) {
        Some(user) => Ok(user.uid()),
        None => Err(ServiceError::IdentityNotFound(format!("user '{}'", name))),
    }
}

#[cfg(feature = "names")]
fn group_by_name(name: &str) -> ServiceResult<libc::gid_t> {
    match users::get_group_by_name(name) {
        Some(group) => Ok(group.gid()),
        None => Err(ServiceError::IdentityNotFound(format!("group '{}'", name))),
    }
}

#[cfg(feature = "names")]
fn primary_gid_of_impl(uid: libc::uid_t) -> ServiceResult<libc::gid_t> {
    match users::get_user_by_uid(uid) {
        Some(user) => Ok(user.primary_group_id()),
        None => Err(ServiceError::IdentityNotFound(format!("UID {}", uid))),
    }
}

#[cfg(feature = "names")]
fn extra_gids_impl(gid: libc::gid_t) -> ServiceResult<Vec<libc::gid_t>> {
    use users::os::unix::GroupExt;

    let group = users::get_group_by_gid(gid)
        .ok_or_else(|| ServiceError::IdentityNotFound(format!("GID {}", gid)))?;

    // Each member entry is resolved as a group name. Under the common
    // user-private-group convention every user has a same-named group, so
    // this yields the member users' own groups.
    let mut gids = Vec::new();
    for member in group.members() {
        let name = member.to_string_lossy();
        gids.push(group_by_name(&name)?);
    }
    Ok(gids)
}

#[cfg(not(feature = "names"))]
fn user_by_name(name: &str) -> ServiceResult<libc::uid_t> {
    let _ = name;
    Err(ServiceError::IdentityLookup(no_names_msg("UIDs")))
}

#[cfg(not(feature = "names"))]
fn group_by_name(name: &str) -> ServiceResult<libc::gid_t> {
    let _ = name;
    Err(ServiceError::IdentityLookup(no_names_msg("GIDs")))
}

// The primary GID genuinely cannot be determined without the database, so
// this fails rather than guessing. Callers must pass the GID explicitly.
#[cfg(not(feature = "names"))]
fn primary_gid_of_impl(uid: libc::uid_t) -> ServiceResult<libc::gid_t> {
    let _ = uid;
    Err(ServiceError::IdentityLookup(no_names_msg("GIDs")))
}

#[cfg(not(feature = "names"))]
fn extra_gids_impl(_gid: libc::gid_t) -> ServiceResult<Vec<libc::gid_t>> {
    Ok(Vec::new())
}

#[cfg(not(feature = "names"))]
fn no_names_msg(what: &str) -> String {
    format!(
        "this binary was built without the 'names' feature; {} must be specified numerically, not as names",
        what
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ids_parse_directly() {
        assert_eq!(parse_uid("0").unwrap(), 0);
        assert_eq!(parse_uid("1000").unwrap(), 1000);
        assert_eq!(parse_gid("65534").unwrap(), 65534);
        assert_eq!(parse_uid("2147483647").unwrap(), 2147483647);
    }

    #[test]
    fn numeric_round_trip() {
        for n in [0u32, 1, 99, 65534, 2147483647] {
            let parsed = parse_uid(&n.to_string()).unwrap();
            assert_eq!(parsed, n);
            assert_eq!(parse_uid(&parsed.to_string()).unwrap(), n);
        }
    }

    // 2^31 no longer fits in 31 bits, so it is treated as a name.
    #[test]
    fn out_of_range_ids_are_names() {
        assert!(parse_uid("2147483648").is_err());
        assert!(parse_gid("4294967295").is_err());
        assert!(parse_uid("-1").is_err());
    }

    #[cfg(feature = "names")]
    #[test]
    fn root_resolves_by_name() {
        assert_eq!(parse_uid("root").unwrap(), 0);
        let gid = parse_gid("root")
            .or_else(|_| parse_gid("wheel"))
            .expect("neither 'root' nor 'wheel' group exists");
        assert!(gid < 100);
    }

    #[cfg(feature = "names")]
    #[test]
    fn unknown_name_is_not_found() {
        match parse_uid("no-such-user-service-forge") {
            Err(ServiceError::IdentityNotFound(_)) => {}
            other => panic!("expected IdentityNotFound, got {:?}", other),
        }
    }

    #[cfg(feature = "names")]
    #[test]
    fn primary_gid_of_root_is_resolvable() {
        let gid = primary_gid_of(0).unwrap();
        // extra_gids for a real primary GID must not error out.
        let _ = extra_gids(gid).unwrap();
    }

    #[cfg(not(feature = "names"))]
    #[test]
    fn names_fail_closed_without_feature() {
        assert!(matches!(
            parse_uid("nobody"),
            Err(ServiceError::IdentityLookup(_))
        ));
        assert!(matches!(
            primary_gid_of(1000),
            Err(ServiceError::IdentityLookup(_))
        ));
        assert_eq!(extra_gids(1000).unwrap(), Vec::<libc::gid_t>::new());
    }
}
