//! The ACL gate: a connected, authenticated identity may invoke a command
//! only if the identity appears in that command's allowlist.
//!
//! The allowlist is the `[acl]` INI section, one comma-separated list of
//! usernames per command name; a command with no key in `[acl]` denies
//! everyone.

use std::collections::HashMap;

use crate::error::ArcError;

#[must_use]
pub fn is_allowed(acl: &HashMap<String, Vec<String>>, command: &str, identity: &str) -> bool {
    acl.get(command)
        .is_some_and(|allowed| allowed.iter().any(|u| u == identity))
}

pub fn check(
    acl: &HashMap<String, Vec<String>>,
    command: &str,
    identity: &str,
) -> Result<(), ArcError> {
    if is_allowed(acl, command, identity) {
        Ok(())
    } else {
        Err(ArcError::Authorization {
            user: identity.to_string(),
            command: command.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acl() -> HashMap<String, Vec<String>> {
        let mut m = HashMap::new();
        m.insert("restart".to_string(), vec!["alice".to_string(), "bob".to_string()]);
        m
    }

    #[test]
    fn allows_a_listed_user() {
        assert!(check(&acl(), "restart", "alice").is_ok());
    }

    #[test]
    fn denies_an_unlisted_user() {
        assert!(check(&acl(), "restart", "mallory").is_err());
    }

    #[test]
    fn denies_a_command_with_no_acl_entry_at_all() {
        assert!(check(&acl(), "reboot", "alice").is_err());
    }
}
