use serde::{Deserialize, Serialize};

/// All [`Role`]s, from least to most privileged.
pub const ALL_ROLES: &[Role] = &[
    Role::None,
    Role::Viewer,
    Role::User,
    Role::Manager,
    Role::Owner,
];

/// The access role asserted by a local credential.
///
/// Roles form a total order: `None < Viewer < User < Manager < Owner`.
/// A command is admitted only when the caller's role is greater than or
/// equal to the command's minimal role.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    /// No access at all.
    None,
    /// Read-only access to component state.
    Viewer,
    /// May execute ordinary commands.
    User,
    /// May execute commands that reconfigure the device.
    Manager,
    /// Full control, including device ownership transfer.
    Owner,
}

impl core::fmt::Debug for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        self.name().fmt(f)
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        self.name().fmt(f)
    }
}

impl Role {
    /// Returns the [`Role`] name as spelled on the wire.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Viewer => "viewer",
            Self::User => "user",
            Self::Manager => "manager",
            Self::Owner => "owner",
        }
    }

    /// Returns the single-byte encoding used inside access tokens.
    #[must_use]
    pub const fn wire_byte(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Viewer => 1,
            Self::User => 2,
            Self::Manager => 3,
            Self::Owner => 4,
        }
    }

    /// Returns the [`Role`] associated with the given token byte.
    ///
    /// The return value is [`None`] when the byte does not name a role.
    #[must_use]
    pub const fn from_wire_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::None),
            1 => Some(Self::Viewer),
            2 => Some(Self::User),
            3 => Some(Self::Manager),
            4 => Some(Self::Owner),
            _ => None,
        }
    }
}

/// The identity asserted by a local credential: a role plus a user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserInfo {
    /// Granted access role.
    pub role: Role,
    /// Local user identifier.
    pub user_id: u64,
}

impl UserInfo {
    /// Creates a [`UserInfo`] from a role and a user id.
    #[must_use]
    pub const fn new(role: Role, user_id: u64) -> Self {
        Self { role, user_id }
    }
}

#[cfg(test)]
mod tests {
    use crate::{deserialize, serialize};

    use super::{Role, UserInfo, ALL_ROLES};

    #[test]
    fn role_order() {
        assert!(Role::None < Role::Viewer);
        assert!(Role::Viewer < Role::User);
        assert!(Role::User < Role::Manager);
        assert!(Role::Manager < Role::Owner);
    }

    #[test]
    fn role_bytes_round_trip() {
        assert_eq!(Role::from_wire_byte(200), None);
        for role in ALL_ROLES {
            assert_eq!(Role::from_wire_byte(role.wire_byte()), Some(*role));
        }
    }

    #[test]
    fn role_wire_names() {
        assert_eq!(serialize(Role::User), serde_json::json!("user"));
        assert_eq!(deserialize::<Role>(serde_json::json!("owner")), Role::Owner);
        for role in ALL_ROLES {
            assert_eq!(deserialize::<Role>(serialize(role)), *role);
        }
    }

    #[test]
    fn user_info() {
        let user = UserInfo::new(Role::Manager, 42);
        assert_eq!(deserialize::<UserInfo>(serialize(user)), user);
    }
}
