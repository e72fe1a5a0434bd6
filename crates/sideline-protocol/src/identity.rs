//! Identities and roles.
//!
//! An identity is supplied by the authentication collaborator and is
//! immutable for the life of a connection. The `(id, role)` pair is also
//! the addressing key of the alert channel.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role of a team member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Athlete,
    Coach,
    Teammate,
    Referee,
}

impl Role {
    /// All roles, in wire order.
    pub const ALL: [Role; 4] = [Role::Athlete, Role::Coach, Role::Teammate, Role::Referee];

    /// Wire name of the role.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Athlete => "athlete",
            Role::Coach => "coach",
            Role::Teammate => "teammate",
            Role::Referee => "referee",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "athlete" => Ok(Role::Athlete),
            "coach" => Ok(Role::Coach),
            "teammate" => Ok(Role::Teammate),
            "referee" => Ok(Role::Referee),
            _ => Err("Invalid role"),
        }
    }
}

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// User identifier.
    pub id: String,
    /// Role of the user.
    pub role: Role,
}

impl Identity {
    /// Create a new identity.
    #[must_use]
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }

    /// Key used by the alert service to group connections (`id:role`).
    #[must_use]
    pub fn channel_key(&self) -> String {
        format!("{}:{}", self.id, self.role)
    }

    /// URL path suffix addressing this identity's channel (`id/role`).
    #[must_use]
    pub fn path_segment(&self) -> String {
        format!("{}/{}", self.id, self.role)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.role)
    }
}
