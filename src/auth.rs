use serde::{Deserialize, Serialize};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Staff,
    Admin,
    Superadmin,
}

/// The full role table, including actions only outer surfaces check. The
/// engine itself gates on `ManageLocks` and `ManagePayments`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    ManageStaff,
    ManageZones,
    ManageLocks,
    ManageBookings,
    ManagePayments,
    SystemSettings,
}

impl Role {
    pub fn permissions(&self) -> &'static [Action] {
        use Action::*;
        match self {
            Role::Superadmin => &[
                ManageStaff,
                ManageZones,
                ManageLocks,
                ManageBookings,
                ManagePayments,
                SystemSettings,
            ],
            Role::Admin => &[ManageStaff, ManageZones, ManageLocks, ManageBookings, ManagePayments],
            Role::Staff => &[ManageLocks, ManageBookings, ManagePayments],
            Role::User => &[],
        }
    }
}

/// Caller as resolved by the upstream identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Ulid,
    pub role: Role,
}

impl Identity {
    pub fn user(user_id: Ulid) -> Self {
        Self { user_id, role: Role::User }
    }

    pub fn can(&self, action: Action) -> bool {
        self.role.permissions().contains(&action)
    }
}
