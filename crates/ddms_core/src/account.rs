//! Account and user collaborator.

use parking_lot::RwLock;

/// Source of the logged-in users and the cloud account.
pub trait AccountDelegate: Send + Sync {
    /// Users currently in the foreground.
    fn foreground_users(&self) -> Vec<i32>;

    /// Hashed id of the current cloud account; empty when logged out.
    fn current_account_id(&self) -> String;

    /// Returns true if the user has unlocked and verified their account.
    fn is_verified(&self, _user: i32) -> bool {
        true
    }
}

/// Fixed account state, for tests and single-user deployments.
#[derive(Debug, Default)]
pub struct StaticAccount {
    users: RwLock<Vec<i32>>,
    account_id: RwLock<String>,
}

impl StaticAccount {
    /// Creates an account source with the given users.
    pub fn new(users: Vec<i32>, account_id: impl Into<String>) -> Self {
        Self {
            users: RwLock::new(users),
            account_id: RwLock::new(account_id.into()),
        }
    }

    /// Replaces the foreground users.
    pub fn set_users(&self, users: Vec<i32>) {
        *self.users.write() = users;
    }

    /// Replaces the account id.
    pub fn set_account_id(&self, account_id: impl Into<String>) {
        *self.account_id.write() = account_id.into();
    }
}

impl AccountDelegate for StaticAccount {
    fn foreground_users(&self) -> Vec<i32> {
        self.users.read().clone()
    }

    fn current_account_id(&self) -> String {
        self.account_id.read().clone()
    }
}
