//! Durable record of groups, expenses, splits and settlements.
//!
//! The store is the single source of truth. Balances are always derivable
//! from [`LedgerStore::pending_snapshot`]; anything cached elsewhere is keyed
//! by the group `revision` the store hands out with every mutation.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::{LedgerError, LedgerResult};
use crate::schemas::{
    Expense, ExpenseId, Group, GroupId, Settlement, Split, SplitId, User, UserId,
};

mod memory;
mod mongo;

pub use memory::InMemoryLedgerStore;
pub use mongo::MongoLedgerStore;

/// Unsettled splits of a group, read atomically with the group revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub revision: u64,
    pub pending: Vec<Split>,
}

/// Result of a successful pending -> settled transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettledSplit {
    pub split: Split,
    pub settlement: Settlement,
    pub revision: u64,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert or rename a user.
    async fn upsert_user(&self, user: User) -> LedgerResult<()>;

    async fn user(&self, id: &UserId) -> LedgerResult<User>;

    /// Fails with `AlreadyExists` if the group id is taken.
    async fn create_group(&self, group: Group) -> LedgerResult<()>;

    async fn group(&self, id: &GroupId) -> LedgerResult<Group>;

    /// Adds users to the member set. Users must be registered.
    async fn add_members(&self, id: &GroupId, users: &[UserId]) -> LedgerResult<Group>;

    /// Removes `user` only if the group is still at `expected_revision`.
    async fn remove_member(
        &self,
        id: &GroupId,
        user: &UserId,
        expected_revision: u64,
    ) -> LedgerResult<Group>;

    /// Groups `user` belongs to, by id.
    fn user_groups(&self, user: &UserId) -> BoxStream<'_, LedgerResult<Group>>;

    /// Shared groups `user` is not in, by id. Two-party ledgers never appear.
    fn joinable_groups(&self, user: &UserId) -> BoxStream<'_, LedgerResult<Group>>;

    /// Registered users who are not members of the group, by id.
    fn users_outside_group(&self, group: &GroupId) -> BoxStream<'_, LedgerResult<User>>;

    /// Persists an expense and all of its splits, or nothing.
    ///
    /// Membership of the payer and every debtor is checked in the same
    /// atomic step. Returns the new group revision.
    async fn insert_expense(&self, expense: Expense, splits: Vec<Split>) -> LedgerResult<u64>;

    async fn expense(&self, id: &ExpenseId) -> LedgerResult<Expense>;

    /// Expenses of a group in creation order. Each call starts a fresh scan.
    fn group_expenses(&self, group: &GroupId) -> BoxStream<'_, LedgerResult<Expense>>;

    async fn expense_splits(&self, id: &ExpenseId) -> LedgerResult<Vec<Split>>;

    async fn split(&self, id: &SplitId) -> LedgerResult<Split>;

    /// Splits where the user is debtor or creditor, across all groups, oldest first.
    fn user_splits(&self, user: &UserId) -> BoxStream<'_, LedgerResult<Split>>;

    /// Conditional pending -> settled transition plus the Settlement row.
    ///
    /// Fails with `AlreadySettled` when the split is not pending and with
    /// `NotFound` when it does not exist. Only the settlement coordinator
    /// calls this.
    async fn mark_split_settled(
        &self,
        id: &SplitId,
        settled_by: &UserId,
    ) -> LedgerResult<SettledSplit>;

    async fn settlement_for(&self, split: &SplitId) -> LedgerResult<Option<Settlement>>;

    async fn pending_snapshot(&self, group: &GroupId) -> LedgerResult<LedgerSnapshot>;
}

/// A stream that yields a single error, for scans that fail before starting.
fn failed<'a, T: Send + 'a>(err: LedgerError) -> BoxStream<'a, LedgerResult<T>> {
    stream::once(async move { Err(err) }).boxed()
}
