use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use super::{failed, LedgerSnapshot, LedgerStore, SettledSplit};
use crate::error::{LedgerError, LedgerResult};
use crate::schemas::{
    Expense, ExpenseId, Group, GroupId, Settlement, Split, SplitId, SplitState, User, UserId,
};

/// Everything owned by one group. Each group has its own lock so that
/// writes to unrelated groups never contend.
#[derive(Debug)]
struct GroupLedger {
    group: Group,
    expenses: Vec<Expense>,
    splits: Vec<Split>,
    split_positions: HashMap<SplitId, usize>,
    settlements: HashMap<SplitId, Settlement>,
}

impl GroupLedger {
    fn new(group: Group) -> Self {
        Self {
            group,
            expenses: Vec::new(),
            splits: Vec::new(),
            split_positions: HashMap::new(),
            settlements: HashMap::new(),
        }
    }
}

type SharedLedger = Arc<RwLock<GroupLedger>>;

/// In-memory ledger store.
///
/// Intended for tests/dev and for running without a database.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    users: RwLock<HashMap<UserId, User>>,
    groups: RwLock<HashMap<GroupId, SharedLedger>>,
    expense_index: RwLock<HashMap<ExpenseId, GroupId>>,
    split_index: RwLock<HashMap<SplitId, GroupId>>,
}

fn poisoned<T>(_: PoisonError<T>) -> LedgerError {
    LedgerError::storage("lock poisoned")
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ledger(&self, id: &GroupId) -> LedgerResult<SharedLedger> {
        self.groups
            .read()
            .map_err(poisoned)?
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("group", id))
    }

    fn ledger_of_split(&self, id: &SplitId) -> LedgerResult<SharedLedger> {
        let group = self
            .split_index
            .read()
            .map_err(poisoned)?
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("split", id))?;
        self.ledger(&group)
    }

    fn all_ledgers(&self) -> LedgerResult<Vec<SharedLedger>> {
        Ok(self.groups.read().map_err(poisoned)?.values().cloned().collect())
    }

    fn collect_groups(&self, keep: impl Fn(&Group) -> bool) -> LedgerResult<Vec<Group>> {
        let mut groups = Vec::new();
        for ledger in self.all_ledgers()? {
            let ledger = ledger.read().map_err(poisoned)?;
            if keep(&ledger.group) {
                groups.push(ledger.group.clone());
            }
        }
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(groups)
    }

    fn collect_users_outside(&self, group: &GroupId) -> LedgerResult<Vec<User>> {
        let members = {
            let ledger = self.ledger(group)?;
            let ledger = ledger.read().map_err(poisoned)?;
            ledger.group.members.clone()
        };
        let mut users: Vec<User> = self
            .users
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|u| !members.contains(&u.id))
            .cloned()
            .collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(users)
    }

    fn collect_user_splits(&self, user: &UserId) -> LedgerResult<Vec<Split>> {
        let mut splits = Vec::new();
        for ledger in self.all_ledgers()? {
            let ledger = ledger.read().map_err(poisoned)?;
            splits.extend(ledger.splits.iter().filter(|s| s.involves(user)).cloned());
        }
        splits.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.expense_id.cmp(&b.expense_id))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(splits)
    }
}

fn replay<'a, T: Send + 'a>(items: LedgerResult<Vec<T>>) -> BoxStream<'a, LedgerResult<T>> {
    match items {
        Ok(items) => stream::iter(items.into_iter().map(Ok)).boxed(),
        Err(err) => failed(err),
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn upsert_user(&self, user: User) -> LedgerResult<()> {
        self.users
            .write()
            .map_err(poisoned)?
            .insert(user.id.clone(), user);
        Ok(())
    }

    async fn user(&self, id: &UserId) -> LedgerResult<User> {
        self.users
            .read()
            .map_err(poisoned)?
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("user", id))
    }

    async fn create_group(&self, group: Group) -> LedgerResult<()> {
        let mut groups = self.groups.write().map_err(poisoned)?;
        if groups.contains_key(&group.id) {
            return Err(LedgerError::already_exists("group", &group.id));
        }
        groups.insert(group.id.clone(), Arc::new(RwLock::new(GroupLedger::new(group))));
        Ok(())
    }

    async fn group(&self, id: &GroupId) -> LedgerResult<Group> {
        let ledger = self.ledger(id)?;
        let ledger = ledger.read().map_err(poisoned)?;
        Ok(ledger.group.clone())
    }

    async fn add_members(&self, id: &GroupId, users: &[UserId]) -> LedgerResult<Group> {
        {
            let known = self.users.read().map_err(poisoned)?;
            if let Some(missing) = users.iter().find(|u| !known.contains_key(*u)) {
                return Err(LedgerError::not_found("user", missing));
            }
        }
        let ledger = self.ledger(id)?;
        let mut ledger = ledger.write().map_err(poisoned)?;
        ledger.group.members.extend(users.iter().cloned());
        Ok(ledger.group.clone())
    }

    async fn remove_member(
        &self,
        id: &GroupId,
        user: &UserId,
        expected_revision: u64,
    ) -> LedgerResult<Group> {
        let ledger = self.ledger(id)?;
        let mut ledger = ledger.write().map_err(poisoned)?;
        if !ledger.group.is_member(user) {
            return Err(LedgerError::UnknownMember(user.to_string()));
        }
        if ledger.group.revision != expected_revision {
            return Err(LedgerError::Conflict(format!(
                "group {id} changed (expected revision {expected_revision}, found {})",
                ledger.group.revision
            )));
        }
        ledger.group.members.remove(user);
        ledger.group.revision += 1;
        Ok(ledger.group.clone())
    }

    fn user_groups(&self, user: &UserId) -> BoxStream<'_, LedgerResult<Group>> {
        replay(self.collect_groups(|g| g.is_member(user)))
    }

    fn joinable_groups(&self, user: &UserId) -> BoxStream<'_, LedgerResult<Group>> {
        replay(self.collect_groups(|g| !g.direct && !g.is_member(user)))
    }

    fn users_outside_group(&self, group: &GroupId) -> BoxStream<'_, LedgerResult<User>> {
        replay(self.collect_users_outside(group))
    }

    async fn insert_expense(&self, expense: Expense, splits: Vec<Split>) -> LedgerResult<u64> {
        let ledger = self.ledger(&expense.group_id)?;
        let mut ledger = ledger.write().map_err(poisoned)?;

        let group = &ledger.group;
        if let Some(stranger) = std::iter::once(&expense.payer)
            .chain(splits.iter().map(|s| &s.debtor))
            .find(|u| !group.is_member(u))
        {
            return Err(LedgerError::UnknownMember(stranger.to_string()));
        }

        let mut expense_index = self.expense_index.write().map_err(poisoned)?;
        if expense_index.contains_key(&expense.id) {
            return Err(LedgerError::already_exists("expense", &expense.id));
        }
        let mut split_index = self.split_index.write().map_err(poisoned)?;

        expense_index.insert(expense.id.clone(), expense.group_id.clone());
        for split in splits {
            split_index.insert(split.id.clone(), split.group_id.clone());
            let position = ledger.splits.len();
            ledger.split_positions.insert(split.id.clone(), position);
            ledger.splits.push(split);
        }
        ledger.expenses.push(expense);
        ledger.group.revision += 1;
        Ok(ledger.group.revision)
    }

    async fn expense(&self, id: &ExpenseId) -> LedgerResult<Expense> {
        let group = self
            .expense_index
            .read()
            .map_err(poisoned)?
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("expense", id))?;
        let ledger = self.ledger(&group)?;
        let ledger = ledger.read().map_err(poisoned)?;
        ledger
            .expenses
            .iter()
            .find(|e| &e.id == id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("expense", id))
    }

    fn group_expenses(&self, group: &GroupId) -> BoxStream<'_, LedgerResult<Expense>> {
        let expenses = self.ledger(group).and_then(|ledger| {
            let ledger = ledger.read().map_err(poisoned)?;
            Ok(ledger.expenses.clone())
        });
        replay(expenses)
    }

    async fn expense_splits(&self, id: &ExpenseId) -> LedgerResult<Vec<Split>> {
        let expense = self.expense(id).await?;
        let ledger = self.ledger(&expense.group_id)?;
        let ledger = ledger.read().map_err(poisoned)?;
        Ok(ledger
            .splits
            .iter()
            .filter(|s| &s.expense_id == id)
            .cloned()
            .collect())
    }

    async fn split(&self, id: &SplitId) -> LedgerResult<Split> {
        let ledger = self.ledger_of_split(id)?;
        let ledger = ledger.read().map_err(poisoned)?;
        ledger
            .split_positions
            .get(id)
            .map(|&pos| ledger.splits[pos].clone())
            .ok_or_else(|| LedgerError::not_found("split", id))
    }

    fn user_splits(&self, user: &UserId) -> BoxStream<'_, LedgerResult<Split>> {
        replay(self.collect_user_splits(user))
    }

    async fn mark_split_settled(
        &self,
        id: &SplitId,
        settled_by: &UserId,
    ) -> LedgerResult<SettledSplit> {
        let ledger = self.ledger_of_split(id)?;
        let mut ledger = ledger.write().map_err(poisoned)?;
        let position = *ledger
            .split_positions
            .get(id)
            .ok_or_else(|| LedgerError::not_found("split", id))?;

        // Compare-and-swap: only a pending split may transition.
        if ledger.splits[position].state != SplitState::Pending {
            return Err(LedgerError::AlreadySettled);
        }
        ledger.splits[position].state = SplitState::Settled;

        let settlement = Settlement::new(id.clone(), settled_by.clone());
        ledger.settlements.insert(id.clone(), settlement.clone());
        ledger.group.revision += 1;

        Ok(SettledSplit {
            split: ledger.splits[position].clone(),
            settlement,
            revision: ledger.group.revision,
        })
    }

    async fn settlement_for(&self, split: &SplitId) -> LedgerResult<Option<Settlement>> {
        let ledger = self.ledger_of_split(split)?;
        let ledger = ledger.read().map_err(poisoned)?;
        Ok(ledger.settlements.get(split).cloned())
    }

    async fn pending_snapshot(&self, group: &GroupId) -> LedgerResult<LedgerSnapshot> {
        let ledger = self.ledger(group)?;
        let ledger = ledger.read().map_err(poisoned)?;
        Ok(LedgerSnapshot {
            revision: ledger.group.revision,
            pending: ledger
                .splits
                .iter()
                .filter(|s| s.is_pending() && !s.is_self_share())
                .cloned()
                .collect(),
        })
    }
}
