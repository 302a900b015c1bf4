//! Expense recording and the read side of the ledger.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use futures::future;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::Serialize;

use crate::balance::{BalanceEngine, GroupBalances};
use crate::error::{LedgerError, LedgerResult};
use crate::exchange::{suggest_exchanges, Exchange};
use crate::schemas::{
    Amount, Expense, ExpenseId, Group, GroupId, Split, SplitId, SplitState, User, UserId,
    MAX_AMOUNT,
};
use crate::store::LedgerStore;

/// Validated input for recording an expense.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewExpense {
    pub group_id: GroupId,
    pub payer: UserId,
    pub amount: Amount,
    pub participants: Vec<UserId>,
    pub description: String,
}

/// An expense with its splits. `settled` is true once every split is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExpenseRecord {
    #[serde(flatten)]
    pub expense: Expense,
    pub splits: Vec<Split>,
    pub settled: bool,
}

impl ExpenseRecord {
    fn new(expense: Expense, splits: Vec<Split>) -> Self {
        let settled = splits.iter().all(|s| !s.is_pending());
        Self {
            expense,
            splits,
            settled,
        }
    }
}

/// A split involving a user, with the expense it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UserTransaction {
    pub split: Split,
    pub debtor_name: String,
    pub creditor_name: String,
    pub description: String,
    pub payer: UserId,
    pub expense_amount: Amount,
}

/// Outstanding debt towards one counterparty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OweDetail {
    pub creditor: UserId,
    pub creditor_name: String,
    pub amount: Amount,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MemberPosition {
    pub user: UserId,
    pub net: Amount,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub id: GroupId,
    pub name: String,
    pub members: Vec<MemberPosition>,
}

/// Equal split of `amount` across `participants`.
///
/// The amount must be in `1..=MAX_AMOUNT`. Shares are `amount / n`; the
/// remaining `amount % n` minor units go one at a time to the participants
/// in ascending user-id order. The result is in that same order.
pub fn split_equally(amount: Amount, participants: &[UserId]) -> LedgerResult<Vec<(UserId, Amount)>> {
    if !(1..=MAX_AMOUNT).contains(&amount) {
        return Err(LedgerError::InvalidAmount);
    }
    if participants.is_empty() {
        return Err(LedgerError::EmptyParticipants);
    }
    let mut ordered: BTreeSet<&UserId> = BTreeSet::new();
    for participant in participants {
        if !ordered.insert(participant) {
            return Err(LedgerError::DuplicateParticipant(participant.to_string()));
        }
    }

    let count = ordered.len() as Amount;
    let base = amount / count;
    let remainder = (amount % count) as usize;
    Ok(ordered
        .into_iter()
        .enumerate()
        .map(|(idx, user)| {
            let share = if idx < remainder { base + 1 } else { base };
            (user.clone(), share)
        })
        .collect())
}

/// Ledger operations that do not touch settlement state.
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    balances: Arc<BalanceEngine>,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, balances: Arc<BalanceEngine>) -> Self {
        Self { store, balances }
    }

    #[tracing::instrument(skip(self, request), fields(group = %request.group_id, payer = %request.payer))]
    pub async fn record_expense(&self, request: NewExpense) -> LedgerResult<ExpenseRecord> {
        let shares = split_equally(request.amount, &request.participants)?;
        let now = Utc::now();
        let expense = Expense {
            id: ExpenseId::generate(),
            group_id: request.group_id,
            payer: request.payer,
            amount: request.amount,
            description: request.description,
            created_at: now,
        };
        let splits: Vec<Split> = shares
            .into_iter()
            .map(|(debtor, amount)| {
                let state = if debtor == expense.payer {
                    SplitState::Settled
                } else {
                    SplitState::Pending
                };
                Split {
                    id: SplitId::generate(),
                    expense_id: expense.id.clone(),
                    group_id: expense.group_id.clone(),
                    debtor,
                    creditor: expense.payer.clone(),
                    amount,
                    state,
                    created_at: now,
                }
            })
            .collect();

        let revision = self
            .store
            .insert_expense(expense.clone(), splits.clone())
            .await?;
        self.balances.record_mutation(
            &expense.group_id,
            revision,
            splits.iter().filter(|s| s.is_pending()).map(|s| (s, s.amount)),
        );

        tracing::info!(
            expense = %expense.id,
            amount = expense.amount,
            splits = splits.len(),
            revision,
            "expense recorded"
        );
        Ok(ExpenseRecord::new(expense, splits))
    }

    pub async fn expense(&self, id: &ExpenseId) -> LedgerResult<ExpenseRecord> {
        let expense = self.store.expense(id).await?;
        let splits = self.store.expense_splits(id).await?;
        Ok(ExpenseRecord::new(expense, splits))
    }

    /// Group expenses with their splits, oldest first.
    pub fn group_expenses<'a>(
        &'a self,
        group: &GroupId,
    ) -> BoxStream<'a, LedgerResult<ExpenseRecord>> {
        self.store
            .group_expenses(group)
            .and_then(move |expense| async move {
                let splits = self.store.expense_splits(&expense.id).await?;
                Ok(ExpenseRecord::new(expense, splits))
            })
            .boxed()
    }

    /// Every split involving `user` across all groups, oldest first.
    pub fn user_transactions<'a>(
        &'a self,
        user: &UserId,
    ) -> BoxStream<'a, LedgerResult<UserTransaction>> {
        self.store
            .user_splits(user)
            .and_then(move |split| async move {
                let expense = self.store.expense(&split.expense_id).await?;
                let debtor_name = self.store.user(&split.debtor).await?.name;
                let creditor_name = if split.is_self_share() {
                    debtor_name.clone()
                } else {
                    self.store.user(&split.creditor).await?.name
                };
                Ok(UserTransaction {
                    split,
                    debtor_name,
                    creditor_name,
                    description: expense.description,
                    payer: expense.payer,
                    expense_amount: expense.amount,
                })
            })
            .boxed()
    }

    #[tracing::instrument(skip(self))]
    pub async fn register_user(&self, id: UserId, name: String) -> LedgerResult<User> {
        // ':' separates the two ids of a two-party ledger.
        if id.as_str().is_empty() || id.as_str().contains(':') {
            return Err(LedgerError::InvalidRequest(
                "user id must be non-empty and must not contain ':'".into(),
            ));
        }
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(LedgerError::InvalidRequest("name must not be empty".into()));
        }
        let user = User { id, name };
        self.store.upsert_user(user.clone()).await?;
        tracing::info!(user = %user.id, "user registered");
        Ok(user)
    }

    #[tracing::instrument(skip(self))]
    pub async fn create_group(
        &self,
        id: GroupId,
        name: String,
        creator: UserId,
    ) -> LedgerResult<Group> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(LedgerError::InvalidRequest("group name must not be empty".into()));
        }
        if id.is_reserved() {
            return Err(LedgerError::InvalidRequest(format!("group id {id} is reserved")));
        }
        self.store.user(&creator).await?;
        let group = Group::new(id, name, creator);
        self.store.create_group(group.clone()).await?;
        tracing::info!(group = %group.id, "group created");
        Ok(group)
    }

    pub async fn add_members(&self, group: &GroupId, users: &[UserId]) -> LedgerResult<Group> {
        if users.is_empty() {
            return Err(LedgerError::InvalidRequest("no users to add".into()));
        }
        if self.store.group(group).await?.direct {
            return Err(LedgerError::InvalidRequest(format!(
                "{group} is a two-party ledger"
            )));
        }
        let updated = self.store.add_members(group, users).await?;
        tracing::info!(group = %group, added = users.len(), "members added");
        Ok(updated)
    }

    pub async fn join_group(&self, group: &GroupId, user: &UserId) -> LedgerResult<Group> {
        self.store.user(user).await?;
        if self.store.group(group).await?.is_member(user) {
            return Err(LedgerError::Conflict(format!(
                "{user} is already a member of {group}"
            )));
        }
        self.add_members(group, std::slice::from_ref(user)).await
    }

    pub async fn group(&self, id: &GroupId) -> LedgerResult<Group> {
        self.store.group(id).await
    }

    /// Shared groups of `user`; two-party ledgers are listed through
    /// [`Ledger::direct_expenses`] instead.
    pub fn user_groups<'a>(&'a self, user: &UserId) -> BoxStream<'a, LedgerResult<Group>> {
        self.store
            .user_groups(user)
            .try_filter(|g| future::ready(!g.direct))
            .boxed()
    }

    pub fn joinable_groups<'a>(&'a self, user: &UserId) -> BoxStream<'a, LedgerResult<Group>> {
        self.store.joinable_groups(user)
    }

    pub fn users_outside_group<'a>(&'a self, group: &GroupId) -> BoxStream<'a, LedgerResult<User>> {
        self.store.users_outside_group(group)
    }

    /// Records what `payer` spent on `friend` alone: the friend owes the
    /// whole amount. The two-party ledger is opened on first use.
    #[tracing::instrument(skip(self, description))]
    pub async fn record_direct_expense(
        &self,
        payer: UserId,
        friend: UserId,
        amount: Amount,
        description: String,
    ) -> LedgerResult<ExpenseRecord> {
        if payer == friend {
            return Err(LedgerError::InvalidRequest(
                "cannot add an expense with yourself".into(),
            ));
        }
        split_equally(amount, std::slice::from_ref(&friend))?;
        self.store.user(&payer).await?;
        self.store.user(&friend).await?;

        let ledger = Group::direct(payer.clone(), friend.clone());
        let group_id = ledger.id.clone();
        match self.store.create_group(ledger).await {
            Ok(()) => tracing::info!(group = %group_id, "two-party ledger opened"),
            Err(LedgerError::AlreadyExists { .. }) => {}
            Err(err) => return Err(err),
        }

        self.record_expense(NewExpense {
            group_id,
            payer,
            amount,
            participants: vec![friend],
            description,
        })
        .await
    }

    /// Expenses between two users outside any shared group, oldest first.
    pub async fn direct_expenses(&self, a: &UserId, b: &UserId) -> LedgerResult<Vec<ExpenseRecord>> {
        let id = GroupId::direct(a, b);
        match self.store.group(&id).await {
            Ok(_) => self.group_expenses(&id).try_collect().await,
            Err(LedgerError::NotFound { .. }) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Group with every member's net position (zero for settled-up members).
    pub async fn group_summary(&self, id: &GroupId) -> LedgerResult<GroupSummary> {
        let group = self.store.group(id).await?;
        let balances = self.balances.group_balances(id).await?.balances;
        let members = group
            .members
            .iter()
            .map(|user| MemberPosition {
                user: user.clone(),
                net: balances.net_position(user),
            })
            .collect();
        Ok(GroupSummary {
            id: group.id,
            name: group.name,
            members,
        })
    }

    pub async fn group_balances(&self, id: &GroupId) -> LedgerResult<GroupBalances> {
        Ok(self.balances.group_balances(id).await?.balances)
    }

    pub async fn owe_details(&self, group: &GroupId, user: &UserId) -> LedgerResult<Vec<OweDetail>> {
        let mut details = Vec::new();
        for owed in self.group_balances(group).await?.owe_details(user) {
            let creditor_name = self.store.user(&owed.creditor).await?.name;
            details.push(OweDetail {
                creditor: owed.creditor,
                creditor_name,
                amount: owed.amount,
            });
        }
        Ok(details)
    }

    pub async fn suggested_settlements(&self, group: &GroupId) -> LedgerResult<Vec<Exchange>> {
        Ok(suggest_exchanges(&self.group_balances(group).await?))
    }
}
