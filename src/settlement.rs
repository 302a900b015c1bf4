//! Settlement coordinator: the only writer of settlement state.

use std::sync::Arc;

use serde::Serialize;

use crate::balance::{BalanceEngine, PairBalance};
use crate::error::{LedgerError, LedgerResult};
use crate::schemas::{Amount, Group, GroupId, Settlement, Split, SplitId, UserId};
use crate::store::LedgerStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettleStatus {
    Settled,
    /// The split had already been settled; nothing changed.
    AlreadySettled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SettlementResult {
    pub status: SettleStatus,
    /// Absent for a payer's own share, which never needed settling, and
    /// when a concurrent settlement of the split has not committed yet.
    pub settlement: Option<Settlement>,
    /// Remaining balance between the split's debtor and creditor.
    pub balance: PairBalance,
}

pub struct SettlementCoordinator {
    store: Arc<dyn LedgerStore>,
    balances: Arc<BalanceEngine>,
}

impl SettlementCoordinator {
    pub fn new(store: Arc<dyn LedgerStore>, balances: Arc<BalanceEngine>) -> Self {
        Self { store, balances }
    }

    /// Settles one split on behalf of its debtor or creditor.
    ///
    /// Repeated or racing calls on the same split yield `AlreadySettled`
    /// instead of an error, so callers may retry after a lost response.
    #[tracing::instrument(skip(self))]
    pub async fn settle(
        &self,
        split_id: &SplitId,
        requested_by: &UserId,
    ) -> LedgerResult<SettlementResult> {
        let split = self.store.split(split_id).await?;
        if !split.involves(requested_by) {
            tracing::warn!(split = %split_id, user = %requested_by, "settle attempted by third party");
            return Err(LedgerError::Forbidden);
        }

        let (status, settlement) = match self.store.mark_split_settled(split_id, requested_by).await {
            Ok(settled) => {
                self.balances.record_mutation(
                    &settled.split.group_id,
                    settled.revision,
                    [(&settled.split, -settled.split.amount)],
                );
                tracing::info!(
                    split = %split_id,
                    settlement = %settled.settlement.id,
                    amount = settled.split.amount,
                    revision = settled.revision,
                    "split settled"
                );
                (SettleStatus::Settled, Some(settled.settlement))
            }
            Err(LedgerError::AlreadySettled) => {
                tracing::debug!(split = %split_id, "split already settled");
                let existing = self.store.settlement_for(split_id).await?;
                (SettleStatus::AlreadySettled, existing)
            }
            Err(err) => return Err(err),
        };

        let amount = self
            .balances
            .owed_between(&split.group_id, &split.debtor, &split.creditor)
            .await?;
        Ok(SettlementResult {
            status,
            settlement,
            balance: oriented(split.debtor, split.creditor, amount),
        })
    }

    /// Removes a member whose net position in the group is zero.
    #[tracing::instrument(skip(self))]
    pub async fn leave_group(&self, group_id: &GroupId, user: &UserId) -> LedgerResult<Group> {
        let group = self.store.group(group_id).await?;
        if !group.is_member(user) {
            return Err(LedgerError::UnknownMember(user.to_string()));
        }
        if group.direct {
            return Err(LedgerError::InvalidRequest(format!(
                "{group_id} is a two-party ledger"
            )));
        }

        let (revision, net) = self.balances.user_net_position(group_id, user).await?;
        if net != 0 {
            tracing::info!(group = %group_id, user = %user, net, "leave rejected");
            return Err(LedgerError::OutstandingBalance { net });
        }

        let updated = self.store.remove_member(group_id, user, revision).await?;
        self.balances
            .record_mutation(group_id, updated.revision, std::iter::empty::<(&Split, Amount)>());
        tracing::info!(group = %group_id, user = %user, "member left group");
        Ok(updated)
    }
}

// Express a signed balance as a positive debt in its actual direction.
fn oriented(debtor: UserId, creditor: UserId, owed: Amount) -> PairBalance {
    if owed < 0 {
        PairBalance {
            debtor: creditor,
            creditor: debtor,
            amount: -owed,
        }
    } else {
        PairBalance {
            debtor,
            creditor,
            amount: owed,
        }
    }
}
