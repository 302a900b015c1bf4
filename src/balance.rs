use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::error::LedgerResult;
use crate::schemas::{Amount, GroupId, Split, UserId};
use crate::store::LedgerStore;

/// Outstanding amount `debtor` owes `creditor`. Always positive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PairBalance {
    pub debtor: UserId,
    pub creditor: UserId,
    pub amount: Amount,
}

/// Netted directed balances of one group.
///
/// For any pair of users at most one direction is present, and only with a
/// positive amount. That canonical form is what makes an incrementally
/// maintained value comparable with a fresh recompute.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupBalances {
    owed: BTreeMap<(UserId, UserId), Amount>,
}

impl GroupBalances {
    /// Full recompute: accumulate unsettled splits per ordered pair, then net
    /// opposite directions.
    pub fn from_splits<'a>(splits: impl IntoIterator<Item = &'a Split>) -> Self {
        let mut gross: BTreeMap<(UserId, UserId), Amount> = BTreeMap::new();
        for split in splits {
            if split.is_self_share() || !split.is_pending() {
                continue;
            }
            *gross
                .entry((split.debtor.clone(), split.creditor.clone()))
                .or_default() += split.amount;
        }

        let mut balances = Self::default();
        for ((debtor, creditor), amount) in gross {
            balances.apply(&debtor, &creditor, amount);
        }
        balances
    }

    /// Adds `delta` to what `debtor` owes `creditor` and re-nets that pair.
    pub fn apply(&mut self, debtor: &UserId, creditor: &UserId, delta: Amount) {
        if debtor == creditor || delta == 0 {
            return;
        }
        let net = self.owed_between(debtor, creditor) + delta;
        self.owed.remove(&(debtor.clone(), creditor.clone()));
        self.owed.remove(&(creditor.clone(), debtor.clone()));
        if net > 0 {
            self.owed.insert((debtor.clone(), creditor.clone()), net);
        } else if net < 0 {
            self.owed.insert((creditor.clone(), debtor.clone()), -net);
        }
    }

    /// Positive when `a` owes `b`.
    pub fn owed_between(&self, a: &UserId, b: &UserId) -> Amount {
        let forward = self.owed.get(&(a.clone(), b.clone())).copied().unwrap_or(0);
        let backward = self.owed.get(&(b.clone(), a.clone())).copied().unwrap_or(0);
        forward - backward
    }

    /// What the user owes minus what the user is owed.
    pub fn net_position(&self, user: &UserId) -> Amount {
        self.owed
            .iter()
            .map(|((debtor, creditor), amount)| {
                if debtor == user {
                    *amount
                } else if creditor == user {
                    -*amount
                } else {
                    0
                }
            })
            .sum()
    }

    /// Net position of every user that appears in a balance.
    pub fn net_positions(&self) -> BTreeMap<UserId, Amount> {
        let mut positions: BTreeMap<UserId, Amount> = BTreeMap::new();
        for ((debtor, creditor), amount) in &self.owed {
            *positions.entry(debtor.clone()).or_default() += amount;
            *positions.entry(creditor.clone()).or_default() -= amount;
        }
        positions
    }

    /// Counterparties `user` currently owes money to.
    pub fn owe_details(&self, user: &UserId) -> Vec<PairBalance> {
        self.pairs().filter(|p| &p.debtor == user).collect()
    }

    pub fn pairs(&self) -> impl Iterator<Item = PairBalance> + '_ {
        self.owed.iter().map(|((debtor, creditor), amount)| PairBalance {
            debtor: debtor.clone(),
            creditor: creditor.clone(),
            amount: *amount,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.owed.is_empty()
    }
}

/// Applies a split's creation (`+amount`) or settlement (`-amount`).
pub fn incremental_update(balances: &mut GroupBalances, split: &Split, delta: Amount) {
    balances.apply(&split.debtor, &split.creditor, delta);
}

/// Balances together with the group revision they reflect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BalanceSnapshot {
    pub revision: u64,
    pub balances: GroupBalances,
}

#[derive(Debug, Default)]
struct CacheSlot {
    /// Highest revision any committed mutation has reported.
    latest: u64,
    snapshot: Option<BalanceSnapshot>,
}

impl CacheSlot {
    fn current(&self) -> Option<&BalanceSnapshot> {
        self.snapshot.as_ref().filter(|s| s.revision >= self.latest)
    }
}

/// Derives balances from the store and keeps a per-group cache.
///
/// The cache is never authoritative. It only moves forward through
/// [`BalanceEngine::record_mutation`], and only when the mutation's revision
/// directly follows the cached one; anything else drops the entry. A cached
/// value older than the latest reported revision is never served.
pub struct BalanceEngine {
    store: Arc<dyn LedgerStore>,
    cache: RwLock<HashMap<GroupId, CacheSlot>>,
}

impl BalanceEngine {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Recomputes a group's balances from its unsettled splits.
    #[tracing::instrument(skip(self))]
    pub async fn compute_group_balances(&self, group: &GroupId) -> LedgerResult<BalanceSnapshot> {
        let snapshot = self.store.pending_snapshot(group).await?;
        let computed = BalanceSnapshot {
            revision: snapshot.revision,
            balances: GroupBalances::from_splits(&snapshot.pending),
        };

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let slot = cache.entry(group.clone()).or_default();
        let newer = slot
            .snapshot
            .as_ref()
            .map_or(true, |cached| cached.revision < computed.revision);
        if newer && computed.revision >= slot.latest {
            slot.latest = computed.revision;
            slot.snapshot = Some(computed.clone());
        }
        Ok(computed)
    }

    /// Cached balances, recomputed on a miss.
    pub async fn group_balances(&self, group: &GroupId) -> LedgerResult<BalanceSnapshot> {
        let cached = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(group)
            .and_then(CacheSlot::current)
            .cloned();
        match cached {
            Some(snapshot) => Ok(snapshot),
            None => self.compute_group_balances(group).await,
        }
    }

    pub async fn owed_between(
        &self,
        group: &GroupId,
        a: &UserId,
        b: &UserId,
    ) -> LedgerResult<Amount> {
        Ok(self.group_balances(group).await?.balances.owed_between(a, b))
    }

    /// Net position plus the revision it was computed at.
    pub async fn user_net_position(
        &self,
        group: &GroupId,
        user: &UserId,
    ) -> LedgerResult<(u64, Amount)> {
        let snapshot = self.group_balances(group).await?;
        Ok((snapshot.revision, snapshot.balances.net_position(user)))
    }

    /// Folds a committed mutation into the cache.
    pub fn record_mutation<'a>(
        &self,
        group: &GroupId,
        revision: u64,
        deltas: impl IntoIterator<Item = (&'a Split, Amount)>,
    ) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let slot = cache.entry(group.clone()).or_default();
        slot.latest = slot.latest.max(revision);

        let in_sequence = match slot.snapshot.as_mut() {
            Some(cached) if cached.revision + 1 == revision => {
                for (split, delta) in deltas {
                    incremental_update(&mut cached.balances, split, delta);
                }
                cached.revision = revision;
                true
            }
            // Already reflected by a newer recompute.
            Some(cached) => cached.revision >= revision,
            None => true,
        };
        if !in_sequence {
            tracing::debug!(group = %group, revision, "balance cache out of sequence, dropping");
            slot.snapshot = None;
        }
    }
}
