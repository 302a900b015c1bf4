//! MongoDB-backed ledger store.
//!
//! Layout: `Users`, `Groups`, `Expenses`, `Splits` and `Settlements`
//! collections. Multi-document writes run inside a transaction, so the
//! deployment must be a replica set.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use futures::TryFutureExt;
use bson::{doc, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{
    FindOneAndUpdateOptions, FindOptions, IndexOptions, ReadConcern, ReturnDocument,
    TransactionOptions,
};
use mongodb::{Client, ClientSession, Collection, Database, IndexModel};

use super::{LedgerSnapshot, LedgerStore, SettledSplit};
use crate::error::{LedgerError, LedgerResult};
use crate::schemas::{
    Expense, ExpenseId, Group, GroupId, Settlement, Split, SplitId, User, UserId,
};

const DUPLICATE_KEY: i32 = 11000;
const WRITE_CONFLICT: i32 = 112;

#[derive(Clone, Debug)]
pub struct MongoLedgerStore {
    client: Client,
    db: Database,
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        *err.kind,
        ErrorKind::Write(WriteFailure::WriteError(ref e)) if e.code == DUPLICATE_KEY
    )
}

// Another transaction already holds this split's pending -> settled write,
// or has committed its settlement row.
fn lost_settle_race(err: &mongodb::error::Error) -> bool {
    is_duplicate_key(err)
        || matches!(*err.kind, ErrorKind::Command(ref e) if e.code == WRITE_CONFLICT)
}

fn creation_order() -> FindOptions {
    FindOptions::builder()
        .sort(doc! { "created_at": 1, "id": 1 })
        .build()
}

impl MongoLedgerStore {
    /// Connects and makes sure the indexes the store relies on exist.
    pub async fn connect(uri: &str, database: &str) -> LedgerResult<Self> {
        let client = Client::with_uri_str(uri).await?;
        let store = Self {
            db: client.database(database),
            client,
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> LedgerResult<()> {
        let unique = |keys: Document| {
            IndexModel::builder()
                .keys(keys)
                .options(IndexOptions::builder().unique(true).build())
                .build()
        };
        self.users().create_index(unique(doc! { "id": 1 }), None).await?;
        self.groups().create_index(unique(doc! { "id": 1 }), None).await?;
        self.expenses().create_index(unique(doc! { "id": 1 }), None).await?;
        self.splits().create_index(unique(doc! { "id": 1 }), None).await?;
        // At most one settlement per split.
        self.settlements()
            .create_index(unique(doc! { "split_id": 1 }), None)
            .await?;
        self.splits()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "group_id": 1, "debtor": 1, "creditor": 1 })
                    .build(),
                None,
            )
            .await?;
        Ok(())
    }

    fn users(&self) -> Collection<User> {
        self.db.collection("Users")
    }

    fn groups(&self) -> Collection<Group> {
        self.db.collection("Groups")
    }

    fn expenses(&self) -> Collection<Expense> {
        self.db.collection("Expenses")
    }

    fn splits(&self) -> Collection<Split> {
        self.db.collection("Splits")
    }

    fn settlements(&self) -> Collection<Settlement> {
        self.db.collection("Settlements")
    }

    async fn transaction(&self) -> LedgerResult<ClientSession> {
        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;
        Ok(session)
    }

    /// Bumps the group revision inside `session`, returning the new value.
    async fn bump_revision(
        &self,
        group: &GroupId,
        mut filter: Document,
        session: &mut ClientSession,
    ) -> mongodb::error::Result<Option<u64>> {
        filter.insert("id", group.as_str());
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let updated = self
            .groups()
            .find_one_and_update_with_session(
                filter,
                doc! { "$inc": { "revision": 1_i64 } },
                options,
                session,
            )
            .await?;
        Ok(updated.map(|g| g.revision))
    }

    fn scan<T>(
        &self,
        collection: Collection<T>,
        filter: Document,
        options: Option<FindOptions>,
    ) -> BoxStream<'static, LedgerResult<T>>
    where
        T: serde::de::DeserializeOwned + Unpin + Send + Sync + 'static,
    {
        async move { collection.find(filter, options).await }
            .map_ok(|cursor| cursor.map_err(LedgerError::from))
            .map_err(LedgerError::from)
            .try_flatten_stream()
            .boxed()
    }

    async fn explain_missing_split(&self, id: &SplitId) -> LedgerError {
        match self.splits().find_one(doc! { "id": id.as_str() }, None).await {
            Ok(Some(split)) if !split.is_pending() => LedgerError::AlreadySettled,
            Ok(Some(_)) => LedgerError::Conflict(format!("split {id} is being settled")),
            Ok(None) => LedgerError::not_found("split", id),
            Err(err) => err.into(),
        }
    }

    async fn try_mark_split_settled(
        &self,
        id: &SplitId,
        settled_by: &UserId,
        session: &mut ClientSession,
    ) -> mongodb::error::Result<LedgerResult<SettledSplit>> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let Some(split) = self
            .splits()
            .find_one_and_update_with_session(
                doc! { "id": id.as_str(), "state": "pending" },
                doc! { "$set": { "state": "settled" } },
                options,
                session,
            )
            .await?
        else {
            return Ok(Err(self.explain_missing_split(id).await));
        };

        let settlement = Settlement::new(id.clone(), settled_by.clone());
        self.settlements()
            .insert_one_with_session(&settlement, None, session)
            .await?;
        let Some(revision) = self
            .bump_revision(&split.group_id, Document::new(), session)
            .await?
        else {
            return Ok(Err(LedgerError::not_found("group", &split.group_id)));
        };
        session.commit_transaction().await?;

        Ok(Ok(SettledSplit {
            split,
            settlement,
            revision,
        }))
    }
}

#[async_trait]
impl LedgerStore for MongoLedgerStore {
    async fn upsert_user(&self, user: User) -> LedgerResult<()> {
        self.users()
            .update_one(
                doc! { "id": user.id.as_str() },
                doc! { "$set": { "name": user.name.as_str() } },
                mongodb::options::UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    async fn user(&self, id: &UserId) -> LedgerResult<User> {
        self.users()
            .find_one(doc! { "id": id.as_str() }, None)
            .await?
            .ok_or_else(|| LedgerError::not_found("user", id))
    }

    async fn create_group(&self, group: Group) -> LedgerResult<()> {
        match self.groups().insert_one(&group, None).await {
            Ok(_) => Ok(()),
            Err(err) if is_duplicate_key(&err) => Err(LedgerError::already_exists("group", &group.id)),
            Err(err) => Err(err.into()),
        }
    }

    async fn group(&self, id: &GroupId) -> LedgerResult<Group> {
        self.groups()
            .find_one(doc! { "id": id.as_str() }, None)
            .await?
            .ok_or_else(|| LedgerError::not_found("group", id))
    }

    async fn add_members(&self, id: &GroupId, users: &[UserId]) -> LedgerResult<Group> {
        let ids: Vec<&str> = users.iter().map(UserId::as_str).collect();
        let known = self
            .users()
            .count_documents(doc! { "id": { "$in": ids.clone() } }, None)
            .await?;
        if known as usize != ids.len() {
            for user in users {
                self.user(user).await?;
            }
        }

        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        self.groups()
            .find_one_and_update(
                doc! { "id": id.as_str() },
                doc! { "$addToSet": { "members": { "$each": ids } } },
                options,
            )
            .await?
            .ok_or_else(|| LedgerError::not_found("group", id))
    }

    async fn remove_member(
        &self,
        id: &GroupId,
        user: &UserId,
        expected_revision: u64,
    ) -> LedgerResult<Group> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let updated = self
            .groups()
            .find_one_and_update(
                doc! {
                    "id": id.as_str(),
                    "members": user.as_str(),
                    "revision": expected_revision as i64,
                },
                doc! {
                    "$pull": { "members": user.as_str() },
                    "$inc": { "revision": 1_i64 },
                },
                options,
            )
            .await?;
        if let Some(group) = updated {
            return Ok(group);
        }

        let group = self.group(id).await?;
        if !group.is_member(user) {
            return Err(LedgerError::UnknownMember(user.to_string()));
        }
        Err(LedgerError::Conflict(format!(
            "group {id} changed (expected revision {expected_revision}, found {})",
            group.revision
        )))
    }

    fn user_groups(&self, user: &UserId) -> BoxStream<'_, LedgerResult<Group>> {
        let options = FindOptions::builder().sort(doc! { "id": 1 }).build();
        self.scan(self.groups(), doc! { "members": user.as_str() }, Some(options))
    }

    fn joinable_groups(&self, user: &UserId) -> BoxStream<'_, LedgerResult<Group>> {
        let options = FindOptions::builder().sort(doc! { "id": 1 }).build();
        let filter = doc! {
            "members": { "$ne": user.as_str() },
            "direct": { "$ne": true },
        };
        self.scan(self.groups(), filter, Some(options))
    }

    fn users_outside_group(&self, group: &GroupId) -> BoxStream<'_, LedgerResult<User>> {
        let group = group.clone();
        async move {
            let members: Vec<String> = self
                .group(&group)
                .await?
                .members
                .into_iter()
                .map(|u| u.0)
                .collect();
            let options = FindOptions::builder().sort(doc! { "id": 1 }).build();
            let users = self.scan(self.users(), doc! { "id": { "$nin": members } }, Some(options));
            Ok::<_, LedgerError>(users)
        }
        .try_flatten_stream()
        .boxed()
    }

    async fn insert_expense(&self, expense: Expense, splits: Vec<Split>) -> LedgerResult<u64> {
        let mut participants: Vec<&str> = splits.iter().map(|s| s.debtor.as_str()).collect();
        participants.push(expense.payer.as_str());

        let mut session = self.transaction().await?;
        let revision = self
            .bump_revision(
                &expense.group_id,
                doc! { "members": { "$all": participants.clone() } },
                &mut session,
            )
            .await?;
        let Some(revision) = revision else {
            session.abort_transaction().await?;
            let group = self.group(&expense.group_id).await?;
            let stranger = participants
                .iter()
                .copied()
                .find(|u| !group.is_member(&UserId::from(*u)))
                .map(str::to_string)
                .unwrap_or_default();
            return Err(LedgerError::UnknownMember(stranger));
        };

        if let Err(err) = self
            .expenses()
            .insert_one_with_session(&expense, None, &mut session)
            .await
        {
            session.abort_transaction().await?;
            return Err(if is_duplicate_key(&err) {
                LedgerError::already_exists("expense", &expense.id)
            } else {
                err.into()
            });
        }
        if !splits.is_empty() {
            self.splits()
                .insert_many_with_session(&splits, None, &mut session)
                .await?;
        }
        session.commit_transaction().await?;
        Ok(revision)
    }

    async fn expense(&self, id: &ExpenseId) -> LedgerResult<Expense> {
        self.expenses()
            .find_one(doc! { "id": id.as_str() }, None)
            .await?
            .ok_or_else(|| LedgerError::not_found("expense", id))
    }

    fn group_expenses(&self, group: &GroupId) -> BoxStream<'_, LedgerResult<Expense>> {
        self.scan(
            self.expenses(),
            doc! { "group_id": group.as_str() },
            Some(creation_order()),
        )
    }

    async fn expense_splits(&self, id: &ExpenseId) -> LedgerResult<Vec<Split>> {
        self.expense(id).await?;
        self.scan(
            self.splits(),
            doc! { "expense_id": id.as_str() },
            Some(creation_order()),
        )
        .try_collect()
        .await
    }

    async fn split(&self, id: &SplitId) -> LedgerResult<Split> {
        self.splits()
            .find_one(doc! { "id": id.as_str() }, None)
            .await?
            .ok_or_else(|| LedgerError::not_found("split", id))
    }

    fn user_splits(&self, user: &UserId) -> BoxStream<'_, LedgerResult<Split>> {
        let filter = doc! {
            "$or": [ { "debtor": user.as_str() }, { "creditor": user.as_str() } ]
        };
        self.scan(self.splits(), filter, Some(creation_order()))
    }

    async fn mark_split_settled(
        &self,
        id: &SplitId,
        settled_by: &UserId,
    ) -> LedgerResult<SettledSplit> {
        let mut session = self.transaction().await?;
        match self.try_mark_split_settled(id, settled_by, &mut session).await {
            Ok(Ok(settled)) => Ok(settled),
            Ok(Err(err)) => {
                session.abort_transaction().await?;
                Err(err)
            }
            Err(err) if lost_settle_race(&err) => {
                tracing::debug!(split = %id, error = %err, "lost settlement race");
                Err(LedgerError::AlreadySettled)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn settlement_for(&self, split: &SplitId) -> LedgerResult<Option<Settlement>> {
        Ok(self
            .settlements()
            .find_one(doc! { "split_id": split.as_str() }, None)
            .await?)
    }

    async fn pending_snapshot(&self, group: &GroupId) -> LedgerResult<LedgerSnapshot> {
        let mut session = self.client.start_session(None).await?;
        let options = TransactionOptions::builder()
            .read_concern(ReadConcern::snapshot())
            .build();
        session.start_transaction(options).await?;

        let Some(found) = self
            .groups()
            .find_one_with_session(doc! { "id": group.as_str() }, None, &mut session)
            .await?
        else {
            session.abort_transaction().await?;
            return Err(LedgerError::not_found("group", group));
        };

        let filter = doc! { "group_id": group.as_str(), "state": "pending" };
        let mut cursor = self
            .splits()
            .find_with_session(filter, creation_order(), &mut session)
            .await?;
        let pending: Vec<Split> = cursor
            .stream(&mut session)
            .try_filter(|s| futures::future::ready(!s.is_self_share()))
            .try_collect()
            .await?;
        session.commit_transaction().await?;

        Ok(LedgerSnapshot {
            revision: found.revision,
            pending,
        })
    }
}

/// These run against a live replica set named by `MONGODB_TEST_URI` and
/// return early when it is unset. Each test works in its own database.
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::schemas::{SplitState, MAX_AMOUNT};

    fn user(id: &str) -> UserId {
        UserId::from(id)
    }

    async fn store() -> Option<MongoLedgerStore> {
        let uri = std::env::var("MONGODB_TEST_URI").ok()?;
        let database = format!("splitledger_test_{}", uuid::Uuid::now_v7().simple());
        Some(MongoLedgerStore::connect(&uri, &database).await.unwrap())
    }

    async fn seeded(store: &MongoLedgerStore) -> GroupId {
        for id in ["alice", "bob", "carol"] {
            store
                .upsert_user(User {
                    id: user(id),
                    name: id.to_string(),
                })
                .await
                .unwrap();
        }
        let group_id = GroupId::from("trip");
        store
            .create_group(Group::new(group_id.clone(), "Trip".into(), user("alice")))
            .await
            .unwrap();
        store.add_members(&group_id, &[user("bob")]).await.unwrap();
        group_id
    }

    fn expense_owed_by(group: &GroupId, debtor: &str, amount: i64) -> (Expense, Split) {
        let now = Utc::now();
        let expense = Expense {
            id: ExpenseId::generate(),
            group_id: group.clone(),
            payer: user("alice"),
            amount,
            description: "dinner".into(),
            created_at: now,
        };
        let split = Split {
            id: SplitId::generate(),
            expense_id: expense.id.clone(),
            group_id: group.clone(),
            debtor: user(debtor),
            creditor: user("alice"),
            amount,
            state: SplitState::Pending,
            created_at: now,
        };
        (expense, split)
    }

    #[tokio::test]
    async fn second_settle_is_already_settled() {
        let Some(store) = store().await else { return };
        let group = seeded(&store).await;
        let (expense, split) = expense_owed_by(&group, "bob", 40);
        store.insert_expense(expense, vec![split.clone()]).await.unwrap();

        let first = store.mark_split_settled(&split.id, &user("bob")).await.unwrap();
        assert_eq!(first.split.state, SplitState::Settled);
        let err = store
            .mark_split_settled(&split.id, &user("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadySettled));

        let stored = store.settlement_for(&split.id).await.unwrap().unwrap();
        assert_eq!(stored.settled_by, user("bob"));
        store.db.drop(None).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_settles_have_one_winner() {
        let Some(store) = store().await else { return };
        let store = Arc::new(store);
        let group = seeded(&store).await;
        let (expense, split) = expense_owed_by(&group, "bob", MAX_AMOUNT);
        let before = store.insert_expense(expense, vec![split.clone()]).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let id = split.id.clone();
            let by = if i % 2 == 0 { user("alice") } else { user("bob") };
            handles.push(tokio::spawn(async move {
                store.mark_split_settled(&id, &by).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(LedgerError::AlreadySettled) => {}
                Err(err) => panic!("unexpected settle error: {err}"),
            }
        }
        assert_eq!(winners, 1);

        let snapshot = store.pending_snapshot(&group).await.unwrap();
        assert_eq!(snapshot.revision, before + 1);
        assert!(snapshot.pending.is_empty());
        store.db.drop(None).await.unwrap();
    }

    #[tokio::test]
    async fn stranger_expense_leaves_nothing_behind() {
        let Some(store) = store().await else { return };
        let group = seeded(&store).await;
        let before = store.group(&group).await.unwrap().revision;

        let (expense, split) = expense_owed_by(&group, "carol", 25);
        let err = store
            .insert_expense(expense.clone(), vec![split.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnknownMember(ref who) if who == "carol"));

        assert!(matches!(
            store.expense(&expense.id).await,
            Err(LedgerError::NotFound { .. })
        ));
        assert!(matches!(
            store.split(&split.id).await,
            Err(LedgerError::NotFound { .. })
        ));
        assert_eq!(store.group(&group).await.unwrap().revision, before);
        store.db.drop(None).await.unwrap();
    }

    #[tokio::test]
    async fn leave_at_stale_revision_conflicts() {
        let Some(store) = store().await else { return };
        let group = seeded(&store).await;
        let stale = store.group(&group).await.unwrap().revision;

        let (expense, split) = expense_owed_by(&group, "bob", 10);
        store.insert_expense(expense, vec![split]).await.unwrap();

        let err = store
            .remove_member(&group, &user("bob"), stale)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
        assert!(store.group(&group).await.unwrap().is_member(&user("bob")));

        let current = store.group(&group).await.unwrap().revision;
        let left = store.remove_member(&group, &user("bob"), current).await.unwrap();
        assert!(!left.is_member(&user("bob")));
        assert_eq!(left.revision, current + 1);
        store.db.drop(None).await.unwrap();
    }
}
