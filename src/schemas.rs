use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Money in the smallest currency unit (e.g. cents). Never a float.
pub type Amount = i64;

/// Largest amount a single expense may carry.
///
/// Balance sums stay far inside `i64` at this ceiling: overflowing would
/// take millions of maximal expenses outstanding in one group.
pub const MAX_AMOUNT: Amount = 1_000_000_000_000;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// User nick. Ordering of user ids drives remainder assignment and
    /// simplifier tie-breaking.
    UserId
);
string_id!(GroupId);
string_id!(ExpenseId);
string_id!(SplitId);
string_id!(SettlementId);

/// Prefix reserved for two-party ledgers.
const DIRECT_GROUP_PREFIX: &str = "direct:";

impl GroupId {
    /// Id of the two-party ledger between `a` and `b`, whatever their order.
    pub fn direct(a: &UserId, b: &UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{DIRECT_GROUP_PREFIX}{low}:{high}"))
    }

    /// Ids that only [`GroupId::direct`] may produce.
    pub fn is_reserved(&self) -> bool {
        self.0.starts_with(DIRECT_GROUP_PREFIX)
    }
}

/// Time-ordered identifier for ledger rows.
fn generated_id() -> String {
    Uuid::now_v7().to_string()
}

impl ExpenseId {
    pub fn generate() -> Self {
        Self(generated_id())
    }
}

impl SplitId {
    pub fn generate() -> Self {
        Self(generated_id())
    }
}

impl SettlementId {
    pub fn generate() -> Self {
        Self(generated_id())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub members: BTreeSet<UserId>,
    /// Bumped by every mutation that changes balances or membership.
    pub revision: u64,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    /// Two-party ledger between friends. Membership is fixed.
    #[serde(default)]
    pub direct: bool,
}

impl Group {
    pub fn new(id: GroupId, name: String, creator: UserId) -> Self {
        Self {
            id,
            name,
            members: BTreeSet::from([creator]),
            revision: 0,
            created_at: Utc::now(),
            direct: false,
        }
    }

    pub fn direct(a: UserId, b: UserId) -> Self {
        let id = GroupId::direct(&a, &b);
        Self {
            name: format!("{a} & {b}"),
            id,
            members: BTreeSet::from([a, b]),
            revision: 0,
            created_at: Utc::now(),
            direct: true,
        }
    }

    pub fn is_member(&self, user: &UserId) -> bool {
        self.members.contains(user)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Expense {
    pub id: ExpenseId,
    pub group_id: GroupId,
    pub payer: UserId,
    pub amount: Amount,
    pub description: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitState {
    Pending,
    Settled,
}

/// One debtor's share of an expense, owed to the expense's payer.
///
/// The payer's own share is stored with `debtor == creditor` and starts out
/// settled, so it never produces an obligation.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Split {
    pub id: SplitId,
    pub expense_id: ExpenseId,
    pub group_id: GroupId,
    pub debtor: UserId,
    pub creditor: UserId,
    pub amount: Amount,
    pub state: SplitState,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Split {
    pub fn is_self_share(&self) -> bool {
        self.debtor == self.creditor
    }

    pub fn is_pending(&self) -> bool {
        self.state == SplitState::Pending
    }

    pub fn involves(&self, user: &UserId) -> bool {
        &self.debtor == user || &self.creditor == user
    }
}

/// Append-only record of a split being cleared.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settlement {
    pub id: SettlementId,
    pub split_id: SplitId,
    pub settled_by: UserId,
    #[serde(with = "timestamp")]
    pub settled_at: DateTime<Utc>,
}

impl Settlement {
    pub fn new(split_id: SplitId, settled_by: UserId) -> Self {
        Self {
            id: SettlementId::generate(),
            split_id,
            settled_by,
            settled_at: Utc::now(),
        }
    }
}

/// RFC 3339 with a fixed nine fractional digits, so stored timestamps sort
/// as strings in chronological order.
mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(de::Error::custom)
    }
}
