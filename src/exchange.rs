use std::collections::BTreeMap;

use serde::Serialize;

use crate::balance::GroupBalances;
use crate::schemas::{Amount, UserId};

#[derive(Clone, Debug)]
struct PersonalBalance {
    id: UserId,
    balance: Amount,
}

/// A suggested transfer: `payer` sends `amount` to `receiver`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Exchange {
    pub payer: UserId,
    pub receiver: UserId,
    pub amount: Amount,
}

// The exchanges that will be made if no simplification happens
fn get_naive_exchanges(balances: &GroupBalances) -> Vec<Exchange> {
    balances
        .pairs()
        .map(|pair| Exchange {
            payer: pair.debtor,
            receiver: pair.creditor,
            amount: pair.amount,
        })
        .collect()
}

// Largest balance first, ties to the lowest user id
fn largest(people: &[PersonalBalance]) -> Option<usize> {
    people
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.balance.cmp(&b.balance).then_with(|| b.id.cmp(&a.id)))
        .map(|(idx, _)| idx)
}

/// Greedy debt simplification over net positions (positive = owes).
///
/// Repeatedly matches the largest debtor with the largest creditor and moves
/// the smaller of the two amounts. This is a heuristic: it never needs more
/// than `n - 1` transfers but is not always the global minimum.
pub fn simplify(positions: &BTreeMap<UserId, Amount>) -> Vec<Exchange> {
    // Divide people into payers and receivers
    let mut payers = Vec::new();
    let mut receivers = Vec::new();
    for (id, &balance) in positions {
        let person = PersonalBalance {
            id: id.clone(),
            balance: balance.abs(),
        };
        if balance > 0 {
            payers.push(person);
        } else if balance < 0 {
            receivers.push(person);
        }
    }

    let mut exchanges = Vec::new();
    while let (Some(p), Some(r)) = (largest(&payers), largest(&receivers)) {
        let amount = payers[p].balance.min(receivers[r].balance);
        exchanges.push(Exchange {
            payer: payers[p].id.clone(),
            receiver: receivers[r].id.clone(),
            amount,
        });

        payers[p].balance -= amount;
        receivers[r].balance -= amount;
        if payers[p].balance == 0 {
            payers.swap_remove(p);
        }
        if receivers[r].balance == 0 {
            receivers.swap_remove(r);
        }
    }
    exchanges
}

/// Suggested settlements for a group.
pub fn suggest_exchanges(balances: &GroupBalances) -> Vec<Exchange> {
    if balances.is_empty() {
        return Vec::new();
    }
    let naive_exchanges = get_naive_exchanges(balances);
    let simplified_exchanges = simplify(&balances.net_positions());

    // We ensure the simplification didn't accidentally end up being
    // more complicated than the naive exchanges
    if simplified_exchanges.len() <= naive_exchanges.len() {
        simplified_exchanges
    } else {
        naive_exchanges
    }
}
