//! C2 — the deterministic transaction engine.
//!
//! Grounded on `original_source/Raft/raft_nodes.py::execute_transaction`
//! and `original_source/Paxos/paxos_nodes.py::execute_transaction` /
//! `_get_required_accounts` / `_extract_tx_id`. Per spec.md §9's redesign
//! flag, balances are fixed-point (`Amount`, integer minor units) instead
//! of the original's binary floats, so determinism holds across reordered
//! apply streams.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A non-negative monetary amount, stored as integer minor units (cents)
/// to avoid binary-float drift. Text form is always `"1234.56"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Amount(pub i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).filter(|v| *v >= 0).map(Amount)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, (self.0 % 100).abs())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed amount: {0}")]
    Amount(String),
    #[error("malformed operation: {0}")]
    Operation(String),
}

impl FromStr for Amount {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, "0"),
        };
        let whole: i64 = whole
            .parse()
            .map_err(|_| ParseError::Amount(s.to_string()))?;
        let frac_str = if frac.len() >= 2 { &frac[..2] } else { frac };
        let mut frac_val: i64 = frac_str
            .parse()
            .map_err(|_| ParseError::Amount(s.to_string()))?;
        for _ in frac_str.len()..2 {
            frac_val *= 10;
        }
        Ok(Amount(whole * 100 + frac_val))
    }
}

/// A parsed domain operation, per spec.md §3/§4.3.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Deposit { account: String, amount: Amount },
    Withdraw { account: String, amount: Amount },
    Transfer { src: String, dst: String, amount: Amount },
}

impl Operation {
    /// Accounts this operation needs locked, in the deterministic sorted
    /// order spec.md §4.2 requires (`TRANSFER` needs `{src, dst}` sorted;
    /// `DEPOSIT`/`WITHDRAW` need `{account}`).
    pub fn required_accounts(&self) -> Vec<String> {
        match self {
            Operation::Deposit { account, .. } | Operation::Withdraw { account, .. } => {
                vec![account.clone()]
            }
            Operation::Transfer { src, dst, .. } => {
                let mut v = vec![src.clone(), dst.clone()];
                v.sort();
                v
            }
        }
    }
}

/// Parses the raw `;`-delimited payload into an `Operation`, tolerant of
/// whitespace around fields. Any trailing `TX_ID:...` token is ignored
/// here — it's consumed separately by `extract_tx_id` for Paxos locking.
pub fn parse_operation(payload: &str) -> Result<Operation, ParseError> {
    let parts: Vec<&str> = payload.split(';').map(|p| p.trim()).collect();
    if parts.is_empty() || parts[0].is_empty() {
        return Err(ParseError::Operation(payload.to_string()));
    }

    match parts[0].to_uppercase().as_str() {
        "DEPOSIT" if parts.len() >= 3 => Ok(Operation::Deposit {
            account: parts[1].to_string(),
            amount: parts[2].parse()?,
        }),
        "WITHDRAW" if parts.len() >= 3 => Ok(Operation::Withdraw {
            account: parts[1].to_string(),
            amount: parts[2].parse()?,
        }),
        "TRANSFER" if parts.len() >= 4 => Ok(Operation::Transfer {
            src: parts[1].to_string(),
            dst: parts[2].to_string(),
            amount: parts[3].parse()?,
        }),
        _ => Err(ParseError::Operation(payload.to_string())),
    }
}

/// Pulls the transaction id out of an optional trailing `TX_ID:...` token,
/// used by the Paxos lock table. Mirrors
/// `paxos_nodes.py::_extract_tx_id`.
pub fn extract_tx_id(payload: &str) -> Option<String> {
    payload.split(';').map(|p| p.trim()).find_map(|p| {
        p.strip_prefix("TX_ID:").map(|id| id.trim().to_string())
    })
}

/// The account map: a deterministic (`BTreeMap`) mapping from account
/// identifier to balance, per spec.md §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accounts(pub BTreeMap<String, Amount>);

impl Default for Accounts {
    /// Seeds the two demonstration accounts `original_source`'s node
    /// constructors carry (`KONTO_A: 10000.00`, `KONTO_B: 5000.00`),
    /// renamed to the spec's illustrative `A`/`B` identifiers.
    fn default() -> Self {
        let mut map = BTreeMap::new();
        map.insert("A".to_string(), Amount(1_000_000));
        map.insert("B".to_string(), Amount(500_000));
        Accounts(map)
    }
}

impl Accounts {
    pub fn balance(&self, account: &str) -> Amount {
        self.0.get(account).copied().unwrap_or(Amount::ZERO)
    }
}

/// Result of applying a committed operation. The entry is always
/// considered applied (it occupies a log slot and advances `lastApplied`)
/// even when the domain effect is a no-op, per spec.md §4.3/§7.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied,
    InsufficientFunds { account: String },
}

/// Applies a single operation to the account map. Deterministic: the same
/// ordered sequence of operations against the same starting map always
/// yields the same ending map (spec.md §4.3's end-state invariant).
pub fn apply_operation(accounts: &mut Accounts, op: &Operation) -> ApplyOutcome {
    match op {
        Operation::Deposit { account, amount } => {
            let entry = accounts.0.entry(account.clone()).or_insert(Amount::ZERO);
            *entry = entry.checked_add(*amount).expect("deposit overflow");
            ApplyOutcome::Applied
        }
        Operation::Withdraw { account, amount } => {
            let balance = accounts.balance(account);
            match balance.checked_sub(*amount) {
                Some(new_balance) => {
                    accounts.0.insert(account.clone(), new_balance);
                    ApplyOutcome::Applied
                }
                None => ApplyOutcome::InsufficientFunds { account: account.clone() },
            }
        }
        Operation::Transfer { src, dst, amount } => {
            let src_balance = accounts.balance(src);
            match src_balance.checked_sub(*amount) {
                Some(new_src_balance) => {
                    accounts.0.insert(src.clone(), new_src_balance);
                    let dst_entry = accounts.0.entry(dst.clone()).or_insert(Amount::ZERO);
                    *dst_entry = dst_entry.checked_add(*amount).expect("transfer overflow");
                    ApplyOutcome::Applied
                }
                None => ApplyOutcome::InsufficientFunds { account: src.clone() },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_parses_and_displays() {
        assert_eq!("10000.00".parse::<Amount>().unwrap(), Amount(1_000_000));
        assert_eq!("500".parse::<Amount>().unwrap(), Amount(50_000));
        assert_eq!(Amount(1_000_000).to_string(), "10000.00");
        assert_eq!(Amount(50).to_string(), "0.50");
    }

    #[test]
    fn parse_operation_tolerates_whitespace() {
        let op = parse_operation(" DEPOSIT ; A ; 500.00 ").unwrap();
        assert_eq!(op, Operation::Deposit { account: "A".into(), amount: Amount(50_000) });
    }

    #[test]
    fn parse_operation_ignores_trailing_tx_id() {
        let op = parse_operation("WITHDRAW;B;200.00;TX_ID:2").unwrap();
        assert_eq!(op, Operation::Withdraw { account: "B".into(), amount: Amount(20_000) });
    }

    #[test]
    fn extract_tx_id_finds_trailing_token() {
        assert_eq!(extract_tx_id("TRANSFER;A;B;1000.00;TX_ID:3"), Some("3".to_string()));
        assert_eq!(extract_tx_id("DEPOSIT;A;500.00"), None);
    }

    #[test]
    fn required_accounts_sorted_for_transfer() {
        let op = Operation::Transfer { src: "B".into(), dst: "A".into(), amount: Amount(1) };
        assert_eq!(op.required_accounts(), vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn scenario_s1_sequence_matches_spec() {
        let mut accounts = Accounts::default();
        apply_operation(&mut accounts, &parse_operation("DEPOSIT;A;500.00;TX:1").unwrap());
        apply_operation(&mut accounts, &parse_operation("WITHDRAW;B;200.00;TX:2").unwrap());
        apply_operation(&mut accounts, &parse_operation("TRANSFER;A;B;1000.00;TX:3").unwrap());
        assert_eq!(accounts.balance("A"), Amount(950_000));
        assert_eq!(accounts.balance("B"), Amount(580_000));
    }

    #[test]
    fn withdraw_with_insufficient_funds_is_a_noop_but_applied() {
        let mut accounts = Accounts::default();
        let before = accounts.clone();
        let outcome = apply_operation(
            &mut accounts,
            &parse_operation("WITHDRAW;A;999999.00").unwrap(),
        );
        assert_eq!(outcome, ApplyOutcome::InsufficientFunds { account: "A".into() });
        assert_eq!(accounts, before);
    }

    #[test]
    fn deterministic_regardless_of_intermediate_order_for_same_prefix() {
        let ops = ["DEPOSIT;A;10.00", "DEPOSIT;B;20.00", "TRANSFER;B;A;5.00"];
        let mut a = Accounts::default();
        let mut b = Accounts::default();
        for op in &ops {
            apply_operation(&mut a, &parse_operation(op).unwrap());
        }
        for op in &ops {
            apply_operation(&mut b, &parse_operation(op).unwrap());
        }
        assert_eq!(a, b);
    }
}
