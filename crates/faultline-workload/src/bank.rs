//! Bank workloads.
//!
//! A fixed total of money is spread over a few accounts. `read` returns a
//! snapshot of every balance in one transaction; `transfer` moves money
//! between two accounts in one transaction. Under serializable isolation
//! every `ok` read sums to the initial total.
//!
//! `bank` keeps all accounts as rows of one table. `multi_bank` gives every
//! account its own table, so a transfer spans two tables.

use std::collections::BTreeMap;

use async_trait::async_trait;
use faultline_client::{Connection, DriverError, DriverResult, OperationHandler, with_txn};
use faultline_core::{Operation, Outcome};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::error::{Result, WorkloadError};
use crate::invariant::Invariant;
use crate::source::{BankOps, OpSource};
use crate::workload::Workload;

/// Table holding all accounts in the single-table layout.
pub const ACCOUNTS_TABLE: &str = "accounts";

/// Key of the balance row in the table-per-account layout.
const BALANCE_ROW: i64 = 0;

/// Shape of the bank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BankConfig {
    /// Number of accounts, numbered from 0.
    pub accounts: usize,
    /// Total money; account 0 starts with all of it.
    pub total: i64,
    /// Largest amount a generated transfer moves.
    pub max_transfer: i64,
    /// Whether balances may go below zero.
    pub allow_negatives: bool,
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            accounts: 5,
            total: 100,
            max_transfer: 5,
            allow_negatives: false,
        }
    }
}

impl BankConfig {
    /// Returns the account ids.
    #[allow(clippy::cast_possible_wrap)]
    pub fn account_ids(&self) -> Vec<i64> {
        (0..self.accounts as i64).collect()
    }

    /// Checks the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.accounts < 2 {
            return Err(WorkloadError::InvalidConfiguration(format!(
                "a bank needs at least 2 accounts, got {}",
                self.accounts
            )));
        }
        if self.total < 0 {
            return Err(WorkloadError::InvalidConfiguration(format!(
                "total must not be negative, got {}",
                self.total
            )));
        }
        if self.max_transfer < 1 {
            return Err(WorkloadError::InvalidConfiguration(
                "max_transfer must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn initial_balances(&self) -> Vec<(i64, i64)> {
        self.account_ids()
            .into_iter()
            .map(|a| (a, if a == 0 { self.total } else { 0 }))
            .collect()
    }
}

/// How accounts map onto tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankLayout {
    /// One table, one row per account.
    SingleTable,
    /// One table per account, one row each.
    TablePerAccount,
}

impl BankLayout {
    fn location(self, account: i64) -> (String, i64) {
        match self {
            BankLayout::SingleTable => (ACCOUNTS_TABLE.to_string(), account),
            BankLayout::TablePerAccount => (format!("{ACCOUNTS_TABLE}{account}"), BALANCE_ROW),
        }
    }

    fn tables(self, accounts: &[i64]) -> Vec<String> {
        match self {
            BankLayout::SingleTable => vec![ACCOUNTS_TABLE.to_string()],
            BankLayout::TablePerAccount => accounts.iter().map(|a| self.location(*a).0).collect(),
        }
    }
}

/// A transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Source account.
    pub from: i64,
    /// Destination account.
    pub to: i64,
    /// Amount moved.
    pub amount: i64,
}

enum TransferResult {
    Applied,
    Overdrawn { balance: i64 },
}

/// The bank and multi-table bank workloads.
#[derive(Debug, Clone)]
pub struct BankWorkload {
    config: BankConfig,
    layout: BankLayout,
}

impl BankWorkload {
    /// Creates a bank with the given layout.
    pub fn new(config: BankConfig, layout: BankLayout) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, layout })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &BankConfig {
        &self.config
    }

    /// Returns the layout.
    pub fn layout(&self) -> BankLayout {
        self.layout
    }

    async fn transfer(&self, conn: &mut dyn Connection, op: &Operation) -> DriverResult<Outcome> {
        let Ok(t) = serde_json::from_value::<Transfer>(op.value.clone()) else {
            return Ok(Outcome::Fail(json!(["invalid-transfer", op.value])));
        };
        // A self-transfer would read one balance twice and write it twice.
        if t.from == t.to || t.amount < 0 {
            return Ok(Outcome::Fail(json!(["invalid-transfer", op.value])));
        }
        let layout = self.layout;
        let allow_negatives = self.config.allow_negatives;

        let result = with_txn(conn, move |c| {
            Box::pin(async move {
                let from = balance(c, layout, t.from).await?;
                let to = balance(c, layout, t.to).await?;
                let remaining = from - t.amount;
                if remaining < 0 && !allow_negatives {
                    return Ok(TransferResult::Overdrawn { balance: remaining });
                }
                set_balance(c, layout, t.from, remaining).await?;
                set_balance(c, layout, t.to, to + t.amount).await?;
                Ok(TransferResult::Applied)
            })
        })
        .await?;

        Ok(match result {
            TransferResult::Applied => Outcome::Ok(op.value.clone()),
            TransferResult::Overdrawn { balance } => {
                debug!(from = t.from, balance, "Transfer would overdraw");
                Outcome::Fail(json!(["negative", t.from, balance]))
            }
        })
    }

    async fn read(&self, conn: &mut dyn Connection) -> DriverResult<Outcome> {
        let layout = self.layout;
        let accounts = self.config.account_ids();
        let balances = with_txn(conn, move |c| {
            Box::pin(async move { balances(c, layout, &accounts).await })
        })
        .await?;

        let snapshot: Map<String, Value> = balances
            .into_iter()
            .map(|(account, balance)| (account.to_string(), Value::from(balance)))
            .collect();
        Ok(Outcome::Ok(Value::Object(snapshot)))
    }
}

/// Creates the single-table bank.
pub fn bank(allow_negatives: bool) -> BankWorkload {
    BankWorkload {
        config: BankConfig {
            allow_negatives,
            ..BankConfig::default()
        },
        layout: BankLayout::SingleTable,
    }
}

/// Creates the table-per-account bank.
pub fn multi_bank(allow_negatives: bool) -> BankWorkload {
    BankWorkload {
        config: BankConfig {
            allow_negatives,
            ..BankConfig::default()
        },
        layout: BankLayout::TablePerAccount,
    }
}

async fn balance(conn: &mut dyn Connection, layout: BankLayout, account: i64) -> DriverResult<i64> {
    let (table, key) = layout.location(account);
    conn.read(&table, key)
        .await?
        .ok_or_else(|| DriverError::Other(format!("account {account} does not exist")))
}

async fn set_balance(
    conn: &mut dyn Connection,
    layout: BankLayout,
    account: i64,
    value: i64,
) -> DriverResult<()> {
    let (table, key) = layout.location(account);
    conn.upsert(&table, key, value).await
}

async fn balances(
    conn: &mut dyn Connection,
    layout: BankLayout,
    accounts: &[i64],
) -> DriverResult<BTreeMap<i64, i64>> {
    match layout {
        BankLayout::SingleTable => conn.scan(ACCOUNTS_TABLE).await,
        BankLayout::TablePerAccount => {
            let mut out = BTreeMap::new();
            for account in accounts {
                out.insert(*account, balance(conn, layout, *account).await?);
            }
            Ok(out)
        }
    }
}

#[async_trait]
impl OperationHandler for BankWorkload {
    async fn setup(&self, conn: &mut dyn Connection) -> DriverResult<()> {
        let accounts = self.config.account_ids();
        for table in self.layout.tables(&accounts) {
            conn.create_table(&table).await?;
        }
        let layout = self.layout;
        let initial = self.config.initial_balances();
        with_txn(conn, move |c| {
            Box::pin(async move {
                for (account, amount) in initial {
                    set_balance(c, layout, account, amount).await?;
                }
                Ok(())
            })
        })
        .await?;
        debug!(accounts = accounts.len(), total = self.config.total, "Bank initialised");
        Ok(())
    }

    async fn invoke(&self, conn: &mut dyn Connection, op: &Operation) -> DriverResult<Outcome> {
        match op.f.as_str() {
            "read" => self.read(conn).await,
            "transfer" => self.transfer(conn, op).await,
            other => Ok(Outcome::Fail(json!(["unknown-function", other]))),
        }
    }

    async fn teardown(&self, conn: &mut dyn Connection) -> DriverResult<()> {
        for table in self.layout.tables(&self.config.account_ids()) {
            conn.drop_table(&table).await?;
        }
        Ok(())
    }
}

impl Workload for BankWorkload {
    fn name(&self) -> &'static str {
        match self.layout {
            BankLayout::SingleTable => "bank",
            BankLayout::TablePerAccount => "bank-multitable",
        }
    }

    fn invariant(&self) -> Invariant {
        Invariant::TotalBalance {
            accounts: self.config.account_ids(),
            total: self.config.total,
            allow_negatives: self.config.allow_negatives,
        }
    }

    fn op_source(&self, seed: u64) -> Box<dyn OpSource> {
        Box::new(BankOps::new(
            self.config.account_ids(),
            self.config.max_transfer,
            seed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_client::{Connector, MemoryCluster};
    use faultline_core::{NodeId, OpType, ProcessId};

    async fn fresh(workload: &BankWorkload) -> (MemoryCluster, Box<dyn Connection>) {
        let cluster = MemoryCluster::new(&[NodeId::from("n1")]);
        let mut conn = cluster.connect(&NodeId::from("n1")).await.unwrap();
        workload.setup(conn.as_mut()).await.unwrap();
        (cluster, conn)
    }

    fn transfer(from: i64, to: i64, amount: i64) -> Operation {
        Operation::invoke(
            ProcessId(0),
            "transfer",
            json!({"from": from, "to": to, "amount": amount}),
        )
    }

    fn read() -> Operation {
        Operation::invoke(ProcessId(0), "read", Value::Null)
    }

    #[tokio::test]
    async fn test_initial_balances() {
        let workload = bank(false);
        let (cluster, mut conn) = fresh(&workload).await;
        let outcome = workload.invoke(conn.as_mut(), &read()).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Ok(json!({"0": 100, "1": 0, "2": 0, "3": 0, "4": 0}))
        );
        assert_eq!(cluster.table(ACCOUNTS_TABLE).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_transfer_scenario() {
        for workload in [bank(false), multi_bank(false)] {
            let (_cluster, mut conn) = fresh(&workload).await;

            let ok = workload.invoke(conn.as_mut(), &transfer(0, 1, 50)).await.unwrap();
            assert_eq!(ok, Outcome::Ok(json!({"from": 0, "to": 1, "amount": 50})));
            let snapshot = json!({"0": 50, "1": 50, "2": 0, "3": 0, "4": 0});
            assert_eq!(
                workload.invoke(conn.as_mut(), &read()).await.unwrap(),
                Outcome::Ok(snapshot.clone())
            );

            let overdraft = transfer(1, 2, 60);
            let outcome = workload.invoke(conn.as_mut(), &overdraft).await.unwrap();
            assert_eq!(outcome, Outcome::Fail(json!(["negative", 1, -10])));
            let done = overdraft.complete(outcome);
            assert_eq!(done.op_type, OpType::Fail);

            assert_eq!(
                workload.invoke(conn.as_mut(), &read()).await.unwrap(),
                Outcome::Ok(snapshot)
            );
        }
    }

    #[tokio::test]
    async fn test_invalid_transfers_change_nothing() {
        for workload in [bank(false), multi_bank(true)] {
            let (_cluster, mut conn) = fresh(&workload).await;
            let initial = json!({"0": 100, "1": 0, "2": 0, "3": 0, "4": 0});

            for op in [transfer(0, 0, 30), transfer(1, 1, 5), transfer(0, 1, -20)] {
                let outcome = workload.invoke(conn.as_mut(), &op).await.unwrap();
                assert_eq!(outcome, Outcome::Fail(json!(["invalid-transfer", op.value])));
            }
            assert_eq!(
                workload.invoke(conn.as_mut(), &read()).await.unwrap(),
                Outcome::Ok(initial)
            );
        }
    }

    #[tokio::test]
    async fn test_negatives_allowed() {
        let workload = bank(true);
        let (_cluster, mut conn) = fresh(&workload).await;
        let outcome = workload.invoke(conn.as_mut(), &transfer(1, 2, 7)).await.unwrap();
        assert!(outcome.is_ok());
        assert_eq!(
            workload.invoke(conn.as_mut(), &read()).await.unwrap(),
            Outcome::Ok(json!({"0": 100, "1": -7, "2": 7, "3": 0, "4": 0}))
        );
    }

    #[tokio::test]
    async fn test_multi_bank_tables() {
        let workload = multi_bank(false);
        let (cluster, mut conn) = fresh(&workload).await;
        let names = cluster.table_names().await;
        assert_eq!(names.len(), 5);
        assert!(names.contains(&"accounts4".to_string()));

        workload.teardown(conn.as_mut()).await.unwrap();
        assert!(cluster.table_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_transfer_rolls_back() {
        let workload = bank(false);
        let (cluster, mut conn) = fresh(&workload).await;
        // The first write of the transfer fails after both reads succeeded.
        cluster.inject(
            faultline_client::InjectPoint::Write,
            DriverError::Rollback("conflict".into()),
        );
        let err = workload
            .invoke(conn.as_mut(), &transfer(0, 1, 10))
            .await
            .unwrap_err();
        assert_eq!(err, DriverError::Rollback("conflict".into()));
        assert_eq!(
            workload.invoke(conn.as_mut(), &read()).await.unwrap(),
            Outcome::Ok(json!({"0": 100, "1": 0, "2": 0, "3": 0, "4": 0}))
        );
    }

    #[tokio::test]
    async fn test_unknown_function() {
        let workload = bank(false);
        let (_cluster, mut conn) = fresh(&workload).await;
        let op = Operation::invoke(ProcessId(0), "withdraw", Value::Null);
        let outcome = workload.invoke(conn.as_mut(), &op).await.unwrap();
        assert_eq!(outcome, Outcome::Fail(json!(["unknown-function", "withdraw"])));
    }

    #[test]
    fn test_config_validation() {
        assert!(BankConfig::default().validate().is_ok());
        let config = BankConfig {
            accounts: 1,
            ..BankConfig::default()
        };
        assert!(matches!(config.validate(), Err(WorkloadError::InvalidConfiguration(_))));
        assert!(BankWorkload::new(config, BankLayout::SingleTable).is_err());
    }

    #[test]
    fn test_names_and_invariant() {
        assert_eq!(bank(false).name(), "bank");
        assert_eq!(multi_bank(true).name(), "bank-multitable");
        let Invariant::TotalBalance { total, allow_negatives, accounts } = multi_bank(true).invariant()
        else {
            panic!("bank invariant must be a total balance");
        };
        assert_eq!(total, 100);
        assert!(allow_negatives);
        assert_eq!(accounts, vec![0, 1, 2, 3, 4]);
    }
}
