//! Self-contained example: a tiny bank ledger with two aggregates touched by
//! one command, a per-account balance view and a bank-wide totals view.
//!
//! Run with: `cargo run --example ledger`
//!
//! Set `RUST_LOG=replay_es=debug` to watch the catch-up worker.

use std::sync::Arc;
use std::time::Duration;

use replay_es::{
    Aggregate, Appliers, Command, CommandContext, CommandError, DispatcherConfig, DomainEvent,
    GlobalInstance, Runtime, SnapshotPolicy, UnitOfWork, View, ViewHandlers, ViewLocator,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Account aggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Account {
    holder: String,
    balance: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccountOpened {
    holder: String,
}

impl DomainEvent for AccountOpened {
    const EVENT_TYPE: &'static str = "AccountOpened";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MoneyDeposited {
    amount: u64,
}

impl DomainEvent for MoneyDeposited {
    const EVENT_TYPE: &'static str = "MoneyDeposited";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MoneyWithdrawn {
    amount: u64,
}

impl DomainEvent for MoneyWithdrawn {
    const EVENT_TYPE: &'static str = "MoneyWithdrawn";
}

impl Aggregate for Account {
    const OWNER: &'static str = "account";

    fn register_appliers(appliers: &mut Appliers<Self>) {
        appliers
            .on::<AccountOpened>(|a, e| a.holder.clone_from(&e.holder))
            .on::<MoneyDeposited>(|a, e| a.balance += e.amount)
            .on::<MoneyWithdrawn>(|a, e| a.balance -= e.amount);
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
enum LedgerError {
    #[error("account {0} has insufficient funds")]
    InsufficientFunds(String),
}

#[derive(Debug)]
struct Open {
    account: String,
    holder: String,
    initial: u64,
}

impl Command for Open {
    type Error = LedgerError;

    fn execute(&self, uow: &mut UnitOfWork) -> Result<(), CommandError<LedgerError>> {
        let account = uow.create::<Account>(&self.account)?;
        account.emit(AccountOpened {
            holder: self.holder.clone(),
        })?;
        if self.initial > 0 {
            account.emit(MoneyDeposited {
                amount: self.initial,
            })?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Transfer {
    from: String,
    to: String,
    amount: u64,
}

impl Command for Transfer {
    type Error = LedgerError;

    fn execute(&self, uow: &mut UnitOfWork) -> Result<(), CommandError<LedgerError>> {
        let from = uow.load::<Account>(&self.from)?;
        if from.state().balance < self.amount {
            return Err(CommandError::Domain(LedgerError::InsufficientFunds(
                self.from.clone(),
            )));
        }
        from.emit(MoneyWithdrawn {
            amount: self.amount,
        })?;
        uow.load::<Account>(&self.to)?.emit(MoneyDeposited {
            amount: self.amount,
        })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// One document per account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Statement {
    holder: String,
    balance: u64,
    lines: Vec<i64>,
}

impl View for Statement {
    const NAME: &'static str = "statement";

    fn register_handlers(handlers: &mut ViewHandlers<Self>) {
        handlers
            .on::<AccountOpened>(|s, e| s.holder.clone_from(&e.holder))
            .on::<MoneyDeposited>(|s, e| {
                s.balance += e.amount;
                s.lines.push(i64::try_from(e.amount).unwrap_or(i64::MAX));
            })
            .on::<MoneyWithdrawn>(|s, e| {
                s.balance -= e.amount;
                s.lines.push(-i64::try_from(e.amount).unwrap_or(i64::MAX));
            });
    }
}

/// A single document for the whole bank.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BankTotals {
    accounts: u32,
    transfers_touching: u32,
}

impl View for BankTotals {
    const NAME: &'static str = "bank-totals";

    fn register_handlers(handlers: &mut ViewHandlers<Self>) {
        handlers
            .on::<AccountOpened>(|t, _| t.accounts += 1)
            .on_with_context::<MoneyWithdrawn>(|t, ctx, _| {
                // A transfer is one batch; count it once, on its withdrawal.
                if ctx.batch().len() > 1 {
                    t.transfers_touching += 1;
                }
                Ok(())
            });
    }

    fn locator() -> Arc<dyn ViewLocator> {
        Arc::new(GlobalInstance)
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Views and snapshots land here; the event log itself stays in memory.
    let tmp = tempfile::tempdir()?;

    let runtime = Runtime::builder()
        .base_dir(tmp.path())
        .aggregate::<Account>()
        .view::<Statement>()
        .view::<BankTotals>()
        .snapshots(SnapshotPolicy::default())
        .dispatcher_config(DispatcherConfig {
            catch_up_interval: Duration::from_millis(200),
            ..DispatcherConfig::default()
        })
        .build()?;

    let ctx = CommandContext::default().with_actor("demo");

    runtime.process_with_context(
        &Open {
            account: "acc-1".into(),
            holder: "Ada".into(),
            initial: 100,
        },
        ctx.clone(),
    )?;
    runtime.process_with_context(
        &Open {
            account: "acc-2".into(),
            holder: "Brook".into(),
            initial: 0,
        },
        ctx.clone(),
    )?;
    let last = runtime.process_with_context(
        &Transfer {
            from: "acc-1".into(),
            to: "acc-2".into(),
            amount: 40,
        },
        ctx.clone(),
    )?;

    match runtime.process_with_context(
        &Transfer {
            from: "acc-2".into(),
            to: "acc-1".into(),
            amount: 500,
        },
        ctx,
    ) {
        Err(e) if e.is_domain() => println!("rejected: {e}"),
        other => panic!("expected a domain rejection, got {other:?}"),
    }

    // Read-your-writes: block until both views have applied the transfer.
    runtime
        .wait_until_processed(&last, Duration::from_secs(5))
        .await?;

    let statements = runtime
        .view::<Statement>()
        .ok_or("statement view not registered")?;
    for id in ["acc-1", "acc-2"] {
        if let Some(s) = statements.load(id)? {
            println!("{id} ({}) balance={} lines={:?}", s.holder, s.balance, s.lines);
        }
    }

    let totals = runtime
        .view::<BankTotals>()
        .ok_or("totals view not registered")?
        .load(replay_es::locator::GLOBAL_INSTANCE_ID)?
        .unwrap_or_default();
    println!(
        "accounts={} transfers={}",
        totals.accounts, totals.transfers_touching
    );

    let acc1 = runtime.repository().load::<Account>("acc-1")?;
    assert_eq!(acc1.balance, 60);
    assert_eq!(totals.accounts, 2);
    assert_eq!(totals.transfers_touching, 1);

    runtime.shutdown();
    println!("all assertions passed");
    Ok(())
}
