//! Self-contained example demonstrating aggregate registration, command
//! execution, and a sessioned transfer against a `verso-db` gRPC server.
//!
//! Run with: `cargo run --example banking`
//!
//! **Requires** a running `verso-db` server on `http://127.0.0.1:7626`.

use serde::{Deserialize, Serialize};
use verso_es::{
    Aggregate, AggregateManagerBuilder, BoxError, Command, DomainEvent, Event, EventRegistration,
    PendingEvent, RelationQuery,
};

const TENANT: &str = "acme";

// ---------------------------------------------------------------------------
// Account aggregate
// ---------------------------------------------------------------------------

/// A bank account holding a balance in cents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Account {
    account_id: String,
    owner: String,
    balance: i64,
}

impl Aggregate for Account {
    const AGGREGATE_TYPE: &'static str = "account";
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct AccountOpened {
    account_id: String,
    owner: String,
}

impl Event for AccountOpened {
    const EVENT_TYPE: &'static str = "com.verso.banking.AccountOpened";
    const EVENT_VERSION: &'static str = "1";
}

#[derive(Debug, Serialize, Deserialize)]
struct FundsDeposited {
    amount: i64,
}

impl Event for FundsDeposited {
    const EVENT_TYPE: &'static str = "FundsDeposited";
    const EVENT_VERSION: &'static str = "1";
}

#[derive(Debug, Serialize, Deserialize)]
struct FundsWithdrawn {
    amount: i64,
}

impl Event for FundsWithdrawn {
    const EVENT_TYPE: &'static str = "FundsWithdrawn";
    const EVENT_VERSION: &'static str = "1";
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

struct OpenAccount {
    tenant_id: String,
    command_id: String,
    account_id: String,
    owner: String,
}

impl Command for OpenAccount {
    const COMMAND_TYPE: &'static str = "OpenAccount";

    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    fn command_id(&self) -> &str {
        &self.command_id
    }

    fn aggregate_id(&self) -> &str {
        &self.account_id
    }
}

struct Deposit {
    tenant_id: String,
    command_id: String,
    account_id: String,
    amount: i64,
}

impl Command for Deposit {
    const COMMAND_TYPE: &'static str = "Deposit";

    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    fn command_id(&self) -> &str {
        &self.command_id
    }

    fn aggregate_id(&self) -> &str {
        &self.account_id
    }
}

struct Withdraw {
    tenant_id: String,
    command_id: String,
    account_id: String,
    amount: i64,
}

impl Command for Withdraw {
    const COMMAND_TYPE: &'static str = "Withdraw";

    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    fn command_id(&self) -> &str {
        &self.command_id
    }

    fn aggregate_id(&self) -> &str {
        &self.account_id
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

impl Account {
    fn open(&self, cmd: &OpenAccount) -> Result<Vec<PendingEvent>, BoxError> {
        let opened = AccountOpened {
            account_id: cmd.account_id.clone(),
            owner: cmd.owner.clone(),
        };
        let envelope =
            DomainEvent::from_event(&cmd.tenant_id, &cmd.command_id, &cmd.account_id, &opened)?;
        Ok(vec![PendingEvent::create(envelope)])
    }

    fn deposit(&self, cmd: &Deposit) -> Result<Vec<PendingEvent>, BoxError> {
        if cmd.amount <= 0 {
            return Err("deposit amount must be positive".into());
        }
        let deposited = FundsDeposited { amount: cmd.amount };
        let envelope =
            DomainEvent::from_event(&cmd.tenant_id, &cmd.command_id, &cmd.account_id, &deposited)?;
        Ok(vec![PendingEvent::apply(envelope)])
    }

    fn withdraw(&self, cmd: &Withdraw) -> Result<Vec<PendingEvent>, BoxError> {
        if cmd.amount > self.balance {
            return Err(format!(
                "insufficient funds: balance {} < {}",
                self.balance, cmd.amount
            )
            .into());
        }
        let withdrawn = FundsWithdrawn { amount: cmd.amount };
        let envelope =
            DomainEvent::from_event(&cmd.tenant_id, &cmd.command_id, &cmd.account_id, &withdrawn)?;
        Ok(vec![PendingEvent::apply(envelope)])
    }

    fn when_opened(&mut self, event: AccountOpened) -> Result<(), BoxError> {
        self.account_id = event.account_id;
        self.owner = event.owner;
        Ok(())
    }

    fn when_deposited(&mut self, event: FundsDeposited) -> Result<(), BoxError> {
        self.balance += event.amount;
        Ok(())
    }

    fn when_withdrawn(&mut self, event: FundsWithdrawn) -> Result<(), BoxError> {
        self.balance -= event.amount;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let manager = AggregateManagerBuilder::new()
        .endpoint("http://127.0.0.1:7626")
        .event::<AccountOpened>(EventRegistration::new().relation("owner"))?
        .event::<FundsDeposited>(EventRegistration::new())?
        .event::<FundsWithdrawn>(EventRegistration::new())?
        .aggregate::<Account, _>(|handlers| {
            handlers.on_event::<AccountOpened, _>(Account::when_opened)?;
            handlers.on_event::<FundsDeposited, _>(Account::when_deposited)?;
            handlers.on_event::<FundsWithdrawn, _>(Account::when_withdrawn)?;
            handlers.on_create_command::<OpenAccount, _>(Account::open)?;
            handlers.on_command::<Deposit, _>(Account::deposit)?;
            handlers.on_command::<Withdraw, _>(Account::withdraw)
        })?
        .build()?;

    // Open two accounts and fund the first.
    let mut alpha = Account::default();
    let open_alpha = OpenAccount {
        tenant_id: TENANT.into(),
        command_id: "cmd-1".into(),
        account_id: "alpha".into(),
        owner: "Ada".into(),
    };
    manager.create(None, &open_alpha, &mut alpha).await?;

    let fund_alpha = Deposit {
        tenant_id: TENANT.into(),
        command_id: "cmd-2".into(),
        account_id: "alpha".into(),
        amount: 10_000,
    };
    manager.command(None, &fund_alpha, &mut alpha).await?;

    let mut beta = Account::default();
    let open_beta = OpenAccount {
        tenant_id: TENANT.into(),
        command_id: "cmd-3".into(),
        account_id: "beta".into(),
        owner: "Grace".into(),
    };
    manager.create(None, &open_beta, &mut beta).await?;

    // An overdraft is rejected by the command handler before anything is
    // recorded.
    let overdraft = Withdraw {
        tenant_id: TENANT.into(),
        command_id: "cmd-4".into(),
        account_id: "alpha".into(),
        amount: 99_000,
    };
    let rejected = manager.command(None, &overdraft, &mut alpha).await;
    println!("overdraft rejected: {}", rejected.unwrap_err());

    // Move 2_500 from alpha to beta under one session: both events stage
    // in the buffer and reach the store together at commit.
    let sessions = manager.sessions();
    let session = sessions.begin(TENANT)?;
    let withdraw = Withdraw {
        tenant_id: TENANT.into(),
        command_id: "cmd-5".into(),
        account_id: "alpha".into(),
        amount: 2_500,
    };
    let deposit = Deposit {
        tenant_id: TENANT.into(),
        command_id: "cmd-6".into(),
        account_id: "beta".into(),
        amount: 2_500,
    };
    manager.command(Some(&session), &withdraw, &mut alpha).await?;
    manager.command(Some(&session), &deposit, &mut beta).await?;
    sessions.commit(&session).await?;

    println!("alpha: owner={}, balance={}", alpha.owner, alpha.balance);
    println!("beta:  owner={}, balance={}", beta.owner, beta.balance);

    // Reload from the store and query the relation index built from the
    // `owner` field of AccountOpened.
    let mut fresh = Account::default();
    let found = manager.load(TENANT, "alpha", &mut fresh).await?;
    let owners = manager
        .get_relations(RelationQuery {
            tenant_id: TENANT.into(),
            aggregate_type: "account".into(),
            filter: String::new(),
            sort: String::new(),
            page_num: 1,
            page_size: 20,
        })
        .await?;
    println!("relation rows: {}", owners.relations.len());

    // Verify expected values.
    assert!(found, "alpha should exist after its events committed");
    assert_eq!(alpha.balance, 7_500, "10_000 in, 2_500 out");
    assert_eq!(beta.balance, 2_500);
    assert_eq!(fresh.balance, alpha.balance, "reload agrees with the fold");

    println!("all assertions passed");

    Ok(())
}
