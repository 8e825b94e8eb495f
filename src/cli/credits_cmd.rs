use anyhow::Result;
use serde::Serialize;

use crate::cli::output::{print_json, OutputOptions};
use crate::cli::renderer;
use crate::cli::session;
use crate::core::models::balance::CreditBalance;
use crate::core::models::deduction::AddCreditsRequest;
use crate::core::models::transaction::TransactionType;
use crate::core::models::user::UserId;

#[derive(Serialize)]
struct BalancePayload<'a> {
    user_id: &'a str,
    #[serde(flatten)]
    balance: CreditBalance,
    has_credits: bool,
    low_balance: bool,
}

pub async fn balance(user: Option<&str>, opts: &OutputOptions) -> Result<()> {
    let (session, user) = session::open_signed_in(user).await?;
    let service = &session.service;
    let Some(balance) = service.balance() else {
        eprintln!("No balance available for {}", user);
        std::process::exit(1);
    };

    if opts.is_json() {
        return print_json(
            &BalancePayload {
                user_id: user.as_str(),
                balance,
                has_credits: service.has_credits(),
                low_balance: service.is_low_balance(),
            },
            opts,
        );
    }
    println!(
        "{}",
        renderer::render_balance(
            user.as_str(),
            &balance,
            service.low_balance_threshold(),
            opts.use_color
        )
    );
    Ok(())
}

pub async fn history(user: Option<&str>, limit: Option<usize>, opts: &OutputOptions) -> Result<()> {
    let (session, _user) = session::open_signed_in(user).await?;
    let mut entries = session.service.transactions();
    if let Some(limit) = limit {
        entries.truncate(limit);
    }

    if opts.is_json() {
        return print_json(&entries, opts);
    }
    println!(
        "{}",
        renderer::render_transactions(&entries, session.service.loading_transactions(), opts.use_color)
    );
    Ok(())
}

pub async fn grant(
    user: Option<&str>,
    target: Option<String>,
    amount: i64,
    kind: &str,
    description: Option<String>,
    opts: &OutputOptions,
) -> Result<()> {
    let Some(kind) = TransactionType::from_id(kind) else {
        eprintln!("Unknown transaction type: '{}'", kind);
        std::process::exit(1);
    };
    if kind == TransactionType::Usage {
        eprintln!("Usage entries are created by deductions, not grants");
        std::process::exit(1);
    }

    let session = session::open(user).await?;
    let target = match target.map(UserId::new).or(session.user.clone()) {
        Some(t) => t,
        None => {
            eprintln!("No target user. Pass --to <id> or --user <id>.");
            std::process::exit(1);
        }
    };

    let request = AddCreditsRequest {
        user_id: target.clone(),
        amount,
        kind,
        description: description.unwrap_or_else(|| format!("{} credits", kind.display_name())),
        metadata: serde_json::Map::new(),
    };
    let applied = session.service.add_credits(&request).await?;

    if opts.is_json() {
        return print_json(
            &serde_json::json!({
                "user_id": target,
                "amount": amount,
                "type": kind,
                "applied": applied,
            }),
            opts,
        );
    }
    if applied {
        println!("Granted {} {} credits to {}", amount, kind.id(), target);
    } else {
        eprintln!("Ledger did not apply the grant");
        std::process::exit(1);
    }
    Ok(())
}
