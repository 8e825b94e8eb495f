use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::cli::output::{print_json, OutputOptions};
use crate::cli::renderer;
use crate::cli::session;
use crate::core::chat::{ChatFlow, SendOutcome, SessionStore};
use crate::core::config::AppConfig;
use crate::core::eligibility::Eligibility;
use crate::core::generator::{EchoGenerator, HttpGenerator, ResponseGenerator};
use crate::core::models::pricing::AgentPricing;

#[derive(Serialize)]
struct CheckPayload {
    agent_id: String,
    credit_weight: f64,
    #[serde(flatten)]
    eligibility: Eligibility,
}

pub async fn check(user: Option<&str>, agent_id: &str, opts: &OutputOptions) -> Result<()> {
    let session = session::open(user).await?;
    let eligibility = session.service.check_can_use_agent(agent_id).await;
    let pricing = session.service.get_agent_pricing(agent_id).await;

    if opts.is_json() {
        print_json(
            &CheckPayload {
                agent_id: agent_id.to_string(),
                credit_weight: pricing.credit_weight,
                eligibility,
            },
            opts,
        )?;
    } else {
        println!("{}", renderer::render_eligibility(&pricing, &eligibility, opts.use_color));
    }
    if !eligibility.can_use {
        std::process::exit(2);
    }
    Ok(())
}

fn build_generator(config: &AppConfig) -> Result<Arc<dyn ResponseGenerator>> {
    match &config.generator.endpoint {
        Some(endpoint) => Ok(Arc::new(HttpGenerator::new(
            endpoint,
            config.generator.model.clone(),
            config.generator.timeout(),
        )?)),
        None => {
            tracing::debug!("No generator endpoint configured, echoing messages");
            Ok(Arc::new(EchoGenerator))
        }
    }
}

pub async fn chat(user: Option<&str>, agent_id: &str, message: &str, opts: &OutputOptions) -> Result<()> {
    let session = session::open(user).await?;
    let sessions_path = AppConfig::data_dir().join("sessions.json");
    let store = SessionStore::open(sessions_path)
        .context("Failed to open chat sessions")?;
    let flow = ChatFlow::new(
        session.service.clone(),
        build_generator(&session.config)?,
        Arc::new(store),
    )
    .with_model(session.config.generator.model.clone());

    let mut events = flow.subscribe();
    let outcome = flow.send_message(agent_id, message).await?;
    let mut trace = Vec::new();
    while let Ok(event) = events.try_recv() {
        trace.push(event);
    }

    if opts.is_json() {
        let mut payload = outcome_json(agent_id, &outcome);
        payload["events"] = trace.iter().map(|e| e.kind()).collect();
        print_json(&payload, opts)?;
    } else {
        println!("{}", renderer::render_send_outcome(agent_id, &outcome, opts.use_color));
        if opts.verbose {
            for event in &trace {
                eprintln!("{}", renderer::render_chat_event(event));
            }
            if let SendOutcome::Replied { charged: Some(c), .. } = &outcome {
                eprintln!(
                    "transaction {} (key {})",
                    c.transaction_id.as_deref().unwrap_or("-"),
                    c.idempotency_key
                );
            }
        }
    }
    if !matches!(outcome, SendOutcome::Replied { .. }) {
        std::process::exit(1);
    }
    Ok(())
}

fn outcome_json(agent_id: &str, outcome: &SendOutcome) -> serde_json::Value {
    match outcome {
        SendOutcome::Replied { reply, charged } => serde_json::json!({
            "agent_id": agent_id,
            "status": "replied",
            "reply": reply,
            "charged": charged.as_ref().map(|c| serde_json::json!({
                "cost": c.cost,
                "new_balance": c.new_balance,
                "transaction_id": c.transaction_id,
                "idempotency_key": c.idempotency_key,
                "duplicate": c.duplicate,
            })),
        }),
        SendOutcome::Blocked { eligibility, notice } => serde_json::json!({
            "agent_id": agent_id,
            "status": "blocked",
            "eligibility": eligibility,
            "notice": notice.content,
        }),
        SendOutcome::DeductionFailed { failure, notice } => serde_json::json!({
            "agent_id": agent_id,
            "status": "deduction_failed",
            "failure": failure.kind(),
            "retryable": failure.is_retryable(),
            "reference": failure.reference(),
            "notice": notice.content,
        }),
        SendOutcome::GenerationFailed { notice, reference } => serde_json::json!({
            "agent_id": agent_id,
            "status": "generation_failed",
            "reference": reference,
            "notice": notice.content,
        }),
        SendOutcome::Busy { notice } => serde_json::json!({
            "agent_id": agent_id,
            "status": "busy",
            "notice": notice.content,
        }),
    }
}

pub async fn gate(
    user: Option<&str>,
    agent_id: &str,
    route: &str,
    allow_zero_credits: bool,
    opts: &OutputOptions,
) -> Result<()> {
    let session = session::open(user).await?;
    let decision = session.service.gate(agent_id, route, allow_zero_credits).await;

    if opts.is_json() {
        print_json(&decision, opts)?;
    } else {
        println!("{}", renderer::render_gate(agent_id, &decision, opts.use_color));
    }
    if !decision.is_allowed() {
        std::process::exit(2);
    }
    Ok(())
}

pub async fn pricing(agent_id: Option<&str>, opts: &OutputOptions) -> Result<()> {
    let session = session::open(None).await?;
    let policy = session.config.credits.charge_policy;
    let entries: Vec<AgentPricing> = match agent_id {
        Some(id) => vec![session.service.get_agent_pricing(id).await],
        None => session.service.configured_pricing(),
    };

    if opts.is_json() {
        return print_json(&entries, opts);
    }
    println!("{}", renderer::render_pricing(&entries, policy, opts.use_color));
    Ok(())
}
