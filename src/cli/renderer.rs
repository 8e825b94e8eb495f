use colored::{control, ColoredString, Colorize};

use crate::core::chat::{ChatEvent, SendOutcome};
use crate::core::eligibility::Eligibility;
use crate::core::formatter::{
    format_balance_bar, format_credits, format_relative_time, format_signed_amount, format_weight,
};
use crate::core::gate::GateDecision;
use crate::core::models::balance::CreditBalance;
use crate::core::models::pricing::{AgentPricing, ChargePolicy};
use crate::core::models::transaction::CreditTransaction;

const BAR_WIDTH: usize = 12;

/// Render a balance block.
///
/// Layout:
/// ```text
///  Credits (user-1)
///   Balance   255 credits [████████████]
///   This period
///     Trial          5
///     Subscription   250
///   Rollover  eligible
/// ```
pub fn render_balance(
    user_id: &str,
    balance: &CreditBalance,
    low_threshold: i64,
    use_color: bool,
) -> String {
    control::set_override(use_color);

    let mut lines: Vec<String> = Vec::new();
    lines.push(format!(" Credits ({})", user_id).bold().to_string());

    let amount = color_by_balance(balance.balance, low_threshold, &format_credits(balance.balance));
    let bar = format_balance_bar(balance.balance, low_threshold, BAR_WIDTH);
    lines.push(format!("  {}   {} {}", "Balance".cyan(), amount, bar.magenta()));
    if balance.balance > 0 && balance.balance < low_threshold {
        lines.push(format!("            {}", "Running low, top up at /pricing".dimmed()));
    }

    let breakdown = [
        ("Trial", balance.trial_credits),
        ("Subscription", balance.subscription_credits),
        ("Top-up", balance.topup_credits),
    ];
    if breakdown.iter().any(|(_, v)| *v > 0) {
        lines.push(format!("  {}", "This period".cyan()));
        for (label, value) in breakdown.iter().filter(|(_, v)| *v > 0) {
            lines.push(format!("    {:<14} {}", label, value));
        }
    }

    let rollover = match (balance.rollover_eligible, balance.last_rollover) {
        (true, _) => "eligible".green().to_string(),
        (false, Some(at)) => format!("last {}", format_relative_time(&at)),
        (false, None) => "not eligible".dimmed().to_string(),
    };
    lines.push(format!("  {}  {}", "Rollover".cyan(), rollover));

    lines.join("\n")
}

pub fn render_eligibility(pricing: &AgentPricing, eligibility: &Eligibility, use_color: bool) -> String {
    control::set_override(use_color);

    let verdict = if eligibility.can_use {
        "can use".green()
    } else {
        "blocked".red()
    };
    let mut lines = vec![
        format!(" {} ({})", pricing.agent_id, verdict).bold().to_string(),
        format!("  {}    {}", "Weight".cyan(), format_weight(pricing.credit_weight)),
        format!("  {}  {}", "Required".cyan(), format_credits(eligibility.required)),
        format!("  {} {}", "Available".cyan(), format_credits(eligibility.available)),
    ];
    if !eligibility.can_use {
        lines.push(format!(
            "            {}",
            format!("Need {} more, top up at /pricing", format_credits(eligibility.shortfall())).dimmed()
        ));
    }
    lines.join("\n")
}

pub fn render_transactions(entries: &[CreditTransaction], loading: bool, use_color: bool) -> String {
    control::set_override(use_color);

    if entries.is_empty() {
        let text = if loading { " Loading transactions..." } else { " No transactions yet" };
        return text.dimmed().to_string();
    }
    let header = if loading { " Transactions (refreshing)" } else { " Transactions" };
    let mut lines = vec![header.bold().to_string()];
    for tx in entries {
        let amount = format!("{:>6}", format_signed_amount(tx.amount));
        let amount = if tx.kind.is_debit() { amount.red() } else { amount.green() };
        lines.push(format!(
            "  {:<10} {} {:<14} {}",
            format_relative_time(&tx.created_at).dimmed(),
            amount,
            tx.kind.display_name(),
            tx.description
        ));
    }
    lines.join("\n")
}

pub fn render_pricing(entries: &[AgentPricing], policy: ChargePolicy, use_color: bool) -> String {
    control::set_override(use_color);

    let mut lines = vec![format!(" Pricing ({})", policy.id()).bold().to_string()];
    if entries.is_empty() {
        lines.push(format!("  {}", "No agents configured, every agent costs 1 credit".dimmed()));
    }
    for p in entries {
        let charged = policy.debit_amount(p);
        let mut line = format!(
            "  {:<24} {:>5}  charged {}",
            p.agent_id.cyan(),
            format_weight(p.credit_weight),
            format_weight(charged)
        );
        if let Some(desc) = &p.description {
            line.push_str(&format!("  {}", desc.dimmed()));
        }
        lines.push(line);
    }
    lines.join("\n")
}

pub fn render_gate(agent_id: &str, decision: &GateDecision, use_color: bool) -> String {
    control::set_override(use_color);

    let verdict = match decision {
        GateDecision::Allow => "allow".green().to_string(),
        GateDecision::ShowPaywall {
            required,
            available,
        } => format!(
            "{} (need {}, have {})",
            "paywall".yellow(),
            format_credits(*required),
            format_credits(*available)
        ),
        GateDecision::Redirect { route } => format!("{} {}", "redirect".red(), route),
    };
    format!(" {}  {}", agent_id.bold(), verdict)
}

pub fn render_send_outcome(agent_id: &str, outcome: &SendOutcome, use_color: bool) -> String {
    control::set_override(use_color);

    match outcome {
        SendOutcome::Replied { reply, charged } => {
            let mut lines = vec![format!(" {}", agent_id.bold()), format!("  {}", reply.content)];
            if let Some(c) = charged {
                lines.push(format!(
                    "  {}",
                    format!(
                        "Charged {}, {} left",
                        format_weight(c.cost),
                        format_credits(c.new_balance)
                    )
                    .dimmed()
                ));
            }
            lines.join("\n")
        }
        SendOutcome::Busy { notice } => format!(" {}", notice.content.yellow()),
        other => {
            let notice = other.notice().map(|n| n.content.as_str()).unwrap_or_default();
            format!(" {}\n  {}", agent_id.bold(), notice.red())
        }
    }
}

/// One-line trace of a chat event, for `--verbose` output.
pub fn render_chat_event(event: &ChatEvent) -> String {
    match event {
        ChatEvent::MessageSent { agent_id, message } => {
            format!("sent to {} ({} chars)", agent_id, message.content.chars().count())
        }
        ChatEvent::ResponseReceived { agent_id, message } => {
            format!("reply from {} ({} chars)", agent_id, message.content.chars().count())
        }
        ChatEvent::DeductionFailed { agent_id, failure } => {
            format!("charge for {} failed: {}", agent_id, failure.kind())
        }
        ChatEvent::BalanceChanged { balance } => format!("balance now {}", format_credits(*balance)),
    }
}

fn color_by_balance(balance: i64, low_threshold: i64, text: &str) -> ColoredString {
    if balance <= 0 {
        text.red()
    } else if balance < low_threshold {
        text.yellow()
    } else {
        text.green()
    }
}
