use chrono::{DateTime, Utc};

/// Returns "1 credit" / "5 credits".
pub fn format_credits(amount: i64) -> String {
    if amount.abs() == 1 {
        format!("{} credit", amount)
    } else {
        format!("{} credits", amount)
    }
}

/// Returns "+250" for grants and "-1" for debits.
pub fn format_signed_amount(amount: i64) -> String {
    if amount > 0 {
        format!("+{}", amount)
    } else {
        amount.to_string()
    }
}

/// Returns a credit weight without trailing zeros: "1", "1.5", "0.25".
pub fn format_weight(weight: f64) -> String {
    let s = format!("{:.2}", weight);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Returns "just now", "5m ago", "3h ago", "2d ago", or the date for anything older than a week.
pub fn format_relative_time(at: &DateTime<Utc>) -> String {
    let seconds = (Utc::now() - *at).num_seconds();
    if seconds < 60 {
        return "just now".to_string();
    }
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;
    if hours == 0 {
        format!("{}m ago", minutes)
    } else if days == 0 {
        format!("{}h ago", hours)
    } else if days < 7 {
        format!("{}d ago", days)
    } else {
        at.format("%Y-%m-%d").to_string()
    }
}

/// Returns "[████████░░░░]" with the filled part showing `balance` against `full`.
pub fn format_balance_bar(balance: i64, full: i64, width: usize) -> String {
    let full = full.max(1);
    let ratio = (balance.max(0) as f64 / full as f64).min(1.0);
    let filled = (ratio * width as f64).round() as usize;
    format!(
        "[{}{}]",
        "█".repeat(filled),
        "░".repeat(width.saturating_sub(filled))
    )
}
