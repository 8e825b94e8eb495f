use serde::Serialize;

use crate::core::models::balance::CreditBalance;

/// Routes a user with too few credits may still visit.
pub const LOW_CREDIT_ROUTES: &[&str] = &["/pricing", "/success", "/profile"];

/// Where an insufficient-credit user is sent when the paywall cannot be shown in place.
pub const PRICING_ROUTE: &str = "/pricing";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Allow,
    ShowPaywall { required: i64, available: i64 },
    Redirect { route: String },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Classify a priced action. `balance` is `None` for unauthenticated users.
pub fn decide(
    required: i64,
    balance: Option<&CreditBalance>,
    route: &str,
    allow_zero_credits: bool,
) -> GateDecision {
    let Some(balance) = balance else {
        return GateDecision::Allow;
    };
    let available = balance.balance.max(0);
    if available >= required || is_low_credit_route(route) {
        return GateDecision::Allow;
    }
    if allow_zero_credits {
        GateDecision::ShowPaywall {
            required,
            available,
        }
    } else {
        GateDecision::Redirect {
            route: PRICING_ROUTE.to_string(),
        }
    }
}

pub fn is_low_credit_route(route: &str) -> bool {
    let route = route.split(['?', '#']).next().unwrap_or_default();
    LOW_CREDIT_ROUTES.iter().any(|allowed| {
        route == *allowed
            || route
                .strip_prefix(allowed)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthenticated_user_is_never_blocked() {
        for route in ["/", "/agents/x", "/pricing"] {
            assert_eq!(decide(1, None, route, false), GateDecision::Allow);
            assert_eq!(decide(1, None, route, true), GateDecision::Allow);
        }
    }

    #[test]
    fn sufficient_balance_is_allowed() {
        let b = CreditBalance::trial(5);
        assert!(decide(5, Some(&b), "/agents/x", false).is_allowed());
    }

    #[test]
    fn insufficient_balance_shows_paywall_in_place() {
        let b = CreditBalance::trial(0);
        assert_eq!(
            decide(1, Some(&b), "/agents/x", true),
            GateDecision::ShowPaywall {
                required: 1,
                available: 0
            }
        );
    }

    #[test]
    fn insufficient_balance_redirects_to_pricing() {
        let b = CreditBalance::trial(1);
        assert_eq!(
            decide(2, Some(&b), "/", false),
            GateDecision::Redirect {
                route: "/pricing".into()
            }
        );
    }

    #[test]
    fn low_credit_routes_stay_reachable() {
        let b = CreditBalance::trial(0);
        for route in ["/pricing", "/success?session_id=cs_1", "/profile/settings"] {
            assert!(decide(1, Some(&b), route, false).is_allowed(), "{}", route);
        }
    }

    #[test]
    fn route_prefix_must_end_on_segment_boundary() {
        assert!(!is_low_credit_route("/pricingx"));
        assert!(!is_low_credit_route("/agents/pricing"));
        assert!(is_low_credit_route("/profile#billing"));
    }
}
