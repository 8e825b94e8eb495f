use std::sync::Arc;

use anyhow::{Context, Result};

use crate::core::config::AppConfig;
use crate::core::models::user::UserId;
use crate::core::service::CreditService;

const USER_ENV: &str = "CREDMETER_USER";

/// Loaded configuration plus a credit service signed in as the CLI user.
pub struct Session {
    pub config: AppConfig,
    pub service: Arc<CreditService>,
    pub user: Option<UserId>,
}

/// `--user` wins over `CREDMETER_USER`; blank values count as absent.
pub fn resolve_user(flag: Option<&str>) -> Option<UserId> {
    flag.map(str::to_string)
        .or_else(|| std::env::var(USER_ENV).ok())
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .map(UserId::new)
}

pub async fn open(user_flag: Option<&str>) -> Result<Session> {
    let config = AppConfig::load().context("Failed to load config")?;
    let service = Arc::new(CreditService::from_config(&config)?);
    let user = resolve_user(user_flag);
    service
        .on_auth_change(user.clone())
        .await
        .context("Failed to load credit balance")?;
    Ok(Session {
        config,
        service,
        user,
    })
}

/// Like [`open`] but refuses to continue without a user.
pub async fn open_signed_in(user_flag: Option<&str>) -> Result<(Session, UserId)> {
    let session = open(user_flag).await?;
    match session.user.clone() {
        Some(user) => Ok((session, user)),
        None => {
            eprintln!("No user given. Pass --user <id> or set {}.", USER_ENV);
            std::process::exit(1);
        }
    }
}
