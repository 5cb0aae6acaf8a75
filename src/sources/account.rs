use serde::{Deserialize, Serialize};

use crate::config::WickConfig;
use crate::sync::keyring;

pub const GOOGLE_PROVIDER: &str = "google";

/// An online account as configured by the user.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Account {
    pub id: String,
    pub provider_type: String,
    pub provider_name: String,
    pub provider_icon: String,
    pub tasks_enabled: bool,
    /// OAuth2 access token. Normally kept in the keyring, not in the config file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Account {
    pub fn google(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider_type: GOOGLE_PROVIDER.to_string(),
            provider_name: name.into(),
            provider_icon: GOOGLE_PROVIDER.to_string(),
            tasks_enabled: true,
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Only Google accounts with tasks turned on and a token can back a source.
    pub fn is_valid(&self) -> bool {
        self.provider_type == GOOGLE_PROVIDER
            && self.tasks_enabled
            && self.token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum AccountEvent {
    Added(Account),
    /// Carries the account id.
    Removed(String),
    Changed(Account),
}

/// Accounts from the config, with tokens filled in from the keyring where
/// one is stored. A keyring token takes precedence over one in the file.
pub async fn discover_accounts(config: &WickConfig) -> Vec<Account> {
    let mut accounts = Vec::with_capacity(config.accounts.len());
    for account in &config.accounts {
        let mut account = account.clone();
        match keyring::load_token(&account.id).await {
            Ok(Some(token)) => account.token = Some(token),
            Ok(None) => {}
            Err(e) => log::warn!("Keyring lookup for account {} failed: {}", account.id, e),
        }
        if !account.is_valid() {
            log::info!(
                "Account {} ({}) cannot be synced",
                account.id,
                account.provider_name
            );
        }
        accounts.push(account);
    }
    accounts
}
