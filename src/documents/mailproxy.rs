//! Mail-proxy documents: client side of one user account.

use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

use super::{Logging, Management, validate_addresses, validate_data_dir};
use crate::error::ClusterError;
use crate::identity::{PublicKey, SecretKey};

pub const MAILPROXY_LOG_FILE: &str = "mailproxy.log";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProxySection {
    #[serde(rename = "POP3Address")]
    pub pop3_address: String,
    #[serde(rename = "SMTPAddress")]
    pub smtp_address: String,
    pub data_dir: PathBuf,
}

/// One account. The link and identity keys are the same x25519 secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Account {
    pub user: String,
    pub provider: String,
    pub link_key: SecretKey,
    pub identity_key: SecretKey,
}

impl Account {
    pub fn address(&self) -> String {
        format!("{}@{}", self.user, self.provider)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MailProxyConfig {
    pub proxy: ProxySection,
    pub logging: Logging,
    pub management: Management,
    #[serde(rename = "Account", default)]
    pub accounts: Vec<Account>,
    /// `user@provider` → public key of every known recipient.
    #[serde(default)]
    pub recipients: BTreeMap<String, PublicKey>,
}

impl MailProxyConfig {
    /// Name used as log prefix and data dir: `mailproxy-<user>@<provider>`.
    pub fn display_name(&self) -> String {
        self.proxy
            .data_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mailproxy".to_string())
    }

    pub fn fixup_and_validate(&mut self) -> Result<(), ClusterError> {
        let id = self.display_name();
        validate_addresses(
            &id,
            &[self.proxy.pop3_address.clone(), self.proxy.smtp_address.clone()],
        )?;
        if self.proxy.pop3_address == self.proxy.smtp_address {
            return Err(ClusterError::config(&id, "POP3 and SMTP share an address"));
        }
        validate_data_dir(&id, &self.proxy.data_dir)?;
        self.logging.fixup(&id, MAILPROXY_LOG_FILE)?;
        self.management.fixup(&self.proxy.data_dir);

        if self.accounts.is_empty() {
            return Err(ClusterError::config(&id, "no accounts configured"));
        }
        for account in &self.accounts {
            if account.user.is_empty() || account.provider.is_empty() {
                return Err(ClusterError::config(&id, "account needs both user and provider"));
            }
            if account.link_key != account.identity_key {
                return Err(ClusterError::config(
                    &id,
                    format!("account {} must reuse its link key as identity key", account.address()),
                ));
            }
        }
        if let Some(bad) = self.recipients.keys().find(|r| !r.contains('@')) {
            return Err(ClusterError::config(
                &id,
                format!("recipient '{bad}' is not user@provider"),
            ));
        }
        Ok(())
    }
}
