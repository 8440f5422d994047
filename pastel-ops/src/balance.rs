//! Wallet balance reconciliation before ticket registration
//!
//! This module handles:
//! - Fresh local/remote balance snapshots
//! - Deciding between proceeding, asking the operator to fund, or
//!   transferring from the cold wallet
//! - Waiting for the hot wallet to be funded, handing control back to the
//!   operator after a fixed number of misses

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::PollingConfig;
use crate::daemon::{parse_balance, NodeTools};
use crate::errors::OpsError;
use crate::execution::CommandRunner;
use crate::session::RemoteSession;
use crate::wizard::Operator;

/// Minimum hot wallet balance (PSL) for a masternode ticket
pub const MIN_TICKET_BALANCE: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalancePolicy {
    pub minimum: f64,
    pub interval: Duration,
    /// Consecutive misses before the operator is asked whether to keep waiting
    pub reprompt_after: u32,
}

impl BalancePolicy {
    pub fn from_config(polling: &PollingConfig) -> Self {
        Self {
            minimum: MIN_TICKET_BALANCE,
            interval: Duration::from_secs(polling.balance_interval_secs),
            reprompt_after: polling.balance_reprompt_after.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceSnapshot {
    pub local: f64,
    pub remote: f64,
    pub minimum: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingAction {
    Proceed,
    /// Neither wallet can cover the minimum
    AskToFund,
    /// Cold wallet can cover the hot one
    Transfer,
}

impl BalanceSnapshot {
    pub fn decide(&self) -> FundingAction {
        if self.remote >= self.minimum {
            FundingAction::Proceed
        } else if self.local >= self.minimum {
            FundingAction::Transfer
        } else {
            FundingAction::AskToFund
        }
    }
}

pub struct BalanceReconciler<'a> {
    pub runner: &'a dyn CommandRunner,
    pub session: &'a dyn RemoteSession,
    pub local: &'a NodeTools,
    pub remote: &'a NodeTools,
    pub operator: &'a dyn Operator,
    pub policy: BalancePolicy,
}

impl<'a> BalanceReconciler<'a> {
    /// Returns the snapshot once the hot wallet holds the minimum
    pub async fn reconcile(&self) -> Result<BalanceSnapshot, OpsError> {
        let snapshot = self.snapshot().await?;
        info!(
            local = snapshot.local,
            remote = snapshot.remote,
            minimum = snapshot.minimum,
            "Wallet balances"
        );

        match snapshot.decide() {
            FundingAction::Proceed => return Ok(snapshot),
            FundingAction::AskToFund => {
                let address = self.remote_address().await?;
                self.operator.notify(&format!(
                    "Both wallets hold less than {} PSL. Send at least {} PSL to the hot node address {}",
                    self.policy.minimum, self.policy.minimum, address
                ));
                if !self.operator.confirm("Wait for the hot node wallet to be funded?", true)? {
                    return Err(OpsError::OperatorAbort);
                }
            }
            FundingAction::Transfer => {
                let address = self.remote_address().await?;
                let question = format!(
                    "Hot node wallet holds {} PSL. Transfer {} PSL from the local wallet to {}?",
                    snapshot.remote, self.policy.minimum, address
                );
                if !self.operator.confirm(&question, true)? {
                    return Err(OpsError::OperatorAbort);
                }
                let txid = self
                    .runner
                    .run(&self.local.send_to_address(&address, self.policy.minimum))
                    .await?;
                info!(txid = %txid, "Transfer to hot node submitted");
            }
        }

        let remote = self.wait_for_funding().await?;
        Ok(BalanceSnapshot { remote, ..snapshot })
    }

    pub async fn snapshot(&self) -> Result<BalanceSnapshot, OpsError> {
        let remote = self.remote_balance().await?;
        let invocation = self.local.get_balance();
        let output = self.runner.run(&invocation).await?;
        let local = parse_balance(&invocation.to_shell(), &output)?;

        Ok(BalanceSnapshot {
            local,
            remote,
            minimum: self.policy.minimum,
        })
    }

    async fn remote_balance(&self) -> Result<f64, OpsError> {
        let command = self.remote.get_balance().to_shell();
        let output = self.session.run(&command).await?;
        parse_balance(&command, &output)
    }

    async fn remote_address(&self) -> Result<String, OpsError> {
        let command = self.remote.get_new_address().to_shell();
        let address = self.session.run(&command).await?;
        if address.is_empty() {
            return Err(OpsError::Parse {
                command,
                detail: "empty address".to_string(),
            });
        }
        Ok(address)
    }

    async fn wait_for_funding(&self) -> Result<f64, OpsError> {
        let mut misses = 0u32;
        loop {
            tokio::time::sleep(self.policy.interval).await;

            match self.remote_balance().await {
                Ok(balance) if balance >= self.policy.minimum => {
                    info!(balance, "Hot node wallet funded");
                    return Ok(balance);
                }
                Ok(balance) => debug!(balance, "Hot node wallet not funded yet"),
                Err(OpsError::Command { output, .. }) => warn!("Balance query failed: {}", output),
                Err(e) => return Err(e),
            }

            misses += 1;
            if misses < self.policy.reprompt_after {
                continue;
            }
            if !self.operator.is_interactive() {
                return Err(OpsError::Timeout {
                    what: "hot node wallet funding".to_string(),
                    attempts: misses,
                });
            }
            if !self.operator.confirm("Hot node wallet is still not funded. Keep waiting?", true)? {
                return Err(OpsError::OperatorAbort);
            }
            misses = 0;
        }
    }
}
