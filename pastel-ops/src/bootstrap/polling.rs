//! Bounded polling over detached daemons
//!
//! A daemon launched detached gives no completion signal; the only way to
//! learn it is up (or down, or synced) is to ask it repeatedly. Each loop has
//! a fixed attempt budget and a fixed sleep between attempts.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::daemon::{is_live, MnSyncStatus, NodeTools};
use crate::errors::OpsError;
use crate::execution::CommandRunner;
use crate::session::RemoteSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollBudget {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

/// Run `check` until `done` accepts its result, at most `budget.attempts`
/// times. A failed command counts as a miss; any other error ends the loop.
pub async fn poll_until<T, F, Fut, P>(what: &str, budget: PollBudget, mut check: F, done: P) -> Result<T, OpsError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OpsError>>,
    P: Fn(&T) -> bool,
{
    for attempt in 1..=budget.attempts {
        match check().await {
            Ok(value) if done(&value) => {
                debug!("{} satisfied after {} attempt(s)", what, attempt);
                return Ok(value);
            }
            Ok(_) => debug!("{}: attempt {}/{} not yet", what, attempt, budget.attempts),
            Err(OpsError::Command { output, .. }) => {
                debug!("{}: attempt {}/{} failed: {}", what, attempt, budget.attempts, output)
            }
            Err(e) => return Err(e),
        }

        if attempt < budget.attempts {
            tokio::time::sleep(budget.interval).await;
        }
    }

    Err(OpsError::Timeout {
        what: what.to_string(),
        attempts: budget.attempts,
    })
}

/// Poll one command over an open session until `accept` likes its output
pub async fn poll_session<P>(
    session: &dyn RemoteSession,
    what: &str,
    command: &str,
    budget: PollBudget,
    accept: P,
) -> Result<String, OpsError>
where
    P: Fn(&str) -> bool,
{
    poll_until(what, budget, move || session.run(command), |out: &String| accept(out)).await
}

pub async fn wait_remote_live(session: &dyn RemoteSession, tools: &NodeTools, budget: PollBudget) -> Result<(), OpsError> {
    let command = tools.get_info().to_shell();
    poll_session(session, "remote pasteld liveness", &command, budget, is_live)
        .await
        .map(|_| ())
}

/// Waits for the daemon to be gone after a `stop`. The RPC server goes away
/// well before the process releases the data directory lock, so a failing
/// `getinfo` is only half the answer: the process itself must be gone too.
pub async fn wait_remote_down(session: &dyn RemoteSession, tools: &NodeTools, budget: PollBudget) -> Result<(), OpsError> {
    let rpc = tools.get_info().to_shell();
    let process = tools.process_check().to_shell();
    let (rpc, process) = (rpc.as_str(), process.as_str());
    poll_until(
        "remote pasteld shutdown",
        budget,
        move || async move {
            match session.run(rpc).await {
                Ok(output) if is_live(&output) => return Ok(false),
                Ok(_) | Err(OpsError::Command { .. }) => {}
                Err(e) => return Err(e),
            }
            match session.run(process).await {
                Ok(pids) => {
                    debug!("pasteld still running: {}", pids);
                    Ok(false)
                }
                Err(OpsError::Command { .. }) => Ok(true),
                Err(e) => Err(e),
            }
        },
        |down: &bool| *down,
    )
    .await
    .map(|_| ())
}

pub async fn wait_remote_synced(session: &dyn RemoteSession, tools: &NodeTools, budget: PollBudget) -> Result<(), OpsError> {
    let command = tools.mnsync_status().to_shell();
    poll_session(session, "remote masternode sync", &command, budget, |out| {
        MnSyncStatus::parse(out).map_or(false, |status| status.is_synced())
    })
    .await
    .map(|_| ())
}

pub async fn wait_local_live(runner: &dyn CommandRunner, tools: &NodeTools, budget: PollBudget) -> Result<(), OpsError> {
    let invocation = tools.get_info();
    let invocation = &invocation;
    poll_until("local pasteld liveness", budget, move || runner.run(invocation), |out: &String| is_live(out))
        .await
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteConfig;
    use crate::daemon::Network;
    use crate::testing::{command_failed, endpoint, respond, SessionScript};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn remote_tools() -> NodeTools {
        let remote = RemoteConfig {
            pastel_dir: Some("/opt/pastel".to_string()),
            ..RemoteConfig::default()
        };
        NodeTools::remote(&remote, Network::Mainnet).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_times_out_after_exact_budget() {
        let script = SessionScript::new(respond(|cmd| Err(command_failed(cmd, "error: couldn't connect to server"))));
        let session = script.session(endpoint("hot"));
        let budget = PollBudget::new(12, Duration::from_secs(5));

        let started = tokio::time::Instant::now();
        let err = wait_remote_live(&session, &remote_tools(), budget).await.unwrap_err();

        assert!(matches!(err, OpsError::Timeout { attempts: 12, .. }));
        assert_eq!(script.count("getinfo"), 12);
        assert_eq!(started.elapsed(), Duration::from_secs(55));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_succeeds_once_daemon_answers() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let script = SessionScript::new(respond(move |cmd| {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(command_failed(cmd, "Loading block index..."))
            } else {
                Ok(r#"{"version":1,"blocks":10}"#.to_string())
            }
        }));
        let session = script.session(endpoint("hot"));

        wait_remote_live(&session, &remote_tools(), PollBudget::new(12, Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_command_error_stops_polling() {
        let script = SessionScript::new(respond(|_| {
            Err(OpsError::Connection {
                endpoint: "pastel@hot:22".to_string(),
                reason: "broken pipe".to_string(),
            })
        }));
        let session = script.session(endpoint("hot"));

        let err = wait_remote_live(&session, &remote_tools(), PollBudget::new(12, Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::Connection { .. }));
        assert_eq!(script.count("getinfo"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_requires_all_three_flags() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let script = SessionScript::new(respond(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(match n {
                0 => r#"{"IsBlockchainSynced":false}"#.to_string(),
                1 => r#"{"IsBlockchainSynced":true,"IsMasternodeListSynced":true,"IsWinnersListSynced":false}"#
                    .to_string(),
                _ => r#"{"IsBlockchainSynced":true,"IsMasternodeListSynced":true,"IsWinnersListSynced":true}"#
                    .to_string(),
            })
        }));
        let session = script.session(endpoint("hot"));

        wait_remote_synced(&session, &remote_tools(), PollBudget::new(5, Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(script.count("mnsync status"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_down_accepts_failing_getinfo_and_no_process() {
        let script = SessionScript::new(respond(|cmd| Err(command_failed(cmd, "couldn't connect"))));
        let session = script.session(endpoint("hot"));

        wait_remote_down(&session, &remote_tools(), PollBudget::new(3, Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(script.count("getinfo"), 1);
        assert_eq!(script.count("pgrep -x pasteld"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_down_outlasts_rpc_while_process_lingers() {
        let lingering = Arc::new(AtomicU32::new(3));
        let left = lingering.clone();
        let script = SessionScript::new(respond(move |cmd| {
            if cmd.starts_with("pgrep") && left.load(Ordering::SeqCst) > 0 {
                left.fetch_sub(1, Ordering::SeqCst);
                Ok("4242".to_string())
            } else {
                Err(command_failed(cmd, "couldn't connect to server"))
            }
        }));
        let session = script.session(endpoint("hot"));

        let started = tokio::time::Instant::now();
        wait_remote_down(&session, &remote_tools(), PollBudget::new(10, Duration::from_secs(2)))
            .await
            .unwrap();

        assert_eq!(lingering.load(Ordering::SeqCst), 0);
        assert_eq!(script.count("pgrep -x pasteld"), 4);
        assert_eq!(script.count("getinfo"), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_down_times_out_while_process_lingers() {
        let script = SessionScript::new(respond(|cmd| {
            if cmd.starts_with("pgrep") {
                Ok("4242".to_string())
            } else {
                Err(command_failed(cmd, "couldn't connect to server"))
            }
        }));
        let session = script.session(endpoint("hot"));

        let err = wait_remote_down(&session, &remote_tools(), PollBudget::new(3, Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::Timeout { attempts: 3, .. }));
    }
}
