//! In-process fakes for runners, sessions, connectors and operators

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::discovery::AddressResolver;
use crate::errors::OpsError;
use crate::execution::{CommandRunner, Invocation};
use crate::session::{Connector, Credential, NodeEndpoint, RemoteSession};
use crate::wizard::Operator;

pub type Responder = Arc<dyn Fn(&str) -> Result<String, OpsError> + Send + Sync>;

pub fn respond<F>(f: F) -> Responder
where
    F: Fn(&str) -> Result<String, OpsError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Resolver for a host with no route to any lookup endpoint
pub struct FailingAddressResolver;

#[async_trait]
impl AddressResolver for FailingAddressResolver {
    async fn external_ip(&self) -> Result<String, OpsError> {
        Err(OpsError::NotFound("external IP address (all lookups failed)".to_string()))
    }
}

pub fn command_failed(command: &str, output: &str) -> OpsError {
    OpsError::Command {
        command: command.to_string(),
        code: Some(1),
        output: output.to_string(),
    }
}

pub fn endpoint(host: &str) -> NodeEndpoint {
    NodeEndpoint {
        host: host.to_string(),
        port: 22,
        user: "pastel".to_string(),
        credential: Credential::Agent,
    }
}

/// Local runner answering from a closure over the shell-quoted command line
pub struct FakeRunner {
    responder: Responder,
    log: Mutex<Vec<(String, bool)>>,
}

impl FakeRunner {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str) -> Result<String, OpsError> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(f),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Every command issued, elevated or not
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn elevated_commands(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|(_, elevated)| *elevated)
            .map(|(c, _)| c.clone())
            .collect()
    }

    fn answer(&self, invocation: &Invocation, elevated: bool) -> Result<String, OpsError> {
        let line = invocation.to_shell();
        self.log.lock().push((line.clone(), elevated));
        (self.responder)(&line)
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, invocation: &Invocation) -> Result<String, OpsError> {
        self.answer(invocation, false)
    }

    async fn run_elevated(&self, invocation: &Invocation) -> Result<String, OpsError> {
        self.answer(invocation, true)
    }
}

/// Shared record of what happened on the sessions of one host
#[derive(Clone)]
pub struct SessionScript {
    responder: Responder,
    commands: Arc<Mutex<Vec<String>>>,
    detached: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
}

impl SessionScript {
    pub fn new(responder: Responder) -> Self {
        Self {
            responder,
            commands: Arc::new(Mutex::new(Vec::new())),
            detached: Arc::new(Mutex::new(Vec::new())),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn session(&self, endpoint: NodeEndpoint) -> FakeSession {
        FakeSession {
            endpoint,
            script: self.clone(),
            closed: false,
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.commands.lock().iter().filter(|c| c.contains(needle)).count()
    }

    pub fn detached(&self) -> Vec<String> {
        self.detached.lock().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub struct FakeSession {
    endpoint: NodeEndpoint,
    script: SessionScript,
    closed: bool,
}

#[async_trait]
impl RemoteSession for FakeSession {
    fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    async fn run(&self, command: &str) -> Result<String, OpsError> {
        self.script.commands.lock().push(command.to_string());
        (self.script.responder)(command)
    }

    async fn spawn_detached(&self, command: &str) -> Result<(), OpsError> {
        self.script.detached.lock().push(command.to_string());
        (self.script.responder)(command).map(|_| ())
    }

    fn close(&mut self) -> Result<(), OpsError> {
        if !self.closed {
            self.closed = true;
            self.script.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Connector handing out scripted sessions by host name; unknown hosts are
/// refused
#[derive(Default)]
pub struct FakeConnector {
    scripts: HashMap<String, SessionScript>,
    connects: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, script: SessionScript) -> Self {
        self.scripts.insert(host.to_string(), script);
        self
    }

    pub fn connected_hosts(&self) -> Vec<String> {
        self.connects.lock().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, endpoint: &NodeEndpoint) -> Result<Box<dyn RemoteSession>, OpsError> {
        self.connects.lock().push(endpoint.host.clone());
        match self.scripts.get(&endpoint.host) {
            Some(script) => Ok(Box::new(script.session(endpoint.clone()))),
            None => Err(OpsError::Connection {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            }),
        }
    }
}

/// Operator answering confirmations from a queue; an empty queue declines
pub struct ScriptedOperator {
    answers: Mutex<VecDeque<bool>>,
    interactive: bool,
    questions: Mutex<Vec<String>>,
    notes: Mutex<Vec<String>>,
}

impl ScriptedOperator {
    pub fn new(answers: &[bool]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().copied().collect()),
            interactive: true,
            questions: Mutex::new(Vec::new()),
            notes: Mutex::new(Vec::new()),
        }
    }

    /// Non-interactive operator that accepts every confirmation
    pub fn unattended() -> Self {
        Self {
            interactive: false,
            ..Self::new(&[])
        }
    }

    pub fn questions(&self) -> Vec<String> {
        self.questions.lock().clone()
    }

    pub fn notes(&self) -> Vec<String> {
        self.notes.lock().clone()
    }
}

impl Operator for ScriptedOperator {
    fn confirm(&self, question: &str, _default: bool) -> Result<bool, OpsError> {
        self.questions.lock().push(question.to_string());
        if !self.interactive {
            return Ok(true);
        }
        Ok(self.answers.lock().pop_front().unwrap_or(false))
    }

    fn notify(&self, message: &str) {
        self.notes.lock().push(message.to_string());
    }

    fn is_interactive(&self) -> bool {
        self.interactive
    }
}
