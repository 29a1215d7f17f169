//! Session gate
//!
//! Tracks the authorization state of the messaging session. The state
//! machine itself ([`SessionGate`]) is pure: it consumes phase updates
//! and emits [`GateAction`]s, and owns a generation counter so replies
//! to superseded authorization attempts can be recognized as stale.
//! [`SessionDriver`] wires the machine to the dispatcher and to a
//! credential source.

use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::{Request, Response, SessionParameters};
use crate::dispatch::Dispatcher;

/// Authorization phase reported by the messaging service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPhase {
    WaitParameters,
    WaitPhoneNumber,
    WaitCode,
    WaitEmailAddress,
    WaitEmailCode,
    WaitPassword,
    WaitRegistration,
    WaitOtherDeviceConfirmation,
    Ready,
    LoggingOut,
    Closing,
    Closed,
}

/// Which value the service is asking for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    PhoneNumber,
    Code,
    EmailAddress,
    EmailCode,
    Password,
    Registration,
}

/// A value collected from the credential source
#[derive(Debug, Clone)]
pub enum Credential {
    PhoneNumber(String),
    Code(String),
    EmailAddress(String),
    EmailCode(String),
    Password(String),
    Registration {
        first_name: String,
        last_name: String,
    },
}

impl Credential {
    /// The request that submits this credential
    pub fn into_request(self) -> Request {
        match self {
            Credential::PhoneNumber(phone_number) => Request::SetPhoneNumber { phone_number },
            Credential::Code(code) => Request::CheckCode { code },
            Credential::EmailAddress(email_address) => {
                Request::SetEmailAddress { email_address }
            }
            Credential::EmailCode(code) => Request::CheckEmailCode { code },
            Credential::Password(password) => Request::CheckPassword { password },
            Credential::Registration {
                first_name,
                last_name,
            } => Request::RegisterUser {
                first_name,
                last_name,
            },
        }
    }
}

/// What a phase transition requires of the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    /// Nothing to do
    None,
    /// The session is authorized; tunnel loops may start
    StartTunnel,
    /// The service wants the stored session parameters
    SendParameters,
    /// The service wants one credential value
    NeedCredential(CredentialKind),
    /// Login must be confirmed on another device; just wait
    AwaitConfirmation,
    /// The session is closed for good; a restart is required
    Shutdown,
}

/// Pure authorization state machine
#[derive(Debug, Default)]
pub struct SessionGate {
    phase: Option<AuthPhase>,
    authorized: bool,
    need_restart: bool,
    generation: u64,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a phase update and say what it requires.
    ///
    /// Every call bumps the generation, so a reply carrying an older
    /// generation belongs to a superseded attempt.
    pub fn on_phase(&mut self, phase: AuthPhase) -> GateAction {
        self.generation += 1;
        self.phase = Some(phase);
        match phase {
            AuthPhase::Ready => {
                self.authorized = true;
                GateAction::StartTunnel
            }
            AuthPhase::LoggingOut => {
                self.authorized = false;
                GateAction::None
            }
            AuthPhase::Closing => GateAction::None,
            AuthPhase::Closed => {
                self.authorized = false;
                self.need_restart = true;
                GateAction::Shutdown
            }
            AuthPhase::WaitParameters => GateAction::SendParameters,
            AuthPhase::WaitPhoneNumber => {
                GateAction::NeedCredential(CredentialKind::PhoneNumber)
            }
            AuthPhase::WaitCode => GateAction::NeedCredential(CredentialKind::Code),
            AuthPhase::WaitEmailAddress => {
                GateAction::NeedCredential(CredentialKind::EmailAddress)
            }
            AuthPhase::WaitEmailCode => GateAction::NeedCredential(CredentialKind::EmailCode),
            AuthPhase::WaitPassword => GateAction::NeedCredential(CredentialKind::Password),
            AuthPhase::WaitRegistration => {
                GateAction::NeedCredential(CredentialKind::Registration)
            }
            AuthPhase::WaitOtherDeviceConfirmation => GateAction::AwaitConfirmation,
        }
    }

    /// Re-enter the current phase after a failed authorization request.
    pub fn retry_current(&mut self) -> GateAction {
        match self.phase {
            Some(phase) => self.on_phase(phase),
            None => GateAction::None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether `generation` still names the latest attempt.
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    pub fn is_ready(&self) -> bool {
        self.authorized
    }

    pub fn need_restart(&self) -> bool {
        self.need_restart
    }

    pub fn phase(&self) -> Option<AuthPhase> {
        self.phase
    }
}

/// Source of interactively- or config-supplied credential values
pub trait CredentialSource: Send + Sync {
    fn provide(&self, kind: CredentialKind) -> io::Result<Credential>;
}

/// Prompts on the terminal, with an optional configured phone number
pub struct ConsoleCredentials {
    phone_override: Option<String>,
}

impl ConsoleCredentials {
    pub fn new(phone_override: Option<String>) -> Self {
        Self { phone_override }
    }
}

impl CredentialSource for ConsoleCredentials {
    fn provide(&self, kind: CredentialKind) -> io::Result<Credential> {
        match kind {
            CredentialKind::PhoneNumber => {
                if let Some(phone) = &self.phone_override {
                    info!("using configured phone number");
                    return Ok(Credential::PhoneNumber(phone.clone()));
                }
                Ok(Credential::PhoneNumber(prompt("Enter phone number: ")?))
            }
            CredentialKind::Code => Ok(Credential::Code(prompt("Enter authentication code: ")?)),
            CredentialKind::EmailAddress => {
                Ok(Credential::EmailAddress(prompt("Enter email address: ")?))
            }
            CredentialKind::EmailCode => {
                Ok(Credential::EmailCode(prompt("Enter email authentication code: ")?))
            }
            CredentialKind::Password => Ok(Credential::Password(prompt("Enter password: ")?)),
            CredentialKind::Registration => Ok(Credential::Registration {
                first_name: prompt("Enter your first name: ")?,
                last_name: prompt("Enter your last name: ")?,
            }),
        }
    }
}

fn prompt(label: &str) -> io::Result<String> {
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Fixed answers for tests and unattended runs
pub struct StaticCredentials {
    pub phone_number: String,
    pub code: String,
    pub password: String,
}

impl CredentialSource for StaticCredentials {
    fn provide(&self, kind: CredentialKind) -> io::Result<Credential> {
        match kind {
            CredentialKind::PhoneNumber => {
                Ok(Credential::PhoneNumber(self.phone_number.clone()))
            }
            CredentialKind::Code => Ok(Credential::Code(self.code.clone())),
            CredentialKind::EmailCode => Ok(Credential::EmailCode(self.code.clone())),
            CredentialKind::Password => Ok(Credential::Password(self.password.clone())),
            CredentialKind::EmailAddress | CredentialKind::Registration => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "no static value for this credential",
            )),
        }
    }
}

/// Drives the gate against the dispatcher and credential source
pub struct SessionDriver {
    gate: Mutex<SessionGate>,
    dispatcher: Arc<Dispatcher>,
    credentials: Box<dyn CredentialSource>,
    parameters: SessionParameters,
}

impl SessionDriver {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        credentials: Box<dyn CredentialSource>,
        parameters: SessionParameters,
    ) -> Self {
        Self {
            gate: Mutex::new(SessionGate::new()),
            dispatcher,
            credentials,
            parameters,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.gate.lock().unwrap().is_ready()
    }

    pub fn need_restart(&self) -> bool {
        self.gate.lock().unwrap().need_restart()
    }

    /// Feed one authorization phase update through the gate.
    pub fn handle_phase(self: &Arc<Self>, phase: AuthPhase) {
        let action = self.gate.lock().unwrap().on_phase(phase);
        self.apply(action);
    }

    fn apply(self: &Arc<Self>, action: GateAction) {
        match action {
            GateAction::None => {}
            GateAction::StartTunnel => info!("authorization complete"),
            GateAction::SendParameters => {
                self.submit(Request::SetSessionParameters(self.parameters.clone()));
            }
            GateAction::NeedCredential(kind) => match self.credentials.provide(kind) {
                Ok(credential) => self.submit(credential.into_request()),
                Err(e) => warn!("failed to collect credential: {}", e),
            },
            GateAction::AwaitConfirmation => {
                info!("confirm this login on another device to continue");
            }
            GateAction::Shutdown => info!("session closed"),
        }
    }

    /// Send an authorization request and watch its reply in the
    /// background. A failed reply re-enters the current phase unless a
    /// newer phase update already superseded this attempt.
    fn submit(self: &Arc<Self>, request: Request) {
        let generation = self.gate.lock().unwrap().generation();
        let handle = self.dispatcher.query(request);
        let driver = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(Response::Error { code, message }) = handle.response().await {
                warn!("authorization request failed with code {}: {}", code, message);
                let action = {
                    let mut gate = driver.gate.lock().unwrap();
                    if !gate.is_current(generation) {
                        return;
                    }
                    gate.retry_current()
                };
                driver.apply(action);
            }
        });
    }
}
