// src/admission.rs
//
// Admission: ask whether a newly arrived device should be recorded.
// Called off the async runtime; answers may take as long as a human does.

use std::io::{BufRead, BufReader, Stderr, Stdin, Write};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use crate::identity::DeviceIdentity;
use crate::settings::{AdmissionMode, AdmissionSettings};

pub trait AdmissionPolicy: Send + Sync {
    /// Blocking. `true` admits the device.
    fn confirm(&self, identity: &DeviceIdentity) -> bool;
}

/// Admits everything (`--yes`)
pub struct AcceptAll;

impl AdmissionPolicy for AcceptAll {
    fn confirm(&self, _identity: &DeviceIdentity) -> bool {
        true
    }
}

/// Asks on a line-oriented terminal. One question at a time.
pub struct PromptAdmission<R, W> {
    io: Mutex<(R, W)>,
}

pub type TerminalPrompt = PromptAdmission<BufReader<Stdin>, Stderr>;

impl TerminalPrompt {
    pub fn terminal() -> Self {
        PromptAdmission::new(BufReader::new(std::io::stdin()), std::io::stderr())
    }
}

impl<R, W> PromptAdmission<R, W> {
    pub fn new(input: R, output: W) -> Self {
        PromptAdmission {
            io: Mutex::new((input, output)),
        }
    }
}

impl<R, W> AdmissionPolicy for PromptAdmission<R, W>
where
    R: BufRead + Send,
    W: Write + Send,
{
    fn confirm(&self, identity: &DeviceIdentity) -> bool {
        let mut guard = self.io.lock().unwrap_or_else(|p| p.into_inner());
        let (input, output) = &mut *guard;

        let _ = write!(
            output,
            "Device {} plugged in. Include in data recording? [y/N] ",
            identity
        );
        let _ = output.flush();

        let mut answer = String::new();
        match input.read_line(&mut answer) {
            Ok(0) | Err(_) => false, // no terminal to answer from
            Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        }
    }
}

/// Runs an external dialog program; exit status 0 means yes.
/// `{device}` in any argument is replaced by the identity name.
pub struct CommandAdmission {
    argv: Vec<String>,
}

impl CommandAdmission {
    pub fn new(argv: Vec<String>) -> Self {
        CommandAdmission { argv }
    }

    fn command_for(&self, identity: &DeviceIdentity) -> Option<Command> {
        let mut args = self
            .argv
            .iter()
            .map(|arg| arg.replace("{device}", identity.name()));
        let mut command = Command::new(args.next()?);
        command.args(args).stdin(Stdio::null());
        Some(command)
    }
}

impl AdmissionPolicy for CommandAdmission {
    fn confirm(&self, identity: &DeviceIdentity) -> bool {
        let Some(mut command) = self.command_for(identity) else {
            return false;
        };
        match command.status() {
            Ok(status) => status.success(),
            Err(e) => {
                tlog!(
                    "[admission] Failed to run {:?} for {}: {}",
                    self.argv.first(),
                    identity,
                    e
                );
                false
            }
        }
    }
}

pub fn from_settings(settings: &AdmissionSettings) -> Arc<dyn AdmissionPolicy> {
    match settings.mode {
        AdmissionMode::Accept => Arc::new(AcceptAll),
        AdmissionMode::Prompt => Arc::new(TerminalPrompt::terminal()),
        AdmissionMode::Command => Arc::new(CommandAdmission::new(settings.command.clone())),
    }
}
