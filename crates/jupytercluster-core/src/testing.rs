//! Command runner double for controller tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::driver::{CommandOutput, CommandRunner, Invocation};
use crate::error::Result;

#[derive(Default)]
struct GateState {
    /// Subcommands that block until `open` is called.
    gated: Vec<String>,
    open: bool,
    entered: u32,
    replies: HashMap<String, VecDeque<CommandOutput>>,
    invocations: Vec<Invocation>,
}

/// Scripted helm runner that can hold chosen subcommands "inside the
/// driver" until the test opens the gate.
#[derive(Default)]
pub(crate) struct GatedRunner {
    state: Mutex<GateState>,
    opened: Condvar,
}

impl GatedRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn gate(&self, subcommand: &str) {
        let mut state = self.state.lock().unwrap();
        state.gated.push(subcommand.to_string());
        state.open = false;
    }

    pub(crate) fn open(&self) {
        self.state.lock().unwrap().open = true;
        self.opened.notify_all();
    }

    /// Queue a reply for the next call of `subcommand`.
    pub(crate) fn reply(&self, subcommand: &str, output: CommandOutput) {
        self.state
            .lock()
            .unwrap()
            .replies
            .entry(subcommand.to_string())
            .or_default()
            .push_back(output);
    }

    pub(crate) fn entered(&self) -> u32 {
        self.state.lock().unwrap().entered
    }

    pub(crate) fn subcommands(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .invocations
            .iter()
            .map(|inv| inv.args[0].clone())
            .collect()
    }

    /// Wait until a gated command is blocked in the runner.
    pub(crate) async fn wait_entered(&self) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.entered() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("gated command never started");
    }
}

impl CommandRunner for GatedRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let subcommand = invocation.args.first().cloned().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        state.invocations.push(invocation.clone());
        if state.gated.contains(&subcommand) {
            state.entered += 1;
            while !state.open {
                state = self.opened.wait(state).unwrap();
            }
        }
        let reply = state
            .replies
            .get_mut(&subcommand)
            .and_then(VecDeque::pop_front);
        Ok(reply.unwrap_or_else(|| ok("")))
    }
}

pub(crate) fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
        elapsed: Duration::from_millis(1),
        timed_out: false,
    }
}

pub(crate) fn failed(stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
        elapsed: Duration::from_millis(1),
        timed_out: false,
    }
}
