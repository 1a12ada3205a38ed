/*!
Mock executor: runs nothing, records everything

Every command is recorded with its rendered line (peer commands show up as
the full `ssh ... -- <command>` invocation). Replies come from rules matched
by substring against that line; the most recently added rule wins and
unmatched commands succeed with empty output.
*/

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use twinsync_agent::execution::{CommandSpec, ExecutionResult, Executor};

#[derive(Debug, Clone)]
pub struct RecordedCommand {
    pub spec: CommandSpec,
    pub line: String,
}

impl RecordedCommand {
    /// Wrapped in ssh, i.e. executed on the peer
    pub fn is_remote(&self) -> bool {
        self.spec.program == "ssh"
    }
}

struct Rule {
    pattern: String,
    replies: VecDeque<ExecutionResult>,
    /// Reply once the sequence is exhausted
    last: ExecutionResult,
}

impl Rule {
    fn next_reply(&mut self) -> ExecutionResult {
        match self.replies.pop_front() {
            Some(reply) => {
                self.last = reply.clone();
                reply
            }
            None => self.last.clone(),
        }
    }
}

#[derive(Clone, Default)]
pub struct MockExecutor {
    calls: Arc<Mutex<Vec<RecordedCommand>>>,
    rules: Arc<Mutex<Vec<Rule>>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every command containing `pattern` with `reply`
    pub fn on(&self, pattern: &str, reply: ExecutionResult) -> &Self {
        self.on_sequence(pattern, vec![reply])
    }

    /// Answer successive matches with `replies` in order, then keep
    /// repeating the last one
    pub fn on_sequence(&self, pattern: &str, replies: Vec<ExecutionResult>) -> &Self {
        let mut replies: VecDeque<ExecutionResult> = replies.into();
        let last = replies.back().cloned().unwrap_or_else(|| ExecutionResult::ok(""));
        if replies.len() == 1 {
            replies.clear();
        }
        self.rules.lock().unwrap().push(Rule { pattern: pattern.to_string(), replies, last });
        self
    }

    /// Shortcut: commands containing `pattern` exit with status 1
    pub fn fail(&self, pattern: &str) -> &Self {
        self.on(pattern, ExecutionResult::failed(1, format!("mock failure for {}", pattern)))
    }

    pub fn calls(&self) -> Vec<RecordedCommand> {
        self.calls.lock().unwrap().clone()
    }

    /// Rendered lines, in execution order
    pub fn lines(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.line).collect()
    }

    pub fn find(&self, pattern: &str) -> Vec<RecordedCommand> {
        self.calls().into_iter().filter(|c| c.line.contains(pattern)).collect()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.find(pattern).len()
    }

    /// Index of the first recorded command matching `pred`
    pub fn position(&self, pred: impl Fn(&RecordedCommand) -> bool) -> Option<usize> {
        self.calls().iter().position(pred)
    }

    /// Index of the first local command whose program is `program` and whose
    /// line contains `pattern`
    pub fn local_position(&self, program: &str, pattern: &str) -> Option<usize> {
        self.position(|c| c.spec.program == program && c.line.contains(pattern))
    }

    /// Index of the first peer command containing `pattern`
    pub fn remote_position(&self, pattern: &str) -> Option<usize> {
        self.position(|c| c.is_remote() && c.line.contains(pattern))
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn run(&self, command: &CommandSpec) -> Result<ExecutionResult> {
        let line = command.rendered();
        log::info!("[MOCK] {}", line);
        self.calls.lock().unwrap().push(RecordedCommand { spec: command.clone(), line: line.clone() });

        let mut rules = self.rules.lock().unwrap();
        let reply = rules
            .iter_mut()
            .rev()
            .find(|rule| line.contains(&rule.pattern))
            .map(Rule::next_reply)
            .unwrap_or_else(|| ExecutionResult::ok(""));
        Ok(reply)
    }
}
