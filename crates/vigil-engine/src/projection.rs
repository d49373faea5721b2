//! Rebuilds the oracle conversation from a run's journal.
//!
//! The fold is pure: the same entries always yield the same messages. It is
//! the only way in-flight conversation state is recovered after a restart.

use std::collections::HashMap;

use vigil_core::events::{Decision, JournalEvent};
use vigil_core::ids::ToolCallId;
use vigil_core::messages::{Message, ToolCall};
use vigil_store::journal::JournalEntry;

/// Project a run's journal into the messages that follow the task prompt.
pub fn project(entries: &[JournalEntry]) -> Vec<Message> {
    project_events(entries.iter().map(|e| &e.event))
}

pub fn project_events<'a>(events: impl IntoIterator<Item = &'a JournalEvent>) -> Vec<Message> {
    let mut projector = Projector::default();
    for event in events {
        projector.push(event);
    }
    projector.finish()
}

/// One assistant turn being assembled: its thought and proposed calls.
#[derive(Default)]
struct TurnBuffer {
    step: Option<u32>,
    text: Option<String>,
    calls: Vec<ToolCall>,
}

impl TurnBuffer {
    fn is_empty(&self) -> bool {
        self.text.is_none() && self.calls.is_empty()
    }

    fn take_message(&mut self) -> Option<Message> {
        if self.is_empty() {
            self.step = None;
            return None;
        }
        let buffer = std::mem::take(self);
        Some(Message::Assistant {
            content: buffer.text,
            tool_calls: buffer.calls,
        })
    }
}

/// Accumulator behind [`project`].
#[derive(Default)]
pub struct Projector {
    messages: Vec<Message>,
    turn: TurnBuffer,
    tool_names: HashMap<ToolCallId, String>,
    /// Reviewer notes waiting for the current turn's tool results to land.
    notes: Vec<String>,
}

impl Projector {
    pub fn push(&mut self, event: &JournalEvent) {
        match event {
            JournalEvent::AgentThought { text, step } => {
                self.flush_turn();
                self.start_turn(*step);
                self.turn.text = Some(text.clone());
            }
            JournalEvent::ToolProposed {
                tool_call_id,
                tool_name,
                arguments,
                step,
                ..
            } => {
                if self.turn.step != Some(*step) {
                    self.flush_turn();
                    self.start_turn(*step);
                }
                self.tool_names.insert(tool_call_id.clone(), tool_name.clone());
                self.turn.calls.push(ToolCall {
                    id: tool_call_id.clone(),
                    name: tool_name.clone(),
                    arguments: arguments.clone(),
                });
            }
            JournalEvent::ToolResult {
                tool_call_id,
                tool_name,
                status,
                content,
                ..
            } => {
                self.flush_turn();
                self.messages.push(Message::tool_result(
                    tool_call_id.clone(),
                    tool_name.clone(),
                    content.clone(),
                    *status,
                ));
            }
            JournalEvent::RunResumed {
                decision,
                feedback,
                tool_call_id,
                ..
            } => {
                self.flush_turn();
                if *decision == Some(Decision::Rejected) {
                    let tool = tool_call_id
                        .as_ref()
                        .and_then(|id| self.tool_names.get(id))
                        .map(String::as_str)
                        .unwrap_or("proposed");
                    self.notes.push(rejection_note(tool, feedback.as_deref()));
                }
            }
            JournalEvent::RunStarted { .. }
            | JournalEvent::RunSuspended { .. }
            | JournalEvent::RunCompleted { .. }
            | JournalEvent::SystemError { .. }
            | JournalEvent::ChildRunStarted { .. }
            | JournalEvent::ChildRunCompleted { .. }
            | JournalEvent::RunCancelled { .. } => {}
        }
    }

    pub fn finish(mut self) -> Vec<Message> {
        self.flush_turn();
        self.flush_notes();
        self.messages
    }

    fn start_turn(&mut self, step: u32) {
        self.flush_notes();
        self.turn.step = Some(step);
    }

    fn flush_turn(&mut self) {
        if let Some(message) = self.turn.take_message() {
            self.messages.push(message);
        }
    }

    fn flush_notes(&mut self) {
        for note in self.notes.drain(..) {
            self.messages.push(Message::user(note));
        }
    }
}

fn rejection_note(tool: &str, feedback: Option<&str>) -> String {
    match feedback.map(str::trim).filter(|f| !f.is_empty()) {
        Some(feedback) => format!("The reviewer rejected the {tool} call: {feedback}"),
        None => format!("The reviewer rejected the {tool} call."),
    }
}
