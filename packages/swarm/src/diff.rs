//! Change detection over the primary session's subscription.
//!
//! Per field type:
//! - message field: sequence based. An entry is new when its sequence is
//!   present and either had no predecessor or is strictly greater than it.
//! - stage: value based.
//! - participant set: value based over the sorted names.
//!
//! The first non-null snapshot is a baseline: it only yields
//! `SessionStarted` (and `SessionEnded` if it is already finished).

use std::sync::Arc;

use serde_json::Value;
use swarm_envelope::Sealer;
use tracing::debug;

use crate::config::StoreLayout;
use crate::events::{EndReason, SwarmEvent};
use crate::message::decode_message;

pub struct DiffEngine {
    layout: Arc<StoreLayout>,
    sealer: Sealer,
    previous: Option<Value>,
    stage: Option<String>,
    participants: Vec<String>,
    blocked: Vec<String>,
    ended: bool,
}

impl DiffEngine {
    pub fn new(layout: Arc<StoreLayout>, sealer: Sealer) -> Self {
        Self {
            layout,
            sealer,
            previous: None,
            stage: None,
            participants: Vec::new(),
            blocked: Vec::new(),
            ended: false,
        }
    }

    /// Last full value seen, if any.
    pub fn snapshot(&self) -> Option<&Value> {
        self.previous.as_ref()
    }

    /// Sorted participant names of the last snapshot.
    pub fn participants(&self) -> &[String] {
        &self.participants
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Process one push of the root subscription.
    pub fn on_snapshot(&mut self, value: Value) -> Vec<SwarmEvent> {
        if self.ended {
            return Vec::new();
        }

        if value.is_null() {
            if self.previous.is_none() {
                return Vec::new();
            }
            debug!("subscribed root vanished");
            self.ended = true;
            return vec![SwarmEvent::SessionEnded {
                reason: EndReason::Vanished,
            }];
        }

        let stage = self.stage_of(&value);
        let participants = self.participant_names(&value);
        let mut events = Vec::new();

        match &self.previous {
            None => {
                let settings = value.get(&self.layout.settings);
                events.push(SwarmEvent::SessionStarted {
                    category: string_at(settings, &self.layout.category),
                    variant: string_at(settings, &self.layout.variant),
                });
            }
            Some(previous) => {
                self.message_changes(previous, &value, &mut events);
                if stage != self.stage {
                    events.push(SwarmEvent::StageChanged {
                        from: self.stage.clone(),
                        to: stage.clone(),
                    });
                }
                if participants != self.participants {
                    events.push(SwarmEvent::ParticipantsChanged {
                        participants: participants.clone(),
                    });
                }
            }
        }

        if stage.as_deref() == Some(self.layout.finished_stage.as_str()) {
            self.ended = true;
            events.push(SwarmEvent::SessionEnded {
                reason: EndReason::Finished,
            });
        }

        self.stage = stage;
        self.participants = participants;
        self.previous = Some(value);
        events
    }

    /// Process one push of the block-list subscription.
    pub fn on_blocks(&mut self, value: &Value) -> Option<SwarmEvent> {
        let mut names: Vec<String> = value
            .as_object()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        if names == self.blocked {
            return None;
        }
        self.blocked = names.clone();
        Some(SwarmEvent::Blocked { names })
    }

    fn message_changes(&self, previous: &Value, current: &Value, events: &mut Vec<SwarmEvent>) {
        let Some(entries) = current.get(&self.layout.participants).and_then(Value::as_object) else {
            return;
        };
        let before = previous.get(&self.layout.participants);

        for (participant, entry) in entries {
            let Some(message) = entry.get(&self.layout.message) else {
                continue;
            };
            let Some(sequence) = self.sequence_of(Some(message)) else {
                continue;
            };
            let prior = self.sequence_of(
                before
                    .and_then(|b| b.get(participant))
                    .and_then(|e| e.get(&self.layout.message)),
            );
            if prior.is_some_and(|p| sequence <= p) {
                continue;
            }

            events.push(SwarmEvent::Changed {
                participant: participant.clone(),
                field: self.layout.message.clone(),
                value: message.clone(),
            });
            if let Some(text) = decode_message(&self.sealer, message) {
                events.push(SwarmEvent::Message {
                    participant: participant.clone(),
                    text,
                });
            }
        }
    }

    fn sequence_of(&self, message: Option<&Value>) -> Option<f64> {
        message?.get(&self.layout.sequence)?.as_f64()
    }

    fn stage_of(&self, value: &Value) -> Option<String> {
        string_at(Some(value), &self.layout.stage)
            .or_else(|| string_at(value.get(&self.layout.settings), &self.layout.stage))
    }

    fn participant_names(&self, value: &Value) -> Vec<String> {
        let mut names: Vec<String> = value
            .get(&self.layout.participants)
            .and_then(Value::as_object)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

fn string_at(value: Option<&Value>, key: &str) -> Option<String> {
    value?.get(key)?.as_str().map(str::to_string)
}
