use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::{Duration, Instant},
};

use shared::{
    domain::{ConversationId, MessageId, ParticipantId},
    protocol::{ChannelEvent, Message, ReadEvent, Receipt},
};
use tracing::debug;

struct TimelineEntry {
    message: Message,
    arrival: u64,
}

struct PendingRead {
    event: ReadEvent,
    queued_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimelineChange {
    pub messages: bool,
    pub receipts: bool,
    pub typing: bool,
}

impl TimelineChange {
    pub fn is_empty(&self) -> bool {
        !(self.messages || self.receipts || self.typing)
    }
}

/// Merges a conversation's backlog and live traffic into one ordered view.
///
/// The id-indexed map is the source of truth; the ordered projection is
/// recomputed from it. Messages are never removed and receipts are only ever
/// appended or moved forward in time, so every merge is idempotent.
pub struct Timeline {
    conversation_id: ConversationId,
    entries: HashMap<MessageId, TimelineEntry>,
    next_arrival: u64,
    typing: HashMap<ParticipantId, bool>,
    pending_reads: VecDeque<PendingRead>,
    pending_read_ttl: Duration,
    unconfirmed: HashSet<MessageId>,
    failed: HashSet<MessageId>,
}

impl Timeline {
    pub fn new(conversation_id: ConversationId, pending_read_ttl: Duration) -> Self {
        Self {
            conversation_id,
            entries: HashMap::new(),
            next_arrival: 0,
            typing: HashMap::new(),
            pending_reads: VecDeque::new(),
            pending_read_ttl,
            unconfirmed: HashSet::new(),
            failed: HashSet::new(),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.entries.get(id).map(|entry| &entry.message)
    }

    pub fn messages(&self) -> Vec<Message> {
        let mut ordered: Vec<&TimelineEntry> = self.entries.values().collect();
        ordered.sort_by(|a, b| {
            a.message
                .created_at
                .cmp(&b.message.created_at)
                .then(a.arrival.cmp(&b.arrival))
        });
        ordered.into_iter().map(|entry| entry.message.clone()).collect()
    }

    pub fn message_ids(&self) -> Vec<MessageId> {
        self.messages().into_iter().map(|message| message.id).collect()
    }

    pub fn typing_participants(&self) -> Vec<ParticipantId> {
        let mut typing: Vec<ParticipantId> = self
            .typing
            .iter()
            .filter(|(_, is_typing)| **is_typing)
            .map(|(participant, _)| *participant)
            .collect();
        typing.sort();
        typing
    }

    pub fn is_typing(&self, participant: ParticipantId) -> bool {
        self.typing.get(&participant).copied().unwrap_or(false)
    }

    pub fn pending_read_count(&self) -> usize {
        self.pending_reads.len()
    }

    pub fn unconfirmed(&self) -> Vec<Message> {
        self.messages()
            .into_iter()
            .filter(|message| self.unconfirmed.contains(&message.id))
            .collect()
    }

    pub fn failed(&self) -> Vec<Message> {
        self.messages()
            .into_iter()
            .filter(|message| self.failed.contains(&message.id))
            .collect()
    }

    pub fn is_failed(&self, id: &MessageId) -> bool {
        self.failed.contains(id)
    }

    pub fn mark_failed(&mut self, id: MessageId) -> TimelineChange {
        if !self.unconfirmed.remove(&id) {
            return TimelineChange::default();
        }
        self.failed.insert(id);
        TimelineChange {
            messages: true,
            ..TimelineChange::default()
        }
    }

    pub fn seed_history(&mut self, messages: Vec<Message>) -> TimelineChange {
        let mut change = TimelineChange::default();
        for message in messages {
            change = merge(change, self.merge_server_message(message));
        }
        merge(change, self.flush_pending_reads())
    }

    pub fn insert_local(&mut self, message: Message) -> TimelineChange {
        if self.entries.contains_key(&message.id) {
            return TimelineChange::default();
        }
        self.unconfirmed.insert(message.id);
        self.insert(message);
        TimelineChange {
            messages: true,
            ..TimelineChange::default()
        }
    }

    pub fn apply_server_message(&mut self, message: Message) -> TimelineChange {
        let change = self.merge_server_message(message);
        merge(change, self.flush_pending_reads())
    }

    pub fn apply_event(&mut self, event: ChannelEvent, now: Instant) -> TimelineChange {
        match event {
            ChannelEvent::Message(message) => self.apply_server_message(message),
            ChannelEvent::Typing {
                participant,
                is_typing,
            } => self.set_typing(participant, is_typing),
            ChannelEvent::Read(read) => self.apply_read(read, now),
        }
    }

    pub fn apply_read(&mut self, read: ReadEvent, now: Instant) -> TimelineChange {
        if self.record_receipt(&read) {
            return TimelineChange {
                receipts: true,
                ..TimelineChange::default()
            };
        }
        if self.entries.contains_key(&read.message_id) {
            return TimelineChange::default();
        }
        debug!(
            conversation_id = self.conversation_id.0,
            message_id = %read.message_id,
            "timeline: read receipt queued until its message arrives"
        );
        self.pending_reads.push_back(PendingRead {
            event: read,
            queued_at: now,
        });
        TimelineChange::default()
    }

    pub fn channel_closed(&mut self) -> TimelineChange {
        let had_typing = self.typing.values().any(|is_typing| *is_typing);
        self.typing.clear();
        TimelineChange {
            typing: had_typing,
            ..TimelineChange::default()
        }
    }

    /// Drops queued read events whose message never showed up within the
    /// TTL and hands them back so the caller can report the loss.
    pub fn expire_pending_reads(&mut self, now: Instant) -> Vec<ReadEvent> {
        let ttl = self.pending_read_ttl;
        let mut expired = Vec::new();
        self.pending_reads.retain(|pending| {
            if now.saturating_duration_since(pending.queued_at) >= ttl {
                expired.push(pending.event.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    fn set_typing(&mut self, participant: ParticipantId, is_typing: bool) -> TimelineChange {
        let previous = if is_typing {
            self.typing.insert(participant, true)
        } else {
            self.typing.remove(&participant)
        };
        TimelineChange {
            typing: previous.unwrap_or(false) != is_typing,
            ..TimelineChange::default()
        }
    }

    fn insert(&mut self, message: Message) {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.entries
            .insert(message.id, TimelineEntry { message, arrival });
    }

    fn merge_server_message(&mut self, message: Message) -> TimelineChange {
        if message.conversation_id != self.conversation_id {
            debug!(
                conversation_id = self.conversation_id.0,
                foreign_conversation_id = message.conversation_id.0,
                "timeline: ignoring message for another conversation"
            );
            return TimelineChange::default();
        }

        self.unconfirmed.remove(&message.id);
        self.failed.remove(&message.id);
        let Some(entry) = self.entries.get_mut(&message.id) else {
            self.insert(message);
            return TimelineChange {
                messages: true,
                ..TimelineChange::default()
            };
        };

        // Already placed: only receipts may grow.
        let mut receipts_changed = false;
        for receipt in message.receipts {
            receipts_changed |= upsert_receipt(&mut entry.message.receipts, receipt);
        }
        TimelineChange {
            receipts: receipts_changed,
            ..TimelineChange::default()
        }
    }

    fn record_receipt(&mut self, read: &ReadEvent) -> bool {
        let Some(entry) = self.entries.get_mut(&read.message_id) else {
            return false;
        };
        upsert_receipt(
            &mut entry.message.receipts,
            Receipt {
                participant: read.participant,
                read_at: read.read_at,
            },
        )
    }

    fn flush_pending_reads(&mut self) -> TimelineChange {
        if self.pending_reads.is_empty() {
            return TimelineChange::default();
        }
        let mut receipts = false;
        let queued = std::mem::take(&mut self.pending_reads);
        for pending in queued {
            if self.entries.contains_key(&pending.event.message_id) {
                receipts |= self.record_receipt(&pending.event);
            } else {
                self.pending_reads.push_back(pending);
            }
        }
        TimelineChange {
            receipts,
            ..TimelineChange::default()
        }
    }
}

fn upsert_receipt(receipts: &mut Vec<Receipt>, receipt: Receipt) -> bool {
    match receipts
        .iter_mut()
        .find(|existing| existing.participant == receipt.participant)
    {
        Some(existing) if receipt.read_at > existing.read_at => {
            existing.read_at = receipt.read_at;
            true
        }
        Some(_) => false,
        None => {
            receipts.push(receipt);
            true
        }
    }
}

fn merge(a: TimelineChange, b: TimelineChange) -> TimelineChange {
    TimelineChange {
        messages: a.messages || b.messages,
        receipts: a.receipts || b.receipts,
        typing: a.typing || b.typing,
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
