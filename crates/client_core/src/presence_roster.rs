use indexmap::IndexMap;
use shared::domain::{Attendee, AttendeeId, PresenceState};

/// Present attendees in first-seen order, so list rendering does not reshuffle.
#[derive(Debug, Default, Clone)]
pub struct PresenceRoster {
    attendees: IndexMap<AttendeeId, Attendee>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the roster changed.
    pub fn set_present(&mut self, attendee_id: AttendeeId, display_name: Option<String>) -> bool {
        let display_name = display_name.filter(|name| !name.trim().is_empty());
        if let Some(existing) = self.attendees.get_mut(&attendee_id) {
            if display_name.is_some() && existing.display_name != display_name {
                existing.display_name = display_name;
                return true;
            }
            return false;
        }

        self.attendees.insert(
            attendee_id.clone(),
            Attendee {
                attendee_id,
                display_name,
                presence: PresenceState::Present,
            },
        );
        true
    }

    /// Returns `true` when an entry was removed.
    pub fn set_absent(&mut self, attendee_id: &AttendeeId) -> bool {
        self.attendees.shift_remove(attendee_id).is_some()
    }

    pub fn list(&self) -> Vec<Attendee> {
        self.attendees.values().cloned().collect()
    }

    pub fn get(&self, attendee_id: &AttendeeId) -> Option<&Attendee> {
        self.attendees.get(attendee_id)
    }

    pub fn contains(&self, attendee_id: &AttendeeId) -> bool {
        self.attendees.contains_key(attendee_id)
    }

    /// Display name, or the raw id for attendees the roster has not seen.
    pub fn display_label(&self, attendee_id: &AttendeeId) -> String {
        self.attendees
            .get(attendee_id)
            .map(|attendee| attendee.label().to_string())
            .unwrap_or_else(|| attendee_id.to_string())
    }

    pub fn len(&self) -> usize {
        self.attendees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attendees.is_empty()
    }

    pub fn clear(&mut self) {
        self.attendees.clear();
    }
}

#[cfg(test)]
#[path = "tests/presence_roster_tests.rs"]
mod tests;
