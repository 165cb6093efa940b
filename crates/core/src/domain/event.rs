use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub i64);

/// A scheduled meetup users can register for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub title: String,
    pub date: NaiveDate,
    pub location: String,
    pub map_point: String,
    pub note: String,
}

/// Event fields before the store assigns an id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    pub title: String,
    pub date: NaiveDate,
    pub location: String,
    pub map_point: String,
    pub note: String,
}

impl NewEvent {
    pub fn with_id(self, id: EventId) -> Event {
        Event {
            id,
            title: self.title,
            date: self.date,
            location: self.location,
            map_point: self.map_point,
            note: self.note,
        }
    }
}

impl Event {
    pub fn is_upcoming(&self, today: NaiveDate) -> bool {
        self.date >= today
    }
}
