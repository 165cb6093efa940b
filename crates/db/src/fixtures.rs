use chrono::{Days, NaiveDate};

use meetbot_core::domain::event::{Event, NewEvent};

use crate::repositories::{EventRepository, RepositoryError};

const VENUE: &str = "БЦ \"Олимпия Парк\", Ленинградское ш. 39Ас2";
const VENUE_MAP: &str = "https://yandex.ru/maps/213/moscow/?ll=37.483073%2C55.837125&mode=search&oid=1807776059&ol=biz&z=17";

/// Offset of each demo meetup from the anchor date, in days.
const DEMO_SCHEDULE: &[(&str, u64, &str)] = &[
    ("Конференция Moscow Python Meetup №73", 30, "Регистрация с 10:00 до 11:00"),
    (
        "Конференция Moscow Python Meetup №74",
        115,
        "Количество мест ограничено. Необходима предварительная регистрация.",
    ),
];

/// The two demo meetups, scheduled relative to `anchor` so they stay upcoming.
pub fn demo_events(anchor: NaiveDate) -> Vec<NewEvent> {
    DEMO_SCHEDULE
        .iter()
        .map(|(title, offset, note)| NewEvent {
            title: (*title).to_owned(),
            date: anchor.checked_add_days(Days::new(*offset)).unwrap_or(anchor),
            location: VENUE.to_owned(),
            map_point: VENUE_MAP.to_owned(),
            note: (*note).to_owned(),
        })
        .collect()
}

#[derive(Debug)]
pub struct SeedResult {
    pub inserted: Vec<Event>,
    pub skipped: Vec<String>,
}

/// Inserts the demo meetups that are not present yet (matched by title).
pub async fn seed_demo_events(
    repo: &dyn EventRepository,
    anchor: NaiveDate,
) -> Result<SeedResult, RepositoryError> {
    let existing = repo.list_events().await?;
    let mut result = SeedResult { inserted: Vec::new(), skipped: Vec::new() };

    for event in demo_events(anchor) {
        if existing.iter().any(|known| known.title == event.title) {
            result.skipped.push(event.title);
            continue;
        }
        let inserted = repo.insert_event(event).await?;
        tracing::info!(
            event_name = "db.fixtures.event_seeded",
            event_id = inserted.id.0,
            title = %inserted.title,
            date = %inserted.date,
            "demo event seeded"
        );
        result.inserted.push(inserted);
    }

    Ok(result)
}
