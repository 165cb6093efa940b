pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_config, connect_with_settings, ping, DbPool};
pub use fixtures::{demo_events, seed_demo_events, SeedResult};
pub use repositories::{
    EventRepository, InMemoryEventRepository, InMemorySessionStore, RepositoryError,
    SessionStore, SqlEventRepository, SqlSessionStore,
};
