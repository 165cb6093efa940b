//! The concrete capabilities behind the built-in catalog.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use regex::{Regex, RegexBuilder};

use meetbot_core::capability::{
    CapabilityError, CapabilityRegistry, ImageArtifact, ImageProducer, Responder, Validator,
    ValidatorInput,
};
use meetbot_core::config::{BotConfig, DEFAULT_DATE_FORMAT};
use meetbot_core::domain::event::Event;
use meetbot_core::session::{ScenarioContext, UserSession};
use meetbot_db::EventRepository;

use crate::ticket::{Ticket, TicketRenderer, TICKET_CONTENT_TYPE, TICKET_FILE_NAME};

pub const GREETING: &str = "greeting";
pub const POLITE_GREETING: &str = "polite_greeting";
pub const CLOSEST_EVENT_DATE: &str = "closest_event_date";
pub const CLOSEST_EVENT_LOCATION: &str = "closest_event_location";
pub const NAME_VALIDATOR: &str = "name";
pub const EMAIL_VALIDATOR: &str = "email";
pub const SAVE_REGISTRATION: &str = "save_registration";
pub const TICKET: &str = "ticket";

/// Scenario context field the name validator fills.
pub const NAME_FIELD: &str = "name";
/// Scenario context field the e-mail validator fills.
pub const EMAIL_FIELD: &str = "email";

pub const NO_EVENTS_ANSWER: &str = "В настоящее время нет запланированных мероприятий!";

const NAME_PATTERN: &str = r"^[a-zА-Я].{0,24}$";
const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9.-]+$";

/// Local wall clock, replaceable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

#[derive(Clone)]
pub struct CapabilitySettings {
    pub date_format: String,
    pub clock: Arc<dyn Clock>,
}

impl Default for CapabilitySettings {
    fn default() -> Self {
        Self { date_format: DEFAULT_DATE_FORMAT.to_owned(), clock: Arc::new(SystemClock) }
    }
}

impl CapabilitySettings {
    pub fn from_config(bot: &BotConfig) -> Self {
        Self { date_format: bot.date_format.clone(), ..Self::default() }
    }

    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    fn format_date(&self, date: NaiveDate) -> Result<String, String> {
        let mut formatted = String::new();
        write!(formatted, "{}", date.format(&self.date_format))
            .map_err(|_| format!("date format `{}` is invalid", self.date_format))?;
        Ok(formatted)
    }
}

/// Registers every capability the built-in catalog references.
pub fn default_registry(
    events: Arc<dyn EventRepository>,
    settings: CapabilitySettings,
) -> Result<CapabilityRegistry, CapabilityError> {
    let renderer =
        TicketRenderer::new().map_err(|error| CapabilityError::failed(TICKET, error.to_string()))?;

    let mut registry = CapabilityRegistry::new();
    registry.register_responder(GREETING, Greeting);
    registry.register_responder(POLITE_GREETING, PoliteGreeting { clock: settings.clock.clone() });
    registry.register_responder(
        CLOSEST_EVENT_DATE,
        ClosestEventDate { events: events.clone(), settings: settings.clone() },
    );
    registry.register_responder(
        CLOSEST_EVENT_LOCATION,
        ClosestEventLocation { events: events.clone(), settings: settings.clone() },
    );
    registry.register_validator(NAME_VALIDATOR, PatternValidator::name()?);
    registry.register_validator(EMAIL_VALIDATOR, PatternValidator::email()?);
    registry.register_validator(
        SAVE_REGISTRATION,
        SaveRegistration { events: events.clone(), clock: settings.clock.clone() },
    );
    registry.register_image_producer(TICKET, TicketProducer { events, settings, renderer });
    Ok(registry)
}

async fn closest_event(
    capability: &str,
    events: &dyn EventRepository,
    today: NaiveDate,
) -> Result<Option<Event>, CapabilityError> {
    events
        .closest_event(today)
        .await
        .map_err(|error| CapabilityError::failed(capability, error.to_string()))
}

pub struct Greeting;

#[async_trait]
impl Responder for Greeting {
    async fn respond(
        &self,
        session: &UserSession,
        _utterance: &str,
    ) -> Result<String, CapabilityError> {
        Ok(match &session.declared_name {
            Some(name) => format!("Привет, {name}!"),
            None => "Привет!".to_owned(),
        })
    }
}

pub struct PoliteGreeting {
    clock: Arc<dyn Clock>,
}

/// Greeting for the hour: night before 6, morning before 12, day before 18, evening after.
pub fn time_of_day_greeting(hour: u32) -> &'static str {
    match hour {
        0..=5 => "Доброй ночи",
        6..=11 => "Доброе утро",
        12..=17 => "Добрый день",
        _ => "Добрый вечер",
    }
}

#[async_trait]
impl Responder for PoliteGreeting {
    async fn respond(
        &self,
        session: &UserSession,
        _utterance: &str,
    ) -> Result<String, CapabilityError> {
        let greeting = time_of_day_greeting(self.clock.now().hour());
        Ok(match &session.declared_name {
            Some(name) => format!("{greeting}, {name}!"),
            None => format!("{greeting}!"),
        })
    }
}

pub struct ClosestEventDate {
    events: Arc<dyn EventRepository>,
    settings: CapabilitySettings,
}

#[async_trait]
impl Responder for ClosestEventDate {
    async fn respond(
        &self,
        _session: &UserSession,
        _utterance: &str,
    ) -> Result<String, CapabilityError> {
        let today = self.settings.clock.today();
        let Some(event) = closest_event(CLOSEST_EVENT_DATE, self.events.as_ref(), today).await?
        else {
            return Ok(NO_EVENTS_ANSWER.to_owned());
        };
        let date = self
            .settings
            .format_date(event.date)
            .map_err(|message| CapabilityError::failed(CLOSEST_EVENT_DATE, message))?;
        Ok(format!("{} состоится {date}", event.title))
    }
}

pub struct ClosestEventLocation {
    events: Arc<dyn EventRepository>,
    settings: CapabilitySettings,
}

#[async_trait]
impl Responder for ClosestEventLocation {
    async fn respond(
        &self,
        _session: &UserSession,
        _utterance: &str,
    ) -> Result<String, CapabilityError> {
        let today = self.settings.clock.today();
        let Some(event) =
            closest_event(CLOSEST_EVENT_LOCATION, self.events.as_ref(), today).await?
        else {
            return Ok(NO_EVENTS_ANSWER.to_owned());
        };
        Ok(format!("{} состоится в {}.\r\n{}", event.title, event.location, event.map_point))
    }
}

/// Accepts utterances matching a pattern and stores them under `field`.
pub struct PatternValidator {
    pattern: Regex,
    field: &'static str,
}

impl PatternValidator {
    pub fn new(pattern: Regex, field: &'static str) -> Self {
        Self { pattern, field }
    }

    /// Starts with a letter, at most 25 characters.
    pub fn name() -> Result<Self, CapabilityError> {
        Self::compile(NAME_VALIDATOR, NAME_PATTERN, NAME_FIELD)
    }

    pub fn email() -> Result<Self, CapabilityError> {
        Self::compile(EMAIL_VALIDATOR, EMAIL_PATTERN, EMAIL_FIELD)
    }

    fn compile(
        capability: &str,
        pattern: &str,
        field: &'static str,
    ) -> Result<Self, CapabilityError> {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|error| CapabilityError::failed(capability, error.to_string()))?;
        Ok(Self::new(pattern, field))
    }
}

#[async_trait]
impl Validator for PatternValidator {
    async fn validate(
        &self,
        input: ValidatorInput<'_>,
        context: &mut ScenarioContext,
    ) -> Result<bool, CapabilityError> {
        if !self.pattern.is_match(input.utterance) {
            return Ok(false);
        }
        context.insert(self.field.to_owned(), input.utterance.to_owned());
        Ok(true)
    }
}

/// Completion hook: registers the user for the closest upcoming event.
pub struct SaveRegistration {
    events: Arc<dyn EventRepository>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl Validator for SaveRegistration {
    async fn validate(
        &self,
        input: ValidatorInput<'_>,
        _context: &mut ScenarioContext,
    ) -> Result<bool, CapabilityError> {
        let today = self.clock.today();
        let Some(event) = closest_event(SAVE_REGISTRATION, self.events.as_ref(), today).await?
        else {
            tracing::warn!(
                event_name = "agent.registration.no_event",
                user_id = %input.user_id,
                "no upcoming event to register for"
            );
            return Ok(true);
        };

        match self.events.register_visitor(event.id, input.user_id).await {
            Ok(()) => {
                tracing::info!(
                    event_name = "agent.registration.saved",
                    user_id = %input.user_id,
                    event_id = event.id.0,
                    "user registered for event"
                );
                Ok(true)
            }
            Err(error) if error.is_duplicate() => {
                tracing::info!(
                    event_name = "agent.registration.duplicate",
                    user_id = %input.user_id,
                    event_id = event.id.0,
                    "user is already registered for this event"
                );
                Ok(true)
            }
            Err(error) => Err(CapabilityError::failed(SAVE_REGISTRATION, error.to_string())),
        }
    }
}

pub struct TicketProducer {
    events: Arc<dyn EventRepository>,
    settings: CapabilitySettings,
    renderer: TicketRenderer,
}

#[async_trait]
impl ImageProducer for TicketProducer {
    async fn produce(&self, context: &ScenarioContext) -> Result<ImageArtifact, CapabilityError> {
        let field = |name: &str| {
            context
                .get(name)
                .cloned()
                .ok_or_else(|| CapabilityError::failed(TICKET, format!("context has no `{name}`")))
        };
        let attendee = field(NAME_FIELD)?;
        let email = field(EMAIL_FIELD)?;

        let today = self.settings.clock.today();
        let event = closest_event(TICKET, self.events.as_ref(), today)
            .await?
            .ok_or_else(|| CapabilityError::failed(TICKET, "no upcoming event"))?;
        let date = self
            .settings
            .format_date(event.date)
            .map_err(|message| CapabilityError::failed(TICKET, message))?;

        let svg = self
            .renderer
            .render(&Ticket {
                title: event.title,
                attendee,
                email,
                when_where: format!("{date}, {}", event.location),
                note: event.note,
            })
            .map_err(|error| CapabilityError::failed(TICKET, error.to_string()))?;

        Ok(ImageArtifact {
            file_name: TICKET_FILE_NAME.to_owned(),
            content_type: TICKET_CONTENT_TYPE.to_owned(),
            bytes: svg.into_bytes(),
        })
    }
}
