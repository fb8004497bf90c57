use minijinja::{context, Environment, Value};

const QUEUED_TEMPLATE: &str = include_str!("notices/queued.j2");
const TRANSFERRED_TEMPLATE: &str = include_str!("notices/transferred.j2");
const SESSION_TIMEOUT_TEMPLATE: &str = include_str!("notices/session_timeout.j2");
const SESSION_CLOSED_TEMPLATE: &str = include_str!("notices/session_closed.j2");

/// System message shown to a visitor after the hand-off state changed.
#[derive(Debug, Clone, Copy)]
pub enum Notice<'a> {
    Queued { position: Option<i64> },
    Transferred { staff_name: &'a str },
    SessionTimeout,
    SessionClosed { staff_name: Option<&'a str> },
}

impl Notice<'_> {
    fn template(&self) -> (&'static str, &'static str) {
        match self {
            Self::Queued { .. } => ("queued", QUEUED_TEMPLATE),
            Self::Transferred { .. } => ("transferred", TRANSFERRED_TEMPLATE),
            Self::SessionTimeout => ("session_timeout", SESSION_TIMEOUT_TEMPLATE),
            Self::SessionClosed { .. } => ("session_closed", SESSION_CLOSED_TEMPLATE),
        }
    }

    fn context(&self) -> Value {
        match *self {
            Self::Queued { position } => context! { position => position },
            Self::Transferred { staff_name } => context! { staff_name => staff_name },
            Self::SessionTimeout => context! {},
            Self::SessionClosed { staff_name } => context! { staff_name => staff_name },
        }
    }

    fn fallback(&self) -> String {
        match *self {
            Self::Queued { position: Some(p) } => {
                format!("You have been added to the waiting queue at position {p}.")
            }
            Self::Queued { position: None } => "You have been added to the waiting queue.".into(),
            Self::Transferred { staff_name } => format!("You are now connected to {staff_name}."),
            Self::SessionTimeout => "You have been switched back to the AI assistant.".into(),
            Self::SessionClosed { .. } => "This support session has been closed.".into(),
        }
    }
}

pub fn render(notice: &Notice<'_>) -> String {
    let (name, source) = notice.template();
    let mut env = Environment::new();
    if env.add_template(name, source).is_err() {
        return notice.fallback();
    }

    let Ok(template) = env.get_template(name) else {
        return notice.fallback();
    };

    template
        .render(notice.context())
        .map(|text| text.trim().to_string())
        .unwrap_or_else(|_| notice.fallback())
}
