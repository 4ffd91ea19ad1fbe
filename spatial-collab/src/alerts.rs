//! User-facing notifications raised by the session.

use std::fmt;

/// Something the user should be told about, delivered on the alert channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAlert {
    /// The host ended the session; local diagrams and anchor are gone.
    SessionEnded { host: String, message: String },
    /// A participant left the session.
    ParticipantLeft { peer_name: String },
}

impl SessionAlert {
    pub fn title(&self) -> &'static str {
        match self {
            SessionAlert::SessionEnded { .. } => "Session Ended",
            SessionAlert::ParticipantLeft { .. } => "Participant Left",
        }
    }
}

impl fmt::Display for SessionAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionAlert::SessionEnded { host, message } => write!(f, "{}: {}", host, message),
            SessionAlert::ParticipantLeft { peer_name } => write!(f, "{} left the session", peer_name),
        }
    }
}
