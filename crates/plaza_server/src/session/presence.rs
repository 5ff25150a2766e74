use std::collections::HashMap;

/// Presence attributes cached on a session.
///
/// The core only interprets `ready`; every other field is written and read
/// by handlers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceCache {
    /// Set once the client has identified itself. Only ready sessions
    /// receive broadcasts.
    pub ready: bool,
    pub display_name: Option<String>,
    pub player_id: Option<i64>,
    pub position: Option<(f32, f32)>,
    pub animation: Option<String>,
    pub direction: Option<String>,
    /// Free-form attributes for handlers that need more than the fields above.
    pub metadata: HashMap<String, String>,
}

impl PresenceCache {
    pub fn new() -> Self {
        Self::default()
    }
}
