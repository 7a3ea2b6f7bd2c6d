use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical user-activity signals a host can forward to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityEvent {
    PointerDown,
    PointerMove,
    KeyPress,
    Scroll,
    TouchStart,
    Click,
}

impl ActivityEvent {
    pub const ALL: [ActivityEvent; 6] = [
        ActivityEvent::PointerDown,
        ActivityEvent::PointerMove,
        ActivityEvent::KeyPress,
        ActivityEvent::Scroll,
        ActivityEvent::TouchStart,
        ActivityEvent::Click,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActivityEvent::PointerDown => "pointer_down",
            ActivityEvent::PointerMove => "pointer_move",
            ActivityEvent::KeyPress => "key_press",
            ActivityEvent::Scroll => "scroll",
            ActivityEvent::TouchStart => "touch_start",
            ActivityEvent::Click => "click",
        }
    }
}

impl fmt::Display for ActivityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
