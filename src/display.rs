//! Front-end surface the session engine pushes state to

/// Status, chat text and emotion sink
///
/// Called only from the dispatcher thread.
pub trait Display: Send {
    fn update_status(&mut self, status: &str);

    fn update_text(&mut self, text: &str);

    /// Emoji for the current emotion
    fn update_emotion(&mut self, emoji: &str);

    fn update_volume(&mut self, percent: u8) {
        tracing::debug!("Volume set to {}%", percent);
    }
}

/// Emoji shown for unknown emotion tags
pub const NEUTRAL_EMOJI: &str = "😶";

const EMOTIONS: [(&str, &str); 21] = [
    ("neutral", NEUTRAL_EMOJI),
    ("happy", "🙂"),
    ("laughing", "😆"),
    ("funny", "😂"),
    ("sad", "😔"),
    ("angry", "😠"),
    ("crying", "😭"),
    ("loving", "😍"),
    ("embarrassed", "😳"),
    ("surprised", "😲"),
    ("shocked", "😱"),
    ("thinking", "🤔"),
    ("winking", "😉"),
    ("cool", "😎"),
    ("relaxed", "😌"),
    ("delicious", "🤤"),
    ("kissy", "😘"),
    ("confident", "😏"),
    ("sleepy", "😴"),
    ("silly", "😜"),
    ("confused", "🙄"),
];

/// Map an `llm` emotion tag to its emoji
pub fn emotion_emoji(tag: &str) -> &'static str {
    EMOTIONS
        .iter()
        .find(|(name, _)| *name == tag)
        .map(|(_, emoji)| *emoji)
        .unwrap_or(NEUTRAL_EMOJI)
}

/// Display that only writes log lines, for headless devices
#[derive(Debug, Default)]
pub struct TracingDisplay {
    status: String,
}

impl TracingDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> &str {
        &self.status
    }
}

impl Display for TracingDisplay {
    fn update_status(&mut self, status: &str) {
        if self.status != status {
            tracing::info!("[status] {}", status);
            self.status = status.to_string();
        }
    }

    fn update_text(&mut self, text: &str) {
        tracing::info!("[text] {}", text);
    }

    fn update_emotion(&mut self, emoji: &str) {
        tracing::info!("[emotion] {}", emoji);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emotion_lookup() {
        assert_eq!(emotion_emoji("happy"), "🙂");
        assert_eq!(emotion_emoji("confused"), "🙄");
        assert_eq!(emotion_emoji("bewildered"), NEUTRAL_EMOJI);
        assert_eq!(emotion_emoji(""), NEUTRAL_EMOJI);
    }

    #[test]
    fn test_tracing_display_keeps_last_status() {
        let mut display = TracingDisplay::new();
        display.update_status("Standby");
        display.update_status("Standby");
        assert_eq!(display.status(), "Standby");
    }
}
