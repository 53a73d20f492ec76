//! Enrichment progress on stderr.
//!
//! `mart enrich` reports one line per image so long runs over large channel
//! directories show where they are. Stdout is left to the batch summary.

use serde::Serialize;
use std::io::Write;

/// What enrichment just did.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EnrichProgressEvent {
    ChannelStarted {
        channel: String,
        images: u64,
    },
    ImageDone {
        channel: String,
        file_name: String,
        n: u64,
        total: u64,
        ok: bool,
    },
}

impl EnrichProgressEvent {
    fn human_line(&self) -> String {
        match self {
            Self::ChannelStarted { channel, images } => {
                format!("[{}] {} image(s)", channel, images)
            }
            Self::ImageDone {
                channel,
                file_name,
                n,
                total,
                ok,
            } => format!(
                "[{}] {}/{} {} {}",
                channel,
                n,
                total,
                file_name,
                if *ok { "ok" } else { "failed" }
            ),
        }
    }
}

/// Receives enrichment events as they happen.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: EnrichProgressEvent);
}

/// `--progress off|human|json`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human lines on an interactive stderr, nothing otherwise.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            Self::Human
        } else {
            Self::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "human" => Some(Self::Human),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    fn render(&self, event: &EnrichProgressEvent) -> Option<String> {
        match self {
            Self::Off => None,
            Self::Human => Some(event.human_line()),
            Self::Json => serde_json::to_string(event).ok(),
        }
    }
}

impl ProgressReporter for ProgressMode {
    fn report(&self, event: EnrichProgressEvent) {
        if let Some(line) = self.render(&event) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_done(ok: bool) -> EnrichProgressEvent {
        EnrichProgressEvent::ImageDone {
            channel: "CheMed123".into(),
            file_name: "11.jpg".into(),
            n: 3,
            total: 12,
            ok,
        }
    }

    #[test]
    fn parse_modes() {
        assert_eq!(ProgressMode::parse("json"), Some(ProgressMode::Json));
        assert_eq!(ProgressMode::parse("off"), Some(ProgressMode::Off));
        assert_eq!(ProgressMode::parse("loud"), None);
    }

    #[test]
    fn renders_per_mode() {
        assert_eq!(ProgressMode::Off.render(&image_done(true)), None);
        assert_eq!(
            ProgressMode::Human.render(&image_done(false)).unwrap(),
            "[CheMed123] 3/12 11.jpg failed"
        );

        let line = ProgressMode::Json.render(&image_done(true)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "image_done");
        assert_eq!(value["total"], 12);
        assert_eq!(value["ok"], true);
    }
}
