use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::queue::QueueOptions;
use crate::worker::{ProcessorSettings, SubStepFailurePolicy};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version)]
pub struct ConfigContext {
    #[arg(
        short = 'l',
        long = "listen",
        env = "LYRICQ_LISTEN",
        help = "Address the HTTP API listens on",
        default_value = "127.0.0.1:3001"
    )]
    pub listen: SocketAddr,

    #[arg(
        long = "upload_dir",
        env = "LYRICQ_UPLOAD_DIR",
        help = "Directory for uploaded audio, lyrics and images",
        default_value = "uploads"
    )]
    pub upload_dir: PathBuf,

    #[arg(
        long = "output_dir",
        env = "LYRICQ_OUTPUT_DIR",
        help = "Directory rendered videos are written to",
        default_value = "renders"
    )]
    pub output_dir: PathBuf,

    #[arg(
        short = 'r',
        long = "renderer",
        env = "LYRICQ_RENDERER",
        help = "Renderer command line",
        default_value = "npx remotion"
    )]
    pub renderer: String,

    #[arg(
        short = 'e',
        long = "entry_point",
        env = "LYRICQ_ENTRY_POINT",
        help = "Renderer project entry point",
        default_value = "remotion/index.ts"
    )]
    pub entry_point: PathBuf,

    #[arg(
        long = "composition",
        env = "LYRICQ_COMPOSITION",
        help = "Composition id to render",
        default_value = "LyricsVideo"
    )]
    pub composition_id: String,

    #[arg(
        long = "event_capacity",
        env = "LYRICQ_EVENT_CAPACITY",
        help = "Capacity of the scheduler wake-up channel",
        default_value = "64"
    )]
    pub event_capacity: usize,

    #[arg(
        long = "cancel_cooldown_ms",
        env = "LYRICQ_CANCEL_COOLDOWN_MS",
        help = "Pause after a cancel before the next job is claimed",
        default_value = "1000"
    )]
    pub cancel_cooldown_ms: u64,

    #[arg(
        long = "on_variant_error",
        env = "LYRICQ_ON_VARIANT_ERROR",
        help = "Whether a failed video type stops the rest of its job",
        value_enum,
        default_value_t = SubStepFailurePolicy::Continue
    )]
    pub failure_policy: SubStepFailurePolicy,

    #[arg(
        long = "jaeger_endpoint",
        env = "LYRICQ_JAEGER_ENDPOINT",
        help = "Jaeger collector endpoint, e.g. http://jaeger:14268/api/traces"
    )]
    pub jaeger_endpoint: Option<String>,
}

impl ConfigContext {
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            event_capacity: self.event_capacity,
            cancel_cooldown: Duration::from_millis(self.cancel_cooldown_ms),
        }
    }

    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            entry_point: self.entry_point.clone(),
            composition_id: self.composition_id.clone(),
            output_dir: self.output_dir.clone(),
            failure_policy: self.failure_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_a_local_setup() {
        let config = ConfigContext::try_parse_from(["lyricq"]).unwrap();
        assert_eq!(config.listen, "127.0.0.1:3001".parse().unwrap());
        assert_eq!(config.failure_policy, SubStepFailurePolicy::Continue);
        assert_eq!(config.queue_options().cancel_cooldown, Duration::from_secs(1));
        assert_eq!(config.processor_settings().composition_id, "LyricsVideo");
    }

    #[test]
    fn failure_policy_is_selectable() {
        let config = ConfigContext::try_parse_from([
            "lyricq",
            "--on_variant_error",
            "abort",
            "--cancel_cooldown_ms",
            "250",
        ])
        .unwrap();
        assert_eq!(config.failure_policy, SubStepFailurePolicy::Abort);
        assert_eq!(config.queue_options().cancel_cooldown, Duration::from_millis(250));
    }
}
