use clap::Args;
use tracing_glog::Glog;
use tracing_glog::GlogFields;
use tracing_glog::LocalTime;
use tracing_subscriber::EnvFilter;

const HEADING: Option<&str> = Some("Global Options");

/// Global arguments that apply to every subcommand.
#[derive(Debug, Args, Clone)]
pub struct GlobalArgs {
    /// Filter directive for stderr logs
    #[clap(long, env = "RUST_LOG", default_value = "warn", help_heading = HEADING, global = true)]
    pub log_level: String,
}

impl GlobalArgs {
    /// Initializes [`tracing`] config.
    pub fn init_tracing(&self) {
        let filter = EnvFilter::builder().parse_lossy(&self.log_level);

        tracing_subscriber::fmt()
            .event_format(Glog::default().with_timer(LocalTime::default()))
            .fmt_fields(GlogFields::default())
            .with_env_filter(filter)
            .init();
    }
}
