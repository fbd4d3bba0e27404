//! Transparent pass-through that logs what crosses it.

use std::sync::Arc;

use chainwall_config::LoggerSettings;
use chainwall_core::{Context, Kind, Links, Tunnel, Worker};
use tracing::debug;

/// Logs payload previews and lifecycle transitions at debug level. Holds no
/// per-connection state and never fails.
pub struct LoggerTunnel {
    links: Links,
    upstream_preview: usize,
    downstream_preview: usize,
}

impl LoggerTunnel {
    pub fn new(settings: &LoggerSettings) -> Arc<Self> {
        Arc::new(Self {
            links: Links::new(),
            upstream_preview: settings.upstream_preview,
            downstream_preview: settings.downstream_preview,
        })
    }

    fn log(&self, direction: &'static str, ctx: &Context, preview: usize) {
        let line = ctx.line().id();
        match ctx.kind() {
            Kind::Payload(buf) => debug!(
                line,
                direction,
                len = buf.len(),
                first = ctx.is_first(),
                data = %String::from_utf8_lossy(&buf[..buf.len().min(preview)]),
                "payload"
            ),
            Kind::Init => debug!(line, direction, "init"),
            Kind::Established => debug!(line, direction, "est"),
            Kind::Fin => debug!(line, direction, "fin"),
        }
    }
}

impl Tunnel for LoggerTunnel {
    fn kind(&self) -> &'static str {
        "Logger"
    }

    fn links(&self) -> &Links {
        &self.links
    }

    fn upstream(&self, ctx: Context, worker: &Worker) {
        self.log("upstream", &ctx, self.upstream_preview);
        self.forward_up(ctx, worker);
    }

    fn downstream(&self, ctx: Context, worker: &Worker) {
        self.log("downstream", &ctx, self.downstream_preview);
        self.forward_down(ctx, worker);
    }
}
