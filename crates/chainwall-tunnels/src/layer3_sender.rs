//! Injects a chain's traffic into a separately built device chain.

use std::sync::Arc;

use chainwall_core::{Context, Kind, Links, Tunnel, Worker};
use tracing::{error, trace};

/// Forwards upstream payload and `fin` into the device tunnel's packet path.
///
/// The device chain is packet oriented and keeps no per-line state, so the
/// sender acknowledges `init` itself. Nothing ever travels back down through
/// the sender.
pub struct Layer3Sender {
    links: Links,
    device_name: String,
    device: Arc<dyn Tunnel>,
}

impl Layer3Sender {
    pub fn new(device_name: impl Into<String>, device: Arc<dyn Tunnel>) -> Arc<Self> {
        Arc::new(Self {
            links: Links::new(),
            device_name: device_name.into(),
            device,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl Tunnel for Layer3Sender {
    fn kind(&self) -> &'static str {
        "Layer3Sender"
    }

    fn links(&self) -> &Links {
        &self.links
    }

    fn upstream(&self, ctx: Context, worker: &Worker) {
        let inject = matches!(ctx.kind(), Kind::Payload(_) | Kind::Fin);
        if inject {
            trace!(line = ctx.line().id(), device = %self.device_name, len = ctx.payload_len(), "inject");
            self.device.packet_upstream(ctx, worker);
        } else if ctx.is_init() {
            let reply = Context::established(ctx.line());
            drop(ctx);
            self.forward_down(reply, worker);
        }
    }

    fn downstream(&self, ctx: Context, _worker: &Worker) {
        error!(line = ctx.line().id(), device = %self.device_name, "context reached layer-3 sender from above; discarded");
        debug_assert!(false, "Layer3Sender has no downstream path");
    }
}
