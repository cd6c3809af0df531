//! Host side of the hardware bridge: persistence requests and editor actions.

use std::path::PathBuf;

use hob_core::{BridgeAction, Data, HardwareBridge, Object};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::persist;

/// Forwards object writes to the writer task; logs everything else.
pub struct ServerBridge {
    writes: mpsc::UnboundedSender<Object>,
}

impl ServerBridge {
    pub fn new(writes: mpsc::UnboundedSender<Object>) -> Self {
        Self { writes }
    }
}

impl HardwareBridge for ServerBridge {
    fn data(&mut self, object: &str, frame: &str, node: &str, data: &Data) {
        trace!(object, frame, node, value = data.value, "node value");
    }

    fn actions(&mut self, action: &BridgeAction) {
        match serde_json::to_string(action) {
            Ok(s) => debug!(action = %s, "editor action"),
            Err(e) => warn!("unserializable action: {e}"),
        }
    }

    fn write(&mut self, object: &Object) {
        if self.writes.send(object.clone()).is_err() {
            warn!(object = %object.id, "writer gone; object not saved");
        }
    }
}

/// Save objects as write requests arrive. Pending requests are flushed on shutdown.
pub async fn run_writer(
    dir: PathBuf,
    mut rx: mpsc::UnboundedReceiver<Object>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            next = rx.recv() => {
                let Some(object) = next else { return };
                save(&dir, &object);
            }
            _ = shutdown.recv() => {
                while let Ok(object) = rx.try_recv() {
                    save(&dir, &object);
                }
                debug!("writer shutting down");
                return;
            }
        }
    }
}

fn save(dir: &std::path::Path, object: &Object) {
    if let Err(e) = persist::save_object(dir, object) {
        warn!(object = %object.id, "save failed: {e}");
    }
}
