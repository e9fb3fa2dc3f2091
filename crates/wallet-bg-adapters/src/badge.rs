use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;

use wallet_bg_core::{ActionBadgePort, NotificationMode, PortError, WindowId};

/// Headless stand-in for the browser action: badge text and popup windows
/// become log lines.
#[derive(Debug, Default)]
pub struct TracingBadge {
    next_window: AtomicU64,
    pending: AtomicUsize,
}

impl TracingBadge {
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionBadgePort for TracingBadge {
    async fn set_badge(&self, pending: usize) -> Result<(), PortError> {
        self.pending.store(pending, Ordering::SeqCst);
        if pending == 0 {
            tracing::info!("badge cleared");
        } else {
            tracing::info!(pending, "badge updated");
        }
        Ok(())
    }

    async fn open_popup_window(&self, mode: NotificationMode) -> Result<WindowId, PortError> {
        let window = WindowId(self.next_window.fetch_add(1, Ordering::SeqCst) + 1);
        tracing::info!(window = window.0, ?mode, "confirmation window opened");
        Ok(window)
    }

    async fn close_popup_window(&self, window: WindowId) -> Result<(), PortError> {
        tracing::info!(window = window.0, "confirmation window closed");
        Ok(())
    }
}
