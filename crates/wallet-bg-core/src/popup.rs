use std::sync::{PoisonError, RwLock};

use crate::domain::{NotificationMode, WindowId};
use crate::ports::{ActionBadgePort, PortError};

/// Keeps at most one confirmation window open and the badge in step with
/// the number of pending requests.
pub struct PopupCoordinator<B> {
    badge: B,
    window: tokio::sync::Mutex<Option<WindowId>>,
    mode: RwLock<NotificationMode>,
}

impl<B: ActionBadgePort> PopupCoordinator<B> {
    pub fn new(badge: B, mode: NotificationMode) -> Self {
        Self {
            badge,
            window: tokio::sync::Mutex::new(None),
            mode: RwLock::new(mode),
        }
    }

    pub fn badge(&self) -> &B {
        &self.badge
    }

    pub fn notification_mode(&self) -> NotificationMode {
        *self.mode.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_notification_mode(&self, mode: NotificationMode) {
        *self.mode.write().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    pub async fn current_window(&self) -> Option<WindowId> {
        *self.window.lock().await
    }

    /// Opens the confirmation window unless one is already open. The lock is
    /// held across the open call, so concurrent callers share one window.
    pub async fn popup_open(&self) -> Result<Option<WindowId>, PortError> {
        let mode = self.notification_mode();
        if mode == NotificationMode::Extension {
            return Ok(None);
        }
        let mut window = self.window.lock().await;
        if let Some(open) = *window {
            return Ok(Some(open));
        }
        let opened = self.badge.open_popup_window(mode).await?;
        tracing::debug!(window = opened.0, ?mode, "popup opened");
        *window = Some(opened);
        Ok(Some(opened))
    }

    pub async fn popup_close(&self) -> Result<(), PortError> {
        let mut window = self.window.lock().await;
        if let Some(open) = *window {
            self.badge.close_popup_window(open).await?;
            tracing::debug!(window = open.0, "popup closed");
            *window = None;
        }
        Ok(())
    }

    /// The user closed `window` themselves.
    pub async fn window_closed(&self, closed: WindowId) {
        let mut window = self.window.lock().await;
        if *window == Some(closed) {
            *window = None;
        }
    }

    /// Shows `pending` on the badge. With nothing pending the badge is
    /// cleared and, when `should_close`, the window closed; otherwise a
    /// window is opened if none is.
    pub async fn update_icon(&self, pending: usize, should_close: bool) -> Result<(), PortError> {
        self.badge.set_badge(pending).await?;
        if pending == 0 {
            if should_close {
                self.popup_close().await?;
            }
            return Ok(());
        }
        self.popup_open().await.map(|_| ())
    }

    /// Badge only; used for requests raised by the wallet's own pages.
    pub async fn refresh_badge(&self, pending: usize) -> Result<(), PortError> {
        self.badge.set_badge(pending).await
    }
}
