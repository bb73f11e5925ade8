use chrono::Utc;
use common::{Toast, ToastVariant};

/// The single notification slot shown to the operator.
#[derive(Debug, Clone, Default)]
pub struct ToastSlot {
    current: Toast,
}

impl ToastSlot {
    pub fn show(&mut self, message: impl Into<String>, variant: ToastVariant) {
        self.current = Toast {
            variant,
            title: variant.name().to_string(),
            message: message.into(),
            show: true,
            raised_at: Some(Utc::now()),
        };
    }

    pub fn dismiss(&mut self) {
        self.current = Toast::default();
    }

    pub fn current(&self) -> &Toast {
        &self.current
    }
}
