//! Decides whether newly fetched messages deserve a notification, and with
//! what payload. Delivery itself is left to a [`NotificationSink`].

mod sink;
mod trigger;

pub use sink::{NotificationSink, TracingSink};
pub use trigger::{NotificationKind, NotificationRequest, NotificationTrigger};
