//! Status axes of an order.
//!
//! The call-center, delivery and communication axes move independently. The
//! first two carry an explicit transition table; communication is a free
//! annotation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallCenterStatus {
    #[default]
    New,
    Confirmed,
    Canceled,
    NoResponse,
    Pending,
    DoubleOrder,
    Delayed,
}

impl CallCenterStatus {
    pub const ALL: [CallCenterStatus; 7] = [
        Self::New, Self::Confirmed, Self::Canceled, Self::NoResponse,
        Self::Pending, Self::DoubleOrder, Self::Delayed,
    ];

    /// Statuses a staff member may move an order into from `self`.
    pub fn allowed_next(self) -> &'static [CallCenterStatus] {
        use CallCenterStatus::*;
        match self {
            New | Pending | Delayed | DoubleOrder | NoResponse => {
                &[Confirmed, Canceled, NoResponse, Pending, DoubleOrder, Delayed]
            }
            Confirmed => &[Canceled, NoResponse],
            Canceled => &[],
        }
    }

    pub fn can_transition_to(self, next: CallCenterStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    /// Statuses that `set_status` may write without side effects.
    pub fn is_free_form(self) -> bool {
        matches!(self, Self::Pending | Self::DoubleOrder | Self::Delayed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Confirmed => "CONFIRMED",
            Self::Canceled => "CANCELED",
            Self::NoResponse => "NO_RESPONSE",
            Self::Pending => "PENDING",
            Self::DoubleOrder => "DOUBLE_ORDER",
            Self::Delayed => "DELAYED",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    #[default]
    NotReady,
    Ready,
    InTransit,
    Done,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 4] = [Self::NotReady, Self::Ready, Self::InTransit, Self::Done];

    /// Delivery only moves forward, one step at a time.
    pub fn allowed_next(self) -> &'static [DeliveryStatus] {
        match self {
            Self::NotReady => &[Self::Ready],
            Self::Ready => &[Self::InTransit],
            Self::InTransit => &[Self::Done],
            Self::Done => &[],
        }
    }

    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotReady => "NOT_READY",
            Self::Ready => "READY",
            Self::InTransit => "IN_TRANSIT",
            Self::Done => "DONE",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommunicationStatus {
    Answered,
    DidntAnswer,
    SmsSent,
}

impl CommunicationStatus {
    pub const ALL: [CommunicationStatus; 3] = [Self::Answered, Self::DidntAnswer, Self::SmsSent];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Answered => "ANSWERED",
            Self::DidntAnswer => "DIDNT_ANSWER",
            Self::SmsSent => "SMS_SENT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

macro_rules! status_text {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
        }
        impl FromStr for $ty {
            type Err = UnknownStatus;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::ALL.into_iter().find(|v| v.as_str() == s).ok_or_else(|| UnknownStatus(s.to_string()))
            }
        }
    )*};
}

status_text!(CallCenterStatus, DeliveryStatus, CommunicationStatus);
