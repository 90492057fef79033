//! Gateway order states and their partition.

use std::fmt;

/// Class of an order state; drives every retry and pass/fail decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// Payment went through or is on its way.
    Successful,
    /// Payment is final and failed.
    Unsuccessful,
    /// Gateway has not recorded the order yet.
    Indeterminate,
}

/// Order state reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    /// Card authorized, redirect still in flight.
    InProgress,
    /// Card authorized.
    PaymentAuthorized,
    /// Delivery confirmed, funds captured.
    Complete,
    /// Waiting for a wire transfer.
    WaitingPayment,
    /// Wire transfer arrived.
    PaymentReceived,
    /// Refunded.
    Refund,
    /// Card declined.
    CardNotAuthorized,
    /// Rejected as fraud.
    Fraud,
    /// Test transaction.
    Test,
    /// Payer did not finish in time.
    Timeout,
    /// Order not (yet) known to the gateway.
    NotFound,
    /// Anything else; treated as unsuccessful.
    Unknown(String),
}

impl OrderStatus {
    /// Parses a status string. Surrounding whitespace is ignored.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "IN_PROGRESS" => Self::InProgress,
            "PAYMENT_AUTHORIZED" => Self::PaymentAuthorized,
            "COMPLETE" => Self::Complete,
            "WAITING_PAYMENT" => Self::WaitingPayment,
            "PAYMENT_RECEIVED" => Self::PaymentReceived,
            "REFUND" => Self::Refund,
            "CARD_NOTAUTHORIZED" => Self::CardNotAuthorized,
            "FRAUD" => Self::Fraud,
            "TEST" => Self::Test,
            "TIMEOUT" => Self::Timeout,
            "NOT_FOUND" => Self::NotFound,
            other => Self::Unknown(other.to_owned()),
        }
    }

    /// Wire representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::PaymentAuthorized => "PAYMENT_AUTHORIZED",
            Self::Complete => "COMPLETE",
            Self::WaitingPayment => "WAITING_PAYMENT",
            Self::PaymentReceived => "PAYMENT_RECEIVED",
            Self::Refund => "REFUND",
            Self::CardNotAuthorized => "CARD_NOTAUTHORIZED",
            Self::Fraud => "FRAUD",
            Self::Test => "TEST",
            Self::Timeout => "TIMEOUT",
            Self::NotFound => "NOT_FOUND",
            Self::Unknown(raw) => raw,
        }
    }

    /// Partition of this state as a payment outcome. Unknown states are unsuccessful.
    ///
    /// `REFUND` and `PAYMENT_RECEIVED` only mean something to a legacy IPN
    /// (see [`Self::is_confirmable`]); as a redirect outcome they fail.
    #[must_use]
    pub const fn partition(&self) -> Partition {
        match self {
            Self::InProgress | Self::PaymentAuthorized | Self::Complete | Self::WaitingPayment => {
                Partition::Successful
            }
            Self::PaymentReceived
            | Self::Refund
            | Self::CardNotAuthorized
            | Self::Fraud
            | Self::Test
            | Self::Timeout
            | Self::Unknown(_) => Partition::Unsuccessful,
            Self::NotFound => Partition::Indeterminate,
        }
    }

    /// Shorthand for `partition() == Partition::Successful`.
    #[must_use]
    pub const fn is_successful(&self) -> bool {
        matches!(self.partition(), Partition::Successful)
    }

    /// `true` for a state outside every known set.
    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }

    /// States a legacy IPN may confirm.
    ///
    /// Independent of [`Self::partition`]: adds `REFUND` and `PAYMENT_RECEIVED`
    /// and leaves out `IN_PROGRESS` and `WAITING_PAYMENT`.
    #[must_use]
    pub const fn is_confirmable(&self) -> bool {
        matches!(
            self,
            Self::PaymentAuthorized | Self::Complete | Self::Refund | Self::PaymentReceived
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition() {
        assert_eq!(OrderStatus::parse("WAITING_PAYMENT").partition(), Partition::Successful);
        assert_eq!(OrderStatus::parse(" FRAUD ").partition(), Partition::Unsuccessful);
        assert_eq!(OrderStatus::parse("NOT_FOUND").partition(), Partition::Indeterminate);
    }

    #[test]
    fn test_unknown_is_flagged_unsuccessful() {
        let status = OrderStatus::parse("EMPTY RESULT");
        assert!(status.is_unknown());
        assert!(!status.is_successful());
        assert_eq!(status.to_string(), "EMPTY RESULT");
    }

    #[test]
    fn test_confirmable_subset() {
        assert!(OrderStatus::PaymentAuthorized.is_confirmable());
        assert!(!OrderStatus::InProgress.is_confirmable());
        assert!(OrderStatus::InProgress.is_successful());
    }

    #[test]
    fn test_ipn_only_states_are_not_successful() {
        for status in [OrderStatus::Refund, OrderStatus::PaymentReceived] {
            assert!(status.is_confirmable());
            assert!(!status.is_successful());
            assert!(!status.is_unknown());
            assert_eq!(status.partition(), Partition::Unsuccessful);
        }
    }

    #[test]
    fn test_roundtrip_names() {
        for raw in ["IN_PROGRESS", "COMPLETE", "CARD_NOTAUTHORIZED", "TIMEOUT", "TEST"] {
            assert_eq!(OrderStatus::parse(raw).as_str(), raw);
        }
    }
}
