//! Business data accumulated by the fulfillment saga.

use common::BusinessKey;
use serde::{Deserialize, Serialize};

use super::{Money, OrderLine};

/// Data carried across the steps of one order.
///
/// Identifiers returned by downstream services are write-once: once set they
/// can only be confirmed, never replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentData {
    pub order_id: Option<BusinessKey>,
    pub customer_email: String,
    pub amount: Option<Money>,
    #[serde(default)]
    pub lines: Vec<OrderLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl FulfillmentData {
    /// Records why the saga unwound. The first reason wins.
    pub fn record_failure(&mut self, reason: &str) {
        if self.failure_reason.is_none() {
            self.failure_reason = Some(reason.to_string());
        }
    }
}
