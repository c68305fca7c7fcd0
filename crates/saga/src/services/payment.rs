//! Payment service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::BusinessKey;
use domain::Money;

use crate::error::SagaError;

/// Result of a successful payment charge.
#[derive(Debug, Clone)]
pub struct PaymentReceipt {
    /// The payment reference assigned by the payment provider.
    pub payment_reference: String,
    /// The amount actually captured.
    pub amount: Money,
}

/// Trait for payment processing operations.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Charges an order.
    async fn charge(&self, order_id: &BusinessKey, amount: Money) -> Result<PaymentReceipt, SagaError>;

    /// Refunds a payment. Refunding twice is a no-op.
    async fn refund(
        &self,
        order_id: &BusinessKey,
        payment_reference: Option<&str>,
        amount: Money,
    ) -> Result<(), SagaError>;
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<String, (BusinessKey, Money)>,
    refunds: Vec<(String, Money)>,
    next_id: u32,
    fail_on_charge: bool,
    fail_on_refund: bool,
    captured_override: Option<Money>,
}

/// In-memory payment service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    /// Creates a new in-memory payment service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes charge calls decline.
    pub fn set_fail_on_charge(&self, fail: bool) {
        self.state.write().unwrap().fail_on_charge = fail;
    }

    /// Makes refund calls fail.
    pub fn set_fail_on_refund(&self, fail: bool) {
        self.state.write().unwrap().fail_on_refund = fail;
    }

    /// Makes the provider report a captured amount other than the one requested.
    pub fn set_captured_amount(&self, amount: Option<Money>) {
        self.state.write().unwrap().captured_override = amount;
    }

    /// Returns the number of captured payments not yet refunded.
    pub fn payment_count(&self) -> usize {
        self.state.read().unwrap().payments.len()
    }

    /// Returns the refunded payment references with their amounts.
    pub fn refunds(&self) -> Vec<(String, Money)> {
        self.state.read().unwrap().refunds.clone()
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn charge(&self, order_id: &BusinessKey, amount: Money) -> Result<PaymentReceipt, SagaError> {
        let mut state = self.state.write().unwrap();

        if state.fail_on_charge {
            return Err(SagaError::PaymentService("Payment declined".to_string()));
        }

        state.next_id += 1;
        let payment_reference = format!("PAY-{:04}", state.next_id);
        let captured = state.captured_override.unwrap_or(amount);
        state
            .payments
            .insert(payment_reference.clone(), (order_id.clone(), captured));

        Ok(PaymentReceipt {
            payment_reference,
            amount: captured,
        })
    }

    async fn refund(
        &self,
        order_id: &BusinessKey,
        payment_reference: Option<&str>,
        amount: Money,
    ) -> Result<(), SagaError> {
        let mut state = self.state.write().unwrap();

        if state.fail_on_refund {
            return Err(SagaError::PaymentService(
                "Refund rejected by provider".to_string(),
            ));
        }

        let reference = match payment_reference {
            Some(reference) => Some(reference.to_string()),
            None => state
                .payments
                .iter()
                .find(|(_, (owner, _))| owner == order_id)
                .map(|(reference, _)| reference.clone()),
        };
        if let Some(reference) = reference
            && state.payments.remove(&reference).is_some()
        {
            state.refunds.push((reference, amount));
        }
        Ok(())
    }
}
