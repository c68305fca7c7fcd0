//! Shipping service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::BusinessKey;
use domain::OrderLine;

use crate::error::SagaError;

/// Trait for shipping operations.
#[async_trait]
pub trait ShippingService: Send + Sync {
    /// Creates a shipment for an order. Returns the tracking number.
    async fn create_shipment(
        &self,
        order_id: &BusinessKey,
        lines: &[OrderLine],
    ) -> Result<String, SagaError>;
}

#[derive(Debug, Default)]
struct InMemoryShippingState {
    shipments: HashMap<String, BusinessKey>,
    next_id: u32,
    fail_on_ship: bool,
}

/// In-memory shipping service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShippingService {
    state: Arc<RwLock<InMemoryShippingState>>,
}

impl InMemoryShippingService {
    /// Creates a new in-memory shipping service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes shipment creation fail.
    pub fn set_fail_on_ship(&self, fail: bool) {
        self.state.write().unwrap().fail_on_ship = fail;
    }

    /// Returns the number of shipments created.
    pub fn shipment_count(&self) -> usize {
        self.state.read().unwrap().shipments.len()
    }
}

#[async_trait]
impl ShippingService for InMemoryShippingService {
    async fn create_shipment(
        &self,
        order_id: &BusinessKey,
        _lines: &[OrderLine],
    ) -> Result<String, SagaError> {
        let mut state = self.state.write().unwrap();

        if state.fail_on_ship {
            return Err(SagaError::ShippingService(
                "Carrier unavailable".to_string(),
            ));
        }

        state.next_id += 1;
        let tracking_number = format!("TRACK-{:06}", state.next_id);
        state
            .shipments
            .insert(tracking_number.clone(), order_id.clone());

        Ok(tracking_number)
    }
}
