//! Inventory service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::BusinessKey;
use domain::OrderLine;

use crate::error::SagaError;

/// Trait for inventory management operations.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Reserves stock for an order. Returns the reservation id.
    async fn reserve(&self, order_id: &BusinessKey, lines: &[OrderLine]) -> Result<String, SagaError>;

    /// Releases the reservation of an order. Releasing twice is a no-op.
    async fn release(
        &self,
        order_id: &BusinessKey,
        reservation_id: Option<&str>,
    ) -> Result<(), SagaError>;
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    reservations: HashMap<String, (BusinessKey, Vec<OrderLine>)>,
    released: Vec<String>,
    next_id: u32,
    fail_on_reserve: bool,
    fail_on_release: bool,
}

/// In-memory inventory service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    /// Creates a new in-memory inventory service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes reserve calls fail with insufficient stock.
    pub fn set_fail_on_reserve(&self, fail: bool) {
        self.state.write().unwrap().fail_on_reserve = fail;
    }

    /// Makes release calls fail.
    pub fn set_fail_on_release(&self, fail: bool) {
        self.state.write().unwrap().fail_on_release = fail;
    }

    /// Returns the number of active reservations.
    pub fn reservation_count(&self) -> usize {
        self.state.read().unwrap().reservations.len()
    }

    /// Returns true if a reservation exists with the given id.
    pub fn has_reservation(&self, reservation_id: &str) -> bool {
        self.state
            .read()
            .unwrap()
            .reservations
            .contains_key(reservation_id)
    }

    /// Returns the ids of released reservations, in release order.
    pub fn released(&self) -> Vec<String> {
        self.state.read().unwrap().released.clone()
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn reserve(&self, order_id: &BusinessKey, lines: &[OrderLine]) -> Result<String, SagaError> {
        let mut state = self.state.write().unwrap();

        if state.fail_on_reserve {
            return Err(SagaError::InventoryService(
                "Insufficient stock".to_string(),
            ));
        }

        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state
            .reservations
            .insert(reservation_id.clone(), (order_id.clone(), lines.to_vec()));

        Ok(reservation_id)
    }

    async fn release(
        &self,
        order_id: &BusinessKey,
        reservation_id: Option<&str>,
    ) -> Result<(), SagaError> {
        let mut state = self.state.write().unwrap();

        if state.fail_on_release {
            return Err(SagaError::InventoryService(
                "Release rejected".to_string(),
            ));
        }

        let ids: Vec<String> = match reservation_id {
            Some(id) => vec![id.to_string()],
            None => state
                .reservations
                .iter()
                .filter(|(_, (owner, _))| owner == order_id)
                .map(|(id, _)| id.clone())
                .collect(),
        };
        for id in ids {
            if state.reservations.remove(&id).is_some() {
                state.released.push(id);
            }
        }
        Ok(())
    }
}
