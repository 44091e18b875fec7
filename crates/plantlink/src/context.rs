//! Shared dependencies handed to every program at spawn time.

use crate::aggregator::AggregatorApi;
use crate::db::Store;
use crate::modbus::ModbusConnector;
use std::sync::Arc;

#[derive(Clone)]
pub struct Deps {
    pub store: Arc<dyn Store>,
    pub modbus: Arc<dyn ModbusConnector>,
    pub aggregator: Arc<dyn AggregatorApi>,
}

impl Deps {
    pub fn new(
        store: Arc<dyn Store>,
        modbus: Arc<dyn ModbusConnector>,
        aggregator: Arc<dyn AggregatorApi>,
    ) -> Self {
        Self {
            store,
            modbus,
            aggregator,
        }
    }
}
