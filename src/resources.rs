//! Typed resource surface.
//!
//! Thin per-resource-family helpers over the dispatcher, mirroring the
//! endpoints the admin application consumes. Every call funnels through
//! `Dispatcher::request`, so each of these works offline with the same
//! cache/queue semantics; no feature talks to the network directly.

use serde_json::Value;
use std::sync::Arc;

use crate::dispatcher::{Dispatcher, Verb};
use crate::error::RequestError;

/// Statistics window selector for the dashboard tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsPeriod {
    Today,
    Week,
    Month,
    Year,
}

impl StatsPeriod {
    fn path(&self) -> &'static str {
        match self {
            Self::Today => "/api/statistics/today",
            Self::Week => "/api/statistics/week",
            Self::Month => "/api/statistics/month",
            Self::Year => "/api/statistics/year",
        }
    }
}

#[derive(Clone)]
pub struct Resources {
    dispatcher: Arc<Dispatcher>,
}

impl Resources {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    async fn read(&self, path: &str) -> Result<Value, RequestError> {
        self.dispatcher.request(path, Verb::Read, None, &[]).await
    }

    // -----------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------

    pub async fn transactions(&self) -> Result<Value, RequestError> {
        self.read("/api/transactions").await
    }

    pub async fn create_transaction(&self, data: Value) -> Result<Value, RequestError> {
        self.dispatcher
            .request("/api/transactions", Verb::Create, Some(data), &[])
            .await
    }

    pub async fn update_transaction(&self, id: &str, data: Value) -> Result<Value, RequestError> {
        self.dispatcher
            .request(&format!("/api/transactions/{id}"), Verb::Update, Some(data), &[])
            .await
    }

    pub async fn delete_transaction(&self, id: &str) -> Result<Value, RequestError> {
        self.dispatcher
            .request(&format!("/api/transactions/{id}"), Verb::Delete, None, &[])
            .await
    }

    // -----------------------------------------------------------------
    // Suppliers
    // -----------------------------------------------------------------

    pub async fn suppliers(&self) -> Result<Value, RequestError> {
        self.read("/api/suppliers").await
    }

    pub async fn create_supplier(&self, data: Value) -> Result<Value, RequestError> {
        self.dispatcher
            .request("/api/suppliers", Verb::Create, Some(data), &[])
            .await
    }

    pub async fn update_supplier(&self, id: &str, data: Value) -> Result<Value, RequestError> {
        self.dispatcher
            .request(&format!("/api/suppliers/{id}"), Verb::Update, Some(data), &[])
            .await
    }

    pub async fn delete_supplier(&self, id: &str) -> Result<Value, RequestError> {
        self.dispatcher
            .request(&format!("/api/suppliers/{id}"), Verb::Delete, None, &[])
            .await
    }

    pub async fn create_supplier_payment(&self, data: Value) -> Result<Value, RequestError> {
        self.dispatcher
            .request("/api/suppliers/payments", Verb::Create, Some(data), &[])
            .await
    }

    pub async fn supplier_expenditure_summary(&self) -> Result<Value, RequestError> {
        self.read("/api/suppliers/expenditure-summary").await
    }

    // -----------------------------------------------------------------
    // Expenditures
    // -----------------------------------------------------------------

    pub async fn expenditures(&self) -> Result<Value, RequestError> {
        self.read("/api/expenditures").await
    }

    pub async fn create_expenditure(&self, data: Value) -> Result<Value, RequestError> {
        self.dispatcher
            .request("/api/expenditures", Verb::Create, Some(data), &[])
            .await
    }

    pub async fn update_expenditure(&self, id: &str, data: Value) -> Result<Value, RequestError> {
        self.dispatcher
            .request(&format!("/api/expenditures/{id}"), Verb::Update, Some(data), &[])
            .await
    }

    pub async fn delete_expenditure(&self, id: &str) -> Result<Value, RequestError> {
        self.dispatcher
            .request(&format!("/api/expenditures/{id}"), Verb::Delete, None, &[])
            .await
    }

    // -----------------------------------------------------------------
    // Bills
    // -----------------------------------------------------------------

    pub async fn bills(&self) -> Result<Value, RequestError> {
        self.read("/api/bills").await
    }

    pub async fn create_bill(&self, data: Value) -> Result<Value, RequestError> {
        self.dispatcher
            .request("/api/bills", Verb::Create, Some(data), &[])
            .await
    }

    pub async fn update_bill(&self, id: &str, data: Value) -> Result<Value, RequestError> {
        self.dispatcher
            .request(&format!("/api/bills/{id}"), Verb::Update, Some(data), &[])
            .await
    }

    pub async fn delete_bill(&self, id: &str) -> Result<Value, RequestError> {
        self.dispatcher
            .request(&format!("/api/bills/{id}"), Verb::Delete, None, &[])
            .await
    }

    pub async fn send_bill_sms(&self, phone: &str, message: &str) -> Result<Value, RequestError> {
        self.dispatcher
            .request(
                "/api/sms/send",
                Verb::Create,
                Some(serde_json::json!({ "phone": phone, "message": message })),
                &[],
            )
            .await
    }

    // -----------------------------------------------------------------
    // Read-only surfaces
    // -----------------------------------------------------------------

    pub async fn inventory(&self) -> Result<Value, RequestError> {
        self.read("/api/inventory").await
    }

    pub async fn dashboard(&self) -> Result<Value, RequestError> {
        self.read("/api/dashboard").await
    }

    pub async fn reports(&self, date_range: Option<&str>) -> Result<Value, RequestError> {
        let query: Vec<(String, String)> = date_range
            .map(|range| vec![("dateRange".to_string(), range.to_string())])
            .unwrap_or_default();
        self.dispatcher
            .request("/api/reports", Verb::Read, None, &query)
            .await
    }

    pub async fn statistics(&self, period: StatsPeriod) -> Result<Value, RequestError> {
        self.read(period.path()).await
    }

    pub async fn search(&self, query: &str) -> Result<Value, RequestError> {
        self.dispatcher
            .request(
                "/api/search",
                Verb::Read,
                None,
                &[("q".to_string(), query.to_string())],
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_period_paths() {
        assert_eq!(StatsPeriod::Today.path(), "/api/statistics/today");
        assert_eq!(StatsPeriod::Year.path(), "/api/statistics/year");
    }
}
