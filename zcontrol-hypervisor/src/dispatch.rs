//! Parameter validation in front of a driver.
//!
//! [`Validated`] wraps any [`Lifecycle`] implementation. Every action checks
//! its `parameters` against `{family}/actions/{action}.json` and only calls
//! the wrapped driver when the document conforms. A rejected document never
//! reaches the driver, so no side effect happens.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{HypervisorError, Result};
use crate::schema::{SchemaRepository, ValidationContext};
use crate::session::SessionHandle;
use crate::traits::{Capabilities, Lifecycle};
use crate::types::{Action, EntityState, Family};

/// Check `parameters` for `action` of `family`.
///
/// Actions without a schema accept anything.
pub fn validate_parameters(
    schemas: &SchemaRepository,
    family: Family,
    action: Action,
    parameters: &Value,
) -> Result<()> {
    let ctx = ValidationContext::new(family, action);
    schemas
        .validate(&ctx, parameters)
        .map_err(|report| HypervisorError::InvalidParameters {
            family,
            action,
            report,
        })
}

/// A driver whose actions are gated by the parameter schemas.
pub struct Validated<D> {
    inner: D,
    schemas: Arc<SchemaRepository>,
}

impl<D: Lifecycle> Validated<D> {
    pub fn new(inner: D, schemas: Arc<SchemaRepository>) -> Self {
        Self { inner, schemas }
    }

    /// Validate constructor parameters against `{family}/actions/init.json`
    /// and build the driver from them.
    pub fn init<F>(schemas: Arc<SchemaRepository>, family: Family, parameters: &Value, make: F) -> Result<Self>
    where
        F: FnOnce(&Value) -> Result<D>,
    {
        validate_parameters(&schemas, family, Action::Init, parameters)?;
        let inner = make(parameters)?;
        Ok(Self::new(inner, schemas))
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    pub fn schemas(&self) -> &Arc<SchemaRepository> {
        &self.schemas
    }

    fn check(&self, action: Action, parameters: &Value) -> Result<()> {
        validate_parameters(&self.schemas, self.inner.family(), action, parameters)
    }
}

#[async_trait]
impl<D: Lifecycle> Lifecycle for Validated<D> {
    fn family(&self) -> Family {
        self.inner.family()
    }

    async fn capabilities(&self) -> Result<Capabilities> {
        self.inner.capabilities().await
    }

    async fn login(&self) -> Result<SessionHandle> {
        self.inner.login().await
    }

    async fn logoff(&self) -> Result<()> {
        self.inner.logoff().await
    }

    async fn start(&self, name: &str, cpu: u32, memory: u64, parameters: &Value) -> Result<()> {
        self.check(Action::Start, parameters)?;
        self.inner.start(name, cpu, memory, parameters).await
    }

    async fn stop(&self, name: &str, parameters: &Value) -> Result<()> {
        self.check(Action::Stop, parameters)?;
        self.inner.stop(name, parameters).await
    }

    async fn reboot(&self, name: &str, parameters: &Value) -> Result<()> {
        self.check(Action::Reboot, parameters)?;
        self.inner.reboot(name, parameters).await
    }

    async fn entity_state(&self, name: &str) -> Result<EntityState> {
        self.inner.entity_state(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::mock::CountingDriver;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn repository() -> Arc<SchemaRepository> {
        let mut docs = BTreeMap::new();
        docs.insert(
            "kvm/actions/start.json".to_string(),
            json!({
                "type": "object",
                "properties": { "mode": { "enum": ["disk", "network"] } },
                "required": ["mode"],
                "additionalProperties": false
            }),
        );
        docs.insert(
            "kvm/actions/init.json".to_string(),
            json!({ "type": "object", "properties": { "port": { "type": "integer" } } }),
        );
        Arc::new(SchemaRepository::from_documents(docs).unwrap())
    }

    #[tokio::test]
    async fn test_invalid_parameters_never_reach_driver() {
        let driver = Validated::new(CountingDriver::new(Family::Kvm), repository());

        let err = driver.start("vm1", 2, 1024, &json!({"mode": "cdrom"})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameters);
        assert!(!err.is_retryable());
        assert!(err.report().unwrap().mentions("mode"));
        assert_eq!(driver.inner().calls("start"), 0);

        driver.start("vm1", 2, 1024, &json!({"mode": "disk"})).await.unwrap();
        assert_eq!(driver.inner().calls("start"), 1);
    }

    #[tokio::test]
    async fn test_actions_without_schema_pass_through() {
        let driver = Validated::new(CountingDriver::new(Family::Kvm), repository());
        driver.stop("vm1", &json!({"anything": [1, 2]})).await.unwrap();
        driver.reboot("vm1", &json!(null)).await.unwrap();
        assert_eq!(driver.inner().calls("stop"), 1);
        assert_eq!(driver.inner().calls("reboot"), 1);
    }

    #[tokio::test]
    async fn test_driver_errors_propagate_unchanged() {
        let inner = CountingDriver::new(Family::Kvm).failing_with("stop", "domain not running");
        let driver = Validated::new(inner, repository());
        let err = driver.stop("vm1", &json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert!(err.to_string().contains("domain not running"));
    }

    #[test]
    fn test_init_validates_before_construction() {
        let mut built = false;
        let result = Validated::init(repository(), Family::Kvm, &json!({"port": "22"}), |_| {
            built = true;
            Ok(CountingDriver::new(Family::Kvm))
        });
        assert!(matches!(result, Err(HypervisorError::InvalidParameters { action: Action::Init, .. })));
        assert!(!built);

        let driver = Validated::init(repository(), Family::Kvm, &json!({"port": 22}), |_| {
            Ok(CountingDriver::new(Family::Kvm))
        })
        .unwrap();
        assert_eq!(driver.family(), Family::Kvm);
    }
}
