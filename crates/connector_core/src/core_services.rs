//! Built-in module providing the health check capability.

use crate::config::{Config, ConfigError};
use crate::health::{
    HealthCheckService, HealthCheckServiceConfiguration, HealthCheckServiceImpl,
    HEALTH_CHECK_SERVICE,
};
use crate::monitor::{self, Monitor, MONITOR};
use crate::system::capability::CapabilityId;
use crate::system::context::ServiceExtensionContext;
use crate::system::extension::{ExtensionResult, ServiceExtension};
use crate::system::injection::InjectionPoint;
use crate::system::locator::{ManifestEntry, ManifestFactory, EXTENSION_MANIFEST};
use std::sync::Arc;
use std::time::Duration;

pub const LIVENESS_PERIOD_SETTING: &str = "edc.core.system.health.check.liveness-period";
pub const STARTUP_PERIOD_SETTING: &str = "edc.core.system.health.check.startup-period";
pub const READINESS_PERIOD_SETTING: &str = "edc.core.system.health.check.readiness-period";

const DEFAULT_PERIOD_SECONDS: u64 = 60;

#[linkme::distributed_slice(EXTENSION_MANIFEST)]
static CORE_SERVICES: ManifestEntry = ManifestEntry {
    name: "core-services",
    factory: ManifestFactory::Service(|| Box::new(CoreServicesExtension::default())),
};

#[derive(Default)]
pub struct CoreServicesExtension {
    monitor: Option<Arc<dyn Monitor>>,
    health_check: Option<Arc<HealthCheckServiceImpl>>,
}

impl CoreServicesExtension {
    pub const NAME: &'static str = "Core Services";

    fn health_check_configuration(
        config: &Config,
    ) -> ExtensionResult<HealthCheckServiceConfiguration> {
        let period = |key: &str| -> ExtensionResult<Duration> {
            let seconds = config.get_unsigned_or(key, DEFAULT_PERIOD_SECONDS)?;
            if seconds == 0 {
                return Err(ConfigError::Parse {
                    key: key.to_string(),
                    value: seconds.to_string(),
                    type_name: "positive integer",
                }
                .into());
            }
            Ok(Duration::from_secs(seconds))
        };
        Ok(HealthCheckServiceConfiguration {
            liveness_period: period(LIVENESS_PERIOD_SETTING)?,
            readiness_period: period(READINESS_PERIOD_SETTING)?,
            startup_status_period: period(STARTUP_PERIOD_SETTING)?,
        })
    }
}

impl ServiceExtension for CoreServicesExtension {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn provides(&self) -> Vec<CapabilityId> {
        vec![HEALTH_CHECK_SERVICE.capability()]
    }

    fn injection_points(&self) -> Vec<InjectionPoint> {
        vec![InjectionPoint::required(
            "monitor",
            MONITOR,
            |ext: &mut CoreServicesExtension, monitor| ext.monitor = Some(monitor),
        )]
    }

    fn initialize(&mut self, context: &mut ServiceExtensionContext) -> ExtensionResult {
        let configuration = Self::health_check_configuration(context.config())?;
        let service = Arc::new(HealthCheckServiceImpl::new(configuration));
        let shared: Arc<dyn HealthCheckService> = service.clone();
        context.register_service(HEALTH_CHECK_SERVICE, shared);
        self.health_check = Some(service);
        Ok(())
    }

    fn start(&mut self) -> ExtensionResult {
        if let Some(service) = &self.health_check {
            let monitor = self.monitor.clone().unwrap_or_else(monitor::instance);
            service.start(monitor)?;
        }
        Ok(())
    }

    fn shutdown(&mut self) -> ExtensionResult {
        if let Some(service) = &self.health_check {
            service.stop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CoreServicesExtension, LIVENESS_PERIOD_SETTING, READINESS_PERIOD_SETTING};
    use crate::config::{ConfigError, ConfigFactory};
    use crate::health::HEALTH_CHECK_SERVICE;
    use crate::monitor::LogMonitor;
    use crate::system::context::ServiceExtensionContext;
    use crate::system::injection::InjectionContainer;
    use crate::system::loader::{shutdown_extensions, ExtensionLoader, LifecycleLimits};
    use crate::system::locator::ManifestServiceLocator;
    use crate::types::TypeManager;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn reads_periods_with_defaults() {
        let config = ConfigFactory::from_map([
            (LIVENESS_PERIOD_SETTING, "5"),
            (READINESS_PERIOD_SETTING, "1"),
        ]);
        let periods = CoreServicesExtension::health_check_configuration(&config)
            .expect("valid periods");

        assert_eq!(periods.liveness_period, Duration::from_secs(5));
        assert_eq!(periods.readiness_period, Duration::from_secs(1));
        assert_eq!(periods.startup_status_period, Duration::from_secs(60));
    }

    #[test]
    fn zero_and_negative_periods_are_errors() {
        for value in ["0", "-5"] {
            let config = ConfigFactory::from_map([(READINESS_PERIOD_SETTING, value)]);
            let err = CoreServicesExtension::health_check_configuration(&config)
                .expect_err("period must be positive");
            let parse = err
                .downcast_ref::<ConfigError>()
                .expect("config error");
            assert!(
                matches!(parse, ConfigError::Parse { key, .. } if key == READINESS_PERIOD_SETTING),
                "unexpected error for {value}: {parse}"
            );
        }
    }

    #[test]
    fn rejects_non_numeric_period() {
        let config = ConfigFactory::from_map([(LIVENESS_PERIOD_SETTING, "soon")]);
        let err = CoreServicesExtension::health_check_configuration(&config)
            .expect_err("non-numeric period");
        assert!(err.to_string().contains(LIVENESS_PERIOD_SETTING));
    }

    #[test]
    fn provides_health_check_and_runs_worker_while_started() {
        let mut context = ServiceExtensionContext::new(
            Arc::new(TypeManager::new()),
            Arc::new(LogMonitor),
            Box::new(ManifestServiceLocator::with_entries(&[])),
        );
        let extensions = vec![InjectionContainer::new(Box::new(
            CoreServicesExtension::default(),
        ))];

        let mut booted = ExtensionLoader::new()
            .boot(&mut context, extensions)
            .expect("core services boot");

        let health = context
            .get_service(HEALTH_CHECK_SERVICE)
            .expect("health check registered");
        health.refresh();
        assert!(health.liveness().is_healthy());

        let failures = shutdown_extensions(&mut booted, &LogMonitor, LifecycleLimits::default());
        assert!(failures.is_empty());
    }
}
