use crate::registry::HealthCheck;
use serde::{Deserialize, Serialize};

/// The check ID the registry uses for a node placed in maintenance mode.
const NODE_MAINTENANCE: &str = "_node_maintenance";

/// The check ID prefix the registry uses for a service in maintenance mode.
const SERVICE_MAINTENANCE_PREFIX: &str = "_service_maintenance:";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Passing,
    Warning,
    Critical,
    Maintenance,
    #[serde(other)]
    Unknown,
}

/// Computes the worst-case verdict across all of an instance's checks.
///
/// Maintenance dominates every other status, then critical, then warning. An
/// instance without checks is passing. A check reporting a status we don't
/// recognize makes the whole instance `Unknown`.
pub fn aggregated_status(checks: &[HealthCheck]) -> HealthStatus {
    let (mut warning, mut critical, mut maintenance) = (false, false, false);
    for check in checks {
        if check.check_id == NODE_MAINTENANCE
            || check.check_id.starts_with(SERVICE_MAINTENANCE_PREFIX)
        {
            maintenance = true;
            continue;
        }
        match check.status {
            HealthStatus::Passing => {}
            HealthStatus::Warning => warning = true,
            HealthStatus::Critical => critical = true,
            HealthStatus::Maintenance | HealthStatus::Unknown => return HealthStatus::Unknown,
        }
    }

    if maintenance {
        HealthStatus::Maintenance
    } else if critical {
        HealthStatus::Critical
    } else if warning {
        HealthStatus::Warning
    } else {
        HealthStatus::Passing
    }
}
