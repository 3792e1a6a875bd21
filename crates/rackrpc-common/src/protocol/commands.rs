//! Command names and the argument/result schemas the core relies on.
//!
//! Only `StartTLS` and `Identify` are interpreted by the link itself; every
//! other command is opaque and reaches a responder registered in the
//! [`CommandTable`](crate::CommandTable).

use serde::{Deserialize, Serialize};

pub const START_TLS: &str = "StartTLS";
pub const IDENTIFY: &str = "Identify";

pub const LIST_BOOT_IMAGES: &str = "ListBootImages";
pub const DESCRIBE_POWER_TYPES: &str = "DescribePowerTypes";
pub const LIST_SUPPORTED_ARCHITECTURES: &str = "ListSupportedArchitectures";
pub const LIST_OPERATING_SYSTEMS: &str = "ListOperatingSystems";
pub const VALIDATE_LICENSE_KEY: &str = "ValidateLicenseKey";
pub const GET_PRESEED_DATA: &str = "GetPreseedData";
pub const POWER_ON: &str = "PowerOn";
pub const POWER_OFF: &str = "PowerOff";
pub const CREATE_HOST_MAPS: &str = "CreateHostMaps";
pub const REMOVE_HOST_MAPS: &str = "RemoveHostMaps";

/// Commands a region may invoke on the cluster once the link is open.
pub const CLUSTER_COMMANDS: &[&str] = &[
    IDENTIFY,
    LIST_BOOT_IMAGES,
    DESCRIBE_POWER_TYPES,
    LIST_SUPPORTED_ARCHITECTURES,
    LIST_OPERATING_SYSTEMS,
    VALIDATE_LICENSE_KEY,
    GET_PRESEED_DATA,
    POWER_ON,
    POWER_OFF,
    CREATE_HOST_MAPS,
    REMOVE_HOST_MAPS,
];

/// Arguments of `StartTLS`: the initiator's certificate and the authorities it trusts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartTlsArgs {
    pub certificate: String,
    #[serde(default)]
    pub authorities: Vec<String>,
}

/// Result of `Identify`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifyResult {
    pub ident: String,
}
