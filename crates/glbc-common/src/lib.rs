pub mod hostname;
pub mod validation;

pub use hostname::{generate, BaseDomain, GeneratedHost, ObjectIdentity};
pub use validation::{
    validate_hostname, validate_ip_address, validate_rule_host, ValidationError, ValidationResult,
};
