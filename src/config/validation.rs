#![allow(clippy::collapsible_if)]

use std::{collections::HashMap, net::SocketAddr};

use regex::Regex;

use crate::config::models::{HubConfig, ModuleConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Hub configuration validator
pub struct HubConfigValidator;

impl HubConfigValidator {
    /// Validate the entire hub configuration
    pub fn validate(config: &HubConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.secret_path.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "secret_path".to_string(),
            });
        }

        if !config.registration_path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: "registration_path".to_string(),
                message: "Must start with '/'".to_string(),
            });
        }

        errors.extend(Self::validate_timings(config));

        let module_auth_enabled = config.modules.values().any(|m| m.auth.enabled);
        if (module_auth_enabled || config.auth.protect_admin)
            && config.auth.credentials_path.is_none()
        {
            errors.push(ValidationError::MissingField {
                field: "auth.credentials_path".to_string(),
            });
        }

        for (name, module) in &config.modules {
            if let Err(mut module_errors) = Self::validate_module(name, module) {
                errors.append(&mut module_errors);
            }
        }

        if let Err(conflicts) = Self::check_route_conflicts(&config.modules) {
            errors.extend(conflicts);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:2000' or '0.0.0.0:2000')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_timings(config: &HubConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let positive = [
            ("supervisor.interval_ms", config.supervisor.interval_ms),
            (
                "protocol.request_timeout_ms",
                config.protocol.request_timeout_ms,
            ),
            ("protocol.proxy_timeout_ms", config.protocol.proxy_timeout_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "Must be greater than 0".to_string(),
                });
            }
        }

        if config.protocol.port_range_start == 0
            || config.protocol.port_range_start > config.protocol.port_range_end
        {
            errors.push(ValidationError::InvalidField {
                field: "protocol.port_range_start".to_string(),
                message: format!(
                    "Port range {}..={} is empty",
                    config.protocol.port_range_start, config.protocol.port_range_end
                ),
            });
        }

        if !config.protocol.command_path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: "protocol.command_path".to_string(),
                message: "Must start with '/'".to_string(),
            });
        }

        errors
    }

    /// Validate a single module entry
    fn validate_module(name: &str, module: &ModuleConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let name_regex =
            Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("invalid module name regex");
        if !name_regex.is_match(name) {
            errors.push(ValidationError::InvalidField {
                field: format!("module '{name}'"),
                message: "Module names may only contain letters, digits, '_', '.' and '-'"
                    .to_string(),
            });
        }

        let protocol = module.binding.protocol.as_str();
        if protocol != "http" && protocol != "https" {
            errors.push(ValidationError::InvalidField {
                field: format!("module '{name}' binding.protocol"),
                message: format!("Protocol must be 'http' or 'https', got '{protocol}'"),
            });
        }

        if let Some(exe) = &module.exe {
            if exe.main.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("module '{name}' exe.main"),
                });
            }
        }

        for route in &module.binding.routes {
            if !route.from.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: format!("module '{name}' route '{}'", route.from),
                    message: "Route paths must start with '/'".to_string(),
                });
            }
            if !route.to.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: format!("module '{name}' route '{}' to", route.from),
                    message: "Backend paths must start with '/'".to_string(),
                });
            }
            for method in &route.methods {
                if method.parse::<http::Method>().is_err() {
                    errors.push(ValidationError::InvalidField {
                        field: format!("module '{name}' route '{}' methods", route.from),
                        message: format!("Invalid HTTP method '{method}'"),
                    });
                }
            }
        }

        if module.types.contains("bind") && module.binding.root.is_none() {
            tracing::warn!(
                "Module '{}' is typed 'bind' but declares no root file; it will be proxied instead",
                name
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Two modules may not claim the same (method, pattern) pair
    fn check_route_conflicts(
        modules: &HashMap<String, ModuleConfig>,
    ) -> Result<(), Vec<ValidationError>> {
        let mut seen: HashMap<(String, String), &str> = HashMap::new();
        let mut errors = Vec::new();

        let mut names: Vec<&String> = modules.keys().collect();
        names.sort();

        for name in names {
            for route in &modules[name].binding.routes {
                for method in &route.methods {
                    let key = (method.to_uppercase(), route.from.clone());
                    if let Some(owner) = seen.get(&key) {
                        if *owner != name.as_str() {
                            errors.push(ValidationError::RouteConflict {
                                message: format!(
                                    "{} {} is declared by both '{}' and '{}'",
                                    key.0, key.1, owner, name
                                ),
                            });
                        }
                    } else {
                        seen.insert(key, name.as_str());
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
